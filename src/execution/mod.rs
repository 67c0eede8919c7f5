// Trade lifecycle and the control loop that drives it
pub mod control_loop;
pub mod status;
pub mod trade_manager;

pub use control_loop::{ControlLoop, ShutdownHandle, TickReport};
pub use status::{build_status, LevelStatus, StatusReport};
pub use trade_manager::{TradeLifecycleManager, TradeSettings};
