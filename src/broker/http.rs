use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::broker::BrokerageCapability;
use crate::error::EngineError;
use crate::models::{OptionContract, OrderSide, OrderState, OrderStatus};
use crate::Result;

const EXCHANGE_CODE: &str = "NFO";

/// Broker REST envelope: exactly one of `Success` / `Error` is populated
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(rename = "Success")]
    success: Option<T>,
    #[serde(rename = "Error")]
    error: Option<String>,
}

impl<T> Envelope<T> {
    fn into_result(self, what: &str) -> Result<T> {
        match (self.success, self.error) {
            (Some(value), _) => Ok(value),
            (None, Some(err)) => Err(EngineError::Brokerage(format!("{}: {}", what, err))),
            (None, None) => Err(EngineError::Brokerage(format!("{}: empty response", what))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct QuoteRow {
    ltp: f64,
}

#[derive(Debug, Deserialize)]
struct OrderAck {
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct OrderDetail {
    status: String,
    #[serde(default)]
    average_price: Option<f64>,
}

#[derive(Debug, Serialize)]
struct OrderRequest<'a> {
    stock_code: &'a str,
    exchange_code: &'a str,
    product: &'a str,
    action: &'a str,
    order_type: &'a str,
    quantity: String,
    price: &'a str,
    validity: &'a str,
    expiry_date: String,
    right: &'a str,
    strike_price: String,
}

/// REST adapter for a Breeze-style options brokerage.
///
/// The session token is obtained out of band and passed in as a bearer token.
#[derive(Clone)]
pub struct HttpBrokerage {
    client: Client,
    base_url: String,
    session_token: String,
}

fn expiry_param(contract: &OptionContract) -> String {
    contract.expiry.format("%Y-%m-%dT06:00:00.000Z").to_string()
}

impl HttpBrokerage {
    pub fn new(base_url: &str, session_token: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            session_token: session_token.to_string(),
        }
    }

    fn order_request<'a>(
        contract: &'a OptionContract,
        action: &'a str,
        quantity: u32,
    ) -> OrderRequest<'a> {
        OrderRequest {
            stock_code: &contract.underlying,
            exchange_code: EXCHANGE_CODE,
            product: "options",
            action,
            order_type: "market",
            quantity: quantity.to_string(),
            price: "0",
            validity: "day",
            expiry_date: expiry_param(contract),
            right: contract.right.as_str(),
            strike_price: contract.strike.to_string(),
        }
    }

    async fn submit(&self, path: &str, body: &OrderRequest<'_>) -> Result<String> {
        let url = format!("{}/{}", self.base_url, path);
        let response: Envelope<OrderAck> = self
            .client
            .post(&url)
            .bearer_auth(&self.session_token)
            .json(body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(response.into_result(path)?.order_id)
    }
}

#[async_trait]
impl BrokerageCapability for HttpBrokerage {
    async fn get_quote(&self, contract: &OptionContract) -> Result<f64> {
        let url = format!("{}/quotes", self.base_url);
        let strike = contract.strike.to_string();
        let expiry = expiry_param(contract);

        let response: Envelope<Vec<QuoteRow>> = self
            .client
            .get(&url)
            .bearer_auth(&self.session_token)
            .query(&[
                ("stock_code", contract.underlying.as_str()),
                ("exchange_code", EXCHANGE_CODE),
                ("product_type", "options"),
                ("expiry_date", expiry.as_str()),
                ("right", contract.right.as_str()),
                ("strike_price", strike.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let rows = response.into_result("quotes")?;
        rows.first()
            .map(|row| row.ltp)
            .ok_or_else(|| EngineError::Brokerage(format!("no quote rows for {}", contract)))
    }

    async fn place_order(
        &self,
        contract: &OptionContract,
        side: OrderSide,
        quantity: u32,
    ) -> Result<String> {
        let body = Self::order_request(contract, side.as_str(), quantity);
        let order_id = self.submit("orders", &body).await?;
        tracing::info!("✅ Order placed: {} {} -> {}", side.as_str(), contract, order_id);
        Ok(order_id)
    }

    async fn square_off(&self, contract: &OptionContract, quantity: u32) -> Result<String> {
        let body = Self::order_request(contract, OrderSide::Sell.as_str(), quantity);
        let order_id = self.submit("squareoff", &body).await?;
        tracing::info!("✅ Square-off placed: {} -> {}", contract, order_id);
        Ok(order_id)
    }

    async fn get_order_status(&self, order_id: &str) -> Result<OrderStatus> {
        let url = format!("{}/orders/{}", self.base_url, order_id);
        let response: Envelope<Vec<OrderDetail>> = self
            .client
            .get(&url)
            .bearer_auth(&self.session_token)
            .query(&[("exchange_code", EXCHANGE_CODE)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let details = response.into_result("order detail")?;
        Ok(match details.first() {
            Some(detail) => OrderStatus {
                state: OrderState::from_broker(&detail.status),
                fill_price: detail.average_price.filter(|p| *p > 0.0),
            },
            None => OrderStatus::unknown(),
        })
    }

    fn name(&self) -> &str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OptionRight;
    use chrono::NaiveDate;
    use mockito::Matcher;

    fn contract() -> OptionContract {
        OptionContract {
            underlying: "NIFTY".to_string(),
            strike: 25800,
            right: OptionRight::Put,
            expiry: NaiveDate::from_ymd_opt(2025, 11, 13).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_get_quote() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/quotes")
            .match_header("authorization", "Bearer tok")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("strike_price".into(), "25800".into()),
                Matcher::UrlEncoded("right".into(), "put".into()),
                Matcher::UrlEncoded("expiry_date".into(), "2025-11-13T06:00:00.000Z".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"Success":[{"ltp":142.35}],"Error":null}"#)
            .create_async()
            .await;

        let broker = HttpBrokerage::new(&server.url(), "tok");
        let ltp = broker.get_quote(&contract()).await.unwrap();

        assert_eq!(ltp, 142.35);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_place_order_and_status() {
        let mut server = mockito::Server::new_async().await;
        let place = server
            .mock("POST", "/orders")
            .match_body(Matcher::PartialJsonString(
                r#"{"action":"buy","quantity":"75","order_type":"market"}"#.to_string(),
            ))
            .with_status(200)
            .with_body(r#"{"Success":{"order_id":"2025111100001"}}"#)
            .create_async()
            .await;
        let status = server
            .mock("GET", "/orders/2025111100001")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"Success":[{"status":"Executed","average_price":101.5}]}"#)
            .create_async()
            .await;

        let broker = HttpBrokerage::new(&server.url(), "tok");
        let order_id = broker
            .place_order(&contract(), OrderSide::Buy, 75)
            .await
            .unwrap();
        assert_eq!(order_id, "2025111100001");

        let detail = broker.get_order_status(&order_id).await.unwrap();
        assert_eq!(detail.state, OrderState::Executed);
        assert_eq!(detail.fill_price, Some(101.5));

        place.assert_async().await;
        status.assert_async().await;
    }

    #[tokio::test]
    async fn test_error_envelope_is_brokerage_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/squareoff")
            .with_status(200)
            .with_body(r#"{"Success":null,"Error":"Insufficient position"}"#)
            .create_async()
            .await;

        let broker = HttpBrokerage::new(&server.url(), "tok");
        let err = broker.square_off(&contract(), 75).await.unwrap_err();
        assert!(matches!(err, EngineError::Brokerage(_)));
        assert!(err.to_string().contains("Insufficient position"));
    }

    #[tokio::test]
    async fn test_http_failure_is_brokerage_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/quotes")
            .match_query(Matcher::Any)
            .with_status(503)
            .create_async()
            .await;

        let broker = HttpBrokerage::new(&server.url(), "tok");
        let err = broker.get_quote(&contract()).await.unwrap_err();
        assert!(matches!(err, EngineError::Brokerage(_)));
    }
}
