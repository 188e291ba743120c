//! Bridge API Client
//!
//! JSON-over-HTTP client for the broker/feature bridge. Implements every
//! collaborator trait so one instance can back the whole engine.
//!
//! Endpoints (relative to the bridge base URL):
//! - `GET  /v1/bars?timeframe=&count=`
//! - `POST /v1/indicators`
//! - `GET  /v1/price`
//! - `GET  /v1/orderbook/imbalance?levels=`, `/v1/orderbook/icebergs`, `/v1/orderbook/snapshot?levels=`
//! - `POST /v1/orders/bracket`
//! - `PATCH|PUT|DELETE /v1/orders/{id}/stop`
//! - `POST /v1/positions/{id}/close`
//! - `GET  /v1/account/balance`, `/v1/instrument`

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::{GatewayError, GatewayResult};
use crate::gateway::{AccountFeed, MarketData, OrderBookFeed, OrderGateway};
use crate::types::{
    Bar, BracketOrder, DepthSnapshot, Direction, IcebergLevel, IndicatorFrame, IndicatorSpec,
    TickMeta, Timeframe,
};

/// Client for the broker/feature bridge
pub struct BridgeClient {
    client: Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct IndicatorRequest<'a> {
    timeframe: Timeframe,
    count: usize,
    indicators: &'a [IndicatorSpec],
}

#[derive(Debug, Deserialize)]
struct PriceResponse {
    price: Decimal,
}

#[derive(Debug, Deserialize)]
struct ImbalanceResponse {
    depth_imbalance: f64,
}

#[derive(Debug, Deserialize)]
struct IcebergResponse {
    #[serde(default)]
    iceberg_levels: Vec<IcebergLevel>,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    order_id: String,
}

#[derive(Debug, Serialize)]
struct ModifyStopRequest {
    stop_price: Decimal,
}

#[derive(Debug, Serialize)]
struct PlaceStopRequest {
    direction: Direction,
    size: u32,
    stop_price: Decimal,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    balance: Decimal,
}

fn transport(call: &'static str) -> impl Fn(reqwest::Error) -> GatewayError {
    move |e| GatewayError::Unavailable(format!("{call} ({e})"))
}

/// Map a non-success status to `Rejected`
async fn check(call: &str, response: Response) -> GatewayResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    Err(GatewayError::Rejected(format!("{call}: {status} - {text}")))
}

async fn decode<T: DeserializeOwned>(call: &str, response: Response) -> GatewayResult<T> {
    let response = check(call, response).await?;
    response
        .json::<T>()
        .await
        .map_err(|e| GatewayError::InvalidResponse(format!("{call}: {e}")))
}

impl BridgeClient {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send_get(&self, call: &'static str, path: &str, query: &[(&str, String)]) -> GatewayResult<Response> {
        let url = self.url(path);
        debug!("GET {}", url);
        self.client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(transport(call))
    }

    async fn get<T: DeserializeOwned>(&self, call: &'static str, path: &str, query: &[(&str, String)]) -> GatewayResult<T> {
        let response = self.send_get(call, path, query).await?;
        decode(call, response).await
    }

    /// GET where 404 means the feed has nothing to offer right now
    async fn get_optional<T: DeserializeOwned>(&self, call: &'static str, path: &str, query: &[(&str, String)]) -> GatewayResult<T> {
        let response = self.send_get(call, path, query).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(GatewayError::Unavailable(call.to_string()));
        }
        decode(call, response).await
    }
}

#[async_trait]
impl MarketData for BridgeClient {
    async fn bars(&self, timeframe: Timeframe, count: usize) -> GatewayResult<Vec<Bar>> {
        let query = [("timeframe", timeframe.as_str().to_string()), ("count", count.to_string())];
        self.get("bars", "/v1/bars", &query).await
    }

    async fn indicator_frame(
        &self,
        timeframe: Timeframe,
        count: usize,
        indicators: &[IndicatorSpec],
    ) -> GatewayResult<IndicatorFrame> {
        let req = IndicatorRequest {
            timeframe,
            count,
            indicators,
        };
        let response = self
            .client
            .post(self.url("/v1/indicators"))
            .json(&req)
            .send()
            .await
            .map_err(transport("indicator_frame"))?;
        decode("indicator_frame", response).await
    }

    async fn current_price(&self) -> GatewayResult<Decimal> {
        let resp: PriceResponse = self.get_optional("current_price", "/v1/price", &[]).await?;
        Ok(resp.price)
    }
}

#[async_trait]
impl OrderBookFeed for BridgeClient {
    async fn depth_imbalance(&self, levels: u32) -> GatewayResult<f64> {
        let query = [("levels", levels.to_string())];
        let resp: ImbalanceResponse = self
            .get_optional("depth_imbalance", "/v1/orderbook/imbalance", &query)
            .await?;
        Ok(resp.depth_imbalance)
    }

    async fn detect_icebergs(&self) -> GatewayResult<Vec<IcebergLevel>> {
        let resp: IcebergResponse = self.get("detect_icebergs", "/v1/orderbook/icebergs", &[]).await?;
        Ok(resp.iceberg_levels)
    }

    async fn depth_snapshot(&self, levels: u32) -> GatewayResult<DepthSnapshot> {
        let query = [("levels", levels.to_string())];
        self.get("depth_snapshot", "/v1/orderbook/snapshot", &query).await
    }
}

#[async_trait]
impl OrderGateway for BridgeClient {
    async fn submit_bracket(&self, order: &BracketOrder) -> GatewayResult<String> {
        let response = self
            .client
            .post(self.url("/v1/orders/bracket"))
            .json(order)
            .send()
            .await
            .map_err(transport("submit_bracket"))?;
        let resp: OrderResponse = decode("submit_bracket", response).await?;
        Ok(resp.order_id)
    }

    async fn modify_stop(&self, order_id: &str, new_stop: Decimal) -> GatewayResult<()> {
        let response = self
            .client
            .patch(self.url(&format!("/v1/orders/{order_id}/stop")))
            .json(&ModifyStopRequest { stop_price: new_stop })
            .send()
            .await
            .map_err(transport("modify_stop"))?;
        check("modify_stop", response).await.map(|_| ())
    }

    async fn cancel_stop(&self, order_id: &str) -> GatewayResult<()> {
        let response = self
            .client
            .delete(self.url(&format!("/v1/orders/{order_id}/stop")))
            .send()
            .await
            .map_err(transport("cancel_stop"))?;
        check("cancel_stop", response).await.map(|_| ())
    }

    async fn place_stop(
        &self,
        order_id: &str,
        direction: Direction,
        size: u32,
        stop_price: Decimal,
    ) -> GatewayResult<()> {
        let req = PlaceStopRequest {
            direction,
            size,
            stop_price,
        };
        let response = self
            .client
            .put(self.url(&format!("/v1/orders/{order_id}/stop")))
            .json(&req)
            .send()
            .await
            .map_err(transport("place_stop"))?;
        check("place_stop", response).await.map(|_| ())
    }

    async fn close_position(&self, position_id: &str) -> GatewayResult<()> {
        let response = self
            .client
            .post(self.url(&format!("/v1/positions/{position_id}/close")))
            .send()
            .await
            .map_err(transport("close_position"))?;
        check("close_position", response).await.map(|_| ())
    }
}

#[async_trait]
impl AccountFeed for BridgeClient {
    async fn balance(&self) -> GatewayResult<Decimal> {
        let resp: BalanceResponse = self.get("balance", "/v1/account/balance", &[]).await?;
        Ok(resp.balance)
    }

    async fn tick_meta(&self) -> GatewayResult<TickMeta> {
        self.get("tick_meta", "/v1/instrument", &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> BridgeClient {
        BridgeClient::new(&server.uri(), Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_price_and_tick_meta_decode() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/price"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "price": "5000.25" })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/instrument"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "tick_size": "0.25", "tick_value": "12.50" })),
            )
            .mount(&server)
            .await;

        let c = client(&server);
        assert_eq!(c.current_price().await.unwrap(), dec!(5000.25));
        let meta = c.tick_meta().await.unwrap();
        assert_eq!(meta.tick_size, dec!(0.25));
        assert_eq!(meta.tick_value, dec!(12.50));
    }

    #[tokio::test]
    async fn test_missing_imbalance_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/orderbook/imbalance"))
            .and(query_param("levels", "5"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = client(&server).depth_imbalance(5).await.unwrap_err();
        assert!(matches!(err, GatewayError::Unavailable(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_price_error_mentioning_404_stays_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/price"))
            .respond_with(ResponseTemplate::new(500).set_body_string("upstream 404 from feed"))
            .mount(&server)
            .await;

        let err = client(&server).current_price().await.unwrap_err();
        match err {
            GatewayError::Rejected(msg) => assert!(msg.contains("500")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bracket_submission_and_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/orders/bracket"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "order_id": "ord-42" })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/orders/bracket"))
            .respond_with(ResponseTemplate::new(422).set_body_string("margin"))
            .mount(&server)
            .await;

        let c = client(&server);
        let order = BracketOrder {
            client_order_id: uuid::Uuid::new_v4(),
            direction: Direction::Long,
            size: 2,
            entry_price: dec!(5000),
            stop_price: dec!(4995),
            target_price: dec!(5010),
        };
        assert_eq!(c.submit_bracket(&order).await.unwrap(), "ord-42");

        let err = c.submit_bracket(&order).await.unwrap_err();
        match err {
            GatewayError::Rejected(msg) => assert!(msg.contains("422") && msg.contains("margin")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_modify_stop_sends_price() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/v1/orders/ord-1/stop"))
            .and(body_json(json!({ "stop_price": "5001.25" })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        client(&server).modify_stop("ord-1", dec!(5001.25)).await.unwrap();
    }

    #[tokio::test]
    async fn test_garbage_body_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/account/balance"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = client(&server).balance().await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidResponse(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_unreachable_bridge_is_unavailable() {
        let c = BridgeClient::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        let err = c.close_position("p1").await.unwrap_err();
        assert!(matches!(err, GatewayError::Unavailable(_)), "{err:?}");
    }
}
