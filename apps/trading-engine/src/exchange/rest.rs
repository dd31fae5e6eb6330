//! Signed REST client for the venue.
//!
//! Every call carries a request-level deadline. Responses are classified
//! into [`ExchangeError`] kinds: 429 → rate limited, 5xx/network →
//! transient, auth/signature failures → fatal, other 4xx → definitive
//! rejection. A timeout on a mutation returns
//! [`ExchangeError::Timeout`] and the caller resolves the outcome through
//! reconciliation.

use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::mpsc;

use super::signing::RequestSigner;
use super::user_stream::{UserStreamConfig, UserStreamTask};
use super::{
    ExchangeAccountSnapshot, ExchangeBalance, ExchangeError, ExchangeOrderStatus,
    ExchangePosition, ExchangePort, OrderAck, PlaceOrderRequest, UserStreamEvent,
};
use crate::domain::order::{OrderSide, OrderState, OrderType, TimeInForce};

/// REST client configuration.
#[derive(Debug, Clone)]
pub struct RestExchangeConfig {
    /// REST base URL.
    pub base_url: String,
    /// User-data WebSocket base URL.
    pub ws_url: String,
    /// API key.
    pub api_key: String,
    /// API secret.
    pub api_secret: String,
    /// Per-request deadline.
    pub request_timeout: Duration,
    /// Listen-key refresh interval.
    pub listen_key_refresh: Duration,
}

impl RestExchangeConfig {
    fn signer(&self) -> RequestSigner {
        RequestSigner::new(self.api_key.clone(), self.api_secret.clone())
    }
}

/// Signed REST adapter implementing [`ExchangePort`].
pub struct RestExchangeClient {
    http: reqwest::Client,
    config: RestExchangeConfig,
    signer: RequestSigner,
}

impl RestExchangeClient {
    /// Create a client. Connection pooling is handled by `reqwest`.
    pub fn new(config: RestExchangeConfig) -> Result<Self, ExchangeError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ExchangeError::Protocol(e.to_string()))?;
        Ok(Self {
            signer: config.signer(),
            http,
            config,
        })
    }

    fn signed_url(&self, path: &str, params: &[(&str, String)]) -> String {
        let (query, signature) = self
            .signer
            .signed_query(params, Utc::now().timestamp_millis());
        format!(
            "{}{path}?{query}&signature={signature}",
            self.config.base_url
        )
    }

    async fn execute(
        &self,
        operation: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, ExchangeError> {
        let response = request
            .header("X-API-KEY", self.signer.api_key())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExchangeError::Timeout {
                        operation: operation.to_string(),
                    }
                } else {
                    ExchangeError::Transient(e.to_string())
                }
            })?;
        classify_status(response).await
    }
}

/// Map an HTTP response to the error taxonomy, passing successes through.
async fn classify_status(response: reqwest::Response) -> Result<reqwest::Response, ExchangeError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let code = status.as_u16();
    let body: VenueError = response.json().await.unwrap_or_default();

    match code {
        429 => Err(ExchangeError::RateLimited),
        401 | 403 => Err(ExchangeError::Auth(body.msg)),
        400..=499 => {
            // Signature and timestamp errors surface as 400s on most venues.
            if body.code == -1022 || body.code == -1021 {
                Err(ExchangeError::Auth(body.msg))
            } else {
                Err(ExchangeError::Rejected {
                    code: body.code,
                    message: body.msg,
                })
            }
        }
        _ => Err(ExchangeError::Transient(format!(
            "http {code}: {}",
            body.msg
        ))),
    }
}

#[derive(Debug, Deserialize)]
struct VenueError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
}

impl Default for VenueError {
    fn default() -> Self {
        Self {
            code: 0,
            msg: "unparseable error body".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VenueOrder {
    order_id: i64,
    client_order_id: String,
    symbol: String,
    status: String,
    #[serde(default)]
    executed_qty: Decimal,
    #[serde(default)]
    avg_price: Decimal,
}

impl VenueOrder {
    fn into_status(self) -> Result<ExchangeOrderStatus, ExchangeError> {
        Ok(ExchangeOrderStatus {
            exchange_order_id: self.order_id.to_string(),
            client_order_id: self.client_order_id,
            symbol: self.symbol,
            state: parse_order_state(&self.status)?,
            filled_quantity: self.executed_qty,
            avg_price: self.avg_price,
        })
    }
}

fn parse_order_state(status: &str) -> Result<OrderState, ExchangeError> {
    match status {
        "NEW" => Ok(OrderState::Submitted),
        "PARTIALLY_FILLED" => Ok(OrderState::PartiallyFilled),
        "FILLED" => Ok(OrderState::Filled),
        "CANCELED" | "PENDING_CANCEL" => Ok(OrderState::Canceled),
        "REJECTED" => Ok(OrderState::Rejected),
        "EXPIRED" | "EXPIRED_IN_MATCH" => Ok(OrderState::Expired),
        other => Err(ExchangeError::Protocol(format!(
            "unknown order status {other}"
        ))),
    }
}

const fn side_param(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "BUY",
        OrderSide::Sell => "SELL",
    }
}

const fn type_param(order_type: OrderType) -> &'static str {
    match order_type {
        OrderType::Market => "MARKET",
        OrderType::Limit => "LIMIT",
        OrderType::StopMarket => "STOP_MARKET",
        OrderType::StopLimit => "STOP_LIMIT",
        OrderType::PostOnly => "LIMIT_MAKER",
    }
}

const fn tif_param(tif: TimeInForce) -> &'static str {
    match tif {
        TimeInForce::Gtc => "GTC",
        TimeInForce::Ioc => "IOC",
        TimeInForce::Fok => "FOK",
        TimeInForce::Gtx => "GTX",
    }
}

#[async_trait::async_trait]
impl ExchangePort for RestExchangeClient {
    async fn place_order(&self, request: &PlaceOrderRequest) -> Result<OrderAck, ExchangeError> {
        let mut params = vec![
            ("symbol", request.symbol.clone()),
            ("side", side_param(request.side).to_string()),
            ("type", type_param(request.order_type).to_string()),
            ("timeInForce", tif_param(request.time_in_force).to_string()),
            ("quantity", request.quantity.to_string()),
            ("newClientOrderId", request.client_order_id.clone()),
        ];
        if let Some(price) = request.price {
            params.push(("price", price.to_string()));
        }
        if let Some(stop) = request.stop_price {
            params.push(("stopPrice", stop.to_string()));
        }
        if request.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }

        let url = self.signed_url("/api/v3/order", &params);
        let response = self.execute("order.place", self.http.post(&url)).await?;
        let order: VenueOrder = response
            .json()
            .await
            .map_err(|e| ExchangeError::Protocol(e.to_string()))?;

        Ok(OrderAck {
            exchange_order_id: order.order_id.to_string(),
            client_order_id: order.client_order_id,
        })
    }

    async fn cancel_order(
        &self,
        symbol: &str,
        exchange_order_id: &str,
    ) -> Result<(), ExchangeError> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("orderId", exchange_order_id.to_string()),
        ];
        let url = self.signed_url("/api/v3/order", &params);
        self.execute("order.cancel", self.http.delete(&url)).await?;
        Ok(())
    }

    async fn get_account(&self) -> Result<ExchangeAccountSnapshot, ExchangeError> {
        let url = self.signed_url("/api/v3/account", &[]);
        let response = self.execute("account.get", self.http.get(&url)).await?;

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct VenueAccount {
            balances: Vec<VenueBalance>,
            #[serde(default)]
            positions: Vec<VenuePosition>,
        }
        #[derive(Deserialize)]
        struct VenueBalance {
            asset: String,
            free: Decimal,
            locked: Decimal,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct VenuePosition {
            symbol: String,
            position_amt: Decimal,
            entry_price: Decimal,
        }

        let account: VenueAccount = response
            .json()
            .await
            .map_err(|e| ExchangeError::Protocol(e.to_string()))?;

        Ok(ExchangeAccountSnapshot {
            balances: account
                .balances
                .into_iter()
                .map(|b| ExchangeBalance {
                    asset: b.asset,
                    free: b.free,
                    locked: b.locked,
                })
                .collect(),
            positions: account
                .positions
                .into_iter()
                .map(|p| ExchangePosition {
                    symbol: p.symbol,
                    quantity: p.position_amt,
                    entry_price: p.entry_price,
                })
                .collect(),
            timestamp: Utc::now(),
        })
    }

    async fn get_open_orders(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<ExchangeOrderStatus>, ExchangeError> {
        let params: Vec<(&str, String)> = symbol
            .map(|s| vec![("symbol", s.to_string())])
            .unwrap_or_default();
        let url = self.signed_url("/api/v3/openOrders", &params);
        let response = self.execute("orders.open", self.http.get(&url)).await?;

        let orders: Vec<VenueOrder> = response
            .json()
            .await
            .map_err(|e| ExchangeError::Protocol(e.to_string()))?;
        orders.into_iter().map(VenueOrder::into_status).collect()
    }

    async fn query_order(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> Result<Option<ExchangeOrderStatus>, ExchangeError> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("origClientOrderId", client_order_id.to_string()),
        ];
        let url = self.signed_url("/api/v3/order", &params);

        match self.execute("order.query", self.http.get(&url)).await {
            Ok(response) => {
                let order: VenueOrder = response
                    .json()
                    .await
                    .map_err(|e| ExchangeError::Protocol(e.to_string()))?;
                Ok(Some(order.into_status()?))
            }
            // -2013: order does not exist.
            Err(ExchangeError::Rejected { code: -2013, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn subscribe_user_stream(
        &self,
    ) -> Result<mpsc::Receiver<UserStreamEvent>, ExchangeError> {
        // Obtain a listen key over REST, then hand the socket lifecycle to
        // the stream task (reconnect, refresh, ping).
        let url = format!("{}/api/v3/userDataStream", self.config.base_url);
        let response = self
            .execute("stream.listen_key", self.http.post(&url))
            .await?;

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ListenKey {
            listen_key: String,
        }
        let key: ListenKey = response
            .json()
            .await
            .map_err(|e| ExchangeError::Protocol(e.to_string()))?;

        let (tx, rx) = mpsc::channel(1024);
        let task = UserStreamTask::new(
            UserStreamConfig {
                ws_url: self.config.ws_url.clone(),
                rest_url: self.config.base_url.clone(),
                api_key: self.signer.api_key().to_string(),
                listen_key_refresh: self.config.listen_key_refresh,
            },
            key.listen_key,
            tx,
        );
        tokio::spawn(task.run());
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;
    use wiremock::matchers::{method, path, query_param_contains};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn client_for(server: &MockServer) -> RestExchangeClient {
        RestExchangeClient::new(RestExchangeConfig {
            base_url: server.uri(),
            ws_url: "ws://unused".to_string(),
            api_key: "key".to_string(),
            api_secret: "secret".to_string(),
            request_timeout: Duration::from_millis(500),
            listen_key_refresh: Duration::from_secs(1800),
        })
        .unwrap()
    }

    fn place_request() -> PlaceOrderRequest {
        PlaceOrderRequest {
            client_order_id: "c1".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            time_in_force: TimeInForce::Gtc,
            quantity: dec!(0.001),
            price: Some(dec!(45000)),
            stop_price: None,
            reduce_only: false,
        }
    }

    #[tokio::test]
    async fn place_order_parses_ack() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v3/order"))
            .and(query_param_contains("signature", ""))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "orderId": 12345,
                "clientOrderId": "c1",
                "symbol": "BTCUSDT",
                "status": "NEW"
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let ack = client.place_order(&place_request()).await.unwrap();
        assert_eq!(ack.exchange_order_id, "12345");
        assert_eq!(ack.client_order_id, "c1");
    }

    #[tokio::test]
    async fn rejection_carries_venue_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v3/order"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "code": -2010,
                "msg": "Account has insufficient balance"
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client.place_order(&place_request()).await.unwrap_err();
        assert!(matches!(
            err,
            ExchangeError::Rejected { code: -2010, .. }
        ));
    }

    #[tokio::test]
    async fn http_429_is_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v3/order"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client.place_order(&place_request()).await.unwrap_err();
        assert!(matches!(err, ExchangeError::RateLimited));
    }

    #[tokio::test]
    async fn http_5xx_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v3/order"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client.place_order(&place_request()).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Transient(_)));
    }

    #[tokio::test]
    async fn signature_error_is_fatal_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v3/order"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "code": -1022,
                "msg": "Signature for this request is not valid"
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client.place_order(&place_request()).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Auth(_)));
    }

    #[tokio::test]
    async fn slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v3/order"))
            .respond_with(
                ResponseTemplate::new(200).set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client.place_order(&place_request()).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Timeout { .. }));
    }

    #[tokio::test]
    async fn unknown_order_query_returns_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/order"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "code": -2013,
                "msg": "Order does not exist"
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let found = client.query_order("BTCUSDT", "missing").await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn open_orders_map_venue_states() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/openOrders"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {
                    "orderId": 1,
                    "clientOrderId": "c1",
                    "symbol": "BTCUSDT",
                    "status": "PARTIALLY_FILLED",
                    "executedQty": "0.5",
                    "avgPrice": "45000"
                }
            ])))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let orders = client.get_open_orders(Some("BTCUSDT")).await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].state, OrderState::PartiallyFilled);
        assert_eq!(orders[0].filled_quantity, dec!(0.5));
    }
}
