//! Order-book client
//!
//! REST calls for order management and a WebSocket push feed of order
//! updates. The engine consumes the `OrderbookApi` trait; the order book
//! itself owns all order state and matching.

use crate::error::{SettlerError, SettlerResult};
use crate::types::{Order, OrderStatus};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// Filter for order listing
#[derive(Debug, Clone, Default, Serialize)]
pub struct OrderFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maker: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taker: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<OrderStatus>,
}

/// One message from the push feed
#[derive(Debug, Clone)]
pub enum FeedEvent {
    UpdatedOrders(Vec<Order>),
    Error(String),
}

/// Order-book collaborator consumed by the engine
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderbookApi: Send + Sync {
    async fn login(&self) -> SettlerResult<String>;
    fn set_auth(&self, token: String);
    async fn get_order(&self, id: u64) -> SettlerResult<Order>;
    async fn get_orders(&self, filter: &OrderFilter) -> SettlerResult<Vec<Order>>;
    async fn create_order(
        &self,
        from_address: &str,
        to_address: &str,
        pair: &str,
        send_amount: &str,
        receive_amount: &str,
        secret_hash: &str,
    ) -> SettlerResult<u64>;
    async fn fill_order(&self, id: u64, from_address: &str, to_address: &str)
        -> SettlerResult<()>;
    /// Open the push feed filtered by this signer address
    async fn subscribe(&self, address: &str) -> SettlerResult<OrderFeed>;
}

/// Live order feed. Wraps either a WebSocket connection or, in tests, a
/// plain channel.
pub struct OrderFeed {
    inner: FeedInner,
}

enum FeedInner {
    Ws(WebSocketStream<MaybeTlsStream<TcpStream>>),
    Channel(mpsc::Receiver<FeedEvent>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum FeedMessage {
    UpdatedOrders { orders: Vec<Order> },
    Error { message: String },
}

impl OrderFeed {
    /// Feed backed by a channel, for tests and local drivers
    pub fn from_channel(rx: mpsc::Receiver<FeedEvent>) -> Self {
        Self {
            inner: FeedInner::Channel(rx),
        }
    }

    fn from_ws(ws: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Self {
        Self {
            inner: FeedInner::Ws(ws),
        }
    }

    /// Next feed event; None once the feed is closed
    pub async fn next(&mut self) -> Option<FeedEvent> {
        match &mut self.inner {
            FeedInner::Channel(rx) => rx.recv().await,
            FeedInner::Ws(ws) => loop {
                match ws.next().await? {
                    Ok(Message::Text(text)) => match serde_json::from_str::<FeedMessage>(&text) {
                        Ok(FeedMessage::UpdatedOrders { orders }) => {
                            return Some(FeedEvent::UpdatedOrders(orders))
                        }
                        Ok(FeedMessage::Error { message }) => {
                            return Some(FeedEvent::Error(message))
                        }
                        Err(e) => {
                            return Some(FeedEvent::Error(format!("malformed feed message: {e}")))
                        }
                    },
                    Ok(Message::Ping(payload)) => {
                        if ws.send(Message::Pong(payload)).await.is_err() {
                            return None;
                        }
                    }
                    Ok(Message::Close(_)) => return None,
                    Ok(_) => continue,
                    Err(e) => return Some(FeedEvent::Error(e.to_string())),
                }
            },
        }
    }
}

/// REST + WebSocket order-book client
pub struct HttpOrderbook {
    http: reqwest::Client,
    base_url: String,
    ws_url: String,
    token: RwLock<Option<String>>,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Debug, Serialize)]
struct CreateOrderRequest<'a> {
    from_address: &'a str,
    to_address: &'a str,
    order_pair: &'a str,
    send_amount: &'a str,
    receive_amount: &'a str,
    secret_hash: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateOrderResponse {
    id: u64,
}

#[derive(Debug, Serialize)]
struct FillOrderRequest<'a> {
    from_address: &'a str,
    to_address: &'a str,
}

impl HttpOrderbook {
    pub fn new(base_url: &str, ws_url: &str, request_timeout: Duration) -> SettlerResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| SettlerError::Orderbook(format!("http client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            ws_url: ws_url.to_string(),
            token: RwLock::new(None),
        })
    }

    fn auth_header(&self) -> Option<String> {
        self.token.read().expect("token lock").clone()
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.auth_header() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn check(response: reqwest::Response) -> SettlerResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(SettlerError::Orderbook(format!("{status}: {body}")))
    }
}

#[async_trait]
impl OrderbookApi for HttpOrderbook {
    async fn login(&self) -> SettlerResult<String> {
        let response = self
            .http
            .post(format!("{}/login", self.base_url))
            .send()
            .await
            .map_err(|e| SettlerError::Orderbook(e.to_string()))?;
        let login: LoginResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| SettlerError::Orderbook(format!("login response: {e}")))?;
        Ok(login.token)
    }

    fn set_auth(&self, token: String) {
        *self.token.write().expect("token lock") = Some(token);
    }

    async fn get_order(&self, id: u64) -> SettlerResult<Order> {
        let response = self
            .request(self.http.get(format!("{}/orders/{id}", self.base_url)))
            .send()
            .await
            .map_err(|e| SettlerError::Orderbook(e.to_string()))?;
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| SettlerError::Orderbook(format!("order {id}: {e}")))
    }

    async fn get_orders(&self, filter: &OrderFilter) -> SettlerResult<Vec<Order>> {
        let response = self
            .request(self.http.get(format!("{}/orders", self.base_url)))
            .query(filter)
            .send()
            .await
            .map_err(|e| SettlerError::Orderbook(e.to_string()))?;
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| SettlerError::Orderbook(format!("order list: {e}")))
    }

    async fn create_order(
        &self,
        from_address: &str,
        to_address: &str,
        pair: &str,
        send_amount: &str,
        receive_amount: &str,
        secret_hash: &str,
    ) -> SettlerResult<u64> {
        let request = CreateOrderRequest {
            from_address,
            to_address,
            order_pair: pair,
            send_amount,
            receive_amount,
            secret_hash,
        };
        let response = self
            .request(self.http.post(format!("{}/orders", self.base_url)))
            .json(&request)
            .send()
            .await
            .map_err(|e| SettlerError::Orderbook(e.to_string()))?;
        let created: CreateOrderResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| SettlerError::Orderbook(format!("create order: {e}")))?;
        debug!(order_id = created.id, secret_hash, "order created");
        Ok(created.id)
    }

    async fn fill_order(
        &self,
        id: u64,
        from_address: &str,
        to_address: &str,
    ) -> SettlerResult<()> {
        let request = FillOrderRequest {
            from_address,
            to_address,
        };
        let response = self
            .request(self.http.post(format!("{}/orders/{id}/fill", self.base_url)))
            .json(&request)
            .send()
            .await
            .map_err(|e| SettlerError::Orderbook(e.to_string()))?;
        Self::check(response).await?;
        debug!(order_id = id, "order filled");
        Ok(())
    }

    async fn subscribe(&self, address: &str) -> SettlerResult<OrderFeed> {
        let (mut ws, _) = connect_async(&self.ws_url)
            .await
            .map_err(|e| SettlerError::Orderbook(format!("feed connect: {e}")))?;

        let subscribe = serde_json::json!({
            "type": "subscribe",
            "address": address,
        });
        if let Some(token) = self.auth_header() {
            ws.send(Message::Text(
                serde_json::json!({"type": "auth", "token": token}).to_string(),
            ))
            .await
            .map_err(|e| SettlerError::Orderbook(format!("feed auth: {e}")))?;
        } else {
            warn!("subscribing to order feed without auth token");
        }
        ws.send(Message::Text(subscribe.to_string()))
            .await
            .map_err(|e| SettlerError::Orderbook(format!("feed subscribe: {e}")))?;

        Ok(OrderFeed::from_ws(ws))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AtomicSwap, Chain, LegStatus};

    fn order(id: u64) -> Order {
        let leg = AtomicSwap {
            chain: Chain::BitcoinRegtest,
            asset: "primary".into(),
            amount: "1000".into(),
            timelock: 144,
            initiator_address: "addr-a".into(),
            redeemer_address: "addr-b".into(),
            secret_hash: "aa".into(),
            secret: String::new(),
            status: LegStatus::Unknown,
            initiate_tx_hash: String::new(),
            redeem_tx_hash: String::new(),
            refund_tx_hash: String::new(),
        };
        Order {
            id,
            secret_hash: "aa".into(),
            order_pair: "bitcoin_regtest-ethereum".into(),
            maker: "addr-a".into(),
            taker: "addr-b".into(),
            status: OrderStatus::Filled,
            initiator_leg: leg.clone(),
            follower_leg: leg,
        }
    }

    #[tokio::test]
    async fn channel_feed_delivers_in_order() {
        let (tx, rx) = mpsc::channel(4);
        let mut feed = OrderFeed::from_channel(rx);

        tx.send(FeedEvent::UpdatedOrders(vec![order(1), order(2)]))
            .await
            .unwrap();
        tx.send(FeedEvent::Error("flap".into())).await.unwrap();
        drop(tx);

        match feed.next().await {
            Some(FeedEvent::UpdatedOrders(orders)) => {
                assert_eq!(orders.len(), 2);
                assert_eq!(orders[0].id, 1);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(feed.next().await, Some(FeedEvent::Error(_))));
        assert!(feed.next().await.is_none());
    }

    #[test]
    fn feed_message_parses_tagged_json() {
        let text = serde_json::json!({
            "type": "updated_orders",
            "orders": [order(7)],
        })
        .to_string();
        match serde_json::from_str::<FeedMessage>(&text).unwrap() {
            FeedMessage::UpdatedOrders { orders } => assert_eq!(orders[0].id, 7),
            other => panic!("unexpected message: {other:?}"),
        }

        let err = serde_json::json!({"type": "error", "message": "auth expired"}).to_string();
        assert!(matches!(
            serde_json::from_str::<FeedMessage>(&err).unwrap(),
            FeedMessage::Error { .. }
        ));
    }
}
