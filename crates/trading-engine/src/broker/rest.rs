//! Generic REST brokerage adapter.
//!
//! Endpoints (relative to `base_url`):
//! - `POST /v1/orders` with the client order id
//! - `GET /v1/orders/{client_order_id}`
//! - `DELETE /v1/orders/{client_order_id}`
//! - `GET /v1/positions/{symbol}`
//! - `GET /v1/account`

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use signal_core::types::{
    BrokerOrderId, BrokerOrderState, BrokerOrderStatus, BrokerVenue, CancelOutcome, Order,
    OrderSide, OrderType, Position,
};
use signal_core::{BrokerError, Error, Result};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use super::BrokerApi;

#[derive(Debug, Serialize)]
struct PlaceOrderRequest<'a> {
    client_order_id: Uuid,
    symbol: &'a str,
    side: OrderSide,
    quantity: Decimal,
    #[serde(rename = "type")]
    order_type: OrderType,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit_price: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct PlaceOrderResponse {
    broker_order_id: String,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    available_capital: Decimal,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

pub struct RestBroker {
    id: String,
    base_url: Url,
    api_key: String,
    http_client: reqwest::Client,
}

impl RestBroker {
    pub fn new(id: &str, base_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| Error::config(format!("broker '{}' base_url: {}", id, e)))?;
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(5)))
            .build()
            .map_err(|e| Error::config(format!("broker '{}' http client: {}", id, e)))?;

        Ok(Self {
            id: id.to_string(),
            base_url,
            api_key: api_key.to_string(),
            http_client,
        })
    }

    fn url(&self, path: &str) -> std::result::Result<Url, BrokerError> {
        self.base_url
            .join(path)
            .map_err(|e| BrokerError::rejected(format!("invalid request path {}: {}", path, e)))
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        let builder = self.http_client.request(method, url);
        if self.api_key.is_empty() {
            builder
        } else {
            builder.bearer_auth(&self.api_key)
        }
    }

    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> std::result::Result<reqwest::Response, BrokerError> {
        builder.send().await.map_err(|e| self.map_transport(e))
    }

    fn map_transport(&self, e: reqwest::Error) -> BrokerError {
        if e.is_timeout() {
            BrokerError::timeout(format!("{}: {}", self.id, e))
        } else if e.is_connect() {
            BrokerError::unavailable(format!("{}: {}", self.id, e))
        } else {
            BrokerError::unknown(format!("{}: {}", self.id, e))
        }
    }

    /// Map a non-success response onto the broker error taxonomy.
    async fn map_status(&self, response: reqwest::Response) -> BrokerError {
        let status = response.status();
        let message = match response.json::<ErrorBody>().await {
            Ok(body) if !body.message.is_empty() => body.message,
            _ => status.to_string(),
        };

        if status.as_u16() == 429 {
            warn!(broker = %self.id, "Broker rate limited request");
            BrokerError::rate_limited(message)
        } else if status.is_server_error() {
            BrokerError::unavailable(format!("{}: {}", status, message))
        } else if status.is_client_error() {
            BrokerError::rejected(message)
        } else {
            BrokerError::unknown(format!("unexpected status {}", status))
        }
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> std::result::Result<T, BrokerError> {
        response
            .json::<T>()
            .await
            .map_err(|e| BrokerError::unknown(format!("{}: malformed response: {}", self.id, e)))
    }
}

#[async_trait]
impl BrokerApi for RestBroker {
    fn id(&self) -> &str {
        &self.id
    }

    fn venue(&self) -> BrokerVenue {
        BrokerVenue::Live
    }

    async fn place_order(&self, order: &Order) -> std::result::Result<BrokerOrderId, BrokerError> {
        let body = PlaceOrderRequest {
            client_order_id: order.id,
            symbol: &order.symbol,
            side: order.side,
            quantity: order.quantity,
            order_type: order.order_type,
            limit_price: order.limit_price,
        };

        let url = self.url("v1/orders")?;
        let response = self
            .send(self.request(reqwest::Method::POST, url).json(&body))
            .await?;

        // A conflict means the client order id was already accepted.
        if response.status() == reqwest::StatusCode::CONFLICT {
            info!(order_id = %order.id, broker = %self.id, "Order already accepted by broker");
            return self
                .order_status(order.id)
                .await
                .map(|state| state.broker_order_id);
        }
        if !response.status().is_success() {
            return Err(self.map_status(response).await);
        }

        let accepted: PlaceOrderResponse = self.decode(response).await?;
        debug!(order_id = %order.id, broker_order_id = %accepted.broker_order_id, "Broker accepted order");
        Ok(BrokerOrderId(accepted.broker_order_id))
    }

    async fn cancel_order(
        &self,
        client_order_id: Uuid,
    ) -> std::result::Result<CancelOutcome, BrokerError> {
        let url = self.url(&format!("v1/orders/{}", client_order_id))?;
        let response = self.send(self.request(reqwest::Method::DELETE, url)).await?;

        match response.status() {
            s if s.is_success() => Ok(CancelOutcome::Cancelled),
            reqwest::StatusCode::NOT_FOUND => Ok(CancelOutcome::NotFound),
            reqwest::StatusCode::CONFLICT => {
                // Not cancellable: the broker decides whether it filled.
                let state = self.order_status(client_order_id).await?;
                match state.status {
                    BrokerOrderStatus::Filled => Ok(CancelOutcome::AlreadyFilled {
                        fill_price: state.average_fill_price,
                    }),
                    BrokerOrderStatus::Cancelled => Ok(CancelOutcome::Cancelled),
                    BrokerOrderStatus::Rejected => Ok(CancelOutcome::NotFound),
                    BrokerOrderStatus::Open => {
                        Err(BrokerError::unknown("cancel conflicted on an open order"))
                    }
                }
            }
            _ => Err(self.map_status(response).await),
        }
    }

    async fn order_status(
        &self,
        client_order_id: Uuid,
    ) -> std::result::Result<BrokerOrderState, BrokerError> {
        let url = self.url(&format!("v1/orders/{}", client_order_id))?;
        let response = self.send(self.request(reqwest::Method::GET, url)).await?;
        if !response.status().is_success() {
            return Err(self.map_status(response).await);
        }
        self.decode(response).await
    }

    async fn get_position(&self, symbol: &str) -> std::result::Result<Position, BrokerError> {
        let url = self.url(&format!("v1/positions/{}", symbol))?;
        let response = self.send(self.request(reqwest::Method::GET, url)).await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Position::flat(symbol));
        }
        if !response.status().is_success() {
            return Err(self.map_status(response).await);
        }
        self.decode(response).await
    }

    async fn get_available_capital(&self) -> std::result::Result<Decimal, BrokerError> {
        let url = self.url("v1/account")?;
        let response = self.send(self.request(reqwest::Method::GET, url)).await?;
        if !response.status().is_success() {
            return Err(self.map_status(response).await);
        }
        let account: AccountResponse = self.decode(response).await?;
        Ok(account.available_capital)
    }
}
