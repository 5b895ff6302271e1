use crate::error::ApiError;
use crate::exchange::{CloseOrder, Exchange, Fill, OpenOrder};
use crate::responses::{ApiErrorResponse, FillResponse, MarkPriceResponse};
use async_trait::async_trait;
use configuration::ExchangeConfig;
use core_types::PositionDirection;
use reqwest::header::{HeaderMap, HeaderValue};
use rust_decimal::Decimal;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use uuid::Uuid;

/// `Exchange` implementation for the HTTP exchange gateway.
///
/// The gateway owns exchange credentials and request signing; this client only
/// presents its own API key.
#[derive(Clone)]
pub struct GatewayClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OrderBody<'a> {
    new_client_order_id: Uuid,
    symbol: &'a str,
    side: &'static str,
    quantity: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    leverage: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    margin: Option<Decimal>,
    reduce_only: bool,
}

fn side(direction: PositionDirection) -> &'static str {
    match direction {
        PositionDirection::Long => "BUY",
        PositionDirection::Short => "SELL",
    }
}

impl From<FillResponse> for Fill {
    fn from(r: FillResponse) -> Self {
        Fill {
            order_id: r.order_id,
            price: r.avg_price,
            size: r.executed_qty,
            fee: r.commission,
            liquidated: r.liquidated,
        }
    }
}

impl GatewayClient {
    pub fn new(config: &ExchangeConfig) -> Result<Self, ApiError> {
        let mut headers = HeaderMap::new();
        if !config.api_key.is_empty() {
            let key = HeaderValue::from_str(&config.api_key)
                .map_err(|e| ApiError::InvalidData(format!("Invalid API key: {e}")))?;
            headers.insert("X-API-KEY", key);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Turns a response into `T`, or into a `Gateway` error carrying the
    /// status and any error code from the body.
    async fn read<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            serde_json::from_str::<T>(&text).map_err(|e| ApiError::Deserialization(e.to_string()))
        } else {
            let (code, message) = match serde_json::from_str::<ApiErrorResponse>(&text) {
                Ok(body) => (body.code, body.msg),
                Err(_) => (None, text),
            };
            Err(ApiError::Gateway {
                status: status.as_u16(),
                code,
                message,
            })
        }
    }

    async fn post_order(&self, path: &str, body: &OrderBody<'_>) -> Result<Fill, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.post(&url).json(body).send().await?;
        let fill: FillResponse = Self::read(response).await?;
        Ok(fill.into())
    }
}

#[async_trait]
impl Exchange for GatewayClient {
    async fn mark_price(&self, symbol: &str) -> Result<Decimal, ApiError> {
        let url = format!("{}/v1/price/{}", self.base_url, symbol);
        let response = self.client.get(&url).send().await?;
        let price: MarkPriceResponse = Self::read(response).await?;
        if price.mark_price <= Decimal::ZERO {
            return Err(ApiError::InvalidData(format!(
                "Non-positive mark price {} for {}",
                price.mark_price, price.symbol
            )));
        }
        Ok(price.mark_price)
    }

    async fn open_position(&self, order: &OpenOrder) -> Result<Fill, ApiError> {
        let body = OrderBody {
            new_client_order_id: order.client_order_id,
            symbol: &order.symbol,
            side: side(order.direction),
            quantity: order.size.abs(),
            leverage: Some(order.leverage),
            margin: Some(order.margin),
            reduce_only: false,
        };
        self.post_order("/v1/positions/open", &body).await
    }

    async fn close_position(&self, order: &CloseOrder) -> Result<Fill, ApiError> {
        let body = OrderBody {
            new_client_order_id: order.client_order_id,
            symbol: &order.symbol,
            side: side(order.direction.opposite()),
            quantity: order.size.abs(),
            leverage: None,
            margin: None,
            reduce_only: true,
        };
        self.post_order("/v1/positions/close", &body).await
    }
}
