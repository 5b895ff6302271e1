use rust_decimal::Decimal;
use serde::Deserialize;

// Using `#[serde(rename_all = "camelCase")]` to automatically map from JSON camelCase to Rust snake_case.

/// The response from `GET /v1/price/{symbol}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkPriceResponse {
    pub symbol: String,
    pub mark_price: Decimal,
}

/// The response from `POST /v1/positions/open` and `POST /v1/positions/close`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FillResponse {
    pub order_id: String,
    pub avg_price: Decimal,
    pub executed_qty: Decimal,
    #[serde(default)]
    pub commission: Decimal,
    #[serde(default)]
    pub liquidated: bool,
}

/// Represents an error response from the gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorResponse {
    pub code: Option<i64>,
    pub msg: String,
}
