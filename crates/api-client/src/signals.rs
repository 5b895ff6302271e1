use crate::error::ApiError;
use async_trait::async_trait;
use core_types::TradeSignal;
use std::time::Duration;

/// Source of new trade ideas, normally the predictive model service.
#[async_trait]
pub trait SignalSource: Send + Sync {
    /// Signals to act on now, given how many positions are already open.
    async fn signals(&self, open_count: usize) -> Result<Vec<TradeSignal>, ApiError>;
}

/// Never produces a signal. Used when no model endpoint is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdleSignals;

#[async_trait]
impl SignalSource for IdleSignals {
    async fn signals(&self, _open_count: usize) -> Result<Vec<TradeSignal>, ApiError> {
        Ok(Vec::new())
    }
}

/// Polls the model service: `GET {url}?open={open_count}` returning a JSON
/// array of signals.
#[derive(Clone)]
pub struct HttpSignalSource {
    client: reqwest::Client,
    url: String,
}

impl HttpSignalSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl SignalSource for HttpSignalSource {
    async fn signals(&self, open_count: usize) -> Result<Vec<TradeSignal>, ApiError> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("open", open_count.to_string())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Gateway {
                status: status.as_u16(),
                code: None,
                message: response.text().await.unwrap_or_default(),
            });
        }

        let signals = response
            .json::<Vec<TradeSignal>>()
            .await
            .map_err(|e| ApiError::Deserialization(e.to_string()))?;
        Ok(signals)
    }
}
