use configuration::TelegramConfig;
use events::{Subscription, TradeEvent};
use reqwest::Client;
use serde::Serialize;
pub mod error;

pub use error::AlerterError;

/// The JSON payload for the Telegram `sendMessage` endpoint.
#[derive(Debug, Serialize)]
struct SendMessagePayload<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'a str, // To allow for formatting like bold, italics etc.
}

/// A client for sending messages to the Telegram Bot API.
pub struct TelegramAlerter {
    client: Client,
    token: String,
    chat_id: String,
}

impl TelegramAlerter {
    /// Creates a new `TelegramAlerter`.
    ///
    /// Returns `NotConfigured` if the token or chat_id is missing, allowing the
    /// caller to run without alerting.
    pub fn new(config: &TelegramConfig) -> Result<Self, AlerterError> {
        if config.token.is_empty() || config.chat_id.is_empty() {
            return Err(AlerterError::NotConfigured);
        }
        Ok(Self {
            client: Client::new(),
            token: config.token.clone(),
            chat_id: config.chat_id.clone(),
        })
    }

    /// Sends a text message to the configured Telegram chat.
    pub async fn send_message(&self, message: &str) -> Result<(), AlerterError> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);

        let payload = SendMessagePayload {
            chat_id: &self.chat_id,
            text: message,
            parse_mode: "MarkdownV2", // Use Markdown for rich formatting
        };

        let response = self.client.post(&url).json(&payload).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AlerterError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }
}

/// A long-running service that drains an event-bus subscription and sends
/// Telegram alerts for the events an operator cares about.
///
/// Returns when the subscription is removed from the bus.
pub async fn run_alerter_service(alerter: TelegramAlerter, mut events: Subscription) {
    tracing::info!("Alerter service started. Listening for trade events.");

    if let Err(e) = alerter.send_message("✅ *Sentinel Started*").await {
        tracing::warn!(error = %e, "Failed to send startup alert.");
    }

    while let Some(event) = events.recv().await {
        let Some(message) = format_event(&event) else {
            continue;
        };
        if let Err(e) = alerter.send_message(&message).await {
            tracing::error!(error = %e, event = event.name(), "Failed to send Telegram alert.");
        }
    }

    tracing::info!("Event subscription closed. Alerter service shutting down.");
}

/// Renders an event as a MarkdownV2 message, or `None` for routine events.
pub fn format_event(event: &TradeEvent) -> Option<String> {
    let text = match event {
        TradeEvent::PositionOpened { position, fill_price } => {
            let icon = if position.direction.as_str() == "LONG" { "📈" } else { "📉" };
            format!(
                "{} *{} {}* `@{}`\n`{}` units, margin `{}`",
                icon,
                position.direction,
                escape_markdown(&position.symbol),
                fill_price,
                position.size,
                position.amount_in
            )
        }
        TradeEvent::PositionClosed { position, reason, exit_price, realized_pnl, .. } => {
            let icon = if realized_pnl.is_sign_negative() { "🔻" } else { "💰" };
            format!(
                "{} *CLOSED {}* \\({}\\) `@{}`\nPnL `{}`",
                icon,
                escape_markdown(&position.symbol),
                escape_markdown(&reason.to_string()),
                exit_price,
                realized_pnl
            )
        }
        TradeEvent::CloseFailed { position, error } => format!(
            "🚨 *CLOSE FAILED {}*: {}",
            escape_markdown(&position.symbol),
            escape_markdown(error)
        ),
        TradeEvent::OpenFailed { position, error } => format!(
            "⚠️ *OPEN FAILED {}*: {}",
            escape_markdown(&position.symbol),
            escape_markdown(error)
        ),
        TradeEvent::TradingHalted { operation, reason, .. } => format!(
            "🛑 *TRADING HALTED* after {}: {}",
            escape_markdown(operation),
            escape_markdown(reason)
        ),
        TradeEvent::PositionPlanned { .. } | TradeEvent::TickSkipped { .. } => return None,
    };
    Some(text)
}

/// A helper function to escape characters that have special meaning in Telegram's MarkdownV2.
fn escape_markdown(text: &str) -> String {
    let special_chars = r"\_*[]()~`>#+-=|{}.!";
    special_chars
        .chars()
        .fold(text.to_string(), |s, c| s.replace(c, &format!("\\{}", c)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use core_types::{ExitReason, PositionDirection, PositionStatus};
    use events::PositionSummary;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn summary() -> PositionSummary {
        PositionSummary {
            id: Uuid::new_v4(),
            symbol: "BTCUSDT".to_string(),
            direction: PositionDirection::Long,
            status: PositionStatus::Closed,
            size: dec!(0.01),
            amount_in: dec!(100),
            entry_price: dec!(50000),
        }
    }

    #[test]
    fn test_routine_events_are_silent() {
        let event = TradeEvent::TickSkipped { lock_name: "x".to_string(), at: Utc::now() };
        assert!(format_event(&event).is_none());
    }

    #[test]
    fn test_close_message_escapes_reason() {
        let event = TradeEvent::PositionClosed {
            position: summary(),
            reason: ExitReason::ExitFlag,
            exit_price: dec!(51000),
            amount_out: dec!(110),
            realized_pnl: dec!(10),
        };
        let text = format_event(&event).unwrap();
        assert!(text.contains("EXIT\\_FLAG"));
        assert!(text.contains("`10`"));
    }

    #[test]
    fn test_escape_markdown() {
        assert_eq!(escape_markdown("a.b-c"), "a\\.b\\-c");
    }
}
