use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a trade position.
///
/// The only legal path is `Plan -> Open -> {Closed, Failed}`. Terminal statuses
/// are never left again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    Plan,
    Open,
    Closed,
    Failed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Plan => "PLAN",
            PositionStatus::Open => "OPEN",
            PositionStatus::Closed => "CLOSED",
            PositionStatus::Failed => "FAILED",
        }
    }

    /// `true` for `Closed` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PositionStatus::Closed | PositionStatus::Failed)
    }

    /// Whether a record currently in `self` may be moved to `next`.
    ///
    /// Staying in the same status is always allowed; it is how idempotent
    /// updates (e.g. a duplicate fill notification) are expressed.
    pub fn can_transition_to(&self, next: PositionStatus) -> bool {
        use PositionStatus::*;
        match (self, next) {
            (a, b) if *a == b => true,
            (Plan, Open) => true,
            (Open, Closed) | (Open, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PositionStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PLAN" => Ok(PositionStatus::Plan),
            "OPEN" => Ok(PositionStatus::Open),
            "CLOSED" => Ok(PositionStatus::Closed),
            "FAILED" => Ok(PositionStatus::Failed),
            other => Err(CoreError::UnknownVariant {
                kind: "position status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionDirection {
    Long,
    Short,
}

impl PositionDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionDirection::Long => "LONG",
            PositionDirection::Short => "SHORT",
        }
    }

    /// Returns the opposite direction, i.e. the side of the closing order.
    pub fn opposite(&self) -> Self {
        match self {
            PositionDirection::Long => PositionDirection::Short,
            PositionDirection::Short => PositionDirection::Long,
        }
    }
}

impl fmt::Display for PositionDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PositionDirection {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LONG" => Ok(PositionDirection::Long),
            "SHORT" => Ok(PositionDirection::Short),
            _ => Err(CoreError::UnknownVariant {
                kind: "position direction",
                value: s.to_string(),
            }),
        }
    }
}

/// Why the monitor decided to close a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    ExitFlag,
    TakeProfit,
    StopLoss,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitReason::ExitFlag => "EXIT_FLAG",
            ExitReason::TakeProfit => "TP",
            ExitReason::StopLoss => "SL",
        };
        f.write_str(s)
    }
}
