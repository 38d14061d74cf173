use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type Slot = u64;

/// Native ID of an entry in the durable event log (`<millis>-<seq>`).
pub type LogId = String;

/// Program ID of the native system program.
pub const SYSTEM_PROGRAM_ID: &str = "11111111111111111111111111111111";

/// One `logsSubscribe` push message from the remote node.
#[derive(Debug, Clone, PartialEq)]
pub struct RawNotification {
    pub slot: Slot,
    pub signature: String,
    pub err: Option<serde_json::Value>,
    pub logs: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Transfer,
    TokenTransfer,
    ProgramLog,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Transfer => "transfer",
            EventKind::TokenTransfer => "token_transfer",
            EventKind::ProgramLog => "program_log",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transfer" => Ok(EventKind::Transfer),
            "token_transfer" => Ok(EventKind::TokenTransfer),
            "program_log" => Ok(EventKind::ProgramLog),
            other => Err(format!("unknown event kind '{}'", other)),
        }
    }
}

/// Normalized, storable event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub kind: EventKind,
    pub signature: String,
    pub slot: Slot,
    /// Position of this event among those derived from the same transaction.
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    /// Decimal string; never a float.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mint: Option<String>,
    pub raw: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

/// Transaction-level row written by the backfill path.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRow {
    pub signature: String,
    pub slot: Slot,
    pub block_time: Option<DateTime<Utc>>,
    pub fee: u64,
    pub err: Option<serde_json::Value>,
    pub raw: serde_json::Value,
}

/// Commitment level requested from the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Commitment {
    Processed,
    #[default]
    Confirmed,
    Finalized,
}

impl Commitment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Commitment::Processed => "processed",
            Commitment::Confirmed => "confirmed",
            Commitment::Finalized => "finalized",
        }
    }
}

impl fmt::Display for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Commitment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "processed" => Ok(Commitment::Processed),
            "confirmed" => Ok(Commitment::Confirmed),
            "finalized" => Ok(Commitment::Finalized),
            other => Err(format!(
                "Invalid commitment level '{}': must be one of processed, confirmed, finalized",
                other
            )),
        }
    }
}
