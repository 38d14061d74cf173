use crate::error::{Result, SentinelError};
use crate::types::{RawNotification, Slot};
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashMap;

/// Name of the durable stream accepted notifications are appended to.
pub const STREAM_NAME: &str = "sol:logs";

pub const FIELD_SLOT: &str = "slot";
pub const FIELD_SIGNATURE: &str = "signature";
pub const FIELD_ERR: &str = "err";
pub const FIELD_LOGS: &str = "logs";
pub const FIELD_TS: &str = "ts";

/// Accepted notification as it travels through the durable event log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub slot: Slot,
    pub signature: String,
    pub err: Option<serde_json::Value>,
    pub logs: Vec<String>,
    pub ts: Option<DateTime<Utc>>,
}

impl LogRecord {
    pub fn from_notification(notification: &RawNotification, ts: DateTime<Utc>) -> Self {
        Self {
            slot: notification.slot,
            signature: notification.signature.clone(),
            err: notification.err.clone().filter(|v| !v.is_null()),
            logs: notification.logs.clone(),
            ts: Some(ts),
        }
    }

    /// Flat field map in append order.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            (FIELD_SLOT, self.slot.to_string()),
            (FIELD_SIGNATURE, self.signature.clone()),
            (FIELD_ERR, self.err_json().unwrap_or_else(|| "null".to_string())),
            (FIELD_LOGS, self.joined_logs()),
        ];
        if let Some(ts) = self.ts {
            fields.push((FIELD_TS, ts.to_rfc3339_opts(SecondsFormat::Nanos, true)));
        }
        fields
    }

    /// Decode a log entry. Fails with `Protocol` when the identity or slot is
    /// missing or a field does not parse.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self> {
        let signature = fields
            .get(FIELD_SIGNATURE)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SentinelError::Protocol("record has no signature".to_string()))?
            .to_string();

        let slot = fields
            .get(FIELD_SLOT)
            .ok_or_else(|| SentinelError::Protocol(format!("record {} has no slot", signature)))?
            .trim()
            .parse::<Slot>()
            .map_err(|e| SentinelError::Protocol(format!("record {} has invalid slot: {}", signature, e)))?;

        let err = match fields.get(FIELD_ERR).map(|s| s.trim()) {
            None | Some("") | Some("null") => None,
            Some(raw) => {
                let value: serde_json::Value = serde_json::from_str(raw).map_err(|e| {
                    SentinelError::Protocol(format!("record {} has invalid err payload: {}", signature, e))
                })?;
                Some(value).filter(|v| !v.is_null())
            }
        };

        let logs = match fields.get(FIELD_LOGS) {
            Some(joined) if !joined.is_empty() => joined.split('\n').map(str::to_string).collect(),
            _ => Vec::new(),
        };

        let ts = fields
            .get(FIELD_TS)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc));

        Ok(Self {
            slot,
            signature,
            err,
            logs,
            ts,
        })
    }

    /// JSON text of the error payload, `None` when the transaction succeeded.
    pub fn err_json(&self) -> Option<String> {
        self.err.as_ref().map(|v| v.to_string())
    }

    pub fn joined_logs(&self) -> String {
        self.logs.join("\n")
    }
}
