use crate::rpc::TransactionResponse;
use crate::types::{CanonicalEvent, EventKind, RawNotification, TransactionRow, SYSTEM_PROGRAM_ID};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

const TOKEN_PROGRAM_ID: &str = "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA";
const TOKEN_2022_PROGRAM_ID: &str = "TokenzQdBNbLqP5VEhdkAS6EPFLC1PHnBqCXEpPxuEb";

pub fn generate_event_id(signature: &str, index: usize, kind: EventKind) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}_{}_{}", signature, index, kind));
    hasher.finalize().into()
}

pub fn event_id_to_hex(id: &[u8; 32]) -> String {
    hex::encode(id)
}

impl CanonicalEvent {
    /// Stable hex ID derived from signature, index and kind.
    pub fn id(&self) -> String {
        event_id_to_hex(&generate_event_id(&self.signature, self.index, self.kind))
    }
}

#[derive(Debug, Deserialize)]
struct NotificationFrame {
    #[serde(default)]
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct NotificationParams {
    result: NotificationResult,
}

#[derive(Debug, Deserialize)]
struct NotificationResult {
    context: NotificationContext,
    value: NotificationValue,
}

#[derive(Debug, Deserialize)]
struct NotificationContext {
    slot: u64,
}

#[derive(Debug, Deserialize)]
struct NotificationValue {
    signature: String,
    #[serde(default)]
    err: Option<Value>,
    #[serde(default)]
    logs: Option<Vec<String>>,
}

/// Parse one inbound WebSocket frame.
///
/// Frames without a `params` payload (subscribe acks, responses to other
/// requests) yield `None`, as do notifications of an unexpected shape.
pub fn parse_notification_frame(text: &str) -> Option<RawNotification> {
    let frame: NotificationFrame = serde_json::from_str(text).ok()?;
    let params = frame.params?;

    match serde_json::from_value::<NotificationParams>(params) {
        Ok(params) => {
            let value = params.result.value;
            Some(RawNotification {
                slot: params.result.context.slot,
                signature: value.signature,
                err: value.err.filter(|v| !v.is_null()),
                logs: value.logs.unwrap_or_default(),
            })
        }
        Err(e) => {
            debug!("Ignoring notification of unexpected shape: {}", e);
            None
        }
    }
}

/// First program invoked at the top level, from `Program <id> invoke [1]`.
pub fn invoked_program(logs: &[String]) -> Option<String> {
    logs.iter().find_map(|line| {
        line.strip_prefix("Program ")
            .and_then(|rest| rest.strip_suffix(" invoke [1]"))
            .map(|id| id.trim().to_string())
    })
}

/// Hex-encoded payloads of `Program data: <base64>` lines.
pub fn program_data(logs: &[String]) -> Vec<String> {
    logs.iter()
        .filter_map(|line| line.strip_prefix("Program data: "))
        .filter_map(|encoded| STANDARD.decode(encoded.trim()).ok())
        .map(hex::encode)
        .collect()
}

fn program_log_event(
    signature: &str,
    slot: u64,
    index: usize,
    err: Option<&Value>,
    logs: &[String],
    occurred_at: DateTime<Utc>,
) -> CanonicalEvent {
    CanonicalEvent {
        kind: EventKind::ProgramLog,
        signature: signature.to_string(),
        slot,
        index,
        account: None,
        program: invoked_program(logs),
        amount: None,
        mint: None,
        raw: json!({
            "err": err.cloned().unwrap_or(Value::Null),
            "logs": logs,
            "data": program_data(logs),
        }),
        occurred_at,
    }
}

/// Canonical events carried by a live notification (one `program_log`).
pub fn events_from_notification(
    notification: &RawNotification,
    received_at: DateTime<Utc>,
) -> Vec<CanonicalEvent> {
    if notification.signature.is_empty() {
        return Vec::new();
    }
    vec![program_log_event(
        &notification.signature,
        notification.slot,
        0,
        notification.err.as_ref(),
        &notification.logs,
        received_at,
    )]
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParsedInstruction {
    #[serde(default)]
    program: Option<String>,
    program_id: String,
    parsed: ParsedBody,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ParsedBody {
    Typed {
        #[serde(rename = "type")]
        kind: String,
        #[serde(default)]
        info: Value,
    },
    Text(String),
}

#[derive(Debug, Deserialize)]
struct SystemTransfer {
    source: String,
    destination: String,
    lamports: u64,
}

#[derive(Debug, Deserialize)]
struct TokenTransfer {
    source: String,
    destination: String,
    amount: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenTransferChecked {
    source: String,
    destination: String,
    mint: String,
    token_amount: TokenAmount,
}

#[derive(Debug, Deserialize)]
struct TokenAmount {
    amount: String,
}

#[derive(Debug)]
enum Instruction {
    SystemTransfer(SystemTransfer),
    TokenTransfer { program_id: String, transfer: TokenTransfer },
    TokenTransferChecked { program_id: String, transfer: TokenTransferChecked },
    Unrecognized,
}

fn is_system(ix: &ParsedInstruction) -> bool {
    ix.program_id == SYSTEM_PROGRAM_ID || ix.program.as_deref() == Some("system")
}

fn is_token(ix: &ParsedInstruction) -> bool {
    ix.program_id == TOKEN_PROGRAM_ID
        || ix.program_id == TOKEN_2022_PROGRAM_ID
        || matches!(ix.program.as_deref(), Some("spl-token") | Some("spl-token-2022"))
}

fn classify(raw: &Value) -> Instruction {
    let ix = match serde_json::from_value::<ParsedInstruction>(raw.clone()) {
        Ok(ix) => ix,
        Err(_) => {
            debug!(
                "Skipping unparsed instruction for program {}",
                raw.get("programId").and_then(serde_json::Value::as_str).unwrap_or("-")
            );
            return Instruction::Unrecognized;
        }
    };

    let (kind, info) = match &ix.parsed {
        ParsedBody::Typed { kind, info } => (kind.as_str(), info.clone()),
        ParsedBody::Text(_) => {
            debug!("Skipping text-parsed instruction for program {}", ix.program_id);
            return Instruction::Unrecognized;
        }
    };

    let decoded = match kind {
        "transfer" if is_system(&ix) => {
            serde_json::from_value(info).map(Instruction::SystemTransfer)
        }
        "transfer" if is_token(&ix) => serde_json::from_value(info).map(|transfer| {
            Instruction::TokenTransfer {
                program_id: ix.program_id.clone(),
                transfer,
            }
        }),
        "transferChecked" if is_token(&ix) => serde_json::from_value(info).map(|transfer| {
            Instruction::TokenTransferChecked {
                program_id: ix.program_id.clone(),
                transfer,
            }
        }),
        _ => {
            debug!("Skipping {} instruction for program {}", kind, ix.program_id);
            return Instruction::Unrecognized;
        }
    };

    decoded.unwrap_or_else(|e| {
        debug!("Skipping {} instruction with unexpected info: {}", kind, e);
        Instruction::Unrecognized
    })
}

/// Normalize a `getTransaction` (jsonParsed) response into a transaction row
/// and its canonical events.
pub fn normalize_transaction(
    signature: &str,
    tx: &TransactionResponse,
    fetched_at: DateTime<Utc>,
) -> (TransactionRow, Vec<CanonicalEvent>) {
    let block_time = tx.block_time.and_then(|bt| DateTime::from_timestamp(bt, 0));
    let occurred_at = block_time.unwrap_or(fetched_at);
    let meta = tx.meta.as_ref();
    let err = meta.and_then(|m| m.err.clone()).filter(|v| !v.is_null());

    let row = TransactionRow {
        signature: signature.to_string(),
        slot: tx.slot,
        block_time,
        fee: meta.map(|m| m.fee).unwrap_or(0),
        err: err.clone(),
        raw: serde_json::to_value(tx).unwrap_or(Value::Null),
    };

    let mut events = Vec::new();
    for raw in &tx.transaction.message.instructions {
        let index = events.len();
        let event = match classify(raw) {
            Instruction::SystemTransfer(t) => CanonicalEvent {
                kind: EventKind::Transfer,
                signature: signature.to_string(),
                slot: tx.slot,
                index,
                account: Some(t.destination.clone()),
                program: Some(SYSTEM_PROGRAM_ID.to_string()),
                amount: Some(t.lamports.to_string()),
                mint: None,
                raw: json!({
                    "source": t.source,
                    "destination": t.destination,
                    "lamports": t.lamports,
                }),
                occurred_at,
            },
            Instruction::TokenTransfer { program_id, transfer } => CanonicalEvent {
                kind: EventKind::TokenTransfer,
                signature: signature.to_string(),
                slot: tx.slot,
                index,
                account: Some(transfer.destination.clone()),
                program: Some(program_id),
                amount: Some(transfer.amount.clone()),
                mint: None,
                raw: json!({
                    "source": transfer.source,
                    "destination": transfer.destination,
                    "amount": transfer.amount,
                }),
                occurred_at,
            },
            Instruction::TokenTransferChecked { program_id, transfer } => CanonicalEvent {
                kind: EventKind::TokenTransfer,
                signature: signature.to_string(),
                slot: tx.slot,
                index,
                account: Some(transfer.destination.clone()),
                program: Some(program_id),
                amount: Some(transfer.token_amount.amount.clone()),
                mint: Some(transfer.mint.clone()),
                raw: json!({
                    "source": transfer.source,
                    "destination": transfer.destination,
                    "mint": transfer.mint,
                    "amount": transfer.token_amount.amount,
                }),
                occurred_at,
            },
            Instruction::Unrecognized => continue,
        };
        events.push(event);
    }

    if let Some(logs) = meta.and_then(|m| m.log_messages.as_ref()) {
        if !logs.is_empty() {
            events.push(program_log_event(
                signature,
                tx.slot,
                events.len(),
                err.as_ref(),
                logs,
                occurred_at,
            ));
        }
    }

    (row, events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_parse_notification_frame() {
        let frame = r#"{
            "jsonrpc": "2.0",
            "method": "logsNotification",
            "params": {
                "result": {
                    "context": {"slot": 5208469},
                    "value": {
                        "signature": "5h6xBEauJ3PK6SWCZ1PGjBvj8vDdWG3KpwATGy1ARAXFSDwt8GFXM7W5Ncn16wmqokgpiKRLuS83KUxyZyv2sUYv",
                        "err": null,
                        "logs": ["Program 11111111111111111111111111111111 invoke [1]", "Program 11111111111111111111111111111111 success"]
                    }
                },
                "subscription": 24040
            }
        }"#;

        let notification = parse_notification_frame(frame).unwrap();
        assert_eq!(notification.slot, 5208469);
        assert!(notification.signature.starts_with("5h6xBE"));
        assert!(notification.err.is_none());
        assert_eq!(notification.logs.len(), 2);
    }

    #[test]
    fn test_subscribe_ack_is_ignored() {
        assert!(parse_notification_frame(r#"{"jsonrpc":"2.0","result":24040,"id":1}"#).is_none());
        assert!(parse_notification_frame("not json").is_none());
        assert!(parse_notification_frame(r#"{"params":{"result":42}}"#).is_none());
    }

    #[test]
    fn test_notification_event_carries_program_and_data() {
        let notification = RawNotification {
            slot: 10,
            signature: "sigA".into(),
            err: Some(json!({"InstructionError": [0, {"Custom": 1}]})),
            logs: vec![
                "Program ComputeBudget111111111111111111111111111111 invoke [1]".into(),
                "Program data: AQID".into(),
            ],
        };

        let events = events_from_notification(&notification, now());
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.kind, EventKind::ProgramLog);
        assert_eq!(event.program.as_deref(), Some("ComputeBudget111111111111111111111111111111"));
        assert_eq!(event.raw["data"][0], "010203");
        assert_eq!(event.raw["err"]["InstructionError"][0], 0);
        assert_eq!(event.occurred_at, now());
    }

    #[test]
    fn test_empty_signature_yields_no_events() {
        let notification = RawNotification {
            slot: 1,
            signature: String::new(),
            err: None,
            logs: vec![],
        };
        assert!(events_from_notification(&notification, now()).is_empty());
    }

    fn transaction(instructions: Value, logs: Value, block_time: Option<i64>) -> TransactionResponse {
        serde_json::from_value(json!({
            "slot": 300,
            "blockTime": block_time,
            "meta": {"err": null, "fee": 5000, "logMessages": logs},
            "transaction": {
                "signatures": ["sigT"],
                "message": {"accountKeys": [], "instructions": instructions}
            },
            "version": 0
        }))
        .unwrap()
    }

    #[test]
    fn test_normalize_system_transfer() {
        let tx = transaction(
            json!([{
                "program": "system",
                "programId": SYSTEM_PROGRAM_ID,
                "parsed": {"type": "transfer", "info": {"source": "A", "destination": "B", "lamports": 18446744073709551615u64}}
            }]),
            json!(["Program 11111111111111111111111111111111 invoke [1]"]),
            Some(1_700_000_000),
        );

        let (row, events) = normalize_transaction("sigT", &tx, now());

        assert_eq!(row.fee, 5000);
        assert_eq!(row.block_time.unwrap().timestamp(), 1_700_000_000);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::Transfer);
        assert_eq!(events[0].account.as_deref(), Some("B"));
        assert_eq!(events[0].amount.as_deref(), Some("18446744073709551615"));
        assert_eq!(events[1].kind, EventKind::ProgramLog);
        assert_eq!(events[1].index, 1);
        assert_eq!(events[1].occurred_at.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_normalize_token_transfer_checked() {
        let tx = transaction(
            json!([{
                "program": "spl-token",
                "programId": TOKEN_PROGRAM_ID,
                "parsed": {"type": "transferChecked", "info": {
                    "source": "S", "destination": "D", "authority": "O",
                    "mint": "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v",
                    "tokenAmount": {"amount": "1500000", "decimals": 6, "uiAmountString": "1.5"}
                }}
            }]),
            json!([]),
            None,
        );

        let (row, events) = normalize_transaction("sigT", &tx, now());

        assert!(row.block_time.is_none());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::TokenTransfer);
        assert_eq!(events[0].amount.as_deref(), Some("1500000"));
        assert_eq!(events[0].mint.as_deref(), Some("EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v"));
        assert_eq!(events[0].occurred_at, now());
    }

    #[test]
    fn test_unrecognized_instructions_are_skipped() {
        let tx = transaction(
            json!([
                {"programId": "MemoSq4gqABAXKb96qnH8TysNcWxMyWCqXgDLGmfcHr", "program": "spl-memo", "parsed": "hello"},
                {"programId": "Prog", "accounts": ["A"], "data": "3Bxs4"},
                {"program": "system", "programId": SYSTEM_PROGRAM_ID, "parsed": {"type": "transfer", "info": {"lamports": "oops"}}}
            ]),
            json!(null),
            None,
        );

        let (_, events) = normalize_transaction("sigT", &tx, now());
        assert!(events.is_empty());
    }

    #[test]
    fn test_unknown_instruction_type_does_not_hide_later_transfers() {
        let create = json!({
            "program": "system",
            "programId": SYSTEM_PROGRAM_ID,
            "parsed": {"type": "createAccount", "info": {"source": "A", "newAccount": "N", "lamports": 1}}
        });
        assert!(matches!(classify(&create), Instruction::Unrecognized));

        let tx = transaction(
            json!([
                create,
                {"program": "system", "programId": SYSTEM_PROGRAM_ID, "parsed": {"type": "transfer", "info": {"source": "A", "destination": "B", "lamports": 7}}}
            ]),
            json!(null),
            None,
        );

        let (_, events) = normalize_transaction("sigT", &tx, now());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Transfer);
        assert_eq!(events[0].amount.as_deref(), Some("7"));
    }

    #[test]
    fn test_event_id_is_stable() {
        let a = generate_event_id("sig", 0, EventKind::Transfer);
        let b = generate_event_id("sig", 0, EventKind::Transfer);
        let c = generate_event_id("sig", 1, EventKind::Transfer);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(event_id_to_hex(&a).len(), 64);
    }
}
