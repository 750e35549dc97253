// ledger-gateway-rs/src/events.rs
//
// Chaincode event normalization.
//
// The network emits loosely shaped JSON whose field casing drifts between
// chaincode versions ({action, ACTION, Action}, snake/camel/Pascal ids).
// Normalization maps every known variant onto one canonical payload and
// tags the event kind; unknown kinds are rejected with a logged warning.

use serde_json::Value;
use tracing::warn;

use crate::transport::RawEvent;

/// Known chaincode event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerEventKind {
    RecordCreated,
    AccessGranted,
    AccessRevoked,
}

impl LedgerEventKind {
    fn parse(name: &str) -> Option<Self> {
        // Case- and separator-insensitive: "RecordCreated", "record_created"
        // and "RECORD-CREATED" all land on the same kind.
        let folded: String = name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match folded.as_str() {
            "recordcreated" => Some(Self::RecordCreated),
            "accessgranted" => Some(Self::AccessGranted),
            "accessrevoked" => Some(Self::AccessRevoked),
            _ => None,
        }
    }
}

/// Canonical event payload dispatched to the fan-out.
#[derive(Debug, Clone)]
pub struct LedgerEvent {
    pub kind: LedgerEventKind,
    pub record_id: Option<String>,
    pub patient_id: Option<String>,
    pub creator_id: Option<String>,
    pub grantee_id: Option<String>,
    pub ipfs_cid: Option<String>,
    pub action: Option<String>,
    pub tx_id: String,
    /// Original decoded payload, for handlers that need more than the
    /// canonical fields.
    pub raw: Value,
}

/// Case variants for a canonical snake_case field name: the name itself,
/// camelCase, PascalCase and SCREAMING_SNAKE.
fn casing_variants(snake: &str) -> Vec<String> {
    let camel: String = {
        let mut out = String::with_capacity(snake.len());
        let mut upper_next = false;
        for c in snake.chars() {
            if c == '_' {
                upper_next = true;
            } else if upper_next {
                out.push(c.to_ascii_uppercase());
                upper_next = false;
            } else {
                out.push(c);
            }
        }
        out
    };
    let pascal: String = camel
        .chars()
        .enumerate()
        .map(|(i, c)| if i == 0 { c.to_ascii_uppercase() } else { c })
        .collect();
    vec![snake.to_string(), camel, pascal, snake.to_ascii_uppercase()]
}

fn lookup(payload: &Value, snake: &str) -> Option<String> {
    let object = payload.as_object()?;
    for variant in casing_variants(snake) {
        if let Some(value) = object.get(&variant) {
            match value {
                Value::String(s) => return Some(s.clone()),
                Value::Null => return None,
                other => return Some(other.to_string()),
            }
        }
    }
    None
}

/// Normalize a raw chaincode event. Returns `None` (with a warning) for
/// unknown kinds or undecodable payloads.
pub fn normalize(raw: &RawEvent) -> Option<LedgerEvent> {
    let Some(kind) = LedgerEventKind::parse(&raw.name) else {
        warn!(event = %raw.name, "dropping unknown chaincode event kind");
        return None;
    };
    let payload: Value = match serde_json::from_slice(&raw.payload) {
        Ok(value) => value,
        Err(e) => {
            warn!(event = %raw.name, error = %e, "dropping undecodable event payload");
            return None;
        }
    };
    Some(LedgerEvent {
        kind,
        record_id: lookup(&payload, "record_id"),
        patient_id: lookup(&payload, "patient_id"),
        creator_id: lookup(&payload, "creator_id"),
        grantee_id: lookup(&payload, "grantee_id"),
        ipfs_cid: lookup(&payload, "ipfs_cid"),
        action: lookup(&payload, "action"),
        tx_id: raw.tx_id.clone(),
        raw: payload,
    })
}
