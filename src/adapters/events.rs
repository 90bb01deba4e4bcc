// Push payload decoding for the settlement stream
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::traits::{ObservedInvoiceState, SettlementListener};

/// A decoded push notification
#[derive(Debug, Clone, PartialEq)]
pub enum SettlementPush {
    Settled { invoice: String },
    StateChanged { invoice: String, state: ObservedInvoiceState },
    Unrecognized(Value),
}

#[derive(Debug, Deserialize)]
struct PushBody {
    #[serde(alias = "invoice_id", alias = "invoiceId")]
    invoice: String,
    #[serde(default, alias = "status")]
    state: Option<String>,
}

/// Known wire shapes, tried in order
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PushEnvelope {
    /// `{"jsonrpc":"2.0","method":"invoice.settled","params":{...}}`
    Notification {
        #[allow(dead_code)]
        jsonrpc: String,
        method: String,
        params: PushBody,
    },
    /// `{"type":"invoice.settled","data":{...}}`
    Nested {
        #[serde(rename = "type", default)]
        kind: Option<String>,
        data: PushBody,
    },
    /// `{"type":"invoice.settled","invoice":"...","state":"SETTLED"}`
    Flat {
        #[serde(rename = "type", default)]
        kind: Option<String>,
        #[serde(flatten)]
        body: PushBody,
    },
}

impl SettlementPush {
    pub fn from_value(value: Value) -> Self {
        let envelope = match PushEnvelope::deserialize(&value) {
            Ok(envelope) => envelope,
            Err(_) => return SettlementPush::Unrecognized(value),
        };

        let (kind, body) = match envelope {
            PushEnvelope::Notification { method, params, .. } => (Some(method), params),
            PushEnvelope::Nested { kind, data } => (kind, data),
            PushEnvelope::Flat { kind, body } => (kind, body),
        };

        match body.state.as_deref().map(ObservedInvoiceState::parse) {
            Some(ObservedInvoiceState::Settled) => SettlementPush::Settled {
                invoice: body.invoice,
            },
            Some(state) => SettlementPush::StateChanged {
                invoice: body.invoice,
                state,
            },
            None if kind.as_deref().map_or(false, is_settled_kind) => SettlementPush::Settled {
                invoice: body.invoice,
            },
            None => SettlementPush::Unrecognized(value),
        }
    }

    /// One line of the newline-delimited stream
    pub fn from_line(line: &str) -> Self {
        match serde_json::from_str::<Value>(line) {
            Ok(value) => Self::from_value(value),
            Err(_) => SettlementPush::Unrecognized(Value::String(line.to_string())),
        }
    }

    /// Forward settlements to the listener; everything else is only logged.
    pub fn dispatch(self, listener: &dyn SettlementListener) {
        match self {
            SettlementPush::Settled { invoice } => listener.on_settled(invoice),
            SettlementPush::StateChanged { invoice, state } => {
                debug!(invoice = %invoice, state = %state.as_str(), "Ignoring non-settlement push");
            }
            SettlementPush::Unrecognized(payload) => {
                warn!(payload = %payload, "Unrecognized settlement push payload");
            }
        }
    }
}

fn is_settled_kind(kind: &str) -> bool {
    let kind = kind.to_ascii_lowercase();
    kind.ends_with("settled") || kind.ends_with(".paid")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flat_payload() {
        let push = SettlementPush::from_value(json!({"invoice": "inv-1", "state": "SETTLED"}));
        assert_eq!(push, SettlementPush::Settled { invoice: "inv-1".into() });
    }

    #[test]
    fn test_nested_payload() {
        let push = SettlementPush::from_value(json!({
            "type": "invoice.settled",
            "data": {"invoice_id": "inv-2"}
        }));
        assert_eq!(push, SettlementPush::Settled { invoice: "inv-2".into() });
    }

    #[test]
    fn test_jsonrpc_notification() {
        let push = SettlementPush::from_value(json!({
            "jsonrpc": "2.0",
            "method": "invoice.updated",
            "params": {"invoice": "inv-3", "status": "failed"}
        }));
        assert_eq!(
            push,
            SettlementPush::StateChanged {
                invoice: "inv-3".into(),
                state: ObservedInvoiceState::Failed
            }
        );
    }

    #[test]
    fn test_unknown_shapes() {
        assert!(matches!(
            SettlementPush::from_value(json!({"hello": "world"})),
            SettlementPush::Unrecognized(_)
        ));
        assert!(matches!(
            SettlementPush::from_value(json!({"type": "heartbeat", "invoice": "inv-4"})),
            SettlementPush::Unrecognized(_)
        ));
        assert!(matches!(
            SettlementPush::from_line("not json"),
            SettlementPush::Unrecognized(_)
        ));
    }
}
