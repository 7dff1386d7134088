//! Downstream-facing wire types: the command surface consumed from a
//! downstream channel and the event envelope emitted back to it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// One JSON event sent to a downstream client. The channel is assumed to be
/// a bidirectional, JSON-message-oriented, event-named transport equivalent
/// to what browser clients expect; this type is the
/// proxy's side of that contract.
#[derive(Debug, Clone, Serialize)]
pub struct DownstreamEvent {
    pub name: String,
    pub payload: Value,
}

impl DownstreamEvent {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

pub type DownstreamSender = mpsc::UnboundedSender<DownstreamEvent>;
pub type DownstreamReceiver = mpsc::UnboundedReceiver<DownstreamEvent>;

/// Commands a downstream client may send.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "name", content = "payload", rename_all = "kebab-case")]
pub enum DownstreamCommand {
    Authenticate {
        credential: String,
        account_flavor: Option<String>,
    },
    SubscribeActive(Value),
    #[serde(rename = "sendMessage")]
    SendMessage(Value),
    OpenPosition(Value),
    GetBalance,
    Disconnect,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_authenticate_command() {
        let raw = r#"{"name":"authenticate","payload":{"credential":"abc123","account_flavor":"demo"}}"#;
        let cmd: DownstreamCommand = serde_json::from_str(raw).unwrap();
        match cmd {
            DownstreamCommand::Authenticate {
                credential,
                account_flavor,
            } => {
                assert_eq!(credential, "abc123");
                assert_eq!(account_flavor.as_deref(), Some("demo"));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn parses_get_balance_with_no_payload() {
        let raw = r#"{"name":"get-balance"}"#;
        let cmd: DownstreamCommand = serde_json::from_str(raw).unwrap();
        assert!(matches!(cmd, DownstreamCommand::GetBalance));
    }

    #[test]
    fn send_message_keeps_its_camel_case_wire_name() {
        let raw = r#"{"name":"sendMessage","payload":{"name":"ping"}}"#;
        let cmd: DownstreamCommand = serde_json::from_str(raw).unwrap();
        assert!(matches!(cmd, DownstreamCommand::SendMessage(_)));
    }
}
