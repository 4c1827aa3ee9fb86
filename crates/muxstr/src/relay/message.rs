use crate::{Error, Note, Result};
use serde_json::Value;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CommandResult {
    pub event_id: String,
    pub accepted: bool,
    pub message: String,
}

/// Messages sent by relays, received by clients
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RelayMessage {
    OK(CommandResult),
    Eose(String),
    Event { sub_id: String, note: Note },
    Notice(String),
    /// The relay closed a subscription on its own. The reason may be empty.
    Closed { sub_id: String, reason: String },
    /// NIP-42 challenge
    Auth(String),
}

impl RelayMessage {
    pub fn eose(sub_id: impl Into<String>) -> Self {
        RelayMessage::Eose(sub_id.into())
    }

    pub fn notice(msg: impl Into<String>) -> Self {
        RelayMessage::Notice(msg.into())
    }

    pub fn ok(event_id: impl Into<String>, accepted: bool, message: impl Into<String>) -> Self {
        RelayMessage::OK(CommandResult {
            event_id: event_id.into(),
            accepted,
            message: message.into(),
        })
    }

    pub fn closed(sub_id: impl Into<String>, reason: impl Into<String>) -> Self {
        RelayMessage::Closed {
            sub_id: sub_id.into(),
            reason: reason.into(),
        }
    }

    pub fn from_json(msg: &str) -> Result<RelayMessage> {
        if msg.is_empty() {
            return Err(Error::Empty);
        }

        let frame: Vec<Value> =
            serde_json::from_str(msg).map_err(|_| Error::decode("not a json array"))?;

        let Some(kind) = frame.first().and_then(Value::as_str) else {
            return Err(Error::decode("missing message type"));
        };

        match (kind, &frame[1..]) {
            // ["EVENT", <subscription id>, <event JSON>]
            ("EVENT", [Value::String(sub_id), note]) => {
                let note = serde_json::from_value(note.clone())
                    .map_err(|e| Error::decode(format!("bad event: {e}")))?;
                Ok(RelayMessage::Event {
                    sub_id: sub_id.clone(),
                    note,
                })
            }
            ("EVENT", _) => Err(Error::decode("Invalid EVENT format")),

            // ["EOSE", <subscription_id>]
            ("EOSE", [Value::String(sub_id)]) => Ok(Self::eose(sub_id.as_str())),
            ("EOSE", _) => Err(Error::decode("Invalid subscription ID or format")),

            // ["CLOSED", <subscription_id>, <message>]
            ("CLOSED", [Value::String(sub_id)]) => Ok(Self::closed(sub_id.as_str(), "")),
            ("CLOSED", [Value::String(sub_id), Value::String(reason), ..]) => {
                Ok(Self::closed(sub_id.as_str(), reason.as_str()))
            }
            ("CLOSED", _) => Err(Error::decode("Invalid CLOSED format")),

            // ["NOTICE", <message>]
            ("NOTICE", [Value::String(notice)]) => Ok(Self::notice(notice.as_str())),
            ("NOTICE", _) => Err(Error::decode("Invalid NOTICE format")),

            // ["OK", <event_id>, <true|false>, <message>]
            ("OK", [Value::String(event_id), accepted, rest @ ..]) => {
                let Some(accepted) = accepted.as_bool() else {
                    return Err(Error::decode("bad boolean value"));
                };
                let message = rest.first().and_then(Value::as_str).unwrap_or_default();
                Ok(Self::ok(event_id.as_str(), accepted, message))
            }
            ("OK", _) => Err(Error::decode("Invalid OK format")),

            // ["AUTH", <challenge>]
            ("AUTH", [Value::String(challenge), ..]) => {
                Ok(RelayMessage::Auth(challenge.clone()))
            }
            ("AUTH", _) => Err(Error::decode("Invalid AUTH format")),

            (other, _) => Err(Error::decode(format!(
                "unrecognized message type: '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NoteId;

    const EVENT_ID: &str = "b1a649ebe8b435ec71d3784793f3bbf4b93e64e17568a741aecd4c7ddeafce30";

    #[test]
    fn test_handle_various_messages() -> Result<()> {
        let tests = vec![
            // Valid cases
            (r#"["EOSE","x"]"#, Ok(RelayMessage::eose("x"))),
            (r#"["NOTICE",""]"#, Ok(RelayMessage::notice(""))),
            (
                r#"["NOTICE","Invalid event format!"]"#,
                Ok(RelayMessage::notice("Invalid event format!")),
            ),
            (
                r#"["EOSE", "random-subscription-id" ]"#,
                Ok(RelayMessage::eose("random-subscription-id")),
            ),
            (
                r#"["CLOSED","sub","auth-required: sign in first"]"#,
                Ok(RelayMessage::closed("sub", "auth-required: sign in first")),
            ),
            (r#"["CLOSED","sub"]"#, Ok(RelayMessage::closed("sub", ""))),
            (
                r#"["AUTH","challenge-string"]"#,
                Ok(RelayMessage::Auth("challenge-string".into())),
            ),
            (
                r#"["OK","b1a649ebe8b435ec71d3784793f3bbf4b93e64e17568a741aecd4c7ddeafce30",true,"pow: difficulty 25>=24"]"#,
                Ok(RelayMessage::ok(EVENT_ID, true, "pow: difficulty 25>=24")),
            ),
            // Invalid cases
            (r#""#, Err(Error::Empty)),
            (
                r#"["EVENT","random_string"]"#,
                Err(Error::decode("Invalid EVENT format")),
            ),
            (
                r#"["EOSE"]"#,
                Err(Error::decode("Invalid subscription ID or format")),
            ),
            (r#"["NOTICE": 404]"#, Err(Error::decode("not a json array"))),
            (
                r#"["OK","b1a649ebe8b435ec71d3784793f3bbf4b93e64e17568a741aecd4c7ddeafce30",hello,""]"#,
                Err(Error::decode("not a json array")),
            ),
            (
                r#"["OK","b1a649ebe8b435ec71d3784793f3bbf4b93e64e17568a741aecd4c7ddeafce30","yes",""]"#,
                Err(Error::decode("bad boolean value")),
            ),
            (
                r#"["COUNT","sub",{"count":1}]"#,
                Err(Error::decode("unrecognized message type: 'COUNT'")),
            ),
        ];

        for (input, expected) in tests {
            match expected {
                Ok(expected_msg) => {
                    let result = RelayMessage::from_json(input);
                    assert_eq!(
                        result?, expected_msg,
                        "Expected {:?} for input: {}",
                        expected_msg, input
                    );
                }
                Err(expected_err) => {
                    let result = RelayMessage::from_json(input);
                    assert!(
                        matches!(result, Err(ref e) if *e.to_string() == expected_err.to_string()),
                        "Expected error {:?} for input: {}, but got: {:?}",
                        expected_err,
                        input,
                        result
                    );
                }
            }
        }

        Ok(())
    }

    #[test]
    fn event_message_carries_parsed_note() -> Result<()> {
        let raw = format!(
            r#"["EVENT","feed-abc12",{{"id":"{EVENT_ID}","pubkey":"aa","created_at":5,"kind":1,"tags":[],"content":"hi","sig":"bb"}}]"#
        );

        let RelayMessage::Event { sub_id, note } = RelayMessage::from_json(&raw)? else {
            panic!("expected an event");
        };
        assert_eq!(sub_id, "feed-abc12");
        assert_eq!(note.id, NoteId::from_hex(EVENT_ID)?);
        assert_eq!(note.content, "hi");
        Ok(())
    }

    #[test]
    fn event_with_malformed_note_is_rejected() {
        let raw = r#"["EVENT","sub",{"id":"nothex"}]"#;
        assert!(matches!(
            RelayMessage::from_json(raw),
            Err(Error::DecodeFailed(_))
        ));
    }
}
