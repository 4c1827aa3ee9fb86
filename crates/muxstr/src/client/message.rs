use crate::{Error, Filter, Note};
use serde_json::{json, Value};

/// Messages sent by clients, received by relays
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Event(Note),
    Req { sub_id: String, filters: Vec<Filter> },
    Close { sub_id: String },
    /// NIP-42 authentication response, a signed kind 22242 note
    Auth(Note),
    Raw(String),
}

impl ClientMessage {
    pub fn event(note: Note) -> Self {
        ClientMessage::Event(note)
    }

    pub fn raw(raw: String) -> Self {
        ClientMessage::Raw(raw)
    }

    pub fn req(sub_id: impl Into<String>, filters: Vec<Filter>) -> Self {
        ClientMessage::Req {
            sub_id: sub_id.into(),
            filters,
        }
    }

    pub fn close(sub_id: impl Into<String>) -> Self {
        ClientMessage::Close {
            sub_id: sub_id.into(),
        }
    }

    pub fn auth(note: Note) -> Self {
        ClientMessage::Auth(note)
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(match self {
            Self::Event(note) => json!(["EVENT", note]).to_string(),
            Self::Auth(note) => json!(["AUTH", note]).to_string(),
            Self::Raw(raw) => raw.clone(),
            Self::Req { sub_id, filters } => {
                let mut frame = Vec::with_capacity(filters.len() + 2);
                frame.push(Value::from("REQ"));
                frame.push(Value::from(sub_id.as_str()));
                if filters.is_empty() {
                    frame.push(json!({}));
                }
                for filter in filters {
                    frame.push(serde_json::to_value(filter)?);
                }
                Value::Array(frame).to_string()
            }
            Self::Close { sub_id } => json!(["CLOSE", sub_id]).to_string(),
        })
    }
}
