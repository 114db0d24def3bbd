//! Envelope wire format
//!
//! Every routed message travels over the link as
//!
//! ```json
//! { "wtfork": { "child_id": "<id>", "channel": "<name>", "data": <any> } }
//! ```
//!
//! `data` is omitted when a message carries no payload. Anything without the top-level
//! `wtfork` key belongs to some other protocol and is left alone.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ChildId;

/// Top-level key that marks a message as a routed envelope
pub const PROTOCOL_MARKER: &str = "wtfork";

/// Name of the channel a child announces itself on once its router is live
pub const CHILD_READY_CHANNEL: &str = "wtfork:child_ready";

/// Channel a message is routed on
///
/// The protocol's own control channel is a distinct case; everything else is an
/// application-defined name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Channel {
    /// `wtfork:child_ready`, sent once by a child when its router is installed
    ChildReady,
    /// Application-defined channel
    Named(String),
}

impl Channel {
    /// Name of the channel as it appears on the wire
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::ChildReady => CHILD_READY_CHANNEL,
            Self::Named(name) => name,
        }
    }
}

impl From<String> for Channel {
    fn from(name: String) -> Self {
        if name == CHILD_READY_CHANNEL {
            Self::ChildReady
        } else {
            Self::Named(name)
        }
    }
}

impl From<&str> for Channel {
    fn from(name: &str) -> Self {
        Self::from(name.to_string())
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        match channel {
            Channel::ChildReady => CHILD_READY_CHANNEL.into(),
            Channel::Named(name) => name,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message routed to or from a specific child
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Child the message is bound to
    pub child_id: ChildId,
    /// Channel the message should be dispatched on
    pub channel: Channel,
    /// Payload, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Top-level shape of a routed message
#[derive(Serialize)]
struct Wire<'a> {
    /// The wrapped envelope
    wtfork: &'a Envelope,
}

impl Envelope {
    /// Create a new [`Envelope`]
    pub fn new(
        child_id: impl Into<ChildId>,
        channel: impl Into<Channel>,
        data: Option<Value>,
    ) -> Self {
        Self {
            child_id: child_id.into(),
            channel: channel.into(),
            data,
        }
    }

    /// Wrap this envelope into the message that goes over the wire
    pub fn to_message(&self) -> serde_json::Result<Value> {
        serde_json::to_value(Wire { wtfork: self })
    }

    /// Extract an envelope from a raw message
    ///
    /// Returns `None` if the message has no protocol marker or the marker's value is not
    /// a well-formed envelope.
    #[must_use]
    pub fn from_message(message: &Value) -> Option<Self> {
        let inner = message.get(PROTOCOL_MARKER)?;
        Self::deserialize(inner).ok()
    }

    /// Extract the channel and payload of a raw message, if it is bound to `child_id`
    ///
    /// A missing (or `null`) payload is replaced with an empty object.
    #[must_use]
    pub fn open(message: &Value, child_id: &str) -> Option<(Channel, Value)> {
        let envelope = Self::from_message(message)?;
        if envelope.child_id != child_id {
            return None;
        }
        let data = envelope.data.unwrap_or_else(|| Value::Object(Map::new()));
        Some((envelope.channel, data))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn message_has_the_expected_wire_shape() {
        let message = Envelope::new("abc", "work", Some(json!({ "n": 1 })))
            .to_message()
            .expect("envelope should serialize");
        assert_eq!(
            message,
            json!({ "wtfork": { "child_id": "abc", "channel": "work", "data": { "n": 1 } } })
        );
    }

    #[test]
    fn absent_payload_is_omitted_on_the_wire() {
        let message = Envelope::new("abc", "work", None)
            .to_message()
            .expect("envelope should serialize");
        assert_eq!(
            message,
            json!({ "wtfork": { "child_id": "abc", "channel": "work" } })
        );
    }

    #[test]
    fn ready_channel_uses_reserved_name() {
        let message = Envelope::new("abc", Channel::ChildReady, Some(json!("abc")))
            .to_message()
            .expect("envelope should serialize");
        assert_eq!(message["wtfork"]["channel"], json!("wtfork:child_ready"));

        let (channel, data) = Envelope::open(&message, "abc").expect("should open");
        assert_eq!(channel, Channel::ChildReady);
        assert_eq!(data, json!("abc"));
    }

    #[test]
    fn reserved_name_parses_into_ready_variant() {
        assert_eq!(Channel::from("wtfork:child_ready"), Channel::ChildReady);
        assert_eq!(Channel::from("ready"), Channel::Named("ready".into()));
        assert_eq!(Channel::ChildReady.to_string(), CHILD_READY_CHANNEL);
    }

    #[test]
    fn open_substitutes_empty_object_for_missing_or_null_data() {
        let missing = json!({ "wtfork": { "child_id": "abc", "channel": "x" } });
        let null = json!({ "wtfork": { "child_id": "abc", "channel": "x", "data": null } });
        for message in [missing, null] {
            let (_, data) = Envelope::open(&message, "abc").expect("should open");
            assert_eq!(data, json!({}));
        }
    }

    #[test]
    fn open_keeps_falsy_payloads() {
        let message = json!({ "wtfork": { "child_id": "abc", "channel": "x", "data": false } });
        let (_, data) = Envelope::open(&message, "abc").expect("should open");
        assert_eq!(data, json!(false));
    }

    #[test]
    fn open_rejects_other_children() {
        let message = json!({ "wtfork": { "child_id": "abc", "channel": "x", "data": 1 } });
        assert!(Envelope::open(&message, "def").is_none());
    }

    #[test]
    fn open_ignores_foreign_and_malformed_messages() {
        for message in [
            json!({ "other": { "child_id": "abc", "channel": "x" } }),
            json!({ "wtfork": { "channel": "x" } }),
            json!({ "wtfork": "abc" }),
            json!("plain string"),
            json!(null),
        ] {
            assert!(Envelope::open(&message, "abc").is_none(), "{message} should be ignored");
        }
    }
}
