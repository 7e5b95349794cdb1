//! Activity envelope
//!
//! The engine treats activities as opaque, immutable messages owned by the
//! channel transport. Only the correlation fields the turn needs are modeled.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of activity
///
/// Serialized as the wire string; types the engine does not interpret are
/// kept as `Unknown` instead of failing deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(from = "String", into = "String")]
pub enum ActivityType {
    #[default]
    Message,
    ConversationUpdate,
    Event,
    EndOfConversation,
    Typing,
    Unknown(String),
}

impl ActivityType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Message => "message",
            Self::ConversationUpdate => "conversationUpdate",
            Self::Event => "event",
            Self::EndOfConversation => "endOfConversation",
            Self::Typing => "typing",
            Self::Unknown(other) => other,
        }
    }
}

impl From<String> for ActivityType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "message" => Self::Message,
            "conversationUpdate" => Self::ConversationUpdate,
            "event" => Self::Event,
            "endOfConversation" => Self::EndOfConversation,
            "typing" => Self::Typing,
            _ => Self::Unknown(value),
        }
    }
}

impl From<ActivityType> for String {
    fn from(value: ActivityType) -> Self {
        value.as_str().to_string()
    }
}

/// A user or bot account on a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ChannelAccount {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChannelAccount {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }
}

/// The conversation an activity belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ConversationAccount {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ConversationAccount {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }
}

/// Inbound or outbound message envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    #[serde(rename = "type", default)]
    pub activity_type: ActivityType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub channel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<ChannelAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<ChannelAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<ConversationAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
}

impl Activity {
    /// Build a message activity with only text set
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            activity_type: ActivityType::Message,
            text: Some(text.into()),
            ..Self::default()
        }
    }

    /// Build a named event activity
    pub fn event(name: impl Into<String>, value: Option<Value>) -> Self {
        Self {
            activity_type: ActivityType::Event,
            name: Some(name.into()),
            value,
            ..Self::default()
        }
    }

    pub fn is_message(&self) -> bool {
        self.activity_type == ActivityType::Message
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation
            .as_ref()
            .map(|c| c.id.as_str())
            .filter(|id| !id.is_empty())
    }

    pub fn from_id(&self) -> Option<&str> {
        self.from
            .as_ref()
            .map(|a| a.id.as_str())
            .filter(|id| !id.is_empty())
    }

    pub fn channel(&self) -> Option<&str> {
        Some(self.channel_id.as_str()).filter(|id| !id.is_empty())
    }

    /// Stamp an outbound activity with this (inbound) activity's conversation
    /// reference: same channel and conversation, swapped from/recipient.
    ///
    /// Fields the outbound activity already carries are left alone.
    pub fn apply_reference_to(&self, outbound: &mut Activity) {
        if outbound.channel_id.is_empty() {
            outbound.channel_id.clone_from(&self.channel_id);
        }
        if outbound.conversation.is_none() {
            outbound.conversation.clone_from(&self.conversation);
        }
        if outbound.from.is_none() {
            outbound.from.clone_from(&self.recipient);
        }
        if outbound.recipient.is_none() {
            outbound.recipient.clone_from(&self.from);
        }
        if outbound.reply_to_id.is_none() {
            outbound.reply_to_id.clone_from(&self.id);
        }
    }
}
