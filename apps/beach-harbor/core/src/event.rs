use std::fmt;

use serde::{Deserialize, Serialize};

use crate::room::RoomName;

/// Membership operations the upstream confirms and the rectifier issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MembershipOp {
    Join,
    Part,
}

impl MembershipOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipOp::Join => "JOIN",
            MembershipOp::Part => "PART",
        }
    }

    pub fn from_command(command: &str) -> Option<Self> {
        match command {
            "JOIN" => Some(MembershipOp::Join),
            "PART" => Some(MembershipOp::Part),
            _ => None,
        }
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            MembershipOp::Join => "join",
            MembershipOp::Part => "part",
        }
    }
}

impl fmt::Display for MembershipOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chat line posted to a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(rename = "UserID")]
    pub user_id: String,
    #[serde(rename = "UserLogin")]
    pub user_login: String,
    #[serde(rename = "ChannelID")]
    pub channel_id: String,
    #[serde(rename = "ChannelLogin")]
    pub channel_login: String,
    #[serde(rename = "Text")]
    pub text: String,
}

/// The local account joined or left a room. Doubles as the membership signal
/// handed to the rectifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipChange {
    #[serde(rename = "Op")]
    pub op: MembershipOp,
    #[serde(rename = "Channel")]
    pub channel: RoomName,
}

/// Events exported to the downstream sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypedEvent {
    ChatMessage(ChatMessage),
    MembershipChange(MembershipChange),
}

impl TypedEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            TypedEvent::ChatMessage(_) => "privmsg",
            TypedEvent::MembershipChange(_) => "membership",
        }
    }

    /// Partition key: rooms keep their events ordered downstream.
    pub fn routing_key(&self) -> &str {
        match self {
            TypedEvent::ChatMessage(msg) => &msg.channel_id,
            TypedEvent::MembershipChange(change) => change.channel.as_str(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            TypedEvent::ChatMessage(msg) => serde_json::to_vec(msg),
            TypedEvent::MembershipChange(change) => serde_json::to_vec(change),
        }
    }
}

impl From<ChatMessage> for TypedEvent {
    fn from(msg: ChatMessage) -> Self {
        TypedEvent::ChatMessage(msg)
    }
}

impl From<MembershipChange> for TypedEvent {
    fn from(change: MembershipChange) -> Self {
        TypedEvent::MembershipChange(change)
    }
}
