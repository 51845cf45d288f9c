use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fieldless tag for an event payload. Connector capability sets and matcher
/// gating work on kinds, never on full payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    Edited,
    Reply,
    Reaction,
    File,
    JoinRoom,
    RoomName,
    RoomDescription,
    RoomAvatar,
    Transport,
    State,
    Started,
    Tick,
    Webhook,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Message => "message",
            EventKind::Edited => "edited",
            EventKind::Reply => "reply",
            EventKind::Reaction => "reaction",
            EventKind::File => "file",
            EventKind::JoinRoom => "join_room",
            EventKind::RoomName => "room_name",
            EventKind::RoomDescription => "room_description",
            EventKind::RoomAvatar => "room_avatar",
            EventKind::Transport => "transport",
            EventKind::State => "state",
            EventKind::Started => "started",
            EventKind::Tick => "tick",
            EventKind::Webhook => "webhook",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    Message { text: String },
    Edited { text: String, linked: Uuid },
    Reply { text: String, linked: Uuid },
    Reaction { emoji: String, linked: Uuid },
    File { url: Option<String>, name: Option<String> },
    JoinRoom,
    RoomName { name: String },
    RoomDescription { description: String },
    RoomAvatar { url: String },
    /// Open-ended transport-specific event.
    Transport { transport_type: String, payload: serde_json::Value },
    /// Open-ended state-like event.
    State { key: String, value: serde_json::Value },
    /// Emitted once when the runtime enters Running.
    Started,
    /// Synthetic event a crontab fire delivers to its skill.
    Tick { fired_at: DateTime<Utc> },
    /// Synthetic event a webhook call delivers to its skill.
    Webhook { name: String, body: serde_json::Value },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Message { .. } => EventKind::Message,
            EventPayload::Edited { .. } => EventKind::Edited,
            EventPayload::Reply { .. } => EventKind::Reply,
            EventPayload::Reaction { .. } => EventKind::Reaction,
            EventPayload::File { .. } => EventKind::File,
            EventPayload::JoinRoom => EventKind::JoinRoom,
            EventPayload::RoomName { .. } => EventKind::RoomName,
            EventPayload::RoomDescription { .. } => EventKind::RoomDescription,
            EventPayload::RoomAvatar { .. } => EventKind::RoomAvatar,
            EventPayload::Transport { .. } => EventKind::Transport,
            EventPayload::State { .. } => EventKind::State,
            EventPayload::Started => EventKind::Started,
            EventPayload::Tick { .. } => EventKind::Tick,
            EventPayload::Webhook { .. } => EventKind::Webhook,
        }
    }
}

/// An immutable record of something that happened on a transport.
///
/// The envelope (connector, target, user, raw, timestamp, id) is shared by
/// every payload variant. The core never rewrites `payload` or `raw`;
/// matchers annotate `entities` on a cloned event attached to the candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    /// Name of the originating connector. Synthetic events use "cron" for
    /// scheduler ticks and the default connector for webhook/startup events.
    pub connector: String,
    /// Room / chat / channel identifier on the transport.
    pub target: String,
    pub user: String,
    pub user_id: String,
    pub created: DateTime<Utc>,
    /// Opaque transport payload for parsers that need transport specifics.
    #[serde(default)]
    pub raw: serde_json::Value,
    /// Derived annotations: regex groups, parse fields, NLU slots, mentions.
    #[serde(default)]
    pub entities: BTreeMap<String, serde_json::Value>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(connector: &str, target: &str, user: &str, user_id: &str, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            connector: connector.to_string(),
            target: target.to_string(),
            user: user.to_string(),
            user_id: user_id.to_string(),
            created: Utc::now(),
            raw: serde_json::Value::Null,
            entities: BTreeMap::new(),
            payload,
        }
    }

    pub fn message(connector: &str, target: &str, user: &str, text: &str) -> Self {
        Self::new(
            connector,
            target,
            user,
            user,
            EventPayload::Message { text: text.to_string() },
        )
    }

    pub fn started(connector: &str) -> Self {
        Self::new(connector, "", "", "", EventPayload::Started)
    }

    pub fn tick(fired_at: DateTime<Utc>) -> Self {
        Self::new("cron", "", "cron", "cron", EventPayload::Tick { fired_at })
    }

    pub fn webhook(connector: &str, name: &str, body: serde_json::Value) -> Self {
        Self::new(
            connector,
            "",
            "webhook",
            "webhook",
            EventPayload::Webhook { name: name.to_string(), body },
        )
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Text carried by Message/Edited/Reply payloads.
    pub fn text(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::Message { text }
            | EventPayload::Edited { text, .. }
            | EventPayload::Reply { text, .. } => Some(text),
            _ => None,
        }
    }

    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw = raw;
        self
    }

    pub fn with_entity(mut self, key: &str, value: serde_json::Value) -> Self {
        self.entities.insert(key.to_string(), value);
        self
    }

    /// A plain Message back to this event's target on its connector.
    pub fn response(&self, text: &str) -> Event {
        Event::new(
            &self.connector,
            &self.target,
            &self.user,
            &self.user_id,
            EventPayload::Message { text: text.to_string() },
        )
    }

    /// A threaded Reply linking back to this event's id.
    pub fn reply(&self, text: &str) -> Event {
        Event::new(
            &self.connector,
            &self.target,
            &self.user,
            &self.user_id,
            EventPayload::Reply { text: text.to_string(), linked: self.id },
        )
    }

    pub fn reaction(&self, emoji: &str) -> Event {
        Event::new(
            &self.connector,
            &self.target,
            &self.user,
            &self.user_id,
            EventPayload::Reaction { emoji: emoji.to_string(), linked: self.id },
        )
    }
}
