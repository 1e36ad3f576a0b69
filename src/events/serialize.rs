//! Event envelope
//!
//! Wraps every dispatched gateway event with the shard it came from, its
//! sequence number and the ids downstream consumers route on.

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// Generic gateway event payload
#[derive(Debug, Clone, Serialize)]
pub struct GatewayEvent {
    pub event_id: String,
    /// Raw dispatch name, e.g. `GUILD_MEMBER_ADD`
    pub event_name: String,
    /// Routing label, e.g. `member.join`
    pub event_type: String,
    pub shard_id: u32,
    pub sequence: u64,
    pub timestamp: u64,
    pub guild_id: Option<String>,
    pub channel_id: Option<String>,
    pub user_id: Option<String>,
    pub data: Value,
}

impl GatewayEvent {
    /// Build the envelope for one dispatch
    pub fn from_dispatch(shard_id: u32, sequence: u64, event_name: &str, data: Value) -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default();

        Self {
            event_id: Uuid::new_v4().to_string(),
            event_name: event_name.to_string(),
            event_type: event_type(event_name),
            shard_id,
            sequence,
            timestamp,
            guild_id: guild_id(event_name, &data),
            channel_id: string_field(&data, &["channel_id"]),
            user_id: user_id(event_name, &data),
            data,
        }
    }
}

/// Routing label for a dispatch name
pub fn event_type(event_name: &str) -> String {
    let label = match event_name {
        "GUILD_CREATE" => "guild.join",
        "GUILD_DELETE" => "guild.leave",
        "GUILD_UPDATE" => "guild.update",
        "GUILD_MEMBER_ADD" => "member.join",
        "GUILD_MEMBER_REMOVE" => "member.leave",
        "GUILD_MEMBER_UPDATE" => "member.update",
        "INTERACTION_CREATE" => "interaction.create",
        "READY" => "session.ready",
        "RESUMED" => "session.resumed",
        other => return other.to_ascii_lowercase().replacen('_', ".", 1),
    };
    label.to_string()
}

fn guild_id(event_name: &str, data: &Value) -> Option<String> {
    match event_name {
        "GUILD_CREATE" | "GUILD_UPDATE" | "GUILD_DELETE" => {
            string_field(data, &["id"]).or_else(|| string_field(data, &["guild_id"]))
        }
        _ => string_field(data, &["guild_id"]),
    }
}

fn user_id(event_name: &str, data: &Value) -> Option<String> {
    match event_name {
        "MESSAGE_CREATE" | "MESSAGE_UPDATE" => string_field(data, &["author", "id"]),
        "INTERACTION_CREATE" => string_field(data, &["member", "user", "id"])
            .or_else(|| string_field(data, &["user", "id"])),
        _ => string_field(data, &["user", "id"]).or_else(|| string_field(data, &["user_id"])),
    }
}

fn string_field(data: &Value, path: &[&str]) -> Option<String> {
    let mut current = data;
    for key in path {
        current = current.get(key)?;
    }
    current.as_str().map(str::to_owned)
}
