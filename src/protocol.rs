use crate::error::{Result, TeamError};
use crate::index::SkillEntry;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Wire name of an event. Names we do not know survive as `Unknown`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    Auth,
    AuthResult,
    Ping,
    Pong,
    MemberJoined,
    MemberLeft,
    MemberOnline,
    MemberOffline,
    SkillPublished,
    SkillUpdated,
    SkillDeleted,
    TeamDissolved,
    ProjectConfigUpdated,
    SessionShared,
    SessionCommentAdded,
    DailySummaryShared,
    MemberStatusChanged,
    CodeShared,
    SyncRequest,
    SyncResponse,
    Unknown(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::Auth => "auth",
            EventType::AuthResult => "auth_result",
            EventType::Ping => "ping",
            EventType::Pong => "pong",
            EventType::MemberJoined => "member_joined",
            EventType::MemberLeft => "member_left",
            EventType::MemberOnline => "member_online",
            EventType::MemberOffline => "member_offline",
            EventType::SkillPublished => "skill_published",
            EventType::SkillUpdated => "skill_updated",
            EventType::SkillDeleted => "skill_deleted",
            EventType::TeamDissolved => "team_dissolved",
            EventType::ProjectConfigUpdated => "project_config_updated",
            EventType::SessionShared => "session_shared",
            EventType::SessionCommentAdded => "session_comment_added",
            EventType::DailySummaryShared => "daily_summary_shared",
            EventType::MemberStatusChanged => "member_status_changed",
            EventType::CodeShared => "code_shared",
            EventType::SyncRequest => "sync_request",
            EventType::SyncResponse => "sync_response",
            EventType::Unknown(name) => name,
        }
    }

    /// Collaboration events a leader relays from one member to the rest.
    pub fn is_relayed(&self) -> bool {
        matches!(
            self,
            EventType::MemberStatusChanged
                | EventType::DailySummaryShared
                | EventType::SessionShared
                | EventType::SessionCommentAdded
                | EventType::CodeShared
        )
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "auth" => EventType::Auth,
            "auth_result" => EventType::AuthResult,
            "ping" => EventType::Ping,
            "pong" => EventType::Pong,
            "member_joined" => EventType::MemberJoined,
            "member_left" => EventType::MemberLeft,
            "member_online" => EventType::MemberOnline,
            "member_offline" => EventType::MemberOffline,
            "skill_published" => EventType::SkillPublished,
            "skill_updated" => EventType::SkillUpdated,
            "skill_deleted" => EventType::SkillDeleted,
            "team_dissolved" => EventType::TeamDissolved,
            "project_config_updated" => EventType::ProjectConfigUpdated,
            "session_shared" => EventType::SessionShared,
            "session_comment_added" => EventType::SessionCommentAdded,
            "daily_summary_shared" => EventType::DailySummaryShared,
            "member_status_changed" => EventType::MemberStatusChanged,
            "code_shared" => EventType::CodeShared,
            "sync_request" => EventType::SyncRequest,
            "sync_response" => EventType::SyncResponse,
            _ => EventType::Unknown(s),
        }
    }
}

impl From<EventType> for String {
    fn from(t: EventType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One frame on a team connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventType,
    #[serde(default)]
    pub team_id: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
}

impl Event {
    pub fn new<P: Serialize>(kind: EventType, team_id: &str, payload: &P) -> Result<Self> {
        Ok(Self {
            kind,
            team_id: team_id.to_string(),
            timestamp: Utc::now(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// An event without a payload (ping, pong).
    pub fn bare(kind: EventType, team_id: &str) -> Self {
        Self {
            kind,
            team_id: team_id.to_string(),
            timestamp: Utc::now(),
            payload: Value::Null,
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| TeamError::MalformedPayload(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn parse_payload<P: DeserializeOwned>(&self) -> Result<P> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| TeamError::MalformedPayload(format!("{}: {}", self.kind, e)))
    }

    /// Decodes the payload according to the event type.
    pub fn decode(&self) -> Result<EventBody> {
        Ok(match &self.kind {
            EventType::Auth => EventBody::Auth(self.parse_payload()?),
            EventType::AuthResult => EventBody::AuthResult(self.parse_payload()?),
            EventType::Ping => EventBody::Ping,
            EventType::Pong => EventBody::Pong,
            EventType::MemberJoined => EventBody::MemberJoined(self.parse_payload()?),
            EventType::MemberLeft => EventBody::MemberLeft(self.parse_payload()?),
            EventType::MemberOnline => EventBody::MemberOnline(self.parse_payload()?),
            EventType::MemberOffline => EventBody::MemberOffline(self.parse_payload()?),
            EventType::SkillPublished => EventBody::SkillPublished(self.parse_payload()?),
            EventType::SkillUpdated => EventBody::SkillUpdated(self.parse_payload()?),
            EventType::SkillDeleted => EventBody::SkillDeleted(self.parse_payload()?),
            EventType::TeamDissolved => EventBody::TeamDissolved(self.parse_payload()?),
            EventType::ProjectConfigUpdated => {
                EventBody::ProjectConfigUpdated(self.parse_payload()?)
            }
            EventType::DailySummaryShared => EventBody::DailySummaryShared(self.parse_payload()?),
            EventType::MemberStatusChanged => {
                EventBody::MemberStatusChanged(self.parse_payload()?)
            }
            EventType::SessionShared
            | EventType::SessionCommentAdded
            | EventType::CodeShared
            | EventType::SyncRequest
            | EventType::SyncResponse => EventBody::Opaque(self.kind.clone(), self.payload.clone()),
            EventType::Unknown(name) => EventBody::Unknown(name.clone()),
        })
    }
}

/// Typed view of an event payload.
#[derive(Debug, Clone, PartialEq)]
pub enum EventBody {
    Auth(AuthPayload),
    AuthResult(AuthResultPayload),
    Ping,
    Pong,
    MemberJoined(MemberJoinedPayload),
    MemberLeft(MemberLeftPayload),
    MemberOnline(MemberStatusPayload),
    MemberOffline(MemberStatusPayload),
    SkillPublished(SkillEntry),
    SkillUpdated(SkillUpdatedPayload),
    SkillDeleted(SkillDeletedPayload),
    TeamDissolved(TeamDissolvedPayload),
    ProjectConfigUpdated(ProjectConfigPayload),
    DailySummaryShared(DailySummaryPayload),
    MemberStatusChanged(MemberWorkStatusPayload),
    /// Known type whose payload belongs to another subsystem.
    Opaque(EventType, Value),
    Unknown(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthPayload {
    pub member_id: String,
    pub member_name: String,
    #[serde(default)]
    pub endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthResultPayload {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemberJoinedPayload {
    pub member_id: String,
    pub member_name: String,
    pub endpoint: String,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemberLeftPayload {
    pub member_id: String,
    pub member_name: String,
    pub left_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemberStatusPayload {
    pub member_id: String,
    pub member_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub endpoint: String,
    pub is_online: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SkillUpdatedPayload {
    pub plugin_id: String,
    pub version: String,
    pub checksum: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SkillDeletedPayload {
    pub plugin_id: String,
    pub deleted_by: String,
    pub deleted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TeamDissolvedPayload {
    pub team_id: String,
    pub team_name: String,
    pub dissolved_by: String,
    pub dissolved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectRef {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub repo_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectConfigPayload {
    pub projects: Vec<ProjectRef>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DailySummaryPayload {
    pub member_id: String,
    pub member_name: String,
    pub date: String,
    pub total_sessions: u32,
    pub project_count: u32,
    pub shared_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemberWorkStatusPayload {
    pub member_id: String,
    pub member_name: String,
    #[serde(default)]
    pub project_name: String,
    #[serde(default)]
    pub current_file: String,
    pub last_active_at: DateTime<Utc>,
    #[serde(default)]
    pub status_visible: bool,
}
