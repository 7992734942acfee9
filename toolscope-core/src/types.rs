//! Core domain types for toolscope
//!
//! These types represent the canonical relational model the ingest pipeline
//! normalizes client payloads into.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Event** | One telemetry fact emitted by a client instance |
//! | **Org** | A server installation, keyed by its `server_id` string |
//! | **Team** | A named group that orgs (and thus events) are assigned to |
//! | **Logical session** | Physical session ids merged by the 4-hour rule on shared (user, org) |
//! | **Person** | A directory entry owning one or more telemetry usernames |
//! | **SystemUser** | An operator account of the service itself, unrelated to telemetry user ids |
//! | **Trash** | Soft-deleted events, invisible to default reads until recovered or purged |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================
// Event enums
// ============================================

/// The canonical event types, seeded once into `event_types`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ToolCall,
    ToolError,
    SessionStart,
    SessionEnd,
    Error,
    Custom,
}

/// All canonical event type names, in seeding order.
pub const CANONICAL_EVENT_TYPES: [EventType; 6] = [
    EventType::ToolCall,
    EventType::ToolError,
    EventType::SessionStart,
    EventType::SessionEnd,
    EventType::Error,
    EventType::Custom,
];

impl EventType {
    /// Returns the identifier used in database storage
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ToolCall => "tool_call",
            EventType::ToolError => "tool_error",
            EventType::SessionStart => "session_start",
            EventType::SessionEnd => "session_end",
            EventType::Error => "error",
            EventType::Custom => "custom",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tool_call" => Ok(EventType::ToolCall),
            "tool_error" => Ok(EventType::ToolError),
            "session_start" => Ok(EventType::SessionStart),
            "session_end" => Ok(EventType::SessionEnd),
            "error" => Ok(EventType::Error),
            "custom" => Ok(EventType::Custom),
            _ => Err(format!("unknown event type: {}", s)),
        }
    }
}

/// Broad classification of an event, carried on every row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Area {
    Tool,
    Session,
    General,
}

impl Area {
    pub fn as_str(&self) -> &'static str {
        match self {
            Area::Tool => "tool",
            Area::Session => "session",
            Area::General => "general",
        }
    }

    /// The default area for an event type when the payload does not carry one.
    pub fn for_event_type(event_type: EventType) -> Self {
        match event_type {
            EventType::ToolCall | EventType::ToolError => Area::Tool,
            EventType::SessionStart | EventType::SessionEnd => Area::Session,
            EventType::Error | EventType::Custom => Area::General,
        }
    }
}

impl std::fmt::Display for Area {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Area {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tool" => Ok(Area::Tool),
            "session" => Ok(Area::Session),
            "general" => Ok(Area::General),
            _ => Err(format!("unknown area: {}", s)),
        }
    }
}

/// Operator account roles, ordered by privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Basic,
    Advanced,
    Administrator,
    God,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Basic => "basic",
            Role::Advanced => "advanced",
            Role::Administrator => "administrator",
            Role::God => "god",
        }
    }

    /// Case-insensitive parse; anything unrecognized normalizes to `basic`.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "advanced" => Role::Advanced,
            "administrator" => Role::Administrator,
            "god" => Role::God,
            _ => Role::Basic,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================
// Events
// ============================================

/// Denormalized fields lifted from the raw payload onto the fact row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Denormalized {
    pub org_id: Option<String>,
    pub user_name: Option<String>,
    pub tool_name: Option<String>,
    pub company_name: Option<String>,
    pub error_message: Option<String>,
}

/// A canonical event produced by the parser, before persistence.
///
/// `raw` preserves the payload bit-for-bit for audit; `data` is the parsed
/// tree the extractors navigated.
#[derive(Debug, Clone)]
pub struct ParsedEvent {
    pub event_type: EventType,
    /// The raw v1 `event` name as received, before canonical mapping.
    /// Non-canonical names (e.g. `server_boot`) survive here.
    pub raw_event_name: Option<String>,
    pub area: Area,
    pub timestamp: DateTime<Utc>,
    pub server_id: Option<String>,
    pub version: Option<String>,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub success: bool,
    pub schema_version: i32,
    pub denormalized: Denormalized,
    /// Parsed payload tree (always a JSON object)
    pub data: serde_json::Value,
    /// Payload exactly as received
    pub raw: String,
}

/// A persisted telemetry event (fact row).
///
/// Immutable once written except for `deleted_at` and backfilled
/// denormalized columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub id: i64,
    pub event_type: EventType,
    pub area: Area,
    pub timestamp: DateTime<Utc>,
    pub server_id: Option<String>,
    pub version: Option<String>,
    pub session_id: Option<String>,
    /// Logical parent session; null only when `session_id` is null
    pub parent_session_id: Option<String>,
    pub user_id: Option<String>,
    pub data: serde_json::Value,
    pub received_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub org_id: Option<String>,
    pub user_name: Option<String>,
    pub tool_name: Option<String>,
    pub company_name: Option<String>,
    pub error_message: Option<String>,
    /// Team assignment snapshotted at write time; only
    /// `recalculate_team_ids_for_org` rewrites it afterwards
    pub team_id: Option<i64>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub success: bool,
    pub schema_version: i32,
}

impl TelemetryEvent {
    /// The logical session this event belongs to.
    ///
    /// Events without any session id group under a synthetic per-user,
    /// per-UTC-day pseudo-session.
    pub fn logical_session_id(&self) -> String {
        if let Some(parent) = &self.parent_session_id {
            return parent.clone();
        }
        if let Some(session) = &self.session_id {
            return session.clone();
        }
        pseudo_session_id(self.user_id.as_deref(), self.timestamp)
    }
}

/// Synthetic session id for events without a session: `user_<id>_<YYYY-MM-DD>`.
pub fn pseudo_session_id(user_id: Option<&str>, timestamp: DateTime<Utc>) -> String {
    format!(
        "user_{}_{}",
        user_id.unwrap_or("unknown"),
        timestamp.format("%Y-%m-%d")
    )
}

// ============================================
// Orgs and teams
// ============================================

/// A server installation, upserted on first sighting and never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Org {
    /// The server identifier string reported by clients (primary key)
    pub server_id: String,
    pub company_name: Option<String>,
    pub alias: Option<String>,
    pub color: Option<String>,
    pub team_id: Option<i64>,
}

/// Fields for a coalescing org upsert; `None` never overwrites a stored value.
#[derive(Debug, Clone, Default)]
pub struct OrgPatch {
    pub company_name: Option<String>,
    pub alias: Option<String>,
    pub color: Option<String>,
    pub team_id: Option<i64>,
}

impl OrgPatch {
    pub fn is_empty(&self) -> bool {
        self.company_name.is_none()
            && self.alias.is_none()
            && self.color.is_none()
            && self.team_id.is_none()
    }
}

/// A team grouping orgs, with an optional binary logo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub id: i64,
    pub name: String,
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logo_mime: Option<String>,
    #[serde(skip)]
    pub logo_data: Option<Vec<u8>>,
}

// ============================================
// People and operator accounts
// ============================================

/// A directory entry that owns telemetry usernames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Person {
    pub id: i64,
    pub display_name: String,
    pub email: Option<String>,
    pub initials: Option<String>,
}

/// A `(username, org)` pair owned by a person. Cascade-deleted with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonUsername {
    pub id: i64,
    pub person_id: i64,
    pub username: String,
    pub org_id: Option<String>,
}

/// An operator account of the service. Independent of telemetry user ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemUser {
    pub id: i64,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: Role,
    pub last_login: Option<DateTime<Utc>>,
}

/// A persisted remember-me token. Only the SHA-256 of the token is stored;
/// the plaintext is returned to the caller exactly once at issue time.
#[derive(Debug, Clone)]
pub struct RememberToken {
    pub id: i64,
    pub user_id: i64,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub user_agent: Option<String>,
    pub ip: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One row of the append-only authentication log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginAudit {
    pub id: i64,
    pub username: String,
    pub success: bool,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ============================================
// Aggregates and settings
// ============================================

/// A rollup row of `user_event_stats` / `org_event_stats`.
///
/// After `recompute`, `count` equals the number of non-trash events for the
/// key and `last_event` equals their MAX(timestamp).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventStat {
    pub key: String,
    pub count: i64,
    pub last_event: Option<DateTime<Utc>>,
    pub display_name: Option<String>,
}

/// A key/value configuration row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Setting {
    pub key: String,
    pub value: String,
}
