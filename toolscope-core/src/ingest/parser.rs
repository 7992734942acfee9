//! Payload parsing and normalization
//!
//! Client payloads arrive in two schema generations: v1 carries a bare
//! `event` name, v2 an `area` plus `success` flag. Both are normalized
//! into the same canonical shape; the payload itself is preserved
//! bit-for-bit on the row for audit.
//!
//! Field extraction walks explicit fallback chains over the JSON tree —
//! clients have shipped several spellings of the same field over the
//! years and all of them stay readable.

use crate::error::ValidationError;
use crate::types::{Area, Denormalized, EventType, ParsedEvent};
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Raw v1 event names that are exempt from the missing-user rule.
pub(crate) const MISSING_USER_EXEMPT: [&str; 2] = ["server_boot", "client_connect"];

/// Parse and normalize one payload.
///
/// `received_at` doubles as the fallback timestamp when the payload's own
/// clock is missing or malformed.
pub fn parse(payload: &Value, received_at: DateTime<Utc>) -> Result<ParsedEvent, ValidationError> {
    let obj = payload
        .as_object()
        .ok_or_else(|| ValidationError::MalformedPayload("payload is not a JSON object".into()))?;

    let schema_version = detect_schema_version(payload)?;

    let raw_event_name = string_at(payload, &[&["event"]]);
    let canonical = raw_event_name
        .as_deref()
        .and_then(|name| name.parse::<EventType>().ok());

    let data = obj.get("data").cloned().unwrap_or_else(|| Value::Object(Default::default()));

    let success = match schema_version {
        2 => payload.get("success").and_then(Value::as_bool).unwrap_or(true),
        _ => !matches!(canonical, Some(EventType::ToolError) | Some(EventType::Error)),
    };

    let explicit_area = string_at(payload, &[&["area"]]).and_then(|a| a.parse::<Area>().ok());

    let event_type = match canonical {
        Some(et) => et,
        None => match explicit_area {
            Some(Area::Tool) => {
                if success {
                    EventType::ToolCall
                } else {
                    EventType::ToolError
                }
            }
            _ => EventType::Custom,
        },
    };

    let area = explicit_area.unwrap_or_else(|| Area::for_event_type(event_type));

    let timestamp = parse_timestamp(payload.get("timestamp")).unwrap_or(received_at);

    let session_id = string_at(
        payload,
        &[
            &["sessionId"],
            &["session_id"],
            &["session"],
            &["session", "id"],
            &["data", "sessionId"],
            &["data", "session_id"],
            &["data", "session", "id"],
        ],
    );

    let user_id = string_at(
        payload,
        &[
            &["userId"],
            &["user_id"],
            &["data", "userId"],
            &["data", "user_id"],
            &["data", "user", "id"],
            &["data", "userName"],
            &["data", "user_name"],
            &["data", "user", "name"],
        ],
    );

    let denormalized = extract_denormalized(payload);

    Ok(ParsedEvent {
        event_type,
        raw_event_name,
        area,
        timestamp,
        server_id: string_at(payload, &[&["serverId"], &["server_id"]]),
        version: string_at(payload, &[&["version"]]),
        session_id,
        user_id,
        success,
        schema_version,
        denormalized,
        data,
        raw: payload.to_string(),
    })
}

/// Lift the denormalized columns out of a full payload. Also used by the
/// denormalization backfill on stored rows.
pub(crate) fn extract_denormalized(payload: &Value) -> Denormalized {
    Denormalized {
        org_id: string_at(payload, &[&["data", "orgId"], &["data", "state", "org", "id"]]),
        user_name: string_at(
            payload,
            &[
                &["data", "userName"],
                &["data", "user_name"],
                &["data", "user", "name"],
            ],
        ),
        tool_name: string_at(
            payload,
            &[
                &["data", "toolName"],
                &["data", "tool"],
                &["data", "error", "toolName"],
                &["data", "error", "tool"],
            ],
        ),
        company_name: string_at(
            payload,
            &[
                &["data", "state", "org", "companyDetails", "Name"],
                &["data", "companyDetails", "Name"],
            ],
        ),
        error_message: string_at(
            payload,
            &[&["data", "errorMessage"], &["data", "error", "message"]],
        ),
    }
}

/// Version detection: an explicit integer `schemaVersion` wins, then the
/// v2 `area` marker, then a canonical v1 `event` name.
fn detect_schema_version(payload: &Value) -> Result<i32, ValidationError> {
    if let Some(explicit) = payload.get("schemaVersion").and_then(Value::as_i64) {
        return match explicit {
            1 => Ok(1),
            2 => Ok(2),
            _ => Err(ValidationError::UnknownSchema),
        };
    }

    if let Some(area) = payload.get("area").and_then(Value::as_str) {
        if area.parse::<Area>().is_ok() {
            return Ok(2);
        }
    }

    if let Some(event) = payload.get("event").and_then(Value::as_str) {
        if event.parse::<EventType>().is_ok() {
            return Ok(1);
        }
        // Non-canonical names (server_boot etc.) still identify v1 traffic
        if MISSING_USER_EXEMPT.contains(&event) {
            return Ok(1);
        }
    }

    Err(ValidationError::UnknownSchema)
}

fn parse_timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    match value? {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok(),
        // Epoch milliseconds from older clients
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

/// Walk one dotted path into the tree.
fn value_at<'a>(root: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut current = root;
    for segment in path {
        current = current.get(segment)?;
    }
    Some(current)
}

/// First path that yields a non-empty string (after trim). Numbers are
/// accepted and stringified — clients have sent numeric ids.
fn string_at(root: &Value, paths: &[&[&str]]) -> Option<String> {
    for path in paths {
        match value_at(root, path) {
            Some(Value::String(s)) => {
                let trimmed = s.trim();
                if !trimmed.is_empty() {
                    return Some(trimmed.to_string());
                }
            }
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_v1_minimal() {
        let payload = json!({
            "event": "tool_call",
            "timestamp": "2025-01-01T09:00:00Z",
            "serverId": "org-1",
            "version": "1.4.0",
            "sessionId": "s1",
            "userId": "u1",
            "data": {}
        });
        let parsed = parse(&payload, now()).unwrap();
        assert_eq!(parsed.schema_version, 1);
        assert_eq!(parsed.event_type, EventType::ToolCall);
        assert_eq!(parsed.area, Area::Tool);
        assert_eq!(parsed.server_id.as_deref(), Some("org-1"));
        assert_eq!(parsed.session_id.as_deref(), Some("s1"));
        assert_eq!(parsed.user_id.as_deref(), Some("u1"));
        assert!(parsed.success);
    }

    #[test]
    fn test_v2_detected_by_area() {
        let payload = json!({
            "area": "tool",
            "timestamp": "2025-01-01T09:00:00Z",
            "serverId": "org-1",
            "version": "2.0.0",
            "success": false,
            "data": {"toolName": "describe_object"}
        });
        let parsed = parse(&payload, now()).unwrap();
        assert_eq!(parsed.schema_version, 2);
        assert_eq!(parsed.event_type, EventType::ToolError);
        assert!(!parsed.success);
        assert_eq!(parsed.denormalized.tool_name.as_deref(), Some("describe_object"));
    }

    #[test]
    fn test_explicit_schema_version_wins() {
        let payload = json!({
            "schemaVersion": 2,
            "event": "tool_call",
            "timestamp": "2025-01-01T09:00:00Z",
            "data": {}
        });
        let parsed = parse(&payload, now()).unwrap();
        assert_eq!(parsed.schema_version, 2);
        // success defaults to true on v2 when absent
        assert!(parsed.success);
    }

    #[test]
    fn test_unknown_schema_rejected() {
        let payload = json!({"event": "telemetry_blob", "data": {}});
        assert_eq!(parse(&payload, now()).unwrap_err(), ValidationError::UnknownSchema);

        let payload = json!([1, 2, 3]);
        assert!(matches!(
            parse(&payload, now()).unwrap_err(),
            ValidationError::MalformedPayload(_)
        ));
    }

    #[test]
    fn test_v1_error_events_fail() {
        let payload = json!({
            "event": "tool_error",
            "timestamp": "2025-01-01T09:00:00Z",
            "data": {"errorMessage": "Invalid object", "toolName": "describe_object"}
        });
        let parsed = parse(&payload, now()).unwrap();
        assert!(!parsed.success);
        assert_eq!(parsed.denormalized.error_message.as_deref(), Some("Invalid object"));
        assert_eq!(parsed.denormalized.tool_name.as_deref(), Some("describe_object"));
    }

    #[test]
    fn test_user_id_falls_back_to_user_name() {
        let payload = json!({
            "event": "custom",
            "timestamp": "2025-01-01T09:00:00Z",
            "data": {"userName": "María"}
        });
        let parsed = parse(&payload, now()).unwrap();
        assert_eq!(parsed.user_id.as_deref(), Some("María"));
        assert_eq!(parsed.denormalized.user_name.as_deref(), Some("María"));
    }

    #[test]
    fn test_session_fallback_chain() {
        let payload = json!({
            "event": "custom",
            "timestamp": "2025-01-01T09:00:00Z",
            "data": {"session": {"id": "nested"}}
        });
        let parsed = parse(&payload, now()).unwrap();
        assert_eq!(parsed.session_id.as_deref(), Some("nested"));

        let payload = json!({
            "event": "custom",
            "session": "top-level",
            "data": {"session": {"id": "nested"}}
        });
        let parsed = parse(&payload, now()).unwrap();
        assert_eq!(parsed.session_id.as_deref(), Some("top-level"));
    }

    #[test]
    fn test_empty_strings_are_null() {
        let payload = json!({
            "event": "custom",
            "timestamp": "2025-01-01T09:00:00Z",
            "sessionId": "   ",
            "userId": "",
            "data": {}
        });
        let parsed = parse(&payload, now()).unwrap();
        assert!(parsed.session_id.is_none());
        assert!(parsed.user_id.is_none());
    }

    #[test]
    fn test_org_and_company_from_state() {
        let payload = json!({
            "event": "session_start",
            "timestamp": "2025-01-01T09:00:00Z",
            "data": {
                "state": {"org": {"id": "org-9", "companyDetails": {"Name": "Acme Corp"}}}
            }
        });
        let parsed = parse(&payload, now()).unwrap();
        assert_eq!(parsed.denormalized.org_id.as_deref(), Some("org-9"));
        assert_eq!(parsed.denormalized.company_name.as_deref(), Some("Acme Corp"));
    }

    #[test]
    fn test_malformed_timestamp_uses_receive_time() {
        let received = now();
        let payload = json!({
            "event": "custom",
            "timestamp": "yesterday-ish",
            "data": {}
        });
        let parsed = parse(&payload, received).unwrap();
        assert_eq!(parsed.timestamp, received);
    }

    #[test]
    fn test_epoch_millis_timestamp() {
        let payload = json!({
            "event": "custom",
            "timestamp": 1735689600000i64,
            "data": {}
        });
        let parsed = parse(&payload, now()).unwrap();
        assert_eq!(parsed.timestamp.timestamp(), 1735689600);
    }

    #[test]
    fn test_server_boot_is_v1_custom() {
        let payload = json!({
            "event": "server_boot",
            "timestamp": "2025-01-01T09:00:00Z",
            "data": {}
        });
        let parsed = parse(&payload, now()).unwrap();
        assert_eq!(parsed.schema_version, 1);
        assert_eq!(parsed.event_type, EventType::Custom);
        assert_eq!(parsed.raw_event_name.as_deref(), Some("server_boot"));
    }

    #[test]
    fn test_raw_payload_round_trips() {
        let payload = json!({
            "event": "custom",
            "timestamp": "2025-01-01T09:00:00Z",
            "data": {"nested": {"deep": [1, 2, {"x": null}]}}
        });
        let parsed = parse(&payload, now()).unwrap();
        let reparsed: Value = serde_json::from_str(&parsed.raw).unwrap();
        assert_eq!(reparsed, payload);
    }
}
