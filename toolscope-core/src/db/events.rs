//! Event queries: listing, logical sessions, time series, top-N
//!
//! Read paths answer from the fact table (not the rollups) so results stay
//! consistent with ingest; trashed rows are excluded everywhere unless a
//! caller explicitly asks for them.

use super::{Database, QueryBuilder, Sql, SqlRow};
use crate::error::Result;
use crate::sql_params;
use crate::types::{Area, EventType, TelemetryEvent};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::collections::HashMap;

/// A logical session is considered live this long after its last event.
pub const ACTIVE_SESSION_WINDOW_SECS: i64 = 2 * 60 * 60;

const DEFAULT_PAGE_LIMIT: usize = 50;
const MAX_PAGE_LIMIT: usize = 1000;
const MAX_TOP_N: usize = 500;
const MAX_DAYS: i64 = 365;
const TOOL_USAGE_LIMIT: usize = 6;

// ============================================
// Filter and result types
// ============================================

/// Sort keys accepted by [`Database::get_events`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventSortKey {
    Id,
    /// Event type name
    Event,
    Timestamp,
    #[default]
    CreatedAt,
    ServerId,
}

impl EventSortKey {
    fn column(&self) -> &'static str {
        match self {
            EventSortKey::Id => "e.id",
            EventSortKey::Event => "et.name",
            EventSortKey::Timestamp => "e.timestamp",
            EventSortKey::CreatedAt => "e.created_at",
            EventSortKey::ServerId => "e.server_id",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Filter for paginated event listing. Every field is optional; empty
/// vectors mean "no restriction".
#[derive(Debug, Clone)]
pub struct EventFilter {
    pub areas: Vec<Area>,
    pub event_types: Vec<EventType>,
    pub server_id: Option<String>,
    /// Matches the logical session: `parent_session_id = S` or a root
    /// physical session equal to S
    pub session_id: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub user_ids: Vec<String>,
    /// Trashed rows are excluded unless set
    pub include_deleted: bool,
    pub sort_by: EventSortKey,
    pub order: SortOrder,
    pub limit: usize,
    pub offset: usize,
}

impl Default for EventFilter {
    fn default() -> Self {
        Self {
            areas: Vec::new(),
            event_types: Vec::new(),
            server_id: None,
            session_id: None,
            start_date: None,
            end_date: None,
            user_ids: Vec::new(),
            include_deleted: false,
            sort_by: EventSortKey::default(),
            order: SortOrder::default(),
            limit: DEFAULT_PAGE_LIMIT,
            offset: 0,
        }
    }
}

/// One page of events plus paging metadata. `total` is `None` when the
/// COUNT shortcut applied (deep offsets with large limits).
#[derive(Debug)]
pub struct EventPage {
    pub events: Vec<TelemetryEvent>,
    pub total: Option<i64>,
    pub limit: usize,
    pub offset: usize,
    pub has_more: bool,
}

/// One logical session: the equivalence class of physical session ids, or
/// a synthetic per-user day bucket for session-less events.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: String,
    pub event_count: i64,
    pub first_event: DateTime<Utc>,
    pub last_event: DateTime<Utc>,
    /// User of the earliest event in the session
    pub user_id: Option<String>,
    /// Display name from the first session_start payload, if any
    pub user_name: Option<String>,
    pub is_active: bool,
    pub is_synthetic: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyCount {
    pub date: NaiveDate,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyTypeCounts {
    pub date: NaiveDate,
    pub start_sessions_without_end: i64,
    /// tool_call + tool_error
    pub tool_events: i64,
    /// tool_error only
    pub error_events: i64,
}

#[derive(Debug, Clone)]
pub struct TopUser {
    pub user_id: String,
    pub user_name: Option<String>,
    pub count: i64,
}

#[derive(Debug, Clone)]
pub struct TopTeam {
    pub team: String,
    pub count: i64,
}

#[derive(Debug, Clone)]
pub struct ToolUsage {
    pub tool_name: String,
    pub successful: i64,
    pub errors: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct DatabaseSize {
    pub bytes: u64,
    pub max_bytes: u64,
}

// ============================================
// Row mapping
// ============================================

const EVENT_COLUMNS: &str = "e.id, et.name AS event_type, e.area, e.timestamp, e.server_id,
       e.version, e.session_id, e.parent_session_id, e.user_id, e.data,
       e.received_at, e.created_at, e.org_id, e.user_name, e.tool_name,
       e.company_name, e.error_message, e.team_id, e.deleted_at, e.success,
       e.telemetry_schema_version";

pub(crate) fn row_to_event(row: &SqlRow) -> Result<TelemetryEvent> {
    Ok(TelemetryEvent {
        id: row.get_i64("id")?,
        event_type: row
            .get_str("event_type")?
            .parse()
            .unwrap_or(EventType::Custom),
        area: row
            .get_opt_str("area")?
            .and_then(|a| a.parse().ok())
            .unwrap_or(Area::General),
        timestamp: row.get_datetime("timestamp")?,
        server_id: row.get_opt_str("server_id")?,
        version: row.get_opt_str("version")?,
        session_id: row.get_opt_str("session_id")?,
        parent_session_id: row.get_opt_str("parent_session_id")?,
        user_id: row.get_opt_str("user_id")?,
        data: row.get_json("data")?,
        received_at: row.get_datetime("received_at")?,
        created_at: row.get_datetime("created_at")?,
        org_id: row.get_opt_str("org_id")?,
        user_name: row.get_opt_str("user_name")?,
        tool_name: row.get_opt_str("tool_name")?,
        company_name: row.get_opt_str("company_name")?,
        error_message: row.get_opt_str("error_message")?,
        team_id: row.get_opt_i64("team_id")?,
        deleted_at: row.get_opt_datetime("deleted_at")?,
        success: row.get_bool("success")?,
        schema_version: row.get_opt_i64("telemetry_schema_version")?.unwrap_or(1) as i32,
    })
}

fn push_filters(qb: &mut QueryBuilder, filter: &EventFilter) {
    if !filter.include_deleted {
        qb.push(" AND e.deleted_at IS NULL");
    }
    if !filter.areas.is_empty() {
        qb.push(" AND e.area IN ");
        let list = qb.bind_list(filter.areas.iter().map(|a| a.as_str()));
        qb.push(&list);
    }
    if !filter.event_types.is_empty() {
        qb.push(" AND et.name IN ");
        let list = qb.bind_list(filter.event_types.iter().map(|t| t.as_str()));
        qb.push(&list);
    }
    if let Some(server_id) = &filter.server_id {
        qb.push(" AND e.server_id = ");
        let p = qb.bind(server_id);
        qb.push(&p);
    }
    if let Some(session_id) = &filter.session_id {
        let p1 = qb.bind(session_id);
        let p2 = qb.bind(session_id);
        qb.push(&format!(
            " AND (e.parent_session_id = {} OR (e.parent_session_id IS NULL AND e.session_id = {}))",
            p1, p2
        ));
    }
    if let Some(start) = filter.start_date {
        qb.push(" AND e.timestamp >= ");
        let p = qb.bind(start);
        qb.push(&p);
    }
    if let Some(end) = filter.end_date {
        qb.push(" AND e.timestamp <= ");
        let p = qb.bind(end);
        qb.push(&p);
    }
    if !filter.user_ids.is_empty() {
        qb.push(" AND e.user_id IN ");
        let list = qb.bind_list(filter.user_ids.iter());
        qb.push(&list);
    }
}

// ============================================
// Queries
// ============================================

impl Database {
    /// Paginated event listing with optional filters.
    ///
    /// The total count is skipped for deep pagination (`offset > 0` with
    /// `limit > 100`) where scanning twice is not worth it; `has_more` then
    /// falls back to "page came back full".
    pub fn get_events(&self, filter: &EventFilter) -> Result<EventPage> {
        let limit = filter.limit.clamp(1, MAX_PAGE_LIMIT);

        let mut qb = QueryBuilder::new(
            self.kind(),
            &format!(
                "SELECT {} FROM telemetry_events e \
                 JOIN event_types et ON et.id = e.event_id WHERE 1=1",
                EVENT_COLUMNS
            ),
        );
        push_filters(&mut qb, filter);
        qb.push(&format!(
            " ORDER BY {} {}, e.id {}",
            filter.sort_by.column(),
            filter.order.as_sql(),
            filter.order.as_sql()
        ));
        qb.push(&format!(" LIMIT {} OFFSET {}", limit, filter.offset));

        let (sql, params) = qb.finish();
        let rows = self.backend()?.query(&sql, &params)?;
        let events: Vec<TelemetryEvent> =
            rows.iter().map(row_to_event).collect::<Result<_>>()?;

        let skip_count = filter.offset > 0 && limit > 100;
        let total = if skip_count {
            None
        } else {
            let mut qb = QueryBuilder::new(
                self.kind(),
                "SELECT COUNT(*) AS n FROM telemetry_events e \
                 JOIN event_types et ON et.id = e.event_id WHERE 1=1",
            );
            push_filters(&mut qb, filter);
            let (sql, params) = qb.finish();
            let row = self.backend()?.query_one(&sql, &params)?;
            Some(row.map(|r| r.get_i64("n")).transpose()?.unwrap_or(0))
        };

        let has_more = match total {
            Some(total) => (filter.offset as i64 + events.len() as i64) < total,
            None => events.len() == limit,
        };

        Ok(EventPage {
            events,
            total,
            limit,
            offset: filter.offset,
            has_more,
        })
    }

    /// Fetch a single event by id (trashed rows included).
    pub fn get_event(&self, id: i64) -> Result<Option<TelemetryEvent>> {
        let statement = Sql {
            sqlite: "SELECT e.id, et.name AS event_type, e.area, e.timestamp, e.server_id,
                            e.version, e.session_id, e.parent_session_id, e.user_id, e.data,
                            e.received_at, e.created_at, e.org_id, e.user_name, e.tool_name,
                            e.company_name, e.error_message, e.team_id, e.deleted_at, e.success,
                            e.telemetry_schema_version
                     FROM telemetry_events e
                     JOIN event_types et ON et.id = e.event_id
                     WHERE e.id = ?1",
            postgres: "SELECT e.id, et.name AS event_type, e.area, e.timestamp, e.server_id,
                              e.version, e.session_id, e.parent_session_id, e.user_id, e.data,
                              e.received_at, e.created_at, e.org_id, e.user_name, e.tool_name,
                              e.company_name, e.error_message, e.team_id, e.deleted_at, e.success,
                              e.telemetry_schema_version
                       FROM telemetry_events e
                       JOIN event_types et ON et.id = e.event_id
                       WHERE e.id = $1",
        };
        self.query_one(&statement, &sql_params![id])?
            .map(|row| row_to_event(&row))
            .transpose()
    }

    /// One row per logical session, most recent first.
    ///
    /// Events without any session id aggregate into synthetic
    /// `user_<id>_<YYYY-MM-DD>` sessions. A session is active when it has a
    /// start, no end, and its last event is younger than two hours.
    pub fn get_sessions(
        &self,
        start_date: Option<DateTime<Utc>>,
        end_date: Option<DateTime<Utc>>,
    ) -> Result<Vec<SessionSummary>> {
        let mut qb = QueryBuilder::new(
            self.kind(),
            "SELECT e.session_id, e.parent_session_id, e.user_id, e.user_name,
                    e.timestamp, et.name AS event_type
             FROM telemetry_events e
             JOIN event_types et ON et.id = e.event_id
             WHERE e.deleted_at IS NULL",
        );
        if let Some(start) = start_date {
            qb.push(" AND e.timestamp >= ");
            let p = qb.bind(start);
            qb.push(&p);
        }
        if let Some(end) = end_date {
            qb.push(" AND e.timestamp <= ");
            let p = qb.bind(end);
            qb.push(&p);
        }
        qb.push(" ORDER BY e.timestamp ASC, e.id ASC");

        struct Acc {
            count: i64,
            first: DateTime<Utc>,
            last: DateTime<Utc>,
            user_id: Option<String>,
            user_name: Option<String>,
            has_start: bool,
            has_end: bool,
            synthetic: bool,
        }

        let mut sessions: HashMap<String, Acc> = HashMap::new();

        let (sql, params) = qb.finish();
        self.backend()?.query_streamed(&sql, &params, &mut |row| {
            let session_id = row.get_opt_str("session_id")?;
            let parent = row.get_opt_str("parent_session_id")?;
            let user_id = row.get_opt_str("user_id")?;
            let timestamp = row.get_datetime("timestamp")?;
            let event_type = row.get_str("event_type")?;

            let synthetic = session_id.is_none() && parent.is_none();
            let key = parent.or(session_id).unwrap_or_else(|| {
                crate::types::pseudo_session_id(user_id.as_deref(), timestamp)
            });

            let acc = sessions.entry(key).or_insert_with(|| Acc {
                count: 0,
                first: timestamp,
                last: timestamp,
                user_id: user_id.clone(),
                user_name: None,
                has_start: false,
                has_end: false,
                synthetic,
            });
            acc.count += 1;
            acc.first = acc.first.min(timestamp);
            acc.last = acc.last.max(timestamp);
            if acc.user_id.is_none() {
                acc.user_id = user_id;
            }
            match event_type.as_str() {
                "session_start" => {
                    if !acc.has_start {
                        acc.user_name = row.get_opt_str("user_name")?;
                    }
                    acc.has_start = true;
                }
                "session_end" => acc.has_end = true,
                _ => {}
            }
            Ok(())
        })?;

        let now = Utc::now();
        let mut out: Vec<SessionSummary> = sessions
            .into_iter()
            .map(|(session_id, acc)| SessionSummary {
                session_id,
                event_count: acc.count,
                first_event: acc.first,
                last_event: acc.last,
                user_id: acc.user_id,
                user_name: acc.user_name,
                is_active: acc.has_start
                    && !acc.has_end
                    && (now - acc.last).num_seconds() < ACTIVE_SESSION_WINDOW_SECS,
                is_synthetic: acc.synthetic,
            })
            .collect();
        out.sort_by(|a, b| b.last_event.cmp(&a.last_event));
        Ok(out)
    }

    /// Daily event counts (UTC buckets) for the last `days` days, as a
    /// dense series with explicit zeros. `days` clamps to [1, 365].
    pub fn get_daily_stats(&self, days: i64) -> Result<Vec<DailyCount>> {
        let days = days.clamp(1, MAX_DAYS);
        let (start, dates) = daily_window(days);

        let statement = Sql {
            sqlite: "SELECT strftime('%Y-%m-%d', timestamp) AS day, COUNT(*) AS n
                     FROM telemetry_events
                     WHERE deleted_at IS NULL AND timestamp >= ?1
                     GROUP BY strftime('%Y-%m-%d', timestamp)",
            postgres: "SELECT to_char(timestamp AT TIME ZONE 'UTC', 'YYYY-MM-DD') AS day, COUNT(*) AS n
                       FROM telemetry_events
                       WHERE deleted_at IS NULL AND timestamp >= $1
                       GROUP BY to_char(timestamp AT TIME ZONE 'UTC', 'YYYY-MM-DD')",
        };

        let rows = self.query(&statement, &sql_params![start])?;
        let mut by_day: HashMap<String, i64> = HashMap::new();
        for row in &rows {
            by_day.insert(row.get_str("day")?, row.get_i64("n")?);
        }

        Ok(dates
            .into_iter()
            .map(|date| DailyCount {
                count: by_day
                    .get(&date.format("%Y-%m-%d").to_string())
                    .copied()
                    .unwrap_or(0),
                date,
            })
            .collect())
    }

    /// Daily counts split by category: session starts that never saw an
    /// end, tool events, and tool errors.
    pub fn get_daily_stats_by_event_type(&self, days: i64) -> Result<Vec<DailyTypeCounts>> {
        let days = days.clamp(1, MAX_DAYS);
        let (start, dates) = daily_window(days);

        let statement = Sql {
            sqlite: "SELECT strftime('%Y-%m-%d', e.timestamp) AS day,
                            SUM(CASE WHEN et.name = 'session_start' AND NOT EXISTS (
                                SELECT 1 FROM telemetry_events e2
                                JOIN event_types et2 ON et2.id = e2.event_id
                                WHERE e2.session_id = e.session_id
                                  AND et2.name = 'session_end'
                                  AND e2.deleted_at IS NULL
                            ) THEN 1 ELSE 0 END) AS starts_without_end,
                            SUM(CASE WHEN et.name IN ('tool_call', 'tool_error') THEN 1 ELSE 0 END) AS tool_events,
                            SUM(CASE WHEN et.name = 'tool_error' THEN 1 ELSE 0 END) AS error_events
                     FROM telemetry_events e
                     JOIN event_types et ON et.id = e.event_id
                     WHERE e.deleted_at IS NULL AND e.timestamp >= ?1
                     GROUP BY strftime('%Y-%m-%d', e.timestamp)",
            postgres: "SELECT to_char(e.timestamp AT TIME ZONE 'UTC', 'YYYY-MM-DD') AS day,
                              SUM(CASE WHEN et.name = 'session_start' AND NOT EXISTS (
                                  SELECT 1 FROM telemetry_events e2
                                  JOIN event_types et2 ON et2.id = e2.event_id
                                  WHERE e2.session_id = e.session_id
                                    AND et2.name = 'session_end'
                                    AND e2.deleted_at IS NULL
                              ) THEN 1 ELSE 0 END) AS starts_without_end,
                              SUM(CASE WHEN et.name IN ('tool_call', 'tool_error') THEN 1 ELSE 0 END) AS tool_events,
                              SUM(CASE WHEN et.name = 'tool_error' THEN 1 ELSE 0 END) AS error_events
                       FROM telemetry_events e
                       JOIN event_types et ON et.id = e.event_id
                       WHERE e.deleted_at IS NULL AND e.timestamp >= $1
                       GROUP BY to_char(e.timestamp AT TIME ZONE 'UTC', 'YYYY-MM-DD')",
        };

        let rows = self.query(&statement, &sql_params![start])?;
        let mut by_day: HashMap<String, (i64, i64, i64)> = HashMap::new();
        for row in &rows {
            by_day.insert(
                row.get_str("day")?,
                (
                    row.get_opt_i64("starts_without_end")?.unwrap_or(0),
                    row.get_opt_i64("tool_events")?.unwrap_or(0),
                    row.get_opt_i64("error_events")?.unwrap_or(0),
                ),
            );
        }

        Ok(dates
            .into_iter()
            .map(|date| {
                let (starts, tools, errors) = by_day
                    .get(&date.format("%Y-%m-%d").to_string())
                    .copied()
                    .unwrap_or((0, 0, 0));
                DailyTypeCounts {
                    date,
                    start_sessions_without_end: starts,
                    tool_events: tools,
                    error_events: errors,
                }
            })
            .collect())
    }

    /// Top users by event count over the last `days` days. `n` clamps to
    /// [1, 500], `days` to [1, 365].
    pub fn get_top_users_last_days(&self, days: i64, n: usize) -> Result<Vec<TopUser>> {
        let days = days.clamp(1, MAX_DAYS);
        let n = n.clamp(1, MAX_TOP_N);
        let start = Utc::now() - Duration::days(days);

        let statement = Sql {
            sqlite: "SELECT user_id, MAX(user_name) AS user_name, COUNT(*) AS n
                     FROM telemetry_events
                     WHERE deleted_at IS NULL AND user_id IS NOT NULL AND timestamp >= ?1
                     GROUP BY user_id
                     ORDER BY COUNT(*) DESC
                     LIMIT ?2",
            postgres: "SELECT user_id, MAX(user_name) AS user_name, COUNT(*) AS n
                       FROM telemetry_events
                       WHERE deleted_at IS NULL AND user_id IS NOT NULL AND timestamp >= $1
                       GROUP BY user_id
                       ORDER BY COUNT(*) DESC
                       LIMIT $2",
        };

        let rows = self.query(&statement, &sql_params![start, n])?;
        rows.iter()
            .map(|row| {
                Ok(TopUser {
                    user_id: row.get_str("user_id")?,
                    user_name: row.get_opt_str("user_name")?,
                    count: row.get_i64("n")?,
                })
            })
            .collect()
    }

    /// Top teams by event count over the last `days` days.
    ///
    /// With no explicit mapping, org→team comes from the `orgs.team_id`
    /// join. A provided `org → team name` mapping overrides the join.
    /// Grouping is case-insensitive on the team name either way.
    pub fn get_top_teams_last_days(
        &self,
        days: i64,
        n: usize,
        org_team_names: Option<&HashMap<String, String>>,
    ) -> Result<Vec<TopTeam>> {
        let days = days.clamp(1, MAX_DAYS);
        let n = n.clamp(1, MAX_TOP_N);
        let start = Utc::now() - Duration::days(days);

        if let Some(mapping) = org_team_names {
            let statement = Sql {
                sqlite: "SELECT COALESCE(org_id, server_id) AS org_key, COUNT(*) AS n
                         FROM telemetry_events
                         WHERE deleted_at IS NULL AND timestamp >= ?1
                           AND COALESCE(org_id, server_id) IS NOT NULL
                         GROUP BY COALESCE(org_id, server_id)",
                postgres: "SELECT COALESCE(org_id, server_id) AS org_key, COUNT(*) AS n
                           FROM telemetry_events
                           WHERE deleted_at IS NULL AND timestamp >= $1
                             AND COALESCE(org_id, server_id) IS NOT NULL
                           GROUP BY COALESCE(org_id, server_id)",
            };
            let rows = self.query(&statement, &sql_params![start])?;

            // case-insensitive grouping key → (display name, count)
            let mut teams: HashMap<String, (String, i64)> = HashMap::new();
            for row in &rows {
                let org_key = row.get_str("org_key")?;
                let count = row.get_i64("n")?;
                if let Some(team) = mapping.get(&org_key) {
                    let entry = teams
                        .entry(team.to_lowercase())
                        .or_insert_with(|| (team.clone(), 0));
                    entry.1 += count;
                }
            }

            let mut out: Vec<TopTeam> = teams
                .into_values()
                .map(|(team, count)| TopTeam { team, count })
                .collect();
            out.sort_by(|a, b| b.count.cmp(&a.count).then(a.team.cmp(&b.team)));
            out.truncate(n);
            return Ok(out);
        }

        let statement = Sql {
            sqlite: "SELECT MAX(t.name) AS team, COUNT(*) AS n
                     FROM telemetry_events e
                     JOIN orgs o ON o.server_id = COALESCE(e.org_id, e.server_id)
                     JOIN teams t ON t.id = o.team_id
                     WHERE e.deleted_at IS NULL AND e.timestamp >= ?1
                     GROUP BY LOWER(t.name)
                     ORDER BY COUNT(*) DESC
                     LIMIT ?2",
            postgres: "SELECT MAX(t.name) AS team, COUNT(*) AS n
                       FROM telemetry_events e
                       JOIN orgs o ON o.server_id = COALESCE(e.org_id, e.server_id)
                       JOIN teams t ON t.id = o.team_id
                       WHERE e.deleted_at IS NULL AND e.timestamp >= $1
                       GROUP BY LOWER(t.name)
                       ORDER BY COUNT(*) DESC
                       LIMIT $2",
        };

        let rows = self.query(&statement, &sql_params![start, n])?;
        rows.iter()
            .map(|row| {
                Ok(TopTeam {
                    team: row.get_str("team")?,
                    count: row.get_i64("n")?,
                })
            })
            .collect()
    }

    /// Per-tool success/error split over `(tool_call, tool_error)` counts,
    /// busiest tools first, capped at six.
    ///
    /// The denormalized `tool_name` column is preferred; rows written
    /// before the backfill fall back to JSON extraction.
    pub fn get_tool_usage_stats(&self) -> Result<Vec<ToolUsage>> {
        let statement = Sql {
            sqlite: "SELECT COALESCE(e.tool_name, json_extract(e.data, '$.toolName')) AS tool,
                            SUM(CASE WHEN et.name = 'tool_call' THEN 1 ELSE 0 END) AS successful,
                            SUM(CASE WHEN et.name = 'tool_error' THEN 1 ELSE 0 END) AS errors
                     FROM telemetry_events e
                     JOIN event_types et ON et.id = e.event_id
                     WHERE e.deleted_at IS NULL
                       AND et.name IN ('tool_call', 'tool_error')
                       AND COALESCE(e.tool_name, json_extract(e.data, '$.toolName')) IS NOT NULL
                     GROUP BY COALESCE(e.tool_name, json_extract(e.data, '$.toolName'))
                     ORDER BY COUNT(*) DESC
                     LIMIT ?1",
            postgres: "SELECT COALESCE(e.tool_name, e.data->>'toolName') AS tool,
                              SUM(CASE WHEN et.name = 'tool_call' THEN 1 ELSE 0 END) AS successful,
                              SUM(CASE WHEN et.name = 'tool_error' THEN 1 ELSE 0 END) AS errors
                       FROM telemetry_events e
                       JOIN event_types et ON et.id = e.event_id
                       WHERE e.deleted_at IS NULL
                         AND et.name IN ('tool_call', 'tool_error')
                         AND COALESCE(e.tool_name, e.data->>'toolName') IS NOT NULL
                       GROUP BY COALESCE(e.tool_name, e.data->>'toolName')
                       ORDER BY COUNT(*) DESC
                       LIMIT $1",
        };

        let rows = self.query(&statement, &sql_params![TOOL_USAGE_LIMIT])?;
        rows.iter()
            .map(|row| {
                Ok(ToolUsage {
                    tool_name: row.get_str("tool")?,
                    successful: row.get_opt_i64("successful")?.unwrap_or(0),
                    errors: row.get_opt_i64("errors")?.unwrap_or(0),
                })
            })
            .collect()
    }

    /// Bytes used by the backend plus the configured soft maximum.
    pub fn get_database_size(&self) -> Result<DatabaseSize> {
        Ok(DatabaseSize {
            bytes: self.size_bytes()?,
            max_bytes: self.max_size_bytes(),
        })
    }
}

/// The UTC day window for a dense daily series: the start instant and the
/// list of dates, oldest first, ending today.
fn daily_window(days: i64) -> (DateTime<Utc>, Vec<NaiveDate>) {
    let today = Utc::now().date_naive();
    let first = today - Duration::days(days - 1);
    let start = first
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .unwrap_or_else(Utc::now);
    let dates = (0..days).map(|i| first + Duration::days(i)).collect();
    (start, dates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::test_support::open_test_db;
    use crate::ingest::Ingestor;
    use serde_json::json;

    fn seed(db: &Database) -> Ingestor {
        Ingestor::new(db.clone(), &Config::default())
    }

    fn iso(ts: DateTime<Utc>) -> String {
        ts.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    }

    #[test]
    fn test_get_events_filters_and_pages() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_test_db(dir.path());
        let ingestor = seed(&db);

        for i in 0..5 {
            ingestor
                .ingest(&json!({
                    "event": if i % 2 == 0 { "tool_call" } else { "custom" },
                    "timestamp": format!("2025-03-01T09:0{}:00Z", i),
                    "serverId": "org-1",
                    "userId": "u1",
                    "data": {}
                }))
                .unwrap();
        }

        let page = db
            .get_events(&EventFilter {
                event_types: vec![EventType::ToolCall],
                limit: 2,
                sort_by: EventSortKey::Timestamp,
                order: SortOrder::Asc,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.events.len(), 2);
        assert_eq!(page.total, Some(3));
        assert!(page.has_more);
        assert!(page.events[0].timestamp < page.events[1].timestamp);

        let page = db
            .get_events(&EventFilter {
                event_types: vec![EventType::ToolCall],
                limit: 2,
                offset: 2,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.events.len(), 1);
        assert!(!page.has_more);
    }

    #[test]
    fn test_get_events_skips_count_on_deep_pages() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_test_db(dir.path());
        let ingestor = seed(&db);
        ingestor
            .ingest(&json!({
                "event": "custom",
                "timestamp": "2025-03-01T09:00:00Z",
                "userId": "u1",
                "data": {}
            }))
            .unwrap();

        let page = db
            .get_events(&EventFilter {
                limit: 200,
                offset: 200,
                ..Default::default()
            })
            .unwrap();
        assert!(page.total.is_none());
        assert!(!page.has_more);
    }

    #[test]
    fn test_logical_session_filter() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_test_db(dir.path());
        let ingestor = seed(&db);

        // s1 then s2 within the window: both join logical session s1
        ingestor
            .ingest(&json!({
                "event": "session_start", "sessionId": "s1", "userId": "u", "serverId": "o",
                "timestamp": "2025-01-01T09:00:00Z", "data": {}
            }))
            .unwrap();
        ingestor
            .ingest(&json!({
                "event": "session_start", "sessionId": "s2", "userId": "u", "serverId": "o",
                "timestamp": "2025-01-01T12:30:00Z", "data": {}
            }))
            .unwrap();

        let page = db
            .get_events(&EventFilter {
                session_id: Some("s1".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.events.len(), 2);
    }

    #[test]
    fn test_get_sessions_groups_and_synthesizes() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_test_db(dir.path());
        let ingestor = seed(&db);

        let now = Utc::now();
        ingestor
            .ingest(&json!({
                "event": "session_start", "sessionId": "s1", "userId": "u1", "serverId": "o",
                "timestamp": iso(now - Duration::minutes(30)),
                "data": {"userName": "User One"}
            }))
            .unwrap();
        ingestor
            .ingest(&json!({
                "event": "tool_call", "sessionId": "s1", "userId": "u1", "serverId": "o",
                "timestamp": iso(now - Duration::minutes(10)), "data": {}
            }))
            .unwrap();
        // session-less event lands in a synthetic day bucket
        ingestor
            .ingest(&json!({
                "event": "tool_call", "userId": "u2", "serverId": "o",
                "timestamp": iso(now - Duration::minutes(5)), "data": {}
            }))
            .unwrap();

        let sessions = db.get_sessions(None, None).unwrap();
        assert_eq!(sessions.len(), 2);

        let real = sessions.iter().find(|s| s.session_id == "s1").unwrap();
        assert_eq!(real.event_count, 2);
        assert!(real.is_active, "started, no end, recent activity");
        assert!(!real.is_synthetic);
        assert_eq!(real.user_name.as_deref(), Some("User One"));

        let synthetic = sessions.iter().find(|s| s.is_synthetic).unwrap();
        assert!(synthetic.session_id.starts_with("user_u2_"));
        assert_eq!(synthetic.event_count, 1);
        assert!(!synthetic.is_active, "no session_start");
    }

    #[test]
    fn test_session_end_deactivates() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_test_db(dir.path());
        let ingestor = seed(&db);
        let now = Utc::now();

        ingestor
            .ingest(&json!({
                "event": "session_start", "sessionId": "s1", "userId": "u1", "serverId": "o",
                "timestamp": iso(now - Duration::minutes(20)), "data": {}
            }))
            .unwrap();
        ingestor
            .ingest(&json!({
                "event": "session_end", "sessionId": "s1", "userId": "u1", "serverId": "o",
                "timestamp": iso(now - Duration::minutes(1)), "data": {}
            }))
            .unwrap();

        let sessions = db.get_sessions(None, None).unwrap();
        assert!(!sessions[0].is_active);
    }

    #[test]
    fn test_daily_stats_dense_series() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_test_db(dir.path());
        let ingestor = seed(&db);

        ingestor
            .ingest(&json!({
                "event": "tool_call", "userId": "u1", "serverId": "o",
                "timestamp": iso(Utc::now()), "data": {}
            }))
            .unwrap();

        let series = db.get_daily_stats(7).unwrap();
        assert_eq!(series.len(), 7);
        assert_eq!(series.last().unwrap().date, Utc::now().date_naive());
        assert_eq!(series.last().unwrap().count, 1);
        assert!(series[..6].iter().all(|d| d.count == 0));

        // days=1 returns a single bucket for today
        let series = db.get_daily_stats(1).unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].count, 1);

        // clamped
        assert_eq!(db.get_daily_stats(0).unwrap().len(), 1);
        assert_eq!(db.get_daily_stats(10_000).unwrap().len(), 365);
    }

    #[test]
    fn test_daily_stats_by_event_type() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_test_db(dir.path());
        let ingestor = seed(&db);
        let now = Utc::now();

        // ended session
        ingestor
            .ingest(&json!({
                "event": "session_start", "sessionId": "ended", "userId": "u", "serverId": "o",
                "timestamp": iso(now), "data": {}
            }))
            .unwrap();
        ingestor
            .ingest(&json!({
                "event": "session_end", "sessionId": "ended", "userId": "u", "serverId": "o",
                "timestamp": iso(now), "data": {}
            }))
            .unwrap();
        // dangling session
        ingestor
            .ingest(&json!({
                "event": "session_start", "sessionId": "open", "userId": "u2", "serverId": "o2",
                "timestamp": iso(now), "data": {}
            }))
            .unwrap();
        ingestor
            .ingest(&json!({
                "event": "tool_call", "sessionId": "open", "userId": "u2", "serverId": "o2",
                "timestamp": iso(now), "data": {}
            }))
            .unwrap();
        ingestor
            .ingest(&json!({
                "event": "tool_error", "sessionId": "open", "userId": "u2", "serverId": "o2",
                "timestamp": iso(now), "data": {}
            }))
            .unwrap();

        let series = db.get_daily_stats_by_event_type(1).unwrap();
        assert_eq!(series.len(), 1);
        let today = &series[0];
        assert_eq!(today.start_sessions_without_end, 1);
        assert_eq!(today.tool_events, 2);
        assert_eq!(today.error_events, 1);
    }

    #[test]
    fn test_top_users_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_test_db(dir.path());
        let ingestor = seed(&db);
        let now = Utc::now();

        for (user, events) in [("u1", 3), ("u2", 1)] {
            for _ in 0..events {
                ingestor
                    .ingest(&json!({
                        "event": "tool_call", "userId": user, "serverId": "o",
                        "timestamp": iso(now), "data": {}
                    }))
                    .unwrap();
            }
        }

        let top = db.get_top_users_last_days(7, 10_000).unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].user_id, "u1");
        assert_eq!(top[0].count, 3);

        let top = db.get_top_users_last_days(7, 1).unwrap();
        assert_eq!(top.len(), 1);
    }

    #[test]
    fn test_top_teams_via_org_join_and_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_test_db(dir.path());
        let ingestor = seed(&db);
        let now = Utc::now();

        let team_id = db.create_team("Platform", None, None, None).unwrap();
        db.upsert_org(
            "org-1",
            &crate::types::OrgPatch {
                team_id: Some(team_id),
                ..Default::default()
            },
        )
        .unwrap();

        for _ in 0..2 {
            ingestor
                .ingest(&json!({
                    "event": "tool_call", "userId": "u", "serverId": "org-1",
                    "timestamp": iso(now), "data": {"orgId": "org-1"}
                }))
                .unwrap();
        }

        let top = db.get_top_teams_last_days(7, 5, None).unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].team, "Platform");
        assert_eq!(top[0].count, 2);

        // provided mapping overrides the join; grouping is case-insensitive
        let mut mapping = HashMap::new();
        mapping.insert("org-1".to_string(), "platform".to_string());
        let top = db.get_top_teams_last_days(7, 5, Some(&mapping)).unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].count, 2);
    }

    #[test]
    fn test_tool_usage_stats() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_test_db(dir.path());
        let ingestor = seed(&db);
        let now = Utc::now();

        ingestor
            .ingest(&json!({
                "event": "tool_call", "userId": "u", "serverId": "o",
                "timestamp": iso(now), "data": {"toolName": "describe_object"}
            }))
            .unwrap();
        ingestor
            .ingest(&json!({
                "event": "tool_error", "userId": "u", "serverId": "o",
                "timestamp": iso(now),
                "data": {"errorMessage": "Invalid object", "toolName": "describe_object"}
            }))
            .unwrap();

        let usage = db.get_tool_usage_stats().unwrap();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].tool_name, "describe_object");
        assert_eq!(usage[0].successful, 1);
        assert_eq!(usage[0].errors, 1);
    }

    #[test]
    fn test_database_size() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_test_db(dir.path());
        let size = db.get_database_size().unwrap();
        assert!(size.bytes > 0);
        assert_eq!(size.max_bytes, crate::config::DEFAULT_DB_MAX_SIZE);
    }
}
