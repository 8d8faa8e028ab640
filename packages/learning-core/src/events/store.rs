use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, TryStreamExt};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::types::{Event, EventKind, EventPayload, NewEvent, TargetKind, TargetRef};
use crate::db::time::{from_ms, to_ms};
use crate::error::{CoreError, CoreResult};

const RANGE_PAGE_SIZE: i64 = 256;

const EVENT_COLUMNS: &str = r#""id", "user_id", "kind", "target_kind", "target_id", "session_id", "occurred_at", "metadata""#;

/// Filter for [`range`]; every field narrows the result
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub user_id: Option<i64>,
    pub kind: Option<EventKind>,
    /// Inclusive start, exclusive end
    pub time_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub target: Option<TargetRef>,
    pub session_id: Option<Uuid>,
    /// Resume strictly after this position
    pub after: Option<EventCursor>,
}

/// Position in the (occurred_at, id) order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventCursor {
    pub occurred_at_ms: i64,
    pub event_id: i64,
}

impl EventCursor {
    pub fn of(event: &Event) -> Self {
        Self {
            occurred_at_ms: to_ms(event.occurred_at),
            event_id: event.event_id,
        }
    }
}

/// Validate and append in its own transaction
pub async fn append(pool: &SqlitePool, event: NewEvent) -> CoreResult<Event> {
    let mut tx = pool.begin().await?;
    let stored = append_in(&mut tx, event).await?;
    tx.commit().await?;
    Ok(stored)
}

/// Validate and append inside the caller's transaction
pub async fn append_in(conn: &mut SqliteConnection, event: NewEvent) -> CoreResult<Event> {
    let metadata = match event.metadata {
        Value::Object(map) => map,
        other => {
            return Err(CoreError::InvalidMetadata(format!(
                "{}: metadata must be an object, got {}",
                event.kind.as_str(),
                type_name(&other)
            )))
        }
    };
    let payload = EventPayload::parse(event.kind, &metadata)?;
    let indexed = payload.indexed();

    let mut occurred_at_ms = to_ms(event.occurred_at);
    if let Some(user_id) = event.user_id {
        let latest: Option<i64> =
            sqlx::query_scalar(r#"SELECT MAX("occurred_at") FROM "events" WHERE "user_id" = ?"#)
                .bind(user_id)
                .fetch_one(&mut *conn)
                .await?;
        if let Some(latest) = latest {
            occurred_at_ms = occurred_at_ms.max(latest);
        }
    }

    let metadata_text = serde_json::to_string(&metadata)?;
    let result = sqlx::query(
        r#"
        INSERT INTO "events" (
            "user_id", "kind", "target_kind", "target_id", "session_id", "occurred_at", "metadata",
            "quiz_id", "question_id", "is_correct", "lesson_id", "course_id"
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(event.user_id)
    .bind(event.kind.as_str())
    .bind(event.target.kind.as_str())
    .bind(event.target.id)
    .bind(event.session_id.map(|s| s.to_string()))
    .bind(occurred_at_ms)
    .bind(&metadata_text)
    .bind(indexed.quiz_id)
    .bind(indexed.question_id)
    .bind(indexed.is_correct)
    .bind(indexed.lesson_id)
    .bind(indexed.course_id)
    .execute(&mut *conn)
    .await?;

    let stored = Event {
        event_id: result.last_insert_rowid(),
        user_id: event.user_id,
        kind: event.kind,
        target: event.target,
        session_id: event.session_id,
        occurred_at: from_ms(occurred_at_ms),
        metadata,
    };

    tracing::debug!(
        event_id = stored.event_id,
        kind = stored.kind.as_str(),
        user_id = ?stored.user_id,
        "event appended"
    );

    Ok(stored)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub(crate) fn event_from_row(row: &SqliteRow) -> CoreResult<Event> {
    let kind_raw: String = row.try_get("kind")?;
    let kind = EventKind::parse(&kind_raw)
        .ok_or_else(|| CoreError::InvalidMetadata(format!("unknown event kind {kind_raw}")))?;
    let target_kind_raw: String = row.try_get("target_kind")?;
    let target_kind = TargetKind::parse(&target_kind_raw)
        .ok_or_else(|| CoreError::InvalidMetadata(format!("unknown target kind {target_kind_raw}")))?;
    let session_id: Option<String> = row.try_get("session_id")?;
    let metadata_text: String = row.try_get("metadata")?;
    let metadata = match serde_json::from_str::<Value>(&metadata_text)? {
        Value::Object(map) => map,
        _ => return Err(CoreError::InvalidMetadata("stored metadata is not an object".to_string())),
    };

    Ok(Event {
        event_id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        kind,
        target: TargetRef {
            kind: target_kind,
            id: row.try_get("target_id")?,
        },
        session_id: session_id.and_then(|s| Uuid::parse_str(&s).ok()),
        occurred_at: from_ms(row.try_get("occurred_at")?),
        metadata,
    })
}

pub async fn get(pool: &SqlitePool, event_id: i64) -> CoreResult<Option<Event>> {
    let sql = format!(r#"SELECT {EVENT_COLUMNS} FROM "events" WHERE "id" = ?"#);
    let row = sqlx::query(&sql).bind(event_id).fetch_optional(pool).await?;
    row.as_ref().map(event_from_row).transpose()
}

/// All events of one session in (occurred_at, id) order
pub async fn by_session(conn: &mut SqliteConnection, session_id: Uuid) -> CoreResult<Vec<Event>> {
    let sql = format!(
        r#"SELECT {EVENT_COLUMNS} FROM "events" WHERE "session_id" = ? ORDER BY "occurred_at", "id""#
    );
    let rows = sqlx::query(&sql)
        .bind(session_id.to_string())
        .fetch_all(&mut *conn)
        .await?;
    rows.iter().map(event_from_row).collect()
}

/// Events in id order after `after_id`; used for log replay
pub async fn page_by_id(pool: &SqlitePool, after_id: i64, limit: i64) -> CoreResult<Vec<Event>> {
    let sql = format!(r#"SELECT {EVENT_COLUMNS} FROM "events" WHERE "id" > ? ORDER BY "id" LIMIT ?"#);
    let rows = sqlx::query(&sql)
        .bind(after_id)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    rows.iter().map(event_from_row).collect()
}

async fn fetch_page(pool: &SqlitePool, query: &EventQuery, limit: i64) -> CoreResult<Vec<Event>> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(r#"SELECT {EVENT_COLUMNS} FROM "events" WHERE 1 = 1"#));

    if let Some(user_id) = query.user_id {
        qb.push(r#" AND "user_id" = "#).push_bind(user_id);
    }
    if let Some(kind) = query.kind {
        qb.push(r#" AND "kind" = "#).push_bind(kind.as_str());
    }
    if let Some(target) = query.target {
        qb.push(r#" AND "target_kind" = "#)
            .push_bind(target.kind.as_str())
            .push(r#" AND "target_id" = "#)
            .push_bind(target.id);
    }
    if let Some(session_id) = query.session_id {
        qb.push(r#" AND "session_id" = "#).push_bind(session_id.to_string());
    }
    if let Some((start, end)) = query.time_range {
        qb.push(r#" AND "occurred_at" >= "#)
            .push_bind(to_ms(start))
            .push(r#" AND "occurred_at" < "#)
            .push_bind(to_ms(end));
    }
    if let Some(cursor) = query.after {
        qb.push(r#" AND ("occurred_at", "id") > ("#)
            .push_bind(cursor.occurred_at_ms)
            .push(", ")
            .push_bind(cursor.event_id)
            .push(")");
    }
    qb.push(r#" ORDER BY "occurred_at", "id" LIMIT "#).push_bind(limit);

    let rows = qb.build().fetch_all(pool).await?;
    rows.iter().map(event_from_row).collect()
}

/// Lazy, finite, time-ordered sequence of matching events.
///
/// Pages are fetched on demand with keyset pagination on (occurred_at, id), so the
/// stream can be dropped at any point and resumed from [`EventCursor::of`] the last
/// event seen.
pub fn range(pool: SqlitePool, query: EventQuery) -> impl Stream<Item = CoreResult<Event>> + Send + 'static {
    stream::try_unfold(
        (pool, query, false),
        |(pool, mut query, exhausted)| async move {
            if exhausted {
                return Ok::<_, CoreError>(None);
            }
            let page = fetch_page(&pool, &query, RANGE_PAGE_SIZE).await?;
            if page.is_empty() {
                return Ok(None);
            }
            let exhausted = (page.len() as i64) < RANGE_PAGE_SIZE;
            query.after = page.last().map(EventCursor::of);
            Ok(Some((page, (pool, query, exhausted))))
        },
    )
    .map_ok(|page| stream::iter(page.into_iter().map(Ok::<Event, CoreError>)))
    .try_flatten()
}

/// Latest occurrence per user of any event; None when the user has no history
pub async fn latest_event_at(pool: &SqlitePool, user_id: i64) -> CoreResult<Option<DateTime<Utc>>> {
    let latest: Option<i64> =
        sqlx::query_scalar(r#"SELECT MAX("occurred_at") FROM "events" WHERE "user_id" = ?"#)
            .bind(user_id)
            .fetch_one(pool)
            .await?;
    Ok(latest.map(from_ms))
}
