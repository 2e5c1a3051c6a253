#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use splitserve_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, PredictionEvent, PredictionEventInput,
    VariantLabel,
};
use ulid::Ulid;

const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS prediction_events (
    event_seq INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id TEXT NOT NULL UNIQUE,
    recorded_at TEXT NOT NULL,
    variant TEXT NOT NULL CHECK (variant IN ('A', 'B')),
    input_features TEXT NOT NULL,
    prediction REAL NOT NULL,
    latency_ms REAL NOT NULL CHECK (latency_ms >= 0.0)
);

CREATE INDEX IF NOT EXISTS idx_prediction_events_variant
    ON prediction_events(variant);

CREATE TRIGGER IF NOT EXISTS prediction_events_no_update
BEFORE UPDATE ON prediction_events
BEGIN
    SELECT RAISE(FAIL, 'prediction_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS prediction_events_no_delete
BEFORE DELETE ON prediction_events
BEGIN
    SELECT RAISE(FAIL, 'prediction_events is append-only');
END;
";

/// Append-only SQLite store for served prediction events.
pub struct SqliteEventStore {
    conn: Connection,
}

impl SqliteEventStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA)
            .context("failed to apply prediction event schema")?;

        let applied: Option<i64> = self
            .conn
            .query_row(
                "SELECT version FROM schema_migrations WHERE version = ?1",
                params![SCHEMA_VERSION],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read schema_migrations")?;

        if applied.is_none() {
            let applied_at = format_rfc3339(now_utc())
                .context("failed to format schema migration timestamp")?;
            self.conn
                .execute(
                    "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                    params![SCHEMA_VERSION, applied_at],
                )
                .context("failed to record schema version")?;
        }

        Ok(())
    }

    pub fn schema_version(&self) -> Result<i64> {
        let version: Option<i64> = self
            .conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))
            .context("failed to read schema version")?;
        Ok(version.unwrap_or(0))
    }

    /// Validates and appends one prediction event. The store assigns the
    /// sequence number and the write timestamp; rows are never mutated
    /// afterwards.
    pub fn append_event(&mut self, input: &PredictionEventInput) -> Result<PredictionEvent> {
        input
            .validate()
            .context("prediction event rejected by validation")?;

        let recorded_at = now_utc();
        let recorded_at_text =
            format_rfc3339(recorded_at).context("failed to format recorded_at")?;
        let features_json = serde_json::to_string(&input.input_features)
            .context("failed to encode input_features")?;

        let tx = self
            .conn
            .transaction()
            .context("failed to begin append transaction")?;
        tx.execute(
            "INSERT INTO prediction_events
                 (request_id, recorded_at, variant, input_features, prediction, latency_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                input.request_id.to_string(),
                recorded_at_text,
                input.variant.as_str(),
                features_json,
                input.prediction,
                input.latency_ms,
            ],
        )
        .with_context(|| format!("failed to append prediction event {}", input.request_id))?;
        let event_seq = tx.last_insert_rowid();
        tx.commit().context("failed to commit append transaction")?;

        Ok(PredictionEvent {
            event_seq,
            request_id: input.request_id,
            recorded_at,
            variant: input.variant,
            input_features: input.input_features.clone(),
            prediction: input.prediction,
            latency_ms: input.latency_ms,
        })
    }

    pub fn list_events(&self) -> Result<Vec<PredictionEvent>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT event_seq, request_id, recorded_at, variant, input_features,
                        prediction, latency_ms
                 FROM prediction_events
                 ORDER BY event_seq ASC",
            )
            .context("failed to prepare event listing")?;
        collect_events(&mut stmt, [])
    }

    pub fn list_events_by_variant(&self, variant: VariantLabel) -> Result<Vec<PredictionEvent>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT event_seq, request_id, recorded_at, variant, input_features,
                        prediction, latency_ms
                 FROM prediction_events
                 WHERE variant = ?1
                 ORDER BY event_seq ASC",
            )
            .context("failed to prepare variant event listing")?;
        collect_events(&mut stmt, params![variant.as_str()])
    }

    pub fn list_events_from_seq(&self, from_seq: i64) -> Result<Vec<PredictionEvent>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT event_seq, request_id, recorded_at, variant, input_features,
                        prediction, latency_ms
                 FROM prediction_events
                 WHERE event_seq >= ?1
                 ORDER BY event_seq ASC",
            )
            .context("failed to prepare cursor event listing")?;
        collect_events(&mut stmt, params![from_seq])
    }

    pub fn find_event_by_request_id(&self, request_id: Ulid) -> Result<Option<PredictionEvent>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT event_seq, request_id, recorded_at, variant, input_features,
                        prediction, latency_ms
                 FROM prediction_events
                 WHERE request_id = ?1",
            )
            .context("failed to prepare request_id lookup")?;
        stmt.query_row(params![request_id.to_string()], parse_event_row)
            .optional()
            .with_context(|| format!("failed to look up prediction event {}", request_id))
    }

    pub fn count_events(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM prediction_events", [], |row| row.get(0))
            .context("failed to count prediction events")
    }
}

fn collect_events<P: rusqlite::Params>(
    stmt: &mut rusqlite::Statement<'_>,
    params: P,
) -> Result<Vec<PredictionEvent>> {
    let rows = stmt
        .query_map(params, parse_event_row)
        .context("failed to query prediction events")?;

    let mut events = Vec::new();
    for row in rows {
        events.push(row.context("failed to decode prediction event row")?);
    }
    Ok(events)
}

fn parse_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PredictionEvent> {
    let event_seq: i64 = row.get(0)?;
    let request_id_text: String = row.get(1)?;
    let recorded_at_text: String = row.get(2)?;
    let variant_text: String = row.get(3)?;
    let features_text: String = row.get(4)?;
    let prediction: f64 = row.get(5)?;
    let latency_ms: f64 = row.get(6)?;

    let request_id = Ulid::from_string(&request_id_text)
        .map_err(|err| invalid_text_error(1, format!("invalid request_id ulid: {err}")))?;
    let recorded_at = parse_rfc3339_utc(&recorded_at_text)
        .map_err(|err| invalid_text_error(2, format!("invalid recorded_at: {err}")))?;
    let variant = VariantLabel::parse(&variant_text)
        .ok_or_else(|| invalid_text_error(3, format!("unknown variant label: {variant_text}")))?;
    let input_features: Vec<f64> = serde_json::from_str(&features_text)
        .map_err(|err| invalid_text_error(4, format!("invalid input_features json: {err}")))?;

    Ok(PredictionEvent {
        event_seq,
        request_id,
        recorded_at,
        variant,
        input_features,
        prediction,
        latency_ms,
    })
}

fn invalid_text_error(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, message.into())
}
