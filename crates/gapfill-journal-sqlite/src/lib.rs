#![forbid(unsafe_code)]

use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use gapfill_domain::{
    format_rfc3339, now_utc, parse_rfc3339, DocumentKey, EventRow, JournalEvent,
    JournalEventType, MarketTiming, ModelCallRecord, Note, NoteCategory, RunId, RunRecord,
    RunStatus,
};
use gapfill_journal_core::RunJournal;
use rusqlite::{params, Connection, OptionalExtension};
use ulid::Ulid;

const JOURNAL_SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
  run_id TEXT PRIMARY KEY,
  ticker TEXT NOT NULL,
  report_date TEXT NOT NULL,
  timing TEXT NOT NULL CHECK (timing IN ('premarket','afterhours')),
  fiscal_period_end TEXT,
  pipeline_hash TEXT NOT NULL,
  started_at TEXT NOT NULL,
  ended_at TEXT,
  status TEXT NOT NULL CHECK (status IN ('running','completed','failed')),
  outcome_json TEXT
);

CREATE TABLE IF NOT EXISTS notes (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id TEXT NOT NULL,
  note_seq INTEGER NOT NULL,
  category TEXT NOT NULL,
  content TEXT NOT NULL,
  document TEXT,
  recorded_at TEXT NOT NULL,
  UNIQUE(run_id, note_seq),
  FOREIGN KEY (run_id) REFERENCES runs(run_id)
);

CREATE TABLE IF NOT EXISTS model_calls (
  model_call_id TEXT PRIMARY KEY,
  run_id TEXT NOT NULL,
  document TEXT NOT NULL,
  backend_name TEXT NOT NULL,
  model_id TEXT NOT NULL,
  request_hash TEXT NOT NULL,
  response_hash TEXT NOT NULL,
  stop_reason TEXT NOT NULL,
  latency_ms INTEGER,
  input_tokens INTEGER,
  output_tokens INTEGER,
  started_at TEXT NOT NULL,
  ended_at TEXT NOT NULL,
  FOREIGN KEY (run_id) REFERENCES runs(run_id)
);

CREATE TABLE IF NOT EXISTS journal_events (
  event_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  event_id TEXT NOT NULL UNIQUE,
  run_id TEXT NOT NULL,
  document TEXT,
  event_type TEXT NOT NULL,
  occurred_at TEXT NOT NULL,
  payload_json TEXT NOT NULL,
  payload_hash TEXT NOT NULL,
  prev_event_hash TEXT,
  event_hash TEXT NOT NULL,
  FOREIGN KEY (run_id) REFERENCES runs(run_id)
);

CREATE INDEX IF NOT EXISTS idx_journal_events_run ON journal_events(run_id, event_seq);

CREATE TRIGGER IF NOT EXISTS trg_journal_events_no_update
BEFORE UPDATE ON journal_events
BEGIN
  SELECT RAISE(FAIL, 'journal_events is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_journal_events_no_delete
BEFORE DELETE ON journal_events
BEGIN
  SELECT RAISE(FAIL, 'journal_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_notes_no_update
BEFORE UPDATE ON notes
BEGIN
  SELECT RAISE(FAIL, 'notes is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_notes_no_delete
BEFORE DELETE ON notes
BEGIN
  SELECT RAISE(FAIL, 'notes is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_model_calls_no_update
BEFORE UPDATE ON model_calls
BEGIN
  SELECT RAISE(FAIL, 'model_calls is append-only');
END;
";

pub struct SqliteRunJournal {
    conn: Connection,
}

impl SqliteRunJournal {
    /// Open or create a `SQLite` journal database and configure local pragmas.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Open a journal and apply the schema in one step.
    ///
    /// # Errors
    /// Returns an error if opening or migrating fails.
    pub fn open_migrated(path: &Path) -> Result<Self> {
        let journal = Self::open(path)?;
        journal.migrate()?;
        Ok(journal)
    }
}

impl RunJournal for SqliteRunJournal {
    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA_V1)
            .context("failed to apply journal schema")?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![JOURNAL_SCHEMA_VERSION, format_rfc3339(now_utc())?],
            )
            .context("failed to record journal migration")?;

        Ok(())
    }

    fn insert_run(&self, run: &RunRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO runs(
                    run_id, ticker, report_date, timing, fiscal_period_end,
                    pipeline_hash, started_at, ended_at, status, outcome_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    run.run_id.to_string(),
                    run.ticker,
                    run.report_date,
                    run.timing.as_str(),
                    run.fiscal_period_end,
                    run.pipeline_hash,
                    format_rfc3339(run.started_at)?,
                    run.ended_at.map(format_rfc3339).transpose()?,
                    run.status.as_str(),
                    run.outcome_json
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                ],
            )
            .context("failed to insert run")?;
        Ok(())
    }

    fn update_run_finished(
        &self,
        run_id: RunId,
        status: RunStatus,
        outcome: &serde_json::Value,
    ) -> Result<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE runs SET status = ?2, ended_at = ?3, outcome_json = ?4 WHERE run_id = ?1",
                params![
                    run_id.to_string(),
                    status.as_str(),
                    format_rfc3339(now_utc())?,
                    serde_json::to_string(outcome)?,
                ],
            )
            .context("failed to update run status")?;
        if updated == 0 {
            return Err(anyhow!("run not found: {run_id}"));
        }
        Ok(())
    }

    fn append_event(&self, event: &JournalEvent) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO journal_events(
                    event_id, run_id, document, event_type, occurred_at,
                    payload_json, payload_hash, prev_event_hash, event_hash
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    event.event_id.to_string(),
                    event.run_id.to_string(),
                    event.document.as_ref().map(DocumentKey::as_str),
                    event.event_type.as_str(),
                    format_rfc3339(event.occurred_at)?,
                    serde_json::to_string(&event.payload_json)?,
                    event.payload_hash,
                    event.prev_event_hash,
                    event.event_hash,
                ],
            )
            .context("failed to append journal event")?;

        Ok(self.conn.last_insert_rowid())
    }

    fn append_note(&self, run_id: RunId, note: &Note) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO notes(run_id, note_seq, category, content, document, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    run_id.to_string(),
                    i64::try_from(note.seq).context("note sequence overflow")?,
                    note.category.as_str(),
                    note.content,
                    note.document.as_ref().map(DocumentKey::as_str),
                    format_rfc3339(note.recorded_at)?,
                ],
            )
            .context("failed to append note")?;
        Ok(())
    }

    fn append_model_call(
        &self,
        run_id: RunId,
        document: &DocumentKey,
        call: &ModelCallRecord,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO model_calls(
                    model_call_id, run_id, document, backend_name, model_id,
                    request_hash, response_hash, stop_reason, latency_ms,
                    input_tokens, output_tokens, started_at, ended_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    call.model_call_id.to_string(),
                    run_id.to_string(),
                    document.as_str(),
                    call.backend_name,
                    call.model_id,
                    call.request_hash,
                    call.response_hash,
                    call.stop_reason,
                    call.latency_ms.and_then(|value| i64::try_from(value).ok()),
                    call.input_tokens,
                    call.output_tokens,
                    format_rfc3339(call.started_at)?,
                    format_rfc3339(call.ended_at)?,
                ],
            )
            .context("failed to append model call")?;
        Ok(())
    }

    fn list_runs(&self) -> Result<Vec<RunRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                run_id, ticker, report_date, timing, fiscal_period_end,
                pipeline_hash, started_at, ended_at, status, outcome_json
             FROM runs
             ORDER BY started_at DESC, run_id ASC",
        )?;

        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(run_from_row(row)?);
        }
        Ok(out)
    }

    fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                run_id, ticker, report_date, timing, fiscal_period_end,
                pipeline_hash, started_at, ended_at, status, outcome_json
             FROM runs WHERE run_id = ?1",
        )?;
        let row = stmt
            .query_row(params![run_id.to_string()], |row| {
                Ok(RawRun {
                    run_id: row.get(0)?,
                    ticker: row.get(1)?,
                    report_date: row.get(2)?,
                    timing: row.get(3)?,
                    fiscal_period_end: row.get(4)?,
                    pipeline_hash: row.get(5)?,
                    started_at: row.get(6)?,
                    ended_at: row.get(7)?,
                    status: row.get(8)?,
                    outcome_json: row.get(9)?,
                })
            })
            .optional()?;
        row.map(RawRun::into_record).transpose()
    }

    fn list_events_for_run(&self, run_id: RunId) -> Result<Vec<EventRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                event_seq, event_id, run_id, document, event_type, occurred_at,
                payload_json, payload_hash, prev_event_hash, event_hash
             FROM journal_events
             WHERE run_id = ?1
             ORDER BY event_seq ASC",
        )?;

        let mut rows = stmt.query(params![run_id.to_string()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let event_id_raw: String = row.get(1)?;
            let run_id_raw: String = row.get(2)?;
            let document_raw: Option<String> = row.get(3)?;
            let event_type_raw: String = row.get(4)?;
            let payload_raw: String = row.get(6)?;
            out.push(EventRow {
                event_seq: row.get(0)?,
                event: JournalEvent {
                    event_id: Ulid::from_str(&event_id_raw)
                        .map_err(|err| anyhow!("invalid event_id ULID: {err}"))?,
                    run_id: parse_run_id(&run_id_raw)?,
                    document: document_raw.map(DocumentKey::new),
                    event_type: JournalEventType::parse(&event_type_raw)
                        .ok_or_else(|| anyhow!("unknown journal event type: {event_type_raw}"))?,
                    occurred_at: parse_rfc3339(&row.get::<_, String>(5)?)?,
                    payload_json: serde_json::from_str(&payload_raw)
                        .context("invalid payload_json")?,
                    payload_hash: row.get(7)?,
                    prev_event_hash: row.get(8)?,
                    event_hash: row.get(9)?,
                },
            });
        }
        Ok(out)
    }

    fn list_notes_for_run(&self, run_id: RunId) -> Result<Vec<Note>> {
        let mut stmt = self.conn.prepare(
            "SELECT note_seq, category, content, document, recorded_at
             FROM notes
             WHERE run_id = ?1
             ORDER BY note_seq ASC",
        )?;

        let mut rows = stmt.query(params![run_id.to_string()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let category_raw: String = row.get(1)?;
            let document_raw: Option<String> = row.get(3)?;
            out.push(Note {
                seq: usize::try_from(row.get::<_, i64>(0)?).context("invalid note_seq")?,
                category: NoteCategory::parse(&category_raw)
                    .ok_or_else(|| anyhow!("unknown note category: {category_raw}"))?,
                content: row.get(2)?,
                document: document_raw.map(DocumentKey::new),
                recorded_at: parse_rfc3339(&row.get::<_, String>(4)?)?,
            });
        }
        Ok(out)
    }
}

struct RawRun {
    run_id: String,
    ticker: String,
    report_date: String,
    timing: String,
    fiscal_period_end: Option<String>,
    pipeline_hash: String,
    started_at: String,
    ended_at: Option<String>,
    status: String,
    outcome_json: Option<String>,
}

impl RawRun {
    fn into_record(self) -> Result<RunRecord> {
        Ok(RunRecord {
            run_id: parse_run_id(&self.run_id)?,
            ticker: self.ticker,
            report_date: self.report_date,
            timing: MarketTiming::parse(&self.timing)
                .ok_or_else(|| anyhow!("unknown market timing: {}", self.timing))?,
            fiscal_period_end: self.fiscal_period_end,
            pipeline_hash: self.pipeline_hash,
            started_at: parse_rfc3339(&self.started_at)?,
            ended_at: self.ended_at.map(|value| parse_rfc3339(&value)).transpose()?,
            status: RunStatus::parse(&self.status)
                .ok_or_else(|| anyhow!("unknown run status: {}", self.status))?,
            outcome_json: self
                .outcome_json
                .map(|value| serde_json::from_str(&value))
                .transpose()
                .context("invalid outcome_json")?,
        })
    }
}

fn run_from_row(row: &rusqlite::Row<'_>) -> Result<RunRecord> {
    RawRun {
        run_id: row.get(0)?,
        ticker: row.get(1)?,
        report_date: row.get(2)?,
        timing: row.get(3)?,
        fiscal_period_end: row.get(4)?,
        pipeline_hash: row.get(5)?,
        started_at: row.get(6)?,
        ended_at: row.get(7)?,
        status: row.get(8)?,
        outcome_json: row.get(9)?,
    }
    .into_record()
}

fn parse_run_id(value: &str) -> Result<RunId> {
    Ulid::from_str(value)
        .map(RunId)
        .map_err(|err| anyhow!("invalid run_id ULID: {err}"))
}
