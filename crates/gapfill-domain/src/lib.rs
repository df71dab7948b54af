#![forbid(unsafe_code)]

use std::fmt::{Display, Formatter};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

pub type DateTimeUtc = OffsetDateTime;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RunId(pub Ulid);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Storage-level identifier of one target spreadsheet, e.g. `financials-quarterly-income`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct DocumentKey(String);

impl DocumentKey {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DocumentKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NoteCategory {
    DataGathered,
    EmptyCells,
    Validation,
    Decision,
    Error,
    FileComplete,
    FileSkipped,
}

impl NoteCategory {
    pub const ALL: [Self; 7] = [
        Self::DataGathered,
        Self::EmptyCells,
        Self::Validation,
        Self::Decision,
        Self::Error,
        Self::FileComplete,
        Self::FileSkipped,
    ];

    /// Categories the model may use through the note tool; the rest are system-only.
    pub const MODEL_WRITABLE: [Self; 5] = [
        Self::DataGathered,
        Self::EmptyCells,
        Self::Validation,
        Self::Decision,
        Self::Error,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DataGathered => "data_gathered",
            Self::EmptyCells => "empty_cells",
            Self::Validation => "validation",
            Self::Decision => "decision",
            Self::Error => "error",
            Self::FileComplete => "file_complete",
            Self::FileSkipped => "file_skipped",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "data_gathered" => Some(Self::DataGathered),
            "empty_cells" => Some(Self::EmptyCells),
            "validation" => Some(Self::Validation),
            "decision" => Some(Self::Decision),
            "error" => Some(Self::Error),
            "file_complete" => Some(Self::FileComplete),
            "file_skipped" => Some(Self::FileSkipped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Note {
    pub seq: usize,
    pub category: NoteCategory,
    pub content: String,
    pub document: Option<DocumentKey>,
    pub recorded_at: DateTimeUtc,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    Income,
    Balance,
    Cashflow,
}

impl StatementKind {
    pub const ALL: [Self; 3] = [Self::Income, Self::Balance, Self::Cashflow];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Income => "income",
            Self::Balance => "balance",
            Self::Cashflow => "cashflow",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "income" => Some(Self::Income),
            "balance" => Some(Self::Balance),
            "cashflow" => Some(Self::Cashflow),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PeriodKind {
    Annual,
    Quarterly,
}

impl PeriodKind {
    pub const ALL: [Self; 2] = [Self::Annual, Self::Quarterly];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Annual => "annual",
            Self::Quarterly => "quarterly",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "annual" => Some(Self::Annual),
            "quarterly" => Some(Self::Quarterly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum DataVariant {
    Standardized,
    AsReported,
}

impl DataVariant {
    pub const ALL: [Self; 2] = [Self::Standardized, Self::AsReported];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standardized => "standardized",
            Self::AsReported => "as-reported",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "standardized" => Some(Self::Standardized),
            "as-reported" => Some(Self::AsReported),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct BrowseTarget {
    pub statement_kind: StatementKind,
    pub period: PeriodKind,
    pub data_variant: DataVariant,
}

impl Display for BrowseTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.statement_kind.as_str(),
            self.period.as_str(),
            self.data_variant.as_str()
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MarketTiming {
    Premarket,
    Afterhours,
}

impl MarketTiming {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Premarket => "premarket",
            Self::Afterhours => "afterhours",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "premarket" => Some(Self::Premarket),
            "afterhours" => Some(Self::Afterhours),
            _ => None,
        }
    }
}

/// A single tool invocation emitted by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Serialized outcome of a tool call, fed back to the model on the next turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolResult {
    pub tool_use_id: String,
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    #[must_use]
    pub fn success(tool_use_id: &str, payload: &Value) -> Self {
        Self {
            tool_use_id: tool_use_id.to_string(),
            content: payload.to_string(),
            is_error: false,
        }
    }

    #[must_use]
    pub fn failure(tool_use_id: &str, code: &str, message: &str) -> Self {
        Self {
            tool_use_id: tool_use_id.to_string(),
            content: json!({ "error": { "code": code, "message": message } }).to_string(),
            is_error: true,
        }
    }

    /// Error code carried by a failure payload, if any.
    #[must_use]
    pub fn error_code(&self) -> Option<String> {
        if !self.is_error {
            return None;
        }
        serde_json::from_str::<Value>(&self.content)
            .ok()?
            .pointer("/error/code")
            .and_then(Value::as_str)
            .map(ToString::to_string)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum CellValue {
    Number(f64),
    Bool(bool),
    Text(String),
}

impl CellValue {
    /// Convert a model-supplied JSON scalar. Plain decimal strings become numbers.
    #[must_use]
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(number) => number.as_f64().map(Self::Number),
            Value::Bool(flag) => Some(Self::Bool(*flag)),
            Value::String(text) => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    return None;
                }
                if is_plain_decimal(trimmed) {
                    if let Ok(number) = trimmed.parse::<f64>() {
                        return Some(Self::Number(number));
                    }
                }
                Some(Self::Text(trimmed.to_string()))
            }
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Number(number) => json!(number),
            Self::Bool(flag) => json!(flag),
            Self::Text(text) => json!(text),
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Number(_) | Self::Bool(_) => None,
        }
    }
}

impl Display for CellValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(number) => {
                if number.fract() == 0.0 && number.abs() < 1e15 {
                    write!(f, "{number:.0}")
                } else {
                    write!(f, "{number}")
                }
            }
            Self::Bool(flag) => write!(f, "{flag}"),
            Self::Text(text) => f.write_str(text),
        }
    }
}

fn is_plain_decimal(value: &str) -> bool {
    let digits = value.strip_prefix('-').unwrap_or(value);
    let mut seen_dot = false;
    let mut seen_digit = false;
    for ch in digits.chars() {
        match ch {
            '0'..='9' => seen_digit = true,
            '.' if !seen_dot => seen_dot = true,
            _ => return false,
        }
    }
    seen_digit
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CellUpdate {
    pub sheet: String,
    pub cell: String,
    pub value: CellValue,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RowNeedingData {
    pub row: u32,
    pub label: String,
    pub target_cell: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ColumnInsertionResult {
    pub success: bool,
    pub rows_needing_data: Vec<RowNeedingData>,
    pub summary: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Skip,
    FillEmpty,
    InsertPeriod,
}

impl PipelineState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Skip => "skip",
            Self::FillEmpty => "fill_empty",
            Self::InsertPeriod => "insert_period",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// The model ended its turn without further tool calls.
    Finished,
    BudgetExhausted,
    ModelFailed,
    Skipped,
    Missing,
    /// The audit journal failed mid-document; writes so far were still flushed.
    JournalFailed,
}

impl Termination {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Finished => "finished",
            Self::BudgetExhausted => "budget_exhausted",
            Self::ModelFailed => "model_failed",
            Self::Skipped => "skipped",
            Self::Missing => "missing",
            Self::JournalFailed => "journal_failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentOutcome {
    pub document: DocumentKey,
    pub state: Option<PipelineState>,
    pub termination: Termination,
    pub iterations: u32,
    pub writes: u32,
    pub persisted: bool,
    pub uploaded: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunRequest {
    pub ticker: String,
    pub report_date: String,
    pub timing: MarketTiming,
    #[serde(default)]
    pub fiscal_period_end: Option<String>,
}

impl RunRequest {
    /// Check the identifier and ISO date fields.
    ///
    /// # Errors
    /// Returns an error when the ticker is empty or a date is not `YYYY-MM-DD`.
    pub fn validate(&self) -> Result<()> {
        ensure_non_empty("ticker", &self.ticker)?;
        if !is_iso_date(&self.report_date) {
            return Err(anyhow!(
                "report_date MUST be an ISO date (YYYY-MM-DD), got '{}'",
                self.report_date
            ));
        }
        if let Some(period_end) = &self.fiscal_period_end {
            if !is_iso_date(period_end) {
                return Err(anyhow!(
                    "fiscal_period_end MUST be an ISO date (YYYY-MM-DD), got '{period_end}'"
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub success: bool,
    pub ticker: String,
    pub files_updated: usize,
    pub completed_files: Vec<DocumentKey>,
    pub data_sources: Vec<String>,
    pub iterations: u32,
    pub notes_count: usize,
    pub documents: Vec<DocumentOutcome>,
    pub error: Option<String>,
}

impl RunOutcome {
    #[must_use]
    pub fn status(&self) -> RunStatus {
        if self.success {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        }
    }
}

/// Body of the single outbound notification sent when a run ends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletionPayload {
    pub ticker: String,
    pub report_date: String,
    pub timing: MarketTiming,
    pub status: RunStatus,
    pub files_updated: usize,
    pub data_sources_used: Vec<String>,
    pub error_message: Option<String>,
}

impl CompletionPayload {
    #[must_use]
    pub fn from_outcome(request: &RunRequest, outcome: &RunOutcome) -> Self {
        Self {
            ticker: request.ticker.clone(),
            report_date: request.report_date.clone(),
            timing: request.timing,
            status: outcome.status(),
            files_updated: outcome.files_updated,
            data_sources_used: outcome.data_sources.clone(),
            error_message: outcome.error.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelCallRecord {
    pub model_call_id: Ulid,
    pub backend_name: String,
    pub model_id: String,
    pub request_hash: String,
    pub response_hash: String,
    pub stop_reason: String,
    pub latency_ms: Option<u64>,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub started_at: DateTimeUtc,
    pub ended_at: DateTimeUtc,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum JournalEventType {
    RunStarted,
    RunFinished,
    DocumentStarted,
    DocumentFinished,
    ModelCalled,
    ToolDispatched,
    NoteRecorded,
    SourceDisagreement,
    DocumentUploaded,
    CallbackDelivered,
    Warning,
}

impl JournalEventType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunStarted => "run_started",
            Self::RunFinished => "run_finished",
            Self::DocumentStarted => "document_started",
            Self::DocumentFinished => "document_finished",
            Self::ModelCalled => "model_called",
            Self::ToolDispatched => "tool_dispatched",
            Self::NoteRecorded => "note_recorded",
            Self::SourceDisagreement => "source_disagreement",
            Self::DocumentUploaded => "document_uploaded",
            Self::CallbackDelivered => "callback_delivered",
            Self::Warning => "warning",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "run_started" => Some(Self::RunStarted),
            "run_finished" => Some(Self::RunFinished),
            "document_started" => Some(Self::DocumentStarted),
            "document_finished" => Some(Self::DocumentFinished),
            "model_called" => Some(Self::ModelCalled),
            "tool_dispatched" => Some(Self::ToolDispatched),
            "note_recorded" => Some(Self::NoteRecorded),
            "source_disagreement" => Some(Self::SourceDisagreement),
            "document_uploaded" => Some(Self::DocumentUploaded),
            "callback_delivered" => Some(Self::CallbackDelivered),
            "warning" => Some(Self::Warning),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct JournalEvent {
    pub event_id: Ulid,
    pub run_id: RunId,
    pub document: Option<DocumentKey>,
    pub event_type: JournalEventType,
    pub occurred_at: DateTimeUtc,
    pub payload_json: Value,
    pub payload_hash: String,
    pub prev_event_hash: Option<String>,
    pub event_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EventRow {
    pub event_seq: i64,
    pub event: JournalEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunRecord {
    pub run_id: RunId,
    pub ticker: String,
    pub report_date: String,
    pub timing: MarketTiming,
    pub fiscal_period_end: Option<String>,
    pub pipeline_hash: String,
    pub started_at: DateTimeUtc,
    pub ended_at: Option<DateTimeUtc>,
    pub status: RunStatus,
    pub outcome_json: Option<Value>,
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc()
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash a JSON value with stable `serde_json` serialization + SHA-256.
///
/// # Errors
/// Returns an error if JSON serialization fails.
pub fn hash_json(value: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hash_bytes(&bytes))
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns an error when the provided value is empty/whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("{field_name} MUST be non-empty"));
    }
    Ok(())
}

/// True when `value` starts with a valid calendar date in `YYYY-MM-DD` form.
#[must_use]
pub fn is_iso_date(value: &str) -> bool {
    let Some(prefix) = value.get(..10) else {
        return false;
    };
    let well_formed = prefix.bytes().enumerate().all(|(index, byte)| match index {
        4 | 7 => byte == b'-',
        _ => byte.is_ascii_digit(),
    });
    if !well_formed {
        return false;
    }
    let (Ok(year), Ok(month), Ok(day)) = (
        prefix[..4].parse::<i32>(),
        prefix[5..7].parse::<u8>(),
        prefix[8..10].parse::<u8>(),
    ) else {
        return false;
    };
    let Ok(month) = time::Month::try_from(month) else {
        return false;
    };
    time::Date::from_calendar_date(year, month, day).is_ok()
}

/// Format a timestamp as RFC 3339.
///
/// # Errors
/// Returns an error when the timestamp cannot be represented.
pub fn format_rfc3339(value: DateTimeUtc) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid RFC3339 value: {err}"))
}

/// Parse an RFC 3339 timestamp.
///
/// # Errors
/// Returns an error when the input is not RFC 3339.
pub fn parse_rfc3339(value: &str) -> Result<DateTimeUtc> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid RFC3339 timestamp: {err}"))
}
