#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use gapfill_capabilities::{
    BrowserSession, CapabilityError, Screenshot, VisionExtractor, WebSearch,
    DEFAULT_EXTRACTION_INSTRUCTION,
};
use gapfill_domain::{
    is_iso_date, now_utc, BrowseTarget, CellValue, ColumnInsertionResult, DataVariant,
    DocumentKey, Note, NoteCategory, PeriodKind, StatementKind, ToolCall, ToolResult,
};
use gapfill_grid::{load_workbook, CellRef, GridError, Workbook, WorkbookCodec, PERIOD_INSERT_COLUMN};
use gapfill_provider::ToolSpec;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

const NOTE_ECHO_CHARS: usize = 200;
const DISAGREEMENT_PREFIX: &str = "DISAGREEMENT";

/// Append-only, categorized memory shared by every document of one run.
#[derive(Debug, Clone, Default)]
pub struct Scratchpad {
    notes: Vec<Note>,
}

impl Scratchpad {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a note and return the running count.
    pub fn record(
        &mut self,
        category: NoteCategory,
        content: &str,
        document: Option<&DocumentKey>,
    ) -> usize {
        let seq = self.notes.len() + 1;
        let echo: String = content.chars().take(NOTE_ECHO_CHARS).collect();
        info!(
            category = category.as_str(),
            document = document.map_or("-", DocumentKey::as_str),
            total_notes = seq,
            "note: {echo}"
        );
        self.notes.push(Note {
            seq,
            category,
            content: content.to_string(),
            document: document.cloned(),
            recorded_at: now_utc(),
        });
        seq
    }

    #[must_use]
    pub fn notes(&self) -> &[Note] {
        &self.notes
    }

    /// Notes appended after the first `count`.
    #[must_use]
    pub fn notes_since(&self, count: usize) -> &[Note] {
        self.notes.get(count..).unwrap_or_default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.notes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    #[must_use]
    pub fn render_summary(&self) -> String {
        render_summary(&self.notes)
    }
}

/// One line per note, in append order, prefixed with its category. No notes renders as "".
#[must_use]
pub fn render_summary(notes: &[Note]) -> String {
    notes
        .iter()
        .map(|note| match &note.document {
            Some(document) => format!(
                "[{}] {document}: {}",
                note.category.as_str(),
                note.content
            ),
            None => format!("[{}] {}", note.category.as_str(), note.content),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DispatchError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("no current document is selected; cell writes need an active document")]
    NoCurrentDocument,
    #[error("write rejected: {0}")]
    WriteRejected(String),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error(transparent)]
    Grid(#[from] GridError),
}

impl DispatchError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownTool(_) => "unknown_tool",
            Self::InvalidArguments(_) => "invalid_arguments",
            Self::NoCurrentDocument => "no_current_document",
            Self::WriteRejected(_) => "write_rejected",
            Self::ProtocolViolation(_) => "protocol_violation",
            Self::Capability(err) => err.code(),
            Self::Grid(err) => err.code(),
        }
    }
}

/// Cells a document accepts writes for during the current pipeline step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteScope {
    /// `(sheet, cell)` pairs that were empty when the document was briefed.
    FillEmpty(BTreeSet<(String, String)>),
    /// A new period is due; nothing may be written until the column exists.
    InsertPending,
    /// Target cells returned by the column insertion.
    InsertedRows {
        sheet: String,
        cells: BTreeSet<String>,
    },
    Closed,
}

impl WriteScope {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FillEmpty(_) => "fill_empty",
            Self::InsertPending => "insert_pending",
            Self::InsertedRows { .. } => "inserted_rows",
            Self::Closed => "closed",
        }
    }
}

/// The single open handle of one document and its write bookkeeping.
#[derive(Debug, Clone)]
pub struct DocumentState {
    key: DocumentKey,
    path: PathBuf,
    workbook: Workbook,
    writes: u32,
    modified: bool,
    scope: WriteScope,
    insertion: Option<ColumnInsertionResult>,
}

impl DocumentState {
    #[must_use]
    pub fn new(key: DocumentKey, path: PathBuf, workbook: Workbook) -> Self {
        let scope = fill_empty_scope(&workbook);
        Self {
            key,
            path,
            workbook,
            writes: 0,
            modified: false,
            scope,
            insertion: None,
        }
    }

    #[must_use]
    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn workbook(&self) -> &Workbook {
        &self.workbook
    }

    #[must_use]
    pub fn writes(&self) -> u32 {
        self.writes
    }

    #[must_use]
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    #[must_use]
    pub fn scope(&self) -> &WriteScope {
        &self.scope
    }

    #[must_use]
    pub fn insertion(&self) -> Option<&ColumnInsertionResult> {
        self.insertion.as_ref()
    }

    /// Structural changes alone do not make a document worth uploading.
    #[must_use]
    pub fn should_persist(&self) -> bool {
        self.modified && self.writes > 0
    }

    /// Scope writes to the cells that are empty right now.
    pub fn begin_fill_empty(&mut self) {
        self.scope = fill_empty_scope(&self.workbook);
    }

    pub fn begin_period_insert(&mut self) {
        self.scope = WriteScope::InsertPending;
    }

    pub fn close(&mut self) {
        self.scope = WriteScope::Closed;
    }

    /// # Errors
    /// Returns a [`DispatchError`] when the cell is outside the write scope or not empty.
    pub fn write_empty_cell(
        &mut self,
        sheet: &str,
        cell: &str,
        value: CellValue,
    ) -> Result<String, DispatchError> {
        let reference = CellRef::parse(cell)?.to_string();
        self.workbook.sheet(sheet)?;

        match &self.scope {
            WriteScope::Closed => {
                return Err(DispatchError::ProtocolViolation(format!(
                    "document {} is closed for this run",
                    self.key
                )))
            }
            WriteScope::InsertPending => {
                return Err(DispatchError::ProtocolViolation(
                    "a new reporting period is due: call insert_period_column before writing values"
                        .to_string(),
                ))
            }
            WriteScope::FillEmpty(cells) => {
                if !cells.contains(&(sheet.to_string(), reference.clone())) {
                    return Err(DispatchError::WriteRejected(format!(
                        "{sheet}!{reference} is not one of the empty cells listed for this document"
                    )));
                }
            }
            WriteScope::InsertedRows {
                sheet: target_sheet,
                cells,
            } => {
                if target_sheet != sheet || !cells.contains(&reference) {
                    return Err(DispatchError::WriteRejected(format!(
                        "{sheet}!{reference} is outside the rows returned by insert_period_column"
                    )));
                }
            }
        }

        self.workbook.fill_empty_cell(sheet, &reference, value)?;
        self.writes += 1;
        self.modified = true;
        Ok(reference)
    }

    /// Insert the new period column at column B, once per document per run.
    ///
    /// # Errors
    /// Returns [`DispatchError::ProtocolViolation`] when no insertion is due or it already
    /// happened, and grid errors for an unknown sheet.
    pub fn insert_period_column(
        &mut self,
        sheet: &str,
        date_header: &str,
        period_header: &str,
    ) -> Result<ColumnInsertionResult, DispatchError> {
        match &self.scope {
            WriteScope::InsertPending => {}
            WriteScope::InsertedRows { .. } => {
                return Err(DispatchError::ProtocolViolation(format!(
                    "a period column was already inserted into {} during this run",
                    self.key
                )))
            }
            WriteScope::FillEmpty(_) => {
                return Err(DispatchError::ProtocolViolation(format!(
                    "no new reporting period is due for {}; fill the listed empty cells only",
                    self.key
                )))
            }
            WriteScope::Closed => {
                return Err(DispatchError::ProtocolViolation(format!(
                    "document {} is closed for this run",
                    self.key
                )))
            }
        }

        let result =
            self.workbook
                .insert_column_at(sheet, PERIOD_INSERT_COLUMN, date_header, period_header)?;
        self.scope = WriteScope::InsertedRows {
            sheet: sheet.to_string(),
            cells: result
                .rows_needing_data
                .iter()
                .map(|row| row.target_cell.clone())
                .collect(),
        };
        self.modified = true;
        self.insertion = Some(result.clone());
        Ok(result)
    }
}

fn fill_empty_scope(workbook: &Workbook) -> WriteScope {
    WriteScope::FillEmpty(
        workbook
            .empty_cells_by_sheet()
            .into_iter()
            .flat_map(|(sheet, cells)| cells.into_iter().map(move |cell| (sheet.clone(), cell)))
            .collect(),
    )
}

/// External capabilities available to the tools of one run.
pub struct Capabilities {
    pub browser: Box<dyn BrowserSession>,
    pub vision: Box<dyn VisionExtractor>,
    pub search: Box<dyn WebSearch>,
}

/// Mutable state of one pipeline run. Never shared between runs.
pub struct RunContext {
    ticker: String,
    working_dir: PathBuf,
    handles: BTreeMap<DocumentKey, PathBuf>,
    open: BTreeMap<DocumentKey, DocumentState>,
    modified: BTreeSet<DocumentKey>,
    data_sources: BTreeSet<String>,
    current: Option<DocumentKey>,
    forced_period_end: Option<String>,
    latest_screenshot: Option<Screenshot>,
    capabilities: Capabilities,
    scratchpad: Scratchpad,
    browser_released: bool,
}

impl RunContext {
    #[must_use]
    pub fn new(
        ticker: &str,
        working_dir: &Path,
        handles: BTreeMap<DocumentKey, PathBuf>,
        capabilities: Capabilities,
    ) -> Self {
        Self {
            ticker: ticker.trim().to_ascii_uppercase(),
            working_dir: working_dir.to_path_buf(),
            handles,
            open: BTreeMap::new(),
            modified: BTreeSet::new(),
            data_sources: BTreeSet::new(),
            current: None,
            forced_period_end: None,
            latest_screenshot: None,
            capabilities,
            scratchpad: Scratchpad::new(),
            browser_released: false,
        }
    }

    #[must_use]
    pub fn with_forced_period_end(mut self, period_end: Option<String>) -> Self {
        self.forced_period_end = period_end;
        self
    }

    #[must_use]
    pub fn ticker(&self) -> &str {
        &self.ticker
    }

    #[must_use]
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    #[must_use]
    pub fn forced_period_end(&self) -> Option<&str> {
        self.forced_period_end.as_deref()
    }

    /// Record where a downloaded document lives locally.
    pub fn register_document(&mut self, key: DocumentKey, path: PathBuf) {
        self.handles.insert(key, path);
    }

    #[must_use]
    pub fn handle(&self, key: &DocumentKey) -> Option<&Path> {
        self.handles.get(key).map(PathBuf::as_path)
    }

    /// Open a document on first access; later calls return the same state.
    ///
    /// # Errors
    /// Returns an error when the document was not downloaded or cannot be decoded.
    pub fn open_document(
        &mut self,
        key: &DocumentKey,
        codec: &dyn WorkbookCodec,
    ) -> Result<&mut DocumentState> {
        if !self.open.contains_key(key) {
            let path = self
                .handles
                .get(key)
                .ok_or_else(|| anyhow!("document {key} was not downloaded for {}", self.ticker))?
                .clone();
            let workbook = load_workbook(&path, codec)
                .map_err(|err| anyhow!("failed to open document {key}: {err}"))?;
            debug!(document = key.as_str(), path = %path.display(), "document opened");
            self.open
                .insert(key.clone(), DocumentState::new(key.clone(), path, workbook));
        }
        self.open
            .get_mut(key)
            .ok_or_else(|| anyhow!("document {key} is not open"))
    }

    #[must_use]
    pub fn document(&self, key: &DocumentKey) -> Option<&DocumentState> {
        self.open.get(key)
    }

    pub fn document_mut(&mut self, key: &DocumentKey) -> Option<&mut DocumentState> {
        self.open.get_mut(key)
    }

    pub fn set_current(&mut self, key: Option<DocumentKey>) {
        self.current = key;
    }

    #[must_use]
    pub fn current(&self) -> Option<&DocumentKey> {
        self.current.as_ref()
    }

    /// # Errors
    /// Returns [`DispatchError::NoCurrentDocument`] when no open document is selected.
    pub fn current_document_mut(&mut self) -> Result<&mut DocumentState, DispatchError> {
        let key = self.current.as_ref().ok_or(DispatchError::NoCurrentDocument)?;
        self.open
            .get_mut(key)
            .ok_or(DispatchError::NoCurrentDocument)
    }

    #[must_use]
    pub fn modified(&self) -> &BTreeSet<DocumentKey> {
        &self.modified
    }

    /// Distinct data-source tags, sorted.
    #[must_use]
    pub fn data_sources(&self) -> Vec<String> {
        self.data_sources.iter().cloned().collect()
    }

    #[must_use]
    pub fn latest_screenshot(&self) -> Option<&Screenshot> {
        self.latest_screenshot.as_ref()
    }

    #[must_use]
    pub fn scratchpad(&self) -> &Scratchpad {
        &self.scratchpad
    }

    /// Record a system note attributed to the current document.
    pub fn record_note(&mut self, category: NoteCategory, content: &str) -> usize {
        self.scratchpad
            .record(category, content, self.current.as_ref())
    }

    /// Release the browser session. Only the first call reaches the session.
    ///
    /// # Errors
    /// Returns the session's error from that first call.
    pub fn release_browser(&mut self) -> Result<(), CapabilityError> {
        if self.browser_released {
            return Ok(());
        }
        self.browser_released = true;
        self.latest_screenshot = None;
        self.capabilities.browser.close()
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ToolName {
    BrowseFinancials,
    ExtractPageWithVision,
    NoteFinding,
    UpdateCell,
    InsertPeriodColumn,
    WebSearch,
    FlagSourceDisagreement,
}

impl ToolName {
    pub const ALL: [Self; 7] = [
        Self::BrowseFinancials,
        Self::ExtractPageWithVision,
        Self::NoteFinding,
        Self::UpdateCell,
        Self::InsertPeriodColumn,
        Self::WebSearch,
        Self::FlagSourceDisagreement,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BrowseFinancials => "browse_financials",
            Self::ExtractPageWithVision => "extract_page_with_vision",
            Self::NoteFinding => "note_finding",
            Self::UpdateCell => "update_cell",
            Self::InsertPeriodColumn => "insert_period_column",
            Self::WebSearch => "web_search",
            Self::FlagSourceDisagreement => "flag_source_disagreement",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tool| tool.as_str() == value)
    }

    #[must_use]
    pub fn spec(self) -> ToolSpec {
        let note_categories: Vec<&str> = NoteCategory::MODEL_WRITABLE
            .iter()
            .map(|category| category.as_str())
            .collect();
        let (description, input_schema) = match self {
            Self::BrowseFinancials => (
                "Navigate to a financial statement page for the run's ticker and take a full-page screenshot. The login session persists across calls. This tool does NOT return table data: call extract_page_with_vision next.",
                json!({
                    "type": "object",
                    "properties": {
                        "statement_type": {
                            "type": "string",
                            "enum": ["income", "balance", "cashflow"],
                            "description": "Type of financial statement"
                        },
                        "period": {
                            "type": "string",
                            "enum": ["annual", "quarterly"],
                            "description": "Annual or quarterly data"
                        },
                        "data_type": {
                            "type": "string",
                            "enum": ["standardized", "as-reported"],
                            "description": "Standardized or as-reported figures"
                        }
                    },
                    "required": ["statement_type", "period", "data_type"]
                }),
            ),
            Self::ExtractPageWithVision => (
                "Read the latest screenshot with a vision model and return the financial table as markdown. Fails when no screenshot is available.",
                json!({
                    "type": "object",
                    "properties": {
                        "instruction": {
                            "type": "string",
                            "description": "What to extract; defaults to the full table with every numeric value exactly as shown"
                        }
                    }
                }),
            ),
            Self::NoteFinding => (
                "Record a finding in the scratchpad. Notes persist across iterations and across documents of this run.",
                json!({
                    "type": "object",
                    "properties": {
                        "category": {
                            "type": "string",
                            "enum": note_categories,
                            "description": "Category of the note"
                        },
                        "content": {
                            "type": "string",
                            "description": "The finding or observation to record"
                        }
                    },
                    "required": ["category", "content"]
                }),
            ),
            Self::UpdateCell => (
                "Write a value into an EMPTY cell of the current document. Cells that already hold a value are never overwritten.",
                json!({
                    "type": "object",
                    "properties": {
                        "sheet_name": {"type": "string", "description": "Name of the sheet"},
                        "cell_ref": {"type": "string", "description": "Cell reference like 'B5'"},
                        "value": {
                            "type": ["string", "number", "boolean"],
                            "description": "Fully written absolute value, e.g. 394328000000"
                        }
                    },
                    "required": ["sheet_name", "cell_ref", "value"]
                }),
            ),
            Self::InsertPeriodColumn => (
                "Insert a new reporting-period column at column B of the current document, shifting existing columns right. Use the period-end date read from the extracted table. Returns the only rows that may be written afterwards.",
                json!({
                    "type": "object",
                    "properties": {
                        "sheet_name": {"type": "string", "description": "Name of the sheet"},
                        "date_header": {
                            "type": "string",
                            "pattern": "^[0-9]{4}-[0-9]{2}-[0-9]{2}",
                            "description": "Period-end date for row 1, YYYY-MM-DD"
                        },
                        "period_header": {
                            "type": "string",
                            "description": "Period label for row 2, e.g. 'Q4 2025'"
                        }
                    },
                    "required": ["sheet_name", "date_header", "period_header"]
                }),
            ),
            Self::WebSearch => (
                "Search the web for financial data to cross-check values from the screenshot. Returns an answer with citations. Never authoritative on its own.",
                json!({
                    "type": "object",
                    "properties": {
                        "query": {
                            "type": "string",
                            "description": "Specific financial query, e.g. 'Apple Q4 2025 revenue net income'"
                        }
                    },
                    "required": ["query"]
                }),
            ),
            Self::FlagSourceDisagreement => (
                "Record that the screenshot and the web search disagree on a cell's value, and how you resolved it. Never writes a cell.",
                json!({
                    "type": "object",
                    "properties": {
                        "sheet_name": {"type": "string"},
                        "cell_ref": {"type": "string"},
                        "primary_value": {
                            "type": ["string", "number"],
                            "description": "Value read from the screenshot"
                        },
                        "secondary_value": {
                            "type": ["string", "number"],
                            "description": "Value reported by the web search"
                        },
                        "resolution": {
                            "type": "string",
                            "description": "What you did about it, e.g. 'left empty'"
                        }
                    },
                    "required": ["sheet_name", "cell_ref", "primary_value", "secondary_value", "resolution"]
                }),
            ),
        };
        ToolSpec {
            name: self.as_str().to_string(),
            description: description.to_string(),
            input_schema,
        }
    }
}

/// Schemas of every tool, in a fixed order.
#[must_use]
pub fn tool_specs() -> Vec<ToolSpec> {
    ToolName::ALL.into_iter().map(ToolName::spec).collect()
}

/// Resolves model tool calls against a [`RunContext`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ToolDispatcher;

impl ToolDispatcher {
    /// Run one tool call. Failures come back as error payloads, never as a panic or `Err`.
    #[must_use]
    pub fn dispatch(ctx: &mut RunContext, call: &ToolCall) -> ToolResult {
        let outcome = ToolName::parse(&call.name)
            .ok_or_else(|| DispatchError::UnknownTool(call.name.clone()))
            .and_then(|tool| run_tool(ctx, tool, &call.arguments));

        match outcome {
            Ok(payload) => {
                debug!(tool = %call.name, "tool call succeeded");
                ToolResult::success(&call.id, &payload)
            }
            Err(err) => {
                warn!(tool = %call.name, code = err.code(), error = %err, "tool call failed");
                ToolResult::failure(&call.id, err.code(), &err.to_string())
            }
        }
    }
}

fn run_tool(ctx: &mut RunContext, tool: ToolName, arguments: &Value) -> Result<Value, DispatchError> {
    let empty = json!({});
    let args = if arguments.is_null() { &empty } else { arguments };
    if !args.is_object() {
        return Err(DispatchError::InvalidArguments(
            "arguments must be a JSON object".to_string(),
        ));
    }

    match tool {
        ToolName::BrowseFinancials => browse(ctx, args),
        ToolName::ExtractPageWithVision => extract(ctx, args),
        ToolName::NoteFinding => note_finding(ctx, args),
        ToolName::UpdateCell => update_cell(ctx, args),
        ToolName::InsertPeriodColumn => insert_period_column(ctx, args),
        ToolName::WebSearch => web_search(ctx, args),
        ToolName::FlagSourceDisagreement => flag_source_disagreement(ctx, args),
    }
}

fn browse(ctx: &mut RunContext, args: &Value) -> Result<Value, DispatchError> {
    let statement_raw = required_str(args, "statement_type")?;
    let period_raw = required_str(args, "period")?;
    let variant_raw = required_str(args, "data_type")?;
    let target = BrowseTarget {
        statement_kind: StatementKind::parse(statement_raw).ok_or_else(|| {
            DispatchError::InvalidArguments(format!("unknown statement_type '{statement_raw}'"))
        })?,
        period: PeriodKind::parse(period_raw).ok_or_else(|| {
            DispatchError::InvalidArguments(format!("unknown period '{period_raw}'"))
        })?,
        data_variant: DataVariant::parse(variant_raw).ok_or_else(|| {
            DispatchError::InvalidArguments(format!("unknown data_type '{variant_raw}'"))
        })?,
    };

    match ctx
        .capabilities
        .browser
        .navigate_and_screenshot(&ctx.ticker, target)
    {
        Ok(screenshot) => {
            ctx.data_sources.insert(screenshot.source_tag.clone());
            let payload = json!({
                "success": true,
                "url": screenshot.url,
                "title": screenshot.title,
                "target": target.to_string(),
                "screenshot_available": true,
                "message": "Screenshot captured. Call extract_page_with_vision to read the table.",
            });
            ctx.latest_screenshot = Some(screenshot);
            Ok(payload)
        }
        Err(err) => {
            ctx.latest_screenshot = None;
            Err(err.into())
        }
    }
}

fn extract(ctx: &mut RunContext, args: &Value) -> Result<Value, DispatchError> {
    let instruction = args
        .get("instruction")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_EXTRACTION_INSTRUCTION);
    let screenshot = ctx
        .latest_screenshot
        .as_ref()
        .ok_or(CapabilityError::NoScreenshot)?;

    let extracted = ctx
        .capabilities
        .vision
        .extract(&screenshot.image_png, instruction)?;
    Ok(json!({
        "success": true,
        "source_url": screenshot.url,
        "extracted": extracted,
    }))
}

fn note_finding(ctx: &mut RunContext, args: &Value) -> Result<Value, DispatchError> {
    let category_raw = required_str(args, "category")?;
    let category = NoteCategory::parse(category_raw)
        .filter(|category| NoteCategory::MODEL_WRITABLE.contains(category))
        .ok_or_else(|| {
            DispatchError::InvalidArguments(format!("category '{category_raw}' is not available"))
        })?;
    let content = required_str(args, "content")?;

    let total = ctx.record_note(category, content);
    Ok(json!({ "recorded": true, "total_notes": total }))
}

fn update_cell(ctx: &mut RunContext, args: &Value) -> Result<Value, DispatchError> {
    let sheet = required_str(args, "sheet_name")?;
    let cell = required_str(args, "cell_ref")?;
    let value = args
        .get("value")
        .and_then(CellValue::from_json)
        .ok_or_else(|| {
            DispatchError::InvalidArguments(
                "'value' must be a non-empty string, a number or a boolean".to_string(),
            )
        })?;

    let state = ctx.current_document_mut()?;
    let reference = state.write_empty_cell(sheet, cell, value.clone())?;
    let key = state.key().clone();
    let writes = state.writes();
    ctx.modified.insert(key.clone());

    Ok(json!({
        "success": true,
        "document": key,
        "sheet": sheet,
        "cell": reference,
        "value": value.to_json(),
        "document_writes": writes,
    }))
}

fn insert_period_column(ctx: &mut RunContext, args: &Value) -> Result<Value, DispatchError> {
    let sheet = required_str(args, "sheet_name")?;
    let date_header = required_str(args, "date_header")?;
    let period_header = required_str(args, "period_header")?;
    if !is_iso_date(date_header) {
        return Err(DispatchError::InvalidArguments(format!(
            "date_header must start with a YYYY-MM-DD date, got '{date_header}'"
        )));
    }

    let state = ctx.current_document_mut()?;
    let result = state.insert_period_column(sheet, date_header, period_header)?;
    let key = state.key().clone();
    ctx.modified.insert(key.clone());

    Ok(json!({
        "success": result.success,
        "document": key,
        "sheet": sheet,
        "rows_needing_data": result.rows_needing_data,
        "summary": result.summary,
    }))
}

fn web_search(ctx: &mut RunContext, args: &Value) -> Result<Value, DispatchError> {
    let query = required_str(args, "query")?;
    let answer = ctx.capabilities.search.search(query)?;
    let source = ctx.capabilities.search.source_tag();
    ctx.data_sources.insert(source.to_string());
    Ok(json!({
        "success": true,
        "answer": answer.answer,
        "citations": answer.citations,
        "source": source,
    }))
}

fn flag_source_disagreement(ctx: &mut RunContext, args: &Value) -> Result<Value, DispatchError> {
    let sheet = required_str(args, "sheet_name")?;
    let cell = required_str(args, "cell_ref")?;
    let primary = scalar_text(args, "primary_value")?;
    let secondary = scalar_text(args, "secondary_value")?;
    let resolution = required_str(args, "resolution")?;

    let content = format!(
        "{DISAGREEMENT_PREFIX} {sheet}!{cell}: primary={primary} secondary={secondary}; resolution: {resolution}"
    );
    let total = ctx.record_note(NoteCategory::Validation, &content);
    Ok(json!({
        "recorded": true,
        "total_notes": total,
        "disagreement": {
            "sheet": sheet,
            "cell": cell,
            "primary_value": primary,
            "secondary_value": secondary,
            "resolution": resolution,
        },
    }))
}

fn required_str<'a>(args: &'a Value, field: &str) -> Result<&'a str, DispatchError> {
    args.get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| DispatchError::InvalidArguments(format!("'{field}' must be a non-empty string")))
}

fn scalar_text(args: &Value, field: &str) -> Result<String, DispatchError> {
    match args.get(field) {
        Some(Value::String(text)) if !text.trim().is_empty() => Ok(text.trim().to_string()),
        Some(Value::Number(number)) => Ok(number.to_string()),
        _ => Err(DispatchError::InvalidArguments(format!(
            "'{field}' must be a string or a number"
        ))),
    }
}
