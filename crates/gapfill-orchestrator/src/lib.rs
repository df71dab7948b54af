#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use gapfill_capabilities::{
    build_browser_session, build_vision_extractor, build_web_search, CapabilityError,
};
use gapfill_domain::{
    hash_json, now_utc, CompletionPayload, DocumentKey, DocumentOutcome, JournalEventType,
    ModelCallRecord, Note, NoteCategory, PipelineState, RunId, RunOutcome, RunRecord, RunRequest,
    RunStatus, Termination,
};
use gapfill_grid::{needs_new_column, save_workbook, Workbook, WorkbookCodec};
use gapfill_journal_core::{EventEmitter, RunJournal};
use gapfill_provider::{Message, ModelBackend, ModelRequest};
use gapfill_tools::{tool_specs, Capabilities, RunContext, Scratchpad, ToolDispatcher, ToolName};
use gapfill_workflow::{
    CallbackBinding, CapabilityBindings, DocumentSpec, PipelineEnvelope, StorageBinding,
};
use serde_json::{json, Value};
use tracing::{error, info, warn};

pub const SYSTEM_PROMPT: &str = "You are a financial data agent filling gaps in financial statement spreadsheets for one document at a time.

TOOLS:
- browse_financials opens the statement page and takes a screenshot. It does NOT return table data.
- After every browse, call extract_page_with_vision to read the table from the screenshot.
- web_search gives a second, independent source. Use it to cross-check values.
- note_finding records what you gathered, which cells are empty, your validation results and decisions. Notes persist for the whole run.
- update_cell writes one value into an EMPTY cell of the current document.
- insert_period_column adds a new reporting-period column; only call it when the task says a new period is due.
- flag_source_disagreement records a conflict between the screenshot and the web search.

DUAL-SOURCE VALIDATION:
- Every written value must come from the screenshot extraction.
- Cross-check it with web_search. If the sources agree, write it.
- If they disagree beyond rounding, investigate further or leave the cell empty, and record the conflict with flag_source_disagreement.

RULES:
- NEVER modify cells that already contain values.
- Write fully written absolute numbers, e.g. 394328000000 and not 394.33B.
- If you cannot confirm a value, leave the cell empty.
- Match row labels and period headers carefully.
- When the document is done, reply with a short summary and no tool calls.";

#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    pub run_id: Option<RunId>,
    /// Parent of the per-run working directory; the system temp dir when unset.
    pub working_root: Option<PathBuf>,
    pub keep_working_dir: bool,
}

/// Opaque document transfer to and from the object store.
pub trait DocumentStorage {
    fn backend_name(&self) -> &'static str;

    /// Copy `bucket/object` to `destination`. `Ok(false)` when the object does not exist.
    #[allow(clippy::missing_errors_doc)]
    fn download(&self, bucket: &DocumentKey, object: &str, destination: &Path) -> Result<bool>;

    /// Upsert `source` as `bucket/object`.
    #[allow(clippy::missing_errors_doc)]
    fn upload(&self, bucket: &DocumentKey, object: &str, source: &Path) -> Result<()>;
}

/// Build the storage backend named by a pipeline binding.
///
/// # Errors
/// Returns an error for an unknown backend or missing params.
pub fn build_storage(binding: &StorageBinding) -> Result<Box<dyn DocumentStorage>> {
    match binding.backend.as_str() {
        "local_dir" => {
            let root = binding
                .params
                .get("root")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("storage backend local_dir requires params.root"))?;
            Ok(Box::new(LocalDirStorage::new(Path::new(root))))
        }
        "http_object" => Ok(Box::new(HttpObjectStorage::from_params(&binding.params)?)),
        other => Err(anyhow!("unsupported storage backend '{other}'")),
    }
}

/// Object name of a ticker's document inside each bucket.
#[must_use]
pub fn object_name(ticker: &str, codec: &dyn WorkbookCodec) -> String {
    format!("{}.{}", normalize_ticker(ticker), codec.extension())
}

fn normalize_ticker(ticker: &str) -> String {
    ticker.trim().to_ascii_uppercase()
}

/// Buckets as directories under a root: `{root}/{bucket}/{object}`.
#[derive(Debug, Clone)]
pub struct LocalDirStorage {
    root: PathBuf,
}

impl LocalDirStorage {
    #[must_use]
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    #[must_use]
    pub fn object_path(&self, bucket: &DocumentKey, object: &str) -> PathBuf {
        self.root.join(bucket.as_str()).join(object)
    }
}

impl DocumentStorage for LocalDirStorage {
    fn backend_name(&self) -> &'static str {
        "local_dir"
    }

    fn download(&self, bucket: &DocumentKey, object: &str, destination: &Path) -> Result<bool> {
        let source = self.object_path(bucket, object);
        if !source.is_file() {
            return Ok(false);
        }
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::copy(&source, destination).with_context(|| {
            format!(
                "failed to copy {} to {}",
                source.display(),
                destination.display()
            )
        })?;
        Ok(true)
    }

    fn upload(&self, bucket: &DocumentKey, object: &str, source: &Path) -> Result<()> {
        let target = self.object_path(bucket, object);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::copy(source, &target).with_context(|| {
            format!("failed to copy {} to {}", source.display(), target.display())
        })?;
        Ok(())
    }
}

/// Bucketed object store reached over HTTP with a bearer key.
#[derive(Debug, Clone)]
pub struct HttpObjectStorage {
    base_url: String,
    bearer: String,
    timeout: Duration,
}

impl HttpObjectStorage {
    /// Resolve `base_url_env` and `auth_bearer_env` from the environment.
    ///
    /// # Errors
    /// Returns an error when either environment variable is unset.
    pub fn from_params(params: &Value) -> Result<Self> {
        let base_url = match params.get("base_url").and_then(Value::as_str) {
            Some(url) => url.to_string(),
            None => env_param(params, "base_url_env", "GAPFILL_STORAGE_URL")?,
        };
        let bearer = env_param(params, "auth_bearer_env", "GAPFILL_STORAGE_KEY")?;
        let timeout_ms = params
            .get("timeout_ms")
            .and_then(Value::as_u64)
            .unwrap_or(60_000);
        Ok(Self {
            base_url,
            bearer,
            timeout: Duration::from_millis(timeout_ms),
        })
    }

    fn object_url(&self, bucket: &DocumentKey, object: &str) -> String {
        format!(
            "{}/storage/v1/object/{bucket}/{object}",
            self.base_url.trim_end_matches('/')
        )
    }
}

fn env_param(params: &Value, key: &str, default_var: &str) -> Result<String> {
    let var = params
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or(default_var);
    std::env::var(var)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| anyhow!("environment variable {var} is not set"))
}

impl DocumentStorage for HttpObjectStorage {
    fn backend_name(&self) -> &'static str {
        "http_object"
    }

    fn download(&self, bucket: &DocumentKey, object: &str, destination: &Path) -> Result<bool> {
        let url = self.object_url(bucket, object);
        let response = ureq::get(&url)
            .set("Authorization", &format!("Bearer {}", self.bearer))
            .set("apikey", &self.bearer)
            .timeout(self.timeout)
            .call();

        match response {
            Ok(response) => {
                let mut bytes = Vec::new();
                response
                    .into_reader()
                    .read_to_end(&mut bytes)
                    .context("failed to read storage response body")?;
                if let Some(parent) = destination.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("failed to create {}", parent.display()))?;
                }
                fs::write(destination, bytes)
                    .with_context(|| format!("failed to write {}", destination.display()))?;
                Ok(true)
            }
            Err(ureq::Error::Status(400 | 404, _)) => Ok(false),
            Err(ureq::Error::Status(status, response)) => Err(anyhow!(
                "storage download {bucket}/{object} failed with HTTP {status}: {}",
                response.into_string().unwrap_or_default()
            )),
            Err(err) => Err(anyhow!("storage download {bucket}/{object} failed: {err}")),
        }
    }

    fn upload(&self, bucket: &DocumentKey, object: &str, source: &Path) -> Result<()> {
        let bytes =
            fs::read(source).with_context(|| format!("failed to read {}", source.display()))?;
        ureq::post(&self.object_url(bucket, object))
            .set("Authorization", &format!("Bearer {}", self.bearer))
            .set("apikey", &self.bearer)
            .set("Content-Type", "application/octet-stream")
            .set("x-upsert", "true")
            .timeout(self.timeout)
            .send_bytes(&bytes)
            .map_err(|err| anyhow!("storage upload {bucket}/{object} failed: {err}"))?;
        Ok(())
    }
}

/// Outbound end-of-run notification.
pub trait CompletionNotifier {
    /// Deliver the payload and return the number of attempts used.
    #[allow(clippy::missing_errors_doc)]
    fn notify(&self, payload: &CompletionPayload) -> Result<u32>;
}

#[derive(Debug, Clone)]
pub struct HttpCompletionNotifier {
    url: String,
    bearer: Option<String>,
    max_attempts: u32,
    backoff: Duration,
    timeout: Duration,
}

impl HttpCompletionNotifier {
    #[must_use]
    pub fn new(url: &str, binding: &CallbackBinding) -> Self {
        let bearer = binding
            .auth_bearer_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|value| !value.is_empty());
        Self {
            url: url.to_string(),
            bearer,
            max_attempts: binding.max_attempts,
            backoff: Duration::from_millis(binding.backoff_ms),
            timeout: Duration::from_millis(binding.timeout_ms),
        }
    }
}

impl CompletionNotifier for HttpCompletionNotifier {
    fn notify(&self, payload: &CompletionPayload) -> Result<u32> {
        let body = serde_json::to_value(payload)?;
        deliver_with_retry(self.max_attempts, self.backoff, |attempt| {
            let mut request = ureq::post(&self.url).timeout(self.timeout);
            if let Some(bearer) = &self.bearer {
                request = request.set("Authorization", &format!("Bearer {bearer}"));
            }
            let response = request
                .send_json(body.clone())
                .map_err(|err| anyhow!("callback to {} failed: {err}", self.url))?;
            info!(status = response.status(), attempt, "completion callback delivered");
            Ok(())
        })
    }
}

/// Call `send` until it succeeds or `max_attempts` is spent, sleeping `backoff` in between.
///
/// # Errors
/// Returns the last attempt's error when every attempt fails.
pub fn deliver_with_retry<F>(max_attempts: u32, backoff: Duration, mut send: F) -> Result<u32>
where
    F: FnMut(u32) -> Result<()>,
{
    let attempts = max_attempts.max(1);
    let mut last_error = None;
    for attempt in 1..=attempts {
        match send(attempt) {
            Ok(()) => return Ok(attempt),
            Err(err) => {
                warn!(attempt, error = %err, "delivery attempt failed");
                last_error = Some(err);
                if attempt < attempts {
                    thread::sleep(backoff);
                }
            }
        }
    }
    Err(last_error
        .unwrap_or_else(|| anyhow!("delivery was never attempted"))
        .context(format!("delivery failed after {attempts} attempt(s)")))
}

/// Build the three capability adapters named by the pipeline.
///
/// # Errors
/// Returns the first adapter configuration error.
pub fn build_capabilities(bindings: &CapabilityBindings) -> Result<Capabilities, CapabilityError> {
    Ok(Capabilities {
        browser: build_browser_session(&bindings.browser)?,
        vision: build_vision_extractor(&bindings.vision)?,
        search: build_web_search(&bindings.search)?,
    })
}

/// Journals run events, model calls and scratchpad notes on one hash chain.
///
/// The first rejected write is kept and ends journaling for the run. Document work
/// never waits on the journal accepting a write.
pub struct RunRecorder<'a> {
    emitter: EventEmitter<'a>,
    notes_journaled: usize,
    started: bool,
    failure: Option<String>,
}

impl<'a> RunRecorder<'a> {
    #[must_use]
    pub fn new(journal: &'a dyn RunJournal, run_id: RunId) -> Self {
        Self {
            emitter: EventEmitter::new(journal, run_id),
            notes_journaled: 0,
            started: false,
            failure: None,
        }
    }

    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.emitter.run_id()
    }

    /// Events are only written once the run row exists and until a write fails.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.started && self.failure.is_none()
    }

    #[must_use]
    pub fn has_run_row(&self) -> bool {
        self.started
    }

    #[must_use]
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// # Errors
    /// Returns the first journal write failure of the run.
    pub fn ensure_healthy(&self) -> Result<()> {
        match &self.failure {
            Some(failure) => Err(anyhow!("journal write failed: {failure}")),
            None => Ok(()),
        }
    }

    pub fn event(
        &mut self,
        document: Option<&DocumentKey>,
        event_type: JournalEventType,
        payload: Value,
    ) {
        if !self.is_active() {
            return;
        }
        let emitted = self.emitter.emit(document, event_type, payload).map(drop);
        self.settle(emitted);
    }

    pub fn model_call(&mut self, document: &DocumentKey, call: &ModelCallRecord) {
        if !self.is_active() {
            return;
        }
        let appended =
            self.emitter
                .journal()
                .append_model_call(self.emitter.run_id(), document, call);
        if !self.settle(appended) {
            return;
        }
        self.event(
            Some(document),
            JournalEventType::ModelCalled,
            json!({
                "model_call_id": call.model_call_id,
                "backend_name": call.backend_name,
                "model_id": call.model_id,
                "request_hash": call.request_hash,
                "response_hash": call.response_hash,
                "stop_reason": call.stop_reason,
                "latency_ms": call.latency_ms,
                "input_tokens": call.input_tokens,
                "output_tokens": call.output_tokens,
            }),
        );
    }

    /// Journal every note appended since the last sync.
    pub fn sync_notes(&mut self, scratchpad: &Scratchpad) {
        if !self.is_active() {
            return;
        }
        for note in scratchpad.notes_since(self.notes_journaled) {
            let journaled = self.journal_note(note);
            if !self.settle(journaled) {
                return;
            }
            self.notes_journaled += 1;
        }
    }

    fn journal_note(&mut self, note: &Note) -> Result<()> {
        self.emitter
            .journal()
            .append_note(self.emitter.run_id(), note)?;
        self.emitter.emit(
            note.document.as_ref(),
            JournalEventType::NoteRecorded,
            json!({ "seq": note.seq, "category": note.category.as_str() }),
        )?;
        Ok(())
    }

    fn settle(&mut self, result: Result<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(err) => {
                let message = format!("{err:#}");
                warn!(run_id = %self.run_id(), error = %message, "journal write failed; journaling stopped");
                self.failure = Some(message);
                false
            }
        }
    }
}

/// What the driver decided to do with one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineDecision {
    pub state: PipelineState,
    pub leftmost_date: Option<String>,
    pub period_end: Option<String>,
    /// Empty cells per sheet; sheets without gaps are left out.
    pub empty_cells: Vec<(String, Vec<String>)>,
}

impl PipelineDecision {
    #[must_use]
    pub fn empty_cell_count(&self) -> usize {
        self.empty_cells.iter().map(|(_, cells)| cells.len()).sum()
    }
}

/// Insert-Period when `period_end` is strictly newer than the leftmost dated column,
/// otherwise Fill-Empty when gaps exist, otherwise Skip.
#[must_use]
pub fn decide_state(workbook: &Workbook, period_end: Option<&str>) -> PipelineDecision {
    let leftmost_date = workbook.leftmost_period_date();
    let empty_cells: Vec<(String, Vec<String>)> = workbook
        .empty_cells_by_sheet()
        .into_iter()
        .filter(|(_, cells)| !cells.is_empty())
        .collect();

    let state = match period_end {
        Some(period_end) if needs_new_column(leftmost_date.as_deref(), period_end) => {
            PipelineState::InsertPeriod
        }
        _ if !empty_cells.is_empty() => PipelineState::FillEmpty,
        _ => PipelineState::Skip,
    };

    PipelineDecision {
        state,
        leftmost_date,
        period_end: period_end.map(ToString::to_string),
        empty_cells,
    }
}

/// First user message for a document: task, target page, grid and run memory.
#[must_use]
pub fn build_briefing(
    request: &RunRequest,
    spec: &DocumentSpec,
    decision: &PipelineDecision,
    workbook: &Workbook,
    scratchpad: &Scratchpad,
) -> String {
    let target = spec.browse_target();
    let mut out = format!(
        "Ticker: {}\nReport date: {} ({})\nDocument: {} ({target})\nBrowse with: statement_type=\"{}\", period=\"{}\", data_type=\"{}\"\n\n",
        normalize_ticker(&request.ticker),
        request.report_date,
        request.timing.as_str(),
        spec.key,
        target.statement_kind.as_str(),
        target.period.as_str(),
        target.data_variant.as_str(),
    );

    match decision.state {
        PipelineState::InsertPeriod => {
            out.push_str(&format!(
                "TASK: INSERT A NEW REPORTING PERIOD\nA period ending {} is newer than the leftmost dated column ({}).\n1. Browse and extract the table. Read the exact period-end date and period label of the newest column.\n2. Call insert_period_column ONCE with that date (YYYY-MM-DD) as date_header and the label as period_header. Use the date from the table, not {} verbatim.\n3. Fill ONLY the rows returned by insert_period_column. Writes anywhere else are rejected.\n",
                decision.period_end.as_deref().unwrap_or("-"),
                decision.leftmost_date.as_deref().unwrap_or("-"),
                decision.period_end.as_deref().unwrap_or("-"),
            ));
        }
        PipelineState::FillEmpty | PipelineState::Skip => {
            out.push_str("TASK: FILL EMPTY CELLS\nOnly these cells may be written:\n");
            for (sheet, cells) in &decision.empty_cells {
                out.push_str(&format!("- Sheet \"{sheet}\": {}\n", cells.join(", ")));
            }
        }
    }

    out.push_str("\nCURRENT GRID:\n");
    out.push_str(&workbook.render_text());

    let summary = scratchpad.render_summary();
    if !summary.is_empty() {
        out.push_str("\nSCRATCHPAD (notes from earlier in this run):\n");
        out.push_str(&summary);
        out.push('\n');
    }

    out.push_str("\nOnly fill empty cells with dual-source verified values. All numbers fully written out (394328000000, not 394.33B).");
    out
}

/// Runs the bounded model/tool loop for one document at a time.
pub struct PipelineDriver<'a> {
    model: &'a dyn ModelBackend,
    model_id: &'a str,
    max_tokens: u32,
    max_iterations: u32,
    codec: &'a dyn WorkbookCodec,
    storage: &'a dyn DocumentStorage,
}

impl<'a> PipelineDriver<'a> {
    #[must_use]
    pub fn new(
        pipeline: &'a PipelineEnvelope,
        model: &'a dyn ModelBackend,
        codec: &'a dyn WorkbookCodec,
        storage: &'a dyn DocumentStorage,
    ) -> Self {
        Self {
            model,
            model_id: &pipeline.config.model.model_id,
            max_tokens: pipeline.config.model.max_tokens,
            max_iterations: pipeline.config.max_iterations,
            codec,
            storage,
        }
    }

    /// Decide, brief, loop, then persist one document.
    ///
    /// Model failures and rejected tool calls end up in the returned outcome.
    ///
    /// # Errors
    /// Returns an error only when the journal cannot record the document's progress.
    #[allow(clippy::too_many_lines)]
    pub fn process_document(
        &self,
        request: &RunRequest,
        spec: &DocumentSpec,
        ctx: &mut RunContext,
        recorder: &mut RunRecorder<'_>,
    ) -> Result<DocumentOutcome> {
        let key = &spec.key;
        let mut outcome = DocumentOutcome {
            document: key.clone(),
            state: None,
            termination: Termination::Missing,
            iterations: 0,
            writes: 0,
            persisted: false,
            uploaded: false,
            error: None,
        };

        ctx.set_current(Some(key.clone()));
        let period_end = ctx.forced_period_end().map(ToString::to_string);
        let decision = match ctx.open_document(key, self.codec) {
            Ok(state) => decide_state(state.workbook(), period_end.as_deref()),
            Err(err) => {
                let message = format!("{err:#}");
                warn!(document = key.as_str(), error = %message, "document could not be opened");
                ctx.record_note(NoteCategory::Error, &message);
                ctx.set_current(None);
                recorder.sync_notes(ctx.scratchpad());
                outcome.error = Some(message);
                recorder.event(
                    Some(key),
                    JournalEventType::DocumentFinished,
                    serde_json::to_value(&outcome).unwrap_or(Value::Null),
                );
                return Ok(outcome);
            }
        };

        info!(
            ticker = ctx.ticker(),
            document = key.as_str(),
            state = decision.state.as_str(),
            empty_cells = decision.empty_cell_count(),
            "document state decided"
        );
        outcome.state = Some(decision.state);
        recorder.event(
            Some(key),
            JournalEventType::DocumentStarted,
            json!({
                "state": decision.state.as_str(),
                "leftmost_date": decision.leftmost_date,
                "period_end": decision.period_end,
                "empty_cells": decision.empty_cell_count(),
            }),
        );

        let state = ctx
            .document_mut(key)
            .ok_or_else(|| anyhow!("document {key} is not open"))?;
        match decision.state {
            PipelineState::Skip => {
                let note = format!("{key}: no empty cells and no new period due; skipped");
                ctx.record_note(NoteCategory::FileComplete, &note);
                outcome.termination = Termination::Skipped;
                return self.finish_document(ctx, recorder, outcome);
            }
            PipelineState::FillEmpty => state.begin_fill_empty(),
            PipelineState::InsertPeriod => state.begin_period_insert(),
        }

        let workbook = ctx
            .document(key)
            .map(gapfill_tools::DocumentState::workbook)
            .ok_or_else(|| anyhow!("document {key} is not open"))?;
        let briefing = build_briefing(request, spec, &decision, workbook, ctx.scratchpad());
        let mut messages = vec![Message::user_text(briefing)];
        let tools = tool_specs();
        outcome.termination = Termination::BudgetExhausted;

        for iteration in 1..=self.max_iterations {
            outcome.iterations = iteration;
            let model_request = ModelRequest {
                model_id: self.model_id.to_string(),
                max_tokens: self.max_tokens,
                system: SYSTEM_PROMPT.to_string(),
                tools: tools.clone(),
                messages: messages.clone(),
            };

            let turn = match self.model.complete(&model_request) {
                Ok(turn) => turn,
                Err(err) => {
                    let message = format!("model call failed: {err:#}");
                    error!(document = key.as_str(), iteration, error = %message, "model call failed");
                    ctx.record_note(NoteCategory::Error, &message);
                    outcome.termination = Termination::ModelFailed;
                    outcome.error = Some(message);
                    break;
                }
            };
            recorder.model_call(key, &turn.call);

            let calls = turn.response.tool_calls();
            messages.push(Message::assistant(turn.response.content));
            if calls.is_empty() {
                info!(document = key.as_str(), iteration, "model finished the document");
                outcome.termination = Termination::Finished;
                break;
            }

            let mut results = Vec::with_capacity(calls.len());
            for call in &calls {
                info!(document = key.as_str(), iteration, tool = %call.name, "dispatching tool call");
                let result = ToolDispatcher::dispatch(ctx, call);
                recorder.event(
                    Some(key),
                    JournalEventType::ToolDispatched,
                    json!({
                        "iteration": iteration,
                        "tool": call.name,
                        "tool_use_id": call.id,
                        "arguments_hash": hash_json(&call.arguments).unwrap_or_default(),
                        "ok": !result.is_error,
                        "error_code": result.error_code(),
                    }),
                );
                if !result.is_error
                    && ToolName::parse(&call.name) == Some(ToolName::FlagSourceDisagreement)
                {
                    recorder.event(
                        Some(key),
                        JournalEventType::SourceDisagreement,
                        call.arguments.clone(),
                    );
                }
                results.push(result);
            }
            recorder.sync_notes(ctx.scratchpad());
            messages.push(Message::tool_results(&results));

            if let Some(failure) = recorder.failure() {
                warn!(document = key.as_str(), iteration, error = %failure, "stopping document after journal failure");
                outcome.termination = Termination::JournalFailed;
                outcome.error = Some(format!("journal write failed: {failure}"));
                break;
            }
        }

        if outcome.termination == Termination::BudgetExhausted {
            info!(
                document = key.as_str(),
                max_iterations = self.max_iterations,
                "iteration budget exhausted; keeping writes so far"
            );
        }
        self.finish_document(ctx, recorder, outcome)
    }

    fn finish_document(
        &self,
        ctx: &mut RunContext,
        recorder: &mut RunRecorder<'_>,
        mut outcome: DocumentOutcome,
    ) -> Result<DocumentOutcome> {
        let key = outcome.document.clone();
        let object = object_name(ctx.ticker(), self.codec);
        let mut failures = Vec::new();

        if let Some(state) = ctx.document_mut(&key) {
            outcome.writes = state.writes();
            if state.should_persist() {
                match save_workbook(state.path(), state.workbook(), self.codec) {
                    Ok(()) => {
                        outcome.persisted = true;
                        match self.storage.upload(&key, &object, state.path()) {
                            Ok(()) => outcome.uploaded = true,
                            Err(err) => failures.push(format!("{key}: upload failed: {err:#}")),
                        }
                    }
                    Err(err) => failures.push(format!("{key}: save failed: {err}")),
                }
            } else if state.is_modified() {
                info!(
                    document = key.as_str(),
                    "discarding structural changes without data writes"
                );
            }
            state.close();
        }

        for failure in &failures {
            warn!(document = key.as_str(), error = %failure, "document not persisted");
            ctx.record_note(NoteCategory::Error, failure);
        }
        if outcome.error.is_none() {
            outcome.error = failures.into_iter().next();
        }

        if outcome.uploaded {
            info!(document = key.as_str(), writes = outcome.writes, "document uploaded");
            recorder.event(
                Some(&key),
                JournalEventType::DocumentUploaded,
                json!({ "object": object, "writes": outcome.writes }),
            );
        }
        if outcome.termination != Termination::Skipped {
            let summary = format!(
                "{key}: {}, {} cell(s) written, uploaded={}",
                outcome.termination.as_str(),
                outcome.writes,
                outcome.uploaded
            );
            ctx.record_note(NoteCategory::FileComplete, &summary);
        }
        ctx.set_current(None);
        recorder.sync_notes(ctx.scratchpad());
        recorder.event(
            Some(&key),
            JournalEventType::DocumentFinished,
            serde_json::to_value(&outcome).unwrap_or(Value::Null),
        );
        Ok(outcome)
    }
}

/// Owns one run end to end. `run` always returns an outcome.
pub struct RunCoordinator<'a> {
    pipeline: &'a PipelineEnvelope,
    model: &'a dyn ModelBackend,
    storage: &'a dyn DocumentStorage,
    codec: &'a dyn WorkbookCodec,
    journal: &'a dyn RunJournal,
    notifier: Option<&'a dyn CompletionNotifier>,
    config: RunConfig,
}

impl<'a> RunCoordinator<'a> {
    #[must_use]
    pub fn new(
        pipeline: &'a PipelineEnvelope,
        model: &'a dyn ModelBackend,
        storage: &'a dyn DocumentStorage,
        codec: &'a dyn WorkbookCodec,
        journal: &'a dyn RunJournal,
    ) -> Self {
        Self {
            pipeline,
            model,
            storage,
            codec,
            journal,
            notifier: None,
            config: RunConfig::default(),
        }
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: &'a dyn CompletionNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: RunConfig) -> Self {
        self.config = config;
        self
    }

    /// Run with the capability adapters configured in the pipeline.
    #[must_use]
    pub fn run(&self, request: &RunRequest) -> RunOutcome {
        let capabilities = build_capabilities(&self.pipeline.config.capabilities)
            .map_err(|err| anyhow!("capability setup failed: {err}"));
        self.run_inner(request, capabilities)
    }

    #[must_use]
    pub fn run_with_capabilities(
        &self,
        request: &RunRequest,
        capabilities: Capabilities,
    ) -> RunOutcome {
        self.run_inner(request, Ok(capabilities))
    }

    fn run_inner(&self, request: &RunRequest, capabilities: Result<Capabilities>) -> RunOutcome {
        let run_id = self.config.run_id.unwrap_or_default();
        let ticker = normalize_ticker(&request.ticker);
        let mut recorder = RunRecorder::new(self.journal, run_id);
        info!(%run_id, ticker = %ticker, report_date = %request.report_date, "run started");
        let started = self.start_run(run_id, request, &mut recorder);

        let outcome = match capabilities {
            Ok(capabilities) => {
                let working_dir = self
                    .config
                    .working_root
                    .clone()
                    .unwrap_or_else(std::env::temp_dir)
                    .join(format!("gapfill-{ticker}-{run_id}"));
                let mut ctx = RunContext::new(&ticker, &working_dir, BTreeMap::new(), capabilities)
                    .with_forced_period_end(request.fiscal_period_end.clone());
                let mut documents = Vec::new();

                let result = started.and_then(|()| {
                    self.execute(request, &working_dir, &mut ctx, &mut recorder, &mut documents)
                });

                if let Err(err) = ctx.release_browser() {
                    warn!(error = %err, "failed to release browser session");
                }
                recorder.sync_notes(ctx.scratchpad());
                let outcome = summarize(run_id, &ticker, &ctx, documents, result.err());
                if !self.config.keep_working_dir {
                    if let Err(err) = fs::remove_dir_all(&working_dir) {
                        warn!(path = %working_dir.display(), error = %err, "failed to remove working directory");
                    }
                }
                outcome
            }
            Err(err) => RunOutcome {
                run_id,
                success: false,
                ticker: ticker.clone(),
                files_updated: 0,
                completed_files: Vec::new(),
                data_sources: Vec::new(),
                iterations: 0,
                notes_count: 0,
                documents: Vec::new(),
                error: Some(format!("{err:#}")),
            },
        };

        self.finish_run(request, &outcome, &mut recorder);
        if outcome.success {
            info!(%run_id, files_updated = outcome.files_updated, "run completed");
        } else {
            error!(%run_id, error = outcome.error.as_deref().unwrap_or("-"), "run failed");
        }
        outcome
    }

    fn start_run(
        &self,
        run_id: RunId,
        request: &RunRequest,
        recorder: &mut RunRecorder<'_>,
    ) -> Result<()> {
        request.validate()?;
        self.journal.migrate()?;
        self.journal.insert_run(&RunRecord {
            run_id,
            ticker: normalize_ticker(&request.ticker),
            report_date: request.report_date.clone(),
            timing: request.timing,
            fiscal_period_end: request.fiscal_period_end.clone(),
            pipeline_hash: self.pipeline.normalized_hash.clone(),
            started_at: now_utc(),
            ended_at: None,
            status: RunStatus::Running,
            outcome_json: None,
        })?;
        recorder.started = true;
        recorder.event(
            None,
            JournalEventType::RunStarted,
            json!({
                "ticker": normalize_ticker(&request.ticker),
                "report_date": request.report_date,
                "timing": request.timing.as_str(),
                "fiscal_period_end": request.fiscal_period_end,
                "pipeline_hash": self.pipeline.normalized_hash,
                "documents": self.pipeline.config.documents.len(),
                "storage": self.storage.backend_name(),
                "model": self.model.backend_name(),
            }),
        );
        recorder.ensure_healthy()
    }

    fn execute(
        &self,
        request: &RunRequest,
        working_dir: &Path,
        ctx: &mut RunContext,
        recorder: &mut RunRecorder<'_>,
        documents: &mut Vec<DocumentOutcome>,
    ) -> Result<()> {
        fs::create_dir_all(working_dir)
            .with_context(|| format!("failed to create {}", working_dir.display()))?;

        let object = object_name(ctx.ticker(), self.codec);
        let mut downloaded = 0_usize;
        for spec in &self.pipeline.config.documents {
            let destination =
                working_dir.join(format!("{}.{}", spec.key, self.codec.extension()));
            match self.storage.download(&spec.key, &object, &destination) {
                Ok(true) => {
                    ctx.register_document(spec.key.clone(), destination);
                    downloaded += 1;
                }
                Ok(false) => info!(document = spec.key.as_str(), "document not in storage"),
                Err(err) => {
                    warn!(document = spec.key.as_str(), error = %err, "download failed");
                    recorder.event(
                        Some(&spec.key),
                        JournalEventType::Warning,
                        json!({ "download_error": format!("{err:#}") }),
                    );
                }
            }
        }
        info!(downloaded, "documents downloaded");
        if downloaded == 0 {
            bail!("no documents found for ticker {}", ctx.ticker());
        }

        let driver = PipelineDriver::new(self.pipeline, self.model, self.codec, self.storage);
        for spec in &self.pipeline.config.documents {
            recorder.ensure_healthy()?;
            if ctx.handle(&spec.key).is_none() {
                let note = format!("{}: not available in storage for {}", spec.key, ctx.ticker());
                ctx.set_current(Some(spec.key.clone()));
                ctx.record_note(NoteCategory::FileSkipped, &note);
                ctx.set_current(None);
                recorder.sync_notes(ctx.scratchpad());
                documents.push(DocumentOutcome {
                    document: spec.key.clone(),
                    state: None,
                    termination: Termination::Missing,
                    iterations: 0,
                    writes: 0,
                    persisted: false,
                    uploaded: false,
                    error: None,
                });
                continue;
            }
            documents.push(driver.process_document(request, spec, ctx, recorder)?);
        }
        recorder.ensure_healthy()
    }

    fn finish_run(
        &self,
        request: &RunRequest,
        outcome: &RunOutcome,
        recorder: &mut RunRecorder<'_>,
    ) {
        let outcome_json = serde_json::to_value(outcome).unwrap_or(Value::Null);
        recorder.event(None, JournalEventType::RunFinished, outcome_json.clone());

        if let Some(notifier) = self.notifier {
            let payload = CompletionPayload::from_outcome(request, outcome);
            match notifier.notify(&payload) {
                Ok(attempts) => recorder.event(
                    None,
                    JournalEventType::CallbackDelivered,
                    json!({ "attempts": attempts, "status": payload.status.as_str() }),
                ),
                Err(err) => {
                    let message = format!("{err:#}");
                    warn!(error = %message, "completion callback failed");
                    recorder.event(
                        None,
                        JournalEventType::Warning,
                        json!({ "callback_error": message }),
                    );
                }
            }
        }

        // The run row is closed even after an event write failed.
        if recorder.has_run_row() {
            if let Err(err) =
                self.journal
                    .update_run_finished(outcome.run_id, outcome.status(), &outcome_json)
            {
                warn!(error = %err, "failed to record run status");
            }
        }
    }
}

fn summarize(
    run_id: RunId,
    ticker: &str,
    ctx: &RunContext,
    documents: Vec<DocumentOutcome>,
    failure: Option<anyhow::Error>,
) -> RunOutcome {
    let completed_files: Vec<DocumentKey> = documents
        .iter()
        .filter(|document| document.uploaded)
        .map(|document| document.document.clone())
        .collect();
    let attempted: Vec<&DocumentOutcome> = documents
        .iter()
        .filter(|document| {
            matches!(
                document.state,
                Some(PipelineState::FillEmpty | PipelineState::InsertPeriod)
            )
        })
        .collect();
    let model_failures: Vec<&DocumentOutcome> = attempted
        .iter()
        .copied()
        .filter(|document| document.termination == Termination::ModelFailed)
        .collect();

    let error = match failure {
        Some(err) => Some(format!("{err:#}")),
        None if !attempted.is_empty() && model_failures.len() == attempted.len() => Some(format!(
            "model backend failed for every document: {}",
            model_failures
                .first()
                .and_then(|document| document.error.as_deref())
                .unwrap_or("unknown error")
        )),
        None => None,
    };

    RunOutcome {
        run_id,
        success: error.is_none(),
        ticker: ticker.to_string(),
        files_updated: completed_files.len(),
        completed_files,
        data_sources: ctx.data_sources(),
        iterations: documents.iter().map(|document| document.iterations).sum(),
        notes_count: ctx.scratchpad().len(),
        documents,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::{
        build_briefing, decide_state, deliver_with_retry, CompletionNotifier, DocumentStorage,
        LocalDirStorage, RunConfig, RunCoordinator,
    };
    use anyhow::{anyhow, Result};
    use gapfill_capabilities::{
        BrowserOptions, BrowserProbe, CapabilityError, CredentialSource, FinancialsBrowser,
        StaticBrowserDriver, StaticSearch, StaticVision,
    };
    use gapfill_domain::{
        CellValue, CompletionPayload, DocumentKey, EventRow, JournalEvent, JournalEventType,
        MarketTiming, ModelCallRecord, Note, NoteCategory, PipelineState, RunId, RunOutcome,
        RunRecord, RunRequest, RunStatus, Termination,
    };
    use gapfill_grid::{load_workbook, save_workbook, CellRef, JsonWorkbookCodec, Sheet, Workbook};
    use gapfill_journal_core::{verify_chain, NoopJournal, RunJournal};
    use gapfill_journal_sqlite::SqliteRunJournal;
    use gapfill_provider::{
        ContentBlock, ModelRequest, ModelResponse, ScriptedBackend, ScriptedStep, StopReason,
    };
    use gapfill_tools::{Capabilities, Scratchpad};
    use gapfill_workflow::{normalize_pipeline_yaml, PipelineEnvelope};
    use serde_json::{json, Value};
    use std::cell::{Cell, RefCell};
    use std::path::PathBuf;
    use std::time::Duration;
    use ulid::Ulid;

    const DOC: &str = "financials-quarterly-income";
    const MISSING_DOC: &str = "financials-annual-balance";

    const PIPELINE_YAML: &str = r"
pipeline_name: orchestrator-test
pipeline_version: v1
documents:
  - key: financials-quarterly-income
    statement_kind: income
    period: quarterly
    data_variant: as-reported
  - key: financials-annual-balance
    statement_kind: balance
    period: annual
    data_variant: as-reported
max_iterations: __MAX__
model:
  backend: scripted
  model_id: test-model
";

    struct Harness {
        root: PathBuf,
        pipeline: PipelineEnvelope,
        storage: LocalDirStorage,
    }

    impl Harness {
        fn new(name: &str, max_iterations: u32) -> Self {
            let root = std::env::temp_dir().join(format!(
                "gapfill-orchestrator-test-{name}-{}",
                Ulid::new()
            ));
            let pipeline = normalize_pipeline_yaml(
                &PIPELINE_YAML.replace("__MAX__", &max_iterations.to_string()),
            )
            .unwrap_or_else(|err| panic!("{err}"));
            let storage = LocalDirStorage::new(&root.join("storage"));
            Self {
                root,
                pipeline,
                storage,
            }
        }

        fn stored_path(&self) -> PathBuf {
            self.storage.object_path(&DocumentKey::new(DOC), "AAPL.json")
        }

        fn seed(&self, workbook: &Workbook) {
            self.seed_document(DOC, workbook);
        }

        fn seed_document(&self, key: &str, workbook: &Workbook) {
            let path = self.storage.object_path(&DocumentKey::new(key), "AAPL.json");
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap_or_else(|err| panic!("{err}"));
            }
            save_workbook(&path, workbook, &JsonWorkbookCodec).unwrap_or_else(|err| panic!("{err}"));
        }

        fn stored(&self) -> Workbook {
            load_workbook(&self.stored_path(), &JsonWorkbookCodec)
                .unwrap_or_else(|err| panic!("{err}"))
        }

        fn coordinator<'a>(
            &'a self,
            model: &'a ScriptedBackend,
            journal: &'a dyn RunJournal,
        ) -> RunCoordinator<'a> {
            RunCoordinator::new(&self.pipeline, model, &self.storage, &JsonWorkbookCodec, journal)
                .with_config(RunConfig {
                    working_root: Some(self.root.join("work")),
                    ..RunConfig::default()
                })
        }
    }

    fn at(reference: &str) -> CellRef {
        CellRef::parse(reference).unwrap_or_else(|err| panic!("{err}"))
    }

    fn text(value: &str) -> CellValue {
        CellValue::Text(value.to_string())
    }

    fn workbook(rows: &[(&str, Option<f64>, Option<f64>)]) -> Workbook {
        let mut sheet = Sheet::new("Income");
        sheet.set_value(at("B1"), text("2025-09-30"));
        sheet.set_value(at("C1"), text("2025-06-30"));
        sheet.set_value(at("B2"), text("Q3 2025"));
        sheet.set_value(at("C2"), text("Q2 2025"));
        for (row, (label, latest, prior)) in (3_u32..).zip(rows.iter()) {
            sheet.set_value(CellRef::new(1, row), text(label));
            if let Some(value) = latest {
                sheet.set_value(CellRef::new(2, row), CellValue::Number(*value));
            }
            if let Some(value) = prior {
                sheet.set_value(CellRef::new(3, row), CellValue::Number(*value));
            }
        }
        let mut workbook = Workbook::new();
        workbook.add_sheet(sheet);
        workbook
    }

    fn gaps_workbook() -> Workbook {
        workbook(&[
            ("Revenue", None, Some(90.0)),
            ("Net Income", None, Some(18.0)),
            ("EPS", Some(1.5), Some(1.2)),
        ])
    }

    fn full_workbook() -> Workbook {
        workbook(&[
            ("Revenue", Some(100.0), Some(90.0)),
            ("Net Income", Some(20.0), Some(18.0)),
            ("Shares", None, Some(5.0)),
        ])
    }

    fn complete_workbook() -> Workbook {
        workbook(&[
            ("Revenue", Some(100.0), Some(90.0)),
            ("Net Income", Some(20.0), Some(18.0)),
        ])
    }

    fn request(period_end: Option<&str>) -> RunRequest {
        RunRequest {
            ticker: "aapl".to_string(),
            report_date: "2026-01-29".to_string(),
            timing: MarketTiming::Afterhours,
            fiscal_period_end: period_end.map(ToString::to_string),
        }
    }

    fn capabilities(vision: StaticVision) -> (Capabilities, BrowserProbe) {
        let driver = StaticBrowserDriver::new();
        let probe = driver.probe();
        let capabilities = Capabilities {
            browser: Box::new(FinancialsBrowser::new(
                driver,
                BrowserOptions::new("https://stockanalysis.com", CredentialSource::NotRequired),
            )),
            vision: Box::new(vision),
            search: Box::new(StaticSearch::answering(
                "Revenue 102000000000, net income 21000000000",
                &["https://example.com/results"],
            )),
        };
        (capabilities, probe)
    }

    fn table_vision() -> StaticVision {
        StaticVision::answering("| Item | Dec 27, 2025 |\n| Revenue | 102000000000 |")
    }

    fn tools(calls: &[(&str, Value)]) -> ScriptedStep {
        ScriptedStep::Respond(ModelResponse {
            content: calls
                .iter()
                .enumerate()
                .map(|(index, (name, input))| ContentBlock::ToolUse {
                    id: format!("toolu_{index}_{name}"),
                    name: (*name).to_string(),
                    input: input.clone(),
                })
                .collect(),
            stop_reason: StopReason::ToolUse,
        })
    }

    fn browse() -> ScriptedStep {
        tools(&[(
            "browse_financials",
            json!({"statement_type": "income", "period": "quarterly", "data_type": "as-reported"}),
        )])
    }

    fn extract() -> ScriptedStep {
        tools(&[("extract_page_with_vision", json!({}))])
    }

    fn update(cell: &str, value: Value) -> (&str, Value) {
        (
            "update_cell",
            json!({"sheet_name": "Income", "cell_ref": cell, "value": value}),
        )
    }

    fn done() -> ScriptedStep {
        ScriptedStep::Respond(ModelResponse::end_turn("done"))
    }

    fn requests(model: &ScriptedBackend) -> Vec<ModelRequest> {
        model.recorded_requests().unwrap_or_else(|err| panic!("{err}"))
    }

    fn tool_results(request: &ModelRequest) -> Vec<(String, bool)> {
        request
            .messages
            .last()
            .map(|message| {
                message
                    .content
                    .iter()
                    .filter_map(|block| match block {
                        ContentBlock::ToolResult {
                            content, is_error, ..
                        } => Some((content.clone(), *is_error)),
                        ContentBlock::Text { .. } | ContentBlock::ToolUse { .. } => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn value(workbook: &Workbook, reference: &str) -> Option<CellValue> {
        workbook
            .read_cell("Income", reference)
            .unwrap_or_else(|err| panic!("{err}"))
    }

    fn fill_script() -> Vec<ScriptedStep> {
        vec![
            browse(),
            tools(&[
                ("extract_page_with_vision", json!({})),
                ("web_search", json!({"query": "Apple Q3 2025 revenue net income"})),
            ]),
            tools(&[
                update("B3", json!("102000000000")),
                update("B4", json!(21_000_000_000_i64)),
            ]),
            done(),
        ]
    }

    #[test]
    fn state_follows_period_end_and_empty_cells() {
        let complete = complete_workbook();
        assert_eq!(decide_state(&complete, None).state, PipelineState::Skip);
        assert_eq!(
            decide_state(&complete, Some("2025-12-31")).state,
            PipelineState::InsertPeriod
        );
        assert_eq!(
            decide_state(&complete, Some("2025-09-30")).state,
            PipelineState::Skip
        );
        assert_eq!(
            decide_state(&complete, Some("2025-06-30")).state,
            PipelineState::Skip
        );

        let gaps = decide_state(&gaps_workbook(), Some("2025-06-30"));
        assert_eq!(gaps.state, PipelineState::FillEmpty);
        assert_eq!(gaps.leftmost_date.as_deref(), Some("2025-09-30"));
        assert_eq!(
            gaps.empty_cells,
            vec![("Income".to_string(), vec!["B3".to_string(), "B4".to_string()])]
        );
    }

    #[test]
    fn briefing_lists_the_task_and_omits_an_empty_scratchpad() {
        let harness = Harness::new("briefing", 5);
        let spec = &harness.pipeline.config.documents[0];
        let gaps = gaps_workbook();
        let mut pad = Scratchpad::new();

        let fill = build_briefing(
            &request(None),
            spec,
            &decide_state(&gaps, None),
            &gaps,
            &pad,
        );
        assert!(fill.contains("Ticker: AAPL"));
        assert!(fill.contains("- Sheet \"Income\": B3, B4"));
        assert!(fill.contains("income/quarterly/as-reported"));
        assert!(!fill.contains("SCRATCHPAD"));

        pad.record(NoteCategory::Decision, "earlier finding", None);
        let complete = complete_workbook();
        let insert = build_briefing(
            &request(Some("2025-12-31")),
            spec,
            &decide_state(&complete, Some("2025-12-31")),
            &complete,
            &pad,
        );
        assert!(insert.contains("insert_period_column ONCE"));
        assert!(insert.contains("ending 2025-12-31"));
        assert!(insert.contains("(2025-09-30)"));
        assert!(insert.contains("[decision] earlier finding"));
    }

    #[test]
    fn fill_empty_run_writes_listed_cells_and_uploads() {
        let harness = Harness::new("fill", 8);
        harness.seed(&gaps_workbook());
        let model = ScriptedBackend::new(fill_script());
        let (capabilities, probe) = capabilities(table_vision());

        let outcome = harness
            .coordinator(&model, &NoopJournal)
            .run_with_capabilities(&request(None), capabilities);

        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.ticker, "AAPL");
        assert_eq!(outcome.files_updated, 1);
        assert_eq!(outcome.completed_files, vec![DocumentKey::new(DOC)]);
        assert_eq!(outcome.iterations, 4);
        assert_eq!(
            outcome.data_sources,
            vec![
                "perplexity-web-search".to_string(),
                "stockanalysis.com/income/quarterly/as-reported".to_string()
            ]
        );

        let document = &outcome.documents[0];
        assert_eq!(document.state, Some(PipelineState::FillEmpty));
        assert_eq!(document.termination, Termination::Finished);
        assert_eq!(document.writes, 2);
        assert!(document.uploaded);
        assert_eq!(outcome.documents[1].document, DocumentKey::new(MISSING_DOC));
        assert_eq!(outcome.documents[1].termination, Termination::Missing);

        let stored = harness.stored();
        assert_eq!(value(&stored, "B3"), Some(CellValue::Number(102_000_000_000.0)));
        assert_eq!(value(&stored, "B4"), Some(CellValue::Number(21_000_000_000.0)));
        assert_eq!(value(&stored, "B5"), Some(CellValue::Number(1.5)));

        let first = &requests(&model)[0];
        let ContentBlock::Text { text: briefing } = &first.messages[0].content[0] else {
            panic!("briefing is not text");
        };
        assert!(briefing.contains("B3, B4"));
        assert_eq!(first.tools.len(), 7);
        assert_eq!(probe.closes(), 1);
    }

    #[test]
    fn period_insertion_confines_writes_to_returned_rows() {
        let harness = Harness::new("insert", 8);
        harness.seed(&full_workbook());
        let model = ScriptedBackend::new(vec![
            browse(),
            extract(),
            tools(&[(
                "insert_period_column",
                json!({"sheet_name": "Income", "date_header": "2026-01-31", "period_header": "Q4 2026"}),
            )]),
            tools(&[
                update("B3", json!(110)),
                update("B5", json!(6)),
                update("B4", json!(22)),
            ]),
            done(),
        ]);
        let (capabilities, _) = capabilities(table_vision());

        let outcome = harness
            .coordinator(&model, &NoopJournal)
            .run_with_capabilities(&request(Some("2025-12-31")), capabilities);
        assert!(outcome.success, "{:?}", outcome.error);
        let document = &outcome.documents[0];
        assert_eq!(document.state, Some(PipelineState::InsertPeriod));
        assert_eq!(document.writes, 2);
        assert!(document.uploaded);

        let recorded = requests(&model);
        let insert_results = tool_results(&recorded[3]);
        assert_eq!(insert_results.len(), 1);
        assert!(insert_results[0].0.contains("\"target_cell\":\"B3\""));
        assert!(insert_results[0].0.contains("\"target_cell\":\"B4\""));
        assert!(!insert_results[0].0.contains("\"target_cell\":\"B5\""));

        let write_results = tool_results(&recorded[4]);
        let rejected: Vec<&(String, bool)> =
            write_results.iter().filter(|(_, is_error)| *is_error).collect();
        assert_eq!(rejected.len(), 1);
        assert!(rejected[0].0.contains("write_rejected"));

        let stored = harness.stored();
        assert_eq!(value(&stored, "B1"), Some(text("2026-01-31")));
        assert_eq!(value(&stored, "B2"), Some(text("Q4 2026")));
        assert_eq!(value(&stored, "B3"), Some(CellValue::Number(110.0)));
        assert_eq!(value(&stored, "B4"), Some(CellValue::Number(22.0)));
        assert_eq!(value(&stored, "B5"), None);
        assert_eq!(value(&stored, "C3"), Some(CellValue::Number(100.0)));
        assert_eq!(value(&stored, "C1"), Some(text("2025-09-30")));
    }

    #[test]
    fn complete_document_is_skipped_without_model_calls() {
        let harness = Harness::new("skip", 8);
        harness.seed(&complete_workbook());
        let model = ScriptedBackend::new(vec![browse()]);
        let (capabilities, probe) = capabilities(table_vision());

        let outcome = harness
            .coordinator(&model, &NoopJournal)
            .run_with_capabilities(&request(Some("2025-09-30")), capabilities);

        assert!(outcome.success, "{:?}", outcome.error);
        assert!(requests(&model).is_empty());
        assert_eq!(outcome.documents[0].termination, Termination::Skipped);
        assert_eq!(outcome.documents[0].writes, 0);
        assert_eq!(outcome.files_updated, 0);
        assert_eq!(probe.navigations(), 0);
        assert_eq!(probe.closes(), 1);
        assert_eq!(harness.stored(), complete_workbook());
    }

    #[test]
    fn structural_change_without_writes_is_not_uploaded() {
        let harness = Harness::new("no-writes", 8);
        harness.seed(&full_workbook());
        let model = ScriptedBackend::new(vec![
            tools(&[(
                "insert_period_column",
                json!({"sheet_name": "Income", "date_header": "2025-12-27", "period_header": "Q4 2025"}),
            )]),
            done(),
        ]);
        let (capabilities, _) = capabilities(table_vision());

        let outcome = harness
            .coordinator(&model, &NoopJournal)
            .run_with_capabilities(&request(Some("2025-12-31")), capabilities);

        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.files_updated, 0);
        assert!(!outcome.documents[0].persisted);
        assert_eq!(value(&harness.stored(), "B1"), Some(text("2025-09-30")));
    }

    #[test]
    fn vision_timeout_is_returned_to_the_model() {
        let harness = Harness::new("vision-timeout", 8);
        harness.seed(&gaps_workbook());
        let model = ScriptedBackend::new(vec![browse(), extract(), done()]);
        let (capabilities, _) = capabilities(StaticVision::failing(CapabilityError::Timeout {
            capability: "vision".to_string(),
            timeout_ms: 60_000,
        }));

        let outcome = harness
            .coordinator(&model, &NoopJournal)
            .run_with_capabilities(&request(None), capabilities);

        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.documents[0].termination, Termination::Finished);
        let results = tool_results(&requests(&model)[2]);
        assert_eq!(results.len(), 1);
        assert!(results[0].1);
        assert!(results[0].0.contains("\"code\":\"timeout\""));
    }

    #[test]
    fn exhausted_budget_keeps_partial_writes() {
        let harness = Harness::new("budget", 2);
        harness.seed(&gaps_workbook());
        let model = ScriptedBackend::new(vec![
            tools(&[update("B3", json!(1))]),
            tools(&[update("B4", json!(2))]),
            browse(),
        ]);
        let (capabilities, _) = capabilities(table_vision());

        let outcome = harness
            .coordinator(&model, &NoopJournal)
            .run_with_capabilities(&request(None), capabilities);

        assert!(outcome.success, "{:?}", outcome.error);
        let document = &outcome.documents[0];
        assert_eq!(document.termination, Termination::BudgetExhausted);
        assert_eq!(document.iterations, 2);
        assert_eq!(document.writes, 2);
        assert!(document.uploaded);
        assert_eq!(requests(&model).len(), 2);
    }

    #[test]
    fn model_failure_fails_the_run_and_releases_the_browser() {
        let harness = Harness::new("model-failure", 8);
        harness.seed(&gaps_workbook());
        let model = ScriptedBackend::new(vec![ScriptedStep::Fail("upstream overloaded".to_string())]);
        let (capabilities, probe) = capabilities(table_vision());

        let outcome = harness
            .coordinator(&model, &NoopJournal)
            .run_with_capabilities(&request(None), capabilities);

        assert!(!outcome.success);
        assert_eq!(outcome.status(), RunStatus::Failed);
        assert!(outcome
            .error
            .as_deref()
            .is_some_and(|error| error.contains("upstream overloaded")));
        assert_eq!(outcome.documents[0].termination, Termination::ModelFailed);
        assert_eq!(probe.closes(), 1);
    }

    #[test]
    fn run_without_documents_fails_and_still_releases_the_browser() {
        let harness = Harness::new("empty-storage", 8);
        let model = ScriptedBackend::new(Vec::new());
        let (capabilities, probe) = capabilities(table_vision());

        let outcome = harness
            .coordinator(&model, &NoopJournal)
            .run_with_capabilities(&request(None), capabilities);

        assert!(!outcome.success);
        assert!(outcome
            .error
            .as_deref()
            .is_some_and(|error| error.contains("no documents found for ticker AAPL")));
        assert!(outcome.documents.is_empty());
        assert_eq!(probe.closes(), 1);
    }

    #[test]
    fn invalid_request_is_reported_not_raised() {
        let harness = Harness::new("invalid", 8);
        harness.seed(&gaps_workbook());
        let model = ScriptedBackend::new(Vec::new());
        let (capabilities, probe) = capabilities(table_vision());
        let mut bad = request(None);
        bad.report_date = "29/01/2026".to_string();

        let outcome = harness
            .coordinator(&model, &NoopJournal)
            .run_with_capabilities(&bad, capabilities);
        assert!(!outcome.success);
        assert!(outcome
            .error
            .as_deref()
            .is_some_and(|error| error.contains("report_date")));
        assert_eq!(probe.closes(), 1);
    }

    #[test]
    fn journal_holds_a_verifiable_chain_and_every_note() {
        let harness = Harness::new("journal", 8);
        harness.seed(&gaps_workbook());
        let journal = SqliteRunJournal::open_migrated(&harness.root.with_extension("sqlite"))
            .unwrap_or_else(|err| panic!("{err}"));
        let model = ScriptedBackend::new(fill_script());
        let (capabilities, _) = capabilities(table_vision());

        let outcome = harness
            .coordinator(&model, &journal)
            .run_with_capabilities(&request(None), capabilities);
        assert!(outcome.success, "{:?}", outcome.error);

        let report = verify_chain(&journal, outcome.run_id).unwrap_or_else(|err| panic!("{err}"));
        assert!(report.chain_valid);

        let events = journal
            .list_events_for_run(outcome.run_id)
            .unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(
            events.first().map(|row| row.event.event_type),
            Some(JournalEventType::RunStarted)
        );
        assert_eq!(
            events.last().map(|row| row.event.event_type),
            Some(JournalEventType::RunFinished)
        );
        let model_calls = events
            .iter()
            .filter(|row| row.event.event_type == JournalEventType::ModelCalled)
            .count();
        assert_eq!(model_calls, 4);
        assert!(events
            .iter()
            .any(|row| row.event.event_type == JournalEventType::DocumentUploaded));

        let notes = journal
            .list_notes_for_run(outcome.run_id)
            .unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(notes.len(), outcome.notes_count);

        let run = journal
            .get_run(outcome.run_id)
            .unwrap_or_else(|err| panic!("{err}"))
            .unwrap_or_else(|| panic!("run missing"));
        assert_eq!(run.status, RunStatus::Completed);
    }

    /// Rejects the n-th tool dispatch event and forwards everything else to SQLite.
    struct FailingDispatchJournal {
        inner: SqliteRunJournal,
        fail_at: u32,
        dispatched: Cell<u32>,
    }

    impl RunJournal for FailingDispatchJournal {
        fn migrate(&self) -> Result<()> {
            self.inner.migrate()
        }

        fn insert_run(&self, run: &RunRecord) -> Result<()> {
            self.inner.insert_run(run)
        }

        fn update_run_finished(
            &self,
            run_id: RunId,
            status: RunStatus,
            outcome: &Value,
        ) -> Result<()> {
            self.inner.update_run_finished(run_id, status, outcome)
        }

        fn append_event(&self, event: &JournalEvent) -> Result<i64> {
            if event.event_type == JournalEventType::ToolDispatched {
                let seen = self.dispatched.get() + 1;
                self.dispatched.set(seen);
                if seen == self.fail_at {
                    return Err(anyhow!("disk I/O error"));
                }
            }
            self.inner.append_event(event)
        }

        fn append_note(&self, run_id: RunId, note: &Note) -> Result<()> {
            self.inner.append_note(run_id, note)
        }

        fn append_model_call(
            &self,
            run_id: RunId,
            document: &DocumentKey,
            call: &ModelCallRecord,
        ) -> Result<()> {
            self.inner.append_model_call(run_id, document, call)
        }

        fn list_runs(&self) -> Result<Vec<RunRecord>> {
            self.inner.list_runs()
        }

        fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>> {
            self.inner.get_run(run_id)
        }

        fn list_events_for_run(&self, run_id: RunId) -> Result<Vec<EventRow>> {
            self.inner.list_events_for_run(run_id)
        }

        fn list_notes_for_run(&self, run_id: RunId) -> Result<Vec<Note>> {
            self.inner.list_notes_for_run(run_id)
        }
    }

    #[test]
    fn journal_failure_mid_document_still_flushes_written_cells() {
        let harness = Harness::new("journal-failure", 8);
        harness.seed(&gaps_workbook());
        let journal = FailingDispatchJournal {
            inner: SqliteRunJournal::open_migrated(&harness.root.with_extension("sqlite"))
                .unwrap_or_else(|err| panic!("{err}")),
            // browse, extract, web_search, B3, then B4 is rejected.
            fail_at: 5,
            dispatched: Cell::new(0),
        };
        let model = ScriptedBackend::new(fill_script());
        let (capabilities, probe) = capabilities(table_vision());

        let outcome = harness
            .coordinator(&model, &journal)
            .run_with_capabilities(&request(None), capabilities);

        assert!(!outcome.success);
        assert!(outcome
            .error
            .as_deref()
            .is_some_and(|error| error.contains("disk I/O error")));
        assert_eq!(outcome.files_updated, 1);
        assert_eq!(outcome.completed_files, vec![DocumentKey::new(DOC)]);
        assert_eq!(outcome.documents.len(), 1);
        let document = &outcome.documents[0];
        assert_eq!(document.termination, Termination::JournalFailed);
        assert_eq!(document.writes, 2);
        assert!(document.uploaded);
        assert_eq!(requests(&model).len(), 3);
        assert_eq!(probe.closes(), 1);

        let stored = harness.stored();
        assert_eq!(value(&stored, "B3"), Some(CellValue::Number(102_000_000_000.0)));
        assert_eq!(value(&stored, "B4"), Some(CellValue::Number(21_000_000_000.0)));

        let report =
            verify_chain(&journal.inner, outcome.run_id).unwrap_or_else(|err| panic!("{err}"));
        assert!(report.chain_valid);
        let run = journal
            .get_run(outcome.run_id)
            .unwrap_or_else(|err| panic!("{err}"))
            .unwrap_or_else(|| panic!("run missing"));
        assert_eq!(run.status, RunStatus::Failed);
    }

    #[test]
    fn scratchpad_notes_carry_into_the_next_document_in_order() {
        let harness = Harness::new("cross-document", 8);
        harness.seed(&gaps_workbook());
        harness.seed_document(MISSING_DOC, &gaps_workbook());
        let model = ScriptedBackend::new(vec![
            tools(&[
                (
                    "note_finding",
                    json!({"category": "data_gathered", "content": "Revenue 102000000000 per 10-Q"}),
                ),
                update("B3", json!(102_000_000_000_i64)),
            ]),
            done(),
            done(),
        ]);
        let (capabilities, _) = capabilities(table_vision());

        let outcome = harness
            .coordinator(&model, &NoopJournal)
            .run_with_capabilities(&request(None), capabilities);
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.documents.len(), 2);
        assert_eq!(outcome.documents[1].state, Some(PipelineState::FillEmpty));

        let recorded = requests(&model);
        assert_eq!(recorded.len(), 3);
        let briefing = |sent: &ModelRequest| match &sent.messages[0].content[0] {
            ContentBlock::Text { text } => text.clone(),
            ContentBlock::ToolUse { .. } | ContentBlock::ToolResult { .. } => {
                panic!("briefing is not text")
            }
        };
        assert!(!briefing(&recorded[0]).contains("SCRATCHPAD"));

        let second = briefing(&recorded[2]);
        assert!(second.contains(MISSING_DOC));
        let finding = second
            .find(&format!("[data_gathered] {DOC}: Revenue 102000000000 per 10-Q"))
            .unwrap_or_else(|| panic!("finding missing from briefing:\n{second}"));
        let complete = second
            .find(&format!("[file_complete] {DOC}: {DOC}: finished, 1 cell(s) written"))
            .unwrap_or_else(|| panic!("file_complete missing from briefing:\n{second}"));
        assert!(finding < complete);
    }

    struct RecordingNotifier {
        fail: bool,
        calls: Cell<u32>,
        payloads: RefCell<Vec<CompletionPayload>>,
    }

    impl CompletionNotifier for RecordingNotifier {
        fn notify(&self, payload: &CompletionPayload) -> Result<u32> {
            self.calls.set(self.calls.get() + 1);
            self.payloads.borrow_mut().push(payload.clone());
            if self.fail {
                Err(anyhow!("connection refused"))
            } else {
                Ok(1)
            }
        }
    }

    fn run_with_notifier(fail: bool) -> (RunOutcome, RecordingNotifier) {
        let harness = Harness::new("callback", 8);
        harness.seed(&gaps_workbook());
        let model = ScriptedBackend::new(fill_script());
        let (capabilities, _) = capabilities(table_vision());
        let notifier = RecordingNotifier {
            fail,
            calls: Cell::new(0),
            payloads: RefCell::new(Vec::new()),
        };
        let outcome = harness
            .coordinator(&model, &NoopJournal)
            .with_notifier(&notifier)
            .run_with_capabilities(&request(None), capabilities);
        (outcome, notifier)
    }

    #[test]
    fn completion_callback_carries_the_outcome() {
        let (outcome, notifier) = run_with_notifier(false);
        assert!(outcome.success);
        let payloads = notifier.payloads.borrow();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].status, RunStatus::Completed);
        assert_eq!(payloads[0].files_updated, 1);
        assert_eq!(payloads[0].ticker, "aapl");
        assert_eq!(payloads[0].data_sources_used, outcome.data_sources);
    }

    #[test]
    fn callback_failure_does_not_fail_the_run() {
        let (outcome, notifier) = run_with_notifier(true);
        assert!(outcome.success);
        assert_eq!(outcome.files_updated, 1);
        assert_eq!(notifier.calls.get(), 1);
    }

    #[test]
    fn delivery_retries_once_after_a_failure() {
        let mut seen = Vec::new();
        let attempts = deliver_with_retry(2, Duration::ZERO, |attempt| {
            seen.push(attempt);
            if attempt == 1 {
                Err(anyhow!("timeout"))
            } else {
                Ok(())
            }
        });
        assert_eq!(attempts.ok(), Some(2));
        assert_eq!(seen, vec![1, 2]);

        let mut calls = 0;
        let failed = deliver_with_retry(2, Duration::ZERO, |_| {
            calls += 1;
            Err(anyhow!("refused"))
        });
        assert!(failed.is_err());
        assert_eq!(calls, 2);
    }

    #[test]
    fn local_storage_reports_missing_objects_and_upserts() {
        let root = std::env::temp_dir().join(format!("gapfill-storage-test-{}", Ulid::new()));
        let storage = LocalDirStorage::new(&root.join("buckets"));
        let bucket = DocumentKey::new(DOC);
        let local = root.join("work").join("AAPL.json");

        let missing = storage.download(&bucket, "AAPL.json", &local);
        assert_eq!(missing.ok(), Some(false));

        std::fs::create_dir_all(root.join("work")).unwrap_or_else(|err| panic!("{err}"));
        std::fs::write(&local, b"v1").unwrap_or_else(|err| panic!("{err}"));
        assert!(storage.upload(&bucket, "AAPL.json", &local).is_ok());
        std::fs::write(&local, b"v2").unwrap_or_else(|err| panic!("{err}"));
        assert!(storage.upload(&bucket, "AAPL.json", &local).is_ok());

        let copy = root.join("copy").join("AAPL.json");
        assert_eq!(storage.download(&bucket, "AAPL.json", &copy).ok(), Some(true));
        assert_eq!(
            std::fs::read(&copy).unwrap_or_else(|err| panic!("{err}")),
            b"v2".to_vec()
        );
    }
}
