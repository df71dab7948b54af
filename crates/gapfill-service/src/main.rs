#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use gapfill_domain::{CompletionPayload, RunId, RunOutcome, RunRequest};
use gapfill_grid::JsonWorkbookCodec;
use gapfill_journal_core::{NoopJournal, RunJournal};
use gapfill_journal_sqlite::SqliteRunJournal;
use gapfill_orchestrator::{
    build_storage, CompletionNotifier, DocumentStorage, HttpCompletionNotifier, LocalDirStorage,
    RunConfig, RunCoordinator,
};
use gapfill_provider::build_model_backend;
use gapfill_workflow::{default_pipeline, load_pipeline_from_path, PipelineEnvelope};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "gapfill.service.v1";

#[derive(Debug, Clone)]
struct ServiceState {
    pipeline: Arc<PipelineEnvelope>,
    journal_db: Option<PathBuf>,
    storage_root: Option<PathBuf>,
    working_root: Option<PathBuf>,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: ServiceErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceErrorPayload {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

/// One webhook delivery: a batch of tickers that reported earnings.
#[derive(Debug, Clone, Deserialize)]
struct BatchRequest {
    tickers: Vec<RunRequest>,
    #[serde(default)]
    callback_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct AcceptedRun {
    ticker: String,
    run_id: RunId,
}

#[derive(Debug, Clone, Serialize)]
struct BatchAccepted {
    accepted: Vec<String>,
    runs: Vec<AcceptedRun>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    pipeline_hash: String,
    documents: usize,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Default)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    invalid_json_total: AtomicU64,
    validation_error_total: AtomicU64,
    runs_accepted_total: AtomicU64,
    runs_in_flight: AtomicU64,
    runs_succeeded_total: AtomicU64,
    runs_failed_total: AtomicU64,
    files_updated_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    invalid_json_total: u64,
    validation_error_total: u64,
    runs_accepted_total: u64,
    runs_in_flight: u64,
    runs_succeeded_total: u64,
    runs_failed_total: u64,
    files_updated_total: u64,
}

#[derive(Debug, Parser)]
#[command(name = "gapfill-service")]
#[command(about = "Webhook that starts one gap-filling run per reported ticker")]
struct Args {
    /// Pipeline YAML; the built-in twelve-document pipeline when omitted.
    #[arg(long)]
    pipeline: Option<PathBuf>,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long)]
    journal_db: Option<PathBuf>,
    /// Use a local directory of buckets instead of the configured storage backend.
    #[arg(long)]
    storage_root: Option<PathBuf>,
    #[arg(long)]
    working_root: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    log_json: bool,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceError {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: ServiceErrorPayload {
                code: self.code,
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceState {
    fn failure(
        &self,
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> ServiceFailure {
        self.telemetry.record_failure(code);
        ServiceFailure {
            status,
            code,
            message: message.into(),
            details,
        }
    }

    fn invalid_json(&self, rejection: &JsonRejection) -> ServiceFailure {
        self.failure(
            rejection.status(),
            "invalid_json",
            rejection.body_text(),
            Some(json!({ "rejection": rejection.to_string() })),
        )
    }

    fn validation_error(&self, message: impl Into<String>) -> ServiceFailure {
        self.failure(StatusCode::BAD_REQUEST, "validation_error", message, None)
    }

    /// Blocking: runs the whole pipeline for one ticker.
    fn execute_run(
        &self,
        request: &RunRequest,
        run_id: RunId,
        callback_url: Option<&str>,
    ) -> RunOutcome {
        let notifier = callback_url
            .map(|url| HttpCompletionNotifier::new(url, &self.pipeline.config.callback));
        match self.try_execute_run(request, run_id, notifier.as_ref()) {
            Ok(outcome) => outcome,
            Err(err) => {
                let message = format!("{err:#}");
                error!(%run_id, ticker = %request.ticker, error = %message, "run setup failed");
                let outcome = RunOutcome {
                    run_id,
                    success: false,
                    ticker: request.ticker.trim().to_ascii_uppercase(),
                    files_updated: 0,
                    completed_files: Vec::new(),
                    data_sources: Vec::new(),
                    iterations: 0,
                    notes_count: 0,
                    documents: Vec::new(),
                    error: Some(message),
                };
                if let Some(notifier) = &notifier {
                    if let Err(err) = notifier.notify(&CompletionPayload::from_outcome(request, &outcome)) {
                        warn!(%run_id, error = %err, "completion callback failed");
                    }
                }
                outcome
            }
        }
    }

    fn try_execute_run(
        &self,
        request: &RunRequest,
        run_id: RunId,
        notifier: Option<&HttpCompletionNotifier>,
    ) -> Result<RunOutcome> {
        let pipeline = self.pipeline.as_ref();
        let model = build_model_backend(&pipeline.config.model)?;
        let storage: Box<dyn DocumentStorage> = match &self.storage_root {
            Some(root) => Box::new(LocalDirStorage::new(root)),
            None => build_storage(&pipeline.config.storage)?,
        };
        let journal: Box<dyn RunJournal> = match &self.journal_db {
            Some(path) => Box::new(SqliteRunJournal::open_migrated(path)?),
            None => Box::new(NoopJournal),
        };

        let codec = JsonWorkbookCodec;
        let mut coordinator = RunCoordinator::new(
            pipeline,
            model.as_ref(),
            storage.as_ref(),
            &codec,
            journal.as_ref(),
        )
        .with_config(RunConfig {
            run_id: Some(run_id),
            working_root: self.working_root.clone(),
            keep_working_dir: false,
        });
        if let Some(notifier) = notifier {
            coordinator = coordinator.with_notifier(notifier as &dyn CompletionNotifier);
        }
        Ok(coordinator.run(request))
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        match code {
            "invalid_json" => {
                self.invalid_json_total.fetch_add(1, Ordering::Relaxed);
            }
            "validation_error" => {
                self.validation_error_total.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    fn record_outcome(&self, outcome: &RunOutcome) {
        self.runs_in_flight.fetch_sub(1, Ordering::Relaxed);
        if outcome.success {
            self.runs_succeeded_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.runs_failed_total.fetch_add(1, Ordering::Relaxed);
        }
        self.files_updated_total.fetch_add(
            u64::try_from(outcome.files_updated).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            invalid_json_total: self.invalid_json_total.load(Ordering::Relaxed),
            validation_error_total: self.validation_error_total.load(Ordering::Relaxed),
            runs_accepted_total: self.runs_accepted_total.load(Ordering::Relaxed),
            runs_in_flight: self.runs_in_flight.load(Ordering::Relaxed),
            runs_succeeded_total: self.runs_succeeded_total.load(Ordering::Relaxed),
            runs_failed_total: self.runs_failed_total.load(Ordering::Relaxed),
            files_updated_total: self.files_updated_total.load(Ordering::Relaxed),
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        data,
    }
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse {
        status: "ok",
        pipeline_hash: state.pipeline.normalized_hash.clone(),
        documents: state.pipeline.config.documents.len(),
        telemetry: state.telemetry.snapshot(),
    }))
}

/// Accept a batch and start one independent blocking run per ticker.
async fn start_runs(
    State(state): State<ServiceState>,
    payload: Result<Json<BatchRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ServiceEnvelope<BatchAccepted>>), ServiceFailure> {
    state.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
    let Json(batch) = payload.map_err(|rejection| state.invalid_json(&rejection))?;

    if batch.tickers.is_empty() {
        return Err(state.validation_error("tickers MUST list at least one ticker"));
    }
    for request in &batch.tickers {
        request
            .validate()
            .map_err(|err| state.validation_error(format!("{}: {err}", request.ticker)))?;
    }
    let mut seen = BTreeSet::new();
    for request in &batch.tickers {
        let ticker = request.ticker.trim().to_ascii_uppercase();
        if !seen.insert(ticker.clone()) {
            return Err(state.validation_error(format!("{ticker}: ticker listed more than once")));
        }
    }

    let mut runs = Vec::with_capacity(batch.tickers.len());
    for request in batch.tickers {
        let run_id = RunId::new();
        runs.push(AcceptedRun {
            ticker: request.ticker.trim().to_ascii_uppercase(),
            run_id,
        });
        state
            .telemetry
            .runs_accepted_total
            .fetch_add(1, Ordering::Relaxed);
        state.telemetry.runs_in_flight.fetch_add(1, Ordering::Relaxed);

        let worker = state.clone();
        let callback_url = batch.callback_url.clone();
        tokio::task::spawn_blocking(move || {
            let outcome = worker.execute_run(&request, run_id, callback_url.as_deref());
            worker.telemetry.record_outcome(&outcome);
        });
    }

    info!(runs = runs.len(), "batch accepted");
    state
        .telemetry
        .requests_success_total
        .fetch_add(1, Ordering::Relaxed);
    let accepted = runs.iter().map(|run| run.ticker.clone()).collect();
    Ok((
        StatusCode::ACCEPTED,
        Json(envelope(BatchAccepted { accepted, runs })),
    ))
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/runs", post(start_runs))
        .with_state(state)
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(err) = installed {
        eprintln!("failed to install log subscriber: {err}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_json);

    let pipeline = match &args.pipeline {
        Some(path) => load_pipeline_from_path(path)?,
        None => default_pipeline()?,
    };
    let state = ServiceState {
        pipeline: Arc::new(pipeline),
        journal_db: args.journal_db,
        storage_root: args.storage_root,
        working_root: args.working_root,
        telemetry: Arc::new(ServiceTelemetry::default()),
    };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(bind = %args.bind, "gapfill service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}
