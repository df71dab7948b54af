#![forbid(unsafe_code)]

use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use gapfill_domain::{BrowseTarget, DataVariant, PeriodKind, StatementKind};
use gapfill_workflow::CapabilityBinding;
use serde_json::{json, Value};
use tracing::{info, warn};

const DEFAULT_BASE_URL: &str = "https://stockanalysis.com";
const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const PERPLEXITY_URL: &str = "https://api.perplexity.ai/chat/completions";
pub const DEFAULT_EXTRACTION_INSTRUCTION: &str = "Extract the full financial table with all rows and columns as a markdown table. Include all numeric values exactly as shown.";
const SEARCH_SYSTEM_PROMPT: &str = "You are a financial data assistant. Provide precise numerical financial data. Always give fully written out absolute numbers (e.g., 394328000000 not 394.33B). Cite your sources.";
pub const WEB_SEARCH_SOURCE_TAG: &str = "perplexity-web-search";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CapabilityError {
    #[error("login failed after {attempts} attempt(s): {detail}")]
    Auth { attempts: u32, detail: String },
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("vision extraction failed: {0}")]
    Extraction(String),
    #[error("no screenshot available; browse a financial page first")]
    NoScreenshot,
    #[error("web search failed: {0}")]
    Search(String),
    #[error("{capability} call timed out after {timeout_ms} ms")]
    Timeout { capability: String, timeout_ms: u64 },
    #[error("capability configuration error: {0}")]
    Configuration(String),
    #[error("transport failure: {0}")]
    Transport(String),
}

impl CapabilityError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth_failed",
            Self::Navigation(_) => "navigation_failed",
            Self::Extraction(_) => "extraction_failed",
            Self::NoScreenshot => "no_screenshot",
            Self::Search(_) => "search_failed",
            Self::Timeout { .. } => "timeout",
            Self::Configuration(_) => "configuration_error",
            Self::Transport(_) => "transport_error",
        }
    }
}

/// Financial statement page URL for a ticker and browse target.
#[must_use]
pub fn financials_url(base_url: &str, ticker: &str, target: BrowseTarget) -> String {
    let path = match target.statement_kind {
        StatementKind::Income => "",
        StatementKind::Balance => "/balance-sheet",
        StatementKind::Cashflow => "/cash-flow-statement",
    };
    let mut params = Vec::new();
    if target.period == PeriodKind::Quarterly {
        params.push("p=quarterly");
    }
    if target.data_variant == DataVariant::AsReported {
        params.push("type=as-reported");
    }

    let mut url = format!(
        "{}/stocks/{}/financials{path}/",
        base_url.trim_end_matches('/'),
        ticker.trim().to_ascii_lowercase()
    );
    if !params.is_empty() {
        url.push('?');
        url.push_str(&params.join("&"));
    }
    url
}

fn host_of(base_url: &str) -> String {
    let without_scheme = base_url
        .split_once("://")
        .map_or(base_url, |(_, rest)| rest);
    without_scheme
        .split('/')
        .next()
        .unwrap_or(without_scheme)
        .trim_start_matches("www.")
        .to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Screenshot {
    pub url: String,
    pub title: String,
    pub image_png: Vec<u8>,
    /// `{host}/{statement}/{period}/{variant}` of the page captured.
    pub source_tag: String,
}

pub trait BrowserSession {
    #[allow(clippy::missing_errors_doc)]
    fn navigate_and_screenshot(
        &mut self,
        ticker: &str,
        target: BrowseTarget,
    ) -> Result<Screenshot, CapabilityError>;

    /// Release the underlying browser. Calling it again is a no-op.
    #[allow(clippy::missing_errors_doc)]
    fn close(&mut self) -> Result<(), CapabilityError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageInfo {
    pub url: String,
    pub title: String,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Debug for Credentials {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Low-level page automation that [`FinancialsBrowser`] drives.
pub trait BrowserDriver {
    /// Submit the login form and return the URL the browser landed on.
    #[allow(clippy::missing_errors_doc)]
    fn sign_in(
        &mut self,
        login_url: &str,
        credentials: &Credentials,
        settle: Duration,
    ) -> Result<String, CapabilityError>;

    #[allow(clippy::missing_errors_doc)]
    fn goto(&mut self, url: &str) -> Result<PageInfo, CapabilityError>;

    #[allow(clippy::missing_errors_doc)]
    fn select_raw_units(&mut self) -> Result<(), CapabilityError>;

    #[allow(clippy::missing_errors_doc)]
    fn screenshot_full_page(&mut self) -> Result<Vec<u8>, CapabilityError>;

    #[allow(clippy::missing_errors_doc)]
    fn close(&mut self) -> Result<(), CapabilityError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    NotRequired,
    Provided(Credentials),
    /// Login is required but credentials could not be resolved.
    Missing(String),
}

#[derive(Debug, Clone)]
pub struct BrowserOptions {
    pub base_url: String,
    pub login_url: String,
    pub credentials: CredentialSource,
    pub login_attempts: u32,
    pub settle: Duration,
}

impl BrowserOptions {
    #[must_use]
    pub fn new(base_url: &str, credentials: CredentialSource) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        Self {
            login_url: format!("{base_url}/login/"),
            base_url,
            credentials,
            login_attempts: 2,
            settle: Duration::from_millis(2_000),
        }
    }

    fn from_params(params: &Value, credentials: CredentialSource) -> Self {
        let base_url = params
            .get("base_url")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_BASE_URL);
        let mut options = Self::new(base_url, credentials);
        if let Some(attempts) = params.get("login_attempts").and_then(Value::as_u64) {
            options.login_attempts = u32::try_from(attempts).unwrap_or(2).max(1);
        }
        if let Some(settle_ms) = params.get("settle_ms").and_then(Value::as_u64) {
            options.settle = Duration::from_millis(settle_ms);
        }
        options
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LoginState {
    Pending,
    LoggedIn,
    Failed(String),
}

/// Logged-in browser session for the financials site, reused for every page in a run.
///
/// Login is attempted lazily before the first navigation. Once all attempts are exhausted the
/// failure is sticky: every later browse reports `auth_failed` without retrying.
pub struct FinancialsBrowser<D: BrowserDriver> {
    driver: D,
    options: BrowserOptions,
    login: LoginState,
    closed: bool,
}

impl<D: BrowserDriver> FinancialsBrowser<D> {
    #[must_use]
    pub fn new(driver: D, options: BrowserOptions) -> Self {
        Self {
            driver,
            options,
            login: LoginState::Pending,
            closed: false,
        }
    }

    fn ensure_logged_in(&mut self) -> Result<(), CapabilityError> {
        match &self.login {
            LoginState::LoggedIn => return Ok(()),
            LoginState::Failed(detail) => {
                return Err(CapabilityError::Auth {
                    attempts: self.options.login_attempts,
                    detail: detail.clone(),
                })
            }
            LoginState::Pending => {}
        }

        let credentials = match &self.options.credentials {
            CredentialSource::NotRequired => {
                self.login = LoginState::LoggedIn;
                return Ok(());
            }
            CredentialSource::Missing(detail) => {
                self.login = LoginState::Failed(detail.clone());
                return Err(CapabilityError::Auth {
                    attempts: 0,
                    detail: detail.clone(),
                });
            }
            CredentialSource::Provided(credentials) => credentials.clone(),
        };

        let attempts = self.options.login_attempts;
        let mut last_detail = String::new();
        for attempt in 1..=attempts {
            match self
                .driver
                .sign_in(&self.options.login_url, &credentials, self.options.settle)
            {
                Ok(landing) if !landing.to_ascii_lowercase().contains("login") => {
                    info!(attempt, "browser login succeeded");
                    self.login = LoginState::LoggedIn;
                    return Ok(());
                }
                Ok(landing) => last_detail = format!("still on login page ({landing})"),
                Err(err) => last_detail = err.to_string(),
            }
            warn!(attempt, attempts, detail = %last_detail, "browser login attempt failed");
        }

        self.login = LoginState::Failed(last_detail.clone());
        Err(CapabilityError::Auth {
            attempts,
            detail: last_detail,
        })
    }
}

impl<D: BrowserDriver> BrowserSession for FinancialsBrowser<D> {
    fn navigate_and_screenshot(
        &mut self,
        ticker: &str,
        target: BrowseTarget,
    ) -> Result<Screenshot, CapabilityError> {
        if self.closed {
            return Err(CapabilityError::Navigation(
                "browser session already closed".to_string(),
            ));
        }
        self.ensure_logged_in()?;

        let url = financials_url(&self.options.base_url, ticker, target);
        info!(%url, "navigating to financials page");
        let page = self.driver.goto(&url)?;
        if let Err(err) = self.driver.select_raw_units() {
            warn!(error = %err, "could not select raw number units");
        }
        let image_png = self.driver.screenshot_full_page()?;
        if image_png.is_empty() {
            return Err(CapabilityError::Navigation(format!(
                "empty screenshot for {url}"
            )));
        }

        Ok(Screenshot {
            url: page.url,
            title: page.title,
            image_png,
            source_tag: format!("{}/{target}", host_of(&self.options.base_url)),
        })
    }

    fn close(&mut self) -> Result<(), CapabilityError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.driver.close()
    }
}

/// Build the browser session named by a capability binding.
///
/// # Errors
/// Returns [`CapabilityError::Configuration`] for an unknown backend or invalid params.
pub fn build_browser_session(
    binding: &CapabilityBinding,
) -> Result<Box<dyn BrowserSession>, CapabilityError> {
    let params = &binding.params;
    match binding.backend.as_str() {
        "remote_browser" => {
            let credentials = credentials_from_env(params);
            Ok(Box::new(FinancialsBrowser::new(
                RemoteBrowserDriver::from_params(params)?,
                BrowserOptions::from_params(params, credentials),
            )))
        }
        "static" => {
            let driver = StaticBrowserDriver::from_params(params)?;
            let credentials = if driver.requires_login() {
                CredentialSource::Provided(Credentials {
                    username: "static".to_string(),
                    password: "static".to_string(),
                })
            } else {
                CredentialSource::NotRequired
            };
            Ok(Box::new(FinancialsBrowser::new(
                driver,
                BrowserOptions::from_params(params, credentials),
            )))
        }
        other => Err(CapabilityError::Configuration(format!(
            "unsupported browser backend '{other}'"
        ))),
    }
}

fn credentials_from_env(params: &Value) -> CredentialSource {
    let username_env = params
        .get("username_env")
        .and_then(Value::as_str)
        .unwrap_or("STOCKANALYSIS_USERNAME");
    let password_env = params
        .get("password_env")
        .and_then(Value::as_str)
        .unwrap_or("STOCKANALYSIS_PASSWORD");
    match (std::env::var(username_env), std::env::var(password_env)) {
        (Ok(username), Ok(password)) if !username.is_empty() && !password.is_empty() => {
            CredentialSource::Provided(Credentials { username, password })
        }
        _ => CredentialSource::Missing(format!(
            "credentials not configured ({username_env}/{password_env})"
        )),
    }
}

#[derive(Debug)]
enum HttpFailure {
    Status { code: u16, body: String },
    TimedOut,
    Transport(String),
    Decode(String),
}

impl HttpFailure {
    fn into_error(
        self,
        capability: &str,
        timeout_ms: u64,
        classify: impl FnOnce(String) -> CapabilityError,
    ) -> CapabilityError {
        match self {
            Self::Status { code, body } => classify(format!("http status {code}: {body}")),
            Self::TimedOut => CapabilityError::Timeout {
                capability: capability.to_string(),
                timeout_ms,
            },
            Self::Transport(detail) => CapabilityError::Transport(detail),
            Self::Decode(detail) => classify(format!("invalid response body: {detail}")),
        }
    }
}

fn send_json(request: ureq::Request, body: &Value) -> Result<Value, HttpFailure> {
    match request.send_json(body) {
        Ok(response) => response.into_json::<Value>().map_err(|err| {
            let detail = err.to_string();
            if detail.contains("timed out") {
                HttpFailure::TimedOut
            } else {
                HttpFailure::Decode(detail)
            }
        }),
        Err(ureq::Error::Status(code, response)) => {
            let body = response.into_string().unwrap_or_default();
            Err(HttpFailure::Status {
                code,
                body: truncate(&body, 500),
            })
        }
        Err(ureq::Error::Transport(err)) => {
            let detail = err.to_string();
            if detail.contains("timed out") {
                Err(HttpFailure::TimedOut)
            } else {
                Err(HttpFailure::Transport(detail))
            }
        }
    }
}

fn http_agent(timeout_ms: u64) -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout(Duration::from_millis(timeout_ms))
        .build()
}

fn timeout_param(params: &Value, default_ms: u64) -> u64 {
    params
        .get("timeout_ms")
        .and_then(Value::as_u64)
        .unwrap_or(default_ms)
}

fn secret_from_env(params: &Value, key: &str, default_env: &str) -> Result<String, CapabilityError> {
    let env_name = params.get(key).and_then(Value::as_str).unwrap_or(default_env);
    match std::env::var(env_name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(CapabilityError::Configuration(format!(
            "{env_name} not configured"
        ))),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Drives a headless-browser sidecar over HTTP. One sidecar session per driver, created on first use.
pub struct RemoteBrowserDriver {
    endpoint: String,
    timeout_ms: u64,
    agent: ureq::Agent,
    session_id: Option<String>,
}

impl RemoteBrowserDriver {
    /// # Errors
    /// Returns [`CapabilityError::Configuration`] when `params.endpoint` is missing.
    pub fn from_params(params: &Value) -> Result<Self, CapabilityError> {
        let endpoint = params
            .get("endpoint")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                CapabilityError::Configuration(
                    "remote_browser requires params.endpoint".to_string(),
                )
            })?
            .trim_end_matches('/')
            .to_string();
        let timeout_ms = timeout_param(params, 90_000);
        Ok(Self {
            endpoint,
            timeout_ms,
            agent: http_agent(timeout_ms),
            session_id: None,
        })
    }

    fn session(&mut self) -> Result<String, CapabilityError> {
        if let Some(session_id) = &self.session_id {
            return Ok(session_id.clone());
        }
        let request = self.agent.post(&format!("{}/sessions", self.endpoint));
        let body = send_json(
            request,
            &json!({ "headless": true, "viewport": { "width": 1920, "height": 1080 } }),
        )
        .map_err(|failure| {
            failure.into_error("browser", self.timeout_ms, CapabilityError::Navigation)
        })?;
        let session_id = body
            .get("session_id")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                CapabilityError::Navigation("sidecar returned no session_id".to_string())
            })?
            .to_string();
        info!(%session_id, "browser session started");
        self.session_id = Some(session_id.clone());
        Ok(session_id)
    }

    fn action(&mut self, action: &str, body: &Value) -> Result<Value, CapabilityError> {
        let session_id = self.session()?;
        let request = self
            .agent
            .post(&format!("{}/sessions/{session_id}/{action}", self.endpoint));
        send_json(request, body).map_err(|failure| {
            failure.into_error("browser", self.timeout_ms, CapabilityError::Navigation)
        })
    }
}

impl BrowserDriver for RemoteBrowserDriver {
    fn sign_in(
        &mut self,
        login_url: &str,
        credentials: &Credentials,
        settle: Duration,
    ) -> Result<String, CapabilityError> {
        let body = self.action(
            "login",
            &json!({
                "url": login_url,
                "username_selector": "input#email",
                "password_selector": "input#password",
                "submit_button": "Log In",
                "username": credentials.username,
                "password": credentials.password,
                "settle_ms": u64::try_from(settle.as_millis()).unwrap_or(u64::MAX),
            }),
        )?;
        Ok(body
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    fn goto(&mut self, url: &str) -> Result<PageInfo, CapabilityError> {
        let body = self.action("goto", &json!({ "url": url, "wait_for": "table" }))?;
        Ok(PageInfo {
            url: body
                .get("url")
                .and_then(Value::as_str)
                .unwrap_or(url)
                .to_string(),
            title: body
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }

    fn select_raw_units(&mut self) -> Result<(), CapabilityError> {
        self.action(
            "click",
            &json!({
                "selector": "button[title=\"Change number units\"]",
                "then": "button:has-text(\"Raw\")",
            }),
        )
        .map(|_| ())
    }

    fn screenshot_full_page(&mut self) -> Result<Vec<u8>, CapabilityError> {
        let body = self.action("screenshot", &json!({ "full_page": true, "format": "png" }))?;
        let encoded = body
            .get("png_base64")
            .and_then(Value::as_str)
            .ok_or_else(|| CapabilityError::Navigation("sidecar returned no image".to_string()))?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|err| CapabilityError::Navigation(format!("invalid screenshot encoding: {err}")))
    }

    fn close(&mut self) -> Result<(), CapabilityError> {
        let Some(session_id) = self.session_id.take() else {
            return Ok(());
        };
        match self
            .agent
            .delete(&format!("{}/sessions/{session_id}", self.endpoint))
            .call()
        {
            Ok(_) => {
                info!(%session_id, "browser session closed");
                Ok(())
            }
            Err(err) => Err(CapabilityError::Transport(format!(
                "closing browser session {session_id}: {err}"
            ))),
        }
    }
}

/// Shared counters for observing a [`StaticBrowserDriver`] after it is boxed away.
#[derive(Debug, Clone, Default)]
pub struct BrowserProbe {
    sign_ins: Arc<AtomicUsize>,
    navigations: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl BrowserProbe {
    #[must_use]
    pub fn sign_ins(&self) -> usize {
        self.sign_ins.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn navigations(&self) -> usize {
        self.navigations.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

/// Offline driver serving one fixed screenshot for every page.
#[derive(Debug, Clone)]
pub struct StaticBrowserDriver {
    image_png: Vec<u8>,
    title: String,
    login_landing: Option<String>,
    navigation_error: Option<String>,
    probe: BrowserProbe,
}

impl Default for StaticBrowserDriver {
    fn default() -> Self {
        Self {
            image_png: b"static-screenshot".to_vec(),
            title: "Financial Statements".to_string(),
            login_landing: None,
            navigation_error: None,
            probe: BrowserProbe::default(),
        }
    }
}

impl StaticBrowserDriver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Require a login that lands on `landing`; a URL containing `login` means rejection.
    #[must_use]
    pub fn with_login_landing(mut self, landing: &str) -> Self {
        self.login_landing = Some(landing.to_string());
        self
    }

    #[must_use]
    pub fn with_navigation_error(mut self, message: &str) -> Self {
        self.navigation_error = Some(message.to_string());
        self
    }

    #[must_use]
    pub fn with_image(mut self, image_png: Vec<u8>) -> Self {
        self.image_png = image_png;
        self
    }

    #[must_use]
    pub fn probe(&self) -> BrowserProbe {
        self.probe.clone()
    }

    #[must_use]
    pub fn requires_login(&self) -> bool {
        self.login_landing.is_some()
    }

    /// # Errors
    /// Returns [`CapabilityError::Configuration`] when `params.image_base64` is not valid base64.
    pub fn from_params(params: &Value) -> Result<Self, CapabilityError> {
        let mut driver = Self::new();
        if let Some(encoded) = params.get("image_base64").and_then(Value::as_str) {
            driver.image_png = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|err| {
                    CapabilityError::Configuration(format!("invalid params.image_base64: {err}"))
                })?;
        }
        if let Some(title) = params.get("title").and_then(Value::as_str) {
            driver.title = title.to_string();
        }
        if params.get("fail_login").and_then(Value::as_bool) == Some(true) {
            driver.login_landing = Some("https://stockanalysis.com/login/".to_string());
        }
        if let Some(message) = params.get("navigation_error").and_then(Value::as_str) {
            driver.navigation_error = Some(message.to_string());
        }
        Ok(driver)
    }
}

impl BrowserDriver for StaticBrowserDriver {
    fn sign_in(
        &mut self,
        _login_url: &str,
        _credentials: &Credentials,
        _settle: Duration,
    ) -> Result<String, CapabilityError> {
        self.probe.sign_ins.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .login_landing
            .clone()
            .unwrap_or_else(|| "https://stockanalysis.com/".to_string()))
    }

    fn goto(&mut self, url: &str) -> Result<PageInfo, CapabilityError> {
        self.probe.navigations.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.navigation_error {
            return Err(CapabilityError::Navigation(message.clone()));
        }
        Ok(PageInfo {
            url: url.to_string(),
            title: self.title.clone(),
        })
    }

    fn select_raw_units(&mut self) -> Result<(), CapabilityError> {
        Ok(())
    }

    fn screenshot_full_page(&mut self) -> Result<Vec<u8>, CapabilityError> {
        Ok(self.image_png.clone())
    }

    fn close(&mut self) -> Result<(), CapabilityError> {
        self.probe.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub trait VisionExtractor {
    /// Read structured text out of a page image following `instruction`.
    #[allow(clippy::missing_errors_doc)]
    fn extract(&self, image_png: &[u8], instruction: &str) -> Result<String, CapabilityError>;
}

/// # Errors
/// Returns [`CapabilityError::Configuration`] for an unknown backend or invalid params.
pub fn build_vision_extractor(
    binding: &CapabilityBinding,
) -> Result<Box<dyn VisionExtractor>, CapabilityError> {
    match binding.backend.as_str() {
        "gemini" => Ok(Box::new(GeminiVision::from_params(&binding.params)?)),
        "static" => Ok(Box::new(StaticVision::from_params(&binding.params))),
        other => Err(CapabilityError::Configuration(format!(
            "unsupported vision backend '{other}'"
        ))),
    }
}

#[derive(Debug, Clone)]
pub struct GeminiVision {
    base_url: String,
    model_id: String,
    api_key: String,
    timeout_ms: u64,
}

impl GeminiVision {
    /// # Errors
    /// Returns [`CapabilityError::Configuration`] when the API key env var is not set.
    pub fn from_params(params: &Value) -> Result<Self, CapabilityError> {
        Ok(Self {
            base_url: params
                .get("base_url")
                .and_then(Value::as_str)
                .unwrap_or(GEMINI_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            model_id: params
                .get("model_id")
                .and_then(Value::as_str)
                .unwrap_or("gemini-2.5-flash")
                .to_string(),
            api_key: secret_from_env(params, "api_key_env", "GEMINI_API_KEY")?,
            timeout_ms: timeout_param(params, 60_000),
        })
    }
}

impl VisionExtractor for GeminiVision {
    fn extract(&self, image_png: &[u8], instruction: &str) -> Result<String, CapabilityError> {
        if image_png.is_empty() {
            return Err(CapabilityError::NoScreenshot);
        }
        let body = json!({
            "contents": [{
                "parts": [
                    { "text": instruction },
                    { "inline_data": {
                        "mime_type": "image/png",
                        "data": base64::engine::general_purpose::STANDARD.encode(image_png),
                    } },
                ]
            }],
            "generationConfig": { "maxOutputTokens": 8192, "temperature": 0.1 },
        });
        let request = http_agent(self.timeout_ms)
            .post(&format!(
                "{}/v1beta/models/{}:generateContent",
                self.base_url, self.model_id
            ))
            .set("content-type", "application/json")
            .set("x-goog-api-key", &self.api_key);
        let response = send_json(request, &body).map_err(|failure| {
            failure.into_error("vision", self.timeout_ms, CapabilityError::Extraction)
        })?;

        let text = response
            .pointer("/candidates/0/content/parts")
            .and_then(Value::as_array)
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|part| part.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(CapabilityError::Extraction(
                "vision model returned no text".to_string(),
            ));
        }
        Ok(text)
    }
}

/// Canned extractor for offline runs and tests.
#[derive(Debug, Clone)]
pub struct StaticVision {
    outcome: Result<String, CapabilityError>,
}

impl StaticVision {
    #[must_use]
    pub fn answering(text: &str) -> Self {
        Self {
            outcome: Ok(text.to_string()),
        }
    }

    #[must_use]
    pub fn failing(error: CapabilityError) -> Self {
        Self {
            outcome: Err(error),
        }
    }

    /// `params.text` answers; `params.error` or `params.simulate_timeout` fail every call.
    #[must_use]
    pub fn from_params(params: &Value) -> Self {
        if params.get("simulate_timeout").and_then(Value::as_bool) == Some(true) {
            return Self::failing(CapabilityError::Timeout {
                capability: "vision".to_string(),
                timeout_ms: timeout_param(params, 60_000),
            });
        }
        if let Some(message) = params.get("error").and_then(Value::as_str) {
            return Self::failing(CapabilityError::Extraction(message.to_string()));
        }
        Self::answering(
            params
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or("| Item | Value |\n|---|---|"),
        )
    }
}

impl VisionExtractor for StaticVision {
    fn extract(&self, image_png: &[u8], _instruction: &str) -> Result<String, CapabilityError> {
        if image_png.is_empty() {
            return Err(CapabilityError::NoScreenshot);
        }
        self.outcome.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchAnswer {
    pub answer: String,
    pub citations: Vec<String>,
}

pub trait WebSearch {
    fn source_tag(&self) -> &'static str;

    #[allow(clippy::missing_errors_doc)]
    fn search(&self, query: &str) -> Result<SearchAnswer, CapabilityError>;
}

/// # Errors
/// Returns [`CapabilityError::Configuration`] for an unknown backend or invalid params.
pub fn build_web_search(
    binding: &CapabilityBinding,
) -> Result<Box<dyn WebSearch>, CapabilityError> {
    match binding.backend.as_str() {
        "perplexity" => Ok(Box::new(PerplexitySearch::from_params(&binding.params)?)),
        "static" => Ok(Box::new(StaticSearch::from_params(&binding.params))),
        other => Err(CapabilityError::Configuration(format!(
            "unsupported search backend '{other}'"
        ))),
    }
}

#[derive(Debug, Clone)]
pub struct PerplexitySearch {
    url: String,
    model_id: String,
    api_key: String,
    timeout_ms: u64,
}

impl PerplexitySearch {
    /// # Errors
    /// Returns [`CapabilityError::Configuration`] when the API key env var is not set.
    pub fn from_params(params: &Value) -> Result<Self, CapabilityError> {
        Ok(Self {
            url: params
                .get("url")
                .and_then(Value::as_str)
                .unwrap_or(PERPLEXITY_URL)
                .to_string(),
            model_id: params
                .get("model_id")
                .and_then(Value::as_str)
                .unwrap_or("sonar-pro")
                .to_string(),
            api_key: secret_from_env(params, "api_key_env", "PERPLEXITY_API_KEY")?,
            timeout_ms: timeout_param(params, 30_000),
        })
    }
}

impl WebSearch for PerplexitySearch {
    fn source_tag(&self) -> &'static str {
        WEB_SEARCH_SOURCE_TAG
    }

    fn search(&self, query: &str) -> Result<SearchAnswer, CapabilityError> {
        let body = json!({
            "model": self.model_id,
            "messages": [
                { "role": "system", "content": SEARCH_SYSTEM_PROMPT },
                { "role": "user", "content": query },
            ],
        });
        let request = http_agent(self.timeout_ms)
            .post(&self.url)
            .set("content-type", "application/json")
            .set("authorization", &format!("Bearer {}", self.api_key));
        let response = send_json(request, &body).map_err(|failure| {
            failure.into_error("web_search", self.timeout_ms, CapabilityError::Search)
        })?;

        let answer = response
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| CapabilityError::Search("response has no answer".to_string()))?
            .to_string();
        let citations = response
            .get("citations")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(SearchAnswer { answer, citations })
    }
}

#[derive(Debug, Clone)]
pub struct StaticSearch {
    outcome: Result<SearchAnswer, CapabilityError>,
}

impl StaticSearch {
    #[must_use]
    pub fn answering(answer: &str, citations: &[&str]) -> Self {
        Self {
            outcome: Ok(SearchAnswer {
                answer: answer.to_string(),
                citations: citations.iter().map(ToString::to_string).collect(),
            }),
        }
    }

    #[must_use]
    pub fn failing(error: CapabilityError) -> Self {
        Self {
            outcome: Err(error),
        }
    }

    #[must_use]
    pub fn from_params(params: &Value) -> Self {
        if let Some(message) = params.get("error").and_then(Value::as_str) {
            return Self::failing(CapabilityError::Search(message.to_string()));
        }
        let citations: Vec<&str> = params
            .get("citations")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        Self::answering(
            params
                .get("answer")
                .and_then(Value::as_str)
                .unwrap_or("no answer configured"),
            &citations,
        )
    }
}

impl WebSearch for StaticSearch {
    fn source_tag(&self) -> &'static str {
        WEB_SEARCH_SOURCE_TAG
    }

    fn search(&self, _query: &str) -> Result<SearchAnswer, CapabilityError> {
        self.outcome.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::{
        build_browser_session, build_vision_extractor, financials_url, host_of, BrowserOptions,
        BrowserSession, CapabilityError, CredentialSource, Credentials, FinancialsBrowser,
        StaticBrowserDriver, StaticSearch, StaticVision, VisionExtractor, WebSearch,
    };
    use gapfill_domain::{BrowseTarget, DataVariant, PeriodKind, StatementKind};
    use gapfill_workflow::CapabilityBinding;
    use serde_json::json;

    fn target(
        statement_kind: StatementKind,
        period: PeriodKind,
        data_variant: DataVariant,
    ) -> BrowseTarget {
        BrowseTarget {
            statement_kind,
            period,
            data_variant,
        }
    }

    fn with_login() -> BrowserOptions {
        BrowserOptions::new(
            "https://stockanalysis.com",
            CredentialSource::Provided(Credentials {
                username: "analyst@example.com".to_string(),
                password: "secret".to_string(),
            }),
        )
    }

    #[test]
    fn builds_statement_urls() {
        let base = "https://stockanalysis.com";
        assert_eq!(
            financials_url(
                base,
                "AAPL",
                target(StatementKind::Income, PeriodKind::Quarterly, DataVariant::AsReported)
            ),
            "https://stockanalysis.com/stocks/aapl/financials/?p=quarterly&type=as-reported"
        );
        assert_eq!(
            financials_url(
                base,
                "PLTR",
                target(StatementKind::Balance, PeriodKind::Annual, DataVariant::Standardized)
            ),
            "https://stockanalysis.com/stocks/pltr/financials/balance-sheet/"
        );
        assert_eq!(
            financials_url(
                "https://stockanalysis.com/",
                "msft",
                target(StatementKind::Cashflow, PeriodKind::Annual, DataVariant::AsReported)
            ),
            "https://stockanalysis.com/stocks/msft/financials/cash-flow-statement/?type=as-reported"
        );
        assert_eq!(host_of("https://www.stockanalysis.com/x"), "stockanalysis.com");
    }

    #[test]
    fn login_once_then_reuse_session() {
        let driver = StaticBrowserDriver::new().with_login_landing("https://stockanalysis.com/");
        let probe = driver.probe();
        let mut browser = FinancialsBrowser::new(driver, with_login());
        let page = target(StatementKind::Income, PeriodKind::Annual, DataVariant::AsReported);

        let first = browser.navigate_and_screenshot("AAPL", page);
        assert!(first.is_ok());
        let first = first.unwrap_or_else(|_| unreachable!());
        assert_eq!(first.source_tag, "stockanalysis.com/income/annual/as-reported");
        assert!(!first.image_png.is_empty());

        assert!(browser.navigate_and_screenshot("AAPL", page).is_ok());
        assert_eq!(probe.sign_ins(), 1);
        assert_eq!(probe.navigations(), 2);
    }

    #[test]
    fn exhausted_login_is_sticky_and_distinct_from_navigation() {
        let driver =
            StaticBrowserDriver::new().with_login_landing("https://stockanalysis.com/login/");
        let probe = driver.probe();
        let mut browser = FinancialsBrowser::new(driver, with_login());
        let page = target(StatementKind::Income, PeriodKind::Annual, DataVariant::AsReported);

        let first = browser.navigate_and_screenshot("AAPL", page);
        assert!(matches!(first, Err(CapabilityError::Auth { attempts: 2, .. })));
        let second = browser.navigate_and_screenshot("AAPL", page);
        assert_eq!(second.map_err(|err| err.code()), Err("auth_failed"));
        assert_eq!(probe.sign_ins(), 2);
        assert_eq!(probe.navigations(), 0);

        let mut broken = FinancialsBrowser::new(
            StaticBrowserDriver::new().with_navigation_error("table not found"),
            BrowserOptions::new("https://stockanalysis.com", CredentialSource::NotRequired),
        );
        let failed = broken.navigate_and_screenshot("AAPL", page);
        assert_eq!(failed.map_err(|err| err.code()), Err("navigation_failed"));
    }

    #[test]
    fn missing_credentials_fail_as_auth() {
        let mut browser = FinancialsBrowser::new(
            StaticBrowserDriver::new(),
            BrowserOptions::new(
                "https://stockanalysis.com",
                CredentialSource::Missing("credentials not configured".to_string()),
            ),
        );
        let page = target(StatementKind::Income, PeriodKind::Annual, DataVariant::AsReported);
        let result = browser.navigate_and_screenshot("AAPL", page);
        assert!(matches!(result, Err(CapabilityError::Auth { attempts: 0, .. })));
    }

    #[test]
    fn close_releases_driver_exactly_once() {
        let driver = StaticBrowserDriver::new();
        let probe = driver.probe();
        let mut browser = FinancialsBrowser::new(
            driver,
            BrowserOptions::new("https://stockanalysis.com", CredentialSource::NotRequired),
        );
        assert!(browser.close().is_ok());
        assert!(browser.close().is_ok());
        assert_eq!(probe.closes(), 1);
        let page = target(StatementKind::Income, PeriodKind::Annual, DataVariant::AsReported);
        assert!(browser.navigate_and_screenshot("AAPL", page).is_err());
    }

    #[test]
    fn vision_refuses_missing_image() {
        let vision = StaticVision::answering("| Revenue | 100 |");
        assert_eq!(vision.extract(&[], "read"), Err(CapabilityError::NoScreenshot));
        assert_eq!(vision.extract(b"png", "read"), Ok("| Revenue | 100 |".to_string()));

        let timed_out = StaticVision::from_params(&json!({"simulate_timeout": true, "timeout_ms": 5}));
        assert_eq!(
            timed_out.extract(b"png", "read").map_err(|err| err.code()),
            Err("timeout")
        );
    }

    #[test]
    fn static_search_returns_citations() {
        let search = StaticSearch::answering("Revenue was 102466000000", &["https://example.com/10q"]);
        let answer = search.search("AAPL revenue").unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(answer.citations, vec!["https://example.com/10q".to_string()]);
        assert_eq!(search.source_tag(), "perplexity-web-search");

        let failing = StaticSearch::from_params(&json!({"error": "rate limited"}));
        assert!(matches!(failing.search("q"), Err(CapabilityError::Search(_))));
    }

    #[test]
    fn builders_reject_unknown_backends() {
        let binding = CapabilityBinding {
            backend: "telepathy".to_string(),
            params: json!({}),
        };
        assert!(build_browser_session(&binding).is_err());
        assert!(build_vision_extractor(&binding).is_err());

        let remote_without_endpoint = CapabilityBinding {
            backend: "remote_browser".to_string(),
            params: json!({}),
        };
        assert!(matches!(
            build_browser_session(&remote_without_endpoint),
            Err(CapabilityError::Configuration(_))
        ));
    }
}
