use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::time::{Duration, Instant};

use reqwest::header::HeaderMap;
use reqwest::Method;
use serde_json::Value;

use crate::report::Report;

const DEFAULT_MAX_RETRIES: u32 = 10;
const DEFAULT_RETRY_DELAY_SECONDS: f64 = 1.0;

/// Builds the process-wide `reqwest::Client` hatchlings borrow. Settings
/// mirror the shared pool contract: a capped idle-connection pool in place
/// of a hard connection ceiling, a pool idle timeout standing in for the
/// DNS cache TTL, and no built-in keep-alive beyond what the pool already
/// bounds — reqwest has no direct knobs for "force-close" or an explicit
/// DNS TTL, so this is the closest equivalent its client builder exposes.
pub fn build_shared_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .pool_max_idle_per_host(10_000)
        .pool_idle_timeout(Duration::from_secs(600))
        .build()
}

/// What every hatchling in a Colony shares: the pooled HTTP client and the
/// process-wide Report accumulator. Each hatchling wraps this in its own
/// [`Connection`] so it can carry its own base URL and auth headers.
#[derive(Clone)]
pub struct SharedRuntime {
    pub client: reqwest::Client,
    pub report: Rc<RefCell<Report>>,
}

#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub url: String,
    pub name: Option<String>,
    pub method: Method,
    pub data: Option<Value>,
    pub json_data: Option<Value>,
    pub needs_auth: bool,
    pub cookies: Option<HashMap<String, String>>,
    pub error_status: HashSet<u16>,
    pub detailed_response: bool,
}

impl RequestOptions {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        RequestOptions {
            url: url.into(),
            name: None,
            method,
            data: None,
            json_data: None,
            needs_auth: false,
            cookies: None,
            error_status: HashSet::new(),
            detailed_response: false,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn json_data(mut self, data: Value) -> Self {
        self.json_data = Some(data);
        self
    }

    pub fn form_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn needs_auth(mut self, needs_auth: bool) -> Self {
        self.needs_auth = needs_auth;
        self
    }

    pub fn error_status(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.error_status = statuses.into_iter().collect();
        self
    }

    pub fn detailed_response(mut self, detailed: bool) -> Self {
        self.detailed_response = detailed;
        self
    }
}

#[derive(Debug, Clone)]
pub enum RequestOutcome {
    Body(String),
    Detailed {
        body: String,
        content_type: Option<String>,
        headers: HashMap<String, String>,
        cookies: HashMap<String, String>,
    },
}

impl RequestOutcome {
    pub fn body(&self) -> &str {
        match self {
            RequestOutcome::Body(body) => body,
            RequestOutcome::Detailed { body, .. } => body,
        }
    }
}

/// The HTTP capability every hatchling shares: a borrowed client, optional
/// auth headers, and the process-wide Report accumulator. Single-threaded
/// cooperative scheduling means the `Rc<RefCell<_>>` fields need no
/// synchronization — see the colony module for the execution model that
/// makes this sound.
pub struct Connection {
    client: reqwest::Client,
    base_url: String,
    auth_headers: RefCell<Option<HeaderMap>>,
    report: Rc<RefCell<Report>>,
    max_retries: u32,
    retry_delay: f64,
    session_open: Cell<bool>,
}

impl Connection {
    /// A freshly built `Connection` already owns a live client, the
    /// equivalent of having just called `setup_session` — so it starts
    /// with its session open. [`Self::close_session`]/[`Self::open_session`]
    /// mirror `close_session`/`__aenter__` from the session-lifecycle the
    /// request path checks against.
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, report: Rc<RefCell<Report>>) -> Self {
        Connection {
            client,
            base_url: base_url.into(),
            auth_headers: RefCell::new(None),
            report,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY_SECONDS,
            session_open: Cell::new(true),
        }
    }

    pub fn close_session(&self) {
        self.session_open.set(false);
    }

    pub fn open_session(&self) {
        self.session_open.set(true);
    }

    pub fn has_session(&self) -> bool {
        self.session_open.get()
    }

    pub fn from_shared(shared: &SharedRuntime, base_url: impl Into<String>) -> Self {
        Self::new(shared.client.clone(), base_url, shared.report.clone())
    }

    pub fn with_retry_policy(mut self, max_retries: u32, retry_delay: f64) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn set_auth_headers(&self, headers: HeaderMap) {
        *self.auth_headers.borrow_mut() = Some(headers);
    }

    pub fn clear_auth_headers(&self) {
        *self.auth_headers.borrow_mut() = None;
    }

    pub fn report(&self) -> Rc<RefCell<Report>> {
        self.report.clone()
    }

    fn resolve_url(&self, url: &str) -> String {
        if let Some(path) = url.strip_prefix('/') {
            format!("{}/{path}", self.base_url.trim_end_matches('/'))
        } else {
            url.to_string()
        }
    }

    pub async fn do_request(&self, opts: RequestOptions) -> Option<RequestOutcome> {
        let response = self.execute_with_retry(&opts).await?;
        Some(self.read_outcome(response, opts.detailed_response).await)
    }

    /// Identical classification/retry semantics to [`Self::do_request`];
    /// returns `None` if the final response is not `application/json`.
    pub async fn do_request_json(&self, opts: RequestOptions) -> Option<Value> {
        let response = self.execute_with_retry(&opts).await?;
        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("application/json"))
            .unwrap_or(false);
        if !is_json {
            return None;
        }
        response.json::<Value>().await.ok()
    }

    async fn execute_with_retry(&self, opts: &RequestOptions) -> Option<reqwest::Response> {
        let name = opts.name.clone().unwrap_or_else(|| opts.url.clone());

        if !self.session_open.get() {
            self.report.borrow_mut().add_error(name, "request errors");
            return None;
        }
        if opts.data.is_some() && opts.json_data.is_some() {
            return None;
        }
        if opts.needs_auth && self.auth_headers.borrow().is_none() {
            self.report.borrow_mut().add_error(name, "request errors");
            return None;
        }

        let url = self.resolve_url(&opts.url);
        let mut delay = self.retry_delay;

        for _attempt in 0..self.max_retries {
            let mut request = self.client.request(opts.method.clone(), &url);
            if let Some(headers) = self.auth_headers.borrow().as_ref() {
                request = request.headers(headers.clone());
            }
            if let Some(data) = &opts.data {
                request = request.form(data);
            }
            if let Some(json) = &opts.json_data {
                request = request.json(json);
            }
            if let Some(cookies) = &opts.cookies {
                let header_value = cookies
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join("; ");
                request = request.header(reqwest::header::COOKIE, header_value);
            }

            let start = Instant::now();
            match request.send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let duration = start.elapsed().as_secs_f64();

                    if status < 400 {
                        self.report.borrow_mut().add_success(name, duration);
                        return Some(response);
                    }
                    if opts.error_status.contains(&status) {
                        self.report.borrow_mut().add_error(name, "monitored errors");
                        return Some(response);
                    }
                    if (400..500).contains(&status) {
                        self.report.borrow_mut().add_error(name, "other errors");
                        return None;
                    }
                    self.report.borrow_mut().add_error(name.clone(), "request errors");
                }
                Err(_) => {
                    self.report.borrow_mut().add_error(name.clone(), "other errors");
                }
            }

            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            delay = Self::next_backoff(delay);
        }

        None
    }

    async fn read_outcome(&self, response: reqwest::Response, detailed: bool) -> RequestOutcome {
        if !detailed {
            return RequestOutcome::Body(response.text().await.unwrap_or_default());
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect();
        let cookies = response
            .headers()
            .get_all(reqwest::header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(|raw| {
                let pair = raw.split(';').next().unwrap_or(raw);
                match pair.split_once('=') {
                    Some((k, v)) => (k.trim().to_string(), v.trim().to_string()),
                    None => (pair.trim().to_string(), String::new()),
                }
            })
            .collect();
        let body = response.text().await.unwrap_or_default();

        RequestOutcome::Detailed { body, content_type, headers, cookies }
    }

    fn next_backoff(delay: f64) -> f64 {
        if delay < 60.0 {
            delay * 1.5
        } else if delay < 120.0 {
            delay + 5.0
        } else {
            delay.min(125.0)
        }
    }
}
