//! Outbound request shaping and the transports that carry it.
//!
//! An [`SpRequest`] is fully resolved before it reaches a transport: the
//! endpoint path has its `{param}` placeholders filled from the operation's
//! parameters, the leftover parameters are placed in the JSON body (or the
//! query string for `GET`), and the auth headers are attached. Transports
//! only move bytes and classify the answer.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::Mutex;
use portalfed_core::{AuthDescriptor, CallOutcome, HttpMethod, InstanceSpec, Operation};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::service::registry::SpRegistry;
use crate::traits::{AuthProvider, SpTransport};

static PATH_PARAM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("path parameter pattern is valid")
});

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPurpose {
    Operation,
    Probe,
}

/// A request for one attempt against one instance.
#[derive(Debug, Clone, Serialize)]
pub struct SpRequest {
    pub instance_id: String,
    pub purpose: RequestPurpose,
    pub method: HttpMethod,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
    #[serde(skip)]
    pub timeout: Duration,
}

/// The request could not be built; no SP was contacted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("path {path} needs parameter {param}")]
    MissingPathParam { path: String, param: String },
}

fn param_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn join_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Fills `{param}` placeholders in `template` from `params`, returning the
/// rendered path and the parameters that were not consumed.
///
/// # Errors
///
/// Returns [`RequestError::MissingPathParam`] when a placeholder has no
/// matching parameter.
pub fn render_path(
    template: &str,
    params: &BTreeMap<String, Value>,
) -> Result<(String, BTreeMap<String, Value>), RequestError> {
    let mut remaining = params.clone();
    let mut rendered = String::with_capacity(template.len());
    let mut last = 0;
    for caps in PATH_PARAM.captures_iter(template) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let Some(value) = remaining.remove(name.as_str()) else {
            return Err(RequestError::MissingPathParam {
                path: template.to_string(),
                param: name.as_str().to_string(),
            });
        };
        rendered.push_str(&template[last..whole.start()]);
        rendered.push_str(&param_text(&value));
        last = whole.end();
    }
    rendered.push_str(&template[last..]);
    Ok((rendered, remaining))
}

impl SpRequest {
    /// Builds the request for `op` against `spec`.
    ///
    /// # Errors
    ///
    /// Fails when the endpoint's path template cannot be rendered.
    pub fn for_operation(
        spec: &InstanceSpec,
        op: &Operation,
        headers: BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<Self, RequestError> {
        let endpoint = spec.endpoint_for(op);
        let (path, remaining) = render_path(&endpoint.path, op.params())?;

        let (query, body) = if endpoint.method == HttpMethod::Get {
            let query = remaining
                .iter()
                .map(|(k, v)| (k.clone(), param_text(v)))
                .collect();
            (query, None)
        } else {
            let body: serde_json::Map<String, Value> = remaining.into_iter().collect();
            (Vec::new(), Some(Value::Object(body)))
        };

        Ok(Self {
            instance_id: spec.id.clone(),
            purpose: RequestPurpose::Operation,
            method: endpoint.method,
            url: join_url(&spec.base_url, &path),
            query,
            headers,
            body,
            timeout,
        })
    }

    /// Health probe: `GET {base_url}{health_check_path}`.
    #[must_use]
    pub fn probe(
        spec: &InstanceSpec,
        headers: BTreeMap<String, String>,
        timeout: Duration,
    ) -> Self {
        Self {
            instance_id: spec.id.clone(),
            purpose: RequestPurpose::Probe,
            method: HttpMethod::Get,
            url: join_url(&spec.base_url, &spec.health_check_path),
            query: Vec::new(),
            headers,
            body: None,
            timeout,
        }
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseClass {
    Success,
    ClientError,
    ServerError,
    Timeout,
}

impl From<ResponseClass> for CallOutcome {
    fn from(class: ResponseClass) -> Self {
        match class {
            ResponseClass::Success => Self::Success,
            ResponseClass::ClientError => Self::ClientError,
            ResponseClass::ServerError => Self::ServerError,
            ResponseClass::Timeout => Self::Timeout,
        }
    }
}

/// Opaque payload plus its classification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpResponse {
    pub class: ResponseClass,
    pub status_code: Option<u16>,
    pub payload: Value,
    pub detail: String,
}

impl SpResponse {
    #[must_use]
    pub fn success(payload: Value) -> Self {
        Self {
            class: ResponseClass::Success,
            status_code: Some(200),
            payload,
            detail: String::new(),
        }
    }

    /// Classifies an HTTP status: 2xx success, 4xx client error, anything
    /// else a server error.
    #[must_use]
    pub fn from_status(status: u16, payload: Value) -> Self {
        let class = match status {
            200..=299 => ResponseClass::Success,
            400..=499 => ResponseClass::ClientError,
            _ => ResponseClass::ServerError,
        };
        let detail = if class == ResponseClass::Success {
            String::new()
        } else {
            format!("HTTP {status}")
        };
        Self {
            class,
            status_code: Some(status),
            payload,
            detail,
        }
    }

    #[must_use]
    pub fn timeout(detail: impl Into<String>) -> Self {
        Self {
            class: ResponseClass::Timeout,
            status_code: None,
            payload: Value::Null,
            detail: detail.into(),
        }
    }

    /// The SP could not be reached at all.
    #[must_use]
    pub fn connection_error(detail: impl Into<String>) -> Self {
        Self {
            class: ResponseClass::ServerError,
            status_code: None,
            payload: Value::Null,
            detail: detail.into(),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.class == ResponseClass::Success
    }
}

// ---------------------------------------------------------------------------
// HttpTransport
// ---------------------------------------------------------------------------

/// `SpTransport` over reqwest.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Delete => reqwest::Method::DELETE,
    }
}

#[async_trait]
impl SpTransport for HttpTransport {
    async fn send(&self, request: SpRequest) -> SpResponse {
        let mut builder = self
            .client
            .request(reqwest_method(request.method), &request.url)
            .timeout(request.timeout);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => return SpResponse::timeout(e.to_string()),
            Err(e) => return SpResponse::connection_error(e.to_string()),
        };

        let status = response.status().as_u16();
        match response.bytes().await {
            Ok(bytes) => {
                let payload = serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                    Value::String(String::from_utf8_lossy(&bytes).into_owned())
                });
                SpResponse::from_status(status, payload)
            }
            Err(e) if e.is_timeout() => SpResponse::timeout(e.to_string()),
            Err(e) => SpResponse::connection_error(e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// DescriptorAuthProvider
// ---------------------------------------------------------------------------

/// Turns the registry's [`AuthDescriptor`]s into headers.
pub struct DescriptorAuthProvider {
    registry: Arc<SpRegistry>,
}

impl DescriptorAuthProvider {
    #[must_use]
    pub fn new(registry: Arc<SpRegistry>) -> Self {
        Self { registry }
    }
}

/// Header set for one descriptor.
#[must_use]
pub fn auth_headers(auth: &AuthDescriptor) -> BTreeMap<String, String> {
    match auth {
        AuthDescriptor::ApiKey { header, key } => BTreeMap::from([(header.clone(), key.clone())]),
        AuthDescriptor::BearerToken { token } => {
            BTreeMap::from([("Authorization".to_string(), format!("Bearer {token}"))])
        }
        AuthDescriptor::BasicAuth { username, password } => {
            let encoded = BASE64.encode(format!("{username}:{password}"));
            BTreeMap::from([("Authorization".to_string(), format!("Basic {encoded}"))])
        }
        AuthDescriptor::Custom { headers } => headers.clone(),
    }
}

#[async_trait]
impl AuthProvider for DescriptorAuthProvider {
    async fn headers(&self, instance_id: &str) -> anyhow::Result<BTreeMap<String, String>> {
        let spec = self
            .registry
            .spec(instance_id)
            .ok_or_else(|| anyhow::anyhow!("unknown instance {instance_id}"))?;
        Ok(spec.auth.as_ref().map(auth_headers).unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// ScriptedTransport
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Script {
    queued: VecDeque<SpResponse>,
    fallback: Option<SpResponse>,
    probe: Option<SpResponse>,
    delay: Duration,
}

/// In-memory transport with per-instance scripted answers. Records every
/// request it receives.
///
/// Operation requests pop the instance's queue first, then repeat its
/// fallback. Probes answer with the probe response, defaulting to success.
/// An operation with nothing scripted fails as a connection error.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<String, Script>>,
    log: Mutex<Vec<SpRequest>>,
}

impl ScriptedTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues one-shot responses for `instance_id`.
    pub fn push(&self, instance_id: &str, responses: impl IntoIterator<Item = SpResponse>) {
        self.scripts
            .lock()
            .entry(instance_id.to_string())
            .or_default()
            .queued
            .extend(responses);
    }

    /// Response used once the queue is empty.
    pub fn always(&self, instance_id: &str, response: SpResponse) {
        self.scripts
            .lock()
            .entry(instance_id.to_string())
            .or_default()
            .fallback = Some(response);
    }

    pub fn probe_response(&self, instance_id: &str, response: SpResponse) {
        self.scripts
            .lock()
            .entry(instance_id.to_string())
            .or_default()
            .probe = Some(response);
    }

    /// Delay applied before answering any request to `instance_id`.
    pub fn delay(&self, instance_id: &str, delay: Duration) {
        self.scripts
            .lock()
            .entry(instance_id.to_string())
            .or_default()
            .delay = delay;
    }

    #[must_use]
    pub fn requests(&self) -> Vec<SpRequest> {
        self.log.lock().clone()
    }

    /// Operation requests sent to `instance_id` (probes excluded).
    #[must_use]
    pub fn calls_to(&self, instance_id: &str) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|r| r.instance_id == instance_id && r.purpose == RequestPurpose::Operation)
            .count()
    }
}

#[async_trait]
impl SpTransport for ScriptedTransport {
    async fn send(&self, request: SpRequest) -> SpResponse {
        self.log.lock().push(request.clone());

        let (delay, response) = {
            let mut scripts = self.scripts.lock();
            match scripts.get_mut(&request.instance_id) {
                Some(script) => {
                    let response = match request.purpose {
                        RequestPurpose::Probe => script
                            .probe
                            .clone()
                            .unwrap_or_else(|| SpResponse::success(Value::Null)),
                        RequestPurpose::Operation => script
                            .queued
                            .pop_front()
                            .or_else(|| script.fallback.clone())
                            .unwrap_or_else(|| SpResponse::connection_error("unscripted")),
                    };
                    (script.delay, response)
                }
                None => match request.purpose {
                    RequestPurpose::Probe => (Duration::ZERO, SpResponse::success(Value::Null)),
                    RequestPurpose::Operation => (
                        Duration::ZERO,
                        SpResponse::connection_error("unscripted instance"),
                    ),
                },
            }
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        response
    }
}
