//! Scheduled polling of HTTP resources with conditional GET and backoff.
//!
//! Each registered URL gets its own tokio task running a fetch loop:
//! conditional GET against cached validators, exponential backoff on
//! transient failures, permanent stop on fatal ones. Redirects are handled
//! here rather than by the HTTP client so that 301s re-register the URL and
//! temporary redirects stay one-shot.
//!
//! Poll state is observable through [`Scheduler::snapshot`] and serializable,
//! so a host can persist it and resume later via [`Scheduler::restore`] and
//! [`Scheduler::start`].

use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use url::Url;

/// Buffered events between a scheduler and its host.
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// One-shot redirect hops tolerated within a single poll attempt.
const MAX_REDIRECT_HOPS: u32 = 5;

/// A transport-level fetch failure (DNS, connect, TLS, read).
#[derive(Debug, Clone, Error)]
#[error("Connection failed: {0}")]
pub struct TransportError(pub String);

/// What the scheduler asks a transport to fetch.
#[derive(Debug, Clone)]
pub struct PollRequest {
    pub url: Url,
    pub headers: HeaderMap,
}

/// A complete response, body already read.
#[derive(Debug, Clone)]
pub struct PollResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// The scheduler's view of HTTP.
///
/// Implementations must not follow redirects; the scheduler interprets 3xx
/// statuses itself.
pub trait Transport: Send + Sync + 'static {
    fn fetch(
        &self,
        request: PollRequest,
    ) -> impl Future<Output = Result<PollResponse, TransportError>> + Send;
}

/// Default transport backed by a shared reqwest client.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(ReqwestTransport { client })
    }
}

impl Transport for ReqwestTransport {
    async fn fetch(&self, request: PollRequest) -> Result<PollResponse, TransportError> {
        let response = self
            .client
            .get(request.url)
            .headers(request.headers)
            .send()
            .await
            .map_err(|e| TransportError(e.to_string()))?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError(e.to_string()))?;
        Ok(PollResponse {
            status,
            headers,
            body,
        })
    }
}

/// Whether a URL's poll loop is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollStatus {
    Running,
    Stopped,
}

/// The result of the most recent completed poll attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PollOutcome {
    Ok {
        completed: DateTime<Utc>,
        size: Option<u64>,
    },
    NotModified {
        completed: DateTime<Utc>,
    },
    Redirect {
        completed: DateTime<Utc>,
        location: String,
    },
    Error {
        completed: DateTime<Utc>,
        reason: String,
    },
}

impl PollOutcome {
    pub fn completed(&self) -> DateTime<Utc> {
        match self {
            PollOutcome::Ok { completed, .. }
            | PollOutcome::NotModified { completed }
            | PollOutcome::Redirect { completed, .. }
            | PollOutcome::Error { completed, .. } => *completed,
        }
    }
}

/// Scheduler-wide defaults for new registrations.
#[derive(Debug, Clone)]
pub struct PollPolicy {
    pub base_interval: Duration,
    pub backoff_multiplier: u32,
    pub backoff_limit: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        PollPolicy {
            base_interval: Duration::from_secs(600),
            backoff_multiplier: 2,
            backoff_limit: 8,
        }
    }
}

/// Per-registration overrides of the scheduler policy.
#[derive(Debug, Clone, Default)]
pub struct PollOptions {
    pub base_interval: Option<Duration>,
    pub backoff_multiplier: Option<u32>,
    pub backoff_limit: Option<u32>,
}

/// Everything the scheduler knows about one URL.
///
/// Serializable so hosts can persist it across restarts; the generation
/// counter is runtime-only and reassigned on restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollState {
    pub status: PollStatus,
    pub base_interval: Duration,
    pub interval: Duration,
    pub backoff_multiplier: u32,
    pub backoff_limit: u32,
    /// Where requests actually go; diverges from the registration key after
    /// a permanent redirect.
    pub request_url: String,
    /// One-shot override from a temporary redirect; consumed by the next
    /// attempt.
    pub next_request: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub last_result: Option<PollOutcome>,
    #[serde(skip)]
    generation: u64,
}

impl PollState {
    fn new(url: &str, policy: &PollPolicy, options: &PollOptions) -> Self {
        let base_interval = options.base_interval.unwrap_or(policy.base_interval);
        PollState {
            status: PollStatus::Running,
            base_interval,
            interval: base_interval,
            backoff_multiplier: options
                .backoff_multiplier
                .unwrap_or(policy.backoff_multiplier),
            backoff_limit: options.backoff_limit.unwrap_or(policy.backoff_limit),
            request_url: url.to_owned(),
            next_request: None,
            etag: None,
            last_modified: None,
            last_result: None,
            generation: 0,
        }
    }

    fn options(&self) -> PollOptions {
        PollOptions {
            base_interval: Some(self.base_interval),
            backoff_multiplier: Some(self.backoff_multiplier),
            backoff_limit: Some(self.backoff_limit),
        }
    }
}

/// Scheduler output: fresh content or a failed attempt.
#[derive(Debug, Clone)]
pub enum PollEvent {
    Updated {
        url: String,
        body: Bytes,
        headers: HeaderMap,
    },
    /// Emitted for every failed attempt, transient or fatal; the outcome
    /// carries the reason and fatal stops arrive as a final
    /// "Retries exceeded" or status-specific failure.
    Failed {
        url: String,
        outcome: PollOutcome,
    },
}

struct Inner<T> {
    transport: T,
    policy: PollPolicy,
    states: Mutex<HashMap<String, PollState>>,
    events: mpsc::Sender<PollEvent>,
    generation: AtomicU64,
}

/// Polls registered URLs on their schedules and emits [`PollEvent`]s.
///
/// Cloning is cheap and shares the underlying state.
pub struct Scheduler<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Scheduler<T> {
    fn clone(&self) -> Self {
        Scheduler {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> Scheduler<T> {
    /// Create a scheduler and the receiving end of its event channel.
    pub fn new(transport: T, policy: PollPolicy) -> (Self, mpsc::Receiver<PollEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (
            Scheduler {
                inner: Arc::new(Inner {
                    transport,
                    policy,
                    states: Mutex::new(HashMap::new()),
                    events: tx,
                    generation: AtomicU64::new(0),
                }),
            },
            rx,
        )
    }

    /// Start polling `url` immediately, then on its interval.
    ///
    /// Registering a URL that is already running is a warned no-op; a stopped
    /// URL is replaced with a fresh registration.
    pub fn register(&self, url: &str, options: PollOptions) {
        register_inner(&self.inner, url.to_owned(), options);
    }

    /// Insert previously persisted state without starting a poll task.
    /// Call [`Scheduler::start`] afterwards to resume.
    pub fn restore(&self, url: &str, mut state: PollState) {
        state.generation = next_generation(&self.inner);
        let mut states = lock_states(&self.inner.states);
        states.insert(url.to_owned(), state);
    }

    /// Resume polling every restored URL that was running.
    ///
    /// Overdue URLs (whose interval already elapsed while we were down) poll
    /// immediately; the rest wait out the remaining delay.
    pub fn start(&self) {
        let mut states = lock_states(&self.inner.states);
        let now = Utc::now().timestamp_millis();
        for (url, state) in states.iter_mut() {
            if state.status == PollStatus::Stopped {
                continue;
            }
            state.generation = next_generation(&self.inner);
            let due_ms = state
                .last_result
                .as_ref()
                .map(|r| r.completed().timestamp_millis() + state.interval.as_millis() as i64)
                .unwrap_or(now);
            let delay = Duration::from_millis(due_ms.saturating_sub(now).max(0) as u64);
            tracing::info!(url = %url, delay_ms = delay.as_millis() as u64, "Resuming poll");
            spawn_poll_task(
                Arc::clone(&self.inner),
                url.clone(),
                state.generation,
                delay,
            );
        }
    }

    /// The current state for one URL, if registered.
    pub fn state(&self, url: &str) -> Option<PollState> {
        lock_states(&self.inner.states).get(url).cloned()
    }

    /// A clone of all poll state, suitable for persistence.
    pub fn snapshot(&self) -> HashMap<String, PollState> {
        lock_states(&self.inner.states).clone()
    }
}

fn lock_states(states: &Mutex<HashMap<String, PollState>>) -> MutexGuard<'_, HashMap<String, PollState>> {
    match states.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn next_generation<T>(inner: &Inner<T>) -> u64 {
    inner.generation.fetch_add(1, Ordering::Relaxed) + 1
}

fn register_inner<T: Transport>(inner: &Arc<Inner<T>>, url: String, options: PollOptions) {
    let generation = {
        let mut states = lock_states(&inner.states);
        if let Some(existing) = states.get(&url) {
            if existing.status == PollStatus::Running {
                tracing::warn!(url = %url, "Already polling");
                return;
            }
        }
        let mut state = PollState::new(&url, &inner.policy, &options);
        state.generation = next_generation(inner);
        let generation = state.generation;
        states.insert(url.clone(), state);
        generation
    };
    tracing::debug!(url = %url, "Registered for polling");
    spawn_poll_task(Arc::clone(inner), url, generation, Duration::ZERO);
}

fn spawn_poll_task<T: Transport>(
    inner: Arc<Inner<T>>,
    url: String,
    generation: u64,
    delay: Duration,
) {
    tokio::spawn(run(inner, url, generation, delay));
}

enum Step {
    Sleep(Duration),
    PollAgain,
    Stop,
}

async fn run<T: Transport>(inner: Arc<Inner<T>>, url: String, generation: u64, mut delay: Duration) {
    loop {
        tokio::time::sleep(delay).await;
        let mut hops = 0u32;
        let step = loop {
            if hops > MAX_REDIRECT_HOPS {
                break fail_transient(&inner, &url, generation, "Too many redirects").await;
            }
            match poll_once(&inner, &url, generation).await {
                Step::PollAgain => hops += 1,
                other => break other,
            }
        };
        match step {
            Step::Sleep(next) => delay = next,
            Step::PollAgain => unreachable!("redirect loop resolves before here"),
            Step::Stop => return,
        }
    }
}

enum Prepared {
    Request(PollRequest),
    BadRedirect,
    Gone,
}

async fn poll_once<T: Transport>(inner: &Arc<Inner<T>>, url: &str, generation: u64) -> Step {
    // Phase 1: build the request under the lock, then release it for the
    // network round trip.
    let prepared = {
        let mut states = lock_states(&inner.states);
        let Some(state) = states.get_mut(url) else {
            return Step::Stop;
        };
        if state.generation != generation || state.status != PollStatus::Running {
            return Step::Stop;
        }
        match state.next_request.take() {
            Some(next) => match Url::parse(&next) {
                Ok(target) => Prepared::Request(PollRequest {
                    url: target,
                    // A redirect target is fetched bare; validators belong to
                    // the canonical resource.
                    headers: HeaderMap::new(),
                }),
                Err(_) => Prepared::BadRedirect,
            },
            None => match Url::parse(&state.request_url) {
                Ok(target) => {
                    let mut headers = HeaderMap::new();
                    if let Some(etag) = &state.etag {
                        if let Ok(value) = HeaderValue::from_str(etag) {
                            headers.insert("If-None-Match", value);
                        }
                    }
                    if let Some(modified) = &state.last_modified {
                        if let Ok(value) = HeaderValue::from_str(modified) {
                            headers.insert("If-Modified-Since", value);
                        }
                    }
                    Prepared::Request(PollRequest {
                        url: target,
                        headers,
                    })
                }
                Err(_) => Prepared::Gone,
            },
        }
    };

    let request = match prepared {
        Prepared::Request(request) => request,
        Prepared::BadRedirect => {
            return fail_transient(inner, url, generation, "Invalid redirect location").await;
        }
        Prepared::Gone => {
            return fail_transient(inner, url, generation, "Invalid URL").await;
        }
    };

    let request_url = request.url.clone();
    let result = inner.transport.fetch(request).await;

    // Phase 2: re-take the lock and make sure the registration we polled for
    // is still the live one before touching anything.
    let (step, events, reregister) = {
        let mut states = lock_states(&inner.states);
        let Some(state) = states.get_mut(url) else {
            return Step::Stop;
        };
        if state.generation != generation {
            tracing::debug!(url = %url, "Discarding stale poll response");
            return Step::Stop;
        }
        apply_response(state, url, &request_url, result)
    };

    emit_all(inner, events).await;
    if let Some((new_url, options)) = reregister {
        register_inner(inner, new_url, options);
    }
    step
}

type Applied = (Step, Vec<PollEvent>, Option<(String, PollOptions)>);

fn apply_response(
    state: &mut PollState,
    url: &str,
    request_url: &Url,
    result: Result<PollResponse, TransportError>,
) -> Applied {
    let response = match result {
        Ok(response) => response,
        Err(e) => {
            return transient(state, url, e.to_string());
        }
    };

    match response.status {
        200 => {
            let received = response.body.len() as u64;
            if let Some(expected) = header_str(&response.headers, "content-length")
                .and_then(|v| v.parse::<u64>().ok())
            {
                if expected != received {
                    return transient(
                        state,
                        url,
                        format!("Bytes received ({received}) != Content-Length header ({expected})"),
                    );
                }
            }
            state.etag = header_str(&response.headers, "etag").map(str::to_owned);
            state.last_modified =
                header_str(&response.headers, "last-modified").map(str::to_owned);
            state.last_result = Some(PollOutcome::Ok {
                completed: Utc::now(),
                size: Some(received),
            });
            state.interval = state.base_interval;
            tracing::debug!(url = %url, bytes = received, "Poll returned new content");
            (
                Step::Sleep(state.interval),
                vec![PollEvent::Updated {
                    url: url.to_owned(),
                    body: response.body,
                    headers: response.headers,
                }],
                None,
            )
        }
        304 => {
            state.last_result = Some(PollOutcome::NotModified {
                completed: Utc::now(),
            });
            state.interval = state.base_interval;
            tracing::debug!(url = %url, "Poll returned not modified");
            (Step::Sleep(state.interval), Vec::new(), None)
        }
        404 => transient(state, url, "Document not found".to_owned()),
        401 => fatal(state, url, "Unauthorised".to_owned()),
        403 => fatal(state, url, "Forbidden".to_owned()),
        410 => fatal(state, url, "Document gone".to_owned()),
        301 => match redirect_target(&response.headers, request_url) {
            Some(location) => {
                tracing::info!(url = %url, location = %location, "Poll target moved permanently");
                state.last_result = Some(PollOutcome::Redirect {
                    completed: Utc::now(),
                    location: location.clone(),
                });
                state.request_url = location.clone();
                (Step::Stop, Vec::new(), Some((location, state.options())))
            }
            None => transient(state, url, "Redirect without Location header".to_owned()),
        },
        302 | 303 | 307 => match redirect_target(&response.headers, request_url) {
            Some(location) => {
                state.next_request = Some(location);
                (Step::PollAgain, Vec::new(), None)
            }
            None => transient(state, url, "Redirect without Location header".to_owned()),
        },
        status @ 400..=499 => fatal(state, url, format!("Unexpected response {status}")),
        status @ 500..=599 => transient(state, url, format!("Server error {status}")),
        status => transient(state, url, format!("Unexpected response {status}")),
    }
}

fn redirect_target(headers: &HeaderMap, request_url: &Url) -> Option<String> {
    let location = header_str(headers, "location")?;
    request_url.join(location).ok().map(|u| u.to_string())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn transient(state: &mut PollState, url: &str, reason: String) -> Applied {
    let outcome = PollOutcome::Error {
        completed: Utc::now(),
        reason: reason.clone(),
    };
    state.last_result = Some(outcome.clone());
    let mut events = vec![PollEvent::Failed {
        url: url.to_owned(),
        outcome,
    }];

    let next = state.interval * state.backoff_multiplier;
    let ceiling = state.base_interval * state.backoff_limit;
    if next > ceiling {
        state.status = PollStatus::Stopped;
        let outcome = PollOutcome::Error {
            completed: Utc::now(),
            reason: "Retries exceeded".to_owned(),
        };
        state.last_result = Some(outcome.clone());
        tracing::warn!(url = %url, reason = %reason, "Poll stopped after retries exceeded");
        events.push(PollEvent::Failed {
            url: url.to_owned(),
            outcome,
        });
        return (Step::Stop, events, None);
    }

    state.interval = next;
    tracing::debug!(url = %url, reason = %reason, retry_secs = next.as_secs(), "Poll failed, backing off");
    (Step::Sleep(next), events, None)
}

fn fatal(state: &mut PollState, url: &str, reason: String) -> Applied {
    state.status = PollStatus::Stopped;
    let outcome = PollOutcome::Error {
        completed: Utc::now(),
        reason: reason.clone(),
    };
    state.last_result = Some(outcome.clone());
    tracing::warn!(url = %url, reason = %reason, "Poll stopped");
    (
        Step::Stop,
        vec![PollEvent::Failed {
            url: url.to_owned(),
            outcome,
        }],
        None,
    )
}

async fn fail_transient<T: Transport>(
    inner: &Arc<Inner<T>>,
    url: &str,
    generation: u64,
    reason: &str,
) -> Step {
    let (step, events) = {
        let mut states = lock_states(&inner.states);
        let Some(state) = states.get_mut(url) else {
            return Step::Stop;
        };
        if state.generation != generation {
            return Step::Stop;
        }
        let (step, events, _) = transient(state, url, reason.to_owned());
        (step, events)
    };
    emit_all(inner, events).await;
    step
}

async fn emit_all<T>(inner: &Arc<Inner<T>>, events: Vec<PollEvent>) {
    for event in events {
        if inner.events.send(event).await.is_err() {
            tracing::debug!("Scheduler event receiver dropped");
        }
    }
}
