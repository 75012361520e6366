//! Blocking REST client with rate-limit bookkeeping.
//!
//! Every response updates the remaining-call counter and reset time from
//! `X-RateLimit-*` headers. Before each request, if the remaining count has
//! dropped to the configured budget, the client sleeps until the reset time
//! so the rest of the run does not run into 403s.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use regex::Regex;
use reqwest::Method;
use reqwest::blocking::{Client, Response};
use serde_json::Value;
use tracing::{debug, info, trace};

use crate::sync::backend::BackendError;
use crate::sync::retry::Sleeper;

const USER_AGENT: &str = concat!("roadmap/", env!("CARGO_PKG_VERSION"));
const API_VERSION: &str = "2022-11-28";
const PER_PAGE: u32 = 100;
/// Used when a 429 carries neither `Retry-After` nor a reset time.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

static NEXT_LINK: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"<([^>]+)>\s*;\s*rel="next""#).ok());

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitState {
    pub remaining: Option<u32>,
    pub reset_at: Option<DateTime<Utc>>,
}

pub struct GitHubClient {
    http: Client,
    api_url: String,
    owner: String,
    repo: String,
    token: String,
    budget: u32,
    rate: Mutex<RateLimitState>,
    sleeper: Arc<dyn Sleeper>,
}

impl GitHubClient {
    pub fn new(
        api_url: &str,
        owner: &str,
        repo: &str,
        token: String,
        budget: u32,
        sleeper: Arc<dyn Sleeper>,
    ) -> Result<Self, BackendError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| BackendError::Permanent(format!("build HTTP client: {e}")))?;
        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            owner: owner.to_string(),
            repo: repo.to_string(),
            token,
            budget,
            rate: Mutex::new(RateLimitState::default()),
            sleeper,
        })
    }

    /// `/repos/{owner}/{repo}{suffix}`
    #[must_use]
    pub fn repo_path(&self, suffix: &str) -> String {
        format!(
            "/repos/{}/{}{suffix}",
            urlencoding::encode(&self.owner),
            urlencoding::encode(&self.repo)
        )
    }

    #[must_use]
    pub fn rate_limit(&self) -> RateLimitState {
        *self.rate.lock()
    }

    pub fn get(&self, path: &str) -> Result<Value, BackendError> {
        self.send(Method::GET, path, None).map(|(body, _)| body)
    }

    pub fn post(&self, path: &str, body: &Value) -> Result<Value, BackendError> {
        self.send(Method::POST, path, Some(body)).map(|(body, _)| body)
    }

    pub fn patch(&self, path: &str, body: &Value) -> Result<Value, BackendError> {
        self.send(Method::PATCH, path, Some(body)).map(|(body, _)| body)
    }

    /// GET every page of a list endpoint. `query` is appended verbatim
    /// (already encoded) together with `per_page`.
    pub fn get_all(&self, path: &str, query: &str) -> Result<Vec<Value>, BackendError> {
        let separator = if query.is_empty() { "" } else { "&" };
        let mut next = Some(format!("{path}?per_page={PER_PAGE}{separator}{query}"));
        let mut items = Vec::new();
        let mut pages = 0u32;
        while let Some(url) = next.take() {
            let (body, link) = self.send(Method::GET, &url, None)?;
            match body {
                Value::Array(page) => items.extend(page),
                other => {
                    return Err(BackendError::Permanent(format!(
                        "expected a JSON array from {path}, got {other}"
                    )));
                }
            }
            pages += 1;
            next = link.as_deref().and_then(next_link);
        }
        debug!(path, pages, items = items.len(), "Fetched paginated list");
        Ok(items)
    }

    /// Any HTTP response means the API is reachable.
    pub fn ping(&self) -> Result<(), String> {
        self.http
            .get(format!("{}/rate_limit", self.api_url))
            .header("User-Agent", USER_AGENT)
            .send()
            .map(|_| ())
            .map_err(|e| format!("cannot reach {}: {e}", self.api_url))
    }

    fn send(
        &self,
        method: Method,
        path_or_url: &str,
        body: Option<&Value>,
    ) -> Result<(Value, Option<String>), BackendError> {
        self.throttle();

        let url = if path_or_url.starts_with("http://") || path_or_url.starts_with("https://") {
            path_or_url.to_string()
        } else {
            format!("{}{path_or_url}", self.api_url)
        };
        trace!(%method, %url, "GitHub request");

        let mut request = self
            .http
            .request(method, &url)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
            .header("X-GitHub-Api-Version", API_VERSION)
            .bearer_auth(&self.token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .map_err(|e| BackendError::Transient(format!("request to {url} failed: {e}")))?;
        self.record_rate_limit(&response);
        classify_response(response)
    }

    fn record_rate_limit(&self, response: &Response) {
        let remaining = header_u64(response, "x-ratelimit-remaining")
            .and_then(|v| u32::try_from(v).ok());
        let reset_at = header_u64(response, "x-ratelimit-reset").and_then(epoch_to_datetime);
        if remaining.is_none() && reset_at.is_none() {
            return;
        }
        let mut rate = self.rate.lock();
        if remaining.is_some() {
            rate.remaining = remaining;
        }
        if reset_at.is_some() {
            rate.reset_at = reset_at;
        }
    }

    /// Sleep until the reset time when the remaining budget is spent. The
    /// lock is held while sleeping so every worker waits.
    fn throttle(&self) {
        let mut rate = self.rate.lock();
        let (Some(remaining), Some(reset_at)) = (rate.remaining, rate.reset_at) else {
            return;
        };
        if remaining > self.budget {
            return;
        }
        let wait = (reset_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        if !wait.is_zero() {
            info!(
                remaining,
                budget = self.budget,
                wait_secs = wait.as_secs(),
                "Rate-limit budget reached; waiting for reset"
            );
            self.sleeper.sleep(wait);
        }
        rate.remaining = None;
    }
}

fn classify_response(response: Response) -> Result<(Value, Option<String>), BackendError> {
    let status = response.status().as_u16();
    let link = header_str(&response, "link");
    let retry_after = header_u64(&response, "retry-after").map(Duration::from_secs);
    let remaining = header_u64(&response, "x-ratelimit-remaining");
    let reset_at = header_u64(&response, "x-ratelimit-reset").and_then(epoch_to_datetime);
    let text = response
        .text()
        .map_err(|e| BackendError::Transient(format!("read response body: {e}")))?;

    if (200..300).contains(&status) {
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text)
                .map_err(|e| BackendError::Permanent(format!("invalid JSON response: {e}")))?
        };
        return Ok((body, link));
    }

    let message = serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| text.chars().take(200).collect());

    let rate_limited = || BackendError::RateLimited {
        retry_after: retry_after
            .or_else(|| reset_at.map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO)))
            .unwrap_or(DEFAULT_RETRY_AFTER),
    };

    Err(match status {
        401 => BackendError::Unauthenticated(message),
        429 => rate_limited(),
        403 if remaining == Some(0) || retry_after.is_some() => rate_limited(),
        404 | 410 => BackendError::NotFound(message),
        500..=599 => BackendError::Transient(format!("HTTP {status}: {message}")),
        _ => BackendError::Permanent(format!("HTTP {status}: {message}")),
    })
}

fn next_link(header: &str) -> Option<String> {
    NEXT_LINK
        .as_ref()?
        .captures(header)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn header_str(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn header_u64(response: &Response, name: &str) -> Option<u64> {
    header_str(response, name).and_then(|v| v.trim().parse().ok())
}

fn epoch_to_datetime(secs: u64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(i64::try_from(secs).ok()?, 0).single()
}
