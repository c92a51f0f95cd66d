//! Resilient HTTP transport.
//!
//! Wraps a `ureq` agent with the retry schedule from [`super::retry`].
//! Non-success responses and transport errors are logged with status, headers
//! and a bounded body preview, then retried; after the last attempt the caller
//! gets a [`TransportError`] instead of a panic or a hung loop.

use std::io::Read;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use thiserror::Error;

use super::retry::{parse_retry_after, Observation, RetryPolicy, RetrySchedule, Step};
use crate::config::TransportSettings;
use crate::pacing::{Sleeper, ThreadSleeper};

const MAX_BODY_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{method} {url}: gave up after {attempts} attempt(s), last error: {last}")]
    Exhausted {
        method: String,
        url: String,
        attempts: u32,
        last: String,
    },
    #[error("invalid request to '{url}': {reason}")]
    InvalidRequest { url: String, reason: String },
}

/// A fully read HTTP response.
#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Case-insensitive header lookup (first value).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }

    fn read(response: ureq::Response) -> Result<Self> {
        let status = response.status();
        let mut headers = Vec::new();
        for name in response.headers_names() {
            for value in response.all(&name) {
                headers.push((name.clone(), value.to_string()));
            }
        }
        let mut body = Vec::new();
        response
            .into_reader()
            .take(MAX_BODY_BYTES)
            .read_to_end(&mut body)
            .context("read response body")?;
        Ok(Self {
            status,
            headers,
            body,
        })
    }
}

/// First `limit` characters of `body`, with an ellipsis when truncated.
pub fn body_preview(body: &str, limit: usize) -> String {
    let mut chars = body.chars();
    let head: String = chars.by_ref().take(limit).collect();
    if chars.next().is_some() {
        format!("{}…", head)
    } else {
        head
    }
}

pub struct ResilientClient {
    agent: ureq::Agent,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    debug_body_len: usize,
    verbose: bool,
}

impl ResilientClient {
    pub fn new(settings: &TransportSettings) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(settings.timeout).build();
        Self {
            agent,
            policy: settings.retry_policy(),
            sleeper: Arc::new(ThreadSleeper),
            debug_body_len: settings.debug_body_len,
            verbose: settings.verbose_diagnostics,
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Send a request, retrying per the policy until a 2xx arrives or
    /// attempts run out.
    pub fn request(
        &self,
        method: &str,
        url: &str,
        headers: &[(&str, &str)],
        body: Option<&[u8]>,
    ) -> Result<HttpResponse, TransportError> {
        if let Err(err) = url::Url::parse(url) {
            return Err(TransportError::InvalidRequest {
                url: url.to_string(),
                reason: err.to_string(),
            });
        }

        let mut schedule = RetrySchedule::new(self.policy.clone());
        let mut last = String::from("no attempt made");
        loop {
            let attempt = schedule.attempts() + 1;
            let (observation, response) = match self.send_once(method, url, headers, body) {
                Ok(resp) => {
                    let retry_after = resp.header("Retry-After").and_then(parse_retry_after);
                    (
                        Observation::Status {
                            code: resp.status,
                            retry_after,
                        },
                        Some(resp),
                    )
                }
                Err(err) => {
                    log::error!(
                        "{} {}: {:#} (attempt {}/{})",
                        method,
                        url,
                        err,
                        attempt,
                        schedule.max_attempts()
                    );
                    last = format!("{:#}", err);
                    (Observation::TransportError, None)
                }
            };

            let step = schedule.observe(observation);
            if let Some(resp) = response {
                if step == Step::Success {
                    return Ok(resp);
                }
                if resp.status != 429 {
                    self.dump(&resp, &format!("{} {}", method, url));
                }
                last = format!("status {}", resp.status);
            }

            match step {
                // Only reachable with a received response, returned above.
                Step::Success => {}
                Step::RetryAfter(wait) => {
                    log::warn!(
                        "429 {} -> sleep {}s (attempt {}/{})",
                        url,
                        wait.as_secs_f64(),
                        attempt,
                        schedule.max_attempts()
                    );
                    self.sleeper.sleep(wait);
                }
                Step::Backoff(wait) => {
                    log::debug!("{} {}: retrying in {}s", method, url, wait.as_secs_f64());
                    self.sleeper.sleep(wait);
                }
                Step::Exhausted => {
                    log::error!("exceeded retries for {} {}", method, url);
                    return Err(TransportError::Exhausted {
                        method: method.to_string(),
                        url: url.to_string(),
                        attempts: schedule.attempts(),
                        last,
                    });
                }
            }
        }
    }

    fn send_once(
        &self,
        method: &str,
        url: &str,
        headers: &[(&str, &str)],
        body: Option<&[u8]>,
    ) -> Result<HttpResponse> {
        let mut request = self.agent.request(method, url);
        for (name, value) in headers {
            request = request.set(name, value);
        }
        let result = match body {
            Some(bytes) => request.send_bytes(bytes),
            None => request.call(),
        };
        let response = match result {
            Ok(response) => response,
            Err(ureq::Error::Status(_, response)) => response,
            Err(ureq::Error::Transport(transport)) => {
                return Err(anyhow::Error::new(transport).context("transport failure"))
            }
        };
        HttpResponse::read(response)
    }

    /// Log a non-success response in full diagnostic detail.
    pub fn dump(&self, resp: &HttpResponse, ctx: &str) {
        let level = if self.verbose {
            log::Level::Warn
        } else {
            log::Level::Debug
        };
        log::log!(level, "{}: status={}", ctx, resp.status);
        log::log!(level, "headers: {:?}", resp.headers);
        log::log!(
            level,
            "body: {}",
            body_preview(&resp.text(), self.debug_body_len)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_preview_truncates_on_char_boundaries() {
        assert_eq!(body_preview("short", 300), "short");
        assert_eq!(body_preview("abcdef", 3), "abc…");
        assert_eq!(body_preview("裂縫裂縫", 2), "裂縫…");
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let resp = HttpResponse {
            status: 429,
            headers: vec![("retry-after".to_string(), "3".to_string())],
            body: Vec::new(),
        };
        assert_eq!(resp.header("Retry-After"), Some("3"));
        assert_eq!(resp.header("content-type"), None);
    }

    #[test]
    fn malformed_url_fails_without_retrying() {
        let client = ResilientClient::new(&TransportSettings::default());
        let err = client
            .request("POST", "not a url", &[], None)
            .expect_err("invalid url");
        assert!(matches!(err, TransportError::InvalidRequest { .. }));
    }
}
