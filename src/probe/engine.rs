//! Probe engine - executes one HTTP probe against a monitor target
//!
//! One call, one verdict: the engine sends the configured request, reads the
//! body under the monitor's deadline and byte cap, runs the content check and
//! maps everything onto a `(status, sub_status, http_code)` triple. Failures
//! are part of the verdict; `probe` never returns an error.

use std::time::{Duration, Instant};

use futures::StreamExt;
use reqwest::{Client, Method};
use tracing::{instrument, trace, warn};

use crate::config::MonitorDef;
use crate::{ProbeStatus, SubStatus};

use super::sse::ContentCheck;

/// Classified result of a single probe.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub status: ProbeStatus,
    pub sub_status: SubStatus,
    /// 0 iff no HTTP response line was received.
    pub http_code: u16,
    /// Wall time from request start to full body read (or failure).
    pub latency_ms: i64,
    /// Transport error message, when one occurred.
    pub error: Option<String>,
}

impl ProbeOutcome {
    /// Outcome for a worker cancelled before its record could be produced.
    pub fn cancelled() -> Self {
        Self {
            status: ProbeStatus::Red,
            sub_status: SubStatus::NetworkError,
            http_code: 0,
            latency_ms: 0,
            error: Some("probe cancelled".to_string()),
        }
    }
}

/// What the transport layer produced before classification.
enum Exchange {
    /// Full response consumed.
    Response {
        code: u16,
        content_ok: bool,
    },
    /// Body exceeded the configured byte cap.
    Overflow {
        code: u16,
    },
    /// DNS/TCP/TLS/timeout/read failure. `code` is non-zero when the failure
    /// happened after the response line arrived.
    Transport {
        code: u16,
        message: String,
    },
}

pub struct ProbeEngine {
    client: Client,
    max_response_bytes: usize,
}

impl ProbeEngine {
    /// Build an engine for configured (trusted) targets. Redirects are
    /// followed; the deadline is enforced per probe from the monitor's
    /// effective timeout.
    pub fn new(max_response_bytes: usize) -> anyhow::Result<Self> {
        let client = Client::builder().build()?;
        Ok(Self::with_client(client, max_response_bytes))
    }

    /// Build an engine around a pre-configured client. Used by the self-test
    /// variant, which needs a redirect-free client.
    pub fn with_client(client: Client, max_response_bytes: usize) -> Self {
        Self {
            client,
            max_response_bytes,
        }
    }

    /// Execute one probe. All failure modes terminate in a classified
    /// `ProbeOutcome`; nothing is propagated as an error.
    #[instrument(skip(self, monitor), fields(monitor = %monitor.key))]
    pub async fn probe(&self, monitor: &MonitorDef) -> ProbeOutcome {
        let start = Instant::now();
        let deadline = start + monitor.timeout;

        let exchange = self.execute(monitor, deadline).await;
        let latency = start.elapsed();
        let latency_ms = latency.as_millis() as i64;

        match exchange {
            Exchange::Response { code, content_ok } => {
                let (status, sub_status) =
                    classify(code, latency, monitor.slow_latency, content_ok);
                trace!("probe finished: {code} in {latency_ms}ms -> {sub_status}");
                ProbeOutcome {
                    status,
                    sub_status,
                    http_code: code,
                    latency_ms,
                    error: None,
                }
            }
            Exchange::Overflow { code } => {
                warn!("response body exceeded {} bytes", self.max_response_bytes);
                ProbeOutcome {
                    status: ProbeStatus::Red,
                    sub_status: SubStatus::ResponseTooLarge,
                    http_code: code,
                    latency_ms,
                    error: None,
                }
            }
            Exchange::Transport { code, message } => {
                trace!("probe failed: {message}");
                ProbeOutcome {
                    status: ProbeStatus::Red,
                    sub_status: SubStatus::NetworkError,
                    http_code: code,
                    latency_ms,
                    error: Some(message),
                }
            }
        }
    }

    async fn execute(&self, monitor: &MonitorDef, deadline: Instant) -> Exchange {
        let method = Method::from_bytes(monitor.method.as_bytes()).unwrap_or(Method::GET);
        let api_key = monitor.api_key.as_deref();

        let mut request = self.client.request(method, &monitor.url);
        for (name, value) in &monitor.headers {
            request = request.header(name.as_str(), render_template(value, api_key));
        }
        if !monitor.body.is_empty() {
            request = request.body(render_template(&monitor.body, api_key));
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let response = match tokio::time::timeout(remaining, request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                return Exchange::Transport {
                    code: 0,
                    message: format!("{e:#}"),
                };
            }
            Err(_) => {
                return Exchange::Transport {
                    code: 0,
                    message: format!("request timed out after {:?}", monitor.timeout),
                };
            }
        };

        let code = response.status().as_u16();
        let mut check = if monitor.success_contains.is_empty() {
            None
        } else {
            Some(ContentCheck::new(&monitor.success_contains))
        };

        let mut stream = response.bytes_stream();
        let mut total = 0usize;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Exchange::Transport {
                    code,
                    message: "timed out reading response body".to_string(),
                };
            }

            match tokio::time::timeout(remaining, stream.next()).await {
                Ok(Some(Ok(chunk))) => {
                    total += chunk.len();
                    if total > self.max_response_bytes {
                        return Exchange::Overflow { code };
                    }
                    if let Some(check) = &mut check {
                        check.push(&chunk);
                    }
                }
                Ok(Some(Err(e))) => {
                    return Exchange::Transport {
                        code,
                        message: format!("body read failed: {e:#}"),
                    };
                }
                Ok(None) => break,
                Err(_) => {
                    return Exchange::Transport {
                        code,
                        message: "timed out reading response body".to_string(),
                    };
                }
            }
        }

        let content_ok = check.map(ContentCheck::finish).unwrap_or(true);
        Exchange::Response { code, content_ok }
    }
}

fn render_template(template: &str, api_key: Option<&str>) -> String {
    match api_key {
        Some(key) => template.replace("{{API_KEY}}", key),
        None => template.to_string(),
    }
}

/// Map an HTTP response onto the status triple. The content check dominates
/// latency: a 2xx answer with the wrong content is red regardless of speed.
pub(crate) fn classify(
    code: u16,
    latency: Duration,
    slow: Duration,
    content_ok: bool,
) -> (ProbeStatus, SubStatus) {
    match code {
        c if (200..300).contains(&c) => {
            if !content_ok {
                (ProbeStatus::Red, SubStatus::ContentMismatch)
            } else if latency > slow {
                (ProbeStatus::Yellow, SubStatus::SlowLatency)
            } else {
                (ProbeStatus::Green, SubStatus::None)
            }
        }
        429 => (ProbeStatus::Red, SubStatus::RateLimit),
        400 => (ProbeStatus::Red, SubStatus::InvalidRequest),
        401 | 403 => (ProbeStatus::Red, SubStatus::AuthError),
        c if (400..500).contains(&c) => (ProbeStatus::Red, SubStatus::ClientError),
        // 5xx and anything outside the classified ranges (1xx, stray 3xx)
        // count as a server-side protocol failure.
        _ => (ProbeStatus::Red, SubStatus::ServerError),
    }
}
