//! Incremental content extraction for streamed probe responses.
//!
//! LLM relays answer probes with `text/event-stream` bodies whose text is
//! spread over many small deltas. The content check therefore cannot match
//! on individual chunks: this module concatenates the deltas into a running
//! buffer and matches the target substring against that buffer, so the check
//! succeeds as soon as the target appears - even across chunk boundaries.
//!
//! Two streaming shapes are recognised heuristically from SSE `data:` lines:
//!
//! - Anthropic-style: `{"type":"content_block_delta","delta":{"text":"..."}}`
//! - OpenAI-style: `{"choices":[{"delta":{"content":"..."}}]}`
//!
//! Plain (non-SSE) bodies are matched on the raw byte stream.

use serde_json::Value;

/// Rolling substring matcher. Keeps only the last `needle.len() - 1` bytes
/// between pushes, so matching a bounded needle over an unbounded stream
/// stays O(chunk).
#[derive(Debug)]
struct StreamMatcher {
    needle: Vec<u8>,
    tail: Vec<u8>,
    matched: bool,
}

impl StreamMatcher {
    fn new(needle: &str) -> Self {
        Self {
            needle: needle.as_bytes().to_vec(),
            tail: Vec::new(),
            matched: needle.is_empty(),
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        if self.matched {
            return;
        }

        let mut hay = std::mem::take(&mut self.tail);
        hay.extend_from_slice(bytes);

        if hay
            .windows(self.needle.len())
            .any(|window| window == self.needle.as_slice())
        {
            self.matched = true;
            return;
        }

        let keep = self.needle.len().saturating_sub(1).min(hay.len());
        self.tail = hay.split_off(hay.len() - keep);
    }
}

/// Splits a byte stream into lines and extracts the textual deltas carried
/// by SSE `data:` payloads. Non-JSON and non-delta lines are ignored.
#[derive(Debug, Default)]
struct DeltaExtractor {
    line: Vec<u8>,
}

impl DeltaExtractor {
    /// Feed a chunk; returns the delta texts completed by it.
    fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut deltas = Vec::new();
        for &b in bytes {
            if b == b'\n' {
                if let Some(delta) = extract_delta(&self.line) {
                    deltas.push(delta);
                }
                self.line.clear();
            } else {
                self.line.push(b);
            }
        }
        deltas
    }
}

fn extract_delta(line: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(line);
    let payload = line.trim_start().trim_end_matches('\r');
    let payload = payload.strip_prefix("data:")?.trim_start();
    if payload.is_empty() || payload == "[DONE]" {
        return None;
    }

    let value: Value = serde_json::from_str(payload).ok()?;

    // Anthropic shape: content_block_delta events carry delta.text
    if value.get("type").and_then(Value::as_str) == Some("content_block_delta")
        && let Some(text) = value
            .get("delta")
            .and_then(|d| d.get("text"))
            .and_then(Value::as_str)
    {
        return Some(text.to_string());
    }

    // OpenAI shape: choices[].delta.content
    if let Some(choices) = value.get("choices").and_then(Value::as_array) {
        let mut text = String::new();
        for choice in choices {
            if let Some(content) = choice
                .get("delta")
                .and_then(|d| d.get("content"))
                .and_then(Value::as_str)
            {
                text.push_str(content);
            }
        }
        if !text.is_empty() {
            return Some(text);
        }
    }

    None
}

/// Content check over a streamed response body. Matches the target against
/// both the raw bytes (plain bodies) and the concatenated SSE deltas.
#[derive(Debug)]
pub struct ContentCheck {
    raw: StreamMatcher,
    deltas: StreamMatcher,
    extractor: DeltaExtractor,
}

impl ContentCheck {
    pub fn new(needle: &str) -> Self {
        Self {
            raw: StreamMatcher::new(needle),
            deltas: StreamMatcher::new(needle),
            extractor: DeltaExtractor::default(),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.raw.push(chunk);
        for delta in self.extractor.feed(chunk) {
            self.deltas.push(delta.as_bytes());
        }
    }

    /// Flush a trailing unterminated line, then report the verdict.
    pub fn finish(mut self) -> bool {
        let trailing = std::mem::take(&mut self.extractor.line);
        if let Some(delta) = extract_delta(&trailing) {
            self.deltas.push(delta.as_bytes());
        }
        self.matched()
    }

    pub fn matched(&self) -> bool {
        self.raw.matched || self.deltas.matched
    }
}
