//! Turns the upstream event stream into what the client asked for: either the
//! raw SSE bytes, or one aggregated `chat.completion` object.

use crate::error::AppError;
use crate::openai::{AssistantMessage, ChatChoice, ChatCompletion, Role};
use crate::preprocess::THINKING_MARKER;
use crate::tool_calls::{extract_tool_calls, strip_tool_json};
use axum::body::Body;
use axum::http::HeaderValue;
use axum::http::header::{CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use axum::response::Response;
use eventsource_stream::Eventsource;
use futures_util::{Stream, StreamExt, TryStreamExt};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::sync::LazyLock;

const THINK_CLOSE: &str = "</thinking>";

static DETAILS_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<details[^>]*>|</details>|<summary>.*?</summary>")
        .expect("valid details regex")
});

#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    #[error("malformed upstream event: {0}")]
    MalformedEvent(String),
    #[error("upstream stream failed: {0}")]
    Stream(String),
    #[error("upstream reported an error: {0}")]
    Upstream(String),
    #[error("upstream stream ended before completion")]
    Truncated,
}

impl From<TranslateError> for AppError {
    fn from(err: TranslateError) -> Self {
        let code = match err {
            TranslateError::MalformedEvent(_) => "malformed_upstream_event",
            TranslateError::Stream(_) => "upstream_unavailable",
            TranslateError::Upstream(_) => "upstream_error",
            TranslateError::Truncated => "upstream_truncated",
        };
        AppError::internal(code, err.to_string()).with_type("upstream_error")
    }
}

/// Forward the upstream SSE body untouched. Dropping the returned response
/// drops the upstream connection with it.
pub fn passthrough_response(upstream: reqwest::Response) -> Response {
    let stream = upstream.bytes_stream().inspect_err(|err| {
        tracing::warn!("upstream stream aborted during passthrough: {err}");
    });
    let mut response = Response::new(Body::from_stream(stream));
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    response
}

#[derive(Debug, Clone)]
pub struct AggregateOptions {
    /// Client-facing model id echoed in the completion.
    pub model: String,
    pub tools_active: bool,
    /// Route `<thinking>` spans in answer text to reasoning. Only meaningful
    /// when the thinking prompt asked the model for them.
    pub split_thinking_tags: bool,
    pub scan_limit: usize,
}

/// Consume an upstream SSE byte stream and build one completion.
pub async fn aggregate_stream<S, B, E>(
    bytes: S,
    options: &AggregateOptions,
) -> Result<ChatCompletion, TranslateError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut events = std::pin::pin!(bytes.eventsource());
    let mut aggregator = Aggregator::new(options.split_thinking_tags);
    while let Some(event) = events.next().await {
        let event = event.map_err(|err| TranslateError::Stream(err.to_string()))?;
        if aggregator.push(&event.data)? == Flow::Done {
            return Ok(aggregator.finish(options));
        }
    }
    Err(TranslateError::Truncated)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Done,
}

#[derive(Debug, Deserialize)]
struct UpstreamEnvelope {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    data: Option<UpstreamDelta>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct UpstreamDelta {
    #[serde(default)]
    delta_content: Option<String>,
    #[serde(default)]
    edit_content: Option<String>,
    #[serde(default)]
    phase: Option<String>,
    #[serde(default)]
    done: Option<bool>,
    #[serde(default)]
    usage: Option<Value>,
    #[serde(default)]
    finish_reason: Option<String>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum ThinkingState {
    #[default]
    Closed,
    Open,
}

/// Accumulates upstream events in arrival order.
#[derive(Debug, Default)]
pub struct Aggregator {
    content: String,
    reasoning: String,
    upstream_reasoning: String,
    pending: String,
    /// Upstream `thinking` phase.
    phase: ThinkingState,
    /// `<thinking>` span inside answer text.
    tagged: ThinkingState,
    split_thinking_tags: bool,
    /// A `<thinking>` span was cut out of the answer.
    spans_removed: bool,
    usage: Option<Value>,
    finish_reason: Option<String>,
}

impl Aggregator {
    pub fn new(split_thinking_tags: bool) -> Self {
        Self {
            split_thinking_tags,
            ..Self::default()
        }
    }

    /// Feed the `data` field of one SSE event.
    pub fn push(&mut self, data: &str) -> Result<Flow, TranslateError> {
        let data = data.trim();
        if data.is_empty() {
            return Ok(Flow::Continue);
        }
        if data == "[DONE]" {
            return Ok(Flow::Done);
        }
        let envelope: UpstreamEnvelope = serde_json::from_str(data)
            .map_err(|err| TranslateError::MalformedEvent(format!("{err}: {}", preview(data))))?;
        if let Some(err) = envelope.error.filter(|e| !e.is_null()) {
            return Err(TranslateError::Upstream(error_message(&err)));
        }
        if envelope
            .kind
            .as_deref()
            .is_some_and(|kind| kind != "chat:completion")
        {
            return Ok(Flow::Continue);
        }
        let Some(delta) = envelope.data else {
            return Ok(Flow::Continue);
        };
        if let Some(err) = delta.error.as_ref().filter(|e| !e.is_null()) {
            return Err(TranslateError::Upstream(error_message(err)));
        }

        let phase = delta.phase.as_deref();
        if phase == Some("thinking") {
            self.phase = ThinkingState::Open;
            if let Some(text) = delta.delta_content.as_deref() {
                self.upstream_reasoning.push_str(text);
            }
        } else {
            if phase == Some("answer") && self.phase == ThinkingState::Open {
                // First answer event repeats the closed reasoning block, then the answer start.
                if let Some((_, tail)) = delta
                    .edit_content
                    .as_deref()
                    .and_then(|edit| edit.rsplit_once("</details>"))
                {
                    self.push_answer(tail.trim_start());
                }
                self.phase = ThinkingState::Closed;
            }
            if let Some(text) = delta.delta_content.as_deref() {
                self.push_answer(text);
            }
        }
        if delta.usage.is_some() {
            self.usage = delta.usage;
        }
        if delta.finish_reason.is_some() {
            self.finish_reason = delta.finish_reason;
        }
        if delta.done == Some(true) || phase == Some("done") {
            return Ok(Flow::Done);
        }
        Ok(Flow::Continue)
    }

    /// Answer-phase text. `<thinking>` spans produced by the thinking prompt
    /// are routed to the reasoning buffer; tags may straddle deltas.
    fn push_answer(&mut self, text: &str) {
        if !self.split_thinking_tags {
            self.content.push_str(text);
            return;
        }
        self.pending.push_str(text);
        loop {
            let (tag, next) = match self.tagged {
                ThinkingState::Closed => (THINKING_MARKER, ThinkingState::Open),
                ThinkingState::Open => (THINK_CLOSE, ThinkingState::Closed),
            };
            if let Some(pos) = self.pending.find(tag) {
                let before = self.pending[..pos].to_string();
                self.current_buffer().push_str(&before);
                self.pending.drain(..pos + tag.len());
                self.tagged = next;
                self.spans_removed = true;
                continue;
            }
            let keep = partial_tag_suffix(&self.pending, tag);
            let flush_to = self.pending.len() - keep;
            let flushed: String = self.pending.drain(..flush_to).collect();
            self.current_buffer().push_str(&flushed);
            break;
        }
    }

    fn current_buffer(&mut self) -> &mut String {
        match self.tagged {
            ThinkingState::Open => &mut self.reasoning,
            ThinkingState::Closed => &mut self.content,
        }
    }

    pub fn finish(mut self, options: &AggregateOptions) -> ChatCompletion {
        let pending = std::mem::take(&mut self.pending);
        self.current_buffer().push_str(&pending);

        let mut reasoning = clean_upstream_reasoning(&self.upstream_reasoning);
        let tagged = self.reasoning.trim();
        if !tagged.is_empty() {
            if !reasoning.is_empty() {
                reasoning.push_str("\n\n");
            }
            reasoning.push_str(tagged);
        }

        let mut content = if self.spans_removed {
            self.content.trim().to_string()
        } else {
            std::mem::take(&mut self.content)
        };
        let mut tool_calls = None;
        if options.tools_active {
            if let Some(calls) = extract_tool_calls(&content, options.scan_limit) {
                metrics::counter!("zlink_tool_calls_extracted_total").increment(calls.len() as u64);
                content = strip_tool_json(&content);
                tool_calls = Some(calls);
            }
        }
        let finish_reason = if tool_calls.is_some() {
            "tool_calls"
        } else {
            map_finish_reason(self.finish_reason.as_deref())
        };

        ChatCompletion {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: options.model.clone(),
            choices: vec![ChatChoice {
                index: 0,
                message: AssistantMessage {
                    role: Role::Assistant,
                    content,
                    reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
                    tool_calls,
                },
                finish_reason: finish_reason.to_string(),
            }],
            usage: self.usage,
        }
    }
}

fn map_finish_reason(reason: Option<&str>) -> &'static str {
    match reason {
        Some("length") | Some("max_tokens") => "length",
        Some("content_filter") | Some("sensitive") => "content_filter",
        _ => "stop",
    }
}

/// Strips the upstream's `<details>`/`<summary>` wrapper and quote markers.
fn clean_upstream_reasoning(raw: &str) -> String {
    let without_tags = DETAILS_TAG.replace_all(raw, "");
    without_tags
        .lines()
        .map(|line| line.strip_prefix("> ").or_else(|| line.strip_prefix('>')).unwrap_or(line))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Length of the longest suffix of `text` that is a proper prefix of `tag`.
fn partial_tag_suffix(text: &str, tag: &str) -> usize {
    (1..tag.len())
        .rev()
        .find(|&len| {
            len <= text.len()
                && text.is_char_boundary(text.len() - len)
                && text.ends_with(&tag[..len])
        })
        .unwrap_or(0)
}

fn error_message(err: &Value) -> String {
    err.get("detail")
        .or_else(|| err.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| err.to_string())
}

fn preview(data: &str) -> String {
    data.chars().take(120).collect()
}
