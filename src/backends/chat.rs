//! ChatGPT relay server client.
//!
//! The server exposes `POST /query` and `POST /reset`. A query is answered
//! either with one JSON object, or with `application/x-ndjson` where every
//! line is the whole answer so far.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info};
use url::Url;

use super::ndjson::LineBuffer;
use super::{
    BackendClient, BackendSpec, EventSink, EventStream, UnknownOptions, as_directory, check_status,
    event_stream,
};
use crate::relay::{BackendFailure, GenerationRequest, JobKind, ProgressEvent};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ChatReply {
    Answer { answer: String },
    Snapshot { message: String },
    Error { error: String },
}

pub struct ChatBackend {
    client: Client,
    base: Url,
    spec: BackendSpec,
}

impl ChatBackend {
    pub fn new(client: Client, base: Url) -> Self {
        Self {
            client,
            base: as_directory(&base),
            spec: BackendSpec {
                kind: JobKind::Chat,
                max_results: 1,
                allowed_options: &[],
                unknown_options: UnknownOptions::Reject,
                status_text: "Thinking...",
            },
        }
    }

    pub fn with_unknown_options(mut self, policy: UnknownOptions) -> Self {
        self.spec = self.spec.with_unknown_options(policy);
        self
    }
}

#[async_trait]
impl BackendClient for ChatBackend {
    fn spec(&self) -> &BackendSpec {
        &self.spec
    }

    fn submit(&self, request: GenerationRequest) -> EventStream {
        let client = self.client.clone();
        let endpoint = self.base.join("query");

        event_stream(JobKind::Chat, move |sink| async move {
            let endpoint = endpoint?;
            let mut body = Map::new();
            for (key, value) in request.options() {
                body.insert(key.clone(), Value::String(value.clone()));
            }
            body.insert("prompt".to_string(), Value::String(request.prompt().to_string()));

            info!("Asking '{}'", request.prompt());
            let response = check_status(client.post(endpoint).json(&body).send().await?)?;

            let streamed = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .is_some_and(|value| value.contains("ndjson"));
            if streamed {
                return relay_snapshots(response, &sink).await;
            }

            let body = response.bytes().await?;
            match serde_json::from_slice::<ChatReply>(&body)? {
                ChatReply::Answer { answer } | ChatReply::Snapshot { message: answer } => {
                    if !answer.is_empty() {
                        sink.emit(ProgressEvent::TextDelta(answer)).await;
                    }
                    Ok(())
                }
                ChatReply::Error { error } => Err(BackendFailure::Refusal(error)),
            }
        })
    }

    async fn cancel_remote(&self) -> Result<(), BackendFailure> {
        let endpoint = self.base.join("reset")?;
        debug!("Resetting chat at {}", endpoint);
        check_status(self.client.post(endpoint).send().await?)?;
        Ok(())
    }
}

async fn relay_snapshots(response: reqwest::Response, sink: &EventSink) -> Result<(), BackendFailure> {
    let mut body = response.bytes_stream();
    let mut lines = LineBuffer::default();
    let mut seen = String::new();

    while let Some(chunk) = body.next().await {
        for line in lines.push(&chunk?) {
            if !relay_snapshot(&line, &mut seen, sink).await? {
                return Ok(());
            }
        }
    }
    if let Some(line) = lines.finish() {
        relay_snapshot(&line, &mut seen, sink).await?;
    }
    Ok(())
}

async fn relay_snapshot(line: &[u8], seen: &mut String, sink: &EventSink) -> Result<bool, BackendFailure> {
    let snapshot = match serde_json::from_slice::<ChatReply>(line)? {
        ChatReply::Snapshot { message } | ChatReply::Answer { answer: message } => message,
        ChatReply::Error { error } => return Err(BackendFailure::Refusal(error)),
    };

    let delta = unseen_tail(seen, &snapshot).to_string();
    *seen = snapshot;
    if delta.is_empty() {
        return Ok(true);
    }
    Ok(sink.emit(ProgressEvent::TextDelta(delta)).await)
}

/// The part of `snapshot` that has not been relayed yet.
///
/// Text already relayed cannot be taken back, so a snapshot that rewrites
/// earlier text only contributes the characters past what was seen.
fn unseen_tail<'a>(seen: &str, snapshot: &'a str) -> &'a str {
    if let Some(tail) = snapshot.strip_prefix(seen) {
        return tail;
    }
    let seen_chars = seen.chars().count();
    snapshot
        .char_indices()
        .nth(seen_chars)
        .map_or("", |(offset, _)| &snapshot[offset..])
}
