//! Stable Diffusion web server client.
//!
//! The server streams NDJSON while it works: `{"event": "step", ...}` for
//! every sampling step and `{"url": ..., "seed": ..., "config": ...}` for every
//! finished image. Images are fetched from the server relative to the
//! endpoint.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info};
use url::Url;

use super::ndjson::LineBuffer;
use super::{
    BackendClient, BackendSpec, EventSink, EventStream, UnknownOptions, as_directory, check_status,
    event_stream,
};
use crate::relay::{Artifact, BackendFailure, GenerationRequest, JobKind, ProgressEvent};

pub const MAX_IMAGES: u32 = 8;
pub const DEFAULT_STEPS: u32 = 50;

/// Option keys a request may override.
pub const ALLOWED_OPTIONS: &[&str] = &[
    "steps",
    "cfgscale",
    "sampler",
    "width",
    "height",
    "seed",
    "strength",
    "fit",
    "gfpgan_strength",
    "upscale_level",
    "upscale_strength",
];

fn default_payload() -> Map<String, Value> {
    let defaults = json!({
        "steps": DEFAULT_STEPS.to_string(),
        "cfgscale": "7.5",
        "sampler": "k_lms",
        "width": "512",
        "height": "512",
        "seed": "-1",
        "initimg": null,
        "strength": "1",
        "fit": "on",
        "gfpgan_strength": "0.8",
        "upscale_level": "",
        "upscale_strength": "0.75",
    });
    match defaults {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// The request body: defaults, then overrides, then prompt and count.
pub(crate) fn build_payload(request: &GenerationRequest) -> Map<String, Value> {
    let mut payload = default_payload();
    for (key, value) in request.options() {
        payload.insert(key.clone(), Value::String(value.clone()));
    }
    payload.insert("prompt".to_string(), Value::String(request.prompt().to_string()));
    payload.insert("iterations".to_string(), Value::String(request.count().to_string()));
    payload
}

fn total_steps(payload: &Map<String, Value>, count: u32) -> u32 {
    let steps = payload
        .get("steps")
        .and_then(Value::as_str)
        .and_then(|steps| steps.trim().parse::<u32>().ok())
        .unwrap_or(DEFAULT_STEPS);
    count.saturating_mul(steps)
}

#[derive(Debug, Deserialize)]
struct StreamLine {
    url: Option<String>,
    seed: Option<Value>,
    config: Option<Value>,
    event: Option<String>,
}

impl StreamLine {
    fn seed(&self) -> Option<i64> {
        match self.seed.as_ref()? {
            Value::Number(seed) => seed.as_i64(),
            Value::String(seed) => seed.parse().ok(),
            _ => None,
        }
    }
}

pub struct StableDiffusionBackend {
    client: Client,
    endpoint: Url,
    spec: BackendSpec,
}

impl StableDiffusionBackend {
    pub fn new(client: Client, endpoint: Url) -> Self {
        Self {
            client,
            endpoint,
            spec: BackendSpec {
                kind: JobKind::StableDiffusion,
                max_results: MAX_IMAGES,
                allowed_options: ALLOWED_OPTIONS,
                unknown_options: UnknownOptions::Reject,
                status_text: "Running...",
            },
        }
    }

    pub fn with_unknown_options(mut self, policy: UnknownOptions) -> Self {
        self.spec = self.spec.with_unknown_options(policy);
        self
    }
}

#[async_trait]
impl BackendClient for StableDiffusionBackend {
    fn spec(&self) -> &BackendSpec {
        &self.spec
    }

    fn submit(&self, request: GenerationRequest) -> EventStream {
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();

        event_stream(JobKind::StableDiffusion, move |sink| async move {
            let payload = build_payload(&request);
            let mut progress = Progress {
                completed: 0,
                total: total_steps(&payload, request.count()),
                next_index: 0,
            };
            info!(
                "Generating {} image(s) for '{}' ({} steps)",
                request.count(),
                request.prompt(),
                progress.total
            );
            if !sink.emit(progress.tick()).await {
                return Ok(());
            }

            let response = check_status(client.post(endpoint.clone()).json(&payload).send().await?)?;
            let images = as_directory(&endpoint);
            let mut body = response.bytes_stream();
            let mut lines = LineBuffer::default();

            while let Some(chunk) = body.next().await {
                for line in lines.push(&chunk?) {
                    if !relay_line(&client, &images, &line, &mut progress, &sink).await? {
                        return Ok(());
                    }
                }
            }
            if let Some(line) = lines.finish() {
                relay_line(&client, &images, &line, &mut progress, &sink).await?;
            }
            Ok(())
        })
    }
}

struct Progress {
    completed: u32,
    total: u32,
    next_index: usize,
}

impl Progress {
    fn tick(&self) -> ProgressEvent {
        ProgressEvent::StepTick {
            completed: self.completed.min(self.total),
            total: self.total,
        }
    }
}

/// Resolves a result `url` under the image directory. Results are only ever
/// fetched from the backend itself.
fn image_location(images: &Url, url: &str) -> Result<Url, BackendFailure> {
    let location = images.join(url.trim_start_matches('/'))?;
    if location.origin() != images.origin() {
        return Err(BackendFailure::Unrecognised(format!(
            "image url '{url}' points outside the backend"
        )));
    }
    Ok(location)
}

/// Handles one NDJSON line. `Ok(false)` means the consumer went away.
async fn relay_line(
    client: &Client,
    images: &Url,
    line: &[u8],
    progress: &mut Progress,
    sink: &EventSink,
) -> Result<bool, BackendFailure> {
    let line: StreamLine = serde_json::from_slice(line)?;

    if let Some(url) = line.url.as_deref() {
        let location = image_location(images, url)?;
        debug!("Fetching image {} from {}", progress.next_index, location);
        let image = check_status(client.get(location).send().await?)?.bytes().await?;

        let artifact = Artifact::image(progress.next_index, image.to_vec())
            .with_seed(line.seed())
            .with_config(line.config);
        progress.next_index += 1;
        return Ok(sink.emit(ProgressEvent::ArtifactReady(artifact)).await);
    }

    match line.event.as_deref() {
        Some("step") => {
            progress.completed += 1;
            Ok(sink.emit(progress.tick()).await)
        }
        Some(other) => {
            debug!("Ignoring '{}' event", other);
            Ok(true)
        }
        None => Err(BackendFailure::Unrecognised(
            "line has neither `url` nor `event`".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{ErrorCategory, classify};
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn overrides_replace_defaults() {
        let request = GenerationRequest::new("a castle")
            .with_option("steps", "20")
            .with_option("sampler", "k_euler")
            .with_count(3);

        let payload = build_payload(&request);

        assert_eq!(payload["steps"], "20");
        assert_eq!(payload["sampler"], "k_euler");
        assert_eq!(payload["cfgscale"], "7.5");
        assert_eq!(payload["initimg"], Value::Null);
        assert_eq!(payload["prompt"], "a castle");
        assert_eq!(payload["iterations"], "3");
        assert_eq!(total_steps(&payload, 3), 60);
    }

    #[test]
    fn unparseable_steps_fall_back_to_the_default() {
        let request = GenerationRequest::new("a castle").with_option("steps", "lots");

        assert_eq!(total_steps(&build_payload(&request), 2), 100);
    }

    #[test]
    fn init_image_is_not_overridable() {
        assert!(!ALLOWED_OPTIONS.contains(&"initimg"));
        assert!(default_payload().contains_key("initimg"));
    }

    #[test]
    fn image_urls_resolve_under_the_endpoint() {
        let images = as_directory(&Url::parse("http://10.0.0.2:9090/sd").unwrap());

        assert_eq!(
            image_location(&images, "/outputs/000001.png").unwrap().as_str(),
            "http://10.0.0.2:9090/sd/outputs/000001.png"
        );
    }

    #[test]
    fn image_urls_on_another_host_are_refused() {
        let images = as_directory(&Url::parse("http://10.0.0.2:9090/").unwrap());

        assert_matches!(
            image_location(&images, "http://other-host/x.png"),
            Err(BackendFailure::Unrecognised(_))
        );
        assert_matches!(
            image_location(&images, "https://10.0.0.2:9090/x.png"),
            Err(BackendFailure::Unrecognised(_))
        );
    }

    #[tokio::test]
    async fn foreign_image_url_fails_without_fetching() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "{\"url\":\"http://other-host.invalid/x.png\",\"seed\":1}\n",
                "application/x-ndjson",
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"png".to_vec()))
            .expect(0)
            .mount(&server)
            .await;

        let backend = StableDiffusionBackend::new(Client::new(), Url::parse(&server.uri()).unwrap());
        let events: Vec<_> = backend.submit(GenerationRequest::new("a castle")).collect().await;

        assert_matches!(
            events.last(),
            Some(ProgressEvent::Failed(failure)) if classify(failure) == ErrorCategory::MalformedResponse
        );
    }

    #[tokio::test]
    async fn steps_and_images_become_events() {
        let server = MockServer::start().await;
        let body = concat!(
            "{\"event\":\"step\",\"step\":1}\n",
            "{\"event\":\"step\",\"step\":2}\n",
            "{\"event\":\"upscaling_started\"}\n",
            "{\"url\":\"/outputs/000001.1234.png\",\"seed\":1234,\"config\":{\"steps\":\"2\"}}\n",
        );
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({"prompt": "a castle", "iterations": "1", "steps": "2"})))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/outputs/000001.1234.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"png".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let backend = StableDiffusionBackend::new(Client::new(), Url::parse(&server.uri()).unwrap());
        let events: Vec<_> = backend
            .submit(GenerationRequest::new("a castle").with_option("steps", "2"))
            .collect()
            .await;

        assert_matches!(events[0], ProgressEvent::StepTick { completed: 0, total: 2 });
        assert_matches!(events[1], ProgressEvent::StepTick { completed: 1, total: 2 });
        assert_matches!(events[2], ProgressEvent::StepTick { completed: 2, total: 2 });
        assert_matches!(&events[3], ProgressEvent::ArtifactReady(artifact) => {
            assert_eq!(artifact.index, 0);
            assert_eq!(artifact.seed, Some(1234));
            assert_eq!(artifact.config, Some(serde_json::json!({"steps": "2"})));
        });
        assert_matches!(events[4], ProgressEvent::Completed);
        assert_eq!(events.len(), 5);
    }

    #[tokio::test]
    async fn garbage_line_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("{\"event\":\"step\"}\nnot json\n", "application/x-ndjson"))
            .mount(&server)
            .await;

        let backend = StableDiffusionBackend::new(Client::new(), Url::parse(&server.uri()).unwrap());
        let events: Vec<_> = backend.submit(GenerationRequest::new("a castle")).collect().await;

        assert_matches!(events.last(), Some(ProgressEvent::Failed(failure)) if classify(failure) == ErrorCategory::MalformedResponse);
    }

    #[tokio::test]
    async fn missing_image_is_a_bad_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("{\"url\":\"/outputs/gone.png\"}\n", "application/x-ndjson"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let backend = StableDiffusionBackend::new(Client::new(), Url::parse(&server.uri()).unwrap());
        let events: Vec<_> = backend.submit(GenerationRequest::new("a castle")).collect().await;

        assert_matches!(events.last(), Some(ProgressEvent::Failed(BackendFailure::Status(_))));
    }
}
