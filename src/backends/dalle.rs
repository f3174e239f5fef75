//! DALL-E mini client.
//!
//! One `POST` returns every image at once, as a JSON array of base64 PNGs.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info};
use url::Url;

use super::{BackendClient, BackendSpec, EventStream, UnknownOptions, check_status, event_stream};
use crate::relay::{Artifact, BackendFailure, GenerationRequest, JobKind, ProgressEvent};

pub const MAX_IMAGES: u32 = 4;

#[derive(Debug, Serialize)]
struct DalleRequest<'a> {
    text: &'a str,
    num_images: u32,
}

pub struct DalleBackend {
    client: Client,
    endpoint: Url,
    spec: BackendSpec,
}

impl DalleBackend {
    pub fn new(client: Client, endpoint: Url) -> Self {
        Self {
            client,
            endpoint,
            spec: BackendSpec {
                kind: JobKind::Dalle,
                max_results: MAX_IMAGES,
                allowed_options: &[],
                unknown_options: UnknownOptions::Reject,
                status_text: "Generating...",
            },
        }
    }
}

#[async_trait]
impl BackendClient for DalleBackend {
    fn spec(&self) -> &BackendSpec {
        &self.spec
    }

    fn submit(&self, request: GenerationRequest) -> EventStream {
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();

        event_stream(JobKind::Dalle, move |sink| async move {
            let payload = DalleRequest {
                text: request.prompt(),
                num_images: request.count(),
            };
            info!("Requesting {} image(s) for '{}'", payload.num_images, payload.text);

            let response = check_status(client.post(endpoint).json(&payload).send().await?)?;
            let body = response.bytes().await?;
            let images: Vec<String> = serde_json::from_slice(&body)?;
            debug!("Received {} image(s)", images.len());

            for (index, encoded) in images.into_iter().enumerate() {
                let artifact = Artifact::image(index, decode_image(&encoded)?);
                if !sink.emit(ProgressEvent::ArtifactReady(artifact)).await {
                    break;
                }
            }
            Ok(())
        })
    }
}

/// Decodes one base64 image, tolerating the line breaks some encoders insert.
fn decode_image(encoded: &str) -> Result<Vec<u8>, BackendFailure> {
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    Ok(general_purpose::STANDARD.decode(compact)?)
}
