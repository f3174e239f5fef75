//! Legacy inline options.
//!
//! Before slash-command parameters existed, options were typed into the
//! prompt itself: `a castle on a hill steps:30 sampler:k_euler 4` asks for four
//! images with two overrides. Only keys the backend knows are extracted; any
//! other `word:word` token stays part of the prompt.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::relay::GenerationRequest;

/// A whole token of the form `key:value`.
static OPTION_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([a-z_]+):(\S+)$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineOptions {
    pub prompt: String,
    pub options: BTreeMap<String, String>,
    pub count: Option<u32>,
}

impl InlineOptions {
    /// Merges into `request`. Explicit request options win over inline ones,
    /// and so does `explicit_count`, the count the user actually passed.
    pub fn apply(self, request: GenerationRequest, explicit_count: Option<u32>) -> GenerationRequest {
        let mut options = self.options;
        options.extend(
            request
                .options()
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );

        let count = explicit_count.or(self.count).unwrap_or(request.count());
        GenerationRequest::new(self.prompt)
            .with_options(options)
            .with_count(count)
    }
}

/// Pulls allow-listed `key:value` tokens and a trailing result count out of
/// `text`.
pub fn parse(text: &str, allowed: &[&str]) -> InlineOptions {
    let mut words = Vec::new();
    let mut options = BTreeMap::new();

    for token in text.split_whitespace() {
        match OPTION_TOKEN.captures(token) {
            Some(caps) if allowed.contains(&&caps[1]) => {
                options.insert(caps[1].to_string(), caps[2].to_string());
            }
            _ => words.push(token),
        }
    }

    let count = match words.as_slice() {
        [_, .., last] => last.parse::<u32>().ok(),
        _ => None,
    };
    if count.is_some() {
        words.pop();
    }

    let parsed = InlineOptions {
        prompt: words.join(" "),
        options,
        count,
    };
    debug!("Parsed inline options: {:?}", parsed);
    parsed
}
