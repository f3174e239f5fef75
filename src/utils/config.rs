use std::env;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::relay::chunker::ChunkLimits;
use crate::relay::throttle::DEFAULT_UPDATE_INTERVAL;
use crate::relay::{AdmissionLimiter, JobKind, RelaySettings};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable {0}")]
    Missing(&'static str),

    #[error("{key} is not a valid URL: {source}")]
    Url {
        key: &'static str,
        source: url::ParseError,
    },

    #[error("{key} is not a valid duration: {source}")]
    Duration {
        key: &'static str,
        source: serde_json::Error,
    },

    #[error("{key} must be a whole number, got '{value}'")]
    Number { key: &'static str, value: String },

    #[error("{key} must be true or false, got '{value}'")]
    Flag { key: &'static str, value: String },
}

/// Concurrent job caps per backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobLimits {
    pub chat: usize,
    pub dalle: usize,
    pub stable_diffusion: usize,
}

impl Default for JobLimits {
    fn default() -> Self {
        Self {
            chat: 1,
            dalle: 3,
            stable_diffusion: 3,
        }
    }
}

impl JobLimits {
    pub fn limiter(&self) -> AdmissionLimiter {
        AdmissionLimiter::new(1)
            .with_limit(JobKind::Chat, self.chat)
            .with_limit(JobKind::Dalle, self.dalle)
            .with_limit(JobKind::StableDiffusion, self.stable_diffusion)
    }
}

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub discord_token: String,
    pub chat_endpoint: Option<Url>,
    pub dalle_endpoint: Option<Url>,
    pub stable_diffusion_endpoint: Option<Url>,
    pub update_interval: Duration,
    /// `None` lets jobs run until the backend finishes.
    pub job_timeout: Option<Duration>,
    /// Per-read timeout on backend connections.
    pub request_timeout: Option<Duration>,
    pub limits: JobLimits,
    pub inline_options: bool,
    pub passthrough_options: bool,
}

#[derive(Deserialize)]
struct HumanDuration(#[serde(with = "humantime_serde")] Duration);

impl BotConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Reads the configuration from any key/value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let discord_token = get("DISCORD_TOKEN").ok_or(ConfigError::Missing("DISCORD_TOKEN"))?;
        let defaults = JobLimits::default();

        let config = Self {
            discord_token,
            chat_endpoint: parse_url("CHATGPT_ENDPOINT", get("CHATGPT_ENDPOINT"))?,
            dalle_endpoint: parse_url("DALLE_POST_ENDPOINT", get("DALLE_POST_ENDPOINT"))?,
            stable_diffusion_endpoint: parse_url(
                "STABLEDIFFUSION_POST_ENDPOINT",
                get("STABLEDIFFUSION_POST_ENDPOINT"),
            )?,
            update_interval: parse_timeout("RELAY_UPDATE_INTERVAL", get("RELAY_UPDATE_INTERVAL"))?
                .flatten()
                .unwrap_or(DEFAULT_UPDATE_INTERVAL),
            job_timeout: parse_timeout("RELAY_JOB_TIMEOUT", get("RELAY_JOB_TIMEOUT"))?.flatten(),
            request_timeout: parse_timeout("RELAY_REQUEST_TIMEOUT", get("RELAY_REQUEST_TIMEOUT"))?
                .unwrap_or(Some(DEFAULT_REQUEST_TIMEOUT)),
            limits: JobLimits {
                chat: parse_limit("RELAY_LIMIT_CHAT", get("RELAY_LIMIT_CHAT"), defaults.chat)?,
                dalle: parse_limit("RELAY_LIMIT_DALLE", get("RELAY_LIMIT_DALLE"), defaults.dalle)?,
                stable_diffusion: parse_limit(
                    "RELAY_LIMIT_STABLEDIFFUSION",
                    get("RELAY_LIMIT_STABLEDIFFUSION"),
                    defaults.stable_diffusion,
                )?,
            },
            inline_options: parse_flag("RELAY_INLINE_OPTIONS", get("RELAY_INLINE_OPTIONS"))?,
            passthrough_options: parse_flag(
                "STABLEDIFFUSION_PASSTHROUGH_OPTIONS",
                get("STABLEDIFFUSION_PASSTHROUGH_OPTIONS"),
            )?,
        };

        info!(
            "Loaded configuration (chat: {}, dalle: {}, stable diffusion: {})",
            config.chat_endpoint.is_some(),
            config.dalle_endpoint.is_some(),
            config.stable_diffusion_endpoint.is_some()
        );
        Ok(config)
    }

    /// Relay settings shared by every job of `kind`.
    pub fn relay_settings(&self, kind: JobKind) -> RelaySettings {
        RelaySettings {
            update_interval: self.update_interval,
            timeout: self.job_timeout,
            chunk_limits: ChunkLimits::default(),
            // The chat answer is posted on its own, so the streamed copy goes.
            clear_status_on_success: kind == JobKind::Chat,
            ..RelaySettings::default()
        }
    }
}

fn parse_url(key: &'static str, raw: Option<String>) -> Result<Option<Url>, ConfigError> {
    raw.map(|raw| Url::parse(&raw).map_err(|source| ConfigError::Url { key, source }))
        .transpose()
}

/// `None` when unset, `Some(None)` for `off`, otherwise the parsed duration.
fn parse_timeout(
    key: &'static str,
    raw: Option<String>,
) -> Result<Option<Option<Duration>>, ConfigError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    if raw.eq_ignore_ascii_case("off") || raw.eq_ignore_ascii_case("none") {
        debug!("{} disabled", key);
        return Ok(Some(None));
    }

    serde_json::from_value::<HumanDuration>(Value::String(raw))
        .map(|HumanDuration(duration)| Some(Some(duration)))
        .map_err(|source| ConfigError::Duration { key, source })
}

fn parse_limit(key: &'static str, raw: Option<String>, default: usize) -> Result<usize, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| ConfigError::Number { key, value }),
    }
}

fn parse_flag(key: &'static str, raw: Option<String>) -> Result<bool, ConfigError> {
    match raw.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None => Ok(false),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(_) => Err(ConfigError::Flag {
            key,
            value: raw.unwrap_or_default(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use test_case::test_case;

    fn config_from(pairs: &[(&str, &str)]) -> Result<BotConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        BotConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn token_is_required() {
        assert_matches!(config_from(&[]), Err(ConfigError::Missing("DISCORD_TOKEN")));
    }

    #[test]
    fn defaults_apply_when_only_the_token_is_set() {
        let config = config_from(&[("DISCORD_TOKEN", "abc")]).unwrap();

        assert_eq!(config.discord_token, "abc");
        assert!(config.chat_endpoint.is_none());
        assert_eq!(config.update_interval, Duration::from_secs(1));
        assert_eq!(config.job_timeout, None);
        assert_eq!(config.request_timeout, Some(DEFAULT_REQUEST_TIMEOUT));
        assert_eq!(config.limits, JobLimits::default());
        assert!(!config.inline_options);
    }

    #[test]
    fn endpoints_and_durations_are_parsed() {
        let config = config_from(&[
            ("DISCORD_TOKEN", "abc"),
            ("STABLEDIFFUSION_POST_ENDPOINT", "http://10.0.0.2:9090/"),
            ("RELAY_UPDATE_INTERVAL", "500ms"),
            ("RELAY_JOB_TIMEOUT", "10m"),
            ("RELAY_REQUEST_TIMEOUT", "off"),
            ("RELAY_LIMIT_STABLEDIFFUSION", "5"),
            ("RELAY_INLINE_OPTIONS", "true"),
        ])
        .unwrap();

        assert_eq!(
            config.stable_diffusion_endpoint.map(String::from),
            Some("http://10.0.0.2:9090/".to_string())
        );
        assert_eq!(config.update_interval, Duration::from_millis(500));
        assert_eq!(config.job_timeout, Some(Duration::from_secs(600)));
        assert_eq!(config.request_timeout, None);
        assert_eq!(config.limits.stable_diffusion, 5);
        assert!(config.inline_options);
    }

    #[test_case("RELAY_JOB_TIMEOUT", "soon" ; "bad duration")]
    #[test_case("RELAY_LIMIT_DALLE", "three" ; "bad limit")]
    #[test_case("DALLE_POST_ENDPOINT", "not a url" ; "bad url")]
    #[test_case("RELAY_INLINE_OPTIONS", "maybe" ; "bad flag")]
    fn invalid_values_are_reported(key: &str, value: &str) {
        let error = config_from(&[("DISCORD_TOKEN", "abc"), (key, value)]).unwrap_err();

        assert!(error.to_string().contains(key), "{error}");
    }

    #[test]
    fn only_chat_clears_its_status_on_success() {
        let config = config_from(&[("DISCORD_TOKEN", "abc"), ("RELAY_JOB_TIMEOUT", "90s")]).unwrap();

        assert!(config.relay_settings(JobKind::Chat).clear_status_on_success);
        assert!(!config.relay_settings(JobKind::Dalle).clear_status_on_success);
        assert_eq!(config.relay_settings(JobKind::Dalle).timeout, Some(Duration::from_secs(90)));
    }

    #[test]
    fn limits_feed_the_admission_limiter() {
        let limiter = JobLimits::default().limiter();

        assert_eq!(limiter.limit(JobKind::Chat), 1);
        assert_eq!(limiter.limit(JobKind::StableDiffusion), 3);
    }
}
