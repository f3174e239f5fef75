//! Maps raw backend failures onto the small set of categories users see.

use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;

/// A raw failure reported by a backend client.
#[derive(Error, Debug)]
pub enum BackendFailure {
    /// Error during HTTP communication (connect, send, read, decode).
    #[error("API communication failure: {0}")]
    Api(#[from] reqwest::Error),

    /// The backend answered but the body was not the JSON we expected.
    #[error("Unable to parse response: {0}")]
    Json(#[from] serde_json::Error),

    /// An image payload was not valid base64.
    #[error("Unable to decode image payload: {0}")]
    Base64(#[from] base64::DecodeError),

    /// The backend URL could not be built.
    #[error("Invalid backend endpoint: {0}")]
    Endpoint(#[from] url::ParseError),

    /// The backend was reached but answered with a non-success status.
    #[error("Backend returned HTTP {0}")]
    Status(reqwest::StatusCode),

    /// The backend reported an error of its own in an otherwise valid reply.
    #[error("Refused to complete request: {0}")]
    Refusal(String),

    /// Well-formed JSON that matches none of the known reply shapes.
    #[error("Unrecognised response: {0}")]
    Unrecognised(String),

    /// The event stream ended without `Completed` or `Failed`.
    #[error("Event stream ended without a terminal event")]
    Truncated,

    #[error("{0}")]
    Other(String),
}

/// Closed set of failure categories surfaced in a failed outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    InvalidRequest,
    Overloaded,
    ConnectionFailure,
    BadStatus,
    MalformedResponse,
    StreamTruncated,
    Timeout,
    Unknown,
}

impl ErrorCategory {
    /// Short text suitable for a single chat message.
    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorCategory::InvalidRequest => "That request isn't valid",
            ErrorCategory::Overloaded => "Too many requests are running right now, try again shortly",
            ErrorCategory::ConnectionFailure => "The backend is probably down",
            ErrorCategory::BadStatus => "The backend returned an error",
            ErrorCategory::MalformedResponse => "The backend sent something I couldn't understand",
            ErrorCategory::StreamTruncated => "The backend stopped responding partway through",
            ErrorCategory::Timeout => "That took too long, so I gave up",
            ErrorCategory::Unknown => "Something unexpected happened",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::InvalidRequest => "invalid request",
            ErrorCategory::Overloaded => "overloaded",
            ErrorCategory::ConnectionFailure => "connection failure",
            ErrorCategory::BadStatus => "bad status",
            ErrorCategory::MalformedResponse => "malformed response",
            ErrorCategory::StreamTruncated => "stream truncated",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Resolves a raw failure into exactly one category.
pub fn classify(failure: &BackendFailure) -> ErrorCategory {
    match failure {
        BackendFailure::Api(e) => classify_transport(e),
        BackendFailure::Json(_) | BackendFailure::Base64(_) | BackendFailure::Unrecognised(_) => {
            ErrorCategory::MalformedResponse
        }
        BackendFailure::Status(_) | BackendFailure::Refusal(_) => ErrorCategory::BadStatus,
        BackendFailure::Truncated => ErrorCategory::StreamTruncated,
        BackendFailure::Endpoint(_) | BackendFailure::Other(_) => ErrorCategory::Unknown,
    }
}

fn classify_transport(error: &reqwest::Error) -> ErrorCategory {
    if error.is_status() {
        ErrorCategory::BadStatus
    } else if error.is_decode() {
        ErrorCategory::MalformedResponse
    } else if error.is_connect() || error.is_timeout() || error.is_request() || error.is_body() {
        ErrorCategory::ConnectionFailure
    } else if has_io_source(error) {
        ErrorCategory::ConnectionFailure
    } else {
        ErrorCategory::Unknown
    }
}

/// Resets and broken pipes surface as an `io::Error` somewhere in the chain.
fn has_io_source(error: &(dyn StdError + 'static)) -> bool {
    let mut source = error.source();
    while let Some(cause) = source {
        if cause.is::<std::io::Error>() {
            return true;
        }
        source = cause.source();
    }
    false
}
