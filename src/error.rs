use serde_json::Value;

/// Why a fetch against the forum API did not produce a usable value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// The request never completed: connection refused, DNS, timeout.
    #[error("request failed: {0}")]
    Transport(String),
    /// The server answered with a non-success status.
    #[error("server returned {status}")]
    Status {
        status: u16,
        body: String,
        retry_after: Option<String>,
    },
    /// The server answered 2xx but the body was not the expected shape.
    #[error("malformed response: {0}")]
    Decode(String),
}

impl FetchError {
    pub fn status(status: u16, body: impl Into<String>) -> Self {
        FetchError::Status {
            status,
            body: body.into(),
            retry_after: None,
        }
    }

    pub fn classify(&self) -> Failure {
        match self {
            FetchError::Transport(_) => Failure::Network,
            FetchError::Decode(_) => Failure::Malformed,
            FetchError::Status {
                status,
                body,
                retry_after,
            } => match *status {
                401 | 403 => Failure::Unauthorized,
                404 => Failure::NotFound,
                429 => Failure::RateLimited {
                    retry_after: retry_hint(body).or_else(|| retry_after.clone()),
                },
                other => Failure::Server { status: other },
            },
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            FetchError::Decode(err.to_string())
        } else {
            FetchError::Transport(err.to_string())
        }
    }
}

/// User-facing failure classes shared by every sync unit.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Failure {
    #[error("network failure")]
    Network,
    #[error("authentication required")]
    Unauthorized,
    #[error("rate limited")]
    RateLimited { retry_after: Option<String> },
    #[error("not found")]
    NotFound,
    #[error("server error {status}")]
    Server { status: u16 },
    #[error("malformed response")]
    Malformed,
}

pub const LOGIN_REQUIRED: &str = "You need to be logged in to see that.";

impl Failure {
    pub fn message(&self) -> String {
        match self {
            Failure::Network => "Could not reach the server. Check your connection.".to_string(),
            Failure::Unauthorized => LOGIN_REQUIRED.to_string(),
            Failure::RateLimited { retry_after } => rate_limit_message(retry_after.as_deref()),
            Failure::NotFound => "That could not be found.".to_string(),
            Failure::Server { status } => format!("The server could not handle that ({status})."),
            Failure::Malformed => "The server sent a response we could not read.".to_string(),
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Failure::RateLimited { .. })
    }
}

pub fn rate_limit_message(retry_after: Option<&str>) -> String {
    match retry_after {
        Some(hint) => format!("Too many requests. Please try again in {hint}."),
        None => "Too many requests. Please try again later.".to_string(),
    }
}

/// Reads `retry_after` from a JSON error body. Strings are used verbatim,
/// numbers are treated as seconds.
fn retry_hint(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    match value.get("retry_after")? {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(format!("{number}s")),
        _ => None,
    }
}
