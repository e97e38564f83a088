use http::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Malformed CONNECT target: {0}")]
    MalformedTarget(String),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("Unsupported method: {0}")]
    UnsupportedMethod(String),

    #[error("Timed out waiting for the request header section")]
    HeaderTimeout,

    #[error("Header section exceeds {0} bytes")]
    HeaderTooLarge(usize),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ProxyError {
    /// Status sent to the client when this error happens before a tunnel or
    /// response head has been written.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::UnsupportedMethod(_) => StatusCode::NOT_IMPLEMENTED,
            ProxyError::HeaderTimeout => StatusCode::REQUEST_TIMEOUT,
            ProxyError::HeaderTooLarge(_) => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            ProxyError::MalformedTarget(_)
            | ProxyError::MalformedRequest(_)
            | ProxyError::UpstreamUnreachable(_)
            | ProxyError::Io(_)
            | ProxyError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
