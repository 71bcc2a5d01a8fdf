use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::models::ErrorBody;

#[derive(Debug, thiserror::Error)]
pub enum LocalSendError {
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Request error: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("Async join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    #[error("Invalid PIN")]
    InvalidPin,

    #[error("Session already active")]
    SessionBlocked,

    #[error("Session not found")]
    SessionNotFound,

    #[error("Invalid session id")]
    InvalidSession,

    #[error("Invalid file id or token")]
    InvalidToken,

    #[error("Request from {0} does not match the session sender")]
    IpMismatch(std::net::IpAddr),

    #[error("Request must contain at least one file")]
    NoFiles,

    #[error("Missing request parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Not a file")]
    NotAFile,

    #[error("File not found")]
    FileNotFound,

    #[error("Peer not found")]
    PeerNotFound,

    #[error("Self-discovered")]
    SelfDiscovered,

    #[error("Unexpected status code: {0}")]
    UnexpectedStatus(u16),

    #[error("Upload failed")]
    UploadFailed,

    #[error("Cancel Failed")]
    CancelFailed,

    #[error("Error: could not get $HOME value")]
    NoHomeDir,

    #[error("Could not generate SSL certs")]
    SslGenFail(#[from] rcgen::Error),

    #[error("Could not read certificate: {0}")]
    CertificateError(String),

    #[error("Could not serialize config")]
    ConfigSerializationFail(#[from] toml::ser::Error),

    #[error("Could not parse config file")]
    ConfigParseError(#[from] Box<figment::Error>),

    #[error("Error getting network interface")]
    NetworkInterfaceError(#[from] network_interface::Error),
}

pub type Result<T> = std::result::Result<T, LocalSendError>;

impl LocalSendError {
    /// The status code a protocol handler answers with for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidPin => StatusCode::UNAUTHORIZED,
            Self::SessionBlocked => StatusCode::CONFLICT,
            Self::SessionNotFound | Self::FileNotFound => StatusCode::NOT_FOUND,
            Self::InvalidSession | Self::InvalidToken | Self::IpMismatch(_) => {
                StatusCode::FORBIDDEN
            }
            Self::NoFiles | Self::MissingParameter(_) | Self::SerializationError(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::SelfDiscovered => StatusCode::PRECONDITION_FAILED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for LocalSendError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // internal failures get a fixed message so no paths or source errors leak
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            log::error!("internal error while handling request: {self}");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };
        (status, Json(ErrorBody { message })).into_response()
    }
}
