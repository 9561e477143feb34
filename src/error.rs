use std::path::PathBuf;

/// Failures while establishing or holding the server connection.
///
/// Every variant is recoverable: the run loop backs off and reconnects.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The server refused the credential during the handshake.
    #[error("server rejected the api key (HTTP {status})")]
    Auth { status: u16 },
    /// The server answered the handshake but could not serve it.
    #[error("server refused the handshake (HTTP {status})")]
    Server { status: u16 },
    #[error("invalid server url: {0}")]
    InvalidUrl(String),
    #[error(transparent)]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
}

/// A `train` command that could not be admitted or started.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("Already training a model ({training_id})")]
    Busy { training_id: String },
    #[error("Folder not found: {}", .0.display())]
    FolderNotFound(PathBuf),
    #[error("Script not found: {}", .0.display())]
    ScriptNotFound(PathBuf),
}

/// Failures of the job process itself.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Exited(String),
    #[error("Training stopped by server")]
    Cancelled,
    #[error("i/o error while supervising job: {0}")]
    Io(#[from] std::io::Error),
}

/// Artifact upload failures. Never fatal to the job.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("upload rejected with HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to read artifact {}: {source}", path.display())]
    ReadArtifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("api key cannot be sent as a bearer token")]
    InvalidCredential,
    #[error(transparent)]
    Endpoint(#[from] ConnectionError),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// A frame from the server that could not be decoded.
#[derive(Debug, thiserror::Error)]
#[error("malformed frame: {0}")]
pub struct ProtocolError(#[from] pub serde_json::Error);
