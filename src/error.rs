use thiserror::Error;

/// Failure class of a pre-download probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    /// Connection-level failure (refused, reset, timeout).
    Network,
    /// Host name resolution failed.
    Dns,
    /// TLS handshake or certificate failure.
    Tls,
    /// The origin answered with a status outside 2xx/206.
    HttpStatus(u16),
    /// Redirect loop, cap exceeded, or refused https→http downgrade.
    Redirect,
}

impl std::fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeKind::Network => write!(f, "network"),
            ProbeKind::Dns => write!(f, "dns"),
            ProbeKind::Tls => write!(f, "tls"),
            ProbeKind::HttpStatus(code) => write!(f, "http status {}", code),
            ProbeKind::Redirect => write!(f, "redirect"),
        }
    }
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("probe failed ({kind}): {message}")]
    Probe { kind: ProbeKind, message: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Unretryable network outcome; the download stops but stays resumable
    /// when the origin supports ranges.
    #[error("fatal network error: {0}")]
    Fatal(String),

    #[error("disk error: {0}")]
    Disk(#[from] std::io::Error),

    /// Persistence file could not be read, decoded, or replaced.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("unknown download hash: {0}")]
    UnknownHash(String),

    #[error("download is not resumable")]
    NotResumable,

    #[error("download {0} is still running")]
    StillRunning(String),

    #[error("max retry exceeded")]
    MaxRetryExceeded,

    #[error("cancelled")]
    Cancelled,

    #[error("part failed: {0}")]
    PartFailed(String),
}

impl DownloadError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DownloadError::Cancelled)
    }
}
