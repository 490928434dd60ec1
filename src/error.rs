use thiserror::Error;

/// Everything the team subsystem can fail with.
#[derive(Error, Debug)]
pub enum TeamError {
    // configuration
    #[error("no valid network interface found")]
    NoValidInterface,
    #[error("port {0} is already in use")]
    PortInUse(u16),
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    // protocol
    #[error("auth failed: {0}")]
    AuthFailed(String),
    #[error("unexpected event type: {0}")]
    UnexpectedEvent(String),
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("remote returned status {status}: {body}")]
    RemoteStatus { status: u16, body: String },
    #[error("websocket error: {0}")]
    WebSocket(String),
    #[error("all addresses failed, last error: {0}")]
    AllAddressesFailed(String),

    // capacity
    #[error("send buffer full")]
    SendBufferFull,
    #[error("websocket not connected")]
    NotConnected,

    // authorization
    #[error("not the team leader")]
    NotTeamLeader,
    #[error("team leader cannot leave, dissolve the team instead")]
    IsTeamLeader,

    // state
    #[error("identity not found")]
    IdentityNotFound,
    #[error("identity name is required")]
    IdentityNameRequired,
    #[error("team name is required")]
    TeamNameRequired,
    #[error("already leading a team")]
    TeamAlreadyExists,
    #[error("already a member of team {0}")]
    AlreadyTeamMember(String),
    #[error("team not found: {0}")]
    TeamNotFound(String),
    #[error("member not found: {0}")]
    MemberNotFound(String),
    #[error("skill not found: {0}")]
    SkillNotFound(String),
    #[error("join failed: {0}")]
    JoinRejected(String),
    #[error("advertiser already running")]
    AlreadyAdvertising,
    #[error("advertiser not running")]
    NotAdvertising,

    // integrity
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("invalid file path in archive: {0}")]
    PathTraversal(String),

    #[error("timed out: {0}")]
    Timeout(&'static str),
    #[error("mdns error: {0}")]
    Mdns(#[from] mdns_sd::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TeamError {
    /// Errors that mean the leader could not be reached at all.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            TeamError::Http(_)
                | TeamError::AllAddressesFailed(_)
                | TeamError::Timeout(_)
                | TeamError::WebSocket(_)
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TeamError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        TeamError::WebSocket(e.to_string())
    }
}

impl From<axum::Error> for TeamError {
    fn from(e: axum::Error) -> Self {
        TeamError::WebSocket(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TeamError>;
