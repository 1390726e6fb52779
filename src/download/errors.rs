use crate::download::types::FileHash;

/// Failure reported by a [`QueryDispatcher`](crate::download::requery::QueryDispatcher).
#[derive(Debug)]
pub enum DispatchError {
    QueueFull,
    ChannelClosed,
    Rejected(String),
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QueueFull => write!(f, "query dispatch queue is full"),
            Self::ChannelClosed => write!(f, "query dispatch channel closed"),
            Self::Rejected(reason) => write!(f, "query rejected by dispatcher: {reason}"),
        }
    }
}

impl std::error::Error for DispatchError {}

#[derive(Debug)]
pub enum RequeryError {
    Dispatch {
        file: FileHash,
        source: DispatchError,
    },
}

impl std::fmt::Display for RequeryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dispatch { file, source } => write!(
                f,
                "failed to dispatch requery for {}: {source}",
                crate::logging::redact_hex(&file.to_hex_lower())
            ),
        }
    }
}

impl std::error::Error for RequeryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Dispatch { source, .. } => Some(source),
        }
    }
}

#[derive(Debug)]
pub enum RequeryServiceError {
    Requery(RequeryError),
    ChannelClosed,
}

impl std::fmt::Display for RequeryServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requery(source) => write!(f, "{source}"),
            Self::ChannelClosed => write!(f, "requery service channel closed"),
        }
    }
}

impl std::error::Error for RequeryServiceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Requery(source) => Some(source),
            Self::ChannelClosed => None,
        }
    }
}

impl From<RequeryError> for RequeryServiceError {
    fn from(value: RequeryError) -> Self {
        Self::Requery(value)
    }
}
