use thiserror::Error;

/// Taxonomy from the error handling design: configuration-fatal errors abort
/// the affected process; everything else is either best-effort (swallowed at
/// the call site) or carried in a [`crate::report::Report`] instead of here.
#[derive(Error, Debug)]
pub enum SwarmError {
    #[error("settings file is missing the [OVERMIND] section")]
    MissingOvermindSection,

    #[error("failed to read hatchling config file {path}: {source}")]
    HatchlingConfigFile {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to parse settings file {path}: {source}")]
    SettingsParse {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("colony received no hatchlings from the overmind")]
    NoHatchlingsAssigned,

    #[error("overmind returned {got} hatchling configs, expected {expected}")]
    HatchlingConfigCountMismatch { got: usize, expected: usize },

    #[error("bus call {message_type} timed out or was not answered")]
    BusCallFailed { message_type: String },

    #[error("invalid bus address: {0}")]
    InvalidAddress(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type SwarmResult<T> = Result<T, SwarmError>;
