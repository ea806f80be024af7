use thiserror::Error;

/// CLI-level error categories mapped to exit codes.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Validation(#[from] ferromerge_core::ValidationError),

    #[error(transparent)]
    Config(#[from] ferromerge_core::ConfigError),

    #[error(transparent)]
    Supervisor(#[from] ferromerge_core::SupervisorError),

    #[error(transparent)]
    Warehouse(#[from] ferromerge_core::WarehouseError),

    #[error("command error: {0}")]
    Command(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Validation(_) => 2,
            Self::Config(_) => 2,
            Self::Supervisor(_) => 2,
            Self::Command(_) => 2,
            Self::Warehouse(_) => 3,
            Self::Serialization(_) => 4,
            Self::Yaml(_) => 4,
            Self::Io(_) => 10,
        }
    }
}
