use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Stage graph cycle detected")]
    CycleDetected,

    #[error("Stage {stage} depends on unknown stage {dependency}")]
    UnknownDependency { stage: String, dependency: String },

    #[error("Duplicate stage definition: {0}")]
    DuplicateStage(String),

    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    #[error("No executor registered for stage {0}")]
    MissingExecutor(String),

    #[error("Unknown rate limiter key {key} declared by stage {stage}")]
    UnknownLimiter { stage: String, key: String },

    #[error("Invalid state transition for {record_id}/{stage}: {from} -> {to}")]
    InvalidTransition {
        record_id: String,
        stage: String,
        from: String,
        to: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn parse<E: std::fmt::Display>(e: E) -> Self {
        Self::Parse(e.to_string())
    }

    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }
}
