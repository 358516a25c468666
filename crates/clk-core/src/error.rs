use crate::heal::HealExhausted;

/// Errors from parsing and normalizing planner output.
#[derive(thiserror::Error, Debug)]
pub enum PlanError {
    #[error("plan is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("malformed plan object: {0}")]
    MalformedPlan(#[source] serde_json::Error),

    #[error("malformed command object: {0}")]
    MalformedCommand(#[source] serde_json::Error),

    #[error("malformed command array: {0}")]
    MalformedCommandArray(#[source] serde_json::Error),

    #[error("plan JSON did not match any accepted shape")]
    UnrecognizedShape,
}

/// Closed error surface returned by the execution engine. Every variant that
/// concerns a specific plan step carries its command index.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("command {index} rejected: {reason}")]
    Rejected { index: usize, reason: String },

    #[error("command {index} ({service} {op}) failed [{code}]: {summary}")]
    CommandFailed {
        index: usize,
        service: String,
        op: String,
        code: String,
        summary: String,
    },

    #[error("command {index} has unresolved placeholders: {tokens:?}")]
    UnresolvedPlaceholders { index: usize, tokens: Vec<String> },

    #[error("command {index}: {source}")]
    Budget {
        index: usize,
        #[source]
        source: HealExhausted,
    },

    #[error("run cancelled at command {index}")]
    Cancelled { index: usize },

    #[error("post-deploy verification failed: {0}")]
    PostDeploy(String),

    #[error("actuator error at command {index}: {message}")]
    Actuator { index: usize, message: String },
}

impl EngineError {
    /// Index of the command the error is anchored to, when there is one.
    pub fn command_index(&self) -> Option<usize> {
        match self {
            Self::Rejected { index, .. }
            | Self::CommandFailed { index, .. }
            | Self::UnresolvedPlaceholders { index, .. }
            | Self::Budget { index, .. }
            | Self::Cancelled { index }
            | Self::Actuator { index, .. } => Some(*index),
            Self::PostDeploy(_) => None,
        }
    }
}
