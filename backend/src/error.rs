use thiserror::Error;

#[derive(Error, Debug)]
pub enum AssignError {
    /// A pool cannot supply its quota on a freshly read ledger.
    #[error("insufficient capacity in pool '{pool}': {available} available, {required} required")]
    InsufficientCapacity {
        pool: String,
        available: usize,
        required: usize,
    },

    /// A concurrent writer won the race; safe to retry.
    #[error("contention: {0}")]
    Contention(String),

    #[error("assignment failed after {attempts} attempt(s): {last_error}")]
    AssignmentFailed { attempts: u32, last_error: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid participant id: {0:?}")]
    InvalidParticipant(String),

    #[error("store error: {0:#}")]
    Store(#[source] anyhow::Error),
}

impl AssignError {
    /// Whether the retry loop may re-attempt after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AssignError::Contention(_) | AssignError::Store(_))
    }

    /// Text safe to show a participant.
    pub fn user_message(&self) -> &'static str {
        match self {
            AssignError::InsufficientCapacity { .. } => {
                "The study is full. Thank you for your interest."
            }
            _ => "We could not prepare your session. Please try again in a moment.",
        }
    }
}

impl From<anyhow::Error> for AssignError {
    fn from(e: anyhow::Error) -> Self {
        AssignError::Store(e)
    }
}
