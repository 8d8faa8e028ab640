use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed event payload; rejected, never retried
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),
    /// Referenced content no longer exists
    #[error("unknown target: {kind} {id}")]
    UnknownTarget { kind: &'static str, id: i64 },
    /// Optimistic lock lost after all retries
    #[error("write conflict on {0}")]
    Conflict(String),
    #[error("deadline exceeded: {job} partition {partition}")]
    DeadlineExceeded { job: String, partition: u32 },
    #[error("dependency missing: {0}")]
    DependencyMissing(String),
    #[error("unknown question: {0}")]
    UnknownQuestion(i64),
    #[error("question {question_id} does not belong to quiz {quiz_id}")]
    QuestionNotInQuiz { question_id: i64, quiz_id: i64 },
    #[error("invalid answer shape: {0}")]
    InvalidAnswerShape(String),
    #[error("background task failed: {0}")]
    Task(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl From<tokio::task::JoinError> for CoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        CoreError::Task(err.to_string())
    }
}

impl CoreError {
    /// Errors an inbound handler hands back to its caller; the rest are logged and absorbed
    pub fn is_caller_facing(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidMetadata(_)
                | CoreError::Conflict(_)
                | CoreError::UnknownQuestion(_)
                | CoreError::QuestionNotInQuiz { .. }
                | CoreError::InvalidAnswerShape(_)
        )
    }
}
