use crate::tree::NodeRef;
use crate::types::DataType;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueryError {
    /// Any failure while turning a tree into a plan. Carries the tree that
    /// was being compiled when one is available.
    #[error("Compilation error: {message}")]
    Compilation {
        message: String,
        tree: Option<NodeRef>,
    },

    #[error("Cannot read values of type {0}")]
    TypeIncompatible(DataType),

    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("Mapping not found: {0}")]
    MappingNotFound(String),

    #[error("Column not found: {0}")]
    ColumnNotFound(String),

    #[error("Missing argument: {0}")]
    MissingArgument(String),

    #[error("Unsupported expression: {0}")]
    Unsupported(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Timed out acquiring cache lock '{0}'")]
    LockTimeout(String),

    #[error("Query cancelled")]
    Cancelled,

    #[error("Arrow error: {0}")]
    ArrowError(#[from] arrow::error::ArrowError),

    #[error("Config error: {0}")]
    ConfigError(String),
}

impl QueryError {
    pub fn compilation(message: impl Into<String>, tree: Option<NodeRef>) -> Self {
        QueryError::Compilation {
            message: message.into(),
            tree,
        }
    }

    /// Wraps any error into a compilation error for `tree`, keeping an
    /// existing compilation error (and its tree) as is.
    pub fn into_compilation(self, tree: &NodeRef) -> Self {
        match self {
            QueryError::Compilation { message, tree: None } => QueryError::Compilation {
                message,
                tree: Some(tree.clone()),
            },
            err @ QueryError::Compilation { .. } => err,
            other => QueryError::Compilation {
                message: other.to_string(),
                tree: Some(tree.clone()),
            },
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, QueryError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, QueryError>;
