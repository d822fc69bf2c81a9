
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LatticeError {
    #[error("Schema error: {0}")]
    Schema(String),
    #[error("Duplicate model: '{0}' is already registered")]
    DuplicateModel(String),
    #[error("Parse error: {message}")]
    Parse { message: String, line: Option<usize>, col: Option<usize> },
    #[error("Inverse maintenance failed: {0}")]
    InverseMaintenance(String),
    #[error("Computation of '{field}' failed: {message}")]
    Computation { field: String, message: String },
    #[error("Record {0} has been destroyed")]
    UseAfterDestroy(u64),
    #[error("Record {0} does not exist")]
    UnknownRecord(u64),
    #[error("Illegal mutation: {0}")]
    IllegalMutation(String),
    #[error("Value mismatch: field '{field}' expects {expected}, got {got}")]
    ValueMismatch { field: String, expected: String, got: String },
    #[error("Snapshot error: {0}")]
    Snapshot(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Internal invariant violated: {0}")]
    Invariant(String),
    #[error("Lock poisoned: {0}")]
    Lock(String),
}

pub type Result<T> = std::result::Result<T, LatticeError>;
