use thiserror::Error;

/// Common error type shared by the canvas crates
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("Invalid order key: {0:?}")]
    InvalidOrder(String),

    #[error("Order keys are not ascending: {lower:?} >= {upper:?}")]
    NotAscending { lower: String, upper: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
