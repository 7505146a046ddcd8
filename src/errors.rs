use crate::semantic::SearchError;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("question not found")]
    NotFound,

    #[error("missing or invalid bearer token")]
    Unauthorized,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unexpected error: {0:?}")]
    Other(#[from] anyhow::Error),
}

impl From<SearchError> for AppError {
    fn from(err: SearchError) -> Self {
        match err {
            SearchError::NotFound(_) => AppError::NotFound,
            other => AppError::Other(other.into()),
        }
    }
}
