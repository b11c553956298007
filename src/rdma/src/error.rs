//! Error taxonomy shared by every module in this crate.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transient I/O condition: {0}")]
    Transient(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("resource error: {0}")]
    Resource(String),
    #[error("liveness error: {0}")]
    Liveness(String),
    #[error("internal invariant violated: {0}")]
    Bug(String),
}

impl Error {
    pub fn is_liveness(&self) -> bool {
        matches!(self, Error::Liveness(_))
    }
}
