use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("malformed rule: {0}")]
    MalformedRule(String),

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("invalid daemon config: {0}")]
    InvalidConfig(String),

    #[error("rule file parsed with loss ({parsed} of {total} lines); refusing destructive edit")]
    UntrustworthySnapshot { parsed: usize, total: usize },

    #[error("rule file transaction failed: {0}")]
    TransactionFailure(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("db error: {0}")]
    Db(String),

    #[error("io error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn code(&self) -> &'static str {
        match self {
            Error::MalformedRule(_) => "malformed_rule",
            Error::MalformedRequest(_) => "malformed_request",
            Error::InvalidConfig(_) => "invalid_config",
            Error::UntrustworthySnapshot { .. } => "untrustworthy_snapshot",
            Error::TransactionFailure(_) => "transaction_failure",
            Error::Conflict(_) => "conflict",
            Error::Unavailable(_) => "unavailable",
            Error::Db(_) => "db",
            Error::Io(_) => "io",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
