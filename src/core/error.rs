use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed startup packet")]
    MalformedStartup,
    #[error("authentication failed")]
    AuthenticationFailed,
}
