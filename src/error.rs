use std::io;

/// Central error type for the vitals web engine.
///
/// Protocol-level failures (bad requests, missing files, denied
/// access) are not errors: they become HTTP response codes and flow
/// through the normal send path. This type covers the driver and
/// bootstrap failures that have no client to answer to.
#[derive(Debug, thiserror::Error)]
pub enum WebError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid listen address '{0}'")]
    Address(String),

    #[error("client pool is full")]
    PoolFull,

    #[error("compression failed: {0}")]
    Compression(String),

    #[error("{0}")]
    Other(String),
}

pub type WebResult<T> = Result<T, WebError>;
