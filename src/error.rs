use p11_sys::CK_RV;
use thiserror::Error;

pub type P11Result<T> = Result<T, P11Error>;

/// Errors surfaced by the device layer.
///
/// Lookup misses on read paths are returned as `Ok(None)` rather than as
/// errors; `NotFound`/`Ambiguous` only appear where a write or a protocol step
/// required the object to exist.
#[derive(Error, Debug)]
pub enum P11Error {
    /// Transport-level fault, typically a failure to open a session. Callers
    /// may retry once the token is reachable again.
    #[error("token offline: {0}")]
    Offline(String),

    #[error("no such object: {0}")]
    NotFound(String),

    #[error("ambiguous lookup: {0}")]
    Ambiguous(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Non-OK return value from the Cryptoki library.
    #[error("{func} failed: 0x{rv:08x}")]
    Cryptoki { func: &'static str, rv: CK_RV },

    #[error("{0} not available on library")]
    FunctionUnavailable(&'static str),

    #[error("encoding failure: {0}")]
    Encoding(String),

    #[error("error loading the library: {0}")]
    LibLoading(#[from] libloading::Error),

    #[error(transparent)]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error(transparent)]
    TryFromInt(#[from] std::num::TryFromIntError),
}

impl P11Error {
    pub(crate) const fn cryptoki(func: &'static str, rv: CK_RV) -> Self {
        Self::Cryptoki { func, rv }
    }

    /// Return value of the underlying Cryptoki call, if this error carries one.
    pub const fn rv(&self) -> Option<CK_RV> {
        match self {
            Self::Cryptoki { rv, .. } => Some(*rv),
            _ => None,
        }
    }
}
