use thiserror::Error;

pub type FfboxResult<T> = Result<T, FfboxError>;

/// Error taxonomy surfaced to FUSE callers and the CLI.
///
/// Each variant maps to a POSIX errno via [`FfboxError::errno`]; conversion
/// to the FUSE reply happens at the driver boundary.
#[derive(Debug, Error)]
pub enum FfboxError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("already exists: {0}")]
    Exists(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FfboxError {
    /// POSIX errno for this error. Local I/O errors pass their OS errno
    /// through; everything without one degrades to EIO.
    pub fn errno(&self) -> i32 {
        match self {
            FfboxError::NotFound(_) => libc::ENOENT,
            FfboxError::AccessDenied(_) => libc::EACCES,
            FfboxError::InvalidArgument(_) => libc::EINVAL,
            FfboxError::Exists(_) => libc::EEXIST,
            FfboxError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            FfboxError::Other(_) => libc::EIO,
        }
    }
}
