use std::fmt;

use crate::format;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error raised from opening or reading a VHD image.
pub struct Error(Box<ErrorInner>);

/// The category of an [`Error`] or a [`format::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// No footer with a valid cookie at any candidate location.
    InvalidHeader,
    /// The footer declares a disk type other than fixed, dynamic or differencing.
    UnsupportedFormat,
    /// The dynamic disk header or the allocation table is malformed.
    BadStructure,
    /// The requested logical range exceeds the disk size.
    OutOfRange,
    /// Buffers for the allocation table window or the sector bitmap cannot be allocated.
    AllocationFailure,
    /// The underlying reader failed.
    Io,
}

#[derive(Debug)]
pub(crate) enum ErrorInner {
    Format(String, format::Error),
    OutOfRange { offset: u64, len: u64, size: u64 },
    AllocationFailure { bytes: u64 },
    Validation(&'static str),
    BlockIndex { index: u64, entries: u32 },
    Io(std::io::Error),
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0 {
            ErrorInner::Format(msg, err) => write!(f, "{msg}: {err}"),
            ErrorInner::OutOfRange { offset, len, size } => write!(
                f,
                "read of {len} bytes at offset {offset} exceeds disk size {size}"
            ),
            ErrorInner::AllocationFailure { bytes } => {
                write!(f, "failed to allocate {bytes} bytes")
            }
            ErrorInner::Validation(msg) => write!(f, "malformed image: {msg}"),
            ErrorInner::BlockIndex { index, entries } => write!(
                f,
                "block {index} is out of the allocation table with {entries} entries"
            ),
            ErrorInner::Io(err) => write!(f, "input/output error: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &*self.0 {
            ErrorInner::Format(_, err) => Some(err),
            ErrorInner::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl Error {
    /// Get the category of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match &*self.0 {
            ErrorInner::Format(_, err) => err.kind(),
            ErrorInner::Validation(_) | ErrorInner::BlockIndex { .. } => ErrorKind::BadStructure,
            ErrorInner::OutOfRange { .. } => ErrorKind::OutOfRange,
            ErrorInner::AllocationFailure { .. } => ErrorKind::AllocationFailure,
            ErrorInner::Io(_) => ErrorKind::Io,
        }
    }
}

impl From<ErrorInner> for Error {
    #[cold]
    fn from(err: ErrorInner) -> Self {
        Self(Box::new(err))
    }
}

impl From<std::io::Error> for Error {
    #[cold]
    fn from(err: std::io::Error) -> Self {
        Self(Box::new(ErrorInner::Io(err)))
    }
}

// Needed for `Read` impl.
impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        let kind = match err.kind() {
            ErrorKind::OutOfRange => std::io::ErrorKind::UnexpectedEof,
            ErrorKind::AllocationFailure => std::io::ErrorKind::OutOfMemory,
            _ => std::io::ErrorKind::InvalidData,
        };
        std::io::Error::new(kind, err)
    }
}

pub(crate) trait ResultExt<T> {
    fn context(self, msg: impl fmt::Display) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T, format::Error> {
    #[inline]
    fn context(self, msg: impl fmt::Display) -> Result<T> {
        match self {
            Ok(v) => Ok(v),
            Err(err) => Err(ErrorInner::Format(msg.to_string(), err).into()),
        }
    }
}

pub(crate) trait OptionExt<T> {
    fn context(self, msg: &'static str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    #[inline]
    fn context(self, msg: &'static str) -> Result<T> {
        match self {
            Some(v) => Ok(v),
            None => Err(ErrorInner::Validation(msg).into()),
        }
    }
}

pub(crate) trait BoolExt {
    fn or_context(self, msg: &'static str) -> Result<()>;
}

impl BoolExt for bool {
    #[inline]
    fn or_context(self, msg: &'static str) -> Result<()> {
        if self {
            Ok(())
        } else {
            Err(ErrorInner::Validation(msg).into())
        }
    }
}

/// Create an empty `Vec` with capacity for exactly `len` elements, without
/// aborting the process on failure.
pub(crate) fn try_with_capacity<T>(len: usize) -> Result<Vec<T>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len).map_err(|_| ErrorInner::AllocationFailure {
        bytes: (len as u64).saturating_mul(size_of::<T>() as u64),
    })?;
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_failure() {
        let err = try_with_capacity::<u64>(usize::MAX).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AllocationFailure);
        assert_eq!(
            err.to_string(),
            format!("failed to allocate {} bytes", u64::MAX)
        );
        let err = std::io::Error::from(err);
        assert_eq!(err.kind(), std::io::ErrorKind::OutOfMemory);

        let v = try_with_capacity::<u32>(100).unwrap();
        assert!(v.is_empty());
        assert!(v.capacity() >= 100);
    }

    #[test]
    fn io_conversion() {
        let err = Error::from(ErrorInner::OutOfRange {
            offset: 10,
            len: 2,
            size: 11,
        });
        assert_eq!(
            std::io::Error::from(err).kind(),
            std::io::ErrorKind::UnexpectedEof
        );
        let err = Error::from(ErrorInner::Validation("bad"));
        assert_eq!(
            std::io::Error::from(err).kind(),
            std::io::ErrorKind::InvalidData
        );
    }
}
