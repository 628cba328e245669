//! Error types for the fragmenter engine.
//!
//! Every failure surfaced by the public API carries an [`ErrorCode`] from a
//! closed taxonomy. Platform errors (filesystem, transport, archive codec)
//! are classified into the taxonomy exactly once, at the boundary where they
//! enter the engine.

use std::io;
use std::path::Path;

/// Result type for fragmenter operations.
pub type FragmenterResult<T> = Result<T, FragmenterError>;

/// Closed set of failure codes surfaced by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    PermissionsError,
    ResourcesBusy,
    NoSpaceOnDevice,
    MaxModuleRetries,
    FileNotFound,
    DirectoryNotEmpty,
    NotADirectory,
    ModuleJsonInvalid,
    ModuleCrcMismatch,
    UserAborted,
    NetworkError,
    CorruptedZipFile,
    InvalidOptions,
    InvalidParameters,
    InvalidDistributionManifest,
    DownloadStreamClosed,
    Unknown,
}

impl ErrorCode {
    /// Codes that abort an operation without retry.
    ///
    /// These short-circuit the retry loops in the file downloader, the
    /// module downloader, and the install orchestrator.
    pub fn is_unrecoverable(self) -> bool {
        matches!(
            self,
            Self::PermissionsError
                | Self::NoSpaceOnDevice
                | Self::MaxModuleRetries
                | Self::FileNotFound
                | Self::DirectoryNotEmpty
                | Self::NotADirectory
        )
    }

    /// Codes worth retrying with exponential backoff.
    ///
    /// Cancellation is neither recoverable nor unrecoverable; retry loops
    /// treat [`ErrorCode::UserAborted`] as an immediate stop.
    pub fn is_recoverable(self) -> bool {
        !self.is_unrecoverable() && self != Self::UserAborted
    }
}

/// A typed engine error: a taxonomy code plus human-readable detail.
#[derive(Debug, Clone, thiserror::Error)]
#[error("FragmenterError({code:?}): {detail}")]
pub struct FragmenterError {
    pub code: ErrorCode,
    pub detail: String,
}

impl FragmenterError {
    pub fn new(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }

    /// The distinguished cancellation error.
    pub fn user_aborted() -> Self {
        Self::new(ErrorCode::UserAborted, "operation cancelled by user")
    }

    pub fn max_module_retries(module: &str) -> Self {
        Self::new(
            ErrorCode::MaxModuleRetries,
            format!("retry limit exhausted for '{module}'"),
        )
    }

    /// Classify a filesystem error by platform error kind.
    pub fn from_io(err: &io::Error, path: &Path) -> Self {
        let code = match err.kind() {
            io::ErrorKind::PermissionDenied => ErrorCode::PermissionsError,
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::StorageFull => ErrorCode::NoSpaceOnDevice,
            io::ErrorKind::DirectoryNotEmpty => ErrorCode::DirectoryNotEmpty,
            io::ErrorKind::NotADirectory => ErrorCode::NotADirectory,
            io::ErrorKind::ResourceBusy => ErrorCode::ResourcesBusy,
            _ => ErrorCode::Unknown,
        };
        Self::new(code, format!("{}: {err}", path.display()))
    }

    /// Classify a transport error.
    ///
    /// Connection-level failures (refused, reset, DNS, timeout, bad status)
    /// map to `NetworkError`; a body that ends or decodes badly mid-stream
    /// maps to `DownloadStreamClosed`.
    pub fn from_transport(err: &reqwest::Error) -> Self {
        let code = if err.is_body() || err.is_decode() {
            ErrorCode::DownloadStreamClosed
        } else if err.is_connect() || err.is_timeout() || err.is_request() || err.is_status() {
            ErrorCode::NetworkError
        } else {
            ErrorCode::Unknown
        };
        Self::new(code, err.to_string())
    }

    /// Classify an archive codec error.
    ///
    /// Truncated or malformed archives (missing end-of-central-directory,
    /// unexpected EOF) become `CorruptedZipFile`, which is recoverable by
    /// re-downloading the fragment.
    pub fn from_zip(err: zip::result::ZipError, archive: &Path) -> Self {
        use zip::result::ZipError;
        match err {
            ZipError::Io(io_err) if io_err.kind() == io::ErrorKind::UnexpectedEof => Self::new(
                ErrorCode::CorruptedZipFile,
                format!("{}: unexpected end of archive", archive.display()),
            ),
            ZipError::Io(io_err) => Self::from_io(&io_err, archive),
            ZipError::InvalidArchive(msg) => Self::new(
                ErrorCode::CorruptedZipFile,
                format!("{}: {msg}", archive.display()),
            ),
            ZipError::UnsupportedArchive(msg) => Self::new(
                ErrorCode::CorruptedZipFile,
                format!("{}: unsupported archive: {msg}", archive.display()),
            ),
            other => Self::new(
                ErrorCode::CorruptedZipFile,
                format!("{}: {other}", archive.display()),
            ),
        }
    }
}
