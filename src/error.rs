/* Pipeline-level error taxonomy. Module-local errors (archive, manifest,
 * bytecode, signing) are wrapped here with enough context to tell the caller
 * which stage failed and why.
 */

use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::apk::manifest::ManifestError;
use crate::apk::zip::ApkError;
use crate::dex::error::DexError;
use crate::sign::SignError;

pub type CloneResult<T> = Result<T, CloneError>;

#[derive(Debug)]
pub enum CloneError {
    /// Source container missing, unreadable or empty, or the configuration
    /// itself is unusable. Raised before any work starts.
    InvalidInput(String),
    /// The manifest could not be parsed or rewritten. Always fatal.
    Manifest(ManifestError),
    /// The primary bytecode file could not be produced. Secondary files fall
    /// back to their original bytes instead of raising this.
    PrimaryDex(DexError),
    Archive(ApkError),
    /// Scratch or output filesystem failure, carrying the failing path.
    Resource { path: PathBuf, source: io::Error },
    Signing(SignError),
}

impl CloneError {
    pub(crate) fn resource(path: impl Into<PathBuf>, source: io::Error) -> Self {
        CloneError::Resource { path: path.into(), source }
    }
}

impl fmt::Display for CloneError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloneError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            CloneError::Manifest(err) => write!(f, "manifest rewrite failed: {err}"),
            CloneError::PrimaryDex(err) => write!(f, "primary bytecode unusable: {err}"),
            CloneError::Archive(err) => write!(f, "container error: {err}"),
            CloneError::Resource { path, source } => {
                write!(f, "resource error at {}: {}", path.display(), source)
            }
            CloneError::Signing(err) => write!(f, "signing failed: {err}"),
        }
    }
}

impl std::error::Error for CloneError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CloneError::Manifest(err) => Some(err),
            CloneError::PrimaryDex(err) => Some(err),
            CloneError::Archive(err) => Some(err),
            CloneError::Resource { source, .. } => Some(source),
            CloneError::Signing(err) => Some(err),
            CloneError::InvalidInput(_) => None,
        }
    }
}

impl From<ManifestError> for CloneError {
    fn from(err: ManifestError) -> Self {
        CloneError::Manifest(err)
    }
}

impl From<ApkError> for CloneError {
    fn from(err: ApkError) -> Self {
        CloneError::Archive(err)
    }
}

impl From<SignError> for CloneError {
    fn from(err: SignError) -> Self {
        CloneError::Signing(err)
    }
}
