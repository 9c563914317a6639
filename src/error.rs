//! Error types shared by the registry client and the layer model.
//!
//! Everything fallible in the library returns [`Result<T>`], an alias for
//! `Result<T, Error>`. The variants follow the failure classes of a pull:
//!
//! - **Transport**: connection, DNS or TLS failures ([`Error::Transport`]).
//! - **HTTP status**: any non-200 answer from the registry ([`Error::HttpStatus`]).
//! - **Authentication**: challenge handling ([`Error::Auth`], see [`AuthError`]).
//! - **Parsing**: JSON, tar/gzip and bundle layout problems ([`Error::Parse`],
//!   [`Error::Json`], [`Error::EmptyManifest`], [`Error::MissingEntry`]).
//! - **Structure**: layer archives that do not line up with the image history
//!   ([`Error::StructuralMismatch`]).
//! - **Lookup**: path misses in a [`crate::tree::FileTree`] or during extraction
//!   ([`Error::NotFound`]). These are the only recoverable errors.
//!
//! Nothing in the crate retries; errors go straight back to the caller.

use std::io;

use thiserror::Error;

use crate::tree::TreeError;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("HTTP error: {status} from {url}")]
    HttpStatus {
        status: reqwest::StatusCode,
        url: String,
    },

    #[error("unable to authenticate with {url}: {source}")]
    Auth {
        url: String,
        #[source]
        source: AuthError,
    },

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to parse image: {0}")]
    Parse(String),

    #[error("manifest.json contains no image entries")]
    EmptyManifest,

    #[error("bundle is missing {0}")]
    MissingEntry(String),

    #[error(
        "layer mismatch: {history} non-empty history entries, {manifest} manifest layers, {archives} layer archives"
    )]
    StructuralMismatch {
        history: usize,
        manifest: usize,
        archives: usize,
    },

    #[error("path not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// True for lookup misses the caller may want to recover from.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_) | Error::Tree(TreeError::NotFound(_))
        )
    }
}

/// Failures of the `WWW-Authenticate` handshake.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("WWW-Authenticate header is missing")]
    MissingChallenge,

    #[error("invalid WWW-Authenticate header: {0:?}")]
    MalformedChallenge(String),

    #[error("scheme {0} is not supported")]
    UnsupportedScheme(String),

    #[error("credentials rejected by {realm} (scheme {scheme})")]
    Rejected { realm: String, scheme: String },

    #[error("token endpoint returned {0}")]
    TokenStatus(reqwest::StatusCode),

    #[error("failed to decode token response: {0}")]
    TokenDecode(String),
}
