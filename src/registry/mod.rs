//! Registry HTTP API v2 client.
//!
//! - [`auth`] negotiates Bearer or Basic credentials from a `WWW-Authenticate`
//!   challenge.
//! - [`RegistryClient`] lists tags, fetches manifests and streams blobs,
//!   refreshing credentials before each call.
//! - [`RegistryConfig`] and [`ImageName`] carry endpoint, transport and
//!   repository settings.

pub mod auth;
pub mod client;
pub mod config;
pub mod types;

pub use auth::{AuthChallenge, AuthScheme, AuthToken};
pub use client::RegistryClient;
pub use config::{ImageName, RegistryConfig, DEFAULT_INDEX, DEFAULT_TAG};
pub use types::{Descriptor, Digest, Manifest, Tags};
