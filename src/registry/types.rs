//! Wire types of the registry HTTP API v2.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

pub const MEDIA_TYPE_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_MANIFEST_LIST_V2: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Answer of `GET /v2/<repo>/tags/list`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tags {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Content address in `algorithm:hex` form.
///
/// Only `[a-z0-9+._-]` algorithms and `[a-zA-Z0-9=_-]` encoded parts are
/// accepted, so the hex part is always safe to use as a file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    pub fn parse(digest: impl Into<String>) -> Result<Self> {
        let digest = digest.into();
        let valid = match digest.split_once(':') {
            Some((algorithm, hex)) => {
                !algorithm.is_empty()
                    && !hex.is_empty()
                    && algorithm.bytes().all(|b| {
                        b.is_ascii_lowercase() || b.is_ascii_digit() || b"+._-".contains(&b)
                    })
                    && hex
                        .bytes()
                        .all(|b| b.is_ascii_alphanumeric() || b"=_-".contains(&b))
            }
            None => false,
        };
        if !valid {
            return Err(Error::Parse(format!("invalid digest: {:?}", digest)));
        }
        Ok(Self(digest))
    }

    pub fn algorithm(&self) -> &str {
        self.0.split_once(':').map(|(algorithm, _)| algorithm).unwrap_or("")
    }

    pub fn hex(&self) -> &str {
        self.0.split_once(':').map(|(_, hex)| hex).unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Digest {
    type Error = Error;

    fn try_from(digest: String) -> Result<Self> {
        Self::parse(digest)
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to a blob from a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: Digest,
    #[serde(default)]
    pub size: u64,
}

impl Descriptor {
    pub fn is_json(&self) -> bool {
        self.media_type.contains("json")
    }

    /// Local file name the blob is stored under: `<hex>.json` or `<hex>.tar`.
    pub fn file_name(&self) -> String {
        let extension = if self.is_json() { "json" } else { "tar" };
        format!("{}.{}", self.digest.hex(), extension)
    }
}

/// Image manifest, schema version 2.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

impl Manifest {
    /// Sum of the declared sizes of all layers.
    pub fn layers_size(&self) -> u64 {
        self.layers.iter().map(|l| l.size).sum()
    }
}

pub fn is_manifest_list(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_MANIFEST_LIST_V2 || media_type == MEDIA_TYPE_OCI_INDEX
}
