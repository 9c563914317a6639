use log::{debug, info, trace};
use reqwest::blocking::{Client, Response};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Proxy, StatusCode};
use std::fs::File;
use std::io;
use std::path::Path;
use url::Url;

use crate::error::{Error, Result};
use crate::notifier::Notifier;
use crate::registry::auth::{self, AuthToken};
use crate::registry::config::RegistryConfig;
use crate::registry::types::{is_manifest_list, Descriptor, Manifest, Tags, MEDIA_TYPE_MANIFEST_V2};

#[derive(Debug, Clone, PartialEq)]
enum AuthState {
    Unauthenticated,
    Anonymous,
    Authenticated(AuthToken),
}

/// Blocking client for one repository on one registry.
///
/// Every operation checks the credential first and silently runs the
/// handshake again when it is missing or expired. Nothing is retried.
pub struct RegistryClient {
    config: RegistryConfig,
    http: Client,
    auth: AuthState,
}

impl RegistryClient {
    pub fn new(config: RegistryConfig) -> Result<Self> {
        let mut builder = Client::builder()
            .user_agent(config.user_agent())
            .danger_accept_invalid_certs(config.insecure())
            .connect_timeout(config.connect_timeout())
            .timeout(config.timeout());

        if let Some(proxy) = config.proxy() {
            debug!("Routing registry traffic through {}", proxy);
            builder = builder.proxy(Proxy::all(proxy)?);
        } else if !config.system_proxy() {
            builder = builder.no_proxy();
        }

        Ok(Self {
            http: builder.build()?,
            config,
            auth: AuthState::Unauthenticated,
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Current bearer or basic credential, `None` before the handshake or for
    /// anonymous registries.
    pub fn token(&self) -> Option<&AuthToken> {
        match &self.auth {
            AuthState::Authenticated(token) => Some(token),
            _ => None,
        }
    }

    fn ensure_authenticated(&mut self) -> Result<()> {
        let stale = match &self.auth {
            AuthState::Unauthenticated => true,
            AuthState::Anonymous => false,
            AuthState::Authenticated(token) => {
                let expired = token.is_expired();
                if expired {
                    info!("Registry token expired, authenticating again");
                }
                expired
            }
        };
        if stale {
            self.auth = match auth::authenticate(&self.http, &self.config)? {
                Some(token) => AuthState::Authenticated(token),
                None => AuthState::Anonymous,
            };
        }
        Ok(())
    }

    fn get(&mut self, url: Url, accept: Option<&str>) -> Result<Response> {
        self.ensure_authenticated()?;

        trace!("GET {}", url);
        let mut request = self.http.get(url.clone());
        if let AuthState::Authenticated(token) = &self.auth {
            request = request.header(AUTHORIZATION, token.header_value());
        }
        if let Some(accept) = accept {
            request = request.header(ACCEPT, accept);
        }

        let response = request.send()?;
        if response.status() != StatusCode::OK {
            return Err(Error::HttpStatus {
                status: response.status(),
                url: url.to_string(),
            });
        }
        Ok(response)
    }

    pub fn list_tags(&mut self, repository: &str) -> Result<Tags> {
        let url = self
            .config
            .endpoint(&format!("/v2/{}/tags/list", repository))?;
        debug!("Downloading tags from {}", url);

        let tags: Tags = serde_json::from_slice(&self.get(url, None)?.bytes()?)?;
        Ok(tags)
    }

    /// Fetches the schema-2 image manifest for `reference` (tag or digest).
    pub fn get_manifest(&mut self, repository: &str, reference: &str) -> Result<Manifest> {
        let url = self
            .config
            .endpoint(&format!("/v2/{}/manifests/{}", repository, reference))?;
        debug!("Downloading manifest {}:{} from {}", repository, reference, url);

        let response = self.get(url, Some(MEDIA_TYPE_MANIFEST_V2))?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body: serde_json::Value = serde_json::from_slice(&response.bytes()?)?;

        let media_type = body["mediaType"].as_str().map(str::to_string).or(content_type);
        if let Some(media_type) = media_type.filter(|m| is_manifest_list(m)) {
            return Err(Error::Parse(format!(
                "{}:{} resolved to a manifest list ({}), an image manifest is required",
                repository, reference, media_type
            )));
        }

        Ok(serde_json::from_value(body)?)
    }

    /// Streams one blob into `dir` and returns the file name it was stored
    /// under (`<hex>.json` or `<hex>.tar`).
    pub fn fetch_blob(
        &mut self,
        repository: &str,
        descriptor: &Descriptor,
        dir: &Path,
        notifier: &Notifier,
    ) -> Result<String> {
        let url = self
            .config
            .endpoint(&format!("/v2/{}/blobs/{}", repository, descriptor.digest))?;
        let file_name = descriptor.file_name();
        debug!("Downloading blob {} to {}", descriptor.digest, file_name);

        let mut response = self.get(url, Some(&descriptor.media_type))?;
        let mut file = File::create(dir.join(&file_name))?;

        let written = if descriptor.is_json() {
            io::copy(&mut response, &mut file)?
        } else {
            let message = format!("Layer {}", short_digest(descriptor.digest.hex()));
            match notifier.create_progress_bar(descriptor.size, &message) {
                Some(progress_bar) => {
                    let written = io::copy(&mut progress_bar.wrap_read(response), &mut file)?;
                    progress_bar.finish_and_clear();
                    written
                }
                None => io::copy(&mut response, &mut file)?,
            }
        };

        if descriptor.size > 0 && written != descriptor.size {
            debug!(
                "Blob {} declared {} bytes, received {}",
                descriptor.digest, descriptor.size, written
            );
        }
        Ok(file_name)
    }
}

fn short_digest(hex: &str) -> &str {
    hex.get(..12).unwrap_or(hex)
}
