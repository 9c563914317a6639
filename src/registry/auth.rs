//! Registry authentication handshake.
//!
//! [`authenticate`] probes `GET /v2/`. A successful answer means the registry
//! is anonymous. A `401` carries a `WWW-Authenticate` challenge of the form
//! `<scheme> realm="<realm>"[,key=value]*`; the client then requests the realm
//! with `Authorization: <scheme> base64(user:password)`.
//!
//! Some registries (Artifactory among them) advertise `Bearer` on `/v2/` but
//! only accept `Basic` at the realm. A realm answering `401` with a `Basic`
//! challenge gets exactly one retry using `Basic`.

use base64::prelude::*;
use chrono::{DateTime, Utc};
use http_auth::{parser::ChallengeParser, ChallengeRef};
use log::{debug, warn};
use reqwest::blocking::{Client, Response};
use reqwest::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use url::Url;

use crate::error::{AuthError, Error, Result};
use crate::registry::config::RegistryConfig;

/// Lifetime assumed when the token endpoint does not state one.
pub const DEFAULT_EXPIRES_IN: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    Bearer,
    Basic,
}

impl AuthScheme {
    fn from_challenge(scheme: &str) -> Option<Self> {
        if scheme.eq_ignore_ascii_case("bearer") {
            Some(AuthScheme::Bearer)
        } else if scheme.eq_ignore_ascii_case("basic") {
            Some(AuthScheme::Basic)
        } else {
            None
        }
    }
}

impl fmt::Display for AuthScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthScheme::Bearer => f.write_str("Bearer"),
            AuthScheme::Basic => f.write_str("Basic"),
        }
    }
}

/// Parsed `WWW-Authenticate` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub scheme: String,
    pub realm: String,
    pub other: HashMap<String, String>,
}

impl TryFrom<&ChallengeRef<'_>> for AuthChallenge {
    type Error = AuthError;

    fn try_from(value: &ChallengeRef<'_>) -> std::result::Result<Self, Self::Error> {
        let mut realm = None;
        let mut other = HashMap::new();
        for (key, param) in &value.params {
            if key.eq_ignore_ascii_case("realm") {
                realm = Some(param.to_unescaped());
            } else {
                other.insert(key.to_string(), param.to_unescaped());
            }
        }

        let realm = realm.filter(|r| !r.is_empty()).ok_or_else(|| {
            AuthError::MalformedChallenge(format!("{} challenge without realm", value.scheme))
        })?;
        Ok(Self {
            scheme: value.scheme.to_string(),
            realm,
            other,
        })
    }
}

impl AuthChallenge {
    /// Parses the first challenge of a `WWW-Authenticate` value.
    pub fn parse(header: &str) -> std::result::Result<Self, AuthError> {
        let challenge = ChallengeParser::new(header)
            .next()
            .ok_or_else(|| AuthError::MalformedChallenge(header.to_string()))?
            .map_err(|e| AuthError::MalformedChallenge(format!("{}: {}", header, e)))?;
        Self::try_from(&challenge)
    }

    fn from_response(response: &Response) -> std::result::Result<Self, AuthError> {
        let header = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .ok_or(AuthError::MissingChallenge)?;
        let header = header
            .to_str()
            .map_err(|_| AuthError::MalformedChallenge(format!("{:?}", header)))?;
        Self::parse(header)
    }
}

/// Credential attached to every registry request after a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub scheme: AuthScheme,
    pub token: String,
    pub issued_at: DateTime<Utc>,
    /// Lifetime in seconds, `None` for credentials that never expire.
    pub expires_in: Option<u64>,
}

impl AuthToken {
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_in {
            Some(expires_in) => (now - self.issued_at).num_seconds() > expires_in as i64,
            None => false,
        }
    }

    /// Value of the `Authorization` header.
    pub fn header_value(&self) -> String {
        format!("{} {}", self.scheme, self.token)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    issued_at: Option<String>,
}

impl TokenResponse {
    fn into_token(self) -> Option<AuthToken> {
        let token = self
            .token
            .filter(|t| !t.is_empty())
            .or(self.access_token.filter(|t| !t.is_empty()))?;
        Some(AuthToken {
            scheme: AuthScheme::Bearer,
            token,
            issued_at: self
                .issued_at
                .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(Utc::now),
            expires_in: Some(self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN)),
        })
    }
}

fn basic_credential(config: &RegistryConfig) -> String {
    BASE64_STANDARD.encode(format!("{}:{}", config.username(), config.password()))
}

/// Runs the handshake against `config.base_url()`.
///
/// Returns `None` when the registry does not ask for credentials.
pub fn authenticate(http: &Client, config: &RegistryConfig) -> Result<Option<AuthToken>> {
    let probe = config.endpoint("/v2/")?;
    debug!("Probing {}", probe);
    let response = http.get(probe.clone()).send()?;

    let status = response.status();
    if status.is_success() {
        debug!("{} does not require authentication", probe);
        return Ok(None);
    }
    if status != StatusCode::UNAUTHORIZED {
        return Err(Error::HttpStatus {
            status,
            url: probe.to_string(),
        });
    }

    let unable = |source: AuthError| Error::Auth {
        url: probe.to_string(),
        source,
    };
    let challenge = AuthChallenge::from_response(&response).map_err(unable)?;
    debug!(
        "Challenge from {}: scheme {}, realm {}",
        probe, challenge.scheme, challenge.realm
    );

    request_token(http, config, &challenge, &challenge.scheme, true)
        .map_err(|e| match e {
            Error::Auth { source, .. } => unable(source),
            other => other,
        })
        .map(Some)
}

/// Token endpoint for `challenge`. A `Basic` realm is often a display name
/// rather than a URL; the credentials then go to `/v2/` itself.
fn realm_url(config: &RegistryConfig, challenge: &AuthChallenge, scheme: AuthScheme) -> Result<Url> {
    let mut realm = match Url::parse(&challenge.realm) {
        Ok(realm) => realm,
        Err(_) if scheme == AuthScheme::Basic => return config.endpoint("/v2/"),
        Err(e) => return Err(e.into()),
    };
    {
        let mut query = realm.query_pairs_mut();
        if let Some(service) = challenge.other.get("service") {
            query.append_pair("service", service);
        }
        match challenge.other.get("scope") {
            Some(scope) => query.append_pair("scope", scope),
            None => query.append_pair(
                "scope",
                &format!("repository:{}:pull", config.repository()),
            ),
        };
    }
    Ok(realm)
}

fn request_token(
    http: &Client,
    config: &RegistryConfig,
    challenge: &AuthChallenge,
    scheme: &str,
    allow_downgrade: bool,
) -> Result<AuthToken> {
    let auth_error = |source: AuthError| Error::Auth {
        url: challenge.realm.clone(),
        source,
    };
    let scheme = AuthScheme::from_challenge(scheme)
        .ok_or_else(|| auth_error(AuthError::UnsupportedScheme(scheme.to_string())))?;

    let realm = realm_url(config, challenge, scheme)?;
    let credential = basic_credential(config);
    debug!("Requesting {} credentials from {}", scheme, challenge.realm);
    let response = http
        .get(realm)
        .header(AUTHORIZATION, format!("{} {}", scheme, credential))
        .send()?;

    let status = response.status();
    if status == StatusCode::UNAUTHORIZED {
        let retry = AuthChallenge::from_response(&response).ok();
        return match retry {
            Some(retry)
                if allow_downgrade
                    && AuthScheme::from_challenge(&retry.scheme) == Some(AuthScheme::Basic)
                    && scheme != AuthScheme::Basic =>
            {
                warn!(
                    "{} rejected {} credentials, retrying with Basic",
                    challenge.realm, scheme
                );
                request_token(http, config, challenge, &retry.scheme, false)
            }
            _ => Err(auth_error(AuthError::Rejected {
                realm: challenge.realm.clone(),
                scheme: scheme.to_string(),
            })),
        };
    }
    if !status.is_success() {
        return Err(auth_error(AuthError::TokenStatus(status)));
    }

    let body = response.bytes()?;
    let decoded = serde_json::from_slice::<TokenResponse>(&body)
        .ok()
        .and_then(TokenResponse::into_token);
    match (decoded, scheme) {
        (Some(token), _) => Ok(token),
        (None, AuthScheme::Basic) => {
            debug!("{} accepted Basic credentials without issuing a token", challenge.realm);
            Ok(AuthToken {
                scheme: AuthScheme::Basic,
                token: credential,
                issued_at: Utc::now(),
                expires_in: None,
            })
        }
        (None, AuthScheme::Bearer) => Err(auth_error(AuthError::TokenDecode(
            String::from_utf8_lossy(&body).chars().take(200).collect(),
        ))),
    }
}
