//! Registry client and pull assembly against an in-process fake registry.

use crate::integration::common::bundle::{config_json, gzip, LayerBuilder};
use crate::integration::common::digest;
use crate::integration::common::fake_registry::{FakeRegistry, Reply};
use anyhow::Result;
use layerpeek::registry::auth::AuthScheme;
use layerpeek::registry::types::{Descriptor, Digest, MEDIA_TYPE_MANIFEST_LIST_V2};
use layerpeek::{assembler, AuthError, Error, Image, ImageName, Notifier, RegistryClient, RegistryConfig};
use serde_json::json;
use std::fs::{self, File};
use tempfile::TempDir;

const REPO: &str = "library/alpine";

fn client_for(registry: &FakeRegistry) -> Result<RegistryClient> {
    let config = RegistryConfig::new(registry.url(), REPO)?
        .with_system_proxy(false)
        .with_credentials("user", "pass");
    Ok(RegistryClient::new(config)?)
}

fn tags_reply() -> Reply {
    Reply::json(json!({"name": REPO, "tags": ["3.18", "3.19", "latest"]}))
}

#[test]
fn test_bearer_handshake_and_tags() -> Result<()> {
    let registry = FakeRegistry::start(|request, base| match request.path() {
        "/v2/" => Reply::challenge(&format!(
            r#"Bearer realm="{base}/token",service="fake-registry""#
        )),
        "/token" => Reply::json(json!({"token": "t0k3n", "expires_in": 300})),
        "/v2/library/alpine/tags/list" => match request.header("Authorization") {
            Some("Bearer t0k3n") => tags_reply(),
            _ => Reply::status(401),
        },
        _ => Reply::status(404),
    });

    let mut client = client_for(&registry)?;
    let tags = client.list_tags(REPO)?;
    assert_eq!(tags.name, REPO);
    assert_eq!(tags.tags, vec!["3.18", "3.19", "latest"]);

    let token = client.token().expect("Client should hold a token");
    assert_eq!(token.scheme, AuthScheme::Bearer);
    assert_eq!(token.expires_in, Some(300));

    let requests = registry.requests();
    let token_request = requests
        .iter()
        .find(|r| r.path() == "/token")
        .expect("Token endpoint should be called");
    assert_eq!(
        token_request.header("Authorization"),
        Some("Bearer dXNlcjpwYXNz"),
        "Credentials go to the realm with the challenge scheme"
    );
    assert!(token_request.query().contains("service=fake-registry"));
    assert!(token_request
        .query()
        .contains("scope=repository%3Alibrary%2Falpine%3Apull"));

    // A fresh token is reused.
    client.list_tags(REPO)?;
    assert_eq!(registry.count("/token"), 1);
    Ok(())
}

#[test]
fn test_expired_token_is_refreshed() -> Result<()> {
    let registry = FakeRegistry::start(|request, base| match request.path() {
        "/v2/" => Reply::challenge(&format!(r#"Bearer realm="{base}/token""#)),
        "/token" => Reply::json(json!({
            "token": "stale",
            "expires_in": 60,
            "issued_at": "2000-01-01T00:00:00Z",
        })),
        "/v2/library/alpine/tags/list" => match request.header("Authorization") {
            Some("Bearer stale") => tags_reply(),
            _ => Reply::status(401),
        },
        _ => Reply::status(404),
    });

    let mut client = client_for(&registry)?;
    client.list_tags(REPO)?;
    assert_eq!(registry.count("/token"), 1);
    assert!(client.token().is_some_and(|t| t.is_expired()));

    client.list_tags(REPO)?;
    assert_eq!(
        registry.count("/token"),
        2,
        "An expired token triggers a new handshake"
    );
    Ok(())
}

#[test]
fn test_basic_downgrade_at_realm() -> Result<()> {
    let registry = FakeRegistry::start(|request, base| match request.path() {
        "/v2/" => Reply::challenge(&format!(r#"Bearer realm="{base}/token""#)),
        "/token" => match request.header("Authorization") {
            Some("Basic dXNlcjpwYXNz") => Reply::json(json!({"access_token": "art"})),
            _ => Reply::challenge(r#"Basic realm="Artifactory Realm""#),
        },
        "/v2/library/alpine/tags/list" => match request.header("Authorization") {
            Some("Bearer art") => tags_reply(),
            _ => Reply::status(401),
        },
        _ => Reply::status(404),
    });

    let mut client = client_for(&registry)?;
    let tags = client.list_tags(REPO)?;
    assert_eq!(tags.tags.len(), 3);
    assert_eq!(registry.count("/token"), 2, "Exactly one Basic retry");

    let token = client.token().expect("Client should hold a token");
    assert_eq!(token.token, "art");
    assert_eq!(token.expires_in, Some(60));
    Ok(())
}

#[test]
fn test_basic_credentials_without_token_service() -> Result<()> {
    let registry = FakeRegistry::start(|request, _| {
        match (request.path(), request.header("Authorization")) {
            (_, Some("Basic dXNlcjpwYXNz")) if request.path() == "/v2/" => Reply::ok("{}"),
            ("/v2/library/alpine/tags/list", Some("Basic dXNlcjpwYXNz")) => tags_reply(),
            _ => Reply::challenge(r#"Basic realm="Registry Realm""#),
        }
    });

    let mut client = client_for(&registry)?;
    client.list_tags(REPO)?;

    let token = client.token().expect("Client should hold a credential");
    assert_eq!(token.scheme, AuthScheme::Basic);
    assert_eq!(token.expires_in, None);
    Ok(())
}

#[test]
fn test_rejected_credentials() -> Result<()> {
    let registry = FakeRegistry::start(|request, base| match request.path() {
        "/v2/" | "/token" => Reply::challenge(&format!(r#"Bearer realm="{base}/token""#)),
        _ => Reply::status(404),
    });

    let mut client = client_for(&registry)?;
    match client.list_tags(REPO) {
        Err(Error::Auth {
            source: AuthError::Rejected { scheme, .. },
            ..
        }) => assert_eq!(scheme, "Bearer"),
        other => panic!("Expected rejected credentials, got {other:?}"),
    }
    assert_eq!(registry.count("/token"), 1, "Bearer to Bearer is not retried");
    Ok(())
}

#[test]
fn test_unsupported_scheme_and_missing_challenge() -> Result<()> {
    let registry = FakeRegistry::start(|_, _| Reply::challenge(r#"Negotiate realm="corp""#));
    let mut client = client_for(&registry)?;
    assert!(matches!(
        client.list_tags(REPO),
        Err(Error::Auth {
            source: AuthError::UnsupportedScheme(_),
            ..
        })
    ));

    let registry = FakeRegistry::start(|_, _| Reply::status(401));
    let mut client = client_for(&registry)?;
    assert!(matches!(
        client.list_tags(REPO),
        Err(Error::Auth {
            source: AuthError::MissingChallenge,
            ..
        })
    ));
    Ok(())
}

#[test]
fn test_http_errors_and_manifest_lists() -> Result<()> {
    let registry = FakeRegistry::start(|request, _| match request.path() {
        "/v2/" => Reply::ok("{}"),
        "/v2/library/alpine/manifests/multi" => Reply::json(json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_MANIFEST_LIST_V2,
            "manifests": [],
        })),
        _ => Reply::status(404),
    });

    let mut client = client_for(&registry)?;
    match client.get_manifest(REPO, "missing") {
        Err(Error::HttpStatus { status, url }) => {
            assert_eq!(status.as_u16(), 404);
            assert!(url.ends_with("/v2/library/alpine/manifests/missing"));
        }
        other => panic!("Expected HttpStatus, got {other:?}"),
    }
    assert!(client.token().is_none(), "Anonymous registries get no token");

    assert!(matches!(
        client.get_manifest(REPO, "multi"),
        Err(Error::Parse(_))
    ));

    let staging = TempDir::new()?;
    let descriptor = Descriptor {
        media_type: "application/vnd.docker.image.rootfs.diff.tar.gzip".to_string(),
        digest: Digest::parse(digest('f'))?,
        size: 10,
    };
    let result = client.fetch_blob(REPO, &descriptor, staging.path(), &Notifier::hidden());
    assert!(matches!(result, Err(Error::HttpStatus { .. })));
    Ok(())
}

#[test]
fn test_manifest_digest_cannot_escape_staging() -> Result<()> {
    let registry = FakeRegistry::start(|request, _| match request.path() {
        "/v2/" => Reply::ok("{}"),
        "/v2/library/alpine/manifests/evil" => Reply::json(json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
            "config": {
                "mediaType": "application/vnd.docker.container.image.v1+json",
                "size": 2,
                "digest": digest('c'),
            },
            "layers": [{
                "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                "size": 2,
                "digest": "sha256:../escaped",
            }],
        })),
        _ => Reply::ok("{}"),
    });

    let mut client = client_for(&registry)?;
    match client.get_manifest(REPO, "evil") {
        Err(Error::Json(e)) => assert!(e.to_string().contains("invalid digest")),
        other => panic!("Expected a rejected digest, got {other:?}"),
    }

    let output = TempDir::new()?;
    let image_name = ImageName::parse("library/alpine:evil")?;
    let result = assembler::pull(&mut client, &image_name, &output.path().join("out"), &Notifier::hidden());
    assert!(result.is_err());
    assert!(!output.path().join("escaped.tar").exists());
    assert_eq!(
        registry.count("/v2/library/alpine/blobs/sha256:../escaped"),
        0,
        "No blob is requested for an invalid digest"
    );
    Ok(())
}

#[test]
fn test_pull_assembles_parsable_bundle() -> Result<()> {
    let config = config_json(&[
        ("/bin/sh -c #(nop) ADD file:abc in /", false),
        ("/bin/sh -c #(nop)  CMD [\"/bin/sh\"]", true),
        ("/bin/sh -c apk add curl", false),
    ]);
    let base = gzip(
        &LayerBuilder::new()
            .file("etc/os-release", b"ID=alpine\n")
            .build(),
    );
    let curl = gzip(
        &LayerBuilder::new()
            .file("usr/bin/curl", b"curl-binary")
            .build(),
    );
    let manifest = json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
        "config": {
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "size": config.len(),
            "digest": digest('c'),
        },
        "layers": [
            {
                "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                "size": base.len(),
                "digest": digest('a'),
            },
            {
                "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                "size": curl.len(),
                "digest": digest('b'),
            },
        ],
    });

    let registry = FakeRegistry::start(move |request, _| {
        let blob = |seed| format!("/v2/library/alpine/blobs/{}", digest(seed));
        match request.path() {
            "/v2/" => Reply::ok("{}"),
            "/v2/library/alpine/manifests/3.19" => Reply::json(manifest.clone()),
            path if path == blob('c') => Reply::ok(config.clone()),
            path if path == blob('a') => Reply::ok(base.clone()),
            path if path == blob('b') => Reply::ok(curl.clone()),
            _ => Reply::status(404),
        }
    });

    let mut client = client_for(&registry)?;
    let image_name = ImageName::parse("library/alpine:3.19")?;
    let output = TempDir::new()?;
    let pulled = assembler::pull(&mut client, &image_name, output.path(), &Notifier::hidden())?;

    assert_eq!(pulled.path, output.path().join("library_alpine_3.19.tar.gz"));
    assert_eq!(pulled.manifest.config, format!("{}.json", "c".repeat(64)));
    assert_eq!(
        pulled.manifest.layers,
        vec![format!("{}.tar", "a".repeat(64)), format!("{}.tar", "b".repeat(64))]
    );

    let manifest_request = registry
        .requests()
        .into_iter()
        .find(|r| r.path() == "/v2/library/alpine/manifests/3.19")
        .expect("Manifest should be requested");
    assert_eq!(
        manifest_request.header("Accept"),
        Some("application/vnd.docker.distribution.manifest.v2+json")
    );

    let image = Image::parse(File::open(&pulled.path)?)?;
    assert_eq!(image.tag(), Some("library/alpine:3.19"));
    assert_eq!(image.layers().len(), 2);
    assert_eq!(image.layers()[0].id(), "a".repeat(64));
    assert_eq!(image.layers()[1].command(), "apk add curl");
    assert!(image.layers()[1].tree().get_node("/usr/bin/curl").is_ok());

    let extract_dir = TempDir::new()?;
    let options = layerpeek::ExtractOptions::new(extract_dir.path());
    let written = image.extract(File::open(&pulled.path)?, "/usr/bin/curl", &options)?;
    assert_eq!(fs::read(written)?, b"curl-binary");
    Ok(())
}
