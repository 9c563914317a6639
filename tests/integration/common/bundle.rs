//! Synthetic image bundles built in memory.

use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::json;
use std::io::Write;
use tar_rs as tar;

/// Builds one layer archive entry by entry.
#[derive(Default)]
pub struct LayerBuilder {
    builder: Option<tar::Builder<Vec<u8>>>,
}

impl LayerBuilder {
    pub fn new() -> Self {
        Self {
            builder: Some(tar::Builder::new(Vec::new())),
        }
    }

    fn inner(&mut self) -> &mut tar::Builder<Vec<u8>> {
        self.builder.get_or_insert_with(|| tar::Builder::new(Vec::new()))
    }

    pub fn dir(mut self, path: &str) -> Self {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        header.set_mode(0o755);
        self.inner()
            .append_data(&mut header, path, std::io::empty())
            .unwrap();
        self
    }

    pub fn file(mut self, path: &str, data: &[u8]) -> Self {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        self.inner().append_data(&mut header, path, data).unwrap();
        self
    }

    pub fn symlink(mut self, path: &str, target: &str) -> Self {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        self.inner().append_link(&mut header, path, target).unwrap();
        self
    }

    pub fn build(mut self) -> Vec<u8> {
        self.builder
            .take()
            .unwrap_or_else(|| tar::Builder::new(Vec::new()))
            .into_inner()
            .unwrap()
    }
}

pub fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap()
}

/// Image config with one history entry per `(created_by, empty_layer)` pair.
pub fn config_json(history: &[(&str, bool)]) -> Vec<u8> {
    let history: Vec<_> = history
        .iter()
        .map(|(created_by, empty_layer)| {
            json!({
                "created": "2024-03-01T10:00:00Z",
                "created_by": created_by,
                "empty_layer": empty_layer,
            })
        })
        .collect();

    serde_json::to_vec(&json!({
        "architecture": "amd64",
        "os": "linux",
        "created": "2024-03-01T10:00:00Z",
        "docker_version": "24.0.7",
        "config": {},
        "rootfs": {"type": "layers", "diff_ids": []},
        "history": history,
    }))
    .unwrap()
}

pub fn manifest_json(config: &str, layers: &[&str], repo_tag: Option<&str>) -> Vec<u8> {
    serde_json::to_vec(&json!([{
        "Config": config,
        "Layers": layers,
        "RepoTags": repo_tag.map(|t| vec![t]),
    }]))
    .unwrap()
}

/// Packs `(name, contents)` pairs into a bundle, gzip-compressed when asked.
pub fn bundle(entries: &[(&str, &[u8])], compress: bool) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, name, *data).unwrap();
    }
    let raw = builder.into_inner().unwrap();
    if compress {
        gzip(&raw)
    } else {
        raw
    }
}
