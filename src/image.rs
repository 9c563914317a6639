//! Parse an image bundle (`docker save` layout or a pulled bundle) into a typed,
//! browsable structure.
//!
//! [`Image::parse`] makes a single pass over the bundle stream:
//! - `manifest.json` provides the config name, the ordered layer archive paths
//!   and the repo tags (only the first image entry is used);
//! - other `.json` entries are image-config candidates, the one named by the
//!   manifest wins;
//! - every `.tar` entry is walked into its own [`FileTree`].
//!
//! After the stream ends the layer archives are reconciled against the config
//! history. History entries flagged `empty_layer` have no archive; every other
//! entry claims the next manifest layer, in order. The pairing is positional
//! and a count mismatch is a hard error.

use chrono::{DateTime, Utc};
use indicatif::HumanBytes;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::archive;
use crate::error::{Error, Result};
use crate::extract::{self, ExtractOptions, MatchMode};
use crate::tree::{EntryKind, FileTree};

pub const MANIFEST_FILE: &str = "manifest.json";

/// One entry of the bundle's `manifest.json` array.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BundleManifest {
    #[serde(rename = "Config")]
    pub config: String,
    #[serde(default, rename = "Layers")]
    pub layers: Vec<String>,
    #[serde(default, rename = "RepoTags")]
    pub repo_tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub created: Option<DateTime<Utc>>,
    pub author: String,
    pub created_by: String,
    pub comment: Option<String>,
    pub empty_layer: bool,
}

impl HistoryEntry {
    /// The build command with the shell wrapper stripped.
    pub fn command(&self) -> &str {
        let created_by = self.created_by.as_str();
        created_by
            .strip_prefix("/bin/sh -c #(nop) ")
            .or_else(|| created_by.strip_prefix("/bin/sh -c "))
            .map(str::trim_start)
            .unwrap_or(created_by)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageConfig {
    pub architecture: String,
    pub os: String,
    pub created: Option<DateTime<Utc>>,
    pub docker_version: Option<String>,
    pub history: Vec<HistoryEntry>,
}

fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

impl ImageConfig {
    pub fn from_json(raw: &[u8]) -> Result<Self> {
        let config: oci_spec::image::ImageConfiguration = serde_json::from_slice(raw)?;
        let extras: serde_json::Value = serde_json::from_slice(raw)?;

        let history = config
            .history()
            .as_ref()
            .map(|entries| {
                entries
                    .iter()
                    .map(|h| HistoryEntry {
                        created: parse_timestamp(h.created().as_deref()),
                        author: h.author().clone().unwrap_or_default(),
                        created_by: h.created_by().clone().unwrap_or_default(),
                        comment: h.comment().clone(),
                        empty_layer: h.empty_layer().unwrap_or(false),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            architecture: config.architecture().to_string(),
            os: config.os().to_string(),
            created: parse_timestamp(config.created().as_deref()),
            docker_version: extras["docker_version"].as_str().map(str::to_string),
            history,
        })
    }

    /// Number of history entries that carry a layer archive.
    pub fn non_empty_layers(&self) -> usize {
        self.history.iter().filter(|h| !h.empty_layer).count()
    }
}

/// Identity of a layer archive: its file name without algorithm prefix and
/// extension. `docker save` archives (`<id>/layer.tar`) use the directory name.
pub fn layer_id(archive_path: &str) -> String {
    let path = Path::new(archive::clean_name(archive_path));
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(archive_path);

    let stem = if stem == "layer" {
        path.parent()
            .and_then(|p| p.file_name())
            .and_then(|s| s.to_str())
            .unwrap_or(stem)
    } else {
        stem
    };

    stem.split_once([':', '_', '-'])
        .filter(|(algorithm, _)| algorithm.starts_with("sha"))
        .map(|(_, hex)| hex)
        .unwrap_or(stem)
        .to_string()
}

#[derive(Debug, Clone)]
pub struct Layer {
    index: usize,
    history: HistoryEntry,
    tree: FileTree,
    archive_path: String,
}

impl Layer {
    pub fn id(&self) -> String {
        layer_id(&self.archive_path)
    }

    pub fn short_id(&self) -> String {
        self.id().chars().take(15).collect()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn history(&self) -> &HistoryEntry {
        &self.history
    }

    pub fn command(&self) -> &str {
        self.history.command()
    }

    /// Bytes declared by the entries of this layer's archive.
    pub fn size(&self) -> u64 {
        self.tree.file_size()
    }

    pub fn tree(&self) -> &FileTree {
        &self.tree
    }

    /// Location of the layer archive inside the bundle.
    pub fn archive_path(&self) -> &str {
        &self.archive_path
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let size = HumanBytes(self.size()).to_string();
        if self.index == 0 {
            write!(f, "{:>10}  FROM {}", size, self.short_id())
        } else {
            write!(f, "{:>10}  {}", size, self.command())
        }
    }
}

/// Presentation row for one layer: its id and the rendered entries beneath it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerNode {
    pub label: String,
    pub entries: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Image {
    tag: Option<String>,
    manifest: BundleManifest,
    config: ImageConfig,
    layers: Vec<Layer>,
}

impl Image {
    /// Reads a bundle stream (gzip or plain tar) into an [`Image`].
    pub fn parse<R: Read>(reader: R) -> Result<Self> {
        let mut bundle = archive::open(reader)
            .map_err(|e| Error::Parse(format!("failed to open image bundle: {}", e)))?;

        let mut manifest: Option<BundleManifest> = None;
        let mut config_candidates: HashMap<String, Vec<u8>> = HashMap::new();
        let mut trees: Vec<FileTree> = Vec::new();

        let entries = bundle
            .entries()
            .map_err(|e| Error::Parse(format!("failed to read image bundle: {}", e)))?;
        for entry_result in entries {
            let mut entry = entry_result
                .map_err(|e| Error::Parse(format!("failed to read image bundle: {}", e)))?;

            if archive::entry_kind(entry.header().entry_type()) != EntryKind::Regular {
                continue;
            }
            let name = archive::clean_name(&entry.path()?.to_string_lossy()).to_string();

            match Path::new(&name).extension().and_then(|e| e.to_str()) {
                Some("json") if name.eq_ignore_ascii_case(MANIFEST_FILE) => {
                    let mut raw = Vec::new();
                    entry.read_to_end(&mut raw)?;
                    let mut entries: Vec<BundleManifest> = serde_json::from_slice(&raw)?;
                    if entries.is_empty() {
                        return Err(Error::EmptyManifest);
                    }
                    if entries.len() > 1 {
                        info!(
                            "{} lists {} images, using the first",
                            MANIFEST_FILE,
                            entries.len()
                        );
                    }
                    manifest = Some(entries.swap_remove(0));
                }
                Some("json") => {
                    let mut raw = Vec::new();
                    entry.read_to_end(&mut raw)?;
                    config_candidates.insert(name, raw);
                }
                Some("tar") => {
                    debug!("Reading layer archive {}", name);
                    trees.push(archive::read_layer_tree(&name, &mut entry)?);
                }
                _ => debug!("Ignoring bundle entry {}", name),
            }
        }

        let manifest = manifest.ok_or_else(|| Error::MissingEntry(MANIFEST_FILE.to_string()))?;
        let config_name = archive::clean_name(&manifest.config).to_string();
        let raw_config = match config_candidates.remove(&config_name) {
            Some(raw) => raw,
            None if config_candidates.len() == 1 => config_candidates
                .into_values()
                .next()
                .ok_or_else(|| Error::MissingEntry(config_name.clone()))?,
            None => return Err(Error::MissingEntry(config_name)),
        };
        let config = ImageConfig::from_json(&raw_config)?;

        let layers = reconcile(&config, &manifest, trees)?;
        info!("Successfully loaded {} layers", layers.len());

        Ok(Self {
            tag: manifest
                .repo_tags
                .as_ref()
                .and_then(|tags| tags.first().cloned()),
            manifest,
            config,
            layers,
        })
    }

    /// First repo tag recorded in the bundle, if any.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn docker_version(&self) -> Option<&str> {
        self.config.docker_version.as_deref()
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.config.created
    }

    pub fn manifest(&self) -> &BundleManifest {
        &self.manifest
    }

    pub fn config(&self) -> &ImageConfig {
        &self.config
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn trees(&self) -> impl Iterator<Item = &FileTree> {
        self.layers.iter().map(Layer::tree)
    }

    /// Total bytes across all layers.
    pub fn size(&self) -> u64 {
        self.layers.iter().map(Layer::size).sum()
    }

    /// One row per layer listing its entries (whiteouts hidden), e.g.
    /// `/bin/sh → busybox (0 B)`.
    pub fn nodes(&self) -> Vec<LayerNode> {
        self.layers
            .iter()
            .map(|layer| {
                let tree = layer.tree();
                let mut entries = Vec::new();
                let visited = tree.visit_depth_child_first::<Error, _>(
                    |id, node| {
                        if node.is_whiteout() {
                            return Ok(());
                        }
                        let mut display = tree.path_of(id)?;
                        if let (true, Some(target)) = (node.info().is_link(), &node.info().link_name)
                        {
                            display.push_str(" → ");
                            display.push_str(target);
                        }
                        display.push_str(&format!(" ({})", HumanBytes(node.info().size)));
                        entries.push(display);
                        Ok(())
                    },
                    None,
                );
                if let Err(e) = visited {
                    debug!("Listing of layer {} is incomplete: {}", layer.id(), e);
                }
                LayerNode {
                    label: layer.id(),
                    entries,
                }
            })
            .collect()
    }

    /// Topmost layer whose tree holds `path` as a regular file.
    pub fn layer_providing(&self, path: &str) -> Option<&Layer> {
        self.layers.iter().rev().find(|layer| {
            let tree = layer.tree();
            tree.get_node(path)
                .ok()
                .and_then(|id| tree.get(id))
                .is_some_and(|node| node.info().kind == EntryKind::Regular)
        })
    }

    /// Copies one path out of the bundle stream into `options.output_dir`.
    ///
    /// In exact mode the parsed layer trees are consulted first, so a path no
    /// layer provides fails with `NotFound` without re-reading the bundle.
    pub fn extract<R: Read>(&self, reader: R, path: &str, options: &ExtractOptions) -> Result<PathBuf> {
        if options.match_mode == MatchMode::Exact {
            match self.layer_providing(path) {
                Some(layer) => debug!("{} is provided by layer {}", path, layer.id()),
                None => return Err(Error::NotFound(path.to_string())),
            }
        }
        extract::extract(reader, path, options)
    }
}

fn reconcile(
    config: &ImageConfig,
    manifest: &BundleManifest,
    trees: Vec<FileTree>,
) -> Result<Vec<Layer>> {
    let non_empty = config.non_empty_layers();
    if non_empty != manifest.layers.len() || non_empty != trees.len() {
        return Err(Error::StructuralMismatch {
            history: non_empty,
            manifest: manifest.layers.len(),
            archives: trees.len(),
        });
    }

    let mut trees: Vec<Option<FileTree>> = trees.into_iter().map(Some).collect();
    let mut layers = Vec::with_capacity(non_empty);

    for history in config.history.iter().filter(|h| !h.empty_layer) {
        let index = layers.len();
        let archive_path = &manifest.layers[index];
        let wanted = archive::clean_name(archive_path);

        let slot = trees
            .iter()
            .position(|t| t.as_ref().is_some_and(|t| t.name() == wanted))
            .or_else(|| {
                trees.iter().position(|t| {
                    t.as_ref()
                        .is_some_and(|t| !t.name().is_empty() && wanted.contains(t.name()))
                })
            })
            .ok_or_else(|| Error::MissingEntry(archive_path.clone()))?;
        let tree = trees[slot]
            .take()
            .ok_or_else(|| Error::MissingEntry(archive_path.clone()))?;

        layers.push(Layer {
            index,
            history: history.clone(),
            tree,
            archive_path: archive_path.clone(),
        });
    }

    Ok(layers)
}
