//! Pull an image into a `docker save` style bundle.
//!
//! The manifest, config blob and layer blobs are staged in a temporary
//! directory next to a synthetic `manifest.json`, then packaged as
//! `<repo>_<tag>.tar.gz`. The staging directory is removed when the pull
//! finishes, whether it succeeded or not.

use flate2::write::GzEncoder;
use flate2::Compression;
use indicatif::HumanBytes;
use log::{debug, info};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tar_rs as tar;
use tempfile::TempDir;

use crate::error::Result;
use crate::image::{BundleManifest, MANIFEST_FILE};
use crate::notifier::Notifier;
use crate::registry::{ImageName, RegistryClient};

/// Outcome of [`pull`].
#[derive(Debug, Clone)]
pub struct PulledBundle {
    pub path: PathBuf,
    pub manifest: BundleManifest,
    /// Sum of the layer sizes declared by the registry manifest.
    pub declared_size: u64,
}

/// Downloads `image` through `client` and writes the packaged bundle into
/// `output_dir`.
pub fn pull(
    client: &mut RegistryClient,
    image: &ImageName,
    output_dir: &Path,
    notifier: &Notifier,
) -> Result<PulledBundle> {
    notifier.info(&format!("Querying registry for {}", image));
    let manifest = client.get_manifest(&image.repository, &image.tag)?;
    info!(
        "Manifest for {} lists {} layers ({})",
        image,
        manifest.layers.len(),
        HumanBytes(manifest.layers_size())
    );

    let staging = TempDir::new()?;
    debug!("Staging blobs in {}", staging.path().display());

    notifier.info("Downloading image config");
    let config = client.fetch_blob(&image.repository, &manifest.config, staging.path(), notifier)?;

    let mut layers = Vec::with_capacity(manifest.layers.len());
    for (i, layer) in manifest.layers.iter().enumerate() {
        notifier.info(&format!(
            "Downloading layer {}/{} ({})",
            i + 1,
            manifest.layers.len(),
            HumanBytes(layer.size)
        ));
        layers.push(client.fetch_blob(&image.repository, layer, staging.path(), notifier)?);
    }

    let bundle = BundleManifest {
        config,
        layers,
        repo_tags: Some(vec![image.to_string()]),
    };
    write_bundle_manifest(staging.path(), &bundle)?;

    fs::create_dir_all(output_dir)?;
    let path = output_dir.join(image.bundle_file_name());
    notifier.info(&format!("Creating image tarball {}", path.display()));
    package(staging.path(), &bundle, &path)?;
    notifier.finish(&format!("Saved {}", path.display()));

    Ok(PulledBundle {
        path,
        manifest: bundle,
        declared_size: manifest.layers_size(),
    })
}

/// Writes `manifest.json` as a one-element array.
pub fn write_bundle_manifest(dir: &Path, bundle: &BundleManifest) -> Result<PathBuf> {
    let path = dir.join(MANIFEST_FILE);
    let file = File::create(&path)?;
    serde_json::to_writer(file, &[bundle])?;
    Ok(path)
}

/// Packs the staged files into a gzip tarball at `destination`, each stored
/// under its base name.
pub fn package(dir: &Path, bundle: &BundleManifest, destination: &Path) -> Result<()> {
    let encoder = GzEncoder::new(File::create(destination)?, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let names = std::iter::once(&bundle.config)
        .chain(bundle.layers.iter())
        .map(String::as_str)
        .chain(std::iter::once(MANIFEST_FILE));
    for name in names {
        debug!("Adding {} to {}", name, destination.display());
        builder.append_path_with_name(dir.join(name), name)?;
    }

    builder.into_inner()?.finish()?;
    Ok(())
}
