use flate2::read::GzDecoder;
use log::{debug, trace};
use std::io::{self, BufRead, BufReader, Read};
use tar_rs as tar;

use crate::error::{Error, Result};
use crate::tree::{EntryKind, FileInfo, FileTree};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Opens a tar stream, transparently decompressing it when it starts with the
/// gzip magic bytes.
pub fn open<'a, R: Read + 'a>(reader: R) -> io::Result<tar::Archive<Box<dyn Read + 'a>>> {
    let mut buffered = BufReader::new(reader);
    let compressed = buffered.fill_buf()?.starts_with(&GZIP_MAGIC);

    let inner: Box<dyn Read + 'a> = if compressed {
        Box::new(GzDecoder::new(buffered))
    } else {
        Box::new(buffered)
    };
    Ok(tar::Archive::new(inner))
}

/// Entry name with any leading `./` or `/` removed.
pub fn clean_name(name: &str) -> &str {
    let mut name = name;
    loop {
        if let Some(rest) = name.strip_prefix("./") {
            name = rest;
        } else if let Some(rest) = name.strip_prefix('/') {
            name = rest;
        } else {
            return name;
        }
    }
}

pub(crate) fn entry_kind(entry_type: tar::EntryType) -> EntryKind {
    match entry_type {
        tar::EntryType::Regular | tar::EntryType::Continuous => EntryKind::Regular,
        tar::EntryType::Directory => EntryKind::Directory,
        tar::EntryType::Symlink => EntryKind::Symlink,
        tar::EntryType::Link => EntryKind::HardLink,
        _ => EntryKind::Other,
    }
}

pub(crate) fn file_info<R: Read>(entry: &tar::Entry<'_, R>) -> io::Result<FileInfo> {
    let header = entry.header();
    let path = entry.path()?.to_string_lossy().into_owned();
    let link_name = entry
        .link_name()?
        .map(|target| target.to_string_lossy().into_owned());

    Ok(FileInfo {
        path,
        size: entry.size(),
        link_name,
        kind: entry_kind(header.entry_type()),
        mode: header.mode().unwrap_or(0o644),
    })
}

fn corrupt(archive: &str, err: io::Error) -> Error {
    Error::Parse(format!("failed to read layer archive {}: {}", archive, err))
}

/// Walks one layer archive and builds its [`FileTree`], labelled `name`.
pub fn read_layer_tree<R: Read>(name: &str, reader: R) -> Result<FileTree> {
    let mut archive = open(reader).map_err(|e| corrupt(name, e))?;
    let mut tree = FileTree::named(name);

    for entry_result in archive.entries().map_err(|e| corrupt(name, e))? {
        let entry = entry_result.map_err(|e| corrupt(name, e))?;
        let entry_type = entry.header().entry_type();

        if entry_type.is_pax_global_extensions() {
            return Err(Error::Parse(format!(
                "unexpected tar entry (pax global header) in {}: {}",
                name,
                entry.path().map(|p| p.display().to_string()).unwrap_or_default()
            )));
        }
        if entry_type.is_pax_local_extensions() {
            return Err(Error::Parse(format!(
                "unexpected tar entry (pax extended header) in {}: {}",
                name,
                entry.path().map(|p| p.display().to_string()).unwrap_or_default()
            )));
        }

        let info = file_info(&entry).map_err(|e| corrupt(name, e))?;
        if info.kind == EntryKind::Other {
            debug!("Skipping unsupported entry type {:?}: {}", entry_type, info.path);
            continue;
        }

        trace!("{}: {}", name, info.path);
        tree.accumulate(info.size);
        let path = info.path.clone();
        tree.add_path(&path, info)?;
    }

    debug!(
        "Layer archive {} holds {} nodes ({} bytes)",
        name,
        tree.len(),
        tree.file_size()
    );
    Ok(tree)
}
