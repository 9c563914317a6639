//! Copy a single path out of an archive, optionally looking inside nested
//! `.tar` entries.
//!
//! Nested archives cannot be read while their parent stream is borrowed, so
//! each one is spooled to an anonymous temporary file and queued. The queue is
//! drained in FIFO order: an archive's own entries are always examined before
//! any archive nested inside it.

use log::{debug, info, trace};
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::archive;
use crate::error::{Error, Result};
use crate::tree::EntryKind;

/// How an archive entry is compared with the requested path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MatchMode {
    /// Normalised paths of regular files must be equal.
    #[default]
    Exact,
    /// The requested path only has to contain the entry name. Symlinks are
    /// compared by their link target.
    Substring,
}

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Archive levels to scan, the outermost one included.
    pub depth: usize,
    pub match_mode: MatchMode,
    pub output_dir: PathBuf,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            depth: 2,
            match_mode: MatchMode::Exact,
            output_dir: PathBuf::from("."),
        }
    }
}

impl ExtractOptions {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_match_mode(mut self, match_mode: MatchMode) -> Self {
        self.match_mode = match_mode;
        self
    }
}

/// Strips leading `/` and `./` and collapses repeated slashes.
pub fn normalize(path: &str) -> String {
    archive::clean_name(path)
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

impl MatchMode {
    pub fn matches(&self, target: &str, candidate: &str) -> bool {
        match self {
            MatchMode::Exact => {
                let candidate = normalize(candidate);
                !candidate.is_empty() && candidate == normalize(target)
            }
            MatchMode::Substring => !candidate.is_empty() && target.contains(candidate),
        }
    }
}

struct Pending {
    label: String,
    file: File,
    remaining: usize,
}

/// Scans `reader` for `target` and copies the first match to
/// `<output_dir>/<final segment>`, returning the written path.
pub fn extract<R: Read>(reader: R, target: &str, options: &ExtractOptions) -> Result<PathBuf> {
    let mut queue: VecDeque<Pending> = VecDeque::new();
    let top_depth = options.depth.max(1);

    if let Some(written) = scan(reader, "<input>", top_depth, target, options, &mut queue)? {
        return Ok(written);
    }

    while let Some(pending) = queue.pop_front() {
        debug!(
            "Searching nested archive {} ({} level(s) left)",
            pending.label, pending.remaining
        );
        let Pending {
            label,
            file,
            remaining,
        } = pending;
        if let Some(written) = scan(file, &label, remaining, target, options, &mut queue)? {
            return Ok(written);
        }
    }

    Err(Error::NotFound(target.to_string()))
}

fn scan<R: Read>(
    reader: R,
    label: &str,
    remaining: usize,
    target: &str,
    options: &ExtractOptions,
    queue: &mut VecDeque<Pending>,
) -> Result<Option<PathBuf>> {
    let corrupt = |e: io::Error| Error::Parse(format!("failed to read archive {}: {}", label, e));
    let mut archive = archive::open(reader).map_err(corrupt)?;

    for entry_result in archive.entries().map_err(corrupt)? {
        let mut entry = entry_result.map_err(corrupt)?;
        let name = entry.path()?.to_string_lossy().into_owned();

        let candidate = match archive::entry_kind(entry.header().entry_type()) {
            EntryKind::Regular if name.ends_with(".tar") => {
                if remaining.saturating_sub(1) > 0 {
                    let mut file = tempfile::tempfile()?;
                    io::copy(&mut entry, &mut file)?;
                    file.seek(SeekFrom::Start(0))?;
                    queue.push_back(Pending {
                        label: name,
                        file,
                        remaining: remaining - 1,
                    });
                } else {
                    trace!("Not descending into {}: depth exhausted", name);
                }
                continue;
            }
            EntryKind::Regular => name,
            // Link targets only take part in substring matching; an exact
            // lookup names the file itself, never a link pointing at it.
            EntryKind::Symlink if options.match_mode == MatchMode::Substring => {
                match entry.link_name()? {
                    Some(link) => link.to_string_lossy().into_owned(),
                    None => continue,
                }
            }
            _ => continue,
        };

        if options.match_mode.matches(target, &candidate) {
            let written = write_entry(&mut entry, &candidate, &options.output_dir)?;
            info!("Extracted {} from {} to {}", candidate, label, written.display());
            return Ok(Some(written));
        }
    }

    Ok(None)
}

fn write_entry<R: Read>(entry: &mut R, name: &str, output_dir: &Path) -> Result<PathBuf> {
    let file_name = Path::new(name)
        .file_name()
        .ok_or_else(|| Error::Parse(format!("entry has no file name: {}", name)))?;

    fs::create_dir_all(output_dir)?;
    let destination = output_dir.join(file_name);
    let mut file = File::create(&destination)?;
    io::copy(entry, &mut file)?;
    Ok(destination)
}
