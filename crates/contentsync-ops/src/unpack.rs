//! Extraction of the bundled bootstrap archive.

use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use tokio_util::sync::CancellationToken;

use crate::error::UnpackError;

/// Supported archive formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    Tar,
    TarGz,
    TarXz,
    TarBz2,
}

impl ArchiveFormat {
    /// Pick the format from the file name.
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_ascii_lowercase();
        if name.ends_with(".zip") {
            Some(Self::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
            Some(Self::TarXz)
        } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz2") {
            Some(Self::TarBz2)
        } else if name.ends_with(".tar") {
            Some(Self::Tar)
        } else {
            None
        }
    }
}

/// Progress of an extraction.
#[derive(Debug, Clone)]
pub struct UnpackProgress {
    pub entries_done: usize,
    pub entries_total: usize,
    /// Entry just written, relative to the destination.
    pub current: PathBuf,
}

/// Unpacks archives into a directory.
///
/// Both methods block; callers run them on a blocking thread.
pub trait ArchiveExtractor: Send + Sync {
    /// Number of entries in `archive`.
    fn entry_count(&self, archive: &Path) -> Result<usize, UnpackError>;

    /// Extract every entry of `archive` below `dest`.
    ///
    /// `total` is the [`entry_count`](Self::entry_count) result, reported
    /// back in progress. Returns the paths of the files written. `cancel` is
    /// checked between entries.
    fn extract(
        &self,
        archive: &Path,
        dest: &Path,
        total: usize,
        cancel: &CancellationToken,
        progress: &(dyn Fn(UnpackProgress) + Send + Sync),
    ) -> Result<Vec<PathBuf>, UnpackError>;
}

/// Extractor for zip and (compressed) tar archives.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardExtractor;

impl ArchiveExtractor for StandardExtractor {
    fn entry_count(&self, archive: &Path) -> Result<usize, UnpackError> {
        match format_of(archive)? {
            ArchiveFormat::Zip => Ok(open_zip(archive)?.len()),
            format => {
                let mut tar = tar::Archive::new(tar_reader(archive, format)?);
                let entries = tar.entries().map_err(|e| UnpackError::io(archive, e))?;
                let mut count = 0;
                for entry in entries {
                    entry.map_err(|e| UnpackError::io(archive, e))?;
                    count += 1;
                }
                Ok(count)
            }
        }
    }

    fn extract(
        &self,
        archive: &Path,
        dest: &Path,
        total: usize,
        cancel: &CancellationToken,
        progress: &(dyn Fn(UnpackProgress) + Send + Sync),
    ) -> Result<Vec<PathBuf>, UnpackError> {
        let format = format_of(archive)?;
        fs::create_dir_all(dest).map_err(|e| UnpackError::io(dest, e))?;

        let written = match format {
            ArchiveFormat::Zip => extract_zip(archive, dest, total, cancel, progress)?,
            format => extract_tar(archive, format, dest, total, cancel, progress)?,
        };
        tracing::debug!(archive = %archive.display(), files = written.len(), "archive extracted");
        Ok(written)
    }
}

fn format_of(archive: &Path) -> Result<ArchiveFormat, UnpackError> {
    ArchiveFormat::from_path(archive).ok_or_else(|| UnpackError::UnsupportedFormat {
        path: archive.to_path_buf(),
    })
}

fn open_zip(archive: &Path) -> Result<zip::ZipArchive<BufReader<File>>, UnpackError> {
    let file = File::open(archive).map_err(|e| UnpackError::io(archive, e))?;
    Ok(zip::ZipArchive::new(BufReader::new(file))?)
}

fn tar_reader(archive: &Path, format: ArchiveFormat) -> Result<Box<dyn Read>, UnpackError> {
    let file = BufReader::new(File::open(archive).map_err(|e| UnpackError::io(archive, e))?);
    Ok(match format {
        ArchiveFormat::TarGz => Box::new(flate2::read::GzDecoder::new(file)),
        ArchiveFormat::TarXz => Box::new(xz2::read::XzDecoder::new(file)),
        ArchiveFormat::TarBz2 => Box::new(bzip2::read::BzDecoder::new(file)),
        ArchiveFormat::Tar | ArchiveFormat::Zip => Box::new(file),
    })
}

/// Reject absolute paths and parent traversal.
fn safe_relative(name: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in name.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

fn extract_zip(
    archive: &Path,
    dest: &Path,
    total: usize,
    cancel: &CancellationToken,
    progress: &(dyn Fn(UnpackProgress) + Send + Sync),
) -> Result<Vec<PathBuf>, UnpackError> {
    let mut zip = open_zip(archive)?;
    let mut written = Vec::new();

    for index in 0..zip.len() {
        if cancel.is_cancelled() {
            return Err(UnpackError::Cancelled);
        }
        let mut entry = zip.by_index(index)?;
        let relative = entry
            .enclosed_name()
            .and_then(|name| safe_relative(&name))
            .ok_or_else(|| UnpackError::UnsafeEntry {
                name: entry.name().to_string(),
            })?;
        let target = dest.join(&relative);

        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(|e| UnpackError::io(&target, e))?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| UnpackError::io(parent, e))?;
            }
            let modified = entry.last_modified().and_then(zip_mtime);
            let mut out = File::create(&target).map_err(|e| UnpackError::io(&target, e))?;
            io::copy(&mut entry, &mut out).map_err(|e| UnpackError::io(&target, e))?;
            if let Some(modified) = modified {
                out.set_modified(modified)
                    .map_err(|e| UnpackError::io(&target, e))?;
            }
            written.push(target);
        }

        progress(UnpackProgress {
            entries_done: index + 1,
            entries_total: total,
            current: relative,
        });
    }
    Ok(written)
}

/// Zip timestamps carry no zone; they are read as UTC, like document dates.
fn zip_mtime(time: zip::DateTime) -> Option<SystemTime> {
    let date = chrono::NaiveDate::from_ymd_opt(
        time.year().into(),
        time.month().into(),
        time.day().into(),
    )?;
    let naive = date.and_hms_opt(
        time.hour().into(),
        time.minute().into(),
        time.second().into(),
    )?;
    Some(naive.and_utc().into())
}

fn extract_tar(
    archive: &Path,
    format: ArchiveFormat,
    dest: &Path,
    total: usize,
    cancel: &CancellationToken,
    progress: &(dyn Fn(UnpackProgress) + Send + Sync),
) -> Result<Vec<PathBuf>, UnpackError> {
    let mut tar = tar::Archive::new(tar_reader(archive, format)?);
    tar.set_overwrite(true);
    let entries = tar.entries().map_err(|e| UnpackError::io(archive, e))?;
    let mut written = Vec::new();

    for (index, entry) in entries.enumerate() {
        if cancel.is_cancelled() {
            return Err(UnpackError::Cancelled);
        }
        let mut entry = entry.map_err(|e| UnpackError::io(archive, e))?;
        let kind = entry.header().entry_type();
        let name = entry
            .path()
            .map_err(|e| UnpackError::io(archive, e))?
            .into_owned();
        let relative = safe_relative(&name).ok_or_else(|| UnpackError::UnsafeEntry {
            name: name.display().to_string(),
        })?;

        if kind.is_block_special() || kind.is_character_special() || kind.is_fifo() {
            tracing::debug!(entry = %relative.display(), "skipping special archive entry");
        } else {
            let unpacked = entry
                .unpack_in(dest)
                .map_err(|e| UnpackError::io(dest.join(&relative), e))?;
            if !unpacked {
                return Err(UnpackError::UnsafeEntry {
                    name: name.display().to_string(),
                });
            }
            if kind.is_file() {
                written.push(dest.join(&relative));
            }
        }

        progress(UnpackProgress {
            entries_done: index + 1,
            entries_total: total,
            current: relative,
        });
    }
    Ok(written)
}
