//! Package archives: a gzip-compressed tar whose first entry is the `PKGINFO`
//! manifest, followed by the payload files relative to the installation root.

use crate::error::{PkgError, Result};
use crate::metadata;
use crate::models::MANIFEST_NAME;
use bap_core::PkgInfo;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tempfile::TempDir;
use walkdir::WalkDir;

/// An archive extracted into a private temporary directory.
///
/// `info.files` lists every extracted payload path. The directory is removed
/// when this value is dropped.
#[derive(Debug)]
pub struct UnpackedPackage {
    pub info: PkgInfo,
    dir: TempDir,
}

impl UnpackedPackage {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn files(&self) -> &[String] {
        self.info.files.as_deref().unwrap_or_default()
    }
}

/// Build an archive from `source_dir` described by the definition file.
///
/// The definition file itself (and the output file, should it live in the
/// source tree) is left out of the payload.
pub fn pack(source_dir: &Path, definition: &Path, output: &Path) -> Result<PkgInfo> {
    let info = metadata::read_definition(definition)?;
    let manifest = metadata::serialize(&info);

    let source_dir = source_dir.canonicalize()?;
    let definition = definition.canonicalize()?;

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(output)?;
    let output = output.canonicalize()?;

    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));

    let mut header = tar::Header::new_gnu();
    header.set_size(manifest.len() as u64);
    header.set_mode(0o644);
    header.set_entry_type(tar::EntryType::Regular);
    builder.append_data(&mut header, MANIFEST_NAME, manifest.as_bytes())?;

    let mut count = 0usize;
    for entry in WalkDir::new(&source_dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        let path = entry.path();
        if !entry.file_type().is_file() {
            if !entry.file_type().is_dir() {
                tracing::warn!("Skipping non-regular file {:?}", path);
            }
            continue;
        }
        if path == definition || path == output {
            continue;
        }
        let rel = path.strip_prefix(&source_dir).unwrap_or(path);
        if rel.to_str().is_none() {
            return Err(PkgError::NonUtf8Path(rel.to_path_buf()));
        }
        if rel == Path::new(MANIFEST_NAME) {
            tracing::warn!("Ignoring {:?}: {} is generated from the definition", path, MANIFEST_NAME);
            continue;
        }
        builder.append_path_with_name(path, rel)?;
        count += 1;
    }

    builder.into_inner()?.finish()?;
    tracing::info!("Packed {} ({} files) into {:?}", info, count, output);
    Ok(info)
}

/// Extract an archive into a fresh temporary directory.
pub fn unpack(archive: &Path) -> Result<UnpackedPackage> {
    let corrupt = |reason: String| PkgError::ArchiveCorrupt {
        path: archive.to_path_buf(),
        reason,
    };

    let file = File::open(archive).map_err(|e| corrupt(e.to_string()))?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    let dir = tempfile::Builder::new().prefix("bap-unpack-").tempdir()?;
    let mut manifest = None;

    for entry in tar.entries().map_err(|e| corrupt(e.to_string()))? {
        let mut entry = entry.map_err(|e| corrupt(e.to_string()))?;
        let raw = entry.path().map_err(|e| corrupt(e.to_string()))?.into_owned();
        let path = normalize_entry_path(&raw).ok_or_else(|| corrupt(format!("unsafe entry path {:?}", raw)))?;
        if path.to_str().is_none() {
            return Err(corrupt(format!("non-UTF-8 entry path {:?}", raw)));
        }

        if path == Path::new(MANIFEST_NAME) {
            let mut text = String::new();
            entry
                .read_to_string(&mut text)
                .map_err(|e| corrupt(format!("unreadable {}: {}", MANIFEST_NAME, e)))?;
            manifest = Some(text);
            continue;
        }

        match entry.header().entry_type() {
            tar::EntryType::Regular | tar::EntryType::Directory => {}
            other => return Err(corrupt(format!("unsupported entry type {:?} for {:?}", other, raw))),
        }
        let unpacked = entry
            .unpack_in(dir.path())
            .map_err(|e| corrupt(e.to_string()))?;
        if !unpacked {
            return Err(corrupt(format!("entry {:?} escapes the archive root", raw)));
        }
    }

    let manifest = manifest.ok_or_else(|| corrupt(format!("missing {} entry", MANIFEST_NAME)))?;
    let files = collect_files(dir.path())?;
    let info = metadata::from_text(&manifest)?.with_files(files);

    tracing::debug!("Unpacked {} into {:?}", info, dir.path());
    Ok(UnpackedPackage { info, dir })
}

/// Every regular file below `root`, as sorted `/`-separated relative paths.
pub fn collect_files(root: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.file_type().is_file() {
            let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
            let rel = relative_string(rel).ok_or_else(|| PkgError::NonUtf8Path(rel.to_path_buf()))?;
            files.push(rel);
        }
    }
    Ok(files)
}

/// `/`-joined normal components of `path`, or `None` if one is not UTF-8.
pub(crate) fn relative_string(path: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        if let Component::Normal(part) = component {
            parts.push(part.to_str()?);
        }
    }
    Some(parts.join("/"))
}

/// Entry path without `.` components, or `None` if it is absolute or climbs.
fn normalize_entry_path(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}
