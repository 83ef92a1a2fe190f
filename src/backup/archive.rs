//! On-disk formats for backups.
//!
//! A backup archive is a gzip-compressed tar holding `files/<path>` for every
//! captured file, followed by `manifest.json`. An export bundle is a
//! zstd-compressed tar holding the index record (`backup.json`) and the
//! archive itself (`archive.tar.gz`). Bundles compressed with gzip are still
//! accepted on import.

use crate::models::BackupManifest;
use crate::storage::{normalize_rel_path, rel_to_string, sha256_bytes};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

pub const MANIFEST_ENTRY: &str = "manifest.json";
pub const BUNDLE_RECORD: &str = "backup.json";
pub const BUNDLE_ARCHIVE: &str = "archive.tar.gz";
const FILES_PREFIX: &str = "files/";

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];
const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

/// Compression level for export bundles.
const ZSTD_LEVEL: i32 = 3;

fn append_bytes<W: Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    data: &[u8],
) -> io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(Utc::now().timestamp().max(0) as u64);
    header.set_cksum();
    builder.append_data(&mut header, name, data)
}

fn append_json<W: Write, T: Serialize>(
    builder: &mut tar::Builder<W>,
    name: &str,
    value: &T,
) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    append_bytes(builder, name, &json)?;
    Ok(())
}

fn parse_json<T: DeserializeOwned>(name: &str, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| Error::Archive(format!("{} is invalid: {}", name, e)))
}

/// Write the archive for backup `id` to `dest`.
///
/// Files are read once; the checksum in the manifest is taken from the same
/// bytes that go into the archive. The archive is written to a `.partial`
/// file and renamed into place, and the partial file is removed on failure.
pub fn write_archive(
    dest: &Path,
    root: &Path,
    files: &[PathBuf],
    id: &str,
    created_at: DateTime<Utc>,
    metadata: BTreeMap<String, String>,
) -> Result<(BackupManifest, u64)> {
    let partial = dest.with_extension("partial");
    let written = write_archive_to(&partial, root, files, id, created_at, metadata)
        .and_then(|manifest| {
            fs::rename(&partial, dest)?;
            Ok(manifest)
        });
    match written {
        Ok(manifest) => Ok((manifest, fs::metadata(dest)?.len())),
        Err(e) => {
            let _ = fs::remove_file(&partial);
            Err(e)
        }
    }
}

fn write_archive_to(
    path: &Path,
    root: &Path,
    files: &[PathBuf],
    id: &str,
    created_at: DateTime<Utc>,
    metadata: BTreeMap<String, String>,
) -> Result<BackupManifest> {
    let file = File::create(path)?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));

    let mut manifest = BackupManifest {
        id: id.to_string(),
        created_at,
        files: Vec::with_capacity(files.len()),
        checksums: BTreeMap::new(),
        size: 0,
        metadata,
    };

    for rel in files {
        let bytes = fs::read(root.join(rel))?;
        let name = rel_to_string(rel);
        append_bytes(&mut builder, &format!("{}{}", FILES_PREFIX, name), &bytes)?;
        manifest.size += bytes.len() as u64;
        manifest.checksums.insert(name.clone(), sha256_bytes(&bytes));
        manifest.files.push(name);
    }
    append_json(&mut builder, MANIFEST_ENTRY, &manifest)?;

    let file = builder.into_inner()?.finish()?;
    file.sync_all()?;
    Ok(manifest)
}

fn open_archive(path: &Path) -> Result<tar::Archive<GzDecoder<File>>> {
    let file = File::open(path)?;
    Ok(tar::Archive::new(GzDecoder::new(file)))
}

/// What a full read of an archive found.
#[derive(Debug, Default)]
pub struct ArchiveScan {
    pub manifest: Option<BackupManifest>,
    /// sha256 of every `files/` entry
    pub checksums: BTreeMap<String, String>,
}

/// Read every entry of an archive, hashing file contents.
///
/// Any I/O or format error means the archive is unreadable.
pub fn scan_archive(path: &Path) -> Result<ArchiveScan> {
    let mut archive = open_archive(path)?;
    let mut scan = ArchiveScan::default();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes)?;
        if name == MANIFEST_ENTRY {
            scan.manifest = Some(parse_json(MANIFEST_ENTRY, &bytes)?);
        } else if let Some(rel) = name.strip_prefix(FILES_PREFIX) {
            scan.checksums.insert(rel.to_string(), sha256_bytes(&bytes));
        }
    }
    Ok(scan)
}

/// The manifest stored inside an archive.
pub fn read_manifest(path: &Path) -> Result<BackupManifest> {
    let mut archive = open_archive(path)?;
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.to_string_lossy() == MANIFEST_ENTRY {
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes)?;
            return parse_json(MANIFEST_ENTRY, &bytes);
        }
    }
    Err(Error::Archive(format!(
        "{} has no {}",
        path.display(),
        MANIFEST_ENTRY
    )))
}

/// Extract the captured files of an archive under `dest`.
///
/// Entry paths are normalized first, so a crafted archive cannot write
/// outside `dest`.
pub fn extract_files(path: &Path, dest: &Path) -> Result<Vec<String>> {
    let mut archive = open_archive(path)?;
    let mut extracted = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry.path()?.to_string_lossy().into_owned();
        let Some(rel) = name.strip_prefix(FILES_PREFIX) else {
            continue;
        };
        let rel = normalize_rel_path(rel)?;
        let out = dest.join(&rel);
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)?;
        }
        entry.unpack(&out)?;
        extracted.push(rel_to_string(&rel));
    }
    Ok(extracted)
}

/// Write an export bundle.
pub fn write_bundle<T: Serialize>(dest: &Path, record: &T, archive: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(dest)?;
    let encoder = zstd::Encoder::new(file, ZSTD_LEVEL)?;
    let mut builder = tar::Builder::new(encoder);
    append_json(&mut builder, BUNDLE_RECORD, record)?;
    builder.append_path_with_name(archive, BUNDLE_ARCHIVE)?;
    let file = builder.into_inner()?.finish()?;
    file.sync_all()?;
    Ok(())
}

/// Compression detected from a bundle's leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleCompression {
    Zstd,
    Gzip,
}

pub fn sniff_compression(path: &Path) -> Result<BundleCompression> {
    let mut magic = [0u8; 4];
    let mut file = File::open(path)?;
    let n = file.read(&mut magic)?;
    if n >= 4 && magic == ZSTD_MAGIC {
        Ok(BundleCompression::Zstd)
    } else if n >= 2 && magic[..2] == GZIP_MAGIC {
        Ok(BundleCompression::Gzip)
    } else {
        Err(Error::Archive(format!(
            "{} is not a zstd or gzip bundle",
            path.display()
        )))
    }
}

/// Unpack a bundle into `staging`, returning its record and the path of the
/// staged archive.
pub fn read_bundle<T: DeserializeOwned>(path: &Path, staging: &Path) -> Result<(T, PathBuf)> {
    let file = File::open(path)?;
    let reader: Box<dyn Read> = match sniff_compression(path)? {
        BundleCompression::Zstd => Box::new(zstd::Decoder::new(file)?),
        BundleCompression::Gzip => Box::new(GzDecoder::new(file)),
    };

    let mut record = None;
    let staged = staging.join(BUNDLE_ARCHIVE);
    let mut have_archive = false;

    let mut bundle = tar::Archive::new(reader);
    for entry in bundle.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        match name.as_str() {
            BUNDLE_RECORD => {
                let mut bytes = Vec::new();
                entry.read_to_end(&mut bytes)?;
                record = Some(parse_json(BUNDLE_RECORD, &bytes)?);
            }
            BUNDLE_ARCHIVE => {
                entry.unpack(&staged)?;
                have_archive = true;
            }
            _ => {}
        }
    }

    match (record, have_archive) {
        (Some(record), true) => Ok((record, staged)),
        (None, _) => Err(Error::Archive(format!("bundle has no {}", BUNDLE_RECORD))),
        (_, false) => Err(Error::Archive(format!("bundle has no {}", BUNDLE_ARCHIVE))),
    }
}
