//! Attachment Extractor Module
//!
//! This module turns a report attachment (file name + raw bytes) into report XML.
//! Plain XML passes through, gzip is decompressed, and for zip archives the first
//! `.xml` member is returned. Everything happens in memory, bounded by the limits
//! in [`Config`]: attachment size, decompressed size, archive entry count,
//! compression ratio, entry name length and path traversal in entry names.
//!
//! Only the first XML member of a zip archive is analyzed. Providers that ship
//! several reports in one archive will have the extra members ignored (logged at
//! debug level).
use std::io::{Cursor, Read};

use flate2::read::MultiGzDecoder;
use zip::ZipArchive;

use crate::config::Config;
use crate::error::{DmarcError, Result};

/// Container formats recognised by file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Xml,
    Gzip,
    Zip,
}

impl AttachmentKind {
    /// Classifies an attachment by its (case-insensitive) extension.
    pub fn from_filename(filename: &str) -> Option<Self> {
        let lower = filename.trim().to_lowercase();
        if lower.ends_with(".xml") {
            Some(AttachmentKind::Xml)
        } else if lower.ends_with(".gz") {
            Some(AttachmentKind::Gzip)
        } else if lower.ends_with(".zip") {
            Some(AttachmentKind::Zip)
        } else {
            None
        }
    }
}

/// Extracts report XML from one attachment.
///
/// Returns `Ok(None)` for attachments that are not reports (unknown extension)
/// and for zip archives without an XML member.
///
/// # Errors
///
/// `CorruptArchive` for unreadable gzip/zip data, `FileTooLarge` when a size
/// limit is hit, and `Format` for suspicious archive entries.
pub fn extract(filename: &str, raw: &[u8], config: &Config) -> Result<Option<Vec<u8>>> {
    let Some(kind) = AttachmentKind::from_filename(filename) else {
        log::debug!("Ignoring non-report attachment {}", filename);
        return Ok(None);
    };
    if raw.len() > config.max_file_size {
        return Err(DmarcError::FileTooLarge(format!(
            "{} is {} bytes, limit is {} bytes",
            filename,
            raw.len(),
            config.max_file_size
        )));
    }
    match kind {
        AttachmentKind::Xml => Ok(Some(raw.to_vec())),
        AttachmentKind::Gzip => gunzip(raw, config).map(Some),
        AttachmentKind::Zip => first_xml_member(raw, config),
    }
}

/// Decompresses every member of a (possibly concatenated) gzip stream.
fn gunzip(raw: &[u8], config: &Config) -> Result<Vec<u8>> {
    let limit = config.max_decompressed_size as u64;
    let mut decoder = MultiGzDecoder::new(raw).take(limit + 1);
    let mut contents = Vec::new();
    decoder
        .read_to_end(&mut contents)
        .map_err(|e| DmarcError::CorruptArchive(format!("invalid gzip stream: {}", e)))?;
    if contents.len() as u64 > limit {
        return Err(DmarcError::FileTooLarge("Decompressed size too large".to_string()));
    }
    Ok(contents)
}

fn first_xml_member(raw: &[u8], config: &Config) -> Result<Option<Vec<u8>>> {
    let mut archive = ZipArchive::new(Cursor::new(raw))
        .map_err(|e| DmarcError::CorruptArchive(format!("invalid zip archive: {}", e)))?;
    if archive.len() > config.max_files_in_zip {
        return Err(DmarcError::Format(format!(
            "Too many files in archive: {}",
            archive.len()
        )));
    }

    let xml_members = archive.file_names().filter(|n| has_xml_extension(n)).count();
    if xml_members > 1 {
        log::debug!(
            "Archive holds {} XML members, only the first is analyzed",
            xml_members
        );
    }

    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .map_err(|e| DmarcError::CorruptArchive(format!("unreadable zip entry: {}", e)))?;
        let name = entry.name().to_string();
        if entry.is_dir() || !has_xml_extension(&name) {
            log::debug!("Skipping archive member {}", name);
            continue;
        }
        if entry.enclosed_name().is_none() || escapes_archive(&name) {
            return Err(DmarcError::Format(format!(
                "Path traversal attempt detected: {}",
                name
            )));
        }
        if name.len() > config.max_filename_length {
            return Err(DmarcError::Format("Filename too long".to_string()));
        }

        let compressed_size = entry.compressed_size();
        let uncompressed_size = entry.size();
        if compressed_size > 0 {
            let compression_ratio = uncompressed_size as f64 / compressed_size as f64;
            if compression_ratio > config.max_compression_ratio {
                return Err(DmarcError::Format(format!(
                    "Suspicious compression ratio: {:.2}",
                    compression_ratio
                )));
            }
        }
        let limit = config.max_decompressed_size as u64;
        if uncompressed_size > limit {
            return Err(DmarcError::FileTooLarge(
                "Total decompressed size too large".to_string(),
            ));
        }

        // The declared size can lie, so the read itself is bounded too.
        let mut contents = Vec::with_capacity(uncompressed_size as usize);
        entry
            .take(limit + 1)
            .read_to_end(&mut contents)
            .map_err(|e| DmarcError::CorruptArchive(format!("{}: {}", name, e)))?;
        if contents.len() as u64 > limit {
            return Err(DmarcError::FileTooLarge(
                "Total decompressed size too large".to_string(),
            ));
        }
        return Ok(Some(contents));
    }

    Ok(None)
}

/// Absolute names and `..` components, with either separator.
fn escapes_archive(name: &str) -> bool {
    name.starts_with(['/', '\\']) || name.split(['/', '\\']).any(|part| part == "..")
}

fn has_xml_extension(name: &str) -> bool {
    name.to_lowercase().ends_with(".xml")
}
