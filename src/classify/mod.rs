// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Content classification for downloaded files.
//!
//! The mirror does not reliably tell us what it served, and the format the
//! search page advertised is only a hint. The classifier looks at the first
//! few kilobytes of the finished temporary file and decides the real kind.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Number of leading bytes inspected by [`MagicClassifier`].
pub const SNIFF_BYTES: usize = 4096;

/// Known ebook container kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Epub,
    Mobi,
    Azw3,
    Pdf,
    Txt,
    /// Anything we could not identify. Stored with the `bin` extension.
    Unknown,
}

impl ContentKind {
    /// File extension used when storing a file of this kind.
    pub fn extension(&self) -> &'static str {
        match self {
            ContentKind::Epub => "epub",
            ContentKind::Mobi => "mobi",
            ContentKind::Azw3 => "azw3",
            ContentKind::Pdf => "pdf",
            ContentKind::Txt => "txt",
            ContentKind::Unknown => "bin",
        }
    }

    /// MIME type served for files of this kind.
    pub fn mime_type(&self) -> &'static str {
        match self {
            ContentKind::Epub => "application/epub+zip",
            ContentKind::Mobi => "application/x-mobipocket-ebook",
            ContentKind::Azw3 => "application/vnd.amazon.ebook",
            ContentKind::Pdf => "application/pdf",
            ContentKind::Txt => "text/plain; charset=utf-8",
            ContentKind::Unknown => "application/octet-stream",
        }
    }

    /// Map a stored file's extension back to a kind.
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "epub" => ContentKind::Epub,
            "mobi" => ContentKind::Mobi,
            "azw3" => ContentKind::Azw3,
            "pdf" => ContentKind::Pdf,
            "txt" => ContentKind::Txt,
            _ => ContentKind::Unknown,
        }
    }
}

impl std::fmt::Display for ContentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

/// Inspects a file on disk and reports its true kind.
pub trait ContentClassifier: Send + Sync {
    fn classify(&self, path: &Path) -> io::Result<ContentKind>;
}

/// Magic-byte classifier over the leading [`SNIFF_BYTES`] of a file.
#[derive(Debug, Default, Clone, Copy)]
pub struct MagicClassifier;

impl ContentClassifier for MagicClassifier {
    fn classify(&self, path: &Path) -> io::Result<ContentKind> {
        let mut header = Vec::with_capacity(SNIFF_BYTES);
        File::open(path)?
            .take(SNIFF_BYTES as u64)
            .read_to_end(&mut header)?;
        Ok(detect_kind(&header))
    }
}

/// Detect the content kind from a file's leading bytes.
pub fn detect_kind(header: &[u8]) -> ContentKind {
    if header.starts_with(b"%PDF-") {
        return ContentKind::Pdf;
    }

    // EPUB: a zip whose first entry is an uncompressed "mimetype" file.
    if header.starts_with(b"PK\x03\x04")
        && header.len() >= 58
        && &header[30..58] == b"mimetypeapplication/epub+zip"
    {
        return ContentKind::Epub;
    }

    // Palm database with type/creator "BOOKMOBI" at offset 60.
    if header.len() >= 68 && &header[60..68] == b"BOOKMOBI" {
        return match mobi_version(header) {
            Some(version) if version >= 8 => ContentKind::Azw3,
            _ => ContentKind::Mobi,
        };
    }

    if looks_like_text(header) {
        return ContentKind::Txt;
    }

    ContentKind::Unknown
}

/// Read the MOBI header's file version from record 0, if it fits the header.
fn mobi_version(header: &[u8]) -> Option<u32> {
    // Offset of record 0 is the first entry of the record list at 78.
    let record0 = read_u32_be(header, 78)? as usize;
    if header.get(record0 + 16..record0 + 20)? != b"MOBI" {
        return None;
    }
    read_u32_be(header, record0 + 36)
}

fn read_u32_be(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes: [u8; 4] = buf.get(offset..offset + 4)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

fn looks_like_text(header: &[u8]) -> bool {
    if header.is_empty() || header.contains(&0) {
        return false;
    }
    let text = match std::str::from_utf8(header) {
        Ok(text) => text,
        // The sniff window may cut a multi-byte char in half.
        Err(e) if e.error_len().is_none() && header.len() - e.valid_up_to() < 4 => {
            match std::str::from_utf8(&header[..e.valid_up_to()]) {
                Ok(text) => text,
                Err(_) => return false,
            }
        }
        Err(_) => return false,
    };
    text.chars()
        .all(|c| !c.is_control() || c == '\n' || c == '\r' || c == '\t' || c == '\x0c')
}

/// Pick the extension a finished download is stored under.
///
/// The caller's hint is honored only when detection came back unknown or
/// agrees with it. A confidently detected kind always wins over a mismatched
/// hint.
pub fn resolve_extension(detected: ContentKind, preferred: Option<&str>) -> String {
    match preferred {
        Some(hint) if detected == ContentKind::Unknown || hint == detected.extension() => {
            hint.to_string()
        }
        _ => detected.extension().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn epub_header() -> Vec<u8> {
        let mut header = b"PK\x03\x04".to_vec();
        header.resize(30, 0);
        header.extend_from_slice(b"mimetypeapplication/epub+zip");
        header.extend_from_slice(b"PK\x03\x04 more zip entries");
        header
    }

    fn mobi_header(version: u32) -> Vec<u8> {
        let mut header = vec![0u8; 400];
        header[60..68].copy_from_slice(b"BOOKMOBI");
        let record0: u32 = 96;
        header[78..82].copy_from_slice(&record0.to_be_bytes());
        let r0 = record0 as usize;
        header[r0 + 16..r0 + 20].copy_from_slice(b"MOBI");
        header[r0 + 36..r0 + 40].copy_from_slice(&version.to_be_bytes());
        header
    }

    #[test]
    fn test_detect_pdf() {
        assert_eq!(detect_kind(b"%PDF-1.7\n%\xe2\xe3\xcf\xd3"), ContentKind::Pdf);
    }

    #[test]
    fn test_detect_epub() {
        assert_eq!(detect_kind(&epub_header()), ContentKind::Epub);
    }

    #[test]
    fn test_plain_zip_is_not_epub() {
        let mut header = b"PK\x03\x04".to_vec();
        header.resize(64, 0);
        assert_eq!(detect_kind(&header), ContentKind::Unknown);
    }

    #[test]
    fn test_detect_mobi_and_azw3() {
        assert_eq!(detect_kind(&mobi_header(6)), ContentKind::Mobi);
        assert_eq!(detect_kind(&mobi_header(8)), ContentKind::Azw3);
    }

    #[test]
    fn test_detect_text() {
        assert_eq!(detect_kind(b"Chapter 1\n\nIt was a dark night."), ContentKind::Txt);
        assert_eq!(detect_kind("Kapitel 1: Größe\n".as_bytes()), ContentKind::Txt);
    }

    #[test]
    fn test_detect_text_with_cut_multibyte_char() {
        let mut header = b"abc ".to_vec();
        header.extend_from_slice(&"é".as_bytes()[..1]);
        assert_eq!(detect_kind(&header), ContentKind::Txt);
    }

    #[test]
    fn test_detect_unknown() {
        assert_eq!(detect_kind(&[]), ContentKind::Unknown);
        assert_eq!(detect_kind(&[0x00, 0x01, 0x02, 0xff]), ContentKind::Unknown);
    }

    #[test]
    fn test_detected_kind_wins_over_mismatched_hint() {
        assert_eq!(resolve_extension(ContentKind::Epub, Some("pdf")), "epub");
    }

    #[test]
    fn test_hint_used_when_unknown_or_matching() {
        assert_eq!(resolve_extension(ContentKind::Unknown, Some("azw3")), "azw3");
        assert_eq!(resolve_extension(ContentKind::Pdf, Some("pdf")), "pdf");
        assert_eq!(resolve_extension(ContentKind::Unknown, None), "bin");
        assert_eq!(resolve_extension(ContentKind::Mobi, None), "mobi");
    }

    #[test]
    fn test_magic_classifier_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("temp_abc");
        std::fs::write(&path, epub_header()).unwrap();
        assert_eq!(MagicClassifier.classify(&path).unwrap(), ContentKind::Epub);
    }

    #[test]
    fn test_extension_round_trip() {
        assert_eq!(ContentKind::from_extension("EPUB"), ContentKind::Epub);
        assert_eq!(ContentKind::from_extension("bin"), ContentKind::Unknown);
    }
}
