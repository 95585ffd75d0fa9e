// SPDX-License-Identifier: MIT OR Apache-2.0
//! Zip archives bundling a graph with the sub-graphs it instances.
//!
//! An archive holds one `.mtg` graph definition at any depth plus a
//! `resources/` directory of nested archives. Archives live in memory so a
//! nested archive can be opened straight from its parent's entry bytes.

use crate::error::LoadError;
use std::fmt;
use std::io::{Cursor, Read, Write};
use std::path::Path;
use std::sync::Arc;
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

type Reader = ZipArchive<Cursor<Arc<[u8]>>>;

/// In-memory graph archive
pub struct MtgArchive {
    name: String,
    bytes: Arc<[u8]>,
    reader: Option<Reader>,
}

impl MtgArchive {
    /// Wrap archive bytes; call [`MtgArchive::open`] before reading entries
    pub fn from_bytes(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
            reader: None,
        }
    }

    /// Read an archive file
    pub fn from_path(path: &Path) -> Result<Self, LoadError> {
        let bytes = std::fs::read(path)?;
        Ok(Self::from_bytes(path.to_string_lossy(), bytes))
    }

    /// Build archive bytes from `(entry path, contents)` pairs
    pub fn pack(entries: &[(&str, &[u8])]) -> Result<Vec<u8>, LoadError> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (path, contents) in entries {
            writer.start_file(*path, SimpleFileOptions::default())?;
            writer.write_all(contents)?;
        }
        Ok(writer.finish()?.into_inner())
    }

    /// Name or path the archive was read from
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw archive bytes
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Whether entries can be read
    pub fn is_open(&self) -> bool {
        self.reader.is_some()
    }

    /// Parse the central directory
    pub fn open(&mut self) -> Result<(), LoadError> {
        if self.reader.is_none() {
            self.reader = Some(ZipArchive::new(Cursor::new(self.bytes.clone()))?);
        }
        Ok(())
    }

    /// Drop the parsed directory
    pub fn close(&mut self) {
        self.reader = None;
    }

    fn reader(&self) -> Result<&Reader, LoadError> {
        self.reader
            .as_ref()
            .ok_or_else(|| LoadError::ArchiveClosed(self.name.clone()))
    }

    /// Entry paths, in archive order
    pub fn available_files(&self) -> Result<Vec<String>, LoadError> {
        Ok(self.reader()?.file_names().map(str::to_string).collect())
    }

    /// Entry whose path equals `path`, ignoring separator style
    pub fn find_exact(&self, path: &str) -> Result<Option<String>, LoadError> {
        let wanted = normalize(path);
        Ok(self
            .reader()?
            .file_names()
            .find(|name| normalize(name) == wanted)
            .map(str::to_string))
    }

    /// First entry whose path ends with `suffix`, case-insensitively
    pub fn find_by_suffix(&self, suffix: &str) -> Result<Option<String>, LoadError> {
        let suffix = suffix.to_ascii_lowercase();
        Ok(self
            .reader()?
            .file_names()
            .find(|name| name.to_ascii_lowercase().ends_with(&suffix))
            .map(str::to_string))
    }

    /// Contents of an entry
    pub fn extract_binary(&mut self, path: &str) -> Result<Vec<u8>, LoadError> {
        let name = self.name.clone();
        let reader = self.reader.as_mut().ok_or(LoadError::ArchiveClosed(name))?;
        let mut file = match reader.by_name(path) {
            Ok(file) => file,
            Err(zip::result::ZipError::FileNotFound) => return Err(LoadError::MissingEntry(path.to_string())),
            Err(e) => return Err(e.into()),
        };
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    /// Contents of an entry as UTF-8 text
    pub fn extract_text(&mut self, path: &str) -> Result<String, LoadError> {
        let bytes = self.extract_binary(path)?;
        String::from_utf8(bytes).map_err(|_| LoadError::InvalidText(path.to_string()))
    }
}

fn normalize(path: &str) -> String {
    path.replace('\\', "/").trim_start_matches("./").to_string()
}

impl Clone for MtgArchive {
    /// Clones share the bytes and start closed
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            bytes: self.bytes.clone(),
            reader: None,
        }
    }
}

impl fmt::Debug for MtgArchive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MtgArchive")
            .field("name", &self.name)
            .field("len", &self.bytes.len())
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MtgArchive {
        let bytes = MtgArchive::pack(&[
            ("graphs/main.mtg", b"{}".as_slice()),
            ("resources/sub.mtga", b"nested".as_slice()),
        ])
        .unwrap();
        MtgArchive::from_bytes("sample.mtga", bytes)
    }

    #[test]
    fn test_closed_archive_rejects_reads() {
        let mut archive = sample();
        assert!(matches!(archive.available_files(), Err(LoadError::ArchiveClosed(_))));
        assert!(archive.extract_text("graphs/main.mtg").is_err());
    }

    #[test]
    fn test_lookup_and_extract() {
        let mut archive = sample();
        archive.open().unwrap();
        assert_eq!(archive.available_files().unwrap().len(), 2);
        assert_eq!(archive.find_by_suffix(".MTG").unwrap().as_deref(), Some("graphs/main.mtg"));
        assert_eq!(
            archive.find_exact("resources\\sub.mtga").unwrap().as_deref(),
            Some("resources/sub.mtga")
        );
        assert_eq!(archive.extract_text("graphs/main.mtg").unwrap(), "{}");
        assert_eq!(archive.extract_binary("resources/sub.mtga").unwrap(), b"nested");
        assert!(matches!(archive.extract_binary("missing"), Err(LoadError::MissingEntry(_))));

        archive.close();
        assert!(!archive.is_open());
    }

    #[test]
    fn test_clone_starts_closed() {
        let mut archive = sample();
        archive.open().unwrap();
        let copy = archive.clone();
        assert!(!copy.is_open());
        assert_eq!(copy.bytes(), archive.bytes());
    }

    #[test]
    fn test_garbage_is_not_an_archive() {
        let mut archive = MtgArchive::from_bytes("bad", b"not a zip".to_vec());
        assert!(matches!(archive.open(), Err(LoadError::Archive(_))));
    }
}
