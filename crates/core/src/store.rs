use crate::error::RagError;
use crate::models::{DocumentHandle, FilingRecord};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const MANIFEST_FILE: &str = "filings.json";

/// Filesystem layout keyed by entity symbol:
///
/// ```text
/// <root>/<ENTITY>/<documents...>
/// <root>/<ENTITY>/filings.json
/// <root>/<ENTITY>/<ENTITY>.<sha16>.vectors
/// <root>/<ENTITY>/<ENTITY>.meta.json
/// ```
#[derive(Debug, Clone)]
pub struct DocumentStore {
    root: PathBuf,
    extensions: Vec<String>,
}

impl DocumentStore {
    pub fn new(root: impl Into<PathBuf>, extensions: Vec<String>) -> Self {
        Self {
            root: root.into(),
            extensions,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entity_dir(&self, entity: &str) -> Result<PathBuf, RagError> {
        Ok(self.root.join(normalize_entity(entity)?))
    }

    /// Vector files are content addressed: `generation` is a prefix of their SHA-256.
    pub fn vectors_path(&self, entity: &str, generation: &str) -> Result<PathBuf, RagError> {
        let entity = normalize_entity(entity)?;
        Ok(self
            .root
            .join(&entity)
            .join(format!("{entity}.{generation}.vectors")))
    }

    pub fn metadata_path(&self, entity: &str) -> Result<PathBuf, RagError> {
        let entity = normalize_entity(entity)?;
        Ok(self.root.join(&entity).join(format!("{entity}.meta.json")))
    }

    /// Entities that have a namespace directory on disk.
    pub fn entities(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut entities = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_ok_and(|kind| kind.is_dir()))
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .filter(|name| normalize_entity(name).is_ok_and(|normalized| &normalized == name))
            .collect::<Vec<_>>();
        entities.sort_unstable();
        entities
    }

    /// Text-bearing documents for `entity`, sorted by their name relative to the entity dir.
    pub fn documents(&self, entity: &str) -> Result<Vec<DocumentHandle>, RagError> {
        let entity = normalize_entity(entity)?;
        let dir = self.root.join(&entity);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut documents = Vec::new();
        for entry in WalkDir::new(&dir).into_iter().filter_map(|item| item.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }

            let eligible = entry
                .path()
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| {
                    self.extensions
                        .iter()
                        .any(|allowed| allowed.eq_ignore_ascii_case(ext))
                });
            if !eligible {
                continue;
            }

            let Ok(relative) = entry.path().strip_prefix(&dir) else {
                continue;
            };
            let name = relative
                .components()
                .map(|part| part.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            documents.push(DocumentHandle {
                entity: entity.clone(),
                name,
                path: entry.path().to_path_buf(),
            });
        }

        documents.sort_unstable_by(|left, right| left.name.cmp(&right.name));
        Ok(documents)
    }

    pub fn document_path(&self, entity: &str, name: &str) -> Result<PathBuf, RagError> {
        if name.is_empty()
            || name.starts_with('/')
            || name.split('/').any(|part| part == ".." || part.is_empty())
        {
            return Err(RagError::InvalidArgument(format!(
                "invalid document name {name:?} for {entity}"
            )));
        }
        Ok(self.entity_dir(entity)?.join(name))
    }

    pub fn contains(&self, entity: &str, name: &str) -> Result<bool, RagError> {
        Ok(self.document_path(entity, name)?.is_file())
    }

    pub fn read_document(&self, entity: &str, name: &str) -> Result<String, RagError> {
        let path = self.document_path(entity, name)?;
        let bytes = fs::read(&path)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn write_document(
        &self,
        entity: &str,
        name: &str,
        contents: &[u8],
    ) -> Result<DocumentHandle, RagError> {
        let path = self.document_path(entity, name)?;
        write_atomically(&path, contents)?;
        Ok(DocumentHandle {
            entity: normalize_entity(entity)?,
            name: name.to_string(),
            path,
        })
    }

    pub fn manifest(&self, entity: &str) -> Result<Vec<FilingRecord>, RagError> {
        let path = self.entity_dir(entity)?.join(MANIFEST_FILE);
        if !path.is_file() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Inserts or replaces records by accession number and persists the manifest.
    pub fn record_filings(&self, entity: &str, records: &[FilingRecord]) -> Result<(), RagError> {
        let mut manifest = self.manifest(entity)?;
        for record in records {
            match manifest
                .iter_mut()
                .find(|existing| existing.accession == record.accession)
            {
                Some(existing) => *existing = record.clone(),
                None => manifest.push(record.clone()),
            }
        }
        manifest.sort_by(|left, right| right.filing_date.cmp(&left.filing_date));

        let path = self.entity_dir(entity)?.join(MANIFEST_FILE);
        write_atomically(&path, &serde_json::to_vec_pretty(&manifest)?)
    }
}

/// Uppercases and validates an entity symbol so it is safe to use as a directory name.
pub fn normalize_entity(entity: &str) -> Result<String, RagError> {
    let normalized = entity.trim().to_ascii_uppercase();
    let valid = !normalized.is_empty()
        && normalized.len() <= 10
        && normalized
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '.' || ch == '-')
        && !normalized.starts_with('.');

    if valid {
        Ok(normalized)
    } else {
        Err(RagError::InvalidArgument(format!(
            "invalid entity symbol {entity:?}"
        )))
    }
}

pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Writes to a sibling temp file and renames it over `path`.
pub fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), RagError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| RagError::InvalidArgument(format!("path has no file name: {}", path.display())))?;
    let temp_path = path.with_file_name(format!(".{file_name}.tmp"));

    fs::write(&temp_path, contents)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}
