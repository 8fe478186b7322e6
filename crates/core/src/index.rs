use crate::chunking::{chunk_document, ChunkingConfig};
use crate::embeddings::EmbeddingProvider;
use crate::error::RagError;
use crate::models::{BuildReport, Chunk, ChunkDescriptor, IndexStats, ScoredChunk};
use crate::store::{digest_bytes, normalize_entity, write_atomically, DocumentStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

const VECTOR_MAGIC: &[u8; 4] = b"FRV1";
const HEADER_LEN: usize = 4 + 4 + 8;
/// Hex digits of the vector checksum used in the vector file name.
const GENERATION_LEN: usize = 16;
const LOAD_ATTEMPTS: usize = 4;

/// Immutable flat-L2 index for one entity. Position `i` of `chunks` describes the
/// vector stored at rows `[i * dimensions, (i + 1) * dimensions)`.
#[derive(Debug, Clone)]
pub struct EntityIndex {
    entity: String,
    chunk_size: usize,
    dimensions: usize,
    vectors: Vec<f32>,
    chunks: Vec<ChunkDescriptor>,
    built_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexMetadata {
    entity: String,
    chunk_size: usize,
    dimensions: usize,
    vector_count: usize,
    vectors_file: String,
    vectors_sha256: String,
    built_at: DateTime<Utc>,
    chunks: Vec<ChunkDescriptor>,
}

impl EntityIndex {
    pub fn new(
        entity: &str,
        chunk_size: usize,
        dimensions: usize,
        chunks: Vec<ChunkDescriptor>,
        embeddings: Vec<Vec<f32>>,
    ) -> Result<Self, RagError> {
        if dimensions == 0 {
            return Err(RagError::InvalidArgument(format!(
                "index for {entity} needs a non-zero dimension"
            )));
        }
        if chunks.len() != embeddings.len() {
            return Err(RagError::corrupt(
                entity,
                format!(
                    "embedding count {} doesn't match chunk count {}",
                    embeddings.len(),
                    chunks.len()
                ),
            ));
        }

        let mut vectors = Vec::with_capacity(chunks.len() * dimensions);
        for embedding in &embeddings {
            if embedding.len() != dimensions {
                return Err(RagError::corrupt(
                    entity,
                    format!("embedding dimension {} != {}", embedding.len(), dimensions),
                ));
            }
            vectors.extend_from_slice(embedding);
        }

        Ok(Self {
            entity: entity.to_string(),
            chunk_size,
            dimensions,
            vectors,
            chunks,
            built_at: Utc::now(),
        })
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn chunks(&self) -> &[ChunkDescriptor] {
        &self.chunks
    }

    pub fn vector_count(&self) -> usize {
        self.vectors.len() / self.dimensions.max(1)
    }

    pub fn vector(&self, position: usize) -> Option<&[f32]> {
        let start = position.checked_mul(self.dimensions)?;
        self.vectors.get(start..start + self.dimensions)
    }

    /// Brute-force k-nearest-neighbour search by squared Euclidean distance.
    /// Ties keep index order so repeated queries return identical results.
    pub fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<ScoredChunk>, RagError> {
        if query.len() != self.dimensions {
            return Err(RagError::corrupt(
                &self.entity,
                format!(
                    "index has dimension {} but query vector has {}; rebuild with --reset",
                    self.dimensions,
                    query.len()
                ),
            ));
        }

        let mut scored = self
            .vectors
            .chunks_exact(self.dimensions)
            .enumerate()
            .map(|(position, row)| {
                let distance = row
                    .iter()
                    .zip(query)
                    .map(|(left, right)| (left - right) * (left - right))
                    .sum::<f32>();
                (position, distance)
            })
            .collect::<Vec<_>>();

        scored.sort_by(|left, right| left.1.total_cmp(&right.1).then(left.0.cmp(&right.0)));

        Ok(scored
            .into_iter()
            .take(top_k)
            .map(|(position, distance)| ScoredChunk {
                chunk: self.chunks[position].clone(),
                distance,
            })
            .collect())
    }

    pub fn stats(&self) -> IndexStats {
        let mut chunks_per_source = BTreeMap::new();
        for chunk in &self.chunks {
            *chunks_per_source.entry(chunk.source.clone()).or_insert(0) += 1;
        }
        IndexStats {
            entity: self.entity.clone(),
            chunk_count: self.chunks.len(),
            dimensions: self.dimensions,
            chunk_size: self.chunk_size,
            built_at: self.built_at,
            chunks_per_source,
        }
    }

    fn encode_vectors(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.vectors.len() * 4);
        bytes.extend_from_slice(VECTOR_MAGIC);
        bytes.extend_from_slice(&(self.dimensions as u32).to_le_bytes());
        bytes.extend_from_slice(&(self.chunks.len() as u64).to_le_bytes());
        for value in &self.vectors {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        bytes
    }
}

fn decode_vectors(entity: &str, bytes: &[u8]) -> Result<(usize, usize, Vec<f32>), RagError> {
    if bytes.len() < HEADER_LEN || &bytes[..4] != VECTOR_MAGIC {
        return Err(RagError::corrupt(entity, "vector file header is missing"));
    }

    let mut dims = [0u8; 4];
    dims.copy_from_slice(&bytes[4..8]);
    let mut count = [0u8; 8];
    count.copy_from_slice(&bytes[8..16]);
    let dimensions = u32::from_le_bytes(dims) as usize;
    let count = usize::try_from(u64::from_le_bytes(count))
        .map_err(|_| RagError::corrupt(entity, "vector count overflows"))?;
    if dimensions == 0 {
        return Err(RagError::corrupt(entity, "vector file declares zero dimensions"));
    }

    let body = &bytes[HEADER_LEN..];
    let expected = count
        .checked_mul(dimensions)
        .and_then(|values| values.checked_mul(4))
        .ok_or_else(|| RagError::corrupt(entity, "vector file size overflows"))?;
    if body.len() != expected {
        return Err(RagError::corrupt(
            entity,
            format!("vector file holds {} bytes, header promises {}", body.len(), expected),
        ));
    }

    let vectors = body
        .chunks_exact(4)
        .map(|raw| f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
        .collect();
    Ok((dimensions, count, vectors))
}

/// Owns every entity's index snapshot. Builds for one entity are serialized; queries read
/// the current `Arc` snapshot and never see a half-built index.
///
/// On disk an index is a content-addressed vector file plus `<ENTITY>.meta.json` naming it.
/// Renaming the metadata file into place is the only publish step, so a reader in another
/// process sees either the previous pair or the new one.
pub struct VectorIndexManager {
    store: DocumentStore,
    embeddings: Arc<EmbeddingProvider>,
    chunking: ChunkingConfig,
    snapshots: DashMap<String, Arc<EntityIndex>>,
    build_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl VectorIndexManager {
    pub fn new(
        store: DocumentStore,
        embeddings: Arc<EmbeddingProvider>,
        chunking: ChunkingConfig,
    ) -> Self {
        Self {
            store,
            embeddings,
            chunking,
            snapshots: DashMap::new(),
            build_locks: DashMap::new(),
        }
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    pub fn chunking(&self) -> ChunkingConfig {
        self.chunking
    }

    /// Chunks and embeds every eligible document of `entity` and swaps in the new index.
    /// Without `reset` an existing index (in memory or on disk) is kept as-is.
    pub fn build(&self, entity: &str, reset: bool) -> Result<BuildReport, RagError> {
        let entity = normalize_entity(entity)?;
        if !self.store.entity_dir(&entity)?.is_dir() {
            return Err(RagError::not_found(&entity, "no source documents fetched yet"));
        }
        let lock = self.entity_lock(&entity);
        let _guard = lock.lock().map_err(|_| poisoned("index build"))?;

        if !reset {
            if let Some(existing) = self.cached(&entity) {
                return Ok(skipped_report(&existing));
            }
            if self.store.metadata_path(&entity)?.is_file() {
                let existing = self.load_from_disk(&entity)?;
                return Ok(skipped_report(&existing));
            }
        }

        let documents = self.store.documents(&entity)?;
        if documents.is_empty() {
            return Err(RagError::not_found(&entity, "no source documents fetched yet"));
        }

        let mut chunks: Vec<Chunk> = Vec::new();
        let mut indexed_documents = 0usize;
        for document in &documents {
            match self.store.read_document(&entity, &document.name) {
                Ok(text) => {
                    chunks.extend(chunk_document(&document.name, &text, self.chunking)?);
                    indexed_documents += 1;
                }
                Err(error) => {
                    warn!(entity = %entity, document = %document.name, reason = %error, "skipped document");
                }
            }
        }

        if chunks.is_empty() {
            return Err(RagError::not_found(&entity, "source documents contain no text"));
        }

        let texts = chunks.iter().map(|chunk| chunk.text.as_str()).collect::<Vec<_>>();
        let embeddings = self.embeddings.embed(&texts)?;
        let dimensions = self.embeddings.dimensions()?;
        let descriptors = chunks.iter().map(Chunk::descriptor).collect::<Vec<_>>();

        let index = Arc::new(EntityIndex::new(
            &entity,
            self.chunking.chunk_size,
            dimensions,
            descriptors,
            embeddings,
        )?);
        self.persist(&index)?;
        self.snapshots.insert(entity.clone(), Arc::clone(&index));

        info!(
            entity = %entity,
            documents = indexed_documents,
            chunks = index.len(),
            dimensions,
            "index built"
        );

        Ok(BuildReport {
            entity,
            documents: indexed_documents,
            chunks: index.len(),
            rebuilt: true,
        })
    }

    /// Returns the `top_k` nearest chunks to `query_text`, closest first.
    pub fn query(
        &self,
        entity: &str,
        query_text: &str,
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>, RagError> {
        let index = self.snapshot(entity)?;
        self.search(&index, query_text, top_k)
    }

    /// Embeds `query_text` and searches an index the caller already holds.
    pub fn search(
        &self,
        index: &EntityIndex,
        query_text: &str,
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>, RagError> {
        let query = self
            .embeddings
            .embed(&[query_text])?
            .pop()
            .ok_or_else(|| RagError::upstream("embedding provider", "empty response for query"))?;
        index.search(&query, top_k)
    }

    /// The current index for `entity`, loading it from disk on first access.
    pub fn snapshot(&self, entity: &str) -> Result<Arc<EntityIndex>, RagError> {
        let entity = normalize_entity(entity)?;
        if let Some(index) = self.cached(&entity) {
            return Ok(index);
        }
        if !self.store.metadata_path(&entity)?.is_file() {
            return Err(RagError::IndexNotBuilt(entity));
        }

        let lock = self.entity_lock(&entity);
        let _guard = lock.lock().map_err(|_| poisoned("index build"))?;
        if let Some(index) = self.cached(&entity) {
            return Ok(index);
        }
        self.load_from_disk(&entity)
    }

    pub fn inspect(&self, entity: &str) -> Result<IndexStats, RagError> {
        Ok(self.snapshot(entity)?.stats())
    }

    fn cached(&self, entity: &str) -> Option<Arc<EntityIndex>> {
        self.snapshots.get(entity).map(|entry| Arc::clone(entry.value()))
    }

    fn entity_lock(&self, entity: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.build_locks.entry(entity.to_string()).or_default().value())
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.build_locks.len()
    }

    fn persist(&self, index: &EntityIndex) -> Result<(), RagError> {
        let vectors = index.encode_vectors();
        let checksum = digest_bytes(&vectors);
        let vectors_path = self.store.vectors_path(&index.entity, &checksum[..GENERATION_LEN])?;
        let vectors_file = vectors_path
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .ok_or_else(|| RagError::corrupt(&index.entity, "vector file name is not UTF-8"))?;

        let metadata_path = self.store.metadata_path(&index.entity)?;
        let previous = read_metadata(&index.entity, &metadata_path)
            .ok()
            .map(|metadata| metadata.vectors_file);

        let metadata = IndexMetadata {
            entity: index.entity.clone(),
            chunk_size: index.chunk_size,
            dimensions: index.dimensions,
            vector_count: index.len(),
            vectors_file: vectors_file.clone(),
            vectors_sha256: checksum,
            built_at: index.built_at,
            chunks: index.chunks.clone(),
        };

        write_atomically(&vectors_path, &vectors)?;
        write_atomically(&metadata_path, &serde_json::to_vec_pretty(&metadata)?)?;

        let retired = previous.filter(|previous| {
            previous != &vectors_file && is_plain_file_name(previous) && previous.ends_with(".vectors")
        });
        if let Some(previous) = retired {
            let stale = self.store.entity_dir(&index.entity)?.join(&previous);
            if let Err(error) = fs::remove_file(&stale) {
                debug!(entity = %index.entity, file = %previous, reason = %error, "stale vector file kept");
            }
        }
        Ok(())
    }

    /// Reads the published metadata and the vector file it names. A concurrent rebuild
    /// can retire that vector file between the two reads; the metadata is then re-read.
    fn load_from_disk(&self, entity: &str) -> Result<Arc<EntityIndex>, RagError> {
        let metadata_path = self.store.metadata_path(entity)?;
        let entity_dir = self.store.entity_dir(entity)?;

        let mut attempt = 1;
        let (metadata, bytes) = loop {
            if !metadata_path.is_file() {
                return Err(RagError::IndexNotBuilt(entity.to_string()));
            }
            let metadata = read_metadata(entity, &metadata_path)?;
            if !is_plain_file_name(&metadata.vectors_file) {
                return Err(RagError::corrupt(entity, "metadata names an invalid vector file"));
            }

            let outcome = match fs::read(entity_dir.join(&metadata.vectors_file)) {
                Ok(bytes) if digest_bytes(&bytes) == metadata.vectors_sha256 => Ok(bytes),
                Ok(_) => Err(RagError::corrupt(
                    entity,
                    "vector file checksum does not match metadata",
                )),
                Err(error) => Err(RagError::corrupt(
                    entity,
                    format!("unreadable vector file {}: {error}", metadata.vectors_file),
                )),
            };
            match outcome {
                Ok(bytes) => break (metadata, bytes),
                Err(error) if attempt >= LOAD_ATTEMPTS => return Err(error),
                Err(error) => {
                    debug!(entity = %entity, attempt, reason = %error, "index changed while loading, retrying");
                    attempt += 1;
                }
            }
        };

        let (dimensions, count, vectors) = decode_vectors(entity, &bytes)?;
        if count != metadata.vector_count
            || count != metadata.chunks.len()
            || dimensions != metadata.dimensions
        {
            return Err(RagError::corrupt(
                entity,
                format!(
                    "{} vectors of dimension {} vs {} metadata rows of dimension {}",
                    count,
                    dimensions,
                    metadata.chunks.len(),
                    metadata.dimensions
                ),
            ));
        }

        let index = Arc::new(EntityIndex {
            entity: entity.to_string(),
            chunk_size: metadata.chunk_size,
            dimensions,
            vectors,
            chunks: metadata.chunks,
            built_at: metadata.built_at,
        });

        self.snapshots.insert(entity.to_string(), Arc::clone(&index));
        Ok(index)
    }
}

fn read_metadata(entity: &str, path: &Path) -> Result<IndexMetadata, RagError> {
    serde_json::from_slice(&fs::read(path)?)
        .map_err(|error| RagError::corrupt(entity, format!("unreadable metadata: {error}")))
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['/', '\\']) && name != "." && name != ".."
}

fn skipped_report(index: &EntityIndex) -> BuildReport {
    let documents = index
        .chunks
        .iter()
        .map(|chunk| chunk.source.as_str())
        .collect::<std::collections::BTreeSet<_>>()
        .len();
    BuildReport {
        entity: index.entity.clone(),
        documents,
        chunks: index.len(),
        rebuilt: false,
    }
}

fn poisoned(what: &str) -> RagError {
    RagError::Internal {
        handler: "vector index".to_string(),
        details: format!("{what} lock poisoned"),
    }
}
