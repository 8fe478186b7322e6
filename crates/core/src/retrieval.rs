use crate::chunking::chunk_span;
use crate::error::RagError;
use crate::index::VectorIndexManager;
use crate::models::Snippet;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

pub struct RetrievalService {
    indexes: Arc<VectorIndexManager>,
}

impl RetrievalService {
    pub fn new(indexes: Arc<VectorIndexManager>) -> Self {
        Self { indexes }
    }

    pub fn indexes(&self) -> &VectorIndexManager {
        &self.indexes
    }

    /// Nearest snippets for `question`, closest first. An entity whose index was never
    /// built gets one built on the spot. Hits whose source document has disappeared
    /// since indexing are dropped instead of failing the whole call.
    pub fn retrieve(
        &self,
        entity: &str,
        question: &str,
        top_k: usize,
    ) -> Result<Vec<Snippet>, RagError> {
        let index = match self.indexes.snapshot(entity) {
            Err(RagError::IndexNotBuilt(_)) => {
                info!(entity = %entity, "index missing, building before retrieval");
                self.indexes.build(entity, false)?;
                self.indexes.snapshot(entity)?
            }
            other => other?,
        };
        // Offsets are only meaningful with the chunk size this snapshot was built with.
        let chunk_size = index.chunk_size();
        let hits = self.indexes.search(&index, question, top_k)?;

        let mut sources: HashMap<String, Option<String>> = HashMap::new();
        let mut snippets = Vec::with_capacity(hits.len());

        for hit in hits {
            let text = sources
                .entry(hit.chunk.source.clone())
                .or_insert_with(|| {
                    match self.indexes.store().read_document(entity, &hit.chunk.source) {
                        Ok(text) => Some(text),
                        Err(error) => {
                            warn!(
                                entity = %entity,
                                source = %hit.chunk.source,
                                reason = %error,
                                "source document unavailable, dropping hit"
                            );
                            None
                        }
                    }
                });

            let Some(text) = text.as_deref() else {
                continue;
            };
            let Some(span) = chunk_span(text, hit.chunk.offset_index, chunk_size) else {
                warn!(
                    entity = %entity,
                    source = %hit.chunk.source,
                    offset_index = hit.chunk.offset_index,
                    "chunk lies past the end of its source, dropping hit"
                );
                continue;
            };

            snippets.push(Snippet {
                source: hit.chunk.source,
                offset_index: hit.chunk.offset_index,
                distance: hit.distance,
                text: span.to_string(),
            });
        }

        Ok(snippets)
    }
}
