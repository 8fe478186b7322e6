use crate::config::RagConfig;
use crate::error::RagError;
use crate::models::Chunk;

#[derive(Debug, Clone, Copy)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
}

impl From<&RagConfig> for ChunkingConfig {
    fn from(value: &RagConfig) -> Self {
        Self {
            chunk_size: value.chunk_size,
        }
    }
}

impl ChunkingConfig {
    pub fn new(chunk_size: usize) -> Result<Self, RagError> {
        if chunk_size == 0 {
            return Err(RagError::InvalidChunkConfig(
                "chunk_size must be greater than zero".to_string(),
            ));
        }
        Ok(Self { chunk_size })
    }
}

/// Splits `text` into consecutive, non-overlapping windows of `chunk_size` characters.
///
/// Offsets count Unicode scalar values, not bytes, so every window is valid UTF-8 and
/// `chunk_span(text, offset_index, chunk_size)` reproduces exactly the same slice later.
pub fn chunk_document(
    source: &str,
    text: &str,
    config: ChunkingConfig,
) -> Result<Vec<Chunk>, RagError> {
    if config.chunk_size == 0 {
        return Err(RagError::InvalidChunkConfig(
            "chunk_size must be greater than zero".to_string(),
        ));
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut count = 0usize;
    let mut cursor = 0u64;

    for (byte_index, _) in text.char_indices() {
        if count == config.chunk_size {
            chunks.push(Chunk {
                source: source.to_string(),
                offset_index: cursor,
                text: text[start..byte_index].to_string(),
            });
            cursor = cursor.saturating_add(1);
            start = byte_index;
            count = 0;
        }
        count += 1;
    }

    if start < text.len() {
        chunks.push(Chunk {
            source: source.to_string(),
            offset_index: cursor,
            text: text[start..].to_string(),
        });
    }

    Ok(chunks)
}

/// Re-derives the window `[offset_index * chunk_size, offset_index * chunk_size + chunk_size)`
/// from the source text. Returns `None` when the window starts past the end of the text.
pub fn chunk_span(text: &str, offset_index: u64, chunk_size: usize) -> Option<&str> {
    if chunk_size == 0 {
        return None;
    }
    let skip = usize::try_from(offset_index).ok()?.checked_mul(chunk_size)?;

    let mut boundaries = text
        .char_indices()
        .map(|(index, _)| index)
        .chain(std::iter::once(text.len()))
        .skip(skip);

    let start = boundaries.next()?;
    if start == text.len() {
        return None;
    }
    let end = boundaries.nth(chunk_size - 1).unwrap_or(text.len());
    Some(&text[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(size: usize) -> ChunkingConfig {
        ChunkingConfig::new(size).expect("non-zero chunk size")
    }

    #[test]
    fn empty_document_has_no_chunks() {
        let chunks = chunk_document("doc", "", config(10)).unwrap();
        assert!(chunks.is_empty());
    }

    #[test]
    fn chunks_cover_document_exactly() {
        let text = "Net sales rose 5% year over year; services hit a record.".repeat(7);
        for size in [1, 3, 10, 64, 1000] {
            let chunks = chunk_document("doc", &text, config(size)).unwrap();
            let expected = (text.chars().count() + size - 1) / size;
            assert_eq!(chunks.len(), expected, "chunk size {size}");

            let rebuilt: String = chunks.iter().map(|chunk| chunk.text.as_str()).collect();
            assert_eq!(rebuilt, text);

            for (position, chunk) in chunks.iter().enumerate() {
                assert_eq!(chunk.offset_index, position as u64);
            }
        }
    }

    #[test]
    fn multibyte_text_is_split_on_char_boundaries() {
        let text = "€uro ünïcode — fine";
        let chunks = chunk_document("doc", text, config(4)).unwrap();
        let rebuilt: String = chunks.iter().map(|chunk| chunk.text.as_str()).collect();
        assert_eq!(rebuilt, text);
        assert_eq!(chunks[0].text, "€uro");
    }

    #[test]
    fn span_matches_chunk_text() {
        let text = "abcdefghij€klmnopq";
        let chunks = chunk_document("doc", text, config(4)).unwrap();
        for chunk in &chunks {
            assert_eq!(chunk_span(text, chunk.offset_index, 4), Some(chunk.text.as_str()));
        }
        assert_eq!(chunk_span(text, chunks.len() as u64, 4), None);
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        assert!(ChunkingConfig::new(0).is_err());
        assert!(chunk_document("doc", "abc", ChunkingConfig { chunk_size: 0 }).is_err());
    }
}
