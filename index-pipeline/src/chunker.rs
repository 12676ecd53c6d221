use text_splitter::{ChunkConfig, TextSplitter};

use common::error::AppError;

/// Splits a record body into overlapping, bounded-length chunks. Sizes are
/// character-based; both bounds come from configuration.
pub fn split_chunks(
    text: &str,
    chunk_chars: usize,
    overlap_chars: usize,
) -> Result<Vec<String>, AppError> {
    if chunk_chars == 0 {
        return Err(AppError::Validation(
            "chunk size must be greater than zero".into(),
        ));
    }
    if overlap_chars >= chunk_chars {
        return Err(AppError::Validation(format!(
            "chunk overlap of {overlap_chars} must be smaller than the chunk size of {chunk_chars}"
        )));
    }

    let chunk_config = ChunkConfig::new(chunk_chars)
        .with_overlap(overlap_chars)
        .map_err(|e| AppError::Validation(format!("invalid chunk overlap: {e}")))?;
    let splitter = TextSplitter::new(chunk_config);

    Ok(splitter.chunks(text).map(str::to_owned).collect())
}
