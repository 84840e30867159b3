//! Splits documents into bounded, ordered passages.
//!
//! Sizes are counted in chars. A cut prefers, in order, a paragraph break,
//! a line break, a sentence end, then any whitespace, searching backwards
//! from the size limit and only accepting boundaries past the first
//! quarter of the window. The boundary's whitespace stays with the earlier
//! chunk. With no boundary in reach the chunk is cut hard at the limit.

use serde::{Deserialize, Serialize};

use recall_core::config::ChunkingConfig;
use recall_core::error::{RecallError, Result};

/// One passage produced by [`Chunker::chunk`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChunk {
    pub ordinal: u32,
    /// Overlap prefix followed by the chunk body.
    pub text: String,
    /// Leading chars of `text` repeated from the previous chunk.
    pub overlap_chars: usize,
}

impl TextChunk {
    /// The chunk without its overlap prefix.
    pub fn body(&self) -> &str {
        match self.text.char_indices().nth(self.overlap_chars) {
            Some((offset, _)) => &self.text[offset..],
            None => "",
        }
    }

    pub fn char_count(&self) -> usize {
        self.text.chars().count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunker {
    target_size: usize,
    overlap: usize,
}

impl Chunker {
    pub fn new(target_size: usize, overlap: usize) -> Result<Self> {
        if target_size == 0 {
            return Err(RecallError::InvalidInput(
                "chunk target_size must be greater than 0".to_string(),
            ));
        }
        if overlap >= target_size {
            return Err(RecallError::InvalidInput(format!(
                "chunk overlap ({}) must be smaller than target_size ({})",
                overlap, target_size
            )));
        }
        Ok(Self {
            target_size,
            overlap,
        })
    }

    pub fn from_config(config: &ChunkingConfig) -> Result<Self> {
        Self::new(config.target_size, config.overlap)
    }

    pub fn target_size(&self) -> usize {
        self.target_size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Split `text` into chunks of at most `target_size` chars.
    ///
    /// An empty text yields no chunks. Stripping `overlap_chars` from every
    /// chunk and concatenating the rest reproduces `text` exactly.
    pub fn chunk(&self, text: &str) -> Vec<TextChunk> {
        let chars: Vec<char> = text.chars().collect();
        let mut chunks = Vec::new();
        let mut start = 0;
        let mut previous: Option<(usize, usize)> = None;

        while start < chars.len() {
            let overlap_chars = previous
                .map(|(from, to)| self.overlap.min(to - from))
                .unwrap_or(0);
            let limit = self.target_size - overlap_chars;
            let remaining = chars.len() - start;

            let end = if remaining <= limit {
                chars.len()
            } else {
                start + find_cut(&chars[start..start + limit])
            };

            let mut chunk_text = String::new();
            if let Some((_, prev_end)) = previous {
                chunk_text.extend(&chars[prev_end - overlap_chars..prev_end]);
            }
            chunk_text.extend(&chars[start..end]);

            chunks.push(TextChunk {
                ordinal: chunks.len() as u32,
                text: chunk_text,
                overlap_chars,
            });
            previous = Some((start, end));
            start = end;
        }

        chunks
    }
}

impl Default for Chunker {
    fn default() -> Self {
        let config = ChunkingConfig::default();
        Self {
            target_size: config.target_size,
            overlap: config.overlap,
        }
    }
}

/// Length of the chunk body to take from `window`: the end of the best
/// boundary past the first quarter, or the whole window.
fn find_cut(window: &[char]) -> usize {
    let limit = window.len();
    let floor = limit / 4;
    let candidates = || (floor.max(1) + 1..=limit).rev();

    let is_paragraph = |p: usize| p >= 2 && window[p - 1] == '\n' && window[p - 2] == '\n';
    let is_line = |p: usize| window[p - 1] == '\n';
    let is_sentence = |p: usize| {
        p >= 2 && window[p - 1].is_whitespace() && matches!(window[p - 2], '.' | '!' | '?')
    };
    let is_space = |p: usize| window[p - 1].is_whitespace();

    candidates()
        .find(|&p| is_paragraph(p))
        .or_else(|| candidates().find(|&p| is_line(p)))
        .or_else(|| candidates().find(|&p| is_sentence(p)))
        .or_else(|| candidates().find(|&p| is_space(p)))
        .unwrap_or(limit)
}
