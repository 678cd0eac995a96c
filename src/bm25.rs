use bm25::{Embedder as TermEmbedder, EmbedderBuilder, Scorer, Tokenizer};
use std::collections::HashMap;
use tracing::debug;

use crate::store::StoredChunk;

// Code-tuned parameters: less weight on keyword repetition and on length
// normalization than the textbook defaults.
const K1: f32 = 0.8;
const B: f32 = 0.5;
const DEFAULT_AVGDL: f32 = 100.0;
/// Raw BM25 scores are divided by this and clamped to [0, 1] before being
/// fused with semantic similarity.
const SCORE_NORMALIZER: f32 = 10.0;

/// Lowercased whitespace tokenization; the corpus text for each chunk is
/// its content with name and chunk type appended.
#[derive(Default, Clone)]
pub struct WhitespaceTokenizer;

impl Tokenizer for WhitespaceTokenizer {
    fn tokenize(&self, input_text: &str) -> Vec<String> {
        input_text
            .to_lowercase()
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }
}

pub fn searchable_text(chunk: &StoredChunk) -> String {
    format!("{} {} {}", chunk.content, chunk.name, chunk.chunk_type)
}

/// In-memory BM25 index over the current store contents. Built once per
/// retriever and immutable afterwards; writes to the store require a new
/// retriever (and thus a fresh index).
pub struct KeywordIndex {
    embedder: TermEmbedder<u32, WhitespaceTokenizer>,
    scorer: Scorer<String, u32>,
    doc_count: usize,
}

impl KeywordIndex {
    pub fn build(chunks: &[StoredChunk]) -> Self {
        let tokenizer = WhitespaceTokenizer;
        let texts: Vec<(String, String)> = chunks
            .iter()
            .map(|chunk| (chunk.chunk_id.clone(), searchable_text(chunk)))
            .collect();

        let total_tokens: usize = texts
            .iter()
            .map(|(_, text)| tokenizer.tokenize(text).len())
            .sum();
        let avgdl = if texts.is_empty() {
            DEFAULT_AVGDL
        } else {
            (total_tokens as f32 / texts.len() as f32).max(1.0)
        };

        let embedder = EmbedderBuilder::<u32, WhitespaceTokenizer>::with_avgdl(avgdl)
            .k1(K1)
            .b(B)
            .build();
        let mut scorer = Scorer::new();
        for (chunk_id, text) in &texts {
            scorer.upsert(chunk_id, embedder.embed(text));
        }
        debug!(docs = texts.len(), avgdl, "built keyword index");

        Self {
            embedder,
            scorer,
            doc_count: texts.len(),
        }
    }

    pub fn doc_count(&self) -> usize {
        self.doc_count
    }

    /// Normalized scores in [0, 1] keyed by chunk id. Chunks absent from
    /// the map scored zero.
    pub fn scores(&self, query: &str) -> HashMap<String, f32> {
        let query_embedding = self.embedder.embed(query);
        self.scorer
            .matches(&query_embedding)
            .into_iter()
            .map(|doc| (doc.id, (doc.score / SCORE_NORMALIZER).clamp(0.0, 1.0)))
            .collect()
    }
}
