use anyhow::{anyhow, Context, Result};
use lru::LruCache;
use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tracing::debug;

use crate::bm25::KeywordIndex;
use crate::config::RagConfig;
use crate::embeddings::Embedder;
use crate::store::{stats_of, SearchFilters, StoreStats, StoredChunk, VectorStore};
use crate::RAG_DIR_NAME;

const QUERY_CACHE_SIZE: usize = 1000;
/// Candidate pool size relative to top_k, leaving room for filtering,
/// re-ranking, and the diversity pass.
const CANDIDATE_MULTIPLIER: usize = 4;

const IMPORTANT_FILE_PATTERNS: &[&str] = &[
    "readme",
    "main.",
    "index.",
    "__init__",
    "config",
    "setup",
    "install",
    "getting",
    "started",
    "docs/",
    "documentation",
    "guide",
    "tutorial",
    "example",
];

#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub text: String,
    pub top_k: usize,
    pub chunk_types: Option<Vec<String>>,
    pub languages: Option<Vec<String>>,
    pub file_glob: Option<String>,
    pub semantic_weight: f32,
    pub bm25_weight: f32,
    pub include_context: bool,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            top_k: 10,
            chunk_types: None,
            languages: None,
            file_glob: None,
            semantic_weight: 0.7,
            bm25_weight: 0.3,
            include_context: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub chunk_id: String,
    pub file_path: String,
    pub content: String,
    pub score: f32,
    pub start_line: usize,
    pub end_line: usize,
    pub chunk_type: String,
    pub name: String,
    pub language: String,
    pub context_before: Option<String>,
    pub context_after: Option<String>,
    pub parent_chunk: Option<Box<SearchResult>>,
}

/// Prev/next/parent neighborhood of one chunk.
#[derive(Debug, Clone, Default)]
pub struct ChunkContext {
    pub chunk: Option<SearchResult>,
    pub prev: Option<SearchResult>,
    pub next: Option<SearchResult>,
    pub parent: Option<SearchResult>,
}

/// Read-only hybrid retriever over one project's index. Snapshots the
/// store at open time: the BM25 index and link table reflect all writes
/// committed before `open`, and later writes require a new searcher.
pub struct Searcher {
    project_path: PathBuf,
    rag_dir: PathBuf,
    store: VectorStore,
    embedder: Arc<Embedder>,
    config: RagConfig,
    keyword_index: Option<KeywordIndex>,
    chunks_by_id: HashMap<String, StoredChunk>,
    query_cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl Searcher {
    pub async fn open(project_path: &Path, config: RagConfig, embedder: Arc<Embedder>) -> Result<Self> {
        let project_path = project_path
            .canonicalize()
            .with_context(|| format!("project path not found: {}", project_path.display()))?;
        let rag_dir = project_path.join(RAG_DIR_NAME);
        if !rag_dir.exists() {
            return Err(anyhow!(
                "no search index found at {}; run `mini-rag index {}` first",
                rag_dir.display(),
                project_path.display()
            ));
        }

        let store = VectorStore::open(&rag_dir).await?;
        let chunks = store.scan().await?;
        let keyword_index = if config.search.enable_bm25 {
            Some(KeywordIndex::build(&chunks))
        } else {
            None
        };
        debug!(chunks = chunks.len(), "searcher opened");
        let chunks_by_id = chunks
            .into_iter()
            .map(|chunk| (chunk.chunk_id.clone(), chunk))
            .collect();

        let cache_size =
            NonZeroUsize::new(QUERY_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            project_path,
            rag_dir,
            store,
            embedder,
            config,
            keyword_index,
            chunks_by_id,
            query_cache: Mutex::new(LruCache::new(cache_size)),
        })
    }

    /// Hybrid search: vector candidates fused with BM25 keyword scores,
    /// re-ranked, diversity-filtered, optionally context-expanded.
    pub async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>> {
        self.record_last_search(&query.text);
        if query.text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let glob = match &query.file_glob {
            Some(raw) => Some(
                glob::Pattern::new(raw).map_err(|e| anyhow!("invalid file glob '{raw}': {e}"))?,
            ),
            None => None,
        };

        let query_vec = self.query_vector(&query.text).await?;
        let filters = SearchFilters {
            chunk_types: query.chunk_types.clone(),
            languages: query.languages.clone(),
        };
        let top_k = query.top_k.max(1);
        let pool = self
            .store
            .nearest(&query_vec, top_k * CANDIDATE_MULTIPLIER, &filters)
            .await?;

        let bm25_scores = self
            .keyword_index
            .as_ref()
            .map(|index| index.scores(&query.text));

        let threshold = self.config.search.similarity_threshold;
        let mut candidates = Vec::new();
        for (chunk, distance) in pool {
            if let Some(pattern) = &glob {
                if !pattern.matches(&chunk.file_path) {
                    continue;
                }
            }
            let semantic = 1.0 / (1.0 + distance.max(0.0));
            if semantic < threshold {
                continue;
            }
            let keyword = bm25_scores
                .as_ref()
                .and_then(|scores| scores.get(&chunk.chunk_id))
                .copied()
                .unwrap_or(0.0);
            let score = query.semantic_weight * semantic + query.bm25_weight * keyword;
            candidates.push(to_result(&chunk, score));
        }

        rerank(&self.project_path, &mut candidates);
        candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        let mut results = apply_diversity(candidates, top_k);

        if query.include_context {
            self.add_context(&mut results);
        }
        Ok(results)
    }

    /// Find a function or method by name.
    pub async fn get_function(&self, name: &str, top_k: usize) -> Result<Vec<SearchResult>> {
        let mut query = SearchQuery::new(format!("function {name} implementation definition"));
        query.top_k = top_k * 2;
        query.chunk_types = Some(vec!["function".to_string(), "method".to_string()]);
        let results = self.search(&query).await?;
        let needle = name.to_lowercase();
        Ok(results
            .into_iter()
            .filter(|r| r.name.to_lowercase().contains(&needle))
            .take(top_k)
            .collect())
    }

    /// Find a class by name.
    pub async fn get_class(&self, name: &str, top_k: usize) -> Result<Vec<SearchResult>> {
        let mut query = SearchQuery::new(format!("class {name} definition implementation"));
        query.top_k = top_k * 2;
        query.chunk_types = Some(vec!["class".to_string()]);
        let results = self.search(&query).await?;
        let needle = name.to_lowercase();
        Ok(results
            .into_iter()
            .filter(|r| r.name.to_lowercase().contains(&needle))
            .take(top_k)
            .collect())
    }

    /// Find places where an identifier is actually used.
    pub async fn find_usage(&self, identifier: &str, top_k: usize) -> Result<Vec<SearchResult>> {
        let mut query = SearchQuery::new(format!(
            "using {identifier} calling {identifier} import {identifier}"
        ));
        query.top_k = top_k * 2;
        let results = self.search(&query).await?;
        Ok(results
            .into_iter()
            .filter(|r| r.content.contains(identifier))
            .take(top_k)
            .collect())
    }

    /// Find code similar to a snippet, weighted toward semantic match.
    pub async fn search_similar_code(
        &self,
        snippet: &str,
        top_k: usize,
        exclude_self: bool,
    ) -> Result<Vec<SearchResult>> {
        let mut query = SearchQuery::new(snippet);
        query.top_k = if exclude_self { top_k * 2 } else { top_k };
        query.semantic_weight = 0.8;
        query.bm25_weight = 0.2;
        let results = self.search(&query).await?;
        if !exclude_self {
            return Ok(results);
        }
        Ok(results
            .into_iter()
            .filter(|r| r.content.trim() != snippet.trim())
            .take(top_k)
            .collect())
    }

    /// The prev/next/parent neighborhood of a chunk by id.
    pub fn get_chunk_context(&self, chunk_id: &str) -> ChunkContext {
        let Some(chunk) = self.chunks_by_id.get(chunk_id) else {
            return ChunkContext::default();
        };
        let lookup = |id: &str| {
            if id.is_empty() {
                None
            } else {
                self.chunks_by_id.get(id).map(|c| to_result(c, 1.0))
            }
        };
        ChunkContext {
            chunk: Some(to_result(chunk, 1.0)),
            prev: lookup(&chunk.prev_chunk_id),
            next: lookup(&chunk.next_chunk_id),
            parent: self.parent_of(chunk).map(|p| to_result(p, 1.0)),
        }
    }

    pub fn stats(&self) -> StoreStats {
        stats_of(self.chunks_by_id.values())
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks_by_id.len()
    }

    pub fn store(&self) -> &VectorStore {
        &self.store
    }

    async fn query_vector(&self, text: &str) -> Result<Vec<f32>> {
        if let Ok(mut cache) = self.query_cache.lock() {
            if let Some(hit) = cache.get(text) {
                return Ok(hit.clone());
            }
        }
        // The cache mutex is never held across the embed await.
        let vector = self.embedder.embed(text).await?;
        if let Ok(mut cache) = self.query_cache.lock() {
            cache.put(text.to_string(), vector.clone());
        }
        Ok(vector)
    }

    fn parent_of<'a>(&'a self, chunk: &StoredChunk) -> Option<&'a StoredChunk> {
        if chunk.parent_class.is_empty() {
            return None;
        }
        self.chunks_by_id.values().find(|c| {
            c.file_path == chunk.file_path
                && c.chunk_type == "class"
                && c.name == chunk.parent_class
        })
    }

    fn add_context(&self, results: &mut [SearchResult]) {
        for result in results.iter_mut() {
            let Some(chunk) = self.chunks_by_id.get(&result.chunk_id) else {
                continue;
            };
            if !chunk.prev_chunk_id.is_empty() {
                result.context_before = self
                    .chunks_by_id
                    .get(&chunk.prev_chunk_id)
                    .map(|c| c.content.clone());
            }
            if !chunk.next_chunk_id.is_empty() {
                result.context_after = self
                    .chunks_by_id
                    .get(&chunk.next_chunk_id)
                    .map(|c| c.content.clone());
            }
            result.parent_chunk = self
                .parent_of(chunk)
                .map(|parent| Box::new(to_result(parent, 1.0)));
        }
    }

    /// Diagnostic only; absence or failure is never an error.
    fn record_last_search(&self, text: &str) {
        let _ = fs::write(self.rag_dir.join("last_search"), text);
    }
}

fn to_result(chunk: &StoredChunk, score: f32) -> SearchResult {
    SearchResult {
        chunk_id: chunk.chunk_id.clone(),
        file_path: chunk.file_path.clone(),
        content: chunk.content.clone(),
        score,
        start_line: chunk.start_line,
        end_line: chunk.end_line,
        chunk_type: chunk.chunk_type.clone(),
        name: chunk.name.clone(),
        language: chunk.language.clone(),
        context_before: None,
        context_after: None,
        parent_chunk: None,
    }
}

/// Multiplicative quality boosts: file importance, recency, chunk type,
/// and content shape. All signals are already at hand, so this costs
/// nothing beyond a stat call per result.
fn rerank(project_root: &Path, results: &mut [SearchResult]) {
    let now = SystemTime::now();
    for result in results.iter_mut() {
        let path_lower = result.file_path.to_lowercase();
        if IMPORTANT_FILE_PATTERNS
            .iter()
            .any(|pattern| path_lower.contains(pattern))
        {
            result.score *= 1.20;
        }

        if let Ok(metadata) = fs::metadata(project_root.join(&result.file_path)) {
            if let Ok(modified) = metadata.modified() {
                if let Ok(age) = now.duration_since(modified) {
                    let days = age.as_secs_f64() / 86_400.0;
                    if days <= 7.0 {
                        result.score *= 1.10;
                    } else if days <= 30.0 {
                        result.score *= 1.05;
                    }
                }
            }
        }

        match result.chunk_type.as_str() {
            "function" | "class" | "method" => result.score *= 1.10,
            "comment" | "docstring" => result.score *= 1.05,
            _ => {}
        }

        if result.content.trim().len() < 50 {
            result.score *= 0.90;
        }

        let trimmed = result.content.trim();
        let non_empty = trimmed.lines().filter(|l| !l.trim().is_empty()).count();
        if non_empty >= 3 && trimmed.lines().any(|l| l.trim().len() > 10) {
            result.score *= 1.02;
        }
    }
}

/// Walk the ranked list accepting results until `top_k`, capping per-file
/// count at two, dropping near-duplicate content, and limiting how much a
/// single chunk type dominates the back half of the list.
fn apply_diversity(results: Vec<SearchResult>, top_k: usize) -> Vec<SearchResult> {
    let mut accepted: Vec<SearchResult> = Vec::new();
    let mut file_counts: HashMap<String, usize> = HashMap::new();
    let mut seen_content: HashSet<u64> = HashSet::new();
    let mut type_counts: HashMap<String, usize> = HashMap::new();

    for result in results {
        if file_counts.get(&result.file_path).copied().unwrap_or(0) >= 2 {
            continue;
        }

        let head: String = result.content.trim().chars().take(200).collect();
        let mut hasher = DefaultHasher::new();
        head.hash(&mut hasher);
        let content_hash = hasher.finish();
        if seen_content.contains(&content_hash) {
            continue;
        }

        if accepted.len() >= top_k / 2
            && type_counts.get(&result.chunk_type).copied().unwrap_or(0) > top_k / 3
        {
            continue;
        }

        *file_counts.entry(result.file_path.clone()).or_insert(0) += 1;
        *type_counts.entry(result.chunk_type.clone()).or_insert(0) += 1;
        seen_content.insert(content_hash);
        accepted.push(result);

        if accepted.len() >= top_k {
            break;
        }
    }
    accepted
}
