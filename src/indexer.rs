use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use crate::chunker::{detect_language, Chunk, Chunker};
use crate::config::RagConfig;
use crate::embeddings::Embedder;
use crate::manifest::{FileRecord, Manifest};
use crate::store::VectorStore;
use crate::walker::{self, CandidateFile, WalkPlan, Walker};
use crate::RAG_DIR_NAME;

const STREAM_READ_SIZE: usize = 64 * 1024;
/// Above this many chunks in one file, batches are paced with a short
/// sleep so a remote provider is not overwhelmed.
const BULK_CHUNK_THRESHOLD: usize = 500;

#[derive(Debug, Clone, Default)]
pub struct IndexStats {
    pub files_indexed: usize,
    pub files_failed: usize,
    pub chunks_created: usize,
    pub time_taken: f64,
    pub files_per_second: f64,
}

#[derive(Debug, Clone)]
pub struct IndexInfo {
    pub project_path: String,
    pub indexed_at: String,
    pub file_count: usize,
    pub chunk_count: usize,
    pub index_size_bytes: u64,
}

struct ProcessedFile {
    chunks: Vec<Chunk>,
    embeddings: Vec<Vec<f32>>,
    record: FileRecord,
}

/// Owns the end-to-end build: walk, chunk, embed, persist, manifest. The
/// sole writer to the vector store and manifest.
pub struct Indexer {
    project_path: PathBuf,
    rag_dir: PathBuf,
    config: RagConfig,
    embedder: Arc<Embedder>,
    manifest: Manifest,
    store: Option<VectorStore>,
    max_workers: usize,
}

impl Indexer {
    pub fn new(project_path: &Path, config: RagConfig, embedder: Arc<Embedder>) -> Result<Self> {
        let project_path = project_path
            .canonicalize()
            .with_context(|| format!("project path not found: {}", project_path.display()))?;
        let rag_dir = project_path.join(RAG_DIR_NAME);
        fs::create_dir_all(&rag_dir)?;
        let manifest = Manifest::load(&project_path);
        let max_workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(4);

        Ok(Self {
            project_path,
            rag_dir,
            config,
            embedder,
            manifest,
            store: None,
            max_workers,
        })
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    async fn ensure_store(&mut self) -> Result<()> {
        if self.store.is_none() {
            let store = VectorStore::open_or_create(&self.rag_dir, self.embedder.dimension()).await?;
            self.store = Some(store);
        }
        Ok(())
    }

    fn store(&self) -> Result<&VectorStore> {
        self.store
            .as_ref()
            .ok_or_else(|| anyhow!("vector store not initialized"))
    }

    /// Index the whole project incrementally. With `force`, the manifest
    /// and store are reset first and everything is rebuilt.
    pub async fn index_project(&mut self, force: bool) -> Result<IndexStats> {
        let start = Instant::now();
        self.ensure_store().await?;
        walker::ensure_gitignore(&self.project_path);

        if force {
            info!("force reindex: clearing manifest and store");
            self.manifest = Manifest::default();
            self.store()?.reset().await?;
        }

        let walker = Walker::new(&self.project_path, &self.config.files);
        let plan = if force {
            WalkPlan {
                to_process: walker.discover(),
                to_delete: Vec::new(),
            }
        } else {
            walker.plan(&self.manifest)
        };

        if !plan.to_delete.is_empty() {
            info!("removing {} vanished files from the index", plan.to_delete.len());
            self.store()?.delete_files(&plan.to_delete).await?;
            for rel in &plan.to_delete {
                self.manifest.files.remove(rel);
            }
        }

        let total = plan.to_process.len();
        if total == 0 {
            self.manifest.stamp();
            self.manifest.save(&self.project_path)?;
            eprintln!("Index is up to date.");
            return Ok(IndexStats {
                time_taken: start.elapsed().as_secs_f64(),
                ..Default::default()
            });
        }
        eprintln!("Indexing {total} files...");

        let embedder = self.embedder.clone();
        let chunker = Arc::new(Chunker::new(&self.config.chunking));
        let config = Arc::new(self.config.clone());
        let batch_size = self.config.embedding.batch_size.max(1);

        // Bounded worker pool; results are committed per file in whatever
        // order workers finish.
        let mut results = futures::stream::iter(plan.to_process.into_iter().map(|candidate| {
            let embedder = embedder.clone();
            let chunker = chunker.clone();
            let config = config.clone();
            async move {
                let rel = candidate.rel_path.clone();
                let outcome = process_one(candidate, config, chunker, embedder, batch_size).await;
                (rel, outcome)
            }
        }))
        .buffer_unordered(self.max_workers);

        let mut stats = IndexStats::default();
        let mut done = 0usize;
        while let Some((rel, outcome)) = results.next().await {
            done += 1;
            match outcome {
                Ok(processed) => {
                    self.store()?
                        .upsert_file(&rel, &processed.chunks, &processed.embeddings)
                        .await?;
                    stats.chunks_created += processed.chunks.len();
                    self.manifest.files.insert(rel, processed.record);
                    stats.files_indexed += 1;
                }
                Err(e) => {
                    error!("failed to index {rel}: {e:#}");
                    stats.files_failed += 1;
                }
            }
            if done % 25 == 0 || done == total {
                eprintln!("Processed {done}/{total} files...");
            }
        }
        drop(results);

        self.manifest.stamp();
        self.manifest.save(&self.project_path)?;

        stats.time_taken = start.elapsed().as_secs_f64();
        if stats.time_taken > 0.0 {
            stats.files_per_second = total as f64 / stats.time_taken;
        }
        Ok(stats)
    }

    /// Re-chunk and re-embed a single file, replacing its rows atomically.
    /// Returns false (after logging) when the file could not be processed.
    pub async fn update_file(&mut self, path: &Path) -> Result<bool> {
        self.ensure_store().await?;
        let abs = match path.canonicalize() {
            Ok(abs) => abs,
            Err(e) => {
                error!("cannot update {}: {e}", path.display());
                return Ok(false);
            }
        };
        let rel = walker::relative_path(&abs, &self.project_path);
        let metadata = fs::metadata(&abs)?;
        let candidate = CandidateFile {
            path: abs,
            rel_path: rel.clone(),
            size: metadata.len(),
            mtime: walker::mtime_of(&metadata),
        };

        let chunker = Arc::new(Chunker::new(&self.config.chunking));
        let config = Arc::new(self.config.clone());
        let batch_size = self.config.embedding.batch_size.max(1);
        match process_one(candidate, config, chunker, self.embedder.clone(), batch_size).await {
            Ok(processed) => {
                self.store()?
                    .upsert_file(&rel, &processed.chunks, &processed.embeddings)
                    .await?;
                debug!("updated {} chunks for {rel}", processed.chunks.len());
                self.manifest.files.insert(rel, processed.record);
                self.manifest.stamp();
                self.manifest.save(&self.project_path)?;
                Ok(true)
            }
            Err(e) => {
                error!("failed to update {rel}: {e:#}");
                Ok(false)
            }
        }
    }

    /// Remove a file's rows and manifest entry. Returns true if the file
    /// was present in the manifest.
    pub async fn delete_file(&mut self, path: &Path) -> Result<bool> {
        self.ensure_store().await?;
        let abs = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_path.join(path)
        };
        let rel = walker::relative_path(&abs, &self.project_path);
        self.store()?.delete_file(&rel).await?;
        let removed = self.manifest.files.remove(&rel).is_some();
        if removed {
            self.manifest.stamp();
            self.manifest.save(&self.project_path)?;
        }
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<IndexInfo> {
        Ok(IndexInfo {
            project_path: self.project_path.to_string_lossy().to_string(),
            indexed_at: self
                .manifest
                .indexed_at
                .clone()
                .unwrap_or_else(|| "never".to_string()),
            file_count: self.manifest.file_count,
            chunk_count: self.manifest.chunk_count,
            index_size_bytes: dir_size(&self.rag_dir.join("code_vectors.lance")),
        })
    }
}

/// Read, chunk, and embed one file. Any error here is a per-file failure:
/// the caller counts it and moves on.
async fn process_one(
    candidate: CandidateFile,
    config: Arc<RagConfig>,
    chunker: Arc<Chunker>,
    embedder: Arc<Embedder>,
    batch_size: usize,
) -> Result<ProcessedFile> {
    let expected_dim = embedder.dimension();
    let (chunks, record) =
        tokio::task::spawn_blocking(move || process_candidate(&candidate, &config, &chunker))
            .await
            .map_err(|e| anyhow!("worker panicked: {e}"))??;

    let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
    let bulk = texts.len() > BULK_CHUNK_THRESHOLD;
    let mut embeddings = Vec::with_capacity(texts.len());
    for slice in texts.chunks(batch_size) {
        embeddings.extend(embedder.embed_batch(slice).await?);
        if bulk {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    for embedding in &embeddings {
        if embedding.len() != expected_dim {
            return Err(anyhow!(
                "embedding dimension mismatch: expected {expected_dim}, got {}",
                embedding.len()
            ));
        }
    }

    Ok(ProcessedFile {
        chunks,
        embeddings,
        record,
    })
}

fn process_candidate(
    candidate: &CandidateFile,
    config: &RagConfig,
    chunker: &Chunker,
) -> Result<(Vec<Chunk>, FileRecord)> {
    let bytes = read_bytes(candidate, config)?;
    let (content, encoding) = decode_bytes(&bytes);
    let absolute = candidate.path.to_string_lossy().to_string();
    let chunks = chunker.chunk_file(&candidate.rel_path, &absolute, &content);

    let language = chunks
        .first()
        .map(|c| c.language.clone())
        .unwrap_or_else(|| {
            detect_language(Path::new(&candidate.rel_path), &content).to_string()
        });
    let record = FileRecord {
        hash: walker::hash_file(&candidate.path)?,
        size: candidate.size,
        mtime: candidate.mtime,
        chunks: chunks.len(),
        indexed_at: chrono::Local::now().to_rfc3339(),
        language,
        encoding: encoding.to_string(),
    };
    Ok((chunks, record))
}

fn read_bytes(candidate: &CandidateFile, config: &RagConfig) -> Result<Vec<u8>> {
    if config.streaming.enabled && candidate.size > config.streaming.threshold_bytes {
        use std::io::Read;
        debug!(
            "streaming large file ({} bytes): {}",
            candidate.size, candidate.rel_path
        );
        let mut file = fs::File::open(&candidate.path)?;
        let mut bytes = Vec::with_capacity(candidate.size as usize);
        let mut buffer = vec![0u8; STREAM_READ_SIZE];
        loop {
            let read = file.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            bytes.extend_from_slice(&buffer[..read]);
        }
        Ok(bytes)
    } else {
        Ok(fs::read(&candidate.path)?)
    }
}

// CP-1252 leaves these five bytes undefined; their presence sends the
// file to the Latin-1 tier instead.
const CP1252_UNDEFINED: [u8; 5] = [0x81, 0x8D, 0x8F, 0x90, 0x9D];

/// Decode with the fallback chain, strictest first: UTF-8 (BOM-aware),
/// then CP-1252, then Latin-1, which is total over bytes and so always
/// terminates the chain with some text.
fn decode_bytes(bytes: &[u8]) -> (String, &'static str) {
    if let Ok(text) = std::str::from_utf8(bytes) {
        return match text.strip_prefix('\u{feff}') {
            Some(stripped) => (stripped.to_string(), "utf-8-sig"),
            None => (text.to_string(), "utf-8"),
        };
    }
    if !bytes.iter().any(|b| CP1252_UNDEFINED.contains(b)) {
        let (text, had_errors) = encoding_rs::WINDOWS_1252.decode_without_bom_handling(bytes);
        if !had_errors {
            return (text.into_owned(), "cp1252");
        }
    }
    (bytes.iter().map(|&b| b as char).collect(), "latin-1")
}

fn dir_size(path: &Path) -> u64 {
    let mut total = 0;
    if let Ok(entries) = fs::read_dir(path) {
        for entry in entries.flatten() {
            let entry_path = entry.path();
            if entry_path.is_dir() {
                total += dir_size(&entry_path);
            } else if let Ok(metadata) = entry.metadata() {
                total += metadata.len();
            }
        }
    }
    total
}
