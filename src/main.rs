use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use mini_rag::config::RagConfig;
use mini_rag::embeddings::Embedder;
use mini_rag::indexer::Indexer;
use mini_rag::search::{SearchQuery, Searcher};
use mini_rag::store::VectorStore;
use mini_rag::RAG_DIR_NAME;

#[derive(Parser)]
#[command(name = "mini-rag")]
#[command(version = "0.1.0")]
#[command(about = "Local semantic search over a project tree")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build or refresh the search index
    Index {
        project_path: PathBuf,

        /// Discard the existing index and rebuild everything
        #[arg(long)]
        force: bool,
    },
    /// Search the indexed project
    Search {
        project_path: PathBuf,

        /// Natural-language query
        query: String,

        /// Maximum number of results
        #[arg(long, default_value_t = 10)]
        top_k: usize,

        /// Restrict results to these chunk types (repeatable)
        #[arg(long = "chunk-type")]
        chunk_types: Vec<String>,

        /// Restrict results to these languages (repeatable)
        #[arg(long = "language")]
        languages: Vec<String>,

        /// Restrict results to files matching this glob
        #[arg(long)]
        file_glob: Option<String>,

        /// Attach neighboring and parent chunks to each result
        #[arg(long)]
        context: bool,
    },
    /// Show manifest summary, store stats, and embedder status
    Status { project_path: PathBuf },
    /// Incrementally refresh the index (same as `index` without --force)
    Update { project_path: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Index {
            project_path,
            force,
        } => run_index(&project_path, force).await,
        Commands::Update { project_path } => run_index(&project_path, false).await,
        Commands::Search {
            project_path,
            query,
            top_k,
            chunk_types,
            languages,
            file_glob,
            context,
        } => {
            run_search(
                &project_path,
                query,
                top_k,
                chunk_types,
                languages,
                file_glob,
                context,
            )
            .await
        }
        Commands::Status { project_path } => run_status(&project_path).await,
    }
}

async fn build_embedder(config: &RagConfig) -> Arc<Embedder> {
    eprintln!("Initializing embedder...");
    let embedder = Arc::new(Embedder::from_config(&config.embedding).await);
    if embedder.status().method == "hash" {
        eprintln!(
            "WARNING: no embedding provider available; using the deterministic hash fallback."
        );
        eprintln!("         Search will work, but similarity will not reflect meaning.");
    }
    embedder
}

async fn run_index(project_path: &Path, force: bool) -> Result<()> {
    let config = RagConfig::load_or_create(project_path)?;
    let embedder = build_embedder(&config).await;
    embedder.warm_up().await;

    let mut indexer = Indexer::new(project_path, config, embedder)?;
    let stats = indexer.index_project(force).await?;

    println!("Files indexed: {}", stats.files_indexed);
    if stats.files_failed > 0 {
        println!("Files failed: {}", stats.files_failed);
    }
    println!("Chunks created: {}", stats.chunks_created);
    println!("Time taken: {:.2}s", stats.time_taken);
    println!("Speed: {:.1} files/second", stats.files_per_second);
    Ok(())
}

async fn run_search(
    project_path: &Path,
    text: String,
    top_k: usize,
    chunk_types: Vec<String>,
    languages: Vec<String>,
    file_glob: Option<String>,
    context: bool,
) -> Result<()> {
    let config = RagConfig::load_or_create(project_path)?;
    let embedder = build_embedder(&config).await;
    let searcher = Searcher::open(project_path, config, embedder).await?;

    let mut query = SearchQuery::new(text);
    query.top_k = top_k;
    if !chunk_types.is_empty() {
        query.chunk_types = Some(chunk_types);
    }
    if !languages.is_empty() {
        query.languages = Some(languages);
    }
    query.file_glob = file_glob;
    query.include_context = context;

    let results = searcher.search(&query).await?;
    if results.is_empty() {
        println!("No results found.");
        return Ok(());
    }

    for (i, result) in results.iter().enumerate() {
        println!(
            "\n{}. {}:{}:{} (score: {:.3})",
            i + 1,
            result.file_path,
            result.start_line,
            result.end_line,
            result.score
        );
        println!("   [{} {}]", result.chunk_type, result.name);
        println!("--------------------------------------------------");
        println!("{}", result.content);
        println!("--------------------------------------------------");
        if let Some(parent) = &result.parent_chunk {
            println!("   parent class: {} ({}:{})", parent.name, parent.start_line, parent.end_line);
        }
    }
    Ok(())
}

async fn run_status(project_path: &Path) -> Result<()> {
    let config = RagConfig::load_or_create(project_path)?;
    let embedder = build_embedder(&config).await;
    let indexer = Indexer::new(project_path, config, embedder.clone())?;
    let info = indexer.stats().await?;

    println!("Project: {}", info.project_path);
    println!("Indexed at: {}", info.indexed_at);
    println!("Files: {}", info.file_count);
    println!("Chunks: {}", info.chunk_count);
    println!("Index size: {} bytes", info.index_size_bytes);

    let rag_dir = project_path.join(RAG_DIR_NAME);
    if let Ok(store) = VectorStore::open(&rag_dir).await {
        let stats = store.stats().await?;
        println!("Store rows: {}", stats.total_chunks);
        println!("Unique files: {}", stats.unique_files);
        let mut types: Vec<_> = stats.chunk_types.iter().collect();
        types.sort_by(|a, b| b.1.cmp(a.1));
        for (chunk_type, count) in types {
            println!("  {chunk_type}: {count}");
        }
    }

    let status = embedder.status();
    println!(
        "Embedding method: {} (dimension {})",
        status.method, status.dimension
    );
    if let Some(model) = &status.model {
        println!("Embedding model: {model}");
    }
    if let Some(endpoint) = &status.endpoint {
        println!("Embedding endpoint: {endpoint}");
    }
    Ok(())
}
