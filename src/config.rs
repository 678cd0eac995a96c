use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::RAG_DIR_NAME;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Maximum lines per chunk. Oversized structural chunks are subdivided.
    pub max_size: usize,
    /// Minimum lines per chunk. Undersized generic chunks merge into their predecessor.
    pub min_size: usize,
    /// "semantic" (language-aware) or "fixed" (generic line windows only).
    pub strategy: String,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            min_size: 50,
            strategy: "semantic".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub enabled: bool,
    /// Files larger than this are read in 64 KiB chunks.
    pub threshold_bytes: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_bytes: 1_048_576,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    /// Files smaller than this many bytes are skipped.
    pub min_file_size: u64,
    /// Files larger than this many bytes are skipped.
    pub max_file_size: u64,
    /// Substring matches against any path component.
    pub exclude_patterns: Vec<String>,
    /// Globs matched against the file name.
    pub include_patterns: Vec<String>,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            min_file_size: 1,
            max_file_size: 1_000_000,
            exclude_patterns: default_exclude_patterns(),
            include_patterns: default_include_patterns(),
        }
    }
}

fn default_exclude_patterns() -> Vec<String> {
    [
        "__pycache__",
        ".git",
        "node_modules",
        ".venv",
        "venv",
        "dist",
        "build",
        "target",
        ".idea",
        ".vscode",
        RAG_DIR_NAME,
        ".DS_Store",
        ".lock",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_include_patterns() -> Vec<String> {
    [
        // Code
        "*.py", "*.js", "*.jsx", "*.ts", "*.tsx", "*.go", "*.java", "*.cpp", "*.c", "*.cs",
        "*.rs", "*.rb", "*.php", "*.swift", "*.kt", "*.scala", "*.h", "*.hpp", "*.sh",
        // Documentation
        "*.md", "*.markdown", "*.rst", "*.txt", "*.adoc", "*.asciidoc",
        // Config
        "*.json", "*.yaml", "*.yml", "*.toml", "*.ini", "*.xml", "*.conf", "*.config",
        // Well-known extensionless names
        "README", "LICENSE", "CHANGELOG", "AUTHORS", "CONTRIBUTING", "TODO", "NOTES",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// "remote", "local", "hash", or "auto" (remote -> local -> hash).
    pub preferred_method: String,
    /// Remote embedding model name.
    pub model: String,
    /// Remote provider base URL.
    pub endpoint: String,
    /// Chunk texts embedded per batch during indexing.
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            preferred_method: "auto".to_string(),
            model: "nomic-embed-text".to_string(),
            endpoint: "http://localhost:11434".to_string(),
            batch_size: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub default_top_k: usize,
    pub enable_bm25: bool,
    /// Candidates below this semantic similarity are dropped before fusion.
    pub similarity_threshold: f32,
    /// Reserved for an external query-expansion collaborator.
    pub expand_queries: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_top_k: 10,
            enable_bm25: true,
            similarity_threshold: 0.0,
            expand_queries: false,
        }
    }
}

/// Top-level configuration, persisted as `.mini-rag/config.yaml`.
///
/// The file is advisory input for the CLI; programmatic callers construct
/// this struct directly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    pub chunking: ChunkingConfig,
    pub streaming: StreamingConfig,
    pub files: FilesConfig,
    pub embedding: EmbeddingConfig,
    pub search: SearchConfig,
}

const KNOWN_SECTIONS: &[&str] = &["chunking", "streaming", "files", "embedding", "search"];

impl RagConfig {
    pub fn config_path(project_path: &Path) -> PathBuf {
        project_path.join(RAG_DIR_NAME).join("config.yaml")
    }

    /// Load the project config, writing a commented default file on first run.
    /// A corrupt file degrades to defaults with a warning.
    pub fn load_or_create(project_path: &Path) -> Result<Self> {
        let path = Self::config_path(project_path);
        if !path.exists() {
            let config = Self::default();
            config.save(project_path)?;
            return Ok(config);
        }

        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        match serde_yaml::from_str::<serde_yaml::Value>(&raw) {
            Ok(value) => {
                warn_unknown_keys(&value);
                match serde_yaml::from_value(value) {
                    Ok(config) => Ok(config),
                    Err(e) => {
                        warn!("invalid config at {}: {e}; using defaults", path.display());
                        Ok(Self::default())
                    }
                }
            }
            Err(e) => {
                warn!("unparseable config at {}: {e}; using defaults", path.display());
                Ok(Self::default())
            }
        }
    }

    /// Write the config with explanatory comments.
    pub fn save(&self, project_path: &Path) -> Result<()> {
        let path = Self::config_path(project_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, self.to_commented_yaml())
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    fn to_commented_yaml(&self) -> String {
        let mut out = String::new();
        out.push_str("# mini-rag configuration\n");
        out.push_str("# Edit this file to customize indexing and search behavior.\n\n");
        out.push_str("# Text chunking settings\n");
        out.push_str("chunking:\n");
        out.push_str(&format!(
            "  max_size: {}      # Maximum lines per chunk\n",
            self.chunking.max_size
        ));
        out.push_str(&format!(
            "  min_size: {}        # Minimum lines per chunk\n",
            self.chunking.min_size
        ));
        out.push_str(&format!(
            "  strategy: {}  # 'semantic' (language-aware) or 'fixed'\n\n",
            self.chunking.strategy
        ));
        out.push_str("# Large file streaming\n");
        out.push_str("streaming:\n");
        out.push_str(&format!("  enabled: {}\n", self.streaming.enabled));
        out.push_str(&format!(
            "  threshold_bytes: {}  # Files larger than this use streamed reads\n\n",
            self.streaming.threshold_bytes
        ));
        out.push_str("# File selection\n");
        out.push_str("files:\n");
        out.push_str(&format!("  min_file_size: {}\n", self.files.min_file_size));
        out.push_str(&format!(
            "  max_file_size: {}  # Larger files are skipped\n",
            self.files.max_file_size
        ));
        out.push_str("  exclude_patterns:\n");
        for pattern in &self.files.exclude_patterns {
            out.push_str(&format!("    - \"{pattern}\"\n"));
        }
        out.push_str("  include_patterns:\n");
        for pattern in &self.files.include_patterns {
            out.push_str(&format!("    - \"{pattern}\"\n"));
        }
        out.push_str("\n# Embedding generation\n");
        out.push_str("embedding:\n");
        out.push_str(&format!(
            "  preferred_method: {}  # 'remote', 'local', 'hash', or 'auto'\n",
            self.embedding.preferred_method
        ));
        out.push_str(&format!("  model: {}\n", self.embedding.model));
        out.push_str(&format!("  endpoint: {}\n", self.embedding.endpoint));
        out.push_str(&format!("  batch_size: {}\n\n", self.embedding.batch_size));
        out.push_str("# Search behavior\n");
        out.push_str("search:\n");
        out.push_str(&format!("  default_top_k: {}\n", self.search.default_top_k));
        out.push_str(&format!(
            "  enable_bm25: {}        # Keyword scoring fused with vector similarity\n",
            self.search.enable_bm25
        ));
        out.push_str(&format!(
            "  similarity_threshold: {}\n",
            self.search.similarity_threshold
        ));
        out.push_str(&format!(
            "  expand_queries: {}    # Reserved for external query expansion\n",
            self.search.expand_queries
        ));
        out
    }
}

fn warn_unknown_keys(value: &serde_yaml::Value) {
    let Some(map) = value.as_mapping() else {
        return;
    };
    for key in map.keys() {
        if let Some(key) = key.as_str() {
            if !KNOWN_SECTIONS.contains(&key) {
                warn!("ignoring unknown config section '{key}'");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_yaml() {
        let config = RagConfig::default();
        let yaml = config.to_commented_yaml();
        let parsed: RagConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.chunking.max_size, 1000);
        assert_eq!(parsed.chunking.min_size, 50);
        assert_eq!(parsed.embedding.preferred_method, "auto");
        assert_eq!(parsed.search.default_top_k, 10);
        assert!(parsed.search.enable_bm25);
    }

    #[test]
    fn partial_config_keeps_other_defaults() {
        let parsed: RagConfig =
            serde_yaml::from_str("chunking:\n  max_size: 120\n").unwrap();
        assert_eq!(parsed.chunking.max_size, 120);
        assert_eq!(parsed.chunking.min_size, 50);
        assert_eq!(parsed.files.max_file_size, 1_000_000);
    }

    #[test]
    fn creates_default_file_on_first_load() {
        let dir = tempfile::tempdir().unwrap();
        let config = RagConfig::load_or_create(dir.path()).unwrap();
        assert!(RagConfig::config_path(dir.path()).exists());
        assert_eq!(config.embedding.batch_size, 32);

        // Second load reads the file it just wrote.
        let again = RagConfig::load_or_create(dir.path()).unwrap();
        assert_eq!(again.chunking.max_size, config.chunking.max_size);
    }
}
