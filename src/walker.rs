use anyhow::Result;
use glob::Pattern;
use ignore::WalkBuilder;
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::warn;

use crate::config::FilesConfig;
use crate::manifest::Manifest;
use crate::RAG_DIR_NAME;

/// A file that passed the selection rules, with the stat data change
/// detection needs.
#[derive(Debug, Clone)]
pub struct CandidateFile {
    pub path: PathBuf,
    /// Project-relative, forward-slash normalized.
    pub rel_path: String,
    pub size: u64,
    pub mtime: f64,
}

/// The walker's output: files needing (re)indexing and manifest entries
/// whose files vanished from disk.
#[derive(Debug, Default)]
pub struct WalkPlan {
    pub to_process: Vec<CandidateFile>,
    pub to_delete: Vec<String>,
}

/// Enumerates candidate files under a project root and decides which need
/// (re)processing against the manifest.
pub struct Walker {
    root: PathBuf,
    include: Vec<Pattern>,
    exclude: Vec<String>,
    min_size: u64,
    max_size: u64,
}

impl Walker {
    pub fn new(root: &Path, config: &FilesConfig) -> Self {
        let include = config
            .include_patterns
            .iter()
            .filter_map(|raw| match Pattern::new(raw) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    warn!("ignoring invalid include pattern '{raw}': {e}");
                    None
                }
            })
            .collect();
        Self {
            root: root.to_path_buf(),
            include,
            exclude: config.exclude_patterns.clone(),
            min_size: config.min_file_size,
            max_size: config.max_file_size,
        }
    }

    /// Enumerate all files that pass the selection rules, sorted by
    /// relative path for deterministic processing order.
    pub fn discover(&self) -> Vec<CandidateFile> {
        let (tx, rx) = crossbeam_channel::unbounded::<CandidateFile>();

        let mut builder = WalkBuilder::new(&self.root);
        builder
            .hidden(false)
            .git_ignore(true)
            .add_custom_ignore_filename(".mini-rag-ignore");

        let root = self.root.clone();
        let include = self.include.clone();
        let exclude = self.exclude.clone();
        let (min_size, max_size) = (self.min_size, self.max_size);

        builder.build_parallel().run(|| {
            let tx = tx.clone();
            let root = root.clone();
            let include = include.clone();
            let exclude = exclude.clone();
            Box::new(move |result| {
                let entry = match result {
                    Ok(entry) => entry,
                    Err(_) => return ignore::WalkState::Continue,
                };
                let path = entry.path();

                let excluded = path.components().any(|component| {
                    let segment = component.as_os_str().to_string_lossy();
                    segment == RAG_DIR_NAME
                        || exclude.iter().any(|pattern| segment.contains(pattern.as_str()))
                });
                if excluded {
                    return ignore::WalkState::Continue;
                }
                if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
                    return ignore::WalkState::Continue;
                }
                let metadata = match entry.metadata() {
                    Ok(metadata) => metadata,
                    Err(_) => return ignore::WalkState::Continue,
                };
                let size = metadata.len();
                if size < min_size || size > max_size {
                    return ignore::WalkState::Continue;
                }

                let file_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                let included = include.iter().any(|pattern| pattern.matches(&file_name));
                if !included && !(path.extension().is_none() && sniff_extensionless(path)) {
                    return ignore::WalkState::Continue;
                }

                let _ = tx.send(CandidateFile {
                    path: path.to_path_buf(),
                    rel_path: relative_path(path, &root),
                    size,
                    mtime: mtime_of(&metadata),
                });
                ignore::WalkState::Continue
            })
        });
        drop(tx);

        let mut files: Vec<CandidateFile> = rx.iter().collect();
        files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        files
    }

    /// Produce the work list against the manifest: new files, files with a
    /// changed size or mtime, and files whose size and mtime match but
    /// whose content hash differs. Vanished manifest entries are scheduled
    /// for deletion.
    pub fn plan(&self, manifest: &Manifest) -> WalkPlan {
        let candidates = self.discover();

        let to_delete: Vec<String> = manifest
            .files
            .keys()
            .filter(|rel| !self.root.join(rel.as_str()).exists())
            .cloned()
            .collect();

        let mut to_process = Vec::new();
        let mut suspects = Vec::new();
        for candidate in candidates {
            match manifest.files.get(&candidate.rel_path) {
                None => to_process.push(candidate),
                Some(record) => {
                    if record.size != candidate.size || record.mtime != candidate.mtime {
                        to_process.push(candidate);
                    } else {
                        // Same size and mtime can still hide an edit.
                        suspects.push((candidate, record.hash.clone()));
                    }
                }
            }
        }

        let changed: Vec<CandidateFile> = suspects
            .into_par_iter()
            .filter_map(|(candidate, stored_hash)| match hash_file(&candidate.path) {
                Ok(hash) if hash != stored_hash => Some(candidate),
                Ok(_) => None,
                Err(e) => {
                    warn!("could not hash {}: {e}", candidate.path.display());
                    None
                }
            })
            .collect();
        to_process.extend(changed);
        to_process.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));

        WalkPlan {
            to_process,
            to_delete,
        }
    }
}

pub fn relative_path(path: &Path, root: &Path) -> String {
    pathdiff::diff_paths(path, root)
        .unwrap_or_else(|| path.to_path_buf())
        .to_string_lossy()
        .replace('\\', "/")
}

pub fn mtime_of(metadata: &fs::Metadata) -> f64 {
    metadata
        .modified()
        .unwrap_or(SystemTime::UNIX_EPOCH)
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Streaming SHA-256 of a file's content, hex-encoded.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect())
}

const CODE_INDICATORS: &[&str] = &[
    "#!",
    "import ",
    "from ",
    "def ",
    "class ",
    "function ",
    "const ",
    "let ",
    "var ",
    "package main",
    "public class",
    "if __name__",
    "<?xml",
    "version =",
    "name =",
];

/// Accept an extensionless file only if its first 1 KiB decodes as UTF-8
/// and looks like code or configuration.
fn sniff_extensionless(path: &Path) -> bool {
    let mut buffer = [0u8; 1024];
    let read = match fs::File::open(path).and_then(|mut f| f.read(&mut buffer)) {
        Ok(read) => read,
        Err(_) => return false,
    };
    let head = match std::str::from_utf8(&buffer[..read]) {
        Ok(text) => text,
        // A multi-byte character split at the 1 KiB boundary is fine;
        // an invalid byte in the middle means binary.
        Err(e) if e.error_len().is_none() => match std::str::from_utf8(&buffer[..e.valid_up_to()]) {
            Ok(text) => text,
            Err(_) => return false,
        },
        Err(_) => return false,
    };
    let lower = head.to_lowercase();
    CODE_INDICATORS.iter().any(|ind| lower.contains(ind))
}

/// Keep the index directory out of version control.
pub fn ensure_gitignore(root: &Path) {
    let gitignore_path = root.join(".gitignore");
    let entry = format!("{RAG_DIR_NAME}/");

    if gitignore_path.exists() {
        if let Ok(content) = fs::read_to_string(&gitignore_path) {
            if !content.contains(&entry) {
                use std::io::Write;
                if let Ok(mut file) = fs::OpenOptions::new().append(true).open(&gitignore_path) {
                    let _ = writeln!(file, "\n{entry}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::FileRecord;

    fn config() -> FilesConfig {
        FilesConfig::default()
    }

    fn write(root: &Path, rel: &str, content: &str) -> PathBuf {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        path
    }

    fn record_for(path: &Path, chunks: usize) -> FileRecord {
        let metadata = fs::metadata(path).unwrap();
        FileRecord {
            hash: hash_file(path).unwrap(),
            size: metadata.len(),
            mtime: mtime_of(&metadata),
            chunks,
            indexed_at: "2024-01-01T00:00:00Z".to_string(),
            language: "python".to_string(),
            encoding: "utf-8".to_string(),
        }
    }

    #[test]
    fn discovers_included_files_and_skips_excluded_dirs() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/app.py", "print('hi')\n");
        write(dir.path(), "README.md", "# readme\n");
        write(dir.path(), "node_modules/pkg/index.js", "module.exports = 1\n");
        write(dir.path(), "image.bin", "not text");

        let walker = Walker::new(dir.path(), &config());
        let rels: Vec<String> = walker.discover().into_iter().map(|c| c.rel_path).collect();
        assert!(rels.contains(&"src/app.py".to_string()));
        assert!(rels.contains(&"README.md".to_string()));
        assert!(!rels.iter().any(|r| r.contains("node_modules")));
        assert!(!rels.contains(&"image.bin".to_string()));
    }

    #[test]
    fn size_limits_are_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config();
        cfg.max_file_size = 100;
        write(dir.path(), "small.py", "x = 1\n");
        write(dir.path(), "big.py", &"x = 1\n".repeat(50));

        let walker = Walker::new(dir.path(), &cfg);
        let rels: Vec<String> = walker.discover().into_iter().map(|c| c.rel_path).collect();
        assert!(rels.contains(&"small.py".to_string()));
        assert!(!rels.contains(&"big.py".to_string()));
    }

    #[test]
    fn extensionless_files_need_a_code_sniff() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "runner", "#!/usr/bin/env python\nimport sys\n");
        write(dir.path(), "randomdata", "zzzz qqqq xxxx\n");

        let walker = Walker::new(dir.path(), &config());
        let rels: Vec<String> = walker.discover().into_iter().map(|c| c.rel_path).collect();
        assert!(rels.contains(&"runner".to_string()));
        assert!(!rels.contains(&"randomdata".to_string()));
    }

    #[test]
    fn plan_flags_new_and_modified_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let unchanged = write(dir.path(), "stable.py", "a = 1\n");
        write(dir.path(), "fresh.py", "b = 2\n");

        let mut manifest = Manifest::default();
        manifest
            .files
            .insert("stable.py".to_string(), record_for(&unchanged, 1));

        let walker = Walker::new(dir.path(), &config());
        let plan = walker.plan(&manifest);
        let rels: Vec<&str> = plan.to_process.iter().map(|c| c.rel_path.as_str()).collect();
        assert_eq!(rels, vec!["fresh.py"]);
        assert!(plan.to_delete.is_empty());
    }

    #[test]
    fn plan_detects_same_stat_content_change_via_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "sneaky.py", "a = 1\n");

        let mut record = record_for(&path, 1);
        // Same size and mtime on record, but a different stored hash, as if
        // the content were swapped while preserving stat data.
        record.hash = "0".repeat(64);
        let mut manifest = Manifest::default();
        manifest.files.insert("sneaky.py".to_string(), record);

        let walker = Walker::new(dir.path(), &config());
        let plan = walker.plan(&manifest);
        assert_eq!(plan.to_process.len(), 1);
        assert_eq!(plan.to_process[0].rel_path, "sneaky.py");
    }

    #[test]
    fn plan_schedules_vanished_files_for_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = Manifest::default();
        let path = write(dir.path(), "gone.py", "a = 1\n");
        manifest
            .files
            .insert("gone.py".to_string(), record_for(&path, 1));
        fs::remove_file(&path).unwrap();

        let walker = Walker::new(dir.path(), &config());
        let plan = walker.plan(&manifest);
        assert_eq!(plan.to_delete, vec!["gone.py".to_string()]);
        assert!(plan.to_process.is_empty());
    }

    #[test]
    fn hashes_are_stable_hex_sha256() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "f.txt", "hello\n");
        let a = hash_file(&path).unwrap();
        let b = hash_file(&path).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
