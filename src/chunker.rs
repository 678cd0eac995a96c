use lazy_static::lazy_static;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::debug;
use tree_sitter::{Parser, Query, QueryCursor};

use crate::config::ChunkingConfig;

/// A structurally bounded region of one file, ready for embedding.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub chunk_id: String,
    /// Project-relative path, forward-slash normalized.
    pub file_path: String,
    /// Canonical path at index time (diagnostic only).
    pub absolute_path: String,
    pub content: String,
    /// 1-based inclusive line range.
    pub start_line: usize,
    pub end_line: usize,
    pub chunk_type: String,
    pub name: String,
    pub language: String,
    /// Name of the enclosing class chunk, empty if none.
    pub parent_class: String,
    /// Name of the enclosing function chunk, empty if none.
    pub parent_function: String,
    pub prev_chunk_id: String,
    pub next_chunk_id: String,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub file_lines: usize,
    pub indexed_at: String,
}

/// Chunk under construction: file-level fields are filled in a final pass.
#[derive(Debug, Clone)]
struct RawChunk {
    content: String,
    start_line: usize,
    end_line: usize,
    chunk_type: &'static str,
    name: String,
    parent_class: String,
    parent_function: String,
}

impl RawChunk {
    fn new(content: String, start_line: usize, end_line: usize, chunk_type: &'static str, name: String) -> Self {
        Self {
            content,
            start_line,
            end_line,
            chunk_type,
            name,
            parent_class: String::new(),
            parent_function: String::new(),
        }
    }

    fn line_count(&self) -> usize {
        self.content.lines().count()
    }
}

lazy_static! {
    static ref MD_HEADER: Regex = Regex::new(r"^(#+)\s+(.+)$").unwrap();
    static ref MD_RULE: Regex = Regex::new(r"^[-=]{3,}$").unwrap();
    static ref PY_CLASS: Regex = Regex::new(r"^class\s+(\w+)").unwrap();
    static ref PY_DEF: Regex = Regex::new(r"^def\s+(\w+)").unwrap();
    static ref PY_ASYNC_DEF: Regex = Regex::new(r"^async\s+def\s+(\w+)").unwrap();
    static ref JS_FUNCTION: Regex =
        Regex::new(r"^\s*(?:export\s+)?(async\s+)?function\s+(\w+)").unwrap();
    static ref JS_ARROW: Regex =
        Regex::new(r"^\s*(?:export\s+)?(?:const|let|var)\s+(\w+)\s*=\s*(?:async\s+)?\([^)]*\)\s*=>")
            .unwrap();
    static ref JS_CLASS: Regex = Regex::new(r"^\s*(?:export\s+)?class\s+(\w+)").unwrap();
    static ref JS_METHOD: Regex = Regex::new(r"^\s*(?:async\s+)?(\w+)\s*\([^)]*\)\s*\{").unwrap();
    static ref GO_METHOD: Regex = Regex::new(r"^\s*func\s+\((\w+)\s+\*?\w+\)\s+(\w+)\s*\(").unwrap();
    static ref GO_FUNC: Regex = Regex::new(r"^\s*func\s+(\w+)\s*\(").unwrap();
    static ref GO_TYPE: Regex = Regex::new(r"^\s*type\s+(\w+)\s+(?:struct|interface)\s*\{").unwrap();
    static ref JAVA_CLASS: Regex =
        Regex::new(r"^\s*(?:public|private|protected)?\s*(?:abstract\s+|final\s+)?class\s+(\w+)")
            .unwrap();
    static ref JAVA_METHOD: Regex =
        Regex::new(r"^\s*(?:public|private|protected)\s+(?:static\s+)?(?:final\s+)?[\w<>\[\]]+\s+(\w+)\s*\(")
            .unwrap();
    static ref INI_SECTION: Regex = Regex::new(r"^\[(.+)\]$").unwrap();
    static ref YAML_SECTION: Regex = Regex::new(r"^([A-Za-z0-9_-]+):\s*(?:#.*)?$").unwrap();
}

/// Detect the source language from extension, then shebang, then keyword
/// density over the first 50 lines.
pub fn detect_language(path: &Path, content: &str) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    let by_ext = match ext.as_str() {
        "py" => "python",
        "js" | "jsx" | "mjs" | "cjs" => "javascript",
        "ts" | "tsx" => "typescript",
        "go" => "go",
        "java" => "java",
        "c" | "h" => "c",
        "cpp" | "cc" | "cxx" | "hpp" => "cpp",
        "cs" => "csharp",
        "rs" => "rust",
        "rb" => "ruby",
        "php" => "php",
        "swift" => "swift",
        "kt" => "kotlin",
        "scala" => "scala",
        "sh" | "bash" => "bash",
        "md" | "markdown" => "markdown",
        "rst" => "restructuredtext",
        "txt" => "text",
        "adoc" | "asciidoc" => "asciidoc",
        "json" => "json",
        "yaml" | "yml" => "yaml",
        "toml" => "toml",
        "ini" => "ini",
        "xml" => "xml",
        "conf" | "config" => "config",
        _ => "",
    };
    if !by_ext.is_empty() {
        return by_ext;
    }

    let mut lines = content.lines();
    if let Some(first) = lines.next() {
        if first.starts_with("#!") {
            let shebang = first.to_ascii_lowercase();
            if shebang.contains("python") {
                return "python";
            }
            if shebang.contains("node") {
                return "javascript";
            }
            if shebang.contains("bash") || shebang.contains("/sh") {
                return "bash";
            }
        }
    }

    let sample: String = content.lines().take(50).collect::<Vec<_>>().join("\n");
    const PYTHON_INDICATORS: &[&str] = &[
        "import ", "from ", "def ", "class ", "if __name__", "print(", "self.", "__init__",
        "try:", "except", "elif ",
    ];
    let python_score = PYTHON_INDICATORS
        .iter()
        .filter(|ind| sample.contains(*ind))
        .count();
    if python_score >= 3 {
        return "python";
    }
    const JS_INDICATORS: &[&str] = &["function ", "var ", "const ", "let ", "=>"];
    if JS_INDICATORS.iter().any(|ind| sample.contains(*ind)) {
        return "javascript";
    }

    "unknown"
}

/// Splits file content into chunks that respect structure: functions and
/// classes for code, sections for prose and config files, blank-line blocks
/// otherwise. Sizes are measured in lines.
pub struct Chunker {
    max_size: usize,
    min_size: usize,
    fixed: bool,
}

impl Chunker {
    pub fn new(config: &ChunkingConfig) -> Self {
        Self {
            max_size: config.max_size.max(1),
            min_size: config.min_size,
            fixed: config.strategy == "fixed",
        }
    }

    /// Chunk one file. `file_path` is the project-relative path used for
    /// chunk ids; `absolute_path` is recorded as a diagnostic.
    pub fn chunk_file(&self, file_path: &str, absolute_path: &str, content: &str) -> Vec<Chunk> {
        let lines: Vec<&str> = content.lines().collect();
        if lines.is_empty() || content.trim().is_empty() {
            return Vec::new();
        }

        let language = detect_language(Path::new(file_path), content);
        let stem = file_stem(file_path);

        let raw = if self.fixed {
            self.chunk_generic(&lines)
        } else {
            match language {
                "python" => self.chunk_python(content, &lines),
                "javascript" | "typescript" => self.chunk_javascript(&lines),
                "go" => self.chunk_go(&lines),
                "java" => self.chunk_java(&lines),
                "markdown" | "text" | "restructuredtext" | "asciidoc" => {
                    self.chunk_prose(&lines, &stem)
                }
                "json" | "yaml" | "toml" | "ini" | "xml" | "config" => {
                    self.chunk_config(&lines, language, &stem)
                }
                _ => self.chunk_generic(&lines),
            }
        };

        let raw = self.enforce_size_constraints(raw);
        finalize(raw, file_path, absolute_path, language, lines.len())
    }

    // ---- Python -------------------------------------------------------

    fn chunk_python(&self, content: &str, lines: &[&str]) -> Vec<RawChunk> {
        let mut chunks = match python_structural(content, lines) {
            Some(chunks) => chunks,
            None => {
                debug!("python parse failed, falling back to regex chunking");
                python_regex_fallback(lines)
            }
        };
        if chunks.is_empty() {
            chunks = python_regex_fallback(lines);
        }

        // Sparse structure over a large file: fill the gaps with generic
        // chunks so no region of the file is unsearchable.
        if chunks.len() < 3 && lines.len() > 200 {
            let fallback = self.chunk_generic(lines);
            chunks = merge_non_overlapping(chunks, fallback);
        }

        if chunks.is_empty() {
            return self.chunk_generic(lines);
        }
        chunks
    }

    // ---- JavaScript / TypeScript / Go / Java --------------------------

    fn chunk_javascript(&self, lines: &[&str]) -> Vec<RawChunk> {
        let mut matches: Vec<(usize, &'static str, String)> = Vec::new();
        for (i, line) in lines.iter().enumerate() {
            if let Some(caps) = JS_FUNCTION.captures(line) {
                let chunk_type = if caps.get(1).is_some() { "async_function" } else { "function" };
                matches.push((i, chunk_type, caps[2].to_string()));
            } else if let Some(caps) = JS_ARROW.captures(line) {
                matches.push((i, "function", caps[1].to_string()));
            } else if let Some(caps) = JS_CLASS.captures(line) {
                matches.push((i, "class", caps[1].to_string()));
            } else if let Some(caps) = JS_METHOD.captures(line) {
                let name = caps[1].to_string();
                // Keywords sharing the `name(args) {` shape are not methods.
                const NOT_METHODS: &[&str] =
                    &["if", "for", "while", "switch", "catch", "return", "function"];
                if !NOT_METHODS.contains(&name.as_str()) {
                    matches.push((i, "method", name));
                }
            }
        }
        if matches.is_empty() {
            return self.chunk_generic(lines);
        }
        chunks_by_brace_extent(lines, &matches)
    }

    fn chunk_go(&self, lines: &[&str]) -> Vec<RawChunk> {
        let mut matches: Vec<(usize, &'static str, String)> = Vec::new();
        for (i, line) in lines.iter().enumerate() {
            if let Some(caps) = GO_METHOD.captures(line) {
                matches.push((i, "method", format!("{}.{}", &caps[1], &caps[2])));
            } else if let Some(caps) = GO_FUNC.captures(line) {
                matches.push((i, "function", caps[1].to_string()));
            } else if let Some(caps) = GO_TYPE.captures(line) {
                matches.push((i, "class", caps[1].to_string()));
            }
        }
        if matches.is_empty() {
            return self.chunk_generic(lines);
        }
        chunks_by_brace_extent(lines, &matches)
    }

    fn chunk_java(&self, lines: &[&str]) -> Vec<RawChunk> {
        let mut matches: Vec<(usize, &'static str, String)> = Vec::new();
        for (i, line) in lines.iter().enumerate() {
            if let Some(caps) = JAVA_CLASS.captures(line) {
                matches.push((i, "class", caps[1].to_string()));
            } else if let Some(caps) = JAVA_METHOD.captures(line) {
                matches.push((i, "method", caps[1].to_string()));
            }
        }
        if matches.is_empty() {
            return self.chunk_generic(lines);
        }
        chunks_by_brace_extent(lines, &matches)
    }

    // ---- Prose --------------------------------------------------------

    fn chunk_prose(&self, lines: &[&str], stem: &str) -> Vec<RawChunk> {
        const OVERLAP: usize = 3;
        let mut chunks: Vec<RawChunk> = Vec::new();
        let mut section: Vec<String> = Vec::new();
        let mut section_start = 0usize; // 0-based index of first section line
        let mut section_name = String::from("content");
        let mut overlap_buf: Vec<String> = Vec::new();

        let flush = |chunks: &mut Vec<RawChunk>,
                     section: &mut Vec<String>,
                     overlap_buf: &mut Vec<String>,
                     section_start: usize,
                     section_name: &str| {
            if section.is_empty() {
                return false;
            }
            let mut content_lines = overlap_buf.clone();
            content_lines.extend(section.iter().cloned());
            let content = content_lines.join("\n");
            if !content.trim().is_empty() {
                let start_line = (section_start + 1).saturating_sub(overlap_buf.len()).max(1);
                let end_line = section_start + section.len();
                chunks.push(RawChunk::new(
                    content,
                    start_line,
                    end_line,
                    "section",
                    truncate_name(section_name),
                ));
            }
            *overlap_buf = if section.len() > OVERLAP {
                section[section.len() - OVERLAP..].to_vec()
            } else {
                section.clone()
            };
            section.clear();
            true
        };

        for (i, line) in lines.iter().enumerate() {
            let header = MD_HEADER.captures(line);
            let is_rule = MD_RULE.is_match(line.trim());
            let is_empty = line.trim().is_empty();
            let double_blank = is_empty
                && !section.is_empty()
                && lines.get(i + 1).is_some_and(|next| next.trim().is_empty());
            let at_boundary =
                header.is_some() || is_rule || double_blank || section.len() >= self.max_size;

            if at_boundary {
                let flushed = flush(
                    &mut chunks,
                    &mut section,
                    &mut overlap_buf,
                    section_start,
                    &section_name,
                );
                if let Some(caps) = &header {
                    section_name = caps[2].trim().to_string();
                } else if flushed {
                    section_name = format!("section_{}", chunks.len() + 1);
                }
                // Heading and rule lines mark boundaries; the text that
                // follows belongs to the new section.
                if header.is_none() && !is_rule && !is_empty {
                    section_start = i;
                    section.push(line.to_string());
                } else {
                    section_start = i + 1;
                }
                continue;
            }

            if is_empty && section.is_empty() {
                section_start = i + 1;
                continue;
            }
            if section.is_empty() {
                section_start = i;
            }
            section.push(line.to_string());
        }
        flush(
            &mut chunks,
            &mut section,
            &mut overlap_buf,
            section_start,
            &section_name,
        );

        if chunks.is_empty() {
            let content = lines.join("\n");
            if !content.trim().is_empty() {
                chunks.push(RawChunk::new(
                    content,
                    1,
                    lines.len(),
                    "document",
                    stem.to_string(),
                ));
            }
        }
        chunks
    }

    // ---- Config formats -----------------------------------------------

    fn chunk_config(&self, lines: &[&str], language: &str, stem: &str) -> Vec<RawChunk> {
        let whole_file = |chunk_type: &'static str| {
            vec![RawChunk::new(
                lines.join("\n"),
                1,
                lines.len(),
                chunk_type,
                stem.to_string(),
            )]
        };

        let section_of = |line: &str| -> Option<String> {
            match language {
                "ini" | "toml" => INI_SECTION
                    .captures(line.trim())
                    .map(|caps| caps[1].to_string()),
                // Top-level keys only: the marker must start at column 0.
                "yaml" => YAML_SECTION.captures(line).map(|caps| caps[1].to_string()),
                _ => None,
            }
        };

        if !matches!(language, "ini" | "toml" | "yaml") {
            return whole_file("config");
        }

        let mut chunks: Vec<RawChunk> = Vec::new();
        let mut section: Vec<&str> = Vec::new();
        let mut section_start = 0usize;
        let mut section_name = String::from("config");

        for (i, line) in lines.iter().enumerate() {
            if let Some(new_name) = section_of(line) {
                let content = section.join("\n");
                if !content.trim().is_empty() {
                    chunks.push(RawChunk::new(
                        content,
                        section_start + 1,
                        section_start + section.len(),
                        "config_section",
                        section_name.clone(),
                    ));
                }
                section = vec![line];
                section_start = i;
                section_name = new_name;
            } else {
                if section.is_empty() {
                    section_start = i;
                }
                section.push(line);
            }
        }
        let content = section.join("\n");
        if !content.trim().is_empty() {
            chunks.push(RawChunk::new(
                content,
                section_start + 1,
                lines.len(),
                "config_section",
                section_name,
            ));
        }

        if chunks.is_empty() {
            return whole_file("config");
        }
        chunks
    }

    // ---- Generic fallback ---------------------------------------------

    fn chunk_generic(&self, lines: &[&str]) -> Vec<RawChunk> {
        let mut chunks: Vec<RawChunk> = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        let mut current_start = 0usize;

        for (i, line) in lines.iter().enumerate() {
            current.push(line);

            let blank_boundary = line.trim().is_empty() && current.len() >= self.min_size;
            let at_end = i == lines.len() - 1;
            if !(blank_boundary || current.len() >= self.max_size || at_end) {
                continue;
            }

            // Trim blank edges, keeping line numbers aligned with content.
            let first = current.iter().position(|l| !l.trim().is_empty());
            let last = current.iter().rposition(|l| !l.trim().is_empty());
            if let (Some(first), Some(last)) = (first, last) {
                chunks.push(RawChunk::new(
                    current[first..=last].join("\n"),
                    current_start + first + 1,
                    current_start + last + 1,
                    "code_block",
                    format!("block_{}", chunks.len() + 1),
                ));
            }
            current.clear();
            current_start = i + 1;
        }
        chunks
    }

    // ---- Size constraints ---------------------------------------------

    /// Split oversized chunks into windows and fold undersized generic
    /// chunks into their predecessor. Structural chunks are never merged
    /// away: a four-line method is still a method.
    fn enforce_size_constraints(&self, chunks: Vec<RawChunk>) -> Vec<RawChunk> {
        let mut result: Vec<RawChunk> = Vec::new();

        for chunk in chunks {
            let line_count = chunk.line_count();

            if line_count > self.max_size {
                self.split_oversized(chunk, &mut result);
                continue;
            }

            if chunk.chunk_type == "code_block" && line_count < self.min_size {
                if let Some(prev) = result.last_mut() {
                    if prev.chunk_type == "code_block"
                        && prev.line_count() + line_count <= self.max_size
                    {
                        prev.content.push('\n');
                        prev.content.push_str(&chunk.content);
                        prev.end_line = chunk.end_line;
                        continue;
                    }
                }
            }

            result.push(chunk);
        }
        result
    }

    fn split_oversized(&self, chunk: RawChunk, result: &mut Vec<RawChunk>) {
        let overlap = match chunk.chunk_type {
            "section" | "document" => 3,
            _ => 0,
        };
        let step = (self.max_size - overlap).max(1);
        let content_lines: Vec<&str> = chunk.content.lines().collect();
        let n = content_lines.len();

        let mut part = 0usize;
        let mut window_start = 0usize;
        while window_start < n {
            // A final window that is pure overlap adds nothing.
            if window_start > 0 && n - window_start <= overlap {
                break;
            }
            part += 1;
            let window_end = (window_start + self.max_size).min(n);
            let window = &content_lines[window_start..window_end];

            if window.len() >= self.min_size || result.is_empty() {
                result.push(RawChunk {
                    content: window.join("\n"),
                    start_line: chunk.start_line + window_start,
                    end_line: chunk.start_line + window_end - 1,
                    chunk_type: chunk.chunk_type,
                    name: format!("{}_part{}", chunk.name, part),
                    parent_class: chunk.parent_class.clone(),
                    parent_function: chunk.parent_function.clone(),
                });
            } else if let Some(prev) = result.last_mut() {
                prev.content.push('\n');
                prev.content.push_str(&window.join("\n"));
                prev.end_line = chunk.start_line + window_end - 1;
            }
            window_start += step;
        }
    }
}

// ---- Python helpers ---------------------------------------------------

fn python_structural(content: &str, lines: &[&str]) -> Option<Vec<RawChunk>> {
    let language = tree_sitter_python::language();
    let mut parser = Parser::new();
    parser.set_language(&language).ok()?;
    let tree = parser.parse(content, None)?;
    if tree.root_node().has_error() {
        return None;
    }

    let query = Query::new(
        &language,
        "(function_definition) @definition (class_definition) @definition",
    )
    .ok()?;
    let src = content.as_bytes();

    let mut items: Vec<(usize, usize, &'static str, String, String, String)> = Vec::new();
    let mut cursor = QueryCursor::new();
    for m in cursor.matches(&query, tree.root_node(), src) {
        for capture in m.captures {
            let node = capture.node;
            let name = node_name(node, src);
            let is_class = node.kind() == "class_definition";
            let is_async =
                !is_class && node.child(0).is_some_and(|child| child.kind() == "async");

            // Decorators belong to the definition they annotate.
            let start_row = match node.parent() {
                Some(parent) if parent.kind() == "decorated_definition" => {
                    parent.start_position().row
                }
                _ => node.start_position().row,
            };
            let end_row = node.end_position().row.min(lines.len().saturating_sub(1));

            let mut parent_class = String::new();
            let mut parent_function = String::new();
            let mut nearest_is_class = false;
            let mut nearest_seen = false;
            let mut ancestor = node.parent();
            while let Some(a) = ancestor {
                match a.kind() {
                    "class_definition" => {
                        if parent_class.is_empty() {
                            parent_class = node_name(a, src);
                        }
                        if !nearest_seen {
                            nearest_is_class = true;
                            nearest_seen = true;
                        }
                    }
                    "function_definition" => {
                        if parent_function.is_empty() {
                            parent_function = node_name(a, src);
                        }
                        nearest_seen = true;
                    }
                    _ => {}
                }
                ancestor = a.parent();
            }

            let chunk_type = if is_class {
                "class"
            } else if is_async {
                "async_function"
            } else if nearest_is_class {
                "method"
            } else {
                "function"
            };

            items.push((start_row, end_row, chunk_type, name, parent_class, parent_function));
        }
    }

    items.sort_by_key(|item| (item.0, item.1));
    items.dedup_by(|a, b| a.0 == b.0 && a.1 == b.1);

    let chunks = items
        .into_iter()
        .filter(|(start, end, ..)| start <= end)
        .map(|(start, end, chunk_type, name, parent_class, parent_function)| RawChunk {
            content: lines[start..=end].join("\n"),
            start_line: start + 1,
            end_line: end + 1,
            chunk_type,
            name,
            parent_class,
            parent_function,
        })
        .collect();
    Some(chunks)
}

fn node_name(node: tree_sitter::Node, src: &[u8]) -> String {
    node.child_by_field_name("name")
        .and_then(|n| n.utf8_text(src).ok())
        .unwrap_or("")
        .to_string()
}

/// Regex fallback for files the parser rejects: definitions located by
/// line-anchored patterns, block extent by indentation.
fn python_regex_fallback(lines: &[&str]) -> Vec<RawChunk> {
    struct DefMatch {
        line: usize,
        chunk_type: &'static str,
        name: String,
        indent: usize,
    }

    let mut matches: Vec<DefMatch> = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim_start();
        let indent = line.len() - trimmed.len();
        let matched = if let Some(caps) = PY_CLASS.captures(trimmed) {
            Some(("class", caps[1].to_string()))
        } else if let Some(caps) = PY_ASYNC_DEF.captures(trimmed) {
            Some(("async_function", caps[1].to_string()))
        } else if let Some(caps) = PY_DEF.captures(trimmed) {
            Some(("function", caps[1].to_string()))
        } else {
            None
        };
        if let Some((chunk_type, name)) = matched {
            matches.push(DefMatch { line: i, chunk_type, name, indent });
        }
    }

    let mut chunks = Vec::new();
    for m in &matches {
        let mut end = lines.len() - 1;
        for (j, line) in lines.iter().enumerate().skip(m.line + 1) {
            if line.trim().is_empty() {
                continue;
            }
            let indent = line.len() - line.trim_start().len();
            if indent <= m.indent {
                end = j - 1;
                break;
            }
        }
        let content = lines[m.line..=end].join("\n");
        if !content.trim().is_empty() {
            chunks.push(RawChunk::new(
                content,
                m.line + 1,
                end + 1,
                m.chunk_type,
                m.name.clone(),
            ));
        }
    }
    chunks
}

/// Build chunks from declaration matches, extending each to the line where
/// its braces balance (bounded by the next declaration).
fn chunks_by_brace_extent(
    lines: &[&str],
    matches: &[(usize, &'static str, String)],
) -> Vec<RawChunk> {
    let mut chunks = Vec::new();
    for (idx, (start, chunk_type, name)) in matches.iter().enumerate() {
        let limit = match matches.get(idx + 1) {
            Some((next_start, _, _)) => next_start.saturating_sub(1),
            None => lines.len() - 1,
        };
        let limit = limit.max(*start);

        let mut depth: i32 = 0;
        let mut seen_open = false;
        let mut end = limit;
        for (j, line) in lines.iter().enumerate().take(limit + 1).skip(*start) {
            depth += line.matches('{').count() as i32;
            depth -= line.matches('}').count() as i32;
            seen_open = seen_open || line.contains('{');
            if seen_open && depth <= 0 {
                end = j;
                break;
            }
        }

        let content = lines[*start..=end].join("\n");
        if !content.trim().is_empty() {
            chunks.push(RawChunk::new(
                content,
                start + 1,
                end + 1,
                chunk_type,
                name.clone(),
            ));
        }
    }
    chunks
}

/// Keep all primary chunks, adding fallback chunks that do not overlap any
/// primary line range.
fn merge_non_overlapping(primary: Vec<RawChunk>, fallback: Vec<RawChunk>) -> Vec<RawChunk> {
    if primary.is_empty() {
        return fallback;
    }
    let ranges: Vec<(usize, usize)> = primary
        .iter()
        .map(|chunk| (chunk.start_line, chunk.end_line))
        .collect();
    let mut merged = primary;
    for chunk in fallback {
        let overlaps = ranges
            .iter()
            .any(|(start, end)| chunk.end_line >= *start && chunk.start_line <= *end);
        if !overlaps {
            merged.push(chunk);
        }
    }
    merged.sort_by_key(|chunk| (chunk.start_line, chunk.end_line));
    merged
}

// ---- Finalization ------------------------------------------------------

fn file_stem(file_path: &str) -> String {
    Path::new(file_path)
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string())
}

/// Chunk ids embed a short hash of the relative path so that same-named
/// files (mod.rs, __init__.py) cannot collide store-wide.
fn chunk_id_prefix(file_path: &str) -> String {
    let digest = Sha256::digest(file_path.as_bytes());
    let tag: String = digest[..4].iter().map(|b| format!("{b:02x}")).collect();
    format!("{}-{}", file_stem(file_path), tag)
}

fn finalize(
    raw: Vec<RawChunk>,
    file_path: &str,
    absolute_path: &str,
    language: &str,
    file_lines: usize,
) -> Vec<Chunk> {
    let total = raw.len();
    let prefix = chunk_id_prefix(file_path);
    let indexed_at = chrono::Local::now().to_rfc3339();

    raw.into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let start_line = chunk.start_line.clamp(1, file_lines.max(1));
            let end_line = chunk.end_line.clamp(start_line, file_lines.max(1));
            Chunk {
                chunk_id: format!("{prefix}_{i}"),
                file_path: file_path.to_string(),
                absolute_path: absolute_path.to_string(),
                content: chunk.content,
                start_line,
                end_line,
                chunk_type: chunk.chunk_type.to_string(),
                name: if chunk.name.is_empty() {
                    format!("block_{i}")
                } else {
                    chunk.name
                },
                language: language.to_string(),
                parent_class: chunk.parent_class,
                parent_function: chunk.parent_function,
                prev_chunk_id: if i > 0 {
                    format!("{prefix}_{}", i - 1)
                } else {
                    String::new()
                },
                next_chunk_id: if i + 1 < total {
                    format!("{prefix}_{}", i + 1)
                } else {
                    String::new()
                },
                chunk_index: i,
                total_chunks: total,
                file_lines,
                indexed_at: indexed_at.clone(),
            }
        })
        .collect()
}

fn truncate_name(name: &str) -> String {
    name.chars().take(50).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker() -> Chunker {
        Chunker::new(&ChunkingConfig::default())
    }

    fn small_chunker(max: usize, min: usize) -> Chunker {
        Chunker::new(&ChunkingConfig {
            max_size: max,
            min_size: min,
            strategy: "semantic".to_string(),
        })
    }

    const CALCULATOR: &str = r#"class BasicCalculator:
    """Basic calculator with fundamental operations."""

    def __init__(self):
        self.history = []

    def add(self, a, b):
        """Add two numbers."""
        return a + b

    def subtract(self, a, b):
        """Subtract b from a."""
        return a - b

    def multiply(self, a, b):
        """Multiply two numbers."""
        return a * b

    def divide(self, a, b):
        """Divide a by b with zero check."""
        if b == 0:
            raise ValueError("Cannot divide by zero")
        return a / b
"#;

    #[test]
    fn python_class_with_methods() {
        let chunks = chunker().chunk_file("calculator.py", "/p/calculator.py", CALCULATOR);

        assert!(chunks.len() >= 5, "expected class + methods, got {}", chunks.len());
        let class = chunks.iter().find(|c| c.chunk_type == "class").unwrap();
        assert_eq!(class.name, "BasicCalculator");

        for method in ["add", "subtract", "multiply", "divide"] {
            let chunk = chunks
                .iter()
                .find(|c| c.name == method)
                .unwrap_or_else(|| panic!("missing chunk for {method}"));
            assert_eq!(chunk.chunk_type, "method");
            assert_eq!(chunk.parent_class, "BasicCalculator");
        }

        let divide = chunks.iter().find(|c| c.name == "divide").unwrap();
        assert!(divide.content.contains("Cannot divide by zero"));
    }

    #[test]
    fn python_decorators_included_in_range() {
        let source = "@staticmethod\ndef helper():\n    return 1\n";
        let chunks = chunker().chunk_file("util.py", "/p/util.py", source);
        let helper = chunks.iter().find(|c| c.name == "helper").unwrap();
        assert_eq!(helper.start_line, 1);
        assert!(helper.content.starts_with("@staticmethod"));
    }

    #[test]
    fn python_nested_function_records_parent() {
        let source = "def outer():\n    def inner():\n        pass\n    return inner\n";
        let chunks = chunker().chunk_file("nest.py", "/p/nest.py", source);
        let inner = chunks.iter().find(|c| c.name == "inner").unwrap();
        assert_eq!(inner.parent_function, "outer");
        assert_eq!(inner.chunk_type, "function");
    }

    #[test]
    fn python_syntax_error_falls_back_to_regex() {
        let source = "def broken(:\n    pass\n\ndef fine():\n    return 2\n";
        let chunks = chunker().chunk_file("broken.py", "/p/broken.py", source);
        assert!(chunks.iter().any(|c| c.name == "fine"));
    }

    #[test]
    fn javascript_functions_and_classes() {
        let source = "export function greet(name) {\n  return `hi ${name}`;\n}\n\nclass Widget {\n  render() {\n    return null;\n  }\n}\n";
        let chunks = chunker().chunk_file("app.js", "/p/app.js", source);
        assert!(chunks.iter().any(|c| c.name == "greet" && c.chunk_type == "function"));
        assert!(chunks.iter().any(|c| c.name == "Widget" && c.chunk_type == "class"));
    }

    #[test]
    fn go_methods_carry_receiver_name() {
        let source = "func (s *Server) Start() error {\n\treturn nil\n}\n\nfunc main() {\n\tprintln(\"ok\")\n}\n";
        let chunks = chunker().chunk_file("main.go", "/p/main.go", source);
        assert!(chunks.iter().any(|c| c.name == "s.Start" && c.chunk_type == "method"));
        assert!(chunks.iter().any(|c| c.name == "main" && c.chunk_type == "function"));
    }

    #[test]
    fn markdown_sections_with_overlap() {
        let mut source = String::new();
        for (heading, word) in [("Install", "install"), ("Usage", "usage"), ("License", "license")] {
            source.push_str(&format!("# {heading}\n"));
            for i in 0..10 {
                source.push_str(&format!("Some {word} prose line {i}.\n"));
            }
        }

        let chunks = chunker().chunk_file("README.md", "/p/README.md", &source);
        let sections: Vec<_> = chunks.iter().filter(|c| c.chunk_type == "section").collect();
        assert!(sections.len() >= 3);
        let names: Vec<&str> = sections.iter().map(|c| c.name.as_str()).collect();
        assert!(names.contains(&"Install"));
        assert!(names.contains(&"Usage"));
        assert!(names.contains(&"License"));

        // Consecutive sections share a 3-line tail.
        let install = sections.iter().find(|c| c.name == "Install").unwrap();
        let usage = sections.iter().find(|c| c.name == "Usage").unwrap();
        let install_tail: Vec<&str> = install.content.lines().rev().take(3).collect();
        for line in install_tail {
            assert!(usage.content.contains(line), "missing overlap line: {line}");
        }
    }

    #[test]
    fn plain_text_without_headings_is_one_section() {
        let source = "just a paragraph\nwith two lines\n";
        let chunks = chunker().chunk_file("notes.txt", "/p/notes.txt", source);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_type, "section");
        assert_eq!(chunks[0].name, "content");
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, 2);
    }

    #[test]
    fn toml_splits_on_sections() {
        let source = "top = 1\n\n[server]\nhost = \"localhost\"\nport = 8080\n\n[client]\nretries = 3\n";
        let chunks = chunker().chunk_file("app.toml", "/p/app.toml", source);
        let names: Vec<&str> = chunks.iter().map(|c| c.name.as_str()).collect();
        assert!(names.contains(&"config"));
        assert!(names.contains(&"server"));
        assert!(names.contains(&"client"));
        assert!(chunks.iter().all(|c| c.chunk_type == "config_section"));
    }

    #[test]
    fn yaml_splits_on_top_level_keys() {
        let source = "server:\n  host: localhost\nclient:\n  retries: 3\n";
        let chunks = chunker().chunk_file("app.yaml", "/p/app.yaml", source);
        let names: Vec<&str> = chunks.iter().map(|c| c.name.as_str()).collect();
        assert!(names.contains(&"server"));
        assert!(names.contains(&"client"));
    }

    #[test]
    fn json_is_a_single_chunk() {
        let source = "{\n  \"name\": \"demo\",\n  \"version\": \"1.0\"\n}\n";
        let chunks = chunker().chunk_file("package.json", "/p/package.json", source);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_type, "config");
        assert_eq!(chunks[0].name, "package");
    }

    #[test]
    fn file_at_max_size_is_one_chunk() {
        let max = 20;
        let source: String = (0..max).map(|i| format!("line {i} of plain code\n")).collect();
        let chunks = small_chunker(max, 2).chunk_file("data.unknownext", "/p/d", &source);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, max);
    }

    #[test]
    fn file_over_max_size_splits_with_links() {
        let max = 20;
        let source: String = (0..max + 5).map(|i| format!("line {i} of plain code\n")).collect();
        let chunks = small_chunker(max, 2).chunk_file("data.unknownext", "/p/d", &source);
        assert!(chunks.len() >= 2);

        for pair in chunks.windows(2) {
            assert_eq!(pair[0].next_chunk_id, pair[1].chunk_id);
            assert_eq!(pair[1].prev_chunk_id, pair[0].chunk_id);
            assert_eq!(pair[0].chunk_index + 1, pair[1].chunk_index);
        }
        assert!(chunks.first().unwrap().prev_chunk_id.is_empty());
        assert!(chunks.last().unwrap().next_chunk_id.is_empty());
    }

    #[test]
    fn oversized_structural_chunk_subdivides_with_part_names() {
        let mut source = String::from("def big():\n");
        for i in 0..60 {
            source.push_str(&format!("    x{i} = {i}\n"));
        }
        let chunks = small_chunker(25, 2).chunk_file("big.py", "/p/big.py", &source);
        assert!(chunks.len() >= 2);
        assert!(chunks.iter().any(|c| c.name == "big_part1"));
        assert!(chunks.iter().any(|c| c.name == "big_part2"));
        assert!(chunks.iter().all(|c| c.chunk_type == "function"));
    }

    #[test]
    fn line_ranges_stay_within_file() {
        let chunks = chunker().chunk_file("calculator.py", "/p/calculator.py", CALCULATOR);
        let file_lines = CALCULATOR.lines().count();
        for chunk in &chunks {
            assert!(chunk.start_line >= 1);
            assert!(chunk.start_line <= chunk.end_line);
            assert!(chunk.end_line <= file_lines);
            assert_eq!(chunk.file_lines, file_lines);
        }
        // Sorted by chunk_index, start lines never decrease.
        for pair in chunks.windows(2) {
            assert!(pair[0].start_line <= pair[1].start_line);
        }
    }

    #[test]
    fn chunk_ids_differ_for_same_stem() {
        let a = chunk_id_prefix("src/mod.rs");
        let b = chunk_id_prefix("lib/mod.rs");
        assert_ne!(a, b);
    }

    #[test]
    fn empty_content_produces_no_chunks() {
        assert!(chunker().chunk_file("empty.py", "/p/empty.py", "").is_empty());
        assert!(chunker().chunk_file("blank.md", "/p/blank.md", "  \n\n ").is_empty());
    }

    #[test]
    fn shebang_detection_without_extension() {
        assert_eq!(
            detect_language(Path::new("runner"), "#!/usr/bin/env python\nprint('hi')\n"),
            "python"
        );
        assert_eq!(
            detect_language(Path::new("setup"), "#!/bin/bash\necho hi\n"),
            "bash"
        );
    }
}
