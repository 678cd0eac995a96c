use anyhow::{anyhow, Result};
use arrow_array::{
    types::Float32Type, Array, FixedSizeListArray, Float32Array, Int32Array, RecordBatch,
    RecordBatchIterator, StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use futures::StreamExt;
use lancedb::arrow::SendableRecordBatchStream;
use lancedb::query::{ExecutableQuery, QueryBase, Select};
use lancedb::{connect, Connection, DistanceType, Table};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

use crate::chunker::Chunk;

const TABLE_NAME: &str = "code_vectors";
const SCAN_LIMIT: usize = 1_000_000;

/// A chunk row as read back from the store (metadata only; the vector
/// column is not materialized on reads).
#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub chunk_id: String,
    pub file_path: String,
    pub absolute_path: String,
    pub content: String,
    pub start_line: usize,
    pub end_line: usize,
    pub chunk_type: String,
    pub name: String,
    pub language: String,
    pub parent_class: String,
    pub parent_function: String,
    pub prev_chunk_id: String,
    pub next_chunk_id: String,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub file_lines: usize,
    pub indexed_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub total_chunks: usize,
    pub unique_files: usize,
    pub chunk_types: HashMap<String, usize>,
    pub languages: HashMap<String, usize>,
}

/// Metadata filters pushed into the nearest-neighbor query.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub chunk_types: Option<Vec<String>>,
    pub languages: Option<Vec<String>>,
}

impl SearchFilters {
    fn predicate(&self) -> Option<String> {
        let mut clauses = Vec::new();
        if let Some(types) = &self.chunk_types {
            if !types.is_empty() {
                clauses.push(format!("chunk_type IN ({})", quoted_list(types)));
            }
        }
        if let Some(languages) = &self.languages {
            if !languages.is_empty() {
                clauses.push(format!("language IN ({})", quoted_list(languages)));
            }
        }
        if clauses.is_empty() {
            None
        } else {
            Some(clauses.join(" AND "))
        }
    }
}

fn sql_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn quoted_list(values: &[String]) -> String {
    values
        .iter()
        .map(|v| sql_quote(v))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Persistent chunk storage with approximate nearest-neighbor search,
/// backed by a LanceDB table. One writer (the indexer) at a time; readers
/// see a snapshot of the table as of when they opened it.
pub struct VectorStore {
    conn: Connection,
    dim: usize,
}

impl VectorStore {
    /// Open the store, creating the table if needed. An existing table whose
    /// embedding dimension differs from `dim` is dropped and recreated; the
    /// caller is expected to re-index afterwards.
    pub async fn open_or_create(dir: &Path, dim: usize) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let uri = dir
            .to_str()
            .ok_or_else(|| anyhow!("non-unicode store path: {:?}", dir))?;
        let conn = connect(uri).execute().await?;

        match conn.open_table(TABLE_NAME).execute().await {
            Ok(table) => {
                let schema = table.schema().await?;
                if embedding_dim_of(&schema) != Some(dim) {
                    warn!(
                        expected = dim,
                        "embedding dimension mismatch; dropping and recreating the vector table"
                    );
                    conn.drop_table(TABLE_NAME).await?;
                    conn.create_empty_table(TABLE_NAME, chunk_schema(dim))
                        .execute()
                        .await?;
                }
            }
            Err(_) => {
                conn.create_empty_table(TABLE_NAME, chunk_schema(dim))
                    .execute()
                    .await?;
            }
        }

        Ok(Self { conn, dim })
    }

    /// Open an existing store for reading. Fails if the project has never
    /// been indexed.
    pub async fn open(dir: &Path) -> Result<Self> {
        let uri = dir
            .to_str()
            .ok_or_else(|| anyhow!("non-unicode store path: {:?}", dir))?;
        let conn = connect(uri).execute().await?;
        let table = conn
            .open_table(TABLE_NAME)
            .execute()
            .await
            .map_err(|_| anyhow!("no search index found at {}; run `mini-rag index` first", dir.display()))?;
        let schema = table.schema().await?;
        let dim = embedding_dim_of(&schema)
            .ok_or_else(|| anyhow!("store schema is missing the embedding column"))?;
        Ok(Self { conn, dim })
    }

    pub fn dimension(&self) -> usize {
        self.dim
    }

    async fn table(&self) -> Result<Table> {
        Ok(self.conn.open_table(TABLE_NAME).execute().await?)
    }

    /// Atomically replace every row for `file_path` with the given chunk
    /// set. An empty chunk set just clears the file's rows.
    pub async fn upsert_file(
        &self,
        file_path: &str,
        chunks: &[Chunk],
        embeddings: &[Vec<f32>],
    ) -> Result<()> {
        let table = self.table().await?;
        table
            .delete(&format!("file_path = {}", sql_quote(file_path)))
            .await?;
        if chunks.is_empty() {
            return Ok(());
        }
        self.append(&table, chunks, embeddings).await
    }

    /// Append a batch of chunks. The caller guarantees no duplicate
    /// chunk_id; used for bulk initial indexing.
    pub async fn add_batch(&self, chunks: &[Chunk], embeddings: &[Vec<f32>]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        let table = self.table().await?;
        self.append(&table, chunks, embeddings).await
    }

    async fn append(&self, table: &Table, chunks: &[Chunk], embeddings: &[Vec<f32>]) -> Result<()> {
        if chunks.len() != embeddings.len() {
            return Err(anyhow!(
                "chunk/embedding count mismatch: {} vs {}",
                chunks.len(),
                embeddings.len()
            ));
        }
        for embedding in embeddings {
            if embedding.len() != self.dim {
                return Err(anyhow!(
                    "embedding dimension mismatch: expected {}, got {}",
                    self.dim,
                    embedding.len()
                ));
            }
        }

        let schema = chunk_schema(self.dim);
        let batch = batch_from_chunks(&schema, chunks, embeddings, self.dim)?;
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
        table.add(batches).execute().await?;
        Ok(())
    }

    pub async fn delete_file(&self, file_path: &str) -> Result<()> {
        let table = self.table().await?;
        table
            .delete(&format!("file_path = {}", sql_quote(file_path)))
            .await?;
        Ok(())
    }

    pub async fn delete_files(&self, file_paths: &[String]) -> Result<()> {
        if file_paths.is_empty() {
            return Ok(());
        }
        let table = self.table().await?;
        table
            .delete(&format!("file_path IN ({})", quoted_list(file_paths)))
            .await?;
        Ok(())
    }

    /// Drop every row, keeping the schema.
    pub async fn reset(&self) -> Result<()> {
        self.conn.drop_table(TABLE_NAME).await?;
        self.conn
            .create_empty_table(TABLE_NAME, chunk_schema(self.dim))
            .execute()
            .await?;
        Ok(())
    }

    /// Up to `k` rows by ascending cosine distance to `query`.
    pub async fn nearest(
        &self,
        query: &[f32],
        k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<(StoredChunk, f32)>> {
        if query.len() != self.dim {
            return Err(anyhow!(
                "query dimension mismatch: expected {}, got {}",
                self.dim,
                query.len()
            ));
        }
        let table = self.table().await?;
        let mut builder = table
            .vector_search(query.to_vec())?
            .distance_type(DistanceType::Cosine)
            .limit(k);
        if let Some(predicate) = filters.predicate() {
            builder = builder.only_if(predicate);
        }
        let stream = builder.execute().await?;
        let rows = collect_rows(stream).await?;
        Ok(rows
            .into_iter()
            .map(|(chunk, distance)| (chunk, distance.unwrap_or(0.0)))
            .collect())
    }

    pub async fn get_by_id(&self, chunk_id: &str) -> Result<Option<StoredChunk>> {
        let table = self.table().await?;
        let stream = table
            .query()
            .select(metadata_columns())
            .only_if(format!("chunk_id = {}", sql_quote(chunk_id)))
            .limit(1)
            .execute()
            .await?;
        let mut rows = collect_rows(stream).await?;
        Ok(rows.pop().map(|(chunk, _)| chunk))
    }

    /// Every row's metadata; feeds the BM25 index and link resolution.
    pub async fn scan(&self) -> Result<Vec<StoredChunk>> {
        let table = self.table().await?;
        let stream = table
            .query()
            .select(metadata_columns())
            .limit(SCAN_LIMIT)
            .execute()
            .await?;
        let rows = collect_rows(stream).await?;
        Ok(rows.into_iter().map(|(chunk, _)| chunk).collect())
    }

    pub async fn count(&self) -> Result<usize> {
        let table = self.table().await?;
        Ok(table.count_rows(None).await?)
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        let chunks = self.scan().await?;
        Ok(stats_of(&chunks))
    }
}

pub fn stats_of<'a, I>(chunks: I) -> StoreStats
where
    I: IntoIterator<Item = &'a StoredChunk>,
{
    let mut stats = StoreStats::default();
    let mut files = std::collections::HashSet::new();
    for chunk in chunks {
        stats.total_chunks += 1;
        files.insert(chunk.file_path.as_str());
        *stats.chunk_types.entry(chunk.chunk_type.clone()).or_insert(0) += 1;
        *stats.languages.entry(chunk.language.clone()).or_insert(0) += 1;
    }
    stats.unique_files = files.len();
    stats
}

// ---- Schema and row conversion ----------------------------------------

fn chunk_schema(dim: usize) -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("chunk_id", DataType::Utf8, false),
        Field::new("file_path", DataType::Utf8, false),
        Field::new("absolute_path", DataType::Utf8, false),
        Field::new("content", DataType::Utf8, false),
        Field::new("start_line", DataType::Int32, false),
        Field::new("end_line", DataType::Int32, false),
        Field::new("chunk_type", DataType::Utf8, false),
        Field::new("name", DataType::Utf8, false),
        Field::new("language", DataType::Utf8, false),
        Field::new("parent_class", DataType::Utf8, false),
        Field::new("parent_function", DataType::Utf8, false),
        Field::new("prev_chunk_id", DataType::Utf8, false),
        Field::new("next_chunk_id", DataType::Utf8, false),
        Field::new("chunk_index", DataType::Int32, false),
        Field::new("total_chunks", DataType::Int32, false),
        Field::new("file_lines", DataType::Int32, false),
        Field::new("indexed_at", DataType::Utf8, false),
        Field::new(
            "embedding",
            DataType::FixedSizeList(
                Arc::new(Field::new("item", DataType::Float32, true)),
                dim as i32,
            ),
            false,
        ),
    ]))
}

fn embedding_dim_of(schema: &Schema) -> Option<usize> {
    match schema.field_with_name("embedding").ok()?.data_type() {
        DataType::FixedSizeList(_, size) => Some(*size as usize),
        _ => None,
    }
}

fn metadata_columns() -> Select {
    Select::Columns(
        [
            "chunk_id",
            "file_path",
            "absolute_path",
            "content",
            "start_line",
            "end_line",
            "chunk_type",
            "name",
            "language",
            "parent_class",
            "parent_function",
            "prev_chunk_id",
            "next_chunk_id",
            "chunk_index",
            "total_chunks",
            "file_lines",
            "indexed_at",
        ]
        .iter()
        .map(|c| c.to_string())
        .collect(),
    )
}

fn batch_from_chunks(
    schema: &Arc<Schema>,
    chunks: &[Chunk],
    embeddings: &[Vec<f32>],
    dim: usize,
) -> Result<RecordBatch> {
    let strings = |f: fn(&Chunk) -> &str| {
        Arc::new(StringArray::from(
            chunks.iter().map(f).collect::<Vec<_>>(),
        )) as Arc<dyn Array>
    };
    let ints = |f: fn(&Chunk) -> usize| {
        Arc::new(Int32Array::from(
            chunks.iter().map(|c| f(c) as i32).collect::<Vec<_>>(),
        )) as Arc<dyn Array>
    };
    let vectors = FixedSizeListArray::from_iter_primitive::<Float32Type, _, _>(
        embeddings.iter().map(|e| Some(e.iter().map(|x| Some(*x)))),
        dim as i32,
    );

    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            strings(|c| &c.chunk_id),
            strings(|c| &c.file_path),
            strings(|c| &c.absolute_path),
            strings(|c| &c.content),
            ints(|c| c.start_line),
            ints(|c| c.end_line),
            strings(|c| &c.chunk_type),
            strings(|c| &c.name),
            strings(|c| &c.language),
            strings(|c| &c.parent_class),
            strings(|c| &c.parent_function),
            strings(|c| &c.prev_chunk_id),
            strings(|c| &c.next_chunk_id),
            ints(|c| c.chunk_index),
            ints(|c| c.total_chunks),
            ints(|c| c.file_lines),
            strings(|c| &c.indexed_at),
            Arc::new(vectors),
        ],
    )?;
    Ok(batch)
}

async fn collect_rows(mut stream: SendableRecordBatchStream) -> Result<Vec<(StoredChunk, Option<f32>)>> {
    let mut rows = Vec::new();
    while let Some(batch) = stream.next().await {
        let batch = batch?;
        decode_batch(&batch, &mut rows)?;
    }
    Ok(rows)
}

fn decode_batch(batch: &RecordBatch, rows: &mut Vec<(StoredChunk, Option<f32>)>) -> Result<()> {
    let str_col = |name: &str| -> Result<&StringArray> {
        batch
            .column_by_name(name)
            .ok_or_else(|| anyhow!("missing column {name}"))?
            .as_any()
            .downcast_ref::<StringArray>()
            .ok_or_else(|| anyhow!("column {name} is not a string column"))
    };
    let int_col = |name: &str| -> Result<&Int32Array> {
        batch
            .column_by_name(name)
            .ok_or_else(|| anyhow!("missing column {name}"))?
            .as_any()
            .downcast_ref::<Int32Array>()
            .ok_or_else(|| anyhow!("column {name} is not an int column"))
    };

    let chunk_ids = str_col("chunk_id")?;
    let file_paths = str_col("file_path")?;
    let absolute_paths = str_col("absolute_path")?;
    let contents = str_col("content")?;
    let start_lines = int_col("start_line")?;
    let end_lines = int_col("end_line")?;
    let chunk_types = str_col("chunk_type")?;
    let names = str_col("name")?;
    let languages = str_col("language")?;
    let parent_classes = str_col("parent_class")?;
    let parent_functions = str_col("parent_function")?;
    let prev_chunk_ids = str_col("prev_chunk_id")?;
    let next_chunk_ids = str_col("next_chunk_id")?;
    let chunk_indices = int_col("chunk_index")?;
    let total_chunks = int_col("total_chunks")?;
    let file_lines = int_col("file_lines")?;
    let indexed_ats = str_col("indexed_at")?;

    let distances: Option<&Float32Array> = batch
        .column_by_name("_distance")
        .and_then(|col| col.as_any().downcast_ref::<Float32Array>());

    for i in 0..batch.num_rows() {
        let chunk = StoredChunk {
            chunk_id: chunk_ids.value(i).to_string(),
            file_path: file_paths.value(i).to_string(),
            absolute_path: absolute_paths.value(i).to_string(),
            content: contents.value(i).to_string(),
            start_line: start_lines.value(i) as usize,
            end_line: end_lines.value(i) as usize,
            chunk_type: chunk_types.value(i).to_string(),
            name: names.value(i).to_string(),
            language: languages.value(i).to_string(),
            parent_class: parent_classes.value(i).to_string(),
            parent_function: parent_functions.value(i).to_string(),
            prev_chunk_id: prev_chunk_ids.value(i).to_string(),
            next_chunk_id: next_chunk_ids.value(i).to_string(),
            chunk_index: chunk_indices.value(i) as usize,
            total_chunks: total_chunks.value(i) as usize,
            file_lines: file_lines.value(i) as usize,
            indexed_at: indexed_ats.value(i).to_string(),
        };
        rows.push((chunk, distances.map(|d| d.value(i))));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_escapes_single_quotes() {
        assert_eq!(sql_quote("a'b"), "'a''b'");
        assert_eq!(sql_quote("plain"), "'plain'");
    }

    #[test]
    fn filter_predicate_composition() {
        let empty = SearchFilters::default();
        assert_eq!(empty.predicate(), None);

        let filters = SearchFilters {
            chunk_types: Some(vec!["function".to_string(), "method".to_string()]),
            languages: Some(vec!["python".to_string()]),
        };
        assert_eq!(
            filters.predicate().unwrap(),
            "chunk_type IN ('function', 'method') AND language IN ('python')"
        );
    }

    #[test]
    fn schema_embeds_requested_dimension() {
        let schema = chunk_schema(384);
        assert_eq!(embedding_dim_of(&schema), Some(384));
        let schema = chunk_schema(768);
        assert_eq!(embedding_dim_of(&schema), Some(768));
    }
}
