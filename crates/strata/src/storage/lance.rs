use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arrow_array::{
    Array, FixedSizeListArray, Float32Array, Int64Array, RecordBatch, RecordBatchIterator,
    StringArray, TimestampMicrosecondArray,
};
use arrow_schema::{DataType, Field, Schema, TimeUnit};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::TryStreamExt;
use lancedb::connection::Connection;
use lancedb::index::Index;
use lancedb::index::vector::IvfPqIndexBuilder;
use lancedb::query::{ExecutableQuery, QueryBase, Select};
use lancedb::{DistanceType, Table};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::DurableConfig;
use crate::error::{Result, StrataError};
use crate::memory::{
    MemoryRecord, Metadata, Removals, ScoredRecord, TierState, rank_by_similarity,
};
use crate::storage::DurableTier;
use crate::storage::filter::{MetadataFilter, encode_tags};
use crate::storage::pool::{ConnectionPool, PoolStats, PooledConnection};

const RECORDS_TABLE: &str = "records";

/// IVF-PQ training needs at least this many rows
const MIN_INDEX_ROWS: usize = 256;

/// LanceDB-backed durable tier for one deployment directory
pub struct LanceStore {
    name: String,
    path: PathBuf,
    connection: Connection,
    records: Option<ConnectionPool<Table>>,
    dimension: usize,
    config: DurableConfig,
    /// Remaining ids of the paged scan in progress
    cursor: Mutex<Option<ScanCursor>>,
}

/// Sorted ids read on a scan's first page, handed out page by page
#[derive(Debug)]
struct ScanCursor {
    last: Uuid,
    remaining: VecDeque<Uuid>,
}

impl LanceStore {
    pub async fn connect(
        path: &Path,
        name: &str,
        dimension: usize,
        config: &DurableConfig,
    ) -> Result<Self> {
        let uri = path
            .to_str()
            .ok_or_else(|| StrataError::Storage("Invalid path encoding".to_string()))?;

        // Several handles may point at one deployment during migration; always
        // read the latest committed version.
        let connection = lancedb::connect(uri)
            .read_consistency_interval(Duration::ZERO)
            .execute()
            .await
            .map_err(|e| StrataError::Storage(format!("Failed to connect to LanceDB: {e}")))?;

        Ok(Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            connection,
            records: None,
            dimension,
            config: config.clone(),
            cursor: Mutex::new(None),
        })
    }

    /// Connect and create or open the records table
    pub async fn open(
        path: &Path,
        name: &str,
        dimension: usize,
        config: &DurableConfig,
    ) -> Result<Self> {
        let mut store = Self::connect(path, name, dimension, config).await?;
        if store.table_exists(RECORDS_TABLE).await? {
            store.open_records_table().await?;
        } else {
            store.create_records_table().await?;
        }
        Ok(store)
    }

    fn records_schema(dimension: usize) -> Arc<Schema> {
        let timestamp = DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()));
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("content", DataType::Utf8, false),
            Field::new(
                "embedding",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    dimension as i32,
                ),
                false,
            ),
            Field::new("metadata", DataType::Utf8, false),
            Field::new("metadata_tags", DataType::Utf8, false),
            Field::new("relationships", DataType::Utf8, false),
            Field::new("created_at", timestamp.clone(), false),
            Field::new("last_accessed_at", timestamp.clone(), false),
            Field::new("updated_at", timestamp, false),
            Field::new("version", DataType::Int64, false),
        ]))
    }

    pub async fn create_records_table(&mut self) -> Result<()> {
        let schema = Self::records_schema(self.dimension);
        let batch = Self::records_to_batch(&[], self.dimension, schema.clone())?;
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);

        let table = self
            .connection
            .create_table(RECORDS_TABLE, Box::new(batches))
            .execute()
            .await
            .map_err(|e| StrataError::Storage(format!("Failed to create records table: {e}")))?;

        info!("Created records table for deployment {}", self.name);
        self.records = Some(self.pool_for(table));
        Ok(())
    }

    pub async fn open_records_table(&mut self) -> Result<()> {
        let table = self
            .connection
            .open_table(RECORDS_TABLE)
            .execute()
            .await
            .map_err(|e| StrataError::Storage(format!("Failed to open records table: {e}")))?;

        let schema = table
            .schema()
            .await
            .map_err(|e| StrataError::Storage(format!("Failed to read table schema: {e}")))?;
        let stored_dimension = schema
            .field_with_name("embedding")
            .ok()
            .and_then(|field| match field.data_type() {
                DataType::FixedSizeList(_, size) => Some(*size as usize),
                _ => None,
            });
        if stored_dimension != Some(self.dimension) {
            return Err(StrataError::Config(format!(
                "deployment {} stores {:?}-dimensional embeddings, configured dimension is {}",
                self.name, stored_dimension, self.dimension
            )));
        }

        self.records = Some(self.pool_for(table));
        Ok(())
    }

    pub async fn table_exists(&self, name: &str) -> Result<bool> {
        let names = self
            .connection
            .table_names()
            .execute()
            .await
            .map_err(|e| StrataError::Storage(format!("Failed to list tables: {e}")))?;

        Ok(names.contains(&name.to_string()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn pool_stats(&self) -> Option<PoolStats> {
        self.records.as_ref().map(ConnectionPool::stats)
    }

    fn pool_for(&self, table: Table) -> ConnectionPool<Table> {
        ConnectionPool::new(
            table,
            self.config.connection_pool_size,
            self.config.acquire_timeout(),
        )
    }

    async fn table(&self) -> Result<PooledConnection<'_, Table>> {
        self.records
            .as_ref()
            .ok_or_else(|| StrataError::Storage("Records table not initialized".to_string()))?
            .acquire()
            .await
    }

    /// Convert records to an Arrow RecordBatch
    fn records_to_batch(
        records: &[MemoryRecord],
        dimension: usize,
        schema: Arc<Schema>,
    ) -> Result<RecordBatch> {
        let ids: Vec<String> = records.iter().map(|r| r.id.to_string()).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();

        let contents: Vec<&str> = records.iter().map(|r| r.content.as_str()).collect();

        let embeddings: Vec<Option<Vec<Option<f32>>>> = records
            .iter()
            .map(|r| Some(r.embedding.iter().map(|&v| Some(v)).collect()))
            .collect();

        let metadata = records
            .iter()
            .map(|r| serde_json::to_string(&r.metadata))
            .collect::<std::result::Result<Vec<String>, _>>()?;
        let metadata_refs: Vec<&str> = metadata.iter().map(String::as_str).collect();

        let tags: Vec<String> = records.iter().map(|r| encode_tags(&r.metadata)).collect();
        let tag_refs: Vec<&str> = tags.iter().map(String::as_str).collect();

        let relationships: Vec<String> = records
            .iter()
            .map(|r| {
                r.relationships
                    .iter()
                    .map(Uuid::to_string)
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .collect();
        let relationship_refs: Vec<&str> = relationships.iter().map(String::as_str).collect();

        let created_at: Vec<i64> = records
            .iter()
            .map(|r| r.created_at.timestamp_micros())
            .collect();
        let last_accessed_at: Vec<i64> = records
            .iter()
            .map(|r| r.last_accessed_at.timestamp_micros())
            .collect();
        let updated_at: Vec<i64> = records
            .iter()
            .map(|r| r.updated_at.timestamp_micros())
            .collect();

        let versions: Vec<i64> = records.iter().map(|r| r.version as i64).collect();

        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(id_refs)),
                Arc::new(StringArray::from(contents)),
                Arc::new(FixedSizeListArray::from_iter_primitive::<
                    arrow_array::types::Float32Type,
                    _,
                    _,
                >(embeddings, dimension as i32)),
                Arc::new(StringArray::from(metadata_refs)),
                Arc::new(StringArray::from(tag_refs)),
                Arc::new(StringArray::from(relationship_refs)),
                Arc::new(TimestampMicrosecondArray::from(created_at).with_timezone("UTC")),
                Arc::new(TimestampMicrosecondArray::from(last_accessed_at).with_timezone("UTC")),
                Arc::new(TimestampMicrosecondArray::from(updated_at).with_timezone("UTC")),
                Arc::new(Int64Array::from(versions)),
            ],
        )
        .map_err(|e| StrataError::Storage(format!("Failed to create RecordBatch: {e}")))
    }

    /// Convert an Arrow RecordBatch row back to a record
    fn batch_to_record(batch: &RecordBatch, row: usize) -> Result<MemoryRecord> {
        let id_array = column::<StringArray>(batch, "id")?;
        let content_array = column::<StringArray>(batch, "content")?;
        let embedding_array = column::<FixedSizeListArray>(batch, "embedding")?;
        let metadata_array = column::<StringArray>(batch, "metadata")?;
        let relationships_array = column::<StringArray>(batch, "relationships")?;
        let created_at_array = column::<TimestampMicrosecondArray>(batch, "created_at")?;
        let last_accessed_array = column::<TimestampMicrosecondArray>(batch, "last_accessed_at")?;
        let updated_at_array = column::<TimestampMicrosecondArray>(batch, "updated_at")?;
        let version_array = column::<Int64Array>(batch, "version")?;

        let id = parse_id(id_array.value(row))?;

        let embedding_list = embedding_array.value(row);
        let embedding_values = embedding_list
            .as_any()
            .downcast_ref::<Float32Array>()
            .ok_or_else(|| StrataError::Storage("Failed to get embedding values".to_string()))?;
        let embedding: Vec<f32> = (0..embedding_values.len())
            .map(|i| embedding_values.value(i))
            .collect();

        let metadata: Metadata = serde_json::from_str(metadata_array.value(row))?;

        let relationships_str = relationships_array.value(row);
        let relationships = if relationships_str.is_empty() {
            BTreeSet::new()
        } else {
            relationships_str
                .split(',')
                .map(parse_id)
                .collect::<Result<BTreeSet<Uuid>>>()?
        };

        Ok(MemoryRecord {
            id,
            embedding,
            content: content_array.value(row).to_string(),
            metadata,
            tier_state: TierState::DurableOnly,
            created_at: micros_to_datetime(created_at_array.value(row), "created_at")?,
            last_accessed_at: micros_to_datetime(
                last_accessed_array.value(row),
                "last_accessed_at",
            )?,
            updated_at: micros_to_datetime(updated_at_array.value(row), "updated_at")?,
            version: version_array.value(row).max(0) as u64,
            relationships,
            removals: Removals::default(),
        })
    }

    fn batches_to_records(batches: &[RecordBatch]) -> Result<Vec<MemoryRecord>> {
        let mut records = Vec::new();
        for batch in batches {
            for row in 0..batch.num_rows() {
                records.push(Self::batch_to_record(batch, row)?);
            }
        }
        Ok(records)
    }

    /// Run a plain (non-vector) query and decode every returned row
    async fn query_records(&self, filter: Option<String>) -> Result<Vec<MemoryRecord>> {
        let table = self.table().await?;

        let mut query = table.query();
        if let Some(filter) = filter {
            query = query.only_if(filter);
        }

        let stream = query
            .execute()
            .await
            .map_err(|e| StrataError::Storage(format!("Failed to query records: {e}")))?;

        let batches: Vec<RecordBatch> = stream
            .try_collect()
            .await
            .map_err(|e| StrataError::Storage(format!("Failed to collect query results: {e}")))?;

        Self::batches_to_records(&batches)
    }

    /// Ids (and update times) of every row matching `filter`
    async fn query_ids(&self, filter: Option<String>) -> Result<Vec<(Uuid, i64)>> {
        let table = self.table().await?;

        let mut query = table
            .query()
            .select(Select::columns(&["id", "updated_at"]));
        if let Some(filter) = filter {
            query = query.only_if(filter);
        }

        let stream = query
            .execute()
            .await
            .map_err(|e| StrataError::Storage(format!("Failed to query ids: {e}")))?;

        let batches: Vec<RecordBatch> = stream
            .try_collect()
            .await
            .map_err(|e| StrataError::Storage(format!("Failed to collect ids: {e}")))?;

        let mut ids = Vec::new();
        for batch in &batches {
            let id_array = column::<StringArray>(batch, "id")?;
            let updated_array = column::<TimestampMicrosecondArray>(batch, "updated_at")?;
            for row in 0..batch.num_rows() {
                ids.push((parse_id(id_array.value(row))?, updated_array.value(row)));
            }
        }
        Ok(ids)
    }

    async fn fetch_many(&self, ids: &[Uuid]) -> Result<Vec<MemoryRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut records = self.query_records(Some(id_in_clause(ids))).await?;
        records.sort_by_key(|r| r.id);
        Ok(records)
    }
}

#[async_trait]
impl DurableTier for LanceStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, record: &MemoryRecord) -> Result<()> {
        self.write_batch(std::slice::from_ref(record)).await
    }

    async fn write_batch(&self, records: &[MemoryRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        for record in records {
            record.validate(self.dimension)?;
        }

        let table = self.table().await?;

        let schema = Self::records_schema(self.dimension);
        let batch = Self::records_to_batch(records, self.dimension, schema.clone())?;
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);

        let mut merge = table.merge_insert(&["id"]);
        merge
            .when_matched_update_all(None)
            .when_not_matched_insert_all();
        merge
            .execute(Box::new(batches))
            .await
            .map_err(|e| StrataError::Storage(format!("Failed to upsert records: {e}")))?;

        debug!("Upserted {} record(s) into {}", records.len(), self.name);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<MemoryRecord>> {
        let records = self.query_records(Some(format!("id = '{id}'"))).await?;
        Ok(records.into_iter().next())
    }

    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredRecord>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        if query.len() != self.dimension {
            return Err(StrataError::InvalidRecord(format!(
                "query has dimension {}, expected {}",
                query.len(),
                self.dimension
            )));
        }

        let table = self.table().await?;

        let mut vector_query = table
            .query()
            .nearest_to(query)
            .map_err(|e| StrataError::Storage(format!("Failed to create vector query: {e}")))?
            .distance_type(DistanceType::Cosine)
            .nprobes(self.config.nprobes)
            .limit(top_k);
        if self.config.refine_factor > 0 {
            vector_query = vector_query.refine_factor(self.config.refine_factor);
        }

        if let Some(sql_filter) = filter.and_then(MetadataFilter::to_sql_clause) {
            vector_query = vector_query.only_if(sql_filter);
        }

        let stream = vector_query
            .execute()
            .await
            .map_err(|e| StrataError::Storage(format!("Failed to execute search: {e}")))?;

        let batches: Vec<RecordBatch> = stream
            .try_collect()
            .await
            .map_err(|e| StrataError::Storage(format!("Failed to collect search results: {e}")))?;

        let mut results: Vec<ScoredRecord> = Self::batches_to_records(&batches)?
            .into_iter()
            .filter(|record| filter.is_none_or(|f| f.matches(record)))
            .map(|record| ScoredRecord::score(query, record))
            .collect();

        rank_by_similarity(&mut results);
        results.truncate(top_k);
        Ok(results)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let exists = self.get(id).await?.is_some();

        if exists {
            let table = self.table().await?;
            table
                .delete(&format!("id = '{id}'"))
                .await
                .map_err(|e| StrataError::Storage(format!("Failed to delete record: {e}")))?;
        }

        Ok(exists)
    }

    async fn scan(&self, after: Option<Uuid>, limit: usize) -> Result<Vec<MemoryRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        // Continuing the previous page reuses its id list instead of
        // re-reading every id after the watermark
        let resumed = self
            .cursor
            .lock()
            .ok()
            .and_then(|mut cursor| cursor.take())
            .filter(|cursor| after.is_some_and(|id| id == cursor.last))
            .map(|cursor| cursor.remaining);

        let mut remaining = match resumed {
            Some(remaining) => remaining,
            None => {
                let filter = after.map(|id| format!("id > '{id}'"));
                let mut ids: Vec<Uuid> = self
                    .query_ids(filter)
                    .await?
                    .into_iter()
                    .map(|(id, _)| id)
                    .collect();
                ids.sort_unstable();
                VecDeque::from(ids)
            }
        };

        loop {
            let page: Vec<Uuid> = remaining.drain(..limit.min(remaining.len())).collect();
            if page.is_empty() {
                return Ok(Vec::new());
            }
            // Ids deleted since the list was read come back missing
            let records = self.fetch_many(&page).await?;
            let Some(last) = records.last().map(|r| r.id) else {
                continue;
            };

            if !remaining.is_empty() {
                if let Ok(mut cursor) = self.cursor.lock() {
                    *cursor = Some(ScanCursor { last, remaining });
                }
            }
            return Ok(records);
        }
    }

    async fn ids(&self) -> Result<Vec<Uuid>> {
        let mut ids: Vec<Uuid> = self
            .query_ids(None)
            .await?
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn modified_since(&self, since: DateTime<Utc>) -> Result<Vec<MemoryRecord>> {
        let since = since.timestamp_micros();
        let mut ids: Vec<Uuid> = self
            .query_ids(None)
            .await?
            .into_iter()
            .filter(|(_, updated)| *updated >= since)
            .map(|(id, _)| id)
            .collect();
        ids.sort_unstable();

        self.fetch_many(&ids).await
    }

    async fn count(&self) -> Result<usize> {
        let table = self.table().await?;
        table
            .count_rows(None)
            .await
            .map_err(|e| StrataError::Storage(format!("Failed to count rows: {e}")))
    }

    async fn touch(&self, ids: &[Uuid], at: DateTime<Utc>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let table = self.table().await?;
        let micros = at.timestamp_micros();

        table
            .update()
            .only_if(id_in_clause(ids))
            .column("last_accessed_at", format!("{micros}"))
            .execute()
            .await
            .map_err(|e| StrataError::Storage(format!("Failed to update access time: {e}")))?;

        Ok(())
    }

    async fn build_index(&self) -> Result<bool> {
        let row_count = self.count().await?;
        let partitions = self.config.ann_partitions.max(1);

        if row_count < MIN_INDEX_ROWS.max(partitions) {
            debug!(
                "Skipping index build for {}: {} rows, need {}",
                self.name,
                row_count,
                MIN_INDEX_ROWS.max(partitions)
            );
            return Ok(false);
        }

        let sub_vectors = sub_vectors_for(self.dimension, self.config.ann_sub_vectors);
        let ivf_pq = IvfPqIndexBuilder::default()
            .distance_type(DistanceType::Cosine)
            .num_partitions(partitions as u32)
            .num_sub_vectors(sub_vectors as u32);

        let table = self.table().await?;
        table
            .create_index(&["embedding"], Index::IvfPq(ivf_pq))
            .replace(true)
            .execute()
            .await
            .map_err(|e| StrataError::Storage(format!("Failed to create vector index: {e}")))?;

        info!(
            "Built IVF-PQ index on {} ({} rows, {} partitions, {} sub-vectors)",
            self.name, row_count, partitions, sub_vectors
        );
        Ok(true)
    }

    async fn destroy(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => {
                info!("Destroyed deployment {} at {}", self.name, self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StrataError::Storage(format!(
                "Failed to remove deployment {}: {e}",
                self.path.display()
            ))),
        }
    }
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .ok_or_else(|| StrataError::Storage(format!("Failed to get {name} column")))
}

fn parse_id(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| StrataError::Storage(format!("Failed to parse UUID: {e}")))
}

fn micros_to_datetime(micros: i64, field: &str) -> Result<DateTime<Utc>> {
    Utc.timestamp_micros(micros)
        .single()
        .ok_or_else(|| StrataError::Storage(format!("Failed to parse {field} timestamp")))
}

fn id_in_clause(ids: &[Uuid]) -> String {
    let list: Vec<String> = ids.iter().map(|id| format!("'{id}'")).collect();
    format!("id IN ({})", list.join(", "))
}

/// Largest divisor of `dimension` not above `wanted`
fn sub_vectors_for(dimension: usize, wanted: usize) -> usize {
    (1..=wanted.clamp(1, dimension.max(1)))
        .rev()
        .find(|n| dimension % n == 0)
        .unwrap_or(1)
}
