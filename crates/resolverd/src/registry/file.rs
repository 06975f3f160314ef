//! Production [`RegistryQuery`] backend: Parquet column store + per-
//! department Hive-style partitions + a Tantivy full-text index over
//! legal-entity names (spec Section 6's "Registry files").
//!
//! The registry builder is an external collaborator (spec Section 1); this
//! module only reads what it produces. Blocking Parquet/Tantivy calls are
//! pushed onto `spawn_blocking` so a worker's async task never parks the
//! executor on disk I/O.

use super::{department_of, FetchScope, FtsHit, RegistryError, RegistryQuery};
use arrow::array::{Array, BooleanArray, StringArray};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use resolver_core::types::Candidate;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::{Schema, Value as TantivyValue, FAST, STORED, STRING, TEXT};
use tantivy::{Index, IndexReader, TantivyDocument};

/// The registry builder's sentinel for an administratively-active
/// establishment (spec's "Active establishment" glossary entry).
const ACTIVE_SENTINEL: &str = "A";

/// Column names the registry builder's Parquet files are expected to
/// carry, for both the nationwide establishment file and every
/// `dept=NN/part.parquet` partition.
mod col {
    pub const ESTABLISHMENT_ID: &str = "establishment_id";
    pub const COMPANY_ID: &str = "company_id";
    pub const OFFICIAL_NAME: &str = "official_name";
    pub const CITY: &str = "city";
    pub const ADDRESS: &str = "address";
    pub const IS_HEAD_OFFICE: &str = "is_head_office";
    pub const POSTAL: &str = "postal";
    /// Present on the nationwide file; partitions are pre-filtered and may
    /// omit it, in which case every row is assumed active.
    pub const ADMINISTRATIVE_STATE: &str = "administrative_state";
}

/// `Clone`-cheap: every field is a `PathBuf` or an `Arc`, so each worker
/// gets its own handle sharing the same open index without re-opening it
/// (spec Section 5's "shared immutable registry, per-worker handles").
#[derive(Clone)]
pub struct FileRegistry {
    /// Directory holding `establishments.parquet` and `dept=NN/part.parquet`.
    registry_root: PathBuf,
    fts_index: Arc<Index>,
    fts_reader: Arc<IndexReader>,
    fts_fields: FtsFields,
}

#[derive(Clone, Copy)]
struct FtsFields {
    company_id: tantivy::schema::Field,
    official_name: tantivy::schema::Field,
}

impl FileRegistry {
    /// Open the Tantivy index at `fts_path`. Does not touch the Parquet
    /// files — those are opened lazily, per query, since each query only
    /// ever needs one partition or the nationwide file.
    pub fn open(registry_path: &Path, fts_path: &Path) -> Result<Self, RegistryError> {
        let fts_index = Index::open_in_dir(fts_path)
            .map_err(|e| RegistryError::Transient(format!("opening fts index: {e}")))?;
        let fts_reader = fts_index
            .reader()
            .map_err(|e| RegistryError::Transient(format!("fts reader: {e}")))?;

        let schema = fts_index.schema();
        let company_id = schema
            .get_field("company_id")
            .map_err(|e| RegistryError::Transient(format!("fts schema missing company_id: {e}")))?;
        let official_name = schema.get_field("official_name").map_err(|e| {
            RegistryError::Transient(format!("fts schema missing official_name: {e}"))
        })?;

        Ok(Self {
            registry_root: registry_path.to_path_buf(),
            fts_index: Arc::new(fts_index),
            fts_reader: Arc::new(fts_reader),
            fts_fields: FtsFields {
                company_id,
                official_name,
            },
        })
    }

    /// Build an empty Tantivy schema matching the one `open` expects, for
    /// the registry builder (and integration tests) to populate.
    pub fn fts_schema() -> Schema {
        let mut builder = Schema::builder();
        builder.add_text_field("company_id", STRING | STORED | FAST);
        builder.add_text_field("official_name", TEXT | STORED);
        builder.build()
    }

    fn nationwide_path(&self) -> PathBuf {
        self.registry_root.join("establishments.parquet")
    }

    fn department_path(&self, dept: &str) -> PathBuf {
        self.registry_root
            .join(format!("dept={dept}"))
            .join("part.parquet")
    }

    fn read_batches(path: &Path) -> Result<Vec<RecordBatch>, RegistryError> {
        if !path.exists() {
            return Err(RegistryError::MissingPartition(path.display().to_string()));
        }
        let file = File::open(path)
            .map_err(|e| RegistryError::Transient(format!("opening {}: {e}", path.display())))?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .map_err(|e| RegistryError::Transient(format!("reading {}: {e}", path.display())))?
            .build()
            .map_err(|e| RegistryError::Transient(format!("building reader: {e}")))?;
        reader
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| RegistryError::Transient(format!("decoding batch: {e}")))
    }

    /// `postal_filter`, when set, requires exact equality against the
    /// batch's `postal` column for a row to be materialized (falling back
    /// to a substring check against `address` when the column is absent).
    /// This is the registry's half of spec Section 4.2's "exact postal
    /// equality *and* edit distance" requirement for `strict_local_lookup`
    /// — the 2-digit department prefix used to pick the partition is not
    /// sufficient on its own, since two postal codes can share a
    /// department.
    fn candidates_from_batches(
        batches: &[RecordBatch],
        require_active_column: bool,
        postal_filter: Option<&str>,
    ) -> Vec<Candidate> {
        let mut out = Vec::new();
        for batch in batches {
            let establishment_id = string_col(batch, col::ESTABLISHMENT_ID);
            let company_id = string_col(batch, col::COMPANY_ID);
            let official_name = string_col(batch, col::OFFICIAL_NAME);
            let city = string_col(batch, col::CITY);
            let address = string_col(batch, col::ADDRESS);
            let is_head_office = bool_col(batch, col::IS_HEAD_OFFICE);
            let administrative_state = string_col(batch, col::ADMINISTRATIVE_STATE);
            let postal = string_col(batch, col::POSTAL);

            let (
                Some(establishment_id),
                Some(company_id),
                Some(official_name),
                Some(city),
                Some(address),
            ) = (establishment_id, company_id, official_name, city, address)
            else {
                continue;
            };

            for row in 0..batch.num_rows() {
                if require_active_column {
                    let active = administrative_state
                        .as_ref()
                        .map(|col| col.value(row) == ACTIVE_SENTINEL)
                        .unwrap_or(true);
                    if !active {
                        continue;
                    }
                }
                if let Some(wanted) = postal_filter {
                    let matches = match &postal {
                        Some(col) => col.value(row) == wanted,
                        None => address.value(row).contains(wanted),
                    };
                    if !matches {
                        continue;
                    }
                }
                out.push(Candidate {
                    establishment_id: establishment_id.value(row).to_string(),
                    company_id: company_id.value(row).to_string(),
                    official_name: official_name.value(row).to_string(),
                    city: city.value(row).to_string(),
                    address: address.value(row).to_string(),
                    is_head_office: is_head_office
                        .as_ref()
                        .map(|col| col.value(row))
                        .unwrap_or(false),
                });
            }
        }
        out
    }
}

fn string_col<'a>(batch: &'a RecordBatch, name: &str) -> Option<&'a StringArray> {
    let idx = batch.schema().index_of(name).ok()?;
    batch.column(idx).as_any().downcast_ref::<StringArray>()
}

fn bool_col<'a>(batch: &'a RecordBatch, name: &str) -> Option<&'a BooleanArray> {
    let idx = batch.schema().index_of(name).ok()?;
    batch.column(idx).as_any().downcast_ref::<BooleanArray>()
}

impl RegistryQuery for FileRegistry {
    async fn direct_lookup(&self, id_14: &str) -> Result<Option<Candidate>, RegistryError> {
        let path = self.nationwide_path();
        let id = id_14.to_string();
        let candidate = tokio::task::spawn_blocking(move || -> Result<Option<Candidate>, RegistryError> {
            let batches = Self::read_batches(&path)?;
            let candidates = Self::candidates_from_batches(&batches, true, None);
            Ok(candidates.into_iter().find(|c| c.establishment_id == id))
        })
        .await
        .map_err(|e| RegistryError::Transient(format!("join error: {e}")))??;
        Ok(candidate)
    }

    async fn strict_local_lookup(
        &self,
        postal: &str,
        clean_name: &str,
    ) -> Result<Vec<Candidate>, RegistryError> {
        let dept = department_of(postal)
            .ok_or_else(|| RegistryError::MalformedId(format!("postal too short: {postal}")))?
            .to_string();
        let path = self.department_path(&dept);
        let postal = postal.to_string();
        let clean_name = clean_name.to_uppercase();

        tokio::task::spawn_blocking(move || -> Result<Vec<Candidate>, RegistryError> {
            let batches = Self::read_batches(&path)?;
            let candidates = Self::candidates_from_batches(&batches, false, Some(&postal));
            Ok(candidates
                .into_iter()
                .filter(|c| {
                    strsim::levenshtein(&c.official_name.to_uppercase(), &clean_name) <= 3
                })
                .collect())
        })
        .await
        .map_err(|e| RegistryError::Transient(format!("join error: {e}")))?
    }

    async fn fts_candidates(
        &self,
        search_token: &str,
        limit: usize,
    ) -> Result<Vec<FtsHit>, RegistryError> {
        let index = Arc::clone(&self.fts_index);
        let reader = Arc::clone(&self.fts_reader);
        let official_name_field = self.fts_fields.official_name;
        let company_id_field = self.fts_fields.company_id;
        let query_text = search_token.to_string();

        tokio::task::spawn_blocking(move || -> Result<Vec<FtsHit>, RegistryError> {
            let searcher = reader.searcher();
            let parser = QueryParser::for_index(&index, vec![official_name_field]);
            let query = parser
                .parse_query(&query_text)
                .map_err(|e| RegistryError::Transient(format!("fts query parse: {e}")))?;
            let top = searcher
                .search(&query, &TopDocs::with_limit(limit))
                .map_err(|e| RegistryError::Transient(format!("fts search: {e}")))?;

            let mut hits = Vec::with_capacity(top.len());
            for (score, addr) in top {
                let doc: TantivyDocument = searcher
                    .doc(addr)
                    .map_err(|e| RegistryError::Transient(format!("fts doc fetch: {e}")))?;
                let company_id = doc
                    .get_first(company_id_field)
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let official_name = doc
                    .get_first(official_name_field)
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                hits.push(FtsHit {
                    company_id,
                    official_name,
                    relevance: score,
                });
            }
            Ok(hits)
        })
        .await
        .map_err(|e| RegistryError::Transient(format!("join error: {e}")))?
    }

    async fn fetch_establishments(
        &self,
        company_ids: &[String],
        scope: FetchScope<'_>,
    ) -> Result<Vec<Candidate>, RegistryError> {
        let ids: std::collections::BTreeSet<String> = company_ids.iter().cloned().collect();
        let (path, require_active) = match scope {
            FetchScope::Department(dd) => (self.department_path(dd), false),
            FetchScope::Nationwide => (self.nationwide_path(), true),
        };

        tokio::task::spawn_blocking(move || -> Result<Vec<Candidate>, RegistryError> {
            let batches = Self::read_batches(&path)?;
            let candidates = Self::candidates_from_batches(&batches, require_active, None);
            Ok(candidates
                .into_iter()
                .filter(|c| ids.contains(&c.company_id))
                .collect())
        })
        .await
        .map_err(|e| RegistryError::Transient(format!("join error: {e}")))?
    }
}
