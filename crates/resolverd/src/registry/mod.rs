//! RegistryQuery (C2): a typed, read-only facade over the column store.
//!
//! Exactly the four operations spec Section 4.2 names. Each worker opens
//! its own handle (`RegistryQuery` implementors are `Clone`-cheap or
//! otherwise safe to construct per-worker) — connections are never
//! shared, per spec Section 5's "shared immutable registry, per-worker
//! handles" design note.

pub mod file;
pub mod fixture;

use resolver_core::types::Candidate;
use thiserror::Error;

pub use file::FileRegistry;
pub use fixture::FixtureRegistry;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("transient read error: {0}")]
    Transient(String),
    #[error("malformed establishment id: {0}")]
    MalformedId(String),
    #[error("missing partition for department {0}")]
    MissingPartition(String),
}

/// Where [`RegistryQuery::fetch_establishments`] should read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchScope<'a> {
    /// Read only the pre-filtered department partition (fast, already
    /// active-filtered at build time).
    Department(&'a str),
    /// Read the full establishment file. Must re-assert the active-status
    /// predicate itself (spec Section 4.2 / Section 9's correctness fix).
    Nationwide,
}

/// One hit from the full-text index over active legal-entity names.
#[derive(Debug, Clone, PartialEq)]
pub struct FtsHit {
    pub company_id: String,
    pub official_name: String,
    pub relevance: f32,
}

/// The four read-only operations the cascade drives. Native `async fn` in
/// trait (no `dyn` dispatch needed — the coordinator is generic over one
/// concrete backend per run).
pub trait RegistryQuery: Send + Sync {
    /// At most one [`Candidate`], administratively active, for a
    /// syntactically valid 14-digit establishment id.
    fn direct_lookup(
        &self,
        id_14: &str,
    ) -> impl std::future::Future<Output = Result<Option<Candidate>, RegistryError>> + Send;

    /// Candidates from the department partition for `postal`'s 2-digit
    /// prefix, filtered by exact postal equality and name edit distance
    /// `<= 3`. Partitions are pre-filtered to active establishments.
    fn strict_local_lookup(
        &self,
        postal: &str,
        clean_name: &str,
    ) -> impl std::future::Future<Output = Result<Vec<Candidate>, RegistryError>> + Send;

    /// Up to `limit` `(company_id, official_name, relevance)` hits from
    /// the legal-entity FTS index, ranked by the index's own score.
    fn fts_candidates(
        &self,
        search_token: &str,
        limit: usize,
    ) -> impl std::future::Future<Output = Result<Vec<FtsHit>, RegistryError>> + Send;

    /// Candidates for every provided `company_ids`, scoped per
    /// [`FetchScope`]. Nationwide reads must re-assert the active-status
    /// predicate themselves.
    fn fetch_establishments(
        &self,
        company_ids: &[String],
        scope: FetchScope<'_>,
    ) -> impl std::future::Future<Output = Result<Vec<Candidate>, RegistryError>> + Send;
}

/// Default cap on [`RegistryQuery::fts_candidates`] when the caller does
/// not override it (spec Section 4.2).
pub const DEFAULT_FTS_LIMIT: usize = 20;

/// Derive the 2-character department prefix of a 5-digit postal code
/// (spec's Department glossary entry).
pub fn department_of(postal: &str) -> Option<&str> {
    postal.get(0..2)
}
