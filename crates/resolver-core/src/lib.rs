//! resolver-core - shared data types and pure logic for the supplier
//! resolver.
//!
//! Everything here is synchronous, dependency-free of I/O, and safe to
//! call from any worker without coordination: the data model (§3), field
//! alias resolution (§6), the heuristic Normalizer fallback (§4.1), the
//! Scorer (§4.3), and configuration parsing (§6/§10.3). `resolverd` is
//! where the registry, LLM adapter, cascade, checkpoint store, and
//! coordinator live, since those all touch the outside world.

pub mod alias;
pub mod config;
pub mod normalize;
pub mod score;
pub mod types;

pub use config::Config;
pub use types::{
    Candidate, CheckpointRow, CleanedRecord, MatchResult, Method, RawRecord, Value,
};
