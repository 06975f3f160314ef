//! resolverd - the supplier-to-registry resolver's runtime: the registry
//! facade, LLM adapter, matching cascade, checkpoint store, work
//! coordinator, exporter, and input loader.
//!
//! `resolver-core` holds the data model and the pure, I/O-free pieces
//! (field aliasing, the heuristic normalizer, the scorer, configuration).
//! Everything in this crate touches the outside world: disk, network, or
//! a database, per spec Section 1's "everything else is a thin
//! orchestrator around this core" framing — except here the core itself
//! (C2-C7) lives in this crate, since it is what actually performs I/O.

pub mod cascade;
pub mod coordinator;
pub mod export;
pub mod ingest;
pub mod llm;
pub mod registry;
pub mod store;

pub use coordinator::{CancelFlag, RunSummary, WorkCoordinator};
pub use store::CheckpointStore;
