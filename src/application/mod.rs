//! Application layer: the transfer engine and the fraud pipeline that reacts to it.
//!
//! Everything here talks to the ledger through the `LedgerStore` port and relies
//! on the store for isolation; the only in-process shared state is the
//! write-once account directory and the atomic outcome counters.

pub mod classifier;
pub mod directory;
pub mod dispatcher;
pub mod escalation;
pub mod executor;
pub mod pipeline;
pub mod retry;
pub mod stats;
pub mod workload;
