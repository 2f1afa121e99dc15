//! Ledger store adapters.

pub mod in_memory;
#[cfg(feature = "storage-postgres")]
pub mod postgres;
