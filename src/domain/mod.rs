//! Domain types for the ledger and its fraud pipeline, plus the store ports
//! the application layer is written against.

pub mod account;
pub mod anomaly;
pub mod event;
pub mod ports;
pub mod transfer;
