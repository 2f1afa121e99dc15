//! HTTP ingestion of change-feed events.

pub mod event_reader;
pub mod server;
