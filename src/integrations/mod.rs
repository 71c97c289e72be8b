//! Vendor import pipelines.

pub mod syncro;

pub use syncro::{ImportSummary, SyncroClient, SyncroImporter, TicketSource};
