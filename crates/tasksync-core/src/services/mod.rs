//! Async services shared by the sync engine and clients

mod database;

pub use database::{DatabaseService, PageApplied};
