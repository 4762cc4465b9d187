//! File storage service: validated media uploads persisted as blobs in an
//! object store with descriptive metadata in a document table.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
