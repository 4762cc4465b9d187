//! Core services: content admission, staging, the two backing stores, and the
//! file orchestrator that keeps them consistent.

pub mod file_service;
pub mod metadata_store;
pub mod object_store;
pub mod staging;
pub mod validator;

#[cfg(test)]
pub(crate) mod test_support;
