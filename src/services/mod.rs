// src/services/mod.rs

pub mod auth;
pub mod backend;
pub mod cache;
pub mod catalog;
pub mod network;
pub mod quiz_session;
pub mod submission;
pub mod test_import;

#[cfg(test)]
pub(crate) mod test_support;
