//! Configuration, collaborator contracts and config-document processing.

pub mod clients;
pub mod config;
pub mod expressions;
pub mod schema;
