//! Core types, config, errors, session state and responder registry for tutorflow.

pub mod cache;
pub mod config;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod session_store;
pub mod types;
