//! Core types, config, errors, and link helpers for linkscout.

pub mod config;
pub mod error;
pub mod links;
pub mod session;
pub mod types;
