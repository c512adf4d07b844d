//! Command implementations for the uponline CLI

pub mod clusters;
pub mod config;
pub mod import;
pub mod jobs;
pub mod racks;
pub mod risks;
pub mod validate;
