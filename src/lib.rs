//! Updrop Server Library
//!
//! This crate exposes the upload pipeline and HTTP routes so integration
//! tests can drive the router directly. The server binary is in main.rs.
//!
//! # Modules
//!
//! - `upload`: chunk store, session registry, reassembler, coordinator
//! - `routes`: axum handlers for the upload endpoints
//! - `sanitize`: filename sanitization at the HTTP boundary

pub mod config;
pub mod routes;
pub mod sanitize;
pub mod state;
pub mod upload;
