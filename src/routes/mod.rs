//! Route modules for the upload server

pub mod upload;
