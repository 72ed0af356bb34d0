//! Corsgate - a development server for single-page web apps
//!
//! This library provides a small HTTP server that:
//! - Stamps permissive CORS headers on every response and answers preflights
//! - Forwards requests under an API prefix to one upstream backend, with an
//!   explicit path rewrite policy
//! - Serves a pre-built static bundle, falling back to the entry document for
//!   unknown routes so client-side routing can handle them

pub mod config;
pub mod cors;
pub mod error;
pub mod forward;
pub mod mime;
pub mod pipeline;
pub mod pool;
pub mod server;
pub mod static_files;
