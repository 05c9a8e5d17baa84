//! Library surface for the protocol-manifest registry's HTTP server.
//!
//! `src/main.rs` is a thin binary wrapper around [`routes::router`] and
//! [`state::AppState`]; both are exported here so integration tests under
//! `tests/` can bind a real listener and drive the server the same way a
//! client would, without going through the CLI.

pub mod db;
pub mod error;
pub mod provenance;
pub mod ratelimit;
pub mod routes;
pub mod state;
