//! Scriptgate - turns a folder of scripts into webhook endpoints
//!
//! This library drives an external webhook dispatcher:
//! - Discovers `.py`, `.sh`, `.bat` and `.ps1` scripts under an endpoints root
//! - Maps every script to a route and writes the dispatcher's hooks file
//! - Runs each request through a launcher that feeds the request body to the
//!   script on stdin and relays its output as the response
//! - Supervises the dispatcher process: start, stop, crash detection and
//!   cleanup of stray processes
//! - Persists settings and exposes a status snapshot for front-ends

pub mod config;
pub mod discovery;
pub mod error;
pub mod launcher;
pub mod process;
pub mod reconcile;
pub mod routes;
pub mod script;
pub mod status;

/// Package name, for banners and `version`
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Package version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
