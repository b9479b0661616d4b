//! Library for `wireit`, an incremental script runner that sits underneath a
//! package manager's script runner.
//!
//! A user declares per-script inputs, outputs, dependencies, and
//! caching/service policy in `package.json`; this library analyzes those
//! declarations into a script graph, then runs only the scripts whose inputs
//! have changed since the last successful run, restoring outputs from a
//! content-addressed cache when possible, while coordinating concurrent
//! execution, long-running services, and watch-mode re-runs.
//!
//! This library is consumed by the `wireit` binary in this repository and by
//! its integration tests; it is not a supported public API surface.

pub mod analyzer;
pub mod cache;
pub mod diagnostic;
pub mod engine;
pub mod event;
pub mod executor;
pub mod fingerprint;
pub mod fs;
pub mod glob;
pub mod manifest;
pub mod script;
pub mod service;
pub mod spawn;
pub mod state;
pub mod watcher;
