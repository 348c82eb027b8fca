//! # filekeep
//!
//! A local, always-on file-history engine: watch a set of user-declared root
//! directories, capture an immutable version of any file whenever its
//! content changes, and restore any prior version on demand. Versions are
//! kept in a content-addressed store with deduplication, compression and
//! chunking; a grace-period garbage collector reclaims unreferenced content.
//!
//! The crate is organized around the three subsystems the core couples
//! together:
//!
//! - the [`cas`] content-addressed store (hash, compress, chunk, dedup,
//!   restore, GC),
//! - the [`identity`] and [`version`] indexes (stable per-file identity
//!   across renames, and its ordered version history),
//! - the [`watcher`] and [`queue`] backup pipeline (raw filesystem
//!   notifications turned into admitted, debounced, at-most-once-in-flight
//!   backup tasks).
//!
//! [`engine::Engine`] wires all of it together and is the command surface
//! external callers (the CLI, or any future request handler) drive.

pub mod bus;
pub mod cas;
pub mod cli;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod identity;
pub mod path;
pub mod queue;
pub mod recovery;
pub mod scanner;
pub mod suppression;
pub mod version;
pub mod watcher;

pub use error::{Error, Result};
