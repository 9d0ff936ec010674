/// mediadex core: catalog, caches and sandboxed metadata probing.
///
/// This crate holds all of the engine with no CLI dependencies. Frontends
/// (the `mediadex` binary, a streaming server) construct one
/// [`MediaLibrary`] and read through it.
///
/// # Modules
///
/// - [`model`] - File entries, probe records and categories.
/// - [`cache`] - Durable probe cache and the directory listing cache.
/// - [`probe`] - Container sniffing, `ffprobe` parsing and thumbnails.
/// - [`sandbox`] - Child-process worker that runs the prober.
/// - [`service`] - Cache-first probing over the sandbox or in-process.
/// - [`preprobe`] - Priority queue driving speculative background probes.
/// - [`catalog`] - SQLite file table, incremental scanner and categorizer.
/// - [`library`] - Composition root and public read API.
pub mod cache;
pub mod catalog;
pub mod config;
pub mod error;
pub mod events;
pub mod fs;
pub mod library;
pub mod model;
pub mod preprobe;
pub mod probe;
pub mod sandbox;
pub mod service;
pub mod watch;

pub use config::Config;
pub use error::{Error, Result};
pub use events::MediaEvent;
pub use library::{LibraryBuilder, MediaLibrary};
