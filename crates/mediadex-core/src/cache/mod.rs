/// Caches sitting in front of the filesystem and the prober.
///
/// - [`probe_cache`] - durable append-only log of probe results.
/// - [`listing`] - short-lived directory listings.
pub mod listing;
pub mod probe_cache;

pub use listing::{select_page, ListingCache};
pub use probe_cache::ProbeCache;
