/// Data model shared by the caches, the sandbox and the catalog.
///
/// Re-exports the filesystem entry, the probed media record and the
/// category classification.
pub mod category;
pub mod file_entry;
pub mod media_record;

pub use category::Category;
pub use file_entry::{mtime_matches, FileEntry, MTIME_TOLERANCE_SECS};
pub use media_record::{
    AudioStream, Chapter, DataStream, ImageInfo, MediaRecord, ProbeKind, Program, Thumbnail,
    VideoStream,
};
