/// The probed metadata unit.
///
/// A `MediaRecord` is produced by a format probe (container only, cheap) or
/// a content probe (streams, duration, chapters, thumbnails). Records are
/// immutable once stored: a later probe of the same path supersedes the old
/// record instead of editing it.
///
/// Every field is defaulted on deserialisation so that workers may emit
/// partial records.
use super::file_entry::{mtime_matches, FileEntry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Depth of a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    /// Container only.
    Format,
    /// Streams, duration, chapters and thumbnails.
    Content,
}

impl ProbeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Format => "format",
            Self::Content => "content",
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProbeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "format" => Ok(Self::Format),
            "content" => Ok(Self::Content),
            other => Err(format!("unknown probe kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioStream {
    pub codec: Option<String>,
    pub language: Option<String>,
    pub channels: u32,
    pub sample_rate: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoStream {
    pub codec: Option<String>,
    pub language: Option<String>,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f32,
}

/// Subtitle, teletext or any other non-audio/video stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataStream {
    pub codec: Option<String>,
    pub language: Option<String>,
    pub kind: String,
}

/// A still image (photo or cover art).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageInfo {
    pub codec: Option<String>,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Chapter {
    pub title: String,
    pub begin_ms: u64,
    pub end_ms: u64,
}

/// PNG-encoded preview image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thumbnail {
    pub width: u32,
    pub height: u32,
    #[serde(with = "base64_bytes")]
    pub png: Vec<u8>,
}

/// One program of a container. Plain files have exactly one; DVD and
/// broadcast transport streams may carry several.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Program {
    pub title: String,
    pub duration_ms: Option<u64>,
    pub chapters: Vec<Chapter>,
    pub audio_streams: Vec<AudioStream>,
    pub video_streams: Vec<VideoStream>,
    pub data_streams: Vec<DataStream>,
    pub image: Option<ImageInfo>,
    pub thumbnail: Option<Thumbnail>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaRecord {
    pub file_path: PathBuf,
    pub is_directory: bool,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub format_probed: bool,
    pub content_probed: bool,
    /// Container name, e.g. `matroska` or `mp3`.
    pub format: Option<String>,
    pub programs: Vec<Program>,
    pub title: String,
    pub author: String,
    pub album: String,
    pub genre: String,
    pub year: Option<u32>,
    pub track: Option<u32>,
    pub thumbnails: Vec<Thumbnail>,
}

impl MediaRecord {
    /// Empty record stamped with the identity of `entry`.
    pub fn for_entry(entry: &FileEntry) -> Self {
        Self {
            file_path: entry.path.clone(),
            is_directory: entry.is_dir,
            size: entry.size,
            last_modified: entry.last_modified,
            ..Self::default()
        }
    }

    /// Whether this record still describes the live file behind `entry`.
    pub fn is_valid_for(&self, entry: &FileEntry) -> bool {
        self.file_path == entry.path
            && self.size == entry.size
            && mtime_matches(self.last_modified, entry.last_modified)
    }

    /// Whether the record was probed at least as deep as `kind`.
    pub fn satisfies(&self, kind: ProbeKind) -> bool {
        match kind {
            ProbeKind::Format => self.format_probed || self.content_probed,
            ProbeKind::Content => self.content_probed,
        }
    }

    pub fn contains_audio(&self) -> bool {
        self.programs.iter().any(|p| !p.audio_streams.is_empty())
    }

    pub fn contains_video(&self) -> bool {
        self.programs.iter().any(|p| !p.video_streams.is_empty())
    }

    pub fn contains_image(&self) -> bool {
        self.programs.iter().any(|p| p.image.is_some())
    }

    /// Longest program duration, if any program reports one.
    pub fn total_duration(&self) -> Option<Duration> {
        self.programs
            .iter()
            .filter_map(|p| p.duration_ms)
            .max()
            .map(Duration::from_millis)
    }

    /// Title to display and to categorise by; falls back to the file stem.
    pub fn display_title(&self) -> String {
        if !self.title.trim().is_empty() {
            return self.title.clone();
        }
        self.file_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Serialise byte buffers as standard base64 strings.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(size: u64, secs: i64) -> FileEntry {
        FileEntry {
            path: PathBuf::from("/media/film.mkv"),
            is_dir: false,
            is_readable: true,
            size,
            last_modified: DateTime::from_timestamp(secs, 0),
        }
    }

    #[test]
    fn test_validity_follows_size_and_mtime() {
        let record = MediaRecord::for_entry(&entry(1_000, 1_700_000_000));
        assert!(record.is_valid_for(&entry(1_000, 1_700_000_002)));
        assert!(!record.is_valid_for(&entry(1_001, 1_700_000_000)));
        assert!(!record.is_valid_for(&entry(1_000, 1_700_000_010)));
    }

    #[test]
    fn test_content_probe_satisfies_format() {
        let mut record = MediaRecord::default();
        assert!(!record.satisfies(ProbeKind::Format));
        record.content_probed = true;
        assert!(record.satisfies(ProbeKind::Format));
        assert!(record.satisfies(ProbeKind::Content));
    }

    #[test]
    fn test_partial_worker_json_deserialises() {
        let record: MediaRecord =
            serde_json::from_str(r#"{"file_path":"/x/a.mp3","format_probed":true}"#).unwrap();
        assert_eq!(record.file_path, PathBuf::from("/x/a.mp3"));
        assert!(record.format_probed);
        assert!(record.programs.is_empty());
    }

    #[test]
    fn test_thumbnail_bytes_survive_json() {
        let thumb = Thumbnail {
            width: 2,
            height: 1,
            png: vec![0x89, b'P', b'N', b'G', 0, 255],
        };
        let json = serde_json::to_string(&thumb).unwrap();
        assert!(json.contains("\"png\":\""));
        let back: Thumbnail = serde_json::from_str(&json).unwrap();
        assert_eq!(back, thumb);
    }

    #[test]
    fn test_display_title_falls_back_to_stem() {
        let record = MediaRecord::for_entry(&entry(1, 0));
        assert_eq!(record.display_title(), "film");
    }
}
