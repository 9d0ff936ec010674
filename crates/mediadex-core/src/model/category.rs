/// Domain categories a probed file can be filed under.
///
/// Each category owns one table in the catalog database and one root-path
/// group in the configuration.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Movies,
    TvShows,
    Clips,
    HomeVideos,
    Photos,
    Music,
}

impl Category {
    /// Every category, in notification order.
    pub const ALL: [Category; 6] = [
        Self::Movies,
        Self::TvShows,
        Self::Clips,
        Self::HomeVideos,
        Self::Photos,
        Self::Music,
    ];

    /// Name used in configuration files and log output.
    pub fn name(self) -> &'static str {
        match self {
            Self::Movies => "movies",
            Self::TvShows => "tvshows",
            Self::Clips => "clips",
            Self::HomeVideos => "homevideos",
            Self::Photos => "photos",
            Self::Music => "music",
        }
    }

    /// Catalog table holding this category's rows.
    pub(crate) fn table(self) -> &'static str {
        match self {
            Self::Movies => "movies",
            Self::TvShows => "tvshows",
            Self::Clips => "clips",
            Self::HomeVideos => "homevideos",
            Self::Photos => "photos",
            Self::Music => "music",
        }
    }

    /// Whether files in this category must carry both audio and video.
    pub fn requires_audio_video(self) -> bool {
        matches!(
            self,
            Self::Movies | Self::TvShows | Self::Clips | Self::HomeVideos
        )
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown category: {s}"))
    }
}
