/// Metadata extraction.
///
/// [`Prober`] is the seam between the engine and whatever actually parses
/// media files. It may run in-process or inside the sandbox worker; either
/// way it is treated as slow and untrusted.
///
/// [`NativeProber`] is the bundled implementation:
///
/// - **Format probe** - magic-byte sniffing of the container; images also get
///   their dimensions.
/// - **Content probe** - audio/video files are handed to `ffprobe` when one is
///   configured; otherwise the container class implies the streams. Images get
///   a PNG thumbnail.
pub mod ffprobe;
pub mod sniff;
pub mod thumbnail;

use crate::error::Result;
use crate::model::{AudioStream, FileEntry, MediaRecord, ProbeKind, Program, VideoStream};
use sniff::{MediaClass, Sniffed};
use std::path::{Path, PathBuf};
use tracing::debug;

pub trait Prober: Send + Sync {
    /// Probe one file. Unrecognised files still yield a probed record with
    /// no programs, so they are not probed again.
    fn probe(&self, kind: ProbeKind, path: &Path) -> Result<MediaRecord>;

    /// PNG thumbnail no larger than `max_edge` on either side, if the file
    /// has a picture to offer.
    fn thumbnail(&self, path: &Path, max_edge: u32) -> Result<Option<Vec<u8>>>;
}

#[derive(Debug, Default, Clone)]
pub struct NativeProber {
    ffprobe: Option<PathBuf>,
}

impl NativeProber {
    pub fn new(ffprobe: Option<PathBuf>) -> Self {
        Self { ffprobe }
    }

    fn probe_content(&self, path: &Path, sniffed: Sniffed, record: &mut MediaRecord) -> Result<()> {
        match sniffed.class {
            MediaClass::Image => {
                let info = thumbnail::image_info(path, sniffed.format)?;
                record.programs = vec![Program {
                    image: Some(info),
                    ..Program::default()
                }];
                match thumbnail::render(path, thumbnail::DEFAULT_MAX_EDGE) {
                    Ok(thumb) => record.thumbnails.push(thumb),
                    Err(e) => debug!("No thumbnail for {:?}: {}", path, e),
                }
            }
            MediaClass::Audio | MediaClass::Video => {
                let report = self
                    .ffprobe
                    .as_deref()
                    .map(|ffprobe| ffprobe::run(ffprobe, path));
                match report {
                    Some(Ok(report)) => ffprobe::apply_report(&report, record),
                    Some(Err(e)) => {
                        debug!("ffprobe failed for {:?}: {}", path, e);
                        record.programs = vec![implied_program(sniffed.class)];
                    }
                    None => record.programs = vec![implied_program(sniffed.class)],
                }
            }
        }
        Ok(())
    }
}

/// Streams a container of `class` is assumed to carry when nothing better
/// is known.
fn implied_program(class: MediaClass) -> Program {
    let mut program = Program::default();
    match class {
        MediaClass::Video => {
            program.video_streams.push(VideoStream::default());
            program.audio_streams.push(AudioStream::default());
        }
        MediaClass::Audio => program.audio_streams.push(AudioStream::default()),
        MediaClass::Image => {}
    }
    program
}

impl Prober for NativeProber {
    fn probe(&self, kind: ProbeKind, path: &Path) -> Result<MediaRecord> {
        let meta = std::fs::metadata(path)?;
        let entry = FileEntry::from_metadata(path.to_path_buf(), &meta);
        let mut record = MediaRecord::for_entry(&entry);
        record.format_probed = true;
        if entry.is_dir {
            return Ok(record);
        }

        let Some(sniffed) = sniff::sniff_file(path)? else {
            debug!("Unrecognised container: {:?}", path);
            record.content_probed = kind == ProbeKind::Content;
            return Ok(record);
        };
        record.format = Some(sniffed.format.to_owned());

        match kind {
            ProbeKind::Format => {
                if sniffed.class == MediaClass::Image {
                    if let Ok(info) = thumbnail::image_info(path, sniffed.format) {
                        record.programs = vec![Program {
                            image: Some(info),
                            ..Program::default()
                        }];
                    }
                }
            }
            ProbeKind::Content => {
                self.probe_content(path, sniffed, &mut record)?;
                record.content_probed = true;
            }
        }
        Ok(record)
    }

    fn thumbnail(&self, path: &Path, max_edge: u32) -> Result<Option<Vec<u8>>> {
        match sniff::sniff_file(path)? {
            Some(Sniffed {
                class: MediaClass::Image,
                ..
            }) => Ok(Some(thumbnail::render(path, max_edge)?.png)),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    #[test]
    fn test_format_probe_of_image_reads_dimensions() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("photo.png");
        ImageBuffer::from_pixel(64, 48, Rgb([0u8, 0, 0])).save(&path).unwrap();

        let prober = NativeProber::default();
        let record = prober.probe(ProbeKind::Format, &path).unwrap();
        assert!(record.format_probed && !record.content_probed);
        assert_eq!(record.format.as_deref(), Some("png"));
        assert!(record.contains_image());

        let record = prober.probe(ProbeKind::Content, &path).unwrap();
        assert!(record.content_probed);
        assert_eq!(record.thumbnails.len(), 1);
    }

    #[test]
    fn test_content_probe_without_ffprobe_implies_streams() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("film.mkv");
        let mut bytes = vec![0x1A, 0x45, 0xDF, 0xA3];
        bytes.resize(1024, 0);
        std::fs::write(&path, &bytes).unwrap();

        let record = NativeProber::default()
            .probe(ProbeKind::Content, &path)
            .unwrap();
        assert_eq!(record.size, 1024);
        assert!(record.contains_audio() && record.contains_video());
        assert_eq!(record.total_duration(), None);
    }

    #[test]
    fn test_unknown_file_is_probed_but_empty() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("notes.bin");
        std::fs::write(&path, b"just some text").unwrap();

        let prober = NativeProber::default();
        let record = prober.probe(ProbeKind::Content, &path).unwrap();
        assert!(record.format_probed && record.content_probed);
        assert!(record.programs.is_empty());
        assert!(prober.thumbnail(&path, 64).unwrap().is_none());
    }
}
