/// Content probing through an external `ffprobe` binary.
///
/// `ffprobe` is run with JSON output; the result is folded into a
/// [`MediaRecord`] as a single program carrying every stream and chapter.
use crate::error::{Error, Result};
use crate::model::{AudioStream, Chapter, DataStream, ImageInfo, MediaRecord, Program, VideoStream};
use serde_json::Value;
use std::path::Path;
use std::process::Command;
use tracing::debug;

/// Run `ffprobe` on `path` and parse its JSON report.
pub fn run(ffprobe: &Path, path: &Path) -> Result<Value> {
    let output = Command::new(ffprobe)
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
            "-show_chapters",
        ])
        .arg(path)
        .output()?;

    if !output.status.success() {
        return Err(Error::Other(format!(
            "ffprobe exited with {} for {:?}",
            output.status, path
        )));
    }
    debug!("ffprobe: {} bytes of JSON for {:?}", output.stdout.len(), path);
    Ok(serde_json::from_slice(&output.stdout)?)
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(|v| v.as_str())
}

fn owned_field(value: &Value, key: &str) -> Option<String> {
    str_field(value, key).map(str::to_owned)
}

/// Tag lookup; ffprobe preserves the container's tag case.
fn tag(tags: Option<&Value>, key: &str) -> Option<String> {
    let tags = tags?.as_object()?;
    tags.iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .and_then(|(_, v)| v.as_str())
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
}

/// Seconds as a decimal string, e.g. `"5400.040000"`, to milliseconds.
fn secs_to_ms(value: Option<&str>) -> Option<u64> {
    let secs: f64 = value?.parse().ok()?;
    (secs.is_finite() && secs >= 0.0).then(|| (secs * 1000.0).round() as u64)
}

/// `"24000/1001"` to frames per second.
fn parse_rate(value: Option<&str>) -> f32 {
    let Some(value) = value else { return 0.0 };
    match value.split_once('/') {
        Some((num, den)) => match (num.parse::<f32>(), den.parse::<f32>()) {
            (Ok(n), Ok(d)) if d > 0.0 => n / d,
            _ => 0.0,
        },
        None => value.parse().unwrap_or(0.0),
    }
}

/// Leading number of `"3/12"` or `"2004-05-01"`.
fn leading_number(value: Option<String>) -> Option<u32> {
    let value = value?;
    let digits: String = value.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Fold an ffprobe report into `record`.
pub fn apply_report(report: &Value, record: &mut MediaRecord) {
    let format = report.get("format");
    let format_tags = format.and_then(|f| f.get("tags"));

    if let Some(name) = format.and_then(|f| str_field(f, "format_name")) {
        // "mov,mp4,m4a,3gp,3g2,mj2" names a family; keep the first member.
        record.format = name.split(',').next().map(str::to_owned);
    }
    if let Some(title) = tag(format_tags, "title") {
        record.title = title;
    }
    if let Some(author) = tag(format_tags, "artist").or_else(|| tag(format_tags, "album_artist")) {
        record.author = author;
    }
    if let Some(album) = tag(format_tags, "album") {
        record.album = album;
    }
    if let Some(genre) = tag(format_tags, "genre") {
        record.genre = genre;
    }
    record.year = leading_number(tag(format_tags, "date").or_else(|| tag(format_tags, "year")));
    record.track = leading_number(tag(format_tags, "track"));

    let mut program = Program {
        duration_ms: secs_to_ms(format.and_then(|f| str_field(f, "duration"))),
        ..Program::default()
    };

    for stream in report
        .get("streams")
        .and_then(|s| s.as_array())
        .into_iter()
        .flatten()
    {
        let tags = stream.get("tags");
        let codec = owned_field(stream, "codec_name");
        let language = tag(tags, "language");
        let attached_pic = stream
            .get("disposition")
            .and_then(|d| d.get("attached_pic"))
            .and_then(|v| v.as_i64())
            == Some(1);

        match str_field(stream, "codec_type") {
            Some("video") if attached_pic => {
                program.image = Some(ImageInfo {
                    codec,
                    width: stream.get("width").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                    height: stream.get("height").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                });
            }
            Some("video") => program.video_streams.push(VideoStream {
                codec,
                language,
                width: stream.get("width").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                height: stream.get("height").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                frame_rate: parse_rate(str_field(stream, "r_frame_rate")),
            }),
            Some("audio") => program.audio_streams.push(AudioStream {
                codec,
                language,
                channels: stream.get("channels").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                sample_rate: str_field(stream, "sample_rate")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0),
            }),
            Some(kind) => program.data_streams.push(DataStream {
                codec,
                language,
                kind: kind.to_owned(),
            }),
            None => {}
        }

        if program.duration_ms.is_none() {
            program.duration_ms = secs_to_ms(str_field(stream, "duration"));
        }
    }

    for chapter in report
        .get("chapters")
        .and_then(|c| c.as_array())
        .into_iter()
        .flatten()
    {
        program.chapters.push(Chapter {
            title: tag(chapter.get("tags"), "title").unwrap_or_default(),
            begin_ms: secs_to_ms(str_field(chapter, "start_time")).unwrap_or(0),
            end_ms: secs_to_ms(str_field(chapter, "end_time")).unwrap_or(0),
        });
    }

    record.programs = vec![program];
}
