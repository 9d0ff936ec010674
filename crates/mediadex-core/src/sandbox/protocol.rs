/// Line protocol spoken between the engine and the sandbox worker.
///
/// Every request and every response is exactly one `\n`-terminated line.
/// Request fields are separated by tabs:
///
/// ```text
/// probe<TAB>format|content<TAB>/path/one<TAB>/path/two
/// thumbnail<TAB>160<TAB>/path/to/picture.jpg
/// ```
///
/// A probe response is a JSON array holding one [`MediaRecord`] per path the
/// worker could probe; paths it failed on are simply absent. A thumbnail
/// response is the standard-base64 PNG, or an empty line when there is none.
///
/// Paths containing a tab or a newline, or that are not valid UTF-8, cannot
/// be encoded and are never sent.
use crate::error::{Error, Result};
use crate::model::{MediaRecord, ProbeKind};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::path::{Path, PathBuf};

const FIELD_SEP: char = '\t';

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Probe { kind: ProbeKind, paths: Vec<PathBuf> },
    Thumbnail { max_edge: u32, path: PathBuf },
}

/// Whether `path` can travel inside a request line.
pub fn is_encodable(path: &Path) -> bool {
    path.to_str()
        .is_some_and(|s| !s.is_empty() && !s.contains(['\t', '\n', '\r']))
}

/// Length `path` adds to a request line, separator included.
pub(crate) fn encoded_len(path: &Path) -> usize {
    path.as_os_str().len() + 1
}

/// Header of a probe request, without paths.
pub(crate) fn probe_header(kind: ProbeKind) -> String {
    format!("probe{FIELD_SEP}{kind}")
}

impl Request {
    /// Serialise to one line, without the trailing newline.
    pub fn encode(&self) -> Result<String> {
        let mut line = match self {
            Request::Probe { kind, .. } => probe_header(*kind),
            Request::Thumbnail { max_edge, .. } => format!("thumbnail{FIELD_SEP}{max_edge}"),
        };
        let paths: Vec<&PathBuf> = match self {
            Request::Probe { paths, .. } => paths.iter().collect(),
            Request::Thumbnail { path, .. } => vec![path],
        };
        for path in paths {
            if !is_encodable(path) {
                return Err(Error::Protocol(format!("unencodable path {:?}", path)));
            }
            line.push(FIELD_SEP);
            line.push_str(&path.to_string_lossy());
        }
        Ok(line)
    }

    pub fn decode(line: &str) -> Result<Self> {
        let mut fields = line.trim_end_matches(['\r', '\n']).split(FIELD_SEP);
        match fields.next() {
            Some("probe") => {
                let kind = fields
                    .next()
                    .ok_or_else(|| Error::Protocol("probe without kind".into()))?
                    .parse::<ProbeKind>()
                    .map_err(Error::Protocol)?;
                let paths = fields.filter(|f| !f.is_empty()).map(PathBuf::from).collect();
                Ok(Request::Probe { kind, paths })
            }
            Some("thumbnail") => {
                let max_edge = fields
                    .next()
                    .and_then(|f| f.parse().ok())
                    .ok_or_else(|| Error::Protocol("thumbnail without size".into()))?;
                let path = fields
                    .next()
                    .filter(|f| !f.is_empty())
                    .ok_or_else(|| Error::Protocol("thumbnail without path".into()))?;
                Ok(Request::Thumbnail {
                    max_edge,
                    path: PathBuf::from(path),
                })
            }
            other => Err(Error::Protocol(format!("unknown request {:?}", other))),
        }
    }
}

pub fn encode_probe_response(records: &[MediaRecord]) -> Result<String> {
    Ok(serde_json::to_string(records)?)
}

pub fn decode_probe_response(line: &str) -> Result<Vec<MediaRecord>> {
    Ok(serde_json::from_str(line.trim_end())?)
}

pub fn encode_thumbnail_response(png: Option<&[u8]>) -> String {
    png.map(|bytes| STANDARD.encode(bytes)).unwrap_or_default()
}

pub fn decode_thumbnail_response(line: &str) -> Result<Option<Vec<u8>>> {
    let line = line.trim_end();
    if line.is_empty() {
        return Ok(None);
    }
    STANDARD
        .decode(line)
        .map(Some)
        .map_err(|e| Error::Protocol(format!("bad thumbnail payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_request_line() {
        let request = Request::Probe {
            kind: ProbeKind::Content,
            paths: vec![PathBuf::from("/m/a b.mkv"), PathBuf::from("/m/c.mp3")],
        };
        let line = request.encode().unwrap();
        assert_eq!(line, "probe\tcontent\t/m/a b.mkv\t/m/c.mp3");
        assert_eq!(Request::decode(&format!("{line}\n")).unwrap(), request);
    }

    #[test]
    fn test_thumbnail_request_line() {
        let request = Request::Thumbnail {
            max_edge: 96,
            path: PathBuf::from("/p/cat.jpg"),
        };
        assert_eq!(request.encode().unwrap(), "thumbnail\t96\t/p/cat.jpg");
        assert!(Request::decode("thumbnail\tbig\t/p/cat.jpg").is_err());
    }

    #[test]
    fn test_tabs_in_paths_are_rejected() {
        assert!(!is_encodable(Path::new("/m/odd\tname.mkv")));
        assert!(!is_encodable(Path::new("/m/odd\nname.mkv")));
        let request = Request::Probe {
            kind: ProbeKind::Format,
            paths: vec![PathBuf::from("/m/odd\tname.mkv")],
        };
        assert!(request.encode().is_err());
    }

    #[test]
    fn test_thumbnail_response() {
        assert_eq!(encode_thumbnail_response(None), "");
        assert_eq!(decode_thumbnail_response("\n").unwrap(), None);
        let line = encode_thumbnail_response(Some(&[1, 2, 3]));
        assert_eq!(decode_thumbnail_response(&line).unwrap(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_unknown_request() {
        assert!(Request::decode("explode\tnow").is_err());
    }
}
