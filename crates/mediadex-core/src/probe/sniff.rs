/// Container detection from leading magic bytes.
///
/// Only the first [`HEAD_LEN`] bytes of a file are read. Detection is
/// deliberately shallow: it names the container and says whether it holds
/// video, audio or a still image, nothing more.
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Bytes read from the start of a file for sniffing.
pub const HEAD_LEN: usize = 512;

/// Size of one MPEG transport stream packet.
const TS_PACKET: usize = 188;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaClass {
    Video,
    Audio,
    Image,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sniffed {
    pub format: &'static str,
    pub class: MediaClass,
}

impl Sniffed {
    const fn new(format: &'static str, class: MediaClass) -> Self {
        Self { format, class }
    }
}

/// Read the head of `path` and sniff it.
pub fn sniff_file(path: &Path) -> std::io::Result<Option<Sniffed>> {
    let mut head = Vec::with_capacity(HEAD_LEN);
    File::open(path)?
        .take(HEAD_LEN as u64)
        .read_to_end(&mut head)?;
    Ok(sniff(&head))
}

pub fn sniff(head: &[u8]) -> Option<Sniffed> {
    use MediaClass::*;

    if head.len() < 4 {
        return None;
    }
    if head.starts_with(b"RIFF") && head.len() >= 12 {
        return match &head[8..12] {
            b"AVI " => Some(Sniffed::new("avi", Video)),
            b"WAVE" => Some(Sniffed::new("wav", Audio)),
            b"WEBP" => Some(Sniffed::new("webp", Image)),
            _ => None,
        };
    }
    if head.len() >= 12 && &head[4..8] == b"ftyp" {
        return match &head[8..12] {
            b"M4A " | b"M4B " | b"M4P " => Some(Sniffed::new("mp4", Audio)),
            b"qt  " => Some(Sniffed::new("mov", Video)),
            _ => Some(Sniffed::new("mp4", Video)),
        };
    }
    if head.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        return Some(Sniffed::new("matroska", Video));
    }
    if head.starts_with(&[0x30, 0x26, 0xB2, 0x75]) {
        return Some(Sniffed::new("asf", Video));
    }
    if head.starts_with(b"DVDVIDEO-VTS") || head.starts_with(b"DVDVIDEO-VMG") {
        return Some(Sniffed::new("dvd", Video));
    }
    if head.starts_with(&[0x00, 0x00, 0x01, 0xBA]) {
        return Some(Sniffed::new("mpeg", Video));
    }
    if head[0] == 0x47 && (head.len() <= TS_PACKET || head[TS_PACKET] == 0x47) {
        return Some(Sniffed::new("mpegts", Video));
    }
    if head.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some(Sniffed::new("jpeg", Image));
    }
    if head.starts_with(&[0x89, b'P', b'N', b'G']) {
        return Some(Sniffed::new("png", Image));
    }
    if head.starts_with(b"GIF8") {
        return Some(Sniffed::new("gif", Image));
    }
    if head.starts_with(b"BM") && head.len() >= 14 {
        return Some(Sniffed::new("bmp", Image));
    }
    if head.starts_with(b"fLaC") {
        return Some(Sniffed::new("flac", Audio));
    }
    if head.starts_with(b"OggS") {
        return Some(Sniffed::new("ogg", Audio));
    }
    // MPEG audio: ID3 tag or a bare frame sync.
    if head.starts_with(b"ID3") || (head[0] == 0xFF && head[1] & 0xE0 == 0xE0) {
        return Some(Sniffed::new("mp3", Audio));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn padded(prefix: &[u8]) -> Vec<u8> {
        let mut v = prefix.to_vec();
        v.resize(64, 0);
        v
    }

    #[test]
    fn test_common_containers() {
        let mut avi = padded(b"RIFF\0\0\0\0AVI LIST");
        avi.truncate(16);
        assert_eq!(sniff(&avi).unwrap().format, "avi");

        let mp4 = padded(b"\0\0\0\x20ftypisom");
        assert_eq!(sniff(&mp4), Some(Sniffed::new("mp4", MediaClass::Video)));

        let m4a = padded(b"\0\0\0\x20ftypM4A ");
        assert_eq!(sniff(&m4a).unwrap().class, MediaClass::Audio);

        let mkv = padded(&[0x1A, 0x45, 0xDF, 0xA3]);
        assert_eq!(sniff(&mkv).unwrap().format, "matroska");

        let mp3 = padded(b"ID3\x04");
        assert_eq!(sniff(&mp3).unwrap().class, MediaClass::Audio);

        let jpg = padded(&[0xFF, 0xD8, 0xFF, 0xE0]);
        assert_eq!(sniff(&jpg).unwrap().class, MediaClass::Image);
    }

    #[test]
    fn test_transport_stream_needs_second_sync() {
        let mut ts = vec![0u8; 400];
        ts[0] = 0x47;
        ts[TS_PACKET] = 0x47;
        assert_eq!(sniff(&ts).unwrap().format, "mpegts");

        ts[TS_PACKET] = 0;
        assert!(sniff(&ts).is_none());
    }

    #[test]
    fn test_unknown_and_short_input() {
        assert!(sniff(b"hello world, plain text").is_none());
        assert!(sniff(b"ID").is_none());
    }
}
