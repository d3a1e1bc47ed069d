use crate::error::{ExtractError, ProbeError};
use crate::models::FileType;
use encoding_rs::{DecoderResult, Encoding, GB18030, UTF_8};
use serde::Deserialize;
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub const DEFAULT_READ_CHARS: usize = 1000;

const PROBE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Output of a single extraction.
#[derive(Debug)]
pub struct ExtractedContent {
    pub preview: String,
    pub embedding_text: String,
    /// Set when only part of the information could be recovered
    pub degraded: Option<ExtractError>,
}

/// Turns a file into a short preview for display and the text that gets
/// embedded. Never fails outright: whatever could be recovered is returned,
/// with the reason for any degradation attached.
pub trait ContentExtractor: Send + Sync {
    fn file_type(&self) -> FileType;

    fn extract(&self, path: &Path) -> ExtractedContent;
}

/// Build the extractor for a corpus' file type.
pub fn extractor_for(
    file_type: FileType,
    read_chars: usize,
    probe: Option<Arc<dyn MediaProbe>>,
) -> Box<dyn ContentExtractor> {
    match file_type {
        FileType::Text => Box::new(TextExtractor::new(read_chars)),
        FileType::Video => Box::new(VideoExtractor::new(probe)),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

// ============================================================================
// Text
// ============================================================================

pub struct TextExtractor {
    max_chars: usize,
}

impl TextExtractor {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }

    fn read_head(&self, path: &Path) -> std::io::Result<(Vec<u8>, bool)> {
        // A character is at most 4 bytes in both UTF-8 and GB18030
        let limit = self.max_chars.saturating_mul(4);
        let mut buf = Vec::with_capacity(limit.min(64 * 1024));
        File::open(path)?
            .take(limit as u64)
            .read_to_end(&mut buf)?;
        let complete = buf.len() < limit;
        Ok((buf, complete))
    }
}

impl ContentExtractor for TextExtractor {
    fn file_type(&self) -> FileType {
        FileType::Text
    }

    fn extract(&self, path: &Path) -> ExtractedContent {
        let filename = file_name(path);

        let (preview, degraded) = match self.read_head(path) {
            Ok((bytes, complete)) => {
                let (text, degraded) = decode_text(&bytes, complete, path);
                let head: String = text.chars().take(self.max_chars).collect();
                (normalize_whitespace(&head), degraded)
            }
            Err(source) => (
                String::new(),
                Some(ExtractError::Read {
                    path: path.to_path_buf(),
                    source,
                }),
            ),
        };

        ExtractedContent {
            embedding_text: format!("filename: {}\ncontent: {}", filename, preview),
            preview,
            degraded,
        }
    }
}

/// Decode with UTF-8 first, GB18030 second, and lossy UTF-8 last.
/// `complete` is false when the buffer was cut at the read limit, in which
/// case a partial character at the end is tolerated.
pub fn decode_text(bytes: &[u8], complete: bool, path: &Path) -> (String, Option<ExtractError>) {
    if let Some(text) = decode_strict(UTF_8, bytes, complete) {
        return (text, None);
    }
    if let Some(text) = decode_strict(GB18030, bytes, complete) {
        log::debug!("Decoded {:?} as GB18030", path);
        return (text, None);
    }
    log::warn!("Falling back to lossy decoding for {:?}", path);
    (
        String::from_utf8_lossy(bytes).into_owned(),
        Some(ExtractError::LossyDecode(path.to_path_buf())),
    )
}

fn decode_strict(encoding: &'static Encoding, bytes: &[u8], last: bool) -> Option<String> {
    let mut decoder = encoding.new_decoder();
    let capacity = decoder.max_utf8_buffer_length_without_replacement(bytes.len())?;
    let mut out = String::with_capacity(capacity);
    let (result, _read) = decoder.decode_to_string_without_replacement(bytes, &mut out, last);
    match result {
        DecoderResult::InputEmpty => Some(out),
        DecoderResult::Malformed(_, _) | DecoderResult::OutputFull => None,
    }
}

/// Trim and collapse every whitespace run into a single space.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ============================================================================
// Video
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MediaInfo {
    pub width: u32,
    pub height: u32,
    pub duration_secs: f64,
}

/// Optional capability that reads resolution and duration from a media file.
pub trait MediaProbe: Send + Sync {
    fn probe(&self, path: &Path) -> Result<MediaInfo, ProbeError>;
}

pub struct VideoExtractor {
    probe: Option<Arc<dyn MediaProbe>>,
}

impl VideoExtractor {
    pub fn new(probe: Option<Arc<dyn MediaProbe>>) -> Self {
        Self { probe }
    }
}

impl ContentExtractor for VideoExtractor {
    fn file_type(&self) -> FileType {
        FileType::Video
    }

    fn extract(&self, path: &Path) -> ExtractedContent {
        let filename = file_name(path);
        let mut degraded = None;

        let preview = match fs::metadata(path) {
            Ok(metadata) => {
                let info = match &self.probe {
                    Some(probe) => match probe.probe(path) {
                        Ok(info) => Some(info),
                        Err(e) => {
                            log::debug!("Probe failed for {:?}: {}", path, e);
                            degraded = Some(ExtractError::Probe(e));
                            None
                        }
                    },
                    None => None,
                };
                format_media_preview(metadata.len(), info.as_ref())
            }
            Err(source) => {
                degraded = Some(ExtractError::Read {
                    path: path.to_path_buf(),
                    source,
                });
                String::new()
            }
        };

        ExtractedContent {
            embedding_text: format!("filename: {}\ninfo: {}", filename, preview),
            preview,
            degraded,
        }
    }
}

/// `Size: 50.20MB, Resolution: 1920x1080, Duration: 5m30s`; the last two
/// parts only when probe data is available.
pub fn format_media_preview(size_bytes: u64, info: Option<&MediaInfo>) -> String {
    let size_mb = size_bytes as f64 / (1024.0 * 1024.0);
    let mut preview = format!("Size: {:.2}MB", size_mb);
    if let Some(info) = info {
        let total = if info.duration_secs.is_finite() && info.duration_secs > 0.0 {
            info.duration_secs as u64
        } else {
            0
        };
        preview.push_str(&format!(
            ", Resolution: {}x{}, Duration: {}m{}s",
            info.width,
            info.height,
            total / 60,
            total % 60
        ));
    }
    preview
}

/// Probes media with the `ffprobe` executable. A run that outlives `timeout`
/// is killed.
pub struct FfprobeProbe {
    program: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    width: Option<u32>,
    height: Option<u32>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

impl FfprobeProbe {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    /// Returns a probe if `ffprobe` can be executed on this machine.
    pub fn detect(timeout: Duration) -> Option<Self> {
        let probe = Self::new("ffprobe", timeout);
        match probe.run(["-version"]) {
            Ok(_) => Some(probe),
            Err(e) => {
                log::warn!(
                    "ffprobe not available ({}), video previews will only include file size",
                    e
                );
                None
            }
        }
    }

    /// Run the program and return its stdout.
    fn run<I, S>(&self, args: I) -> Result<Vec<u8>, ProbeError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ProbeError::Timeout(self.timeout));
            }
            thread::sleep(PROBE_POLL_INTERVAL);
        };

        let mut stdout = Vec::new();
        if let Some(mut out) = child.stdout.take() {
            out.read_to_end(&mut stdout)?;
        }

        if !status.success() {
            let mut stderr = Vec::new();
            if let Some(mut err) = child.stderr.take() {
                err.read_to_end(&mut stderr)?;
            }
            return Err(ProbeError::Failed {
                status: status.to_string(),
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            });
        }

        Ok(stdout)
    }
}

impl MediaProbe for FfprobeProbe {
    fn probe(&self, path: &Path) -> Result<MediaInfo, ProbeError> {
        let args = [
            OsStr::new("-v"),
            OsStr::new("error"),
            OsStr::new("-select_streams"),
            OsStr::new("v:0"),
            OsStr::new("-show_entries"),
            OsStr::new("stream=width,height,duration:format=duration"),
            OsStr::new("-of"),
            OsStr::new("json"),
            path.as_os_str(),
        ];
        let stdout = self.run(args)?;
        parse_ffprobe_json(&stdout)
    }
}

fn parse_ffprobe_json(stdout: &[u8]) -> Result<MediaInfo, ProbeError> {
    let parsed: FfprobeOutput = serde_json::from_slice(stdout)?;
    let stream = parsed.streams.first().ok_or(ProbeError::NoVideoStream)?;
    let (Some(width), Some(height)) = (stream.width, stream.height) else {
        return Err(ProbeError::NoVideoStream);
    };

    let duration_secs = parsed
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .or(stream.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    Ok(MediaInfo {
        width,
        height,
        duration_secs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct FixedProbe(Option<MediaInfo>);

    impl MediaProbe for FixedProbe {
        fn probe(&self, _path: &Path) -> Result<MediaInfo, ProbeError> {
            self.0.ok_or(ProbeError::NoVideoStream)
        }
    }

    #[test]
    fn test_text_extract_utf8() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("story.txt");
        fs::write(&path, "  第一章  少年\n\n\t出发了  ").unwrap();

        let out = TextExtractor::new(1000).extract(&path);
        assert!(out.degraded.is_none());
        assert_eq!(out.preview, "第一章 少年 出发了");
        assert_eq!(out.embedding_text, "filename: story.txt\ncontent: 第一章 少年 出发了");
    }

    #[test]
    fn test_text_extract_gb18030_fallback() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gbk.txt");
        let (bytes, _, _) = GB18030.encode("斗破苍穹 第一章");
        fs::write(&path, &bytes).unwrap();

        let out = TextExtractor::new(1000).extract(&path);
        assert!(out.degraded.is_none());
        assert_eq!(out.preview, "斗破苍穹 第一章");
    }

    #[test]
    fn test_text_extract_truncates_to_char_budget() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("long.txt");
        fs::write(&path, "字".repeat(5000)).unwrap();

        let out = TextExtractor::new(1000).extract(&path);
        assert!(out.degraded.is_none());
        assert_eq!(out.preview.chars().count(), 1000);
    }

    #[test]
    fn test_text_extract_lossy_fallback() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("junk.txt");
        // 0xFF is invalid in UTF-8 and never a GB18030 lead byte
        fs::write(&path, [b'o', b'k', 0xFF, 0xFF, b'!']).unwrap();

        let out = TextExtractor::new(1000).extract(&path);
        assert!(matches!(out.degraded, Some(ExtractError::LossyDecode(_))));
        assert!(out.preview.starts_with("ok"));
    }

    #[test]
    fn test_text_extract_missing_file_degrades() {
        let dir = tempdir().unwrap();
        let out = TextExtractor::new(1000).extract(&dir.path().join("gone.txt"));
        assert!(matches!(out.degraded, Some(ExtractError::Read { .. })));
        assert_eq!(out.preview, "");
        assert_eq!(out.embedding_text, "filename: gone.txt\ncontent: ");
    }

    #[test]
    fn test_decode_tolerates_cut_multibyte_tail() {
        let bytes = "abc字".as_bytes();
        let cut = &bytes[..bytes.len() - 1];
        let (text, degraded) = decode_text(cut, false, Path::new("x.txt"));
        assert!(degraded.is_none());
        assert_eq!(text, "abc");
    }

    #[test]
    fn test_media_preview_format() {
        let info = MediaInfo {
            width: 1920,
            height: 1080,
            duration_secs: 330.9,
        };
        let size = (50.2 * 1024.0 * 1024.0) as u64;
        assert_eq!(
            format_media_preview(size, Some(&info)),
            "Size: 50.20MB, Resolution: 1920x1080, Duration: 5m30s"
        );
        assert_eq!(format_media_preview(0, None), "Size: 0.00MB");
    }

    #[test]
    fn test_video_extract_with_media_info() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        fs::write(&path, vec![0u8; 2 * 1024 * 1024]).unwrap();

        let probe: Arc<dyn MediaProbe> = Arc::new(FixedProbe(Some(MediaInfo {
            width: 1280,
            height: 720,
            duration_secs: 61.0,
        })));
        let out = VideoExtractor::new(Some(probe)).extract(&path);
        assert!(out.degraded.is_none());
        assert_eq!(
            out.preview,
            "Size: 2.00MB, Resolution: 1280x720, Duration: 1m1s"
        );
        assert!(out.embedding_text.starts_with("filename: clip.mp4\ninfo: Size"));
    }

    #[test]
    fn test_video_extract_metadata_failure_keeps_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.mkv");
        fs::write(&path, vec![0u8; 1024 * 1024]).unwrap();

        let probe: Arc<dyn MediaProbe> = Arc::new(FixedProbe(None));
        let out = VideoExtractor::new(Some(probe)).extract(&path);
        assert!(matches!(out.degraded, Some(ExtractError::Probe(_))));
        assert_eq!(out.preview, "Size: 1.00MB");

        let out = VideoExtractor::new(None).extract(&path);
        assert!(out.degraded.is_none());
        assert_eq!(out.preview, "Size: 1.00MB");
    }

    #[test]
    fn test_parse_ffprobe_json() {
        let json = br#"{
            "programs": [],
            "streams": [{"width": 3840, "height": 2160}],
            "format": {"duration": "7265.120000"}
        }"#;
        let info = parse_ffprobe_json(json).unwrap();
        assert_eq!(info.width, 3840);
        assert_eq!(info.height, 2160);
        assert!((info.duration_secs - 7265.12).abs() < 1e-6);

        assert!(matches!(
            parse_ffprobe_json(br#"{"streams": []}"#),
            Err(ProbeError::NoVideoStream)
        ));
        assert!(parse_ffprobe_json(b"not json").is_err());
    }

    #[test]
    fn test_extractor_for() {
        let text = extractor_for(FileType::Text, 10, None);
        assert_eq!(text.file_type(), FileType::Text);
        let video = extractor_for(FileType::Video, 10, None);
        assert_eq!(video.file_type(), FileType::Video);
    }

    #[cfg(unix)]
    fn fake_ffprobe(dir: &Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("fake-ffprobe");
        fs::write(&script, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        script.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    #[test]
    fn test_ffprobe_output_is_parsed() {
        let dir = tempdir().unwrap();
        let json = concat!(
            r#"{"streams": [{"width": 640, "height": 360}], "#,
            r#""format": {"duration": "90.5"}}"#
        );
        let program = fake_ffprobe(dir.path(), &format!("echo '{}'", json));
        let video = dir.path().join("clip.mp4");
        fs::write(&video, vec![0u8; 1024 * 1024]).unwrap();

        let probe: Arc<dyn MediaProbe> =
            Arc::new(FfprobeProbe::new(program, Duration::from_secs(10)));
        let out = VideoExtractor::new(Some(probe)).extract(&video);
        assert!(out.degraded.is_none());
        assert_eq!(
            out.preview,
            "Size: 1.00MB, Resolution: 640x360, Duration: 1m30s"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_hung_ffprobe_is_killed_and_degrades_to_size() {
        let dir = tempdir().unwrap();
        let program = fake_ffprobe(dir.path(), "sleep 5");
        let video = dir.path().join("stuck.mkv");
        fs::write(&video, vec![0u8; 1024 * 1024]).unwrap();

        let probe: Arc<dyn MediaProbe> =
            Arc::new(FfprobeProbe::new(program, Duration::from_millis(200)));
        let started = Instant::now();
        let out = VideoExtractor::new(Some(probe)).extract(&video);

        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(matches!(
            out.degraded,
            Some(ExtractError::Probe(ProbeError::Timeout(_)))
        ));
        assert_eq!(out.preview, "Size: 1.00MB");
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_ffprobe_reports_stderr() {
        let dir = tempdir().unwrap();
        let program = fake_ffprobe(dir.path(), "echo 'moov atom not found' >&2; exit 1");
        let probe = FfprobeProbe::new(program, Duration::from_secs(10));
        match probe.probe(&dir.path().join("bad.mp4")) {
            Err(ProbeError::Failed { stderr, .. }) => {
                assert_eq!(stderr, "moov atom not found")
            }
            other => panic!("unexpected probe result: {:?}", other),
        }
    }
}
