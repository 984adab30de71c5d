//! External URL fetcher
//!
//! Wraps the `yt-dlp` subprocess: probe a short-video URL for media
//! candidates, then download a chosen variant into a scratch directory.
//! The scratch directory is RAII-owned so the payload is deleted on every
//! exit path, success or not. Size and duration caps are enforced before
//! the download starts and re-checked after it finishes.

use crate::error::{Error, Result};
use crate::util::format_size;

use serde_json::Value;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::{NamedTempFile, TempDir};
use tokio::process::Command;
use tracing::{debug, warn};

/// Extensions yt-dlp may produce that we accept as media output
const MEDIA_EXTENSIONS: [&str; 7] = ["mp4", "webm", "mkv", "avi", "mov", "m4a", "mp3"];

/// URL prefixes the ingest path treats as fetchable short-video links
const URL_PATTERNS: [&str; 4] = [
    "youtube.com/watch",
    "youtu.be/",
    "youtube.com/embed/",
    "youtube.com/shorts/",
];

/// True when the text is a short-video URL the fetcher can handle.
pub fn is_media_url(text: &str) -> bool {
    let trimmed = text.trim();
    let rest = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    let rest = rest.strip_prefix("www.").unwrap_or(rest);
    URL_PATTERNS.iter().any(|p| rest.starts_with(p))
}

/// One downloadable variant of a probed URL.
#[derive(Debug, Clone)]
pub struct MediaCandidate {
    pub format_id: String,
    pub quality_label: String,
    pub ext: String,
    pub filesize: Option<u64>,
}

/// Probe output: enough to enforce caps and offer a quality selection.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub media_id: String,
    pub title: String,
    pub duration_secs: u64,
    pub candidates: Vec<MediaCandidate>,
}

/// A finished download. Dropping it removes the scratch directory and the
/// payload with it.
pub struct Download {
    pub path: PathBuf,
    pub size_bytes: u64,
    _scratch: TempDir,
}

/// Subprocess driver configured from the environment.
pub struct Fetcher {
    proxy_url: Option<String>,
    cookies: Option<String>,
    max_size_bytes: u64,
    max_duration_secs: u64,
}

impl Fetcher {
    pub fn new(
        proxy_url: Option<String>,
        cookies: Option<String>,
        max_size_bytes: u64,
        max_duration_secs: u64,
    ) -> Self {
        Fetcher {
            proxy_url,
            cookies,
            max_size_bytes,
            max_duration_secs,
        }
    }

    /// Ask yt-dlp for metadata and candidate formats, enforcing the
    /// duration and (when known up front) size caps.
    pub async fn probe(&self, url: &str) -> Result<ProbeResult> {
        let cookie_file = self.cookie_file()?;

        let mut cmd = Command::new("yt-dlp");
        cmd.arg("-J").arg("--no-playlist").arg("--no-warnings");
        self.apply_network_args(&mut cmd, cookie_file.as_ref());
        cmd.arg(url);

        debug!("Probing URL via yt-dlp");
        let output = cmd
            .output()
            .await
            .map_err(|e| Error::Ingest(format!("Fetcher unavailable: {}", e)))?;

        if !output.status.success() {
            warn!(
                "yt-dlp probe failed: {}",
                String::from_utf8_lossy(&output.stderr).lines().last().unwrap_or("")
            );
            return Err(Error::Ingest(
                "Unable to fetch media info. Try again in a minute.".to_string(),
            ));
        }

        let info: Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| Error::Ingest(format!("Unreadable probe output: {}", e)))?;
        let probe = parse_probe(&info)?;
        self.check_caps(&probe)?;
        Ok(probe)
    }

    /// Validate against the configured caps with user-visible reasons.
    pub fn check_caps(&self, probe: &ProbeResult) -> Result<()> {
        if probe.duration_secs > self.max_duration_secs {
            return Err(Error::Ingest(format!(
                "Video too long: {}m. Maximum duration: {}m",
                probe.duration_secs / 60,
                self.max_duration_secs / 60
            )));
        }

        let known_smallest = probe
            .candidates
            .iter()
            .filter_map(|c| c.filesize)
            .min();
        if let Some(smallest) = known_smallest {
            if smallest > self.max_size_bytes {
                return Err(Error::Ingest(format!(
                    "Video too large: {}. Maximum size: {}",
                    format_size(smallest),
                    format_size(self.max_size_bytes)
                )));
            }
        }
        Ok(())
    }

    /// Download one format into a fresh scratch directory. `on_progress`
    /// receives the bytes written so far roughly every two seconds.
    pub async fn download<F>(
        &self,
        url: &str,
        format_id: &str,
        mut on_progress: F,
    ) -> Result<Download>
    where
        F: FnMut(u64),
    {
        let scratch = TempDir::new()?;
        let cookie_file = self.cookie_file()?;

        let template = scratch.path().join("%(title)s.%(ext)s");
        let mut cmd = Command::new("yt-dlp");
        cmd.arg("-f")
            .arg(format_id)
            .arg("-o")
            .arg(&template)
            .arg("--no-playlist")
            .arg("--no-warnings");
        self.apply_network_args(&mut cmd, cookie_file.as_ref());
        cmd.arg(url);
        cmd.stdout(std::process::Stdio::null());
        cmd.stderr(std::process::Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Ingest(format!("Fetcher unavailable: {}", e)))?;

        let status = loop {
            tokio::select! {
                status = child.wait() => break status?,
                _ = tokio::time::sleep(Duration::from_secs(2)) => {
                    on_progress(dir_size(scratch.path()));
                }
            }
        };

        if !status.success() {
            return Err(Error::Ingest(
                "Download failed. Try again in a minute.".to_string(),
            ));
        }

        let path = newest_media_file(scratch.path())
            .ok_or_else(|| Error::Ingest("Download produced no media file".to_string()))?;
        let size_bytes = std::fs::metadata(&path)?.len();

        if size_bytes > self.max_size_bytes {
            // scratch drops here and takes the oversized payload with it
            return Err(Error::Ingest(format!(
                "Downloaded file too large: {}. Maximum size: {}",
                format_size(size_bytes),
                format_size(self.max_size_bytes)
            )));
        }

        Ok(Download {
            path,
            size_bytes,
            _scratch: scratch,
        })
    }

    fn apply_network_args(&self, cmd: &mut Command, cookie_file: Option<&NamedTempFile>) {
        if let Some(proxy) = &self.proxy_url {
            cmd.arg("--proxy").arg(proxy);
        }
        if let Some(cookies) = cookie_file {
            cmd.arg("--cookies").arg(cookies.path());
        }
    }

    fn cookie_file(&self) -> Result<Option<NamedTempFile>> {
        let Some(blob) = &self.cookies else {
            return Ok(None);
        };
        let mut file = NamedTempFile::new()?;
        file.write_all(blob.as_bytes())?;
        file.flush()?;
        Ok(Some(file))
    }
}

/// Pull title, duration, and downloadable candidates out of yt-dlp's
/// `-J` output.
pub fn parse_probe(info: &Value) -> Result<ProbeResult> {
    let media_id = info
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or("external")
        .to_string();
    let title = info
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or("Untitled")
        .to_string();
    let duration_secs = info
        .get("duration")
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
        .max(0.0) as u64;

    let mut candidates: Vec<MediaCandidate> = Vec::new();
    if let Some(formats) = info.get("formats").and_then(Value::as_array) {
        for format in formats {
            let ext = format.get("ext").and_then(Value::as_str).unwrap_or("");
            if ext != "mp4" && ext != "webm" {
                continue;
            }
            let vcodec = format.get("vcodec").and_then(Value::as_str).unwrap_or("none");
            if vcodec == "none" {
                continue;
            }
            let Some(format_id) = format.get("format_id").and_then(Value::as_str) else {
                continue;
            };
            let height = format.get("height").and_then(Value::as_u64);
            let quality_label = match height {
                Some(h) => format!("{}p", h),
                None => format
                    .get("format_note")
                    .and_then(Value::as_str)
                    .unwrap_or("default")
                    .to_string(),
            };
            let filesize = format
                .get("filesize")
                .and_then(Value::as_u64)
                .or_else(|| format.get("filesize_approx").and_then(Value::as_u64));

            candidates.push(MediaCandidate {
                format_id: format_id.to_string(),
                quality_label,
                ext: ext.to_string(),
                filesize,
            });
        }
    }

    // keep one candidate per quality label, preferring the later (better
    // codec) entries yt-dlp lists, highest resolution first
    candidates.reverse();
    candidates.dedup_by(|a, b| a.quality_label == b.quality_label);
    candidates.sort_by_key(|c| {
        std::cmp::Reverse(c.quality_label.trim_end_matches('p').parse::<u64>().unwrap_or(0))
    });

    if candidates.is_empty() {
        return Err(Error::Ingest(
            "No downloadable media found at that link".to_string(),
        ));
    }

    Ok(ProbeResult {
        media_id,
        title,
        duration_secs,
        candidates,
    })
}

fn dir_size(path: &std::path::Path) -> u64 {
    std::fs::read_dir(path)
        .map(|entries| {
            entries
                .flatten()
                .filter_map(|e| e.metadata().ok())
                .map(|m| m.len())
                .sum()
        })
        .unwrap_or(0)
}

fn newest_media_file(path: &std::path::Path) -> Option<PathBuf> {
    std::fs::read_dir(path)
        .ok()?
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| MEDIA_EXTENSIONS.contains(&e.to_lowercase().as_str()))
                .unwrap_or(false)
        })
        .max_by_key(|p| std::fs::metadata(p).map(|m| m.len()).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROBE_JSON: &str = r#"{
        "id": "dQw4w9WgXcQ",
        "title": "Test Clip",
        "duration": 212.5,
        "formats": [
            {"format_id": "18", "ext": "mp4", "vcodec": "avc1", "height": 360, "filesize": 10485760},
            {"format_id": "140", "ext": "m4a", "vcodec": "none", "height": null},
            {"format_id": "22", "ext": "mp4", "vcodec": "avc1", "height": 720, "filesize_approx": 52428800},
            {"format_id": "247", "ext": "webm", "vcodec": "vp9", "height": 720},
            {"format_id": "303", "ext": "webm", "vcodec": "vp9", "height": 1080}
        ]
    }"#;

    fn probe_fixture() -> ProbeResult {
        parse_probe(&serde_json::from_str(PROBE_JSON).unwrap()).unwrap()
    }

    #[test]
    fn test_is_media_url() {
        assert!(is_media_url("https://www.youtube.com/watch?v=dQw4w9WgXcQ"));
        assert!(is_media_url("http://youtu.be/dQw4w9WgXcQ"));
        assert!(is_media_url("youtube.com/shorts/abc123"));
        assert!(!is_media_url("just some text"));
        assert!(!is_media_url("https://example.com/watch?v=x"));
    }

    #[test]
    fn test_parse_probe_extracts_metadata() {
        let probe = probe_fixture();
        assert_eq!(probe.media_id, "dQw4w9WgXcQ");
        assert_eq!(probe.title, "Test Clip");
        assert_eq!(probe.duration_secs, 212);
    }

    #[test]
    fn test_parse_probe_filters_and_orders_candidates() {
        let probe = probe_fixture();
        let labels: Vec<&str> = probe
            .candidates
            .iter()
            .map(|c| c.quality_label.as_str())
            .collect();
        // audio-only format dropped, one entry per quality, best first
        assert_eq!(labels, ["1080p", "720p", "360p"]);
    }

    #[test]
    fn test_parse_probe_rejects_audio_only_pages() {
        let info = serde_json::json!({
            "id": "x", "title": "t", "duration": 10,
            "formats": [{"format_id": "140", "ext": "m4a", "vcodec": "none"}]
        });
        assert!(parse_probe(&info).is_err());
    }

    #[test]
    fn test_duration_cap() {
        let fetcher = Fetcher::new(None, None, 500 * 1024 * 1024, 120);
        let probe = probe_fixture();
        let err = fetcher.check_caps(&probe).unwrap_err();
        assert!(err.to_string().contains("too long"));

        let fetcher = Fetcher::new(None, None, 500 * 1024 * 1024, 7200);
        assert!(fetcher.check_caps(&probe).is_ok());
    }

    #[test]
    fn test_size_cap_uses_smallest_known_candidate() {
        // smallest known candidate is 10 MiB; cap below that rejects
        let fetcher = Fetcher::new(None, None, 5 * 1024 * 1024, 7200);
        let err = fetcher.check_caps(&probe_fixture()).unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn test_newest_media_file_picks_largest_media() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.mp4"), vec![0u8; 10]).unwrap();
        std::fs::write(dir.path().join("b.webm"), vec![0u8; 100]).unwrap();
        std::fs::write(dir.path().join("notes.txt"), vec![0u8; 1000]).unwrap();

        let picked = newest_media_file(dir.path()).unwrap();
        assert_eq!(picked.file_name().unwrap(), "b.webm");
    }

    #[test]
    fn test_scratch_cleanup_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().to_path_buf();
        std::fs::write(path.join("payload.mp4"), b"data").unwrap();

        let download = Download {
            path: path.join("payload.mp4"),
            size_bytes: 4,
            _scratch: dir,
        };
        assert!(download.path.exists());
        drop(download);
        assert!(!path.exists());
    }
}
