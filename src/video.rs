//! Frame acquisition.
//!
//! A [`FrameSource`] turns a descriptor into a [`FrameStream`] that the
//! agent loop polls once per cycle. Streams report end-of-stream as
//! `Ok(None)` and transient stalls as `Err`; the loop decides what to do
//! with either.
//!
//! Codec work is not done here. File descriptors point at a directory of
//! encoded still images (one frame per file, name order) or a single image;
//! `http(s)` descriptors are polled as snapshot endpoints.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use tokio::time::Instant;
use url::Url;

use crate::error::SentinelError;
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::types::Frame;

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "webp"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceDescriptor {
    File(PathBuf),
    Network(Url),
    Device(u32),
}

impl SourceDescriptor {
    pub fn parse(raw: &str) -> Result<Self, SentinelError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(SentinelError::InvalidDescriptor(raw.to_string()));
        }
        if let Ok(index) = trimmed.parse::<u32>() {
            return Ok(SourceDescriptor::Device(index));
        }
        if let Ok(url) = Url::parse(trimmed) {
            match url.scheme() {
                "rtsp" | "rtsps" | "rtmp" | "http" | "https" => return Ok(SourceDescriptor::Network(url)),
                "file" => {
                    return url
                        .to_file_path()
                        .map(SourceDescriptor::File)
                        .map_err(|_| SentinelError::InvalidDescriptor(raw.to_string()));
                }
                // windows drive letters parse as a one-letter scheme
                _ if url.scheme().len() > 1 => {
                    return Err(SentinelError::InvalidDescriptor(raw.to_string()))
                }
                _ => {}
            }
        }
        Ok(SourceDescriptor::File(PathBuf::from(trimmed)))
    }
}

impl std::fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceDescriptor::File(p) => write!(f, "{}", p.display()),
            SourceDescriptor::Network(u) => write!(f, "{}", u),
            SourceDescriptor::Device(i) => write!(f, "device:{}", i),
        }
    }
}

#[async_trait]
pub trait FrameStream: Send {
    /// `Ok(None)` once the stream is exhausted.
    async fn next_frame(&mut self) -> Result<Option<Frame>>;

    fn release(&mut self);
}

#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn acquire(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn FrameStream>>;
}

/// Default source: still-image directories and HTTP snapshot endpoints.
pub struct StillFrameSource {
    client: Client,
}

impl StillFrameSource {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FrameSource for StillFrameSource {
    async fn acquire(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn FrameStream>> {
        match descriptor {
            SourceDescriptor::File(path) => Ok(Box::new(ImageSequence::open(path).await?)),
            SourceDescriptor::Network(url) if matches!(url.scheme(), "http" | "https") => {
                Ok(Box::new(HttpSnapshotStream::new(self.client.clone(), url.clone())))
            }
            other => bail!("{} needs a video decoder, which this build does not include", other),
        }
    }
}

/// Finite stream over encoded image files.
pub struct ImageSequence {
    files: Vec<PathBuf>,
    cursor: usize,
    seq: u64,
    released: bool,
}

impl ImageSequence {
    pub async fn open(path: &Path) -> Result<Self> {
        let meta = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("cannot open {}", path.display()))?;

        let files = if meta.is_dir() {
            let mut files = Vec::new();
            let mut entries = tokio::fs::read_dir(path).await?;
            while let Some(entry) = entries.next_entry().await? {
                let p = entry.path();
                if is_image(&p) {
                    files.push(p);
                }
            }
            files.sort();
            files
        } else if is_image(path) {
            vec![path.to_path_buf()]
        } else {
            bail!("{} is not a still image and needs a video decoder", path.display());
        };

        if files.is_empty() {
            bail!("no image frames under {}", path.display());
        }
        log(
            Level::Info,
            Domain::Video,
            "sequence_opened",
            obj(&[
                ("descriptor", v_str(&path.to_string_lossy())),
                ("frames", serde_json::json!(files.len())),
            ]),
        );
        Ok(Self {
            files,
            cursor: 0,
            seq: 0,
            released: false,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[async_trait]
impl FrameStream for ImageSequence {
    async fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.released || self.cursor >= self.files.len() {
            return Ok(None);
        }
        let path = &self.files[self.cursor];
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading frame {}", path.display()))?;
        self.cursor += 1;
        self.seq += 1;
        Ok(Some(Frame {
            seq: self.seq,
            captured_at: Utc::now(),
            data,
        }))
    }

    fn release(&mut self) {
        self.released = true;
    }
}

/// Unbounded stream that GETs a snapshot URL once per frame.
pub struct HttpSnapshotStream {
    client: Client,
    url: Url,
    seq: u64,
    released: bool,
}

impl HttpSnapshotStream {
    pub fn new(client: Client, url: Url) -> Self {
        Self {
            client,
            url,
            seq: 0,
            released: false,
        }
    }
}

#[async_trait]
impl FrameStream for HttpSnapshotStream {
    async fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.released {
            return Ok(None);
        }
        let resp = self.client.get(self.url.clone()).send().await?;
        if !resp.status().is_success() {
            return Err(anyhow!("snapshot endpoint returned {}", resp.status()));
        }
        let data = resp.bytes().await?.to_vec();
        self.seq += 1;
        Ok(Some(Frame {
            seq: self.seq,
            captured_at: Utc::now(),
            data,
        }))
    }

    fn release(&mut self) {
        self.released = true;
    }
}

/// Enforces a minimum spacing between pulled frames.
#[derive(Debug)]
pub struct FrameThrottle {
    interval: Option<Duration>,
    last: Option<Instant>,
}

impl FrameThrottle {
    pub fn new(interval: Option<Duration>) -> Self {
        Self { interval, last: None }
    }

    /// Time left before the next frame may be pulled.
    pub fn remaining(&self) -> Duration {
        match (self.interval, self.last) {
            (Some(interval), Some(last)) => interval.saturating_sub(last.elapsed()),
            _ => Duration::ZERO,
        }
    }

    pub async fn wait(&mut self) {
        let remaining = self.remaining();
        if !remaining.is_zero() {
            tokio::time::sleep(remaining).await;
        }
        self.last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_classification() {
        assert_eq!(SourceDescriptor::parse("0").unwrap(), SourceDescriptor::Device(0));
        assert!(matches!(
            SourceDescriptor::parse("rtsp://cam.local/stream").unwrap(),
            SourceDescriptor::Network(_)
        ));
        assert!(matches!(
            SourceDescriptor::parse("https://cam.local/snapshot.jpg").unwrap(),
            SourceDescriptor::Network(_)
        ));
        assert_eq!(
            SourceDescriptor::parse("./videos/site.mp4").unwrap(),
            SourceDescriptor::File(PathBuf::from("./videos/site.mp4"))
        );
        assert!(SourceDescriptor::parse("  ").is_err());
        assert!(SourceDescriptor::parse("ftp://host/x").is_err());
    }

    #[tokio::test]
    async fn image_sequence_reads_in_name_order_then_exhausts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("002.jpg"), b"two").unwrap();
        std::fs::write(dir.path().join("001.jpg"), b"one").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"skip").unwrap();

        let mut seq = ImageSequence::open(dir.path()).await.unwrap();
        assert_eq!(seq.len(), 2);
        assert_eq!(seq.next_frame().await.unwrap().unwrap().data, b"one");
        let second = seq.next_frame().await.unwrap().unwrap();
        assert_eq!(second.data, b"two");
        assert_eq!(second.seq, 2);
        assert!(seq.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_directory_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ImageSequence::open(dir.path()).await.is_err());
        assert!(ImageSequence::open(&dir.path().join("missing")).await.is_err());
    }

    #[tokio::test]
    async fn single_file_must_be_a_still_image() {
        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("site.mp4");
        std::fs::write(&clip, b"\x00\x00\x00\x18ftypmp42").unwrap();
        let still = dir.path().join("gate.JPG");
        std::fs::write(&still, b"jpeg").unwrap();

        assert!(ImageSequence::open(&clip).await.is_err());
        let mut seq = ImageSequence::open(&still).await.unwrap();
        assert_eq!(seq.len(), 1);
        assert_eq!(seq.next_frame().await.unwrap().unwrap().data, b"jpeg");

        let src = StillFrameSource::new(Duration::from_secs(1)).unwrap();
        let descriptor = SourceDescriptor::parse(&clip.to_string_lossy()).unwrap();
        assert!(src.acquire(&descriptor).await.is_err());
    }

    #[tokio::test]
    async fn released_sequence_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.png"), b"a").unwrap();
        let mut seq = ImageSequence::open(dir.path()).await.unwrap();
        seq.release();
        assert!(seq.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn still_source_rejects_streams_needing_codec() {
        let src = StillFrameSource::new(Duration::from_secs(1)).unwrap();
        let rtsp = SourceDescriptor::parse("rtsp://cam/stream").unwrap();
        assert!(src.acquire(&rtsp).await.is_err());
        assert!(src.acquire(&SourceDescriptor::Device(0)).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_spaces_frames() {
        let mut t = FrameThrottle::new(Some(Duration::from_millis(200)));
        let start = Instant::now();
        t.wait().await;
        t.wait().await;
        t.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[test]
    fn unthrottled_never_waits() {
        let t = FrameThrottle::new(None);
        assert_eq!(t.remaining(), Duration::ZERO);
    }
}
