//! Exactly-once banner injection.
//!
//! A banner is printed ahead of the first real output of an invocation unless that
//! output looks like structured data (JSON or XML), in which case it is suppressed for
//! that stream. Two streams of the same invocation (stdout and stderr) share one
//! [`SharedBanner`], so whichever produces output first wins and the banner is never
//! printed twice.

use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::control::is_control_frame;

const BANNER_SEPARATOR: &[u8] = b"\n\n";

/// Where the banner text comes from.
#[derive(Clone)]
pub enum BannerSource {
    Text(String),
    /// Evaluated lazily, at the moment the banner would be shown.
    Producer(Arc<dyn Fn() -> Option<String> + Send + Sync>),
}

impl BannerSource {
    pub fn text(text: impl Into<String>) -> Self {
        BannerSource::Text(text.into())
    }

    pub fn producer<F>(producer: F) -> Self
    where
        F: Fn() -> Option<String> + Send + Sync + 'static,
    {
        BannerSource::Producer(Arc::new(producer))
    }

    fn resolve(&self) -> Option<String> {
        match self {
            BannerSource::Text(text) => Some(text.clone()),
            BannerSource::Producer(producer) => producer(),
        }
    }
}

impl fmt::Debug for BannerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BannerSource::Text(text) => f.debug_tuple("Text").field(text).finish(),
            BannerSource::Producer(_) => f.write_str("Producer(..)"),
        }
    }
}

#[derive(Debug, Default)]
struct BannerInner {
    source: Option<BannerSource>,
    enabled: bool,
    shown: bool,
}

/// Banner handle shared by every stream of one invocation.
#[derive(Debug, Clone, Default)]
pub struct SharedBanner {
    inner: Arc<Mutex<BannerInner>>,
}

impl SharedBanner {
    pub fn new(source: Option<BannerSource>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BannerInner {
                source,
                enabled: true,
                shown: false,
            })),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Some(BannerSource::text(text)))
    }

    /// A handle that never produces a banner.
    pub fn none() -> Self {
        Self::new(None)
    }

    pub fn disable(&self) {
        self.inner.lock().enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().enabled
    }

    pub fn is_shown(&self) -> bool {
        self.inner.lock().shown
    }

    /// Returns the trimmed banner the first time it is asked for, across all clones.
    pub fn take(&self) -> Option<String> {
        let mut inner = self.inner.lock();
        if inner.shown || !inner.enabled {
            return None;
        }
        let text = inner.source.as_ref()?.resolve()?;
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return None;
        }
        inner.shown = true;
        Some(trimmed.to_owned())
    }
}

/// Per-stream decision state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BannerState {
    pub decided: bool,
    pub suppressed: bool,
}

/// What to write for one chunk: an optional banner followed by the chunk untouched.
#[derive(Debug, PartialEq, Eq)]
pub struct BannerOutput<'a> {
    pub banner: Option<Vec<u8>>,
    pub chunk: &'a [u8],
}

impl BannerOutput<'_> {
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            self.banner.as_ref().map_or(0, Vec::len) + self.chunk.len(),
        );
        if let Some(banner) = &self.banner {
            out.extend_from_slice(banner);
        }
        out.extend_from_slice(self.chunk);
        out
    }
}

/// Banner decision for one logical output stream.
#[derive(Debug)]
pub struct BannerStage {
    state: BannerState,
    banner: SharedBanner,
}

impl BannerStage {
    pub fn new(banner: SharedBanner) -> Self {
        Self {
            state: BannerState::default(),
            banner,
        }
    }

    pub fn state(&self) -> BannerState {
        self.state
    }

    pub fn apply<'a>(&mut self, chunk: &'a [u8]) -> BannerOutput<'a> {
        let passthrough = BannerOutput {
            banner: None,
            chunk,
        };
        if self.state.decided || is_control_frame(chunk) {
            return passthrough;
        }
        let Some(&first) = chunk.iter().find(|byte| !byte.is_ascii_whitespace()) else {
            return passthrough;
        };

        self.state.decided = true;
        if matches!(first, b'{' | b'[' | b'<') {
            self.state.suppressed = true;
            debug!("structured output detected; banner suppressed for stream");
            return passthrough;
        }

        let banner = self.banner.take().map(|text| {
            trace!(bytes = text.len(), "emitting banner");
            let mut bytes = text.into_bytes();
            bytes.extend_from_slice(BANNER_SEPARATOR);
            bytes
        });
        BannerOutput { banner, chunk }
    }
}

/// `std::io::Write` adapter used for local (in-process) output.
#[derive(Debug)]
pub struct BannerWriter<W> {
    inner: W,
    stage: BannerStage,
}

impl<W: Write> BannerWriter<W> {
    pub fn new(inner: W, banner: SharedBanner) -> Self {
        Self {
            inner,
            stage: BannerStage::new(banner),
        }
    }

    pub fn state(&self) -> BannerState {
        self.stage.state()
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for BannerWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let output = self.stage.apply(buf);
        if let Some(banner) = &output.banner {
            self.inner.write_all(banner)?;
        }
        self.inner.write_all(output.chunk)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{encode, ControlFrame};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test_timeout::timeout]
    fn structured_first_chunk_suppresses_banner() {
        let chunks: [&[u8]; 4] = [b"{\"a\":1}", b"[1,2]", b"<xml/>", b"  \n {\"a\":1}"];
        for chunk in chunks {
            let mut stage = BannerStage::new(SharedBanner::text("Welcome"));
            let out = stage.apply(chunk);
            assert_eq!(out.to_vec(), chunk.to_vec());
            assert_eq!(
                stage.state(),
                BannerState {
                    decided: true,
                    suppressed: true
                }
            );
        }
    }

    #[test_timeout::timeout]
    fn plain_first_chunk_gets_trimmed_banner_once() {
        let mut stage = BannerStage::new(SharedBanner::text("  Welcome to pier \n"));
        assert_eq!(stage.apply(b"hello\n").to_vec(), b"Welcome to pier\n\nhello\n".to_vec());
        assert_eq!(stage.apply(b"again\n").to_vec(), b"again\n".to_vec());
        assert!(stage.state().decided);
        assert!(!stage.state().suppressed);
    }

    #[test_timeout::timeout]
    fn sibling_streams_share_one_banner() {
        let banner = SharedBanner::text("banner");
        let mut stdout = BannerStage::new(banner.clone());
        let mut stderr = BannerStage::new(banner.clone());

        assert_eq!(stderr.apply(b"warn\n").banner, Some(b"banner\n\n".to_vec()));
        assert_eq!(stdout.apply(b"out\n").banner, None);
        assert!(banner.is_shown());
    }

    #[test_timeout::timeout]
    fn suppression_is_per_stream() {
        let banner = SharedBanner::text("banner");
        let mut stdout = BannerStage::new(banner.clone());
        let mut stderr = BannerStage::new(banner.clone());

        assert_eq!(stdout.apply(b"{}").banner, None);
        assert!(!banner.is_shown());
        assert!(stderr.apply(b"oops\n").banner.is_some());
    }

    #[test_timeout::timeout]
    fn control_frames_and_blank_chunks_do_not_decide() {
        let mut stage = BannerStage::new(SharedBanner::text("banner"));
        let frame = encode(&ControlFrame::echo(false));
        assert_eq!(stage.apply(&frame).to_vec(), frame);
        assert_eq!(stage.apply(b" \r\n").to_vec(), b" \r\n".to_vec());
        assert!(!stage.state().decided);
        assert_eq!(stage.apply(b"x").to_vec(), b"banner\n\nx".to_vec());
    }

    #[test_timeout::timeout]
    fn producer_runs_lazily_and_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let banner = SharedBanner::new(Some(BannerSource::producer(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Some("v1.2.3".to_owned())
        })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let mut stage = BannerStage::new(banner.clone());
        stage.apply(b"out");
        stage.apply(b"more");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(banner.take(), None);
    }

    #[test_timeout::timeout]
    fn disabled_or_empty_banner_prints_nothing() {
        let banner = SharedBanner::text("hidden");
        banner.disable();
        let mut stage = BannerStage::new(banner);
        assert_eq!(stage.apply(b"out").banner, None);

        let empty = SharedBanner::new(Some(BannerSource::producer(|| Some("   ".into()))));
        assert_eq!(BannerStage::new(empty).apply(b"out").banner, None);

        assert_eq!(BannerStage::new(SharedBanner::none()).apply(b"out").banner, None);
    }

    #[test_timeout::timeout]
    fn writer_forwards_bytes_verbatim() {
        let mut writer = BannerWriter::new(Vec::new(), SharedBanner::text("hi"));
        writer.write_all(&[0xff, 0xfe, b'\n']).expect("write");
        writer.write_all(b"tail").expect("write");
        assert_eq!(writer.into_inner(), b"hi\n\n\xff\xfe\ntail".to_vec());
    }
}
