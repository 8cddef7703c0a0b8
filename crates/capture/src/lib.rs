//! Frame capture and fan-out.
//!
//! The capture stage pulls RGB24 frames from a [`CameraSource`], stamps each
//! with a monotonic frame id, and offers it to the detector and the encoder
//! through their sink handles. Both sends are try-sends: a busy consumer
//! costs a dropped message, never a blocked camera.

pub mod synthetic;
#[cfg(target_os = "linux")]
pub mod v4l2;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common_io::{FrameSink, FrameView};
use config::CaptureCfg;
use telemetry::{Differ, Span};
use tracing::debug;

/// Driver-side frame buffers.
pub const FRAMEBUF_NUM: u32 = 3;

/// How long one tick waits for the camera before giving up.
pub const CAMERA_WAIT: Duration = Duration::from_secs(2);

/// Negotiated capture geometry and rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraFormat {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
}

/// A camera delivering RGB24 frames.
///
/// `next_frame` blocks up to [`CAMERA_WAIT`] and returns `Ok(None)` on
/// timeout; the returned slice stays valid until the next call, which is
/// when the underlying buffer goes back to the driver.
pub trait CameraSource: Send {
    fn connect(&mut self, cfg: &CaptureCfg) -> anyhow::Result<CameraFormat>;
    fn next_frame(&mut self) -> anyhow::Result<Option<&[u8]>>;
    fn disconnect(&mut self);
}

/// Counters shared with whoever wants to watch the capture stage.
#[derive(Debug, Default)]
pub struct CaptureStats {
    pub frames: AtomicU64,
    pub detect_sent: AtomicU64,
    pub detect_drops: AtomicU64,
    pub encode_sent: AtomicU64,
    pub encode_drops: AtomicU64,
}

/// The Capture pipeline stage.
pub struct CaptureStage {
    source: Box<dyn CameraSource>,
    cfg: CaptureCfg,
    quiet: bool,
    detect_sink: Arc<dyn FrameSink>,
    encode_sink: Arc<dyn FrameSink>,
    stats: Arc<CaptureStats>,
    frame_count: u64,
    on: bool,
    differ_detect: Differ,
    differ_encode: Differ,
    span: Span,
}

impl CaptureStage {
    pub fn new(
        cfg: &CaptureCfg,
        quiet: bool,
        source: Box<dyn CameraSource>,
        detect_sink: Arc<dyn FrameSink>,
        encode_sink: Arc<dyn FrameSink>,
    ) -> (Self, Arc<CaptureStats>) {
        let stats = Arc::new(CaptureStats::default());
        (
            Self {
                source,
                cfg: cfg.clone(),
                quiet,
                detect_sink,
                encode_sink,
                stats: Arc::clone(&stats),
                frame_count: 0,
                on: false,
                differ_detect: Differ::new(),
                differ_encode: Differ::new(),
                span: Span::default(),
            },
            stats,
        )
    }
}

impl worker::Stage for CaptureStage {
    fn waiting_to_run(&mut self) -> anyhow::Result<()> {
        if !self.on {
            let format = self.source.connect(&self.cfg)?;
            anyhow::ensure!(
                format.width == self.cfg.frame_width()
                    && format.height == self.cfg.frame_height(),
                "driver adjusted resolution to {}x{} (wanted {}x{})",
                format.width,
                format.height,
                self.cfg.frame_width(),
                self.cfg.frame_height()
            );
            self.span.begin();
            self.on = true;
        }
        Ok(())
    }

    fn running(&mut self) -> anyhow::Result<()> {
        if !self.on {
            return Ok(());
        }
        let width = self.cfg.frame_width();
        let height = self.cfg.frame_height();
        let id = self.frame_count;

        let Some(data) = self.source.next_frame()? else {
            debug!("camera wait timed out");
            return Ok(());
        };
        let view = FrameView::new(id, width, height, data);

        self.differ_detect.begin();
        match self.detect_sink.try_send_frame(view) {
            Ok(()) => {
                self.stats.detect_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                debug!("detector refused frame {id}: {err}");
                self.stats.detect_drops.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.differ_detect.end();

        self.differ_encode.begin();
        match self.encode_sink.try_send_frame(view) {
            Ok(()) => {
                self.stats.encode_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                debug!("encoder refused frame {id}: {err}");
                self.stats.encode_drops.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.differ_encode.end();

        self.frame_count += 1;
        self.stats.frames.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn waiting_to_halt(&mut self) -> anyhow::Result<()> {
        if self.on {
            self.on = false;
            self.span.end();
            self.source.disconnect();

            if !self.quiet {
                eprintln!("\n\nCapturer Results...");
                eprintln!("   number of frames captured: {}", self.frame_count);
                eprintln!("   detect copy time (us): {}", self.differ_detect);
                eprintln!("   encode copy time (us): {}", self.differ_encode);
                eprintln!("        total test time: {:.6} sec", self.span.elapsed_secs());
                eprintln!(
                    "      frames per second: {:.6} fps",
                    self.differ_encode.fps_over(self.span.elapsed_us())
                );
                eprintln!();
            }
        }
        Ok(())
    }
}
