//! The detection stage: receives the newest camera frame through a
//! single-slot inbox, resizes it into the model's input tensor, runs the
//! interpreter, and emits a batch of pixel-space detections.

pub mod interpreter;
pub mod labels;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use common_io::{ceil16, Detection, FrameSink, FrameView, SendError, SEND_TIMEOUT};
use config::DetectCfg;
use parking_lot::Mutex;
use telemetry::{Differ, Span};
use tracing::debug;

use interpreter::{InputSpec, Interpreter, RawDetections, Tensor, TensorKind};
use labels::LabelMap;

/// Detections read from the model output per frame, before filtering.
pub const RESULT_NUM: usize = 10;

struct SlotInner {
    empty: bool,
    id: u64,
    buf: Vec<u8>,
    differ_copy: Differ,
}

/// One-frame inbox. The lock is held for the whole prep/eval/post pass, so
/// a producer knocking during inference gets `Busy`, and one with a frame
/// already pending gets `Full`.
struct FrameSlot {
    inner: Mutex<SlotInner>,
    expected: usize,
}

/// Producer handle to the detector's frame slot.
#[derive(Clone)]
pub struct FrameSender {
    slot: Arc<FrameSlot>,
}

impl FrameSink for FrameSender {
    fn try_send_frame(&self, frame: FrameView<'_>) -> Result<(), SendError> {
        if frame.data.len() != self.slot.expected {
            return Err(SendError::SizeMismatch {
                expected: self.slot.expected,
                got: frame.data.len(),
            });
        }
        let mut inner = self
            .slot
            .inner
            .try_lock_for(SEND_TIMEOUT)
            .ok_or(SendError::Busy)?;
        if !inner.empty {
            return Err(SendError::Full);
        }
        inner.differ_copy.begin();
        inner.id = frame.id;
        inner.buf.clear();
        inner.buf.extend_from_slice(frame.data);
        inner.empty = false;
        inner.differ_copy.end();
        Ok(())
    }
}

/// The Detect pipeline stage.
pub struct DetectStage {
    slot: Arc<FrameSlot>,
    out: track::DetectionSender,
    backend: Box<dyn Interpreter>,
    labels: LabelMap,
    cfg: DetectCfg,
    width: u32,
    height: u32,
    yield_time: Duration,
    quiet: bool,
    on: bool,
    post_id: u64,
    differ_prep: Differ,
    differ_eval: Differ,
    differ_post: Differ,
    span: Span,
}

impl DetectStage {
    /// `width`/`height` are the capture dimensions; incoming frames must
    /// carry the 16-aligned buffer length the camera driver pads to.
    pub fn new(
        cfg: &DetectCfg,
        width: u32,
        height: u32,
        yield_time_us: u64,
        quiet: bool,
        backend: Box<dyn Interpreter>,
        out: track::DetectionSender,
    ) -> (Self, FrameSender) {
        let expected = ceil16(width) as usize * ceil16(height) as usize * common_io::FRAME_CHANNELS;
        let slot = Arc::new(FrameSlot {
            inner: Mutex::new(SlotInner {
                empty: true,
                id: 0,
                buf: Vec::with_capacity(expected),
                differ_copy: Differ::new(),
            }),
            expected,
        });
        let sender = FrameSender {
            slot: Arc::clone(&slot),
        };
        (
            Self {
                slot,
                out,
                backend,
                labels: LabelMap::default(),
                cfg: cfg.clone(),
                width,
                height,
                yield_time: Duration::from_micros(yield_time_us),
                quiet,
                on: false,
                post_id: 0,
                differ_prep: Differ::new(),
                differ_eval: Differ::new(),
                differ_post: Differ::new(),
                span: Span::default(),
            },
            sender,
        )
    }

    fn one_run(&mut self, report: bool) -> anyhow::Result<()> {
        let mut inner = self.slot.inner.lock();
        if inner.empty {
            return Ok(());
        }

        self.differ_prep.begin();
        let spec = self.backend.input_spec();
        let input = prep(&inner.buf, self.width, self.height, &spec)?;
        self.differ_prep.end();
        std::thread::sleep(self.yield_time);

        self.differ_eval.begin();
        let raw = self.backend.invoke(&input)?;
        self.differ_eval.end();
        std::thread::sleep(self.yield_time);

        self.differ_post.begin();
        let frame_id = inner.id;
        let batch = postprocess(
            &raw,
            &self.labels,
            self.cfg.threshold,
            self.width,
            self.height,
            frame_id,
        );
        if report && !self.quiet {
            for det in &batch {
                eprint!("<{}>", det.kind.name());
            }
        }
        // An out-of-order batch is suppressed rather than emitted.
        if self.post_id <= frame_id {
            if let Err(err) = self.out.try_send(batch) {
                debug!("tracker detections cell busy: {err}");
            }
            self.post_id = frame_id;
        }
        self.differ_post.end();

        inner.empty = true;
        Ok(())
    }
}

impl worker::Stage for DetectStage {
    fn waiting_to_run(&mut self) -> anyhow::Result<()> {
        if !self.on {
            self.backend
                .load(std::path::Path::new(&self.cfg.model), self.cfg.threads)
                .context("building interpreter")?;
            let spec = self.backend.input_spec();
            anyhow::ensure!(
                spec.channels as usize == common_io::FRAME_CHANNELS,
                "model wants {} channels, frames carry {}",
                spec.channels,
                common_io::FRAME_CHANNELS
            );
            self.labels = LabelMap::from_file(std::path::Path::new(&self.cfg.labels))?;
            self.span.begin();
            self.on = true;
        }
        Ok(())
    }

    fn running(&mut self) -> anyhow::Result<()> {
        if self.on {
            self.one_run(true)?;
        }
        Ok(())
    }

    fn waiting_to_halt(&mut self) -> anyhow::Result<()> {
        if self.on {
            self.on = false;
            self.span.end();

            // Finish the frame that arrived while we were stopping.
            while !self.slot.inner.lock().empty {
                self.one_run(false)?;
            }

            if !self.quiet {
                let copy = self.slot.inner.lock().differ_copy.clone();
                eprintln!("\nDetector Results...");
                eprintln!("  image copy time (us): {copy}");
                eprintln!("  image prep time (us): {}", self.differ_prep);
                eprintln!("  image eval time (us): {}", self.differ_eval);
                eprintln!("  image post time (us): {}", self.differ_post);
                eprintln!("       total test time: {:.6} sec", self.span.elapsed_secs());
                eprintln!(
                    "     frames per second: {:.6} fps",
                    self.differ_post.fps_over(self.span.elapsed_us())
                );
                eprintln!();
            }
        }
        Ok(())
    }
}

/// Resizes the raw RGB24 frame into the model input tensor (bilinear), with
/// the float normalization quantized models skip.
fn prep(rgb: &[u8], src_w: u32, src_h: u32, spec: &InputSpec) -> anyhow::Result<Tensor> {
    // Driver buffers carry 16-aligned slack past the picture bytes.
    let picture = src_w as usize * src_h as usize * common_io::FRAME_CHANNELS;
    let picture = rgb
        .get(..picture)
        .context("frame buffer shorter than its dimensions")?;
    let img = image::RgbImage::from_raw(src_w, src_h, picture.to_vec())
        .context("frame buffer does not match its dimensions")?;
    let resized = image::imageops::resize(
        &img,
        spec.width,
        spec.height,
        image::imageops::FilterType::Triangle,
    );
    Ok(match spec.kind {
        TensorKind::Uint8 => Tensor::Uint8(resized.into_raw()),
        TensorKind::Float32 => Tensor::Float32(
            resized
                .into_raw()
                .iter()
                .map(|&v| (f32::from(v) - 127.5) / 127.5)
                .collect(),
        ),
    })
}

/// Turns the model's normalized output tensors into pixel-space detections:
/// clamp to [0,1], drop inverted boxes, sub-threshold scores, and classes
/// outside the label map, then scale with nearest rounding.
fn postprocess(
    raw: &RawDetections,
    labels: &LabelMap,
    threshold: f32,
    width: u32,
    height: u32,
    frame_id: u64,
) -> Vec<Detection> {
    let mut batch = Vec::new();
    for i in 0..raw.len().min(RESULT_NUM) {
        let score = raw.scores[i];
        if !(threshold..=1.0).contains(&score) {
            continue;
        }
        let class_id = raw.classes[i] as usize;
        let Some((_, kind)) = labels.lookup(class_id) else {
            continue;
        };

        let top = raw.boxes[i][0].clamp(0.0, 1.0);
        let left = raw.boxes[i][1].clamp(0.0, 1.0);
        let bottom = raw.boxes[i][2].clamp(0.0, 1.0);
        let right = raw.boxes[i][3].clamp(0.0, 1.0);
        if top >= bottom || left >= right {
            continue;
        }

        let top_px = (top * height as f32).round() as u32;
        let bottom_px = (bottom * height as f32).round() as u32;
        let left_px = (left * width as f32).round() as u32;
        let right_px = (right * width as f32).round() as u32;
        let w = right_px.saturating_sub(left_px);
        let h = bottom_px.saturating_sub(top_px);
        if w == 0 || h == 0 {
            continue;
        }

        batch.push(Detection {
            kind,
            frame_id,
            x: left_px,
            y: top_px,
            w,
            h,
        });
    }
    batch
}
