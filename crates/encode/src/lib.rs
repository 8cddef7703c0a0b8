//! The encode stage: scratch-frame pool fed by capture, target-box overlay,
//! H.264 encoding, and fan-out of the resulting NALs to the output file and
//! the RTSP queue.

pub mod encoder;
pub mod overlay;
pub mod yuv;

use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use common_io::{ceil16, FrameSink, FrameView, Mailbox, SendError, TrackBox, SEND_TIMEOUT};
use config::EncodeCfg;
use parking_lot::Mutex;
use telemetry::{Differ, Span};
use tracing::debug;

use encoder::VideoEncoder;
use yuv::YuvFrame;

pub use overlay::THICKNESS;

/// Scratch frames cycling between the pool and the work queue.
pub const FRAME_POOL_NUM: usize = 3;

struct Slots {
    pool: Vec<YuvFrame>,
    work: VecDeque<YuvFrame>,
    differ_copy: Differ,
}

struct EncodeShared {
    slots: Mutex<Slots>,
    expected: usize,
    src_w: u32,
    src_h: u32,
}

/// Producer handle to the encoder's frame queue. The RGB bytes are
/// converted into a pooled YUV scratch frame while the lock is held; an
/// empty pool drops the frame.
#[derive(Clone)]
pub struct FrameSender {
    shared: Arc<EncodeShared>,
}

impl FrameSink for FrameSender {
    fn try_send_frame(&self, frame: FrameView<'_>) -> Result<(), SendError> {
        if frame.data.len() != self.shared.expected {
            return Err(SendError::SizeMismatch {
                expected: self.shared.expected,
                got: frame.data.len(),
            });
        }
        let mut slots = self
            .shared
            .slots
            .try_lock_for(SEND_TIMEOUT)
            .ok_or(SendError::Busy)?;
        let Some(mut scratch) = slots.pool.pop() else {
            return Err(SendError::Full);
        };
        slots.differ_copy.begin();
        scratch.fill_from_rgb24(frame.data, self.shared.src_w, self.shared.src_h);
        scratch.id = frame.id;
        slots.work.push_back(scratch);
        slots.differ_copy.end();
        Ok(())
    }
}

/// The Encode pipeline stage.
pub struct EncodeStage {
    shared: Arc<EncodeShared>,
    boxes_cell: Arc<Mailbox<Vec<TrackBox>>>,
    current_boxes: Vec<TrackBox>,
    encoder: Box<dyn VideoEncoder>,
    cfg: EncodeCfg,
    writer: Option<Box<dyn Write + Send>>,
    nal_out: Option<rtsp::NalSender>,
    quiet: bool,
    on: bool,
    frames_out: u64,
    differ_encode: Differ,
    span: Span,
}

impl EncodeStage {
    /// `width`/`height` are the capture dimensions; incoming frames must
    /// carry the 16-aligned buffer length the camera driver pads to, and
    /// scratch frames use the same padded geometry for the encoder.
    pub fn new(
        cfg: &EncodeCfg,
        width: u32,
        height: u32,
        quiet: bool,
        encoder: Box<dyn VideoEncoder>,
        nal_out: Option<rtsp::NalSender>,
    ) -> (Self, FrameSender, Arc<Mailbox<Vec<TrackBox>>>) {
        let shared = Arc::new(EncodeShared {
            slots: Mutex::new(Slots {
                pool: (0..FRAME_POOL_NUM)
                    .map(|_| YuvFrame::new(width, height))
                    .collect(),
                work: VecDeque::with_capacity(FRAME_POOL_NUM),
                differ_copy: Differ::new(),
            }),
            expected: ceil16(width) as usize * ceil16(height) as usize * common_io::FRAME_CHANNELS,
            src_w: width,
            src_h: height,
        });
        let sender = FrameSender {
            shared: Arc::clone(&shared),
        };
        let boxes_cell = Arc::new(Mailbox::new());
        (
            Self {
                shared,
                boxes_cell: Arc::clone(&boxes_cell),
                current_boxes: Vec::new(),
                encoder,
                cfg: cfg.clone(),
                writer: None,
                nal_out,
                quiet,
                on: false,
                frames_out: 0,
                differ_encode: Differ::new(),
                span: Span::default(),
            },
            sender,
            boxes_cell,
        )
    }
}

impl worker::Stage for EncodeStage {
    fn waiting_to_run(&mut self) -> anyhow::Result<()> {
        if !self.on {
            self.writer = match self.cfg.output.as_deref() {
                Some("-") => Some(Box::new(std::io::stdout())),
                Some(path) => Some(Box::new(
                    std::fs::File::create(path)
                        .with_context(|| format!("could not create output file {path}"))?,
                )),
                None => None,
            };
            self.span.begin();
            self.on = true;
        }
        Ok(())
    }

    fn running(&mut self) -> anyhow::Result<()> {
        if !self.on {
            return Ok(());
        }
        let frame = self.shared.slots.lock().work.pop_front();
        let Some(mut frame) = frame else {
            return Ok(());
        };

        // Whatever overlay set is newest applies to this frame; overlays
        // lag the frame rather than stall it.
        if let Some(boxes) = self.boxes_cell.take() {
            self.current_boxes = boxes;
        }
        overlay::draw_overlay(&mut frame, &self.current_boxes, THICKNESS);

        self.differ_encode.begin();
        let payload = self.encoder.encode(&frame).context("encoding frame")?;
        self.differ_encode.end();

        if !payload.is_empty() {
            self.frames_out += 1;
            if let Some(writer) = &mut self.writer {
                writer.write_all(&payload).context("writing output")?;
            }
            if let Some(tx) = &self.nal_out {
                if let Err(err) = tx.try_send(&payload) {
                    debug!("rtsp nal queue refused payload: {err}");
                }
            }
        }

        self.shared.slots.lock().pool.push(frame);
        Ok(())
    }

    fn waiting_to_halt(&mut self) -> anyhow::Result<()> {
        if self.on {
            self.on = false;
            self.encoder.finish()?;
            if let Some(writer) = &mut self.writer {
                writer.flush().context("flushing output")?;
            }
            self.writer = None;
            self.span.end();

            if !self.quiet {
                let copy = self.shared.slots.lock().differ_copy.clone();
                eprintln!("\nEncoder Results...");
                eprintln!("   frame copy time (us): {copy}");
                eprintln!("  frame encode time (us): {}", self.differ_encode);
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
