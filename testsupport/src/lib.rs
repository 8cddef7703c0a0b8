//! Shared test doubles for the pipeline crates.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common_io::{Detection, FrameSink, FrameView, SendError, TargetKind};
use detect::interpreter::{InputSpec, Interpreter, RawDetections, Tensor, TensorKind};
use parking_lot::Mutex;
use rtsp::{SessionContext, StreamHost};

/// Deterministic RGB24 frame; `seed` varies the pattern.
pub fn make_rgb_frame(width: u32, height: u32, seed: u8) -> Vec<u8> {
    let mut data = vec![0u8; (width * height * 3) as usize];
    for (i, px) in data.chunks_exact_mut(3).enumerate() {
        let v = (i as u8).wrapping_mul(31).wrapping_add(seed);
        px[0] = v;
        px[1] = v.wrapping_add(85);
        px[2] = v.wrapping_add(170);
    }
    data
}

pub fn detection(kind: TargetKind, frame_id: u64, x: u32, y: u32, w: u32, h: u32) -> Detection {
    Detection {
        kind,
        frame_id,
        x,
        y,
        w,
        h,
    }
}

/// Frame sink that records what it accepted, and can be told to refuse.
#[derive(Default)]
pub struct CollectingSink {
    refuse: AtomicBool,
    accepted: Mutex<Vec<(u64, usize)>>,
    drops_seen: AtomicU64,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// While refusing, every send fails with `Busy`, the way a consumer
    /// holding its slot lock looks to the producer.
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn accepted(&self) -> Vec<(u64, usize)> {
        self.accepted.lock().clone()
    }

    pub fn accepted_count(&self) -> usize {
        self.accepted.lock().len()
    }

    pub fn refused_count(&self) -> u64 {
        self.drops_seen.load(Ordering::SeqCst)
    }
}

impl FrameSink for CollectingSink {
    fn try_send_frame(&self, frame: FrameView<'_>) -> Result<(), SendError> {
        if self.refuse.load(Ordering::SeqCst) {
            self.drops_seen.fetch_add(1, Ordering::SeqCst);
            return Err(SendError::Busy);
        }
        self.accepted.lock().push((frame.id, frame.data.len()));
        Ok(())
    }
}

/// Interpreter that plays back scripted detection rounds, one per invoke,
/// then reports nothing.
pub struct ScriptedInterpreter {
    spec: InputSpec,
    rounds: Mutex<VecDeque<RawDetections>>,
    invokes: AtomicU64,
}

impl ScriptedInterpreter {
    pub fn new(rounds: Vec<RawDetections>) -> Self {
        Self {
            spec: InputSpec {
                width: 32,
                height: 32,
                channels: 3,
                kind: TensorKind::Uint8,
            },
            rounds: Mutex::new(rounds.into()),
            invokes: AtomicU64::new(0),
        }
    }

    pub fn with_spec(mut self, spec: InputSpec) -> Self {
        self.spec = spec;
        self
    }

    pub fn invokes(&self) -> u64 {
        self.invokes.load(Ordering::SeqCst)
    }
}

impl Interpreter for ScriptedInterpreter {
    fn load(&mut self, _model: &Path, _threads: u32) -> anyhow::Result<()> {
        Ok(())
    }

    fn input_spec(&self) -> InputSpec {
        self.spec
    }

    fn invoke(&mut self, _input: &Tensor) -> anyhow::Result<RawDetections> {
        self.invokes.fetch_add(1, Ordering::SeqCst);
        Ok(self.rounds.lock().pop_front().unwrap_or_default())
    }
}

/// One scripted detection round with a single box, handy for scenarios.
pub fn one_box_round(top: f32, left: f32, bottom: f32, right: f32, class: f32, score: f32) -> RawDetections {
    RawDetections {
        boxes: vec![[top, left, bottom, right]],
        classes: vec![class],
        scores: vec![score],
    }
}

/// Stream host double: pulls every queued payload on each wakeup and records
/// the delivered bytes.
pub struct RecordingHost {
    max_size: usize,
    delivered: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl RecordingHost {
    pub fn new(max_size: usize) -> (Self, Arc<Mutex<Vec<Vec<u8>>>>) {
        let delivered = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                max_size,
                delivered: Arc::clone(&delivered),
            },
            delivered,
        )
    }
}

impl StreamHost for RecordingHost {
    fn serve(&mut self, ctx: SessionContext) -> anyhow::Result<()> {
        let mut buf = vec![0u8; self.max_size];
        while !ctx.shutdown.load(Ordering::SeqCst) {
            ctx.wakeup.wait_timeout(Duration::from_millis(20));
            while let Some(d) = ctx.queue.deliver(&mut buf) {
                self.delivered.lock().push(buf[..d.len].to_vec());
            }
        }
        // Drain whatever is still queued on the way out.
        while let Some(d) = ctx.queue.deliver(&mut buf) {
            self.delivered.lock().push(buf[..d.len].to_vec());
        }
        Ok(())
    }
}
