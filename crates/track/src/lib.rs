//! Multi-object tracking: nearest-neighbor association between predicted
//! track centers and fresh detections, per-track Kalman smoothing, track
//! birth and death.

pub mod hungarian;
pub mod kalman;

use std::sync::Arc;

use common_io::{Detection, Mailbox, TargetKind, TrackBox};
use config::TrackCfg;
use telemetry::{Differ, Span};
use tracing::debug;

use kalman::Kalman;

/// `Init` is the state between creation and the first attached measurement;
/// the transition to `Active` is one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Active,
}

#[derive(Debug, Clone)]
pub struct Track {
    pub id: u64,
    pub kind: TargetKind,
    pub last_seen: u64,
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    pub phase: Phase,
    kalman: Kalman,
}

impl Track {
    fn new(id: u64, det: &Detection) -> Self {
        let (cx, cy) = det.center();
        Self {
            id,
            kind: det.kind,
            last_seen: det.frame_id,
            x: det.x,
            y: det.y,
            w: det.w,
            h: det.h,
            phase: Phase::Init,
            kalman: Kalman::new(cx, cy),
        }
    }

    /// Attaches one detection: stores the box, seeds velocity on the first
    /// measurement, then runs the filter's time and measurement updates.
    pub fn add_measurement(&mut self, det: &Detection) {
        let (mx, my) = det.center();
        self.last_seen = det.frame_id;
        self.kind = det.kind;
        self.x = det.x;
        self.y = det.y;
        self.w = det.w;
        self.h = det.h;
        if self.phase == Phase::Init {
            self.kalman.seed_velocity(mx, my);
            self.phase = Phase::Active;
        }
        self.kalman.predict();
        self.kalman.correct(mx, my);
    }

    pub fn center(&self) -> (f32, f32) {
        self.kalman.center()
    }

    pub fn velocity(&self) -> (f32, f32) {
        self.kalman.velocity()
    }

    pub fn predicted_center(&self) -> (f32, f32) {
        self.kalman.predicted_center()
    }
}

/// The live track collection and its association/birth/reap policy.
pub struct TrackSet {
    tracks: Vec<Track>,
    next_id: u64,
    max_dist: f32,
    max_frames: u64,
}

impl TrackSet {
    pub fn new(max_dist: f32, max_frames: u64) -> Self {
        Self {
            tracks: Vec::new(),
            next_id: 0,
            max_dist,
            max_frames,
        }
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// Feeds one detection batch (all entries share a frame id) through
    /// association, birth, and reaping.
    pub fn observe(&mut self, batch: &[Detection]) {
        let Some(frame_id) = batch.first().map(|d| d.frame_id) else {
            return;
        };
        debug_assert!(batch.iter().all(|d| d.frame_id == frame_id));

        let mut claimed = vec![false; batch.len()];

        if !self.tracks.is_empty() {
            let cost: Vec<Vec<f32>> = self
                .tracks
                .iter()
                .map(|t| {
                    let (px, py) = t.predicted_center();
                    batch
                        .iter()
                        .map(|d| {
                            let (dx, dy) = d.center();
                            ((px - dx).powi(2) + (py - dy).powi(2)).sqrt()
                        })
                        .collect()
                })
                .collect();

            let assignment = hungarian::assign(&cost);
            for (i, slot) in assignment.iter().enumerate() {
                let Some(j) = *slot else { continue };
                if j >= batch.len() {
                    continue;
                }
                if cost[i][j] <= self.max_dist {
                    self.tracks[i].add_measurement(&batch[j]);
                    claimed[j] = true;
                }
            }
        }

        // Unmatched detections become new tracks; the founding detection is
        // also the first measurement.
        for (j, det) in batch.iter().enumerate() {
            if claimed[j] {
                continue;
            }
            let mut track = Track::new(self.next_id, det);
            self.next_id += 1;
            track.add_measurement(det);
            self.tracks.push(track);
        }

        self.tracks
            .retain(|t| frame_id.saturating_sub(t.last_seen) <= self.max_frames);
    }

    pub fn snapshot(&self) -> Vec<TrackBox> {
        self.tracks
            .iter()
            .map(|t| TrackBox {
                kind: t.kind,
                track_id: t.id,
                x: t.x,
                y: t.y,
                w: t.w,
                h: t.h,
            })
            .collect()
    }
}

/// Sender half of the tracker's latest-detections cell; held by the
/// detector. Stale batches are overwritten, never queued.
#[derive(Clone)]
pub struct DetectionSender {
    cell: Arc<Mailbox<Vec<Detection>>>,
}

impl DetectionSender {
    pub fn try_send(&self, batch: Vec<Detection>) -> Result<(), common_io::SendError> {
        self.cell.try_replace(batch)
    }
}

/// The Track pipeline stage: drains the detections cell, updates the track
/// set, and hands the current overlay boxes to the encoder.
pub struct TrackStage {
    cell: Arc<Mailbox<Vec<Detection>>>,
    boxes_out: Arc<Mailbox<Vec<TrackBox>>>,
    set: TrackSet,
    quiet: bool,
    on: bool,
    differ_tick: Differ,
    span: Span,
}

impl TrackStage {
    pub fn new(
        cfg: &TrackCfg,
        quiet: bool,
        boxes_out: Arc<Mailbox<Vec<TrackBox>>>,
    ) -> (Self, DetectionSender) {
        let cell = Arc::new(Mailbox::new());
        let sender = DetectionSender {
            cell: Arc::clone(&cell),
        };
        (
            Self {
                cell,
                boxes_out,
                set: TrackSet::new(cfg.max_dist, cfg.max_frames),
                quiet,
                on: false,
                differ_tick: Differ::new(),
                span: Span::default(),
            },
            sender,
        )
    }

    pub fn track_count(&self) -> usize {
        self.set.tracks().len()
    }
}

impl worker::Stage for TrackStage {
    fn waiting_to_run(&mut self) -> anyhow::Result<()> {
        if !self.on {
            self.span.begin();
            self.on = true;
        }
        Ok(())
    }

    fn running(&mut self) -> anyhow::Result<()> {
        if !self.on {
            return Ok(());
        }
        if let Some(batch) = self.cell.take() {
            self.differ_tick.begin();
            self.set.observe(&batch);
            if let Err(err) = self.boxes_out.try_replace(self.set.snapshot()) {
                debug!("encoder boxes cell busy: {err}");
            }
            self.differ_tick.end();
        }
        Ok(())
    }

    fn waiting_to_halt(&mut self) -> anyhow::Result<()> {
        if self.on {
            self.span.end();
            self.on = false;
            if !self.quiet {
                eprintln!("\nTracker Results...");
                eprintln!("  association time (us): {}", self.differ_tick);
                eprintln!("           live tracks: {}", self.set.tracks().len());
                eprintln!("       total test time: {:.6} sec", self.span.elapsed_secs());
                eprintln!();
            }
        }
        Ok(())
    }
}
