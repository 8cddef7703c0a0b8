//! Message types exchanged between pipeline stages, and the single-slot
//! mailbox they travel through.
//!
//! Every stage boundary is a drop boundary: a producer offers a message under
//! a timed lock and walks away if the consumer is busy or its slot is still
//! occupied. Nothing in the pipeline ever blocks the camera.

use std::time::Duration;

use parking_lot::Mutex;

/// RGB24 everywhere upstream of the encoder.
pub const FRAME_CHANNELS: usize = 3;

/// Lock-acquisition budget for inter-stage sends.
pub const SEND_TIMEOUT: Duration = Duration::from_millis(1);

/// Rounds up to the next multiple of 16, the block alignment the encoder
/// input geometry and the detector scratch buffers both use.
pub const fn ceil16(v: u32) -> u32 {
    (v + 15) & !15
}

/// Object class a detection or track is labeled with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TargetKind {
    #[default]
    Unknown,
    Person,
    Pet,
    Vehicle,
}

impl TargetKind {
    pub fn name(self) -> &'static str {
        match self {
            TargetKind::Unknown => "unknown",
            TargetKind::Person => "person",
            TargetKind::Pet => "pet",
            TargetKind::Vehicle => "vehicle",
        }
    }
}

/// A captured frame lent to a consumer for the duration of one send call.
/// The receiver must copy the bytes before releasing its mailbox lock; the
/// underlying buffer goes back to the camera driver right after fan-out.
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
    pub id: u64,
    pub width: u32,
    pub height: u32,
    pub data: &'a [u8],
}

impl<'a> FrameView<'a> {
    pub fn new(id: u64, width: u32, height: u32, data: &'a [u8]) -> Self {
        Self {
            id,
            width,
            height,
            data,
        }
    }
}

/// One detected object in pixel coordinates of the captured frame.
/// Immutable once emitted; a batch shares a single `frame_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detection {
    pub kind: TargetKind,
    pub frame_id: u64,
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl Detection {
    pub fn center(&self) -> (f32, f32) {
        (
            self.x as f32 + self.w as f32 / 2.0,
            self.y as f32 + self.h as f32 / 2.0,
        )
    }
}

/// Overlay record for one live track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackBox {
    pub kind: TargetKind,
    pub track_id: u64,
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

/// A consumer that accepts lent frames. Capture fans out through sink
/// handles, so producers never hold a concrete reference to the stage
/// behind them.
pub trait FrameSink: Send + Sync {
    fn try_send_frame(&self, frame: FrameView<'_>) -> Result<(), SendError>;
}

/// Why a send was refused. All variants are expected under load and handled
/// by dropping the message on the producer side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The receiving slot's lock could not be taken within the timeout.
    #[error("mailbox lock busy")]
    Busy,
    /// The slot still holds a message the consumer has not taken.
    #[error("mailbox full")]
    Full,
    /// The payload length does not match what the receiver was configured
    /// for; indicates a misconfiguration upstream.
    #[error("payload size mismatch: expected {expected}, got {got}")]
    SizeMismatch { expected: usize, got: usize },
}

/// Single-slot mailbox guarded by a timed mutex.
///
/// `try_put` refuses when the slot is occupied (the consumer is still
/// working); `try_replace` always overwrites, for latest-value cells where
/// stale messages are worthless. Consumers drain with `take`.
#[derive(Debug)]
pub struct Mailbox<T> {
    slot: Mutex<Option<T>>,
    timeout: Duration,
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self::with_timeout(SEND_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            slot: Mutex::new(None),
            timeout,
        }
    }

    pub fn try_put(&self, value: T) -> Result<(), SendError> {
        let mut slot = self.slot.try_lock_for(self.timeout).ok_or(SendError::Busy)?;
        if slot.is_some() {
            return Err(SendError::Full);
        }
        *slot = Some(value);
        Ok(())
    }

    pub fn try_replace(&self, value: T) -> Result<(), SendError> {
        let mut slot = self.slot.try_lock_for(self.timeout).ok_or(SendError::Busy)?;
        *slot = Some(value);
        Ok(())
    }

    /// Consumer side; blocks on the lock since the consumer owns the slot.
    pub fn take(&self) -> Option<T> {
        self.slot.lock().take()
    }

    pub fn is_empty(&self) -> bool {
        self.slot.lock().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn ceil16_alignment() {
        assert_eq!(ceil16(0), 0);
        assert_eq!(ceil16(1), 16);
        assert_eq!(ceil16(16), 16);
        assert_eq!(ceil16(17), 32);
        assert_eq!(ceil16(640), 640);
        assert_eq!(ceil16(481), 496);
    }

    #[test]
    fn detection_center() {
        let d = Detection {
            kind: TargetKind::Person,
            frame_id: 1,
            x: 100,
            y: 100,
            w: 50,
            h: 80,
        };
        assert_eq!(d.center(), (125.0, 140.0));
    }

    #[test]
    fn put_refuses_when_occupied() {
        let mb = Mailbox::new();
        mb.try_put(1u32).unwrap();
        assert_eq!(mb.try_put(2), Err(SendError::Full));
        assert_eq!(mb.take(), Some(1));
        assert!(mb.take().is_none());
        mb.try_put(3).unwrap();
        assert_eq!(mb.take(), Some(3));
    }

    #[test]
    fn replace_overwrites() {
        let mb = Mailbox::new();
        mb.try_replace(1u32).unwrap();
        mb.try_replace(2).unwrap();
        assert_eq!(mb.take(), Some(2));
    }

    #[test]
    fn put_reports_busy_under_contention() {
        let mb = Arc::new(Mailbox::with_timeout(Duration::from_micros(200)));
        let guard = mb.slot.lock();

        let mb2 = Arc::clone(&mb);
        let handle = thread::spawn(move || mb2.try_put(7u32));
        assert_eq!(handle.join().unwrap(), Err(SendError::Busy));
        drop(guard);

        mb.try_put(7).unwrap();
    }
}
