//! Test-pattern camera: a bright block drifting over a gray field, paced to
//! the configured frame rate. Lets the whole pipeline run without hardware.

use std::time::{Duration, Instant};

use common_io::ceil16;
use config::CaptureCfg;

use crate::{CameraFormat, CameraSource};

const BACKGROUND: u8 = 32;
const BLOCK: u8 = 220;
const BLOCK_SIZE: u32 = 40;

pub struct SyntheticCamera {
    width: u32,
    height: u32,
    framerate: u32,
    frame: Vec<u8>,
    ticks: u64,
    last: Option<Instant>,
}

impl SyntheticCamera {
    pub fn new() -> Self {
        Self {
            width: 0,
            height: 0,
            framerate: 0,
            frame: Vec::new(),
            ticks: 0,
            last: None,
        }
    }

    fn render(&mut self) {
        self.frame.fill(BACKGROUND);
        let size = BLOCK_SIZE.min(self.width).min(self.height);
        if size == 0 {
            return;
        }
        let span_x = self.width - size;
        let span_y = self.height - size;
        let x = if span_x == 0 {
            0
        } else {
            (self.ticks * 4 % u64::from(span_x)) as u32
        };
        let y = if span_y == 0 {
            0
        } else {
            (self.ticks * 2 % u64::from(span_y)) as u32
        };
        for row in y..y + size {
            let start = ((row * self.width + x) * 3) as usize;
            self.frame[start..start + (size * 3) as usize].fill(BLOCK);
        }
    }
}

impl Default for SyntheticCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraSource for SyntheticCamera {
    fn connect(&mut self, cfg: &CaptureCfg) -> anyhow::Result<CameraFormat> {
        anyhow::ensure!(cfg.framerate > 0, "framerate must be positive");
        self.width = cfg.frame_width();
        self.height = cfg.frame_height();
        self.framerate = cfg.framerate;
        // Padded to the 16-aligned length real camera drivers hand out; the
        // picture occupies the front, the tail is slack.
        self.frame = vec![0; (ceil16(self.width) * ceil16(self.height) * 3) as usize];
        self.ticks = 0;
        self.last = None;
        Ok(CameraFormat {
            width: self.width,
            height: self.height,
            framerate: self.framerate,
        })
    }

    fn next_frame(&mut self) -> anyhow::Result<Option<&[u8]>> {
        let interval = Duration::from_secs(1) / self.framerate;
        if let Some(last) = self.last {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        self.last = Some(Instant::now());
        self.render();
        self.ticks += 1;
        Ok(Some(&self.frame))
    }

    fn disconnect(&mut self) {
        self.frame = Vec::new();
        self.last = None;
    }
}
