//! V4L2 camera source.
//!
//! Uses memory-mapped streaming I/O with [`FRAMEBUF_NUM`](crate::FRAMEBUF_NUM)
//! driver buffers. The device and its stream are tied together in a
//! self-referential holder; `next_frame` polls the device fd so a dead
//! camera surfaces as a timeout instead of a hung thread.

use std::os::fd::RawFd;

use anyhow::Context as _;
use config::CaptureCfg;
use ouroboros::self_referencing;
use tracing::{debug, warn};
use v4l::video::Capture;

use crate::{CameraFormat, CameraSource, CAMERA_WAIT, FRAMEBUF_NUM};

const V4L2_CID_HFLIP: u32 = 0x0098_0914;
const V4L2_CID_VFLIP: u32 = 0x0098_0915;

/// Pixel format preference order; the first one the driver offers wins.
const PREFERRED_FOURCC: &[&[u8; 4]] = &[b"RGB3"];

#[self_referencing]
struct CameraState {
    device: v4l::Device,
    #[borrows(device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this>,
}

pub struct V4lCamera {
    state: Option<CameraState>,
    fd: RawFd,
}

impl V4lCamera {
    pub fn new() -> Self {
        Self { state: None, fd: -1 }
    }
}

impl Default for V4lCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraSource for V4lCamera {
    fn connect(&mut self, cfg: &CaptureCfg) -> anyhow::Result<CameraFormat> {
        use v4l::buffer::Type;

        let device = v4l::Device::new(cfg.device as usize)
            .with_context(|| format!("open video device /dev/video{}", cfg.device))?;

        // Pick the first supported pixel format from the preference list.
        let offered = device.enum_formats().context("enumerate pixel formats")?;
        let fourcc = PREFERRED_FOURCC
            .iter()
            .map(|f| v4l::FourCC::new(f))
            .find(|want| offered.iter().any(|desc| desc.fourcc == *want))
            .context("no supported pixel format found")?;

        let format = v4l::Format::new(cfg.frame_width(), cfg.frame_height(), fourcc);
        let actual = device.set_format(&format).context("set pixel format")?;
        anyhow::ensure!(
            actual.fourcc == fourcc,
            "driver refused pixel format {fourcc}"
        );

        let params = v4l::video::capture::Parameters::with_fps(cfg.framerate);
        if let Err(err) = device.set_params(&params) {
            warn!("failed to set frame rate on /dev/video{}: {err}", cfg.device);
        }

        for (id, on) in [(V4L2_CID_HFLIP, cfg.hflip()), (V4L2_CID_VFLIP, cfg.vflip())] {
            let ctrl = v4l::control::Control {
                id,
                value: v4l::control::Value::Boolean(on),
            };
            if let Err(err) = device.set_control(ctrl) {
                warn!("failed to set flip control {id:#x}: {err}");
            }
        }

        self.fd = device.handle().fd();
        let state = CameraStateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, FRAMEBUF_NUM)
                    .map_err(|err| anyhow::Error::new(err).context("map camera buffers"))
            },
        }
        .try_build()?;
        self.state = Some(state);

        Ok(CameraFormat {
            width: actual.width,
            height: actual.height,
            framerate: cfg.framerate,
        })
    }

    fn next_frame(&mut self) -> anyhow::Result<Option<&[u8]>> {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, CAMERA_WAIT.as_millis() as i32) };
        if rc == 0 {
            return Ok(None);
        }
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                debug!("camera poll interrupted");
                return Ok(None);
            }
            return Err(err).context("waiting for camera frame");
        }

        let state = self.state.as_mut().context("camera not connected")?;
        let (buf, meta) = state
            .with_stream_mut(|stream| {
                use v4l::io::traits::CaptureStream;
                stream.next()
            })
            .context("dequeue camera buffer")?;
        let used = meta.bytesused as usize;
        if used == 0 || used > buf.len() {
            return Ok(Some(buf));
        }
        Ok(Some(&buf[..used]))
    }

    fn disconnect(&mut self) {
        // Dropping the stream turns streaming off and unmaps the buffers;
        // dropping the device closes the fd.
        self.state = None;
        self.fd = -1;
    }
}
