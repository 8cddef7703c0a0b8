//! The H.264 encoder seam.
//!
//! Hardware encoders (OMX and friends) implement [`VideoEncoder`] in their
//! own adapter crates; the in-tree implementation is the pure-software
//! `less-avc` encoder, lossless intra-only, which makes the pipeline produce
//! a real Annex-B stream anywhere.

use less_avc::ycbcr_image::{DataPlane, Planes, YCbCrImage};

use crate::yuv::YuvFrame;

pub trait VideoEncoder: Send {
    /// Encodes one frame and returns a single Annex-B payload. The first
    /// call prepends the codec headers (SPS/PPS) to the first picture. An
    /// empty return means the encoder buffered the frame.
    fn encode(&mut self, frame: &YuvFrame) -> anyhow::Result<Vec<u8>>;

    /// Drains anything the encoder still holds.
    fn finish(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Software H.264 encoder. Rate parameters do not apply: the output is
/// lossless, one IDR access unit per input frame.
#[derive(Default)]
pub struct SoftH264Encoder {
    inner: Option<less_avc::LessEncoder>,
}

impl SoftH264Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn image<'a>(frame: &'a YuvFrame) -> YCbCrImage<'a> {
        let y = DataPlane {
            data: frame.y_plane(),
            stride: frame.y_stride(),
            bit_depth: less_avc::BitDepth::Depth8,
        };
        let u = DataPlane {
            data: frame.u_plane(),
            stride: frame.chroma_stride(),
            bit_depth: less_avc::BitDepth::Depth8,
        };
        let v = DataPlane {
            data: frame.v_plane(),
            stride: frame.chroma_stride(),
            bit_depth: less_avc::BitDepth::Depth8,
        };
        YCbCrImage {
            planes: Planes::YCbCr((y, u, v)),
            width: frame.width(),
            height: frame.height(),
        }
    }
}

impl VideoEncoder for SoftH264Encoder {
    fn encode(&mut self, frame: &YuvFrame) -> anyhow::Result<Vec<u8>> {
        let image = Self::image(frame);
        let (payload, encoder) = match self.inner.take() {
            None => {
                let (nal_units, encoder) = less_avc::LessEncoder::new(&image)?;
                let payload: Vec<u8> = nal_units
                    .into_iter()
                    .flat_map(|nal| nal.to_annex_b_data())
                    .collect();
                (payload, encoder)
            }
            Some(mut encoder) => {
                let nal = encoder.encode(&image)?;
                (nal.to_annex_b_data(), encoder)
            }
        };
        self.inner = Some(encoder);
        Ok(payload)
    }
}
