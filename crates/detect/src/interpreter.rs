//! The detector model contract.
//!
//! Concrete interpreters (TFLite, EdgeTPU delegates, vendor NPUs) live
//! outside this crate and plug in through [`Interpreter`]; the pipeline only
//! needs the tensor geometry, an invoke call, and the three SSD-style output
//! tensors.

use std::path::Path;

/// Element type of the model's input tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorKind {
    Uint8,
    Float32,
}

#[derive(Debug, Clone, Copy)]
pub struct InputSpec {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub kind: TensorKind,
}

impl InputSpec {
    pub fn len(&self) -> usize {
        self.width as usize * self.height as usize * self.channels as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Input tensor contents, matching [`InputSpec::kind`].
#[derive(Debug, Clone)]
pub enum Tensor {
    Uint8(Vec<u8>),
    Float32(Vec<f32>),
}

/// The three output tensors of a detection model: box locations as
/// normalized `[top, left, bottom, right]`, class ids, and scores, all
/// indexed per result.
#[derive(Debug, Clone, Default)]
pub struct RawDetections {
    pub boxes: Vec<[f32; 4]>,
    pub classes: Vec<f32>,
    pub scores: Vec<f32>,
}

impl RawDetections {
    pub fn len(&self) -> usize {
        self.boxes.len().min(self.classes.len()).min(self.scores.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub trait Interpreter: Send {
    /// Builds the interpreter from a model file. Failing here is fatal for
    /// the stage; a missing model is a configuration error.
    fn load(&mut self, model: &Path, threads: u32) -> anyhow::Result<()>;

    fn input_spec(&self) -> InputSpec;

    fn invoke(&mut self, input: &Tensor) -> anyhow::Result<RawDetections>;
}

/// Placeholder backend used when no vendor interpreter is linked in: it
/// validates the model file and then reports no detections. The stage and
/// the rest of the pipeline behave exactly as with a real model.
pub struct NullBackend {
    spec: InputSpec,
}

impl NullBackend {
    pub fn new() -> Self {
        Self {
            spec: InputSpec {
                width: 300,
                height: 300,
                channels: 3,
                kind: TensorKind::Uint8,
            },
        }
    }
}

impl Default for NullBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter for NullBackend {
    fn load(&mut self, model: &Path, _threads: u32) -> anyhow::Result<()> {
        use anyhow::Context;
        std::fs::metadata(model)
            .with_context(|| format!("could not open model file {}", model.display()))?;
        Ok(())
    }

    fn input_spec(&self) -> InputSpec {
        self.spec
    }

    fn invoke(&mut self, _input: &Tensor) -> anyhow::Result<RawDetections> {
        Ok(RawDetections::default())
    }
}
