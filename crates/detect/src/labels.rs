//! Label file parsing and the class vocabulary.
//!
//! The labels file is UTF-8, one entry per line, either a bare label name or
//! an `"id name"` pair. `"???"` placeholder entries are skipped entirely, so
//! class ids index the surviving labels in order.

use std::io::BufRead;
use std::path::Path;

use anyhow::Context;
use common_io::TargetKind;

/// Fixed vocabulary: which label names map to which overlay class.
fn kind_of(name: &str) -> TargetKind {
    match name {
        "person" => TargetKind::Person,
        "cat" | "dog" => TargetKind::Pet,
        "car" | "bus" | "truck" | "bicycle" | "motorcycle" => TargetKind::Vehicle,
        _ => TargetKind::Unknown,
    }
}

#[derive(Debug, Clone, Default)]
pub struct LabelMap {
    entries: Vec<(String, TargetKind)>,
}

impl LabelMap {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("could not open labels file {}", path.display()))?;
        Self::parse(std::io::BufReader::new(file))
    }

    pub fn parse(reader: impl BufRead) -> anyhow::Result<Self> {
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line.context("reading labels file")?;
            let line = line.trim();
            if line.is_empty() || line == "???" {
                continue;
            }
            // "id name" pairs keep only the name; the position in this list
            // is what the model's class ids index.
            let name = match line.split_once(' ') {
                Some((id, rest)) if id.chars().all(|c| c.is_ascii_digit()) => rest.trim(),
                _ => line,
            };
            if name == "???" {
                continue;
            }
            entries.push((name.to_string(), kind_of(name)));
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, class_id: usize) -> Option<(&str, TargetKind)> {
        self.entries
            .get(class_id)
            .map(|(name, kind)| (name.as_str(), *kind))
    }
}
