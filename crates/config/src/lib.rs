use anyhow::Result;
use serde::Deserialize;

/// Whole-pipeline configuration. Defaults match the CLI defaults; a TOML
/// file can override any subset and CLI flags are applied on top by the
/// runner.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub quiet: bool,
    #[serde(default = "default_test_secs")]
    pub test_secs: u32,
    #[serde(default = "default_yield_us")]
    pub yield_time_us: u64,
    #[serde(default)]
    pub capture: CaptureCfg,
    #[serde(default)]
    pub detect: DetectCfg,
    #[serde(default)]
    pub track: TrackCfg,
    #[serde(default)]
    pub encode: EncodeCfg,
    #[serde(default)]
    pub rtsp: RtspCfg,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            quiet: false,
            test_secs: default_test_secs(),
            yield_time_us: default_yield_us(),
            capture: CaptureCfg::default(),
            detect: DetectCfg::default(),
            track: TrackCfg::default(),
            encode: EncodeCfg::default(),
            rtsp: RtspCfg::default(),
        }
    }
}

impl AppConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureCfg {
    pub device: u32,
    pub framerate: u32,
    /// Negative width requests a horizontal flip.
    pub width: i32,
    /// Negative height requests a vertical flip.
    pub height: i32,
}

impl CaptureCfg {
    pub fn frame_width(&self) -> u32 {
        self.width.unsigned_abs()
    }

    pub fn frame_height(&self) -> u32 {
        self.height.unsigned_abs()
    }

    pub fn hflip(&self) -> bool {
        self.width < 0
    }

    pub fn vflip(&self) -> bool {
        self.height < 0
    }
}

impl Default for CaptureCfg {
    fn default() -> Self {
        Self {
            device: 0,
            framerate: 20,
            width: 640,
            height: 480,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectCfg {
    pub model: String,
    pub labels: String,
    pub threads: u32,
    pub threshold: f32,
}

impl Default for DetectCfg {
    fn default() -> Self {
        Self {
            model: "./models/detect.tflite".to_string(),
            labels: "./models/labelmap.txt".to_string(),
            threads: 1,
            threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackCfg {
    /// Largest center distance (pixels) an assignment may span.
    #[serde(default = "default_max_dist")]
    pub max_dist: f32,
    /// Frames a track may go unseen before it is reaped.
    #[serde(default = "default_max_frames")]
    pub max_frames: u64,
}

impl Default for TrackCfg {
    fn default() -> Self {
        Self {
            max_dist: default_max_dist(),
            max_frames: default_max_frames(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EncodeCfg {
    /// Target rate in bytes per second, for encoders that do rate control.
    pub bitrate: u32,
    /// Annex-B output file; `-` writes to stdout, absent writes nothing.
    pub output: Option<String>,
}

impl Default for EncodeCfg {
    fn default() -> Self {
        Self {
            bitrate: 1_000_000,
            output: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RtspCfg {
    #[serde(default)]
    pub enable: bool,
    /// Unicast destination; empty selects a random SSM multicast address.
    #[serde(default)]
    pub unicast: String,
}

fn default_test_secs() -> u32 {
    30
}

fn default_yield_us() -> u64 {
    1000
}

fn default_max_dist() -> f32 {
    200.0
}

fn default_max_frames() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_cli_table() {
        let cfg = AppConfig::default();
        assert!(!cfg.quiet);
        assert_eq!(cfg.test_secs, 30);
        assert_eq!(cfg.yield_time_us, 1000);
        assert_eq!(cfg.capture.device, 0);
        assert_eq!(cfg.capture.framerate, 20);
        assert_eq!(cfg.capture.frame_width(), 640);
        assert_eq!(cfg.capture.frame_height(), 480);
        assert!(!cfg.capture.hflip());
        assert_eq!(cfg.detect.threshold, 0.5);
        assert_eq!(cfg.detect.threads, 1);
        assert_eq!(cfg.encode.bitrate, 1_000_000);
        assert!(cfg.encode.output.is_none());
        assert!(!cfg.rtsp.enable);
        assert!(cfg.rtsp.unicast.is_empty());
    }

    #[test]
    fn negative_dimensions_mean_flip() {
        let cfg = CaptureCfg {
            device: 0,
            framerate: 20,
            width: -640,
            height: -480,
        };
        assert!(cfg.hflip());
        assert!(cfg.vflip());
        assert_eq!(cfg.frame_width(), 640);
        assert_eq!(cfg.frame_height(), 480);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: AppConfig = toml::from_str(
            r#"
            quiet = true

            [capture]
            device = 2
            framerate = 30
            width = 1280
            height = -720

            [track]
            max_dist = 120.0
            "#,
        )
        .unwrap();
        assert!(cfg.quiet);
        assert_eq!(cfg.capture.device, 2);
        assert!(cfg.capture.vflip());
        assert_eq!(cfg.track.max_dist, 120.0);
        assert_eq!(cfg.track.max_frames, 10);
        assert_eq!(cfg.test_secs, 30);
        assert_eq!(cfg.detect.model, "./models/detect.tflite");
    }
}
