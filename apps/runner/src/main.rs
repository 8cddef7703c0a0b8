//! trackcam: capture → detect → track → encode → stream.
//!
//! Builds the five pipeline stages, wires their mailboxes, and drives the
//! shared worker lifecycle: start everything into `Paused`, run the stages
//! consumer-first, then tear down in the fixed order capture → track →
//! detect → encode → rtsp on timeout, SIGINT, or stage failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use capture::synthetic::SyntheticCamera;
use capture::{CameraSource, CaptureStage};
use common_io::FrameSink;
use config::AppConfig;
use detect::interpreter::NullBackend;
use detect::DetectStage;
use encode::encoder::SoftH264Encoder;
use encode::EncodeStage;
use rtsp::{DrainHost, RtspStage};
use track::TrackStage;
use worker::{State, Worker};

#[derive(Parser, Debug)]
#[command(
    name = "trackcam",
    about = "Real-time camera object tracker with H.264 output",
    disable_help_flag = true
)]
struct Args {
    /// Suppress the per-stage reports printed at shutdown.
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Enable the RTSP server.
    #[arg(short = 'r', long)]
    rtsp: bool,

    /// RTSP unicast address; multicast is chosen when absent.
    #[arg(short = 'u', long, value_name = "ADDR")]
    unicast: Option<String>,

    /// Test duration in seconds; 0 runs until SIGINT.
    #[arg(short = 't', long, value_name = "SEC")]
    testtime: Option<u32>,

    /// Camera index (/dev/videoN).
    #[arg(short = 'd', long, value_name = "N")]
    device: Option<u32>,

    /// Capture frame rate.
    #[arg(short = 'f', long, value_name = "FPS")]
    framerate: Option<u32>,

    /// Capture width; negative flips horizontally.
    #[arg(short = 'w', long, value_name = "W", allow_hyphen_values = true)]
    width: Option<i32>,

    /// Capture height; negative flips vertically.
    #[arg(short = 'h', long, value_name = "H", allow_hyphen_values = true)]
    height: Option<i32>,

    /// Encoder bitrate in bytes per second.
    #[arg(short = 'b', long, value_name = "BPS")]
    bitrate: Option<u32>,

    /// Worker yield time in microseconds.
    #[arg(short = 'y', long, value_name = "USEC")]
    yield_time: Option<u64>,

    /// Detector threads.
    #[arg(short = 'e', long, value_name = "N")]
    threads: Option<u32>,

    /// Detection score threshold.
    #[arg(short = 's', long, value_name = "THRESH")]
    threshold: Option<f32>,

    /// Model file.
    #[arg(short = 'm', long, value_name = "PATH")]
    model: Option<String>,

    /// Labels file.
    #[arg(short = 'l', long, value_name = "PATH")]
    labels: Option<String>,

    /// Optional TOML configuration file; flags override its values.
    #[arg(long, value_name = "PATH")]
    config: Option<String>,

    /// Use the synthetic test-pattern camera instead of a real device.
    #[arg(long)]
    synthetic: bool,

    /// Output H.264 file; defaults to stdout unless the test time is 0.
    #[arg(value_name = "OUTPUT")]
    output: Option<String>,

    #[arg(long, action = clap::ArgAction::Help, help = "Print help")]
    help: Option<bool>,
}

fn apply_args(cfg: &mut AppConfig, args: &Args) {
    cfg.quiet |= args.quiet;
    cfg.rtsp.enable |= args.rtsp;
    if let Some(u) = &args.unicast {
        cfg.rtsp.unicast = u.clone();
    }
    if let Some(t) = args.testtime {
        cfg.test_secs = t;
    }
    if let Some(d) = args.device {
        cfg.capture.device = d;
    }
    if let Some(f) = args.framerate {
        cfg.capture.framerate = f;
    }
    if let Some(w) = args.width {
        cfg.capture.width = w;
    }
    if let Some(h) = args.height {
        cfg.capture.height = h;
    }
    if let Some(b) = args.bitrate {
        cfg.encode.bitrate = b;
    }
    if let Some(y) = args.yield_time {
        cfg.yield_time_us = y;
    }
    if let Some(e) = args.threads {
        cfg.detect.threads = e;
    }
    if let Some(s) = args.threshold {
        cfg.detect.threshold = s;
    }
    if let Some(m) = &args.model {
        cfg.detect.model = m.clone();
    }
    if let Some(l) = &args.labels {
        cfg.detect.labels = l.clone();
    }
    if let Some(out) = &args.output {
        cfg.encode.output = Some(out.clone());
    } else if cfg.encode.output.is_none() && cfg.test_secs > 0 {
        cfg.encode.output = Some("-".to_string());
    }
}

#[cfg(target_os = "linux")]
fn open_camera(synthetic: bool) -> Box<dyn CameraSource> {
    if synthetic {
        Box::new(SyntheticCamera::new())
    } else {
        Box::new(capture::v4l2::V4lCamera::new())
    }
}

#[cfg(not(target_os = "linux"))]
fn open_camera(_synthetic: bool) -> Box<dyn CameraSource> {
    Box::new(SyntheticCamera::new())
}

fn run() -> Result<i32> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let mut cfg = match &args.config {
        Some(path) => AppConfig::from_file(path)
            .with_context(|| format!("loading configuration from {path}"))?,
        None => AppConfig::default(),
    };
    apply_args(&mut cfg, &args);

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let flag = Arc::clone(&interrupted);
        ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
            .context("installing signal handler")?;
    }

    let width = cfg.capture.frame_width();
    let height = cfg.capture.frame_height();
    let quiet = cfg.quiet;

    // Build back-to-front so every producer gets its consumer's handle.
    let (rtsp_stage, nal_tx) = if cfg.rtsp.enable {
        let (stage, tx) = RtspStage::new(&cfg.rtsp, DrainHost::new());
        info!("rtsp destination: {:?}", stage.destination());
        (Some(stage), Some(tx))
    } else {
        (None, None)
    };

    let (encode_stage, encode_tx, boxes_cell) = EncodeStage::new(
        &cfg.encode,
        width,
        height,
        quiet,
        Box::new(SoftH264Encoder::new()),
        nal_tx,
    );

    let (track_stage, detections_tx) = TrackStage::new(&cfg.track, quiet, boxes_cell);

    info!("no vendor interpreter linked; detector runs the null backend");
    let (detect_stage, detect_tx) = DetectStage::new(
        &cfg.detect,
        width,
        height,
        cfg.yield_time_us,
        quiet,
        Box::new(NullBackend::new()),
        detections_tx,
    );

    let (capture_stage, _capture_stats) = CaptureStage::new(
        &cfg.capture,
        quiet,
        open_camera(args.synthetic),
        Arc::new(detect_tx) as Arc<dyn FrameSink>,
        Arc::new(encode_tx) as Arc<dyn FrameSink>,
    );

    let yield_us = cfg.yield_time_us;
    let mut w_rtsp = Worker::new(yield_us);
    let mut w_encode = Worker::new(yield_us);
    let mut w_track = Worker::new(yield_us);
    let mut w_detect = Worker::new(yield_us);
    let mut w_capture = Worker::new(yield_us);

    // Consumers first, capture last.
    if let Some(stage) = rtsp_stage {
        w_rtsp.start(stage, "rtsp", 50)?;
    }
    w_encode.start(encode_stage, "encode", 50)?;
    w_track.start(track_stage, "track", 50)?;
    w_detect.start(detect_stage, "detect", 50)?;
    w_capture.start(capture_stage, "capture", 50)?;

    if cfg.rtsp.enable {
        w_rtsp.run()?;
    }
    w_encode.run()?;
    w_track.run()?;
    w_detect.run()?;
    w_capture.run()?;

    let deadline = (cfg.test_secs > 0).then(|| Instant::now() + Duration::from_secs(u64::from(cfg.test_secs)));
    loop {
        if interrupted.load(Ordering::SeqCst) {
            info!("interrupted, shutting down");
            break;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        let failed = [&w_capture, &w_detect, &w_track, &w_encode]
            .iter()
            .any(|w| w.state() == State::Stopped);
        if failed {
            warn!("a pipeline stage stopped unexpectedly, unwinding");
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    // Fixed teardown order: upstream producers quiesce before their
    // consumers drain.
    w_capture.stop().ok();
    w_track.stop().ok();
    w_detect.stop().ok();
    w_encode.stop().ok();
    w_rtsp.stop().ok();

    Ok(if interrupted.load(Ordering::SeqCst) { 1 } else { 0 })
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("trackcam: {err:#}");
            1
        }
    };
    std::process::exit(code);
}
