//! All five stages wired together through real workers: synthetic camera in,
//! Annex-B H.264 out on both the file and the RTSP path.

use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use common_io::FrameSink;
use config::{CaptureCfg, DetectCfg, EncodeCfg, RtspCfg, TrackCfg};

use capture::synthetic::SyntheticCamera;
use capture::CaptureStage;
use detect::DetectStage;
use encode::encoder::SoftH264Encoder;
use encode::EncodeStage;
use rtsp::RtspStage;
use testsupport::{one_box_round, RecordingHost, ScriptedInterpreter};
use track::TrackStage;
use worker::Worker;

#[test]
fn five_stage_pipeline_end_to_end() {
    let tmp = std::env::temp_dir();
    let labels_path = tmp.join(format!("pipeline-labels-{}.txt", std::process::id()));
    let output_path = tmp.join(format!("pipeline-out-{}.h264", std::process::id()));
    {
        let mut f = std::fs::File::create(&labels_path).unwrap();
        writeln!(f, "person\ncat\ncar").unwrap();
    }

    let (host, delivered) = RecordingHost::new(512 * 1024);
    let (rtsp_stage, nal_tx) = RtspStage::new(
        &RtspCfg {
            enable: true,
            unicast: "127.0.0.1".to_string(),
        },
        host,
    );

    let (encode_stage, encode_tx, boxes_cell) = EncodeStage::new(
        &EncodeCfg {
            bitrate: 1_000_000,
            output: Some(output_path.to_string_lossy().into_owned()),
        },
        64,
        48,
        true,
        Box::new(SoftH264Encoder::new()),
        Some(nal_tx),
    );

    let (track_stage, detections_tx) = TrackStage::new(&TrackCfg::default(), true, boxes_cell);

    // The "model" sees a person drifting right across the first rounds.
    let rounds = (0..10)
        .map(|i| {
            let left = 0.05 + 0.02 * i as f32;
            one_box_round(0.2, left, 0.8, left + 0.4, 0.0, 0.9)
        })
        .collect();
    let (detect_stage, detect_tx) = DetectStage::new(
        &DetectCfg {
            model: "unused.tflite".to_string(),
            labels: labels_path.to_string_lossy().into_owned(),
            threads: 1,
            threshold: 0.5,
        },
        64,
        48,
        100,
        true,
        Box::new(ScriptedInterpreter::new(rounds)),
        detections_tx,
    );

    let (capture_stage, capture_stats) = CaptureStage::new(
        &CaptureCfg {
            device: 0,
            framerate: 100,
            width: 64,
            height: 48,
        },
        true,
        Box::new(SyntheticCamera::new()),
        Arc::new(detect_tx) as Arc<dyn FrameSink>,
        Arc::new(encode_tx) as Arc<dyn FrameSink>,
    );

    let mut w_rtsp = Worker::new(200);
    let mut w_encode = Worker::new(200);
    let mut w_track = Worker::new(200);
    let mut w_detect = Worker::new(200);
    let mut w_capture = Worker::new(200);

    w_rtsp.start(rtsp_stage, "rtsp", 0).unwrap();
    w_encode.start(encode_stage, "encode", 0).unwrap();
    w_track.start(track_stage, "track", 0).unwrap();
    w_detect.start(detect_stage, "detect", 0).unwrap();
    w_capture.start(capture_stage, "capture", 0).unwrap();

    w_rtsp.run().unwrap();
    w_encode.run().unwrap();
    w_track.run().unwrap();
    w_detect.run().unwrap();
    w_capture.run().unwrap();

    std::thread::sleep(Duration::from_millis(500));

    w_capture.stop().unwrap();
    w_track.stop().unwrap();
    w_detect.stop().unwrap();
    w_encode.stop().unwrap();
    w_rtsp.stop().unwrap();

    // Frames moved through capture.
    let frames = capture_stats
        .frames
        .load(std::sync::atomic::Ordering::SeqCst);
    assert!(frames > 5, "only {frames} frames captured");

    // The file carries an Annex-B stream.
    let stream = std::fs::read(&output_path).unwrap();
    assert!(!stream.is_empty());
    let start_code = stream.starts_with(&[0, 0, 0, 1]) || stream.starts_with(&[0, 0, 1]);
    assert!(start_code, "output is not Annex-B");

    // The RTSP side saw the same bytes, split into deliveries.
    let delivered = delivered.lock();
    assert!(!delivered.is_empty(), "no NALs reached the session");
    assert!(delivered.iter().all(|p| !p.is_empty()));

    std::fs::remove_file(&labels_path).ok();
    std::fs::remove_file(&output_path).ok();
}
