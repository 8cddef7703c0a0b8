//! Capture fan-out: monotonic frame ids and drop-don't-block backpressure.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use capture::synthetic::SyntheticCamera;
use capture::CaptureStage;
use config::CaptureCfg;
use testsupport::CollectingSink;
use worker::Stage as _;

fn small_cfg() -> CaptureCfg {
    CaptureCfg {
        device: 0,
        framerate: 500,
        width: 64,
        height: 48,
    }
}

#[test]
fn frame_ids_are_strictly_monotonic() {
    let detect = CollectingSink::new();
    let encode = CollectingSink::new();
    let (mut stage, stats) = CaptureStage::new(
        &small_cfg(),
        true,
        Box::new(SyntheticCamera::new()),
        Arc::clone(&detect) as Arc<dyn common_io::FrameSink>,
        Arc::clone(&encode) as Arc<dyn common_io::FrameSink>,
    );

    stage.waiting_to_run().unwrap();
    for _ in 0..10 {
        stage.running().unwrap();
    }
    stage.waiting_to_halt().unwrap();

    assert_eq!(stats.frames.load(Ordering::SeqCst), 10);
    let ids: Vec<u64> = detect.accepted().iter().map(|(id, _)| *id).collect();
    assert_eq!(ids.len(), 10);
    assert!(ids.windows(2).all(|w| w[1] > w[0]), "ids not monotonic: {ids:?}");
    assert_eq!(detect.accepted(), encode.accepted());

    // Every accepted frame carried full-size payloads.
    assert!(detect.accepted().iter().all(|(_, len)| *len == 64 * 48 * 3));
}

#[test]
fn busy_detector_costs_drops_not_blocking() {
    let detect = CollectingSink::new();
    let encode = CollectingSink::new();
    let (mut stage, stats) = CaptureStage::new(
        &small_cfg(),
        true,
        Box::new(SyntheticCamera::new()),
        Arc::clone(&detect) as Arc<dyn common_io::FrameSink>,
        Arc::clone(&encode) as Arc<dyn common_io::FrameSink>,
    );

    stage.waiting_to_run().unwrap();

    // First frame goes through, then the detector holds its slot.
    stage.running().unwrap();
    detect.set_refuse(true);

    let started = Instant::now();
    for _ in 0..9 {
        stage.running().unwrap();
    }
    // 10 frames at 500 fps pace: capture never blocked on the consumer.
    assert!(started.elapsed().as_secs() < 2);

    assert_eq!(detect.accepted_count(), 1);
    assert_eq!(stats.detect_drops.load(Ordering::SeqCst), 9);
    assert_eq!(stats.detect_sent.load(Ordering::SeqCst), 1);
    // The encoder kept receiving every frame.
    assert_eq!(encode.accepted_count(), 10);
    assert_eq!(stats.frames.load(Ordering::SeqCst), 10);

    stage.waiting_to_halt().unwrap();
}
