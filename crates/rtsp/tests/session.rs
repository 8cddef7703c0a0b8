//! The RTSP stage with a recording session host: queued NALs reach the
//! host's delivery callback, in order, respecting its size limit.

use std::time::{Duration, Instant};

use config::RtspCfg;
use rtsp::RtspStage;
use testsupport::RecordingHost;
use worker::Stage as _;

fn cfg() -> RtspCfg {
    RtspCfg {
        enable: true,
        unicast: "127.0.0.1".to_string(),
    }
}

fn wait_for<F: Fn() -> bool>(cond: F) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !cond() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn queued_nals_reach_the_session_in_order() {
    let (host, delivered) = RecordingHost::new(64 * 1024);
    let (mut stage, sender) = RtspStage::new(&cfg(), host);

    stage.waiting_to_run().unwrap();

    let payloads: Vec<Vec<u8>> = (0u8..5).map(|i| vec![i; 100 + usize::from(i)]).collect();
    for p in &payloads {
        sender.try_send(p).unwrap();
    }
    for _ in 0..20 {
        stage.running().unwrap();
        std::thread::sleep(Duration::from_millis(5));
    }
    wait_for(|| delivered.lock().len() == payloads.len());

    stage.waiting_to_halt().unwrap();
    assert_eq!(*delivered.lock(), payloads);
}

#[test]
fn oversized_payloads_arrive_in_pieces() {
    let (host, delivered) = RecordingHost::new(64);
    let (mut stage, sender) = RtspStage::new(&cfg(), host);
    stage.waiting_to_run().unwrap();

    let payload: Vec<u8> = (0..200u8).collect();
    sender.try_send(&payload).unwrap();
    for _ in 0..20 {
        stage.running().unwrap();
        std::thread::sleep(Duration::from_millis(5));
    }
    wait_for(|| delivered.lock().iter().map(Vec::len).sum::<usize>() >= payload.len());
    stage.waiting_to_halt().unwrap();

    let pieces = delivered.lock();
    assert!(pieces.len() >= 2, "expected the payload split across deliveries");
    assert!(pieces.iter().all(|p| p.len() <= 64));
    let stitched: Vec<u8> = pieces.iter().flatten().copied().collect();
    assert_eq!(stitched, payload);
}
