//! End-to-end tracker behavior over multi-frame detection sequences.

use common_io::{Detection, TargetKind};
use track::{Phase, TrackSet};

fn person(frame_id: u64, x: u32, y: u32) -> Detection {
    Detection {
        kind: TargetKind::Person,
        frame_id,
        x,
        y,
        w: 50,
        h: 80,
    }
}

#[test]
fn single_detection_births_single_active_track() {
    let mut set = TrackSet::new(200.0, 10);
    set.observe(&[person(1, 100, 100)]);

    let tracks = set.tracks();
    assert_eq!(tracks.len(), 1);
    let t = &tracks[0];
    assert_eq!(t.id, 0);
    assert_eq!(t.kind, TargetKind::Person);
    assert_eq!((t.x, t.y, t.w, t.h), (100, 100, 50, 80));
    assert_eq!(t.phase, Phase::Active);

    let boxes = set.snapshot();
    assert_eq!(boxes.len(), 1);
    assert_eq!(boxes[0].track_id, 0);
    assert_eq!((boxes[0].x, boxes[0].y), (100, 100));
}

#[test]
fn stationary_target_over_three_frames() {
    let mut set = TrackSet::new(200.0, 10);
    for frame in 1..=3 {
        set.observe(&[person(frame, 100, 100)]);
    }

    let tracks = set.tracks();
    assert_eq!(tracks.len(), 1);
    let (cx, cy) = tracks[0].center();
    let (vx, vy) = tracks[0].velocity();
    assert!((cx - 125.0).abs() < 0.5, "cx = {cx}");
    assert!((cy - 140.0).abs() < 0.5, "cy = {cy}");
    assert!(vx.abs() < 0.5, "vx = {vx}");
    assert!(vy.abs() < 0.5, "vy = {vy}");
}

#[test]
fn crossing_targets_keep_their_identities() {
    let mut set = TrackSet::new(200.0, 10);

    // Two people walk toward each other along y = 140; their center x
    // coordinates swap between frames 1 and 10.
    for frame in 1..=10u64 {
        let ax = 80 + 20 * frame as u32; // 100 -> 280
        let bx = 320 - 20 * frame as u32; // 300 -> 120
        set.observe(&[person(frame, ax - 25, 100), person(frame, bx - 25, 100)]);
        assert_eq!(set.tracks().len(), 2, "no births after frame {frame}");
    }

    let tracks = set.tracks();
    let a = tracks.iter().find(|t| t.id == 0).expect("track 0 alive");
    let b = tracks.iter().find(|t| t.id == 1).expect("track 1 alive");
    assert_eq!(a.last_seen, 10);
    assert_eq!(b.last_seen, 10);

    // Track 0 was born on the left and must have kept moving right.
    let (acx, _) = a.center();
    let (bcx, _) = b.center();
    assert!((acx - 280.0).abs() < 10.0, "track 0 drifted: {acx}");
    assert!((bcx - 120.0).abs() < 10.0, "track 1 drifted: {bcx}");
    let (avx, _) = a.velocity();
    let (bvx, _) = b.velocity();
    assert!(avx > 5.0, "track 0 velocity: {avx}");
    assert!(bvx < -5.0, "track 1 velocity: {bvx}");
}

#[test]
fn unseen_track_is_reaped_after_max_frames() {
    let max_frames = 3;
    let mut set = TrackSet::new(50.0, max_frames);
    set.observe(&[person(10, 100, 100)]);
    assert_eq!(set.tracks().len(), 1);

    // A different target far away keeps the ticks coming; the stale track
    // survives while frame_id - last_seen <= max_frames.
    for frame in 11..=13u64 {
        set.observe(&[person(frame, 500, 500)]);
        assert!(
            set.tracks().iter().any(|t| t.last_seen == 10),
            "track reaped early at frame {frame}"
        );
    }

    // Frame 14 is the first tick with frame_id > 10 + max_frames.
    set.observe(&[person(14, 500, 500)]);
    assert!(
        set.tracks().iter().all(|t| t.last_seen != 10),
        "stale track survived past its deadline"
    );
    assert_eq!(set.tracks().len(), 1);
}

#[test]
fn assignment_is_exclusive_under_clutter() {
    let mut set = TrackSet::new(200.0, 10);
    set.observe(&[
        person(1, 100, 100),
        person(1, 200, 100),
        person(1, 300, 100),
    ]);
    assert_eq!(set.tracks().len(), 3);

    // Three nearby detections the next frame: every track updates exactly
    // once and nothing births.
    set.observe(&[
        person(2, 105, 100),
        person(2, 205, 100),
        person(2, 305, 100),
    ]);
    assert_eq!(set.tracks().len(), 3);
    assert!(set.tracks().iter().all(|t| t.last_seen == 2));
}
