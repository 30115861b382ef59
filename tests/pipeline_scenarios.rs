use std::time::{Duration, Instant};

use serde_json::json;

use sightline::detect::{BoundingBox, ObjectDetection};
use sightline::ingest::{Resolution, SyntheticCamera, SyntheticControl};
use sightline::overlay::{render, Dimensions, OverlayInput, OverlayShape};
use sightline::transport::{ChannelEvent, LoopbackConnector, LoopbackEndpoint};
use sightline::{
    BoundedHistory, ChannelState, Pipeline, PipelineConfig, PipelineEvent, SessionState,
    SourceEvent,
};

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

fn start_pipeline() -> (
    Pipeline<SyntheticCamera, LoopbackConnector>,
    SyntheticControl,
    LoopbackEndpoint,
) {
    let mut config = PipelineConfig::defaults().expect("default config");
    config.camera.ideal = Resolution {
        width: 96,
        height: 54,
    };
    config.channel.keepalive_interval = Duration::ZERO;
    let camera = SyntheticCamera::new();
    let control = camera.control();
    let endpoint = LoopbackEndpoint::new();
    let pipeline = Pipeline::new(config, camera, endpoint.connector());
    (pipeline, control, endpoint)
}

fn empty_result() -> serde_json::Value {
    json!({"kind": "result", "objects": [], "text": [], "logs": []})
}

/// Drive the pipeline in 50ms steps, answering each frame after `latency`.
/// Returns (frames sent, answers delivered, max frames in flight).
fn run_with_latency(latency: Duration, until: Duration) -> (usize, usize, usize) {
    let (mut pipeline, _control, endpoint) = start_pipeline();
    let t0 = Instant::now();
    pipeline.init(t0).expect("init");

    let mut answers_due: Vec<Instant> = Vec::new();
    let mut answered = 0;
    let mut max_in_flight = 0;
    let mut elapsed = Duration::ZERO;
    while elapsed < until {
        let now = t0 + elapsed;
        answers_due.retain(|due| {
            if *due <= now {
                endpoint.push_json(&empty_result());
                answered += 1;
                false
            } else {
                true
            }
        });

        let before = endpoint.sent_frames();
        pipeline.poll(now);
        let sent = endpoint.sent_frames();
        for _ in before..sent {
            answers_due.push(now + latency);
        }
        max_in_flight = max_in_flight.max(sent - answered);
        elapsed += ms(50);
    }
    (endpoint.sent_frames(), answered, max_in_flight)
}

#[test]
fn fast_answers_send_one_frame_per_tick() {
    // Ticks at 500, 1000, 1500; answers at 800, 1300, 1800.
    let (sent, answered, max_in_flight) = run_with_latency(ms(300), ms(1950));
    assert_eq!(sent, 3);
    assert_eq!(answered, 3);
    assert_eq!(max_in_flight, 1);
}

#[test]
fn slow_answers_skip_ticks_instead_of_queueing() {
    let (sent, _answered, max_in_flight) = run_with_latency(ms(1200), ms(4000));
    assert_eq!(max_in_flight, 1);
    assert!(sent < 7, "sent {sent} frames over 4s with 1.2s answers");
    assert!(sent >= 2);
}

#[test]
fn malformed_reply_does_not_stall_capture() {
    let (mut pipeline, _control, endpoint) = start_pipeline();
    let t0 = Instant::now();
    pipeline.init(t0).expect("init");
    pipeline.poll(t0 + ms(500));
    assert_eq!(endpoint.sent_frames(), 1);

    // Objects without a class cannot be parsed at all.
    endpoint.push_json(&json!({"kind": "result", "objects": [{"confidence": 50}]}));
    let mut answered = 1;
    let mut step = 600;
    while step <= 20_000 {
        pipeline.poll(t0 + ms(step));
        while answered < endpoint.sent_frames() {
            endpoint.push_json(&empty_result());
            answered += 1;
        }
        step += 500;
    }
    // One frame per 500ms tick; well below the answer timeout.
    assert!(endpoint.sent_frames() >= 35, "sent {}", endpoint.sent_frames());
    assert_eq!(pipeline.channel().state(), ChannelState::Open);
}

#[test]
fn object_without_bbox_keeps_rest_of_result() {
    let (mut pipeline, _control, endpoint) = start_pipeline();
    let t0 = Instant::now();
    pipeline.init(t0).expect("init");
    pipeline.poll(t0 + ms(500));

    endpoint.push_json(&json!({
        "kind": "result",
        "objects": [
            {"class": "cup", "confidence": 50},
            {"class": "dog", "confidence": 80, "bbox": {"x1": 4, "y1": 4, "x2": 20, "y2": 30}}
        ],
        "logs": [{"severity": "info", "text": "2 objects"}]
    }));
    pipeline.poll(t0 + ms(800));
    assert!(!pipeline.scheduler().is_processing());
    assert_eq!(pipeline.last_round_trip(), Some(ms(300)));
    let classes: Vec<&str> = pipeline
        .store()
        .objects()
        .iter()
        .map(|stamped| stamped.item.class.as_str())
        .collect();
    assert_eq!(classes, vec!["dog"]);
    assert_eq!(pipeline.overlay().shapes.len(), 1);

    pipeline.poll(t0 + ms(1000));
    assert_eq!(endpoint.sent_frames(), 2);
}

#[test]
fn abnormal_close_backs_off_linearly() {
    let (mut pipeline, _control, endpoint) = start_pipeline();
    let t0 = Instant::now();
    pipeline.init(t0).expect("init");
    pipeline.poll(t0);

    endpoint.refuse_connects(1);
    endpoint.close_from_server(1006, "");
    let events = pipeline.poll(t0 + ms(100));
    assert!(events.contains(&PipelineEvent::Channel(ChannelEvent::RetryScheduled {
        attempt: 1,
        delay: ms(3000),
    })));
    let retry = pipeline.channel().pending_retry().expect("first retry");
    assert_eq!(retry.due, t0 + ms(3100));

    let events = pipeline.poll(retry.due);
    assert!(events.contains(&PipelineEvent::Channel(ChannelEvent::RetryScheduled {
        attempt: 2,
        delay: ms(6000),
    })));
    let retry = pipeline.channel().pending_retry().expect("second retry");
    assert_eq!(retry.due, t0 + ms(9100));

    pipeline.poll(retry.due);
    assert_eq!(pipeline.channel().state(), ChannelState::Open);
    assert_eq!(pipeline.channel().attempts(), 0);
    assert_eq!(endpoint.connect_attempts(), 3);
}

#[test]
fn teardown_suppresses_camera_recovery_and_reconnect() {
    let (mut pipeline, control, endpoint) = start_pipeline();
    let t0 = Instant::now();
    pipeline.init(t0).expect("init");

    control.end_track();
    endpoint.close_from_server(1011, "going away");
    let events = pipeline.poll(t0 + ms(10));
    assert!(events
        .iter()
        .any(|event| matches!(event, PipelineEvent::Camera(SourceEvent::RecoveryScheduled { .. }))));
    assert_eq!(pipeline.channel().state(), ChannelState::Reconnecting);

    pipeline.teardown();
    for step in 1..=20 {
        assert!(pipeline.poll(t0 + ms(1000 * step)).is_empty());
    }
    assert_eq!(control.open_count(), 1);
    assert_eq!(endpoint.connect_attempts(), 1);
    assert_eq!(pipeline.camera_state(), SessionState::Idle);
}

#[test]
fn history_keeps_the_latest_fifty() {
    let mut history = BoundedHistory::new(50);
    history.extend(0..60);
    assert_eq!(history.len(), 50);
    let kept: Vec<i32> = history.iter().copied().collect();
    assert_eq!(kept, (10..60).collect::<Vec<_>>());
}

#[test]
fn overlay_scales_and_mirrors_into_display_space() {
    let objects = vec![ObjectDetection {
        class: "person".to_string(),
        confidence: 88.0,
        bbox: BoundingBox {
            x1: 100.0,
            y1: 50.0,
            x2: 200.0,
            y2: 150.0,
        },
        timestamp: 1_700_000_000_000,
    }];
    let scene = render(&OverlayInput {
        objects: &objects,
        text: &[],
        native: Dimensions::new(1280, 720),
        display: Dimensions::new(640, 360),
        flip_horizontal: false,
        mirror_display: true,
    });

    let OverlayShape::Box { rect, label } = &scene.shapes[0] else {
        panic!("expected a box, got {:?}", scene.shapes[0]);
    };
    assert_eq!(rect.left, 540.0);
    assert_eq!(rect.right, 590.0);
    assert_eq!(rect.top, 25.0);
    assert_eq!(rect.bottom, 75.0);
    assert!(label.text.starts_with("person"));
}
