//! Audio pipeline behaviour seen from its edges: codec in, sink out.

use crate::helpers::{RecordingSink, ScriptedCodec, marker, test_config, wait_until};
use fae_device::audio::{
    AudioFrame, AudioPipeline, Pcm16Codec, PipelineEvent, PipelineObserver, PipelineParts,
    SoundBank,
};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const FRAME: usize = 160;

fn pcm_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

fn first_sample(frame: &AudioFrame) -> i16 {
    let bytes = frame.payload().expect("encoded frame");
    i16::from_le_bytes([bytes[0], bytes[1]])
}

fn build(
    codec: Arc<ScriptedCodec>,
    sink: Arc<RecordingSink>,
    sounds: SoundBank,
    observer: PipelineObserver,
) -> AudioPipeline {
    let config = test_config();
    AudioPipeline::new(
        &config.audio,
        &config.vad,
        PipelineParts {
            codec,
            encoder: Box::new(Pcm16Codec),
            decoder: Box::new(Pcm16Codec),
            wake_word: None,
            sink,
            sounds,
        },
        observer,
    )
    .unwrap()
}

fn recording_observer() -> (PipelineObserver, Arc<Mutex<Vec<PipelineEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let observer: PipelineObserver =
        Arc::new(move |event: PipelineEvent| sink.lock().unwrap().push(event));
    (observer, events)
}

#[test]
fn captured_frames_reach_uplink_in_order() {
    let codec = Arc::new(ScriptedCodec::with_script(vec![
        marker(1, FRAME),
        marker(2, FRAME),
        marker(3, FRAME),
    ]));
    let sink = Arc::new(RecordingSink::default());
    let (observer, _) = recording_observer();
    let mut pipeline = build(
        Arc::clone(&codec),
        Arc::clone(&sink),
        SoundBank::empty(16_000),
        observer,
    );

    pipeline.enable_voice_processing(true);
    pipeline.start().unwrap();
    assert!(wait_until(|| sink.frames.lock().unwrap().len() >= 3));
    pipeline.stop();

    let frames = sink.frames.lock().unwrap();
    let firsts: Vec<i16> = frames.iter().take(3).map(first_sample).collect();
    assert_eq!(firsts, vec![1, 2, 3]);
    let stamps: Vec<u32> = frames.iter().take(3).map(|f| f.timestamp).collect();
    assert_eq!(stamps, vec![0, 10, 20]);
}

#[test]
fn busy_uplink_stalls_capture_without_loss() {
    let codec = Arc::new(ScriptedCodec::default());
    let sink = Arc::new(RecordingSink::default());
    sink.busy.store(true, Ordering::SeqCst);
    let (observer, events) = recording_observer();
    let mut pipeline = build(
        Arc::clone(&codec),
        Arc::clone(&sink),
        SoundBank::empty(16_000),
        observer,
    );
    pipeline.enable_voice_processing(true);
    pipeline.start().unwrap();

    // Capture throughput drops to zero once every queue is full.
    assert!(wait_until(|| {
        let before = codec.reads.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(60));
        before > 0 && codec.reads.load(Ordering::SeqCst) == before
    }));
    let stalled_reads = codec.reads.load(Ordering::SeqCst);
    assert!(stalled_reads < 20, "capture kept running: {stalled_reads}");
    assert!(wait_until(|| {
        events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, PipelineEvent::Overrun { .. }))
    }));

    sink.busy.store(false, Ordering::SeqCst);
    assert!(wait_until(|| sink.frames.lock().unwrap().len() >= stalled_reads));
    pipeline.stop();

    let frames = sink.frames.lock().unwrap();
    for (i, frame) in frames.iter().take(stalled_reads).enumerate() {
        assert_eq!(frame.timestamp, i as u32 * 10, "frame {i} lost or reordered");
    }
}

#[test]
fn stop_is_bounded_while_stages_are_blocked() {
    let codec = Arc::new(ScriptedCodec::default());
    let sink = Arc::new(RecordingSink::default());
    sink.busy.store(true, Ordering::SeqCst);
    let (observer, _) = recording_observer();
    let mut pipeline = build(
        Arc::clone(&codec),
        Arc::clone(&sink),
        SoundBank::empty(16_000),
        observer,
    );
    pipeline.enable_voice_processing(true);
    pipeline.start().unwrap();
    assert!(wait_until(|| pipeline.active_workers() == 5));
    std::thread::sleep(Duration::from_millis(100));

    let started = Instant::now();
    pipeline.stop();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(pipeline.active_workers(), 0);
    assert!(!pipeline.is_running());
    assert!(!codec.input_on.load(Ordering::SeqCst));

    // Nothing touches the codec once stopped.
    let reads = codec.reads.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(codec.reads.load(Ordering::SeqCst), reads);

    pipeline.stop();
}

#[test]
fn play_sound_goes_ahead_of_conversation_audio() {
    let codec = Arc::new(ScriptedCodec::default());
    let mut sounds = SoundBank::empty(16_000);
    sounds.insert("alert", marker(5_000, FRAME * 2));
    let (observer, _) = recording_observer();
    let mut pipeline = build(
        Arc::clone(&codec),
        Arc::new(RecordingSink::default()),
        sounds,
        observer,
    );
    pipeline.start().unwrap();
    let inbound = pipeline.inbound_handle();

    pipeline.play_sound("alert").unwrap();
    for _ in 0..3 {
        assert!(inbound.push(AudioFrame::encoded(
            pcm_bytes(&marker(700, FRAME)),
            16_000,
            0
        )));
    }
    assert!(wait_until(|| codec.count_written(&marker(700, FRAME)) == 3));
    pipeline.stop();

    let written = codec.written.lock().unwrap();
    let first_alert = written
        .iter()
        .position(|f| f.as_slice() == marker(5_000, FRAME).as_slice())
        .expect("alert played");
    let first_speech = written
        .iter()
        .position(|f| f.as_slice() == marker(700, FRAME).as_slice())
        .expect("speech played");
    assert!(first_alert < first_speech);
    drop(written);
    assert_eq!(codec.count_written(&marker(5_000, FRAME)), 2);
}

#[test]
fn inbound_audio_refused_while_stopped() {
    let codec = Arc::new(ScriptedCodec::default());
    let (observer, _) = recording_observer();
    let pipeline = build(
        Arc::clone(&codec),
        Arc::new(RecordingSink::default()),
        SoundBank::empty(16_000),
        observer,
    );
    let inbound = pipeline.inbound_handle();
    assert!(!inbound.push(AudioFrame::encoded(pcm_bytes(&marker(9, FRAME)), 16_000, 0)));
    pipeline.reset_playback();
    assert!(codec.written.lock().unwrap().is_empty());
}

#[test]
fn downlink_after_reset_is_played_in_full() {
    let codec = Arc::new(ScriptedCodec::default());
    let (observer, _) = recording_observer();
    let mut pipeline = build(
        Arc::clone(&codec),
        Arc::new(RecordingSink::default()),
        SoundBank::empty(16_000),
        observer,
    );
    pipeline.start().unwrap();
    let inbound = pipeline.inbound_handle();

    // Reset while the decode stage sits idle waiting for audio.
    std::thread::sleep(Duration::from_millis(50));
    pipeline.reset_playback();
    std::thread::sleep(Duration::from_millis(50));

    for value in [11, 22] {
        assert!(inbound.push(AudioFrame::encoded(
            pcm_bytes(&marker(value, FRAME)),
            16_000,
            0
        )));
    }
    assert!(wait_until(|| {
        codec.count_written(&marker(11, FRAME)) == 1 && codec.count_written(&marker(22, FRAME)) == 1
    }));

    // Interrupt after a reply, then a fresh reply.
    pipeline.reset_playback();
    std::thread::sleep(Duration::from_millis(30));
    assert!(inbound.push(AudioFrame::encoded(
        pcm_bytes(&marker(33, FRAME)),
        16_000,
        0
    )));
    assert!(wait_until(|| codec.count_written(&marker(33, FRAME)) == 1));
    pipeline.stop();

    let written = codec.written.lock().unwrap();
    let order: Vec<usize> = [11, 22, 33]
        .iter()
        .map(|v| {
            written
                .iter()
                .position(|f| f.as_slice() == marker(*v, FRAME).as_slice())
                .unwrap()
        })
        .collect();
    assert!(order.windows(2).all(|w| w[0] < w[1]), "order {order:?}");
}

#[test]
fn reset_releases_a_receiver_stalled_on_a_full_downlink() {
    let codec = Arc::new(ScriptedCodec::default());
    codec.stall_output.store(true, Ordering::SeqCst);
    let (observer, _) = recording_observer();
    let mut pipeline = build(
        Arc::clone(&codec),
        Arc::new(RecordingSink::default()),
        SoundBank::empty(16_000),
        observer,
    );
    pipeline.start().unwrap();

    // More than the decode and playback queues hold together.
    let inbound = pipeline.inbound_handle();
    let receiver = std::thread::spawn(move || {
        for _ in 0..60 {
            inbound.push(AudioFrame::encoded(
                pcm_bytes(&marker(44, FRAME)),
                16_000,
                0,
            ));
        }
    });
    std::thread::sleep(Duration::from_millis(100));
    assert!(!receiver.is_finished(), "downlink should be stalled");

    pipeline.reset_playback();
    let started = Instant::now();
    while !receiver.is_finished() {
        assert!(
            started.elapsed() < Duration::from_secs(1),
            "receiver still blocked"
        );
        std::thread::sleep(Duration::from_millis(5));
    }
    receiver.join().unwrap();

    codec.stall_output.store(false, Ordering::SeqCst);
    let fresh = marker(55, FRAME);
    assert!(pipeline.inbound_handle().push(AudioFrame::encoded(
        pcm_bytes(&fresh),
        16_000,
        0
    )));
    assert!(wait_until(|| codec.count_written(&fresh) == 1));
    pipeline.stop();
}
