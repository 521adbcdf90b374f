mod common;

use common::audio_validation::validate_wav_file;
use common::*;
use cutie_tts::config::{DecodeConfig, FallbackConfig};
use cutie_tts::model_loader::load_acoustic_model;
use cutie_tts::{SpeechEngine, SynthesisRequest, SynthesisWorker, WorkerEvent};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_worker_reports_ready_with_valid_file() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(
        SpeechEngine::builder()
            .with_local_voice(Arc::new(SineLocalVoice))
            .with_output_dir(dir.path())
            .build()
            .unwrap(),
    );

    let events = SynthesisWorker::new(engine, SynthesisRequest::new("Good morning"))
        .spawn()
        .wait()
        .await;

    let progress = events
        .iter()
        .filter(|e| matches!(e, WorkerEvent::Progress(_)))
        .count();
    assert!(progress >= 1);
    match events.last() {
        Some(WorkerEvent::Ready(path)) => {
            validate_wav_file(path);
        }
        other => panic!("expected ready event, got {other:?}"),
    }
}

#[tokio::test]
async fn test_worker_cancellation_reports_error() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(
        SpeechEngine::builder()
            .with_local_voice(Arc::new(SlowLocalVoice {
                delay: Duration::from_secs(30),
            }))
            .with_output_dir(dir.path())
            .build()
            .unwrap(),
    );

    let path = dir.path().join("never.wav");
    let mut handle =
        SynthesisWorker::new(engine, SynthesisRequest::new("Hello").with_output_path(&path)).spawn();

    // First progress message means the task is running.
    let first = handle.events.recv().await.unwrap();
    assert!(matches!(first, WorkerEvent::Progress(_)));
    handle.cancel();

    let events = handle.wait().await;
    assert_eq!(
        events.last(),
        Some(&WorkerEvent::Error("synthesis cancelled".to_string()))
    );
    assert!(!path.exists());
}

#[tokio::test]
async fn test_worker_total_failure_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(
        SpeechEngine::builder()
            .with_fallback_config(FallbackConfig {
                min_artifact_bytes: 10_000_000,
                ..Default::default()
            })
            .with_output_dir(dir.path())
            .build()
            .unwrap(),
    );

    let events = SynthesisWorker::new(engine, SynthesisRequest::new("Hello"))
        .spawn()
        .wait()
        .await;
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    let message = match events.last() {
        Some(WorkerEvent::Error(message)) => message.clone(),
        other => panic!("expected error event, got {other:?}"),
    };
    assert!(message.starts_with("all synthesis methods failed"));

    // The silence file named in the message exists even without an output path.
    let (_, path) = message.split_once("silence written to ").unwrap();
    let silence = std::path::Path::new(path);
    assert!(silence.starts_with(dir.path()));
    assert_eq!(validate_wav_file(silence).len(), 22050);
}

fn ready_path(events: &[WorkerEvent]) -> PathBuf {
    match events.last() {
        Some(WorkerEvent::Ready(path)) => path.clone(),
        other => panic!("expected ready event, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_workers_share_one_engine() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_config();
    let (model, _) =
        load_acoustic_model(&write_model(dir.path(), &config, 9, None), &candle_core::Device::Cpu).unwrap();
    let engine = Arc::new(
        SpeechEngine::builder()
            .with_model(Arc::new(model))
            .with_tokenizer(char_tokenizer(&config))
            .with_decode_config(DecodeConfig {
                stop_threshold: 1.0,
                ..Default::default()
            })
            .with_output_dir(dir.path())
            .build()
            .unwrap(),
    );

    let spawn = |name: &str, speaker: &str| {
        SynthesisWorker::new(
            Arc::clone(&engine),
            SynthesisRequest::new("Hello there")
                .with_speaker(speaker)
                .with_output_path(dir.path().join(name)),
        )
        .spawn()
    };
    let first = spawn("first.wav", "Paimon");
    let second = spawn("second.wav", "Paimon");
    let third = spawn("third.wav", "Venti");

    let (first, second, third) = tokio::join!(first.wait(), second.wait(), third.wait());
    let (first, second, third) = (ready_path(&first), ready_path(&second), ready_path(&third));

    let a = validate_wav_file(&first);
    let b = validate_wav_file(&second);
    let c = validate_wav_file(&third);
    // 11 tokens at 10 frames each, hop 256.
    assert_eq!(a.len(), 256 * 109);
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(Arc::strong_count(&engine), 1);
}
