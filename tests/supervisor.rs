mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use trainer_agent::dispatcher::Router;
use trainer_agent::error::AdmissionError;
use trainer_agent::job::{JobSettings, JobSupervisor};
use trainer_agent::protocol::{OutboundEvent, TrainRequest};
use trainer_agent::session::AgentSession;
use trainer_agent::upload::{ArtifactUploader, UploadClient};

use common::{FakeUploader, capture_events, events_until_terminal};

fn supervisor(session: &Arc<AgentSession>, uploader: Arc<dyn ArtifactUploader>) -> JobSupervisor {
    let settings = JobSettings {
        stop_grace: Duration::from_secs(2),
        ..JobSettings::default()
    };
    JobSupervisor::new(Arc::clone(session), uploader, settings)
}

fn request(id: &str, folder: &Path) -> TrainRequest {
    TrainRequest {
        training_id: id.into(),
        folder_path: folder.to_path_buf(),
        script_name: Some("train.sh".into()),
        python_command: Some("sh".into()),
    }
}

fn write_script(folder: &Path, body: &str) {
    std::fs::write(folder.join("train.sh"), body).unwrap();
}

fn outputs(events: &[OutboundEvent]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|event| match event {
            OutboundEvent::TrainingOutput { output, .. } => Some(output.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn output_is_streamed_in_order() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "echo one\necho\necho two\necho three\n");
    let session = Arc::new(AgentSession::new());
    let mut rx = capture_events(&session).await;
    let jobs = supervisor(&session, FakeUploader::accepting("unused"));

    jobs.start(request("seq_1", dir.path())).await.unwrap();
    let events = events_until_terminal(&mut rx).await;

    assert_eq!(
        events.first(),
        Some(&OutboundEvent::TrainingStarted {
            training_id: "seq_1".into()
        })
    );
    assert_eq!(outputs(&events), ["one", "two", "three"]);
    assert_eq!(
        events.last(),
        Some(&OutboundEvent::TrainingCompleted {
            training_id: "seq_1".into(),
            model_path: None,
        })
    );
    jobs.shutdown().await;
}

#[tokio::test]
async fn failed_script_reports_stderr_and_frees_the_slot() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "echo epoch 1\necho 'ValueError: bad shape' >&2\nexit 1\n");
    let session = Arc::new(AgentSession::new());
    let mut rx = capture_events(&session).await;
    let jobs = supervisor(&session, FakeUploader::accepting("unused"));

    jobs.start(request("cnn_1", dir.path())).await.unwrap();
    let events = events_until_terminal(&mut rx).await;

    let failures: Vec<_> = events
        .iter()
        .filter(|event| matches!(event, OutboundEvent::TrainingFailed { .. }))
        .collect();
    assert_eq!(failures.len(), 1);
    let OutboundEvent::TrainingFailed { training_id, error } = failures[0] else {
        unreachable!();
    };
    assert_eq!(training_id, "cnn_1");
    assert!(error.contains("ValueError: bad shape"), "{error}");
    assert!(!session.is_busy().await);

    write_script(dir.path(), "exit 0\n");
    jobs.start(request("cnn_2", dir.path())).await.unwrap();
    let events = events_until_terminal(&mut rx).await;
    assert!(matches!(
        events.last(),
        Some(OutboundEvent::TrainingCompleted { training_id, .. }) if training_id == "cnn_2"
    ));
    jobs.shutdown().await;
}

#[tokio::test]
async fn exit_code_is_reported_when_stderr_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "exit 3\n");
    let session = Arc::new(AgentSession::new());
    let mut rx = capture_events(&session).await;
    let jobs = supervisor(&session, FakeUploader::accepting("unused"));

    jobs.start(request("quiet_1", dir.path())).await.unwrap();
    let events = events_until_terminal(&mut rx).await;
    assert_eq!(
        events.last(),
        Some(&OutboundEvent::TrainingFailed {
            training_id: "quiet_1".into(),
            error: "Training script exited with code 3".into(),
        })
    );
    jobs.shutdown().await;
}

#[tokio::test]
async fn second_train_is_rejected_while_busy() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "echo started\nsleep 30\n");
    let session = Arc::new(AgentSession::new());
    let mut rx = capture_events(&session).await;
    let jobs = supervisor(&session, FakeUploader::accepting("unused"));

    jobs.start(request("first_1", dir.path())).await.unwrap();
    match jobs.start(request("second_1", dir.path())).await {
        Err(AdmissionError::Busy { training_id }) => assert_eq!(training_id, "first_1"),
        other => panic!("expected busy, got {other:?}"),
    }
    assert_eq!(
        session.active_job().await.map(|job| job.training_id),
        Some("first_1".into())
    );

    assert!(jobs.cancel().await);
    let events = events_until_terminal(&mut rx).await;
    assert!(events.contains(&OutboundEvent::Error {
        training_id: Some("second_1".into()),
        message: "Already training a model (first_1)".into(),
    }));
    assert!(!events.iter().any(|event| matches!(
        event,
        OutboundEvent::TrainingStarted { training_id } if training_id == "second_1"
    )));
    jobs.shutdown().await;
}

#[tokio::test]
async fn missing_folder_or_script_fails_without_occupying_the_slot() {
    let dir = tempfile::tempdir().unwrap();
    let session = Arc::new(AgentSession::new());
    let mut rx = capture_events(&session).await;
    let jobs = supervisor(&session, FakeUploader::accepting("unused"));

    let missing = dir.path().join("missing");
    let err = jobs.start(request("lost_1", &missing)).await.unwrap_err();
    assert!(matches!(err, AdmissionError::FolderNotFound(_)));
    match rx.recv().await {
        Some(OutboundEvent::TrainingFailed { training_id, error }) => {
            assert_eq!(training_id, "lost_1");
            assert!(error.starts_with("Folder not found: "), "{error}");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(!session.is_busy().await);

    let err = jobs.start(request("lost_2", dir.path())).await.unwrap_err();
    assert!(matches!(err, AdmissionError::ScriptNotFound(_)));
    match rx.recv().await {
        Some(OutboundEvent::TrainingFailed { error, .. }) => {
            assert!(error.starts_with("Script not found: "), "{error}");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(!session.is_busy().await);
}

#[tokio::test]
async fn stop_terminates_the_job_and_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "echo ready\nwhile true; do sleep 0.1; done\n");
    let session = Arc::new(AgentSession::new());
    let mut rx = capture_events(&session).await;
    let jobs = supervisor(&session, FakeUploader::accepting("unused"));

    jobs.start(request("loop_1", dir.path())).await.unwrap();
    loop {
        match rx.recv().await {
            Some(OutboundEvent::TrainingOutput { output, .. }) if output == "ready" => break,
            Some(_) => continue,
            None => panic!("event channel closed"),
        }
    }

    assert!(jobs.cancel().await);
    assert!(!session.is_busy().await);
    assert!(!jobs.cancel().await);

    let events = events_until_terminal(&mut rx).await;
    assert_eq!(
        events.last(),
        Some(&OutboundEvent::TrainingFailed {
            training_id: "loop_1".into(),
            error: "Training stopped by server".into(),
        })
    );

    jobs.shutdown().await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn upload_failure_reports_the_local_artifact_path() {
    let dir = tempfile::tempdir().unwrap();
    write_script(
        dir.path(),
        "mkdir -p saved_models\nprintf weights > saved_models/model.pt\n",
    );
    let session = Arc::new(AgentSession::new());
    let mut rx = capture_events(&session).await;
    let uploader = FakeUploader::failing(500);
    let jobs = supervisor(&session, uploader.clone());

    jobs.start(request("mnist_1700000000", dir.path())).await.unwrap();
    let events = events_until_terminal(&mut rx).await;

    assert_eq!(
        events.last(),
        Some(&OutboundEvent::TrainingCompleted {
            training_id: "mnist_1700000000".into(),
            model_path: Some("saved_models/model.pt".into()),
        })
    );
    assert_eq!(
        *uploader.calls.lock().await,
        [("mnist_1700000000".to_string(), "saved_models/model.pt".to_string())]
    );
    jobs.shutdown().await;
}

#[tokio::test]
async fn uploaded_artifact_reports_the_server_path() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("old.pt"), "stale").unwrap();
    write_script(
        dir.path(),
        "mkdir -p outputs\nprintf x > outputs/random.pt\nprintf weights > final_model.h5\n",
    );
    let session = Arc::new(AgentSession::new());
    let mut rx = capture_events(&session).await;
    let uploader = FakeUploader::accepting("/srv/models/gan/final_model.h5");
    let jobs = supervisor(&session, uploader.clone());

    jobs.start(request("gan_42", dir.path())).await.unwrap();
    let events = events_until_terminal(&mut rx).await;

    assert_eq!(
        events.last(),
        Some(&OutboundEvent::TrainingCompleted {
            training_id: "gan_42".into(),
            model_path: Some("/srv/models/gan/final_model.h5".into()),
        })
    );
    assert_eq!(uploader.calls.lock().await[0].1, "final_model.h5");
    jobs.shutdown().await;
}

#[tokio::test]
async fn job_environment_names_the_model() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "echo \"$MODEL_NAME $PYTHONUNBUFFERED\"\n");
    let session = Arc::new(AgentSession::new());
    let mut rx = capture_events(&session).await;
    let jobs = supervisor(&session, FakeUploader::accepting("unused"));

    jobs.start(request("bert_99", dir.path())).await.unwrap();
    let events = events_until_terminal(&mut rx).await;
    assert_eq!(outputs(&events), ["bert 1"]);
    jobs.shutdown().await;
}

#[tokio::test]
async fn unanswered_upload_still_completes_and_frees_the_slot() {
    let (server, _listener) = common::silent_http().await;
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "printf weights > model.pt\n");
    let session = Arc::new(AgentSession::new());
    let mut rx = capture_events(&session).await;
    let uploader = UploadClient::new(&server, "key", Duration::from_millis(300)).unwrap();
    let jobs = supervisor(&session, Arc::new(uploader));

    jobs.start(request("hang_1", dir.path())).await.unwrap();
    let events = events_until_terminal(&mut rx).await;

    assert_eq!(
        events.last(),
        Some(&OutboundEvent::TrainingCompleted {
            training_id: "hang_1".into(),
            model_path: Some("model.pt".into()),
        })
    );
    assert!(!session.is_busy().await);
    write_script(dir.path(), "exit 0\n");
    jobs.start(request("hang_2", dir.path())).await.unwrap();
    jobs.shutdown().await;
}

#[tokio::test]
async fn undecodable_output_does_not_fail_the_job() {
    let dir = tempfile::tempdir().unwrap();
    write_script(
        dir.path(),
        "printf 'caf\\351\\n'\nprintf 'warn \\377\\n' >&2\necho epoch 1\nexit 0\n",
    );
    let session = Arc::new(AgentSession::new());
    let mut rx = capture_events(&session).await;
    let jobs = supervisor(&session, FakeUploader::accepting("unused"));

    jobs.start(request("latin_1", dir.path())).await.unwrap();
    let events = events_until_terminal(&mut rx).await;

    assert_eq!(outputs(&events), ["caf\u{fffd}", "epoch 1"]);
    assert_eq!(
        events.last(),
        Some(&OutboundEvent::TrainingCompleted {
            training_id: "latin_1".into(),
            model_path: None,
        })
    );
    jobs.shutdown().await;
}

#[tokio::test]
async fn train_frame_while_busy_is_answered_with_an_error() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "echo started\nsleep 30\n");
    let session = Arc::new(AgentSession::new());
    let mut rx = capture_events(&session).await;
    let jobs = Arc::new(supervisor(&session, FakeUploader::accepting("unused")));
    let router = Router::new(Arc::clone(&session), Arc::clone(&jobs), "sh");

    let frame = |id: &str| {
        serde_json::json!({
            "type": "train",
            "data": {
                "training_id": id,
                "folder_path": dir.path(),
                "script_name": "train.sh",
                "python_command": "sh",
            }
        })
        .to_string()
    };
    router.handle_frame(&frame("busy_1")).await;
    router.handle_frame(&frame("busy_2")).await;
    assert_eq!(
        session.active_job().await.map(|job| job.training_id),
        Some("busy_1".into())
    );

    assert!(jobs.cancel().await);
    let events = events_until_terminal(&mut rx).await;
    assert!(events.contains(&OutboundEvent::Error {
        training_id: Some("busy_2".into()),
        message: "Already training a model (busy_1)".into(),
    }));
    jobs.shutdown().await;
}
