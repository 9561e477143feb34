use std::path::Path;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::artifact;
use crate::error::{AdmissionError, JobError};
use crate::protocol::{OutboundEvent, TrainRequest};
use crate::session::{AgentSession, JobTicket};
use crate::snapshot::FileSnapshot;
use crate::upload::{self, ArtifactUploader};

use super::{Job, JobProcess, JobSettings, JobState};

/// Owns the lifecycle of the job process.
///
/// `start` admits a `train` request into the session's single job slot and
/// runs it on its own task, so the connection keeps reading frames (and can
/// see a `stop`) while the job streams output.
pub struct JobSupervisor {
    session: Arc<AgentSession>,
    uploader: Arc<dyn ArtifactUploader>,
    settings: JobSettings,
    tasks: TaskTracker,
}

impl JobSupervisor {
    pub fn new(
        session: Arc<AgentSession>,
        uploader: Arc<dyn ArtifactUploader>,
        settings: JobSettings,
    ) -> Self {
        Self {
            session,
            uploader,
            settings,
            tasks: TaskTracker::new(),
        }
    }

    /// Claims the job slot for `request`. Fails with `Busy` when a job runs.
    pub async fn admit(
        &self,
        request: &TrainRequest,
    ) -> Result<(Job, JobTicket, CancellationToken), AdmissionError> {
        let job = Job::from_request(request, &self.settings);
        let (ticket, cancel) = self.session.try_claim(job.clone()).await?;
        Ok((job, ticket, cancel))
    }

    /// Handles a `train` command end to end.
    ///
    /// Rejections are reported to the server here: `Busy` as an `error`
    /// event, a missing folder or script as `training_failed`. On success the
    /// job runs in the background and reports its own outcome.
    pub async fn start(&self, request: TrainRequest) -> Result<JobTicket, AdmissionError> {
        info!(
            "Training job {} received: folder {}",
            request.training_id,
            request.folder_path.display()
        );
        let (job, ticket, cancel) = match self.admit(&request).await {
            Ok(admitted) => admitted,
            Err(err) => {
                warn!("Rejected job {}: {err}", request.training_id);
                self.session
                    .send(OutboundEvent::Error {
                        training_id: Some(request.training_id.clone()),
                        message: err.to_string(),
                    })
                    .await;
                return Err(err);
            }
        };

        let job = match validate(job) {
            Ok(job) => job,
            Err(err) => {
                warn!("Job {} cannot run: {err}", request.training_id);
                self.session.release(ticket).await;
                self.session
                    .send(OutboundEvent::TrainingFailed {
                        training_id: request.training_id.clone(),
                        error: err.to_string(),
                    })
                    .await;
                return Err(err);
            }
        };

        let run = JobRun {
            session: Arc::clone(&self.session),
            uploader: Arc::clone(&self.uploader),
            settings: self.settings.clone(),
            job,
            ticket,
            cancel,
        };
        self.tasks.spawn(run.execute());
        Ok(ticket)
    }

    /// Stops the active job, if any, and frees the slot immediately.
    ///
    /// The job task sends SIGTERM at its next suspension point and escalates
    /// to a kill after the grace period. Returns `false` when nothing ran.
    pub async fn cancel(&self) -> bool {
        match self.session.take_active().await {
            Some(active) => {
                info!("Stopping job {}", active.job.training_id);
                active.cancel.cancel();
                true
            }
            None => {
                debug!("Stop requested with no active job");
                false
            }
        }
    }

    /// Stops the active job and waits for every job task to finish reporting.
    pub async fn shutdown(&self) {
        self.cancel().await;
        self.tasks.close();
        self.tasks.wait().await;
    }
}

/// Resolves the job folder and checks that the script exists inside it.
fn validate(mut job: Job) -> Result<Job, AdmissionError> {
    if !job.folder_path.is_dir() {
        return Err(AdmissionError::FolderNotFound(job.folder_path));
    }
    if let Ok(folder) = job.folder_path.canonicalize() {
        let script = job
            .script_path
            .strip_prefix(&job.folder_path)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| job.script_path.clone());
        job.script_path = folder.join(script);
        job.folder_path = folder;
    }
    if !job.script_path.is_file() {
        return Err(AdmissionError::ScriptNotFound(job.script_path));
    }
    Ok(job)
}

/// Everything one background job task needs.
struct JobRun {
    session: Arc<AgentSession>,
    uploader: Arc<dyn ArtifactUploader>,
    settings: JobSettings,
    job: Job,
    ticket: JobTicket,
    cancel: CancellationToken,
}

impl JobRun {
    async fn execute(self) {
        let training_id = self.job.training_id.clone();
        let before = capture(&self.job.folder_path).await;

        let outcome = if self.cancel.is_cancelled() {
            Err(JobError::Cancelled)
        } else {
            self.session.set_job_state(self.ticket, JobState::Running).await;
            self.session
                .send(OutboundEvent::TrainingStarted {
                    training_id: training_id.clone(),
                })
                .await;
            self.run_process().await
        };

        let (state, event) = match outcome {
            Ok(()) => {
                info!("Job {training_id} finished successfully");
                let model_path = self.publish_artifact(&before).await;
                (
                    JobState::Completed,
                    OutboundEvent::TrainingCompleted {
                        training_id: training_id.clone(),
                        model_path,
                    },
                )
            }
            Err(JobError::Cancelled) => {
                info!("Job {training_id} stopped");
                (
                    JobState::Cancelled,
                    OutboundEvent::TrainingFailed {
                        training_id: training_id.clone(),
                        error: JobError::Cancelled.to_string(),
                    },
                )
            }
            Err(err) => {
                error!("Job {training_id} failed: {err}");
                (
                    JobState::Failed,
                    OutboundEvent::TrainingFailed {
                        training_id: training_id.clone(),
                        error: err.to_string(),
                    },
                )
            }
        };

        // The slot is free by the time the server sees the result.
        self.session.set_job_state(self.ticket, state).await;
        self.session.release(self.ticket).await;
        self.session.send(event).await;
    }

    /// Spawns the job and forwards stdout until it exits or is cancelled.
    async fn run_process(&self) -> Result<(), JobError> {
        if self.cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        let model = upload::model_name(&self.job.training_id);
        let mut process = JobProcess::spawn(
            &self.job,
            model,
            &self.settings.env,
            self.settings.stderr_limit,
        )?;

        loop {
            let line = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                line = process.next_line() => Some(line),
            };
            let Some(line) = line else {
                return self.stop(&mut process).await;
            };
            let Some(line) = line? else {
                break;
            };
            let line = line.trim_end();
            if line.trim().is_empty() {
                continue;
            }
            debug!("[{}] {line}", self.job.training_id);
            self.session
                .send(OutboundEvent::TrainingOutput {
                    training_id: self.job.training_id.clone(),
                    output: line.to_string(),
                })
                .await;
        }

        let report = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            report = process.wait() => Some(report),
        };
        let Some(report) = report else {
            return self.stop(&mut process).await;
        };
        let report = report?;
        if report.success() {
            Ok(())
        } else {
            Err(JobError::Exited(report.failure_reason()))
        }
    }

    async fn stop(&self, process: &mut JobProcess) -> Result<(), JobError> {
        match process.terminate(self.settings.stop_grace).await {
            Ok(status) => debug!("Stopped job {} ({status})", self.job.training_id),
            Err(err) => warn!("Failed to stop job {}: {err}", self.job.training_id),
        }
        Err(JobError::Cancelled)
    }

    /// Detects the artifact the run produced and uploads it.
    ///
    /// Returns the reference reported as `model_path`: the server path on a
    /// successful upload, otherwise the artifact's path relative to the job
    /// folder. `None` when no artifact was found.
    async fn publish_artifact(&self, before: &FileSnapshot) -> Option<String> {
        let after = capture(&self.job.folder_path).await;
        let artifact = artifact::select(before, &after)?;
        let relative = artifact
            .strip_prefix(&self.job.folder_path)
            .unwrap_or(&artifact)
            .to_string_lossy()
            .replace('\\', "/");

        match self
            .uploader
            .upload(&self.job.training_id, &artifact, &relative)
            .await
        {
            Ok(server_path) => Some(server_path),
            Err(err) => {
                warn!("Artifact upload failed, reporting local path {relative}: {err}");
                Some(relative)
            }
        }
    }
}

/// Snapshots `folder` off the async worker threads.
async fn capture(folder: &Path) -> FileSnapshot {
    let folder = folder.to_path_buf();
    match tokio::task::spawn_blocking(move || FileSnapshot::capture(&folder)).await {
        Ok(snapshot) => snapshot,
        Err(err) => {
            warn!("Snapshot task failed: {err}");
            FileSnapshot::default()
        }
    }
}
