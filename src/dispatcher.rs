use std::sync::Arc;

use log::{debug, info, warn};

use crate::job::JobSupervisor;
use crate::protocol::{InboundCommand, OutboundEvent, TrainRequest};
use crate::session::AgentSession;
use crate::system_info::SystemInfo;

/// What the agent does in response to one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Answer immediately with `event`.
    Reply(OutboundEvent),
    ReportSystemInfo,
    StartJob(TrainRequest),
    StopJob,
}

/// Maps a raw text frame to an action.
///
/// Malformed frames, unknown command types and late handshake
/// acknowledgements are logged and produce no action.
pub fn dispatch(raw: &str) -> Option<Action> {
    let command = match InboundCommand::decode(raw) {
        Ok(command) => command,
        Err(err) => {
            warn!("Ignoring frame: {err}");
            return None;
        }
    };
    match command {
        InboundCommand::Ping => Some(Action::Reply(OutboundEvent::Pong)),
        InboundCommand::SystemInfoRequest => Some(Action::ReportSystemInfo),
        InboundCommand::Train { data } => Some(Action::StartJob(data)),
        InboundCommand::Stop => Some(Action::StopJob),
        InboundCommand::Connected { message } => {
            debug!("Ignoring connected frame outside the handshake: {message}");
            None
        }
        InboundCommand::Unrecognized => {
            warn!("Ignoring unrecognized command: {raw}");
            None
        }
    }
}

/// Carries out dispatched actions against the session and the job supervisor.
pub struct Router {
    session: Arc<AgentSession>,
    supervisor: Arc<JobSupervisor>,
    interpreter: String,
}

impl Router {
    pub fn new(
        session: Arc<AgentSession>,
        supervisor: Arc<JobSupervisor>,
        interpreter: impl Into<String>,
    ) -> Self {
        Self {
            session,
            supervisor,
            interpreter: interpreter.into(),
        }
    }

    /// Stops the running job, if any, and waits until it has reported.
    pub async fn shutdown_jobs(&self) {
        self.supervisor.shutdown().await;
    }

    pub async fn handle_frame(&self, raw: &str) {
        if let Some(action) = dispatch(raw) {
            self.perform(action).await;
        }
    }

    /// Performs `action` without blocking the listen loop on long work.
    pub async fn perform(&self, action: Action) {
        match action {
            Action::Reply(event) => {
                self.session.send(event).await;
            }
            Action::ReportSystemInfo => {
                let session = Arc::clone(&self.session);
                let interpreter = self.interpreter.clone();
                tokio::spawn(async move {
                    let data = SystemInfo::collect(&interpreter).await;
                    session.send(OutboundEvent::SystemInfo { data }).await;
                });
            }
            Action::StartJob(request) => {
                if let Err(err) = self.supervisor.start(request).await {
                    debug!("Train command not started: {err}");
                }
            }
            Action::StopJob => {
                if !self.supervisor.cancel().await {
                    info!("Stop ignored: no job is running");
                }
            }
        }
    }
}
