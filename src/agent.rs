use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;
use tokio_util::sync::CancellationToken;

use crate::config::AgentSettings;
use crate::connection::{ConnectionManager, ConnectionSettings};
use crate::dispatcher::Router;
use crate::job::{JobSettings, JobSupervisor};
use crate::session::AgentSession;
use crate::upload::{ArtifactUploader, UploadClient};

/// A fully wired agent.
///
/// `Agent` is responsible for:
/// - Building the shared [`AgentSession`] and the job supervisor around it.
/// - Holding the server connection open until shutdown.
/// - Stopping a running job before returning.
pub struct Agent {
    session: Arc<AgentSession>,
    supervisor: Arc<JobSupervisor>,
    connection: ConnectionManager,
}

impl Agent {
    /// Assembles an agent from settings. The api key must already be resolved.
    pub fn new(settings: &AgentSettings, api_key: String) -> Result<Self> {
        let uploader = UploadClient::new(
            &settings.server_url,
            api_key.clone(),
            settings.upload_timeout(),
        )
        .with_context(|| format!("Failed to create upload client for {}", settings.server_url))?;
        Ok(Self::with_uploader(settings, api_key, Arc::new(uploader)))
    }

    /// Like [`Agent::new`], publishing artifacts through `uploader`.
    pub fn with_uploader(
        settings: &AgentSettings,
        api_key: String,
        uploader: Arc<dyn ArtifactUploader>,
    ) -> Self {
        let session = Arc::new(AgentSession::new());
        let supervisor = Arc::new(JobSupervisor::new(
            Arc::clone(&session),
            uploader,
            JobSettings::from(settings),
        ));
        let router = Arc::new(Router::new(
            Arc::clone(&session),
            Arc::clone(&supervisor),
            settings.default_interpreter.clone(),
        ));
        let connection = ConnectionManager::new(
            ConnectionSettings::from_agent(settings, api_key),
            Arc::clone(&session),
            router,
        );
        Self {
            session,
            supervisor,
            connection,
        }
    }

    pub fn session(&self) -> &Arc<AgentSession> {
        &self.session
    }

    /// Runs until `shutdown` fires, then stops any job and waits for its report.
    ///
    /// With a live link the job is stopped before the socket closes, so its
    /// `training_failed` reaches the server. Otherwise it is stopped here.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Agent v{} starting", env!("CARGO_PKG_VERSION"));
        self.connection.run(&shutdown).await;
        self.supervisor.shutdown().await;
        info!("Agent stopped");
    }
}
