use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, trace};
use tokio::sync::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::error::AdmissionError;
use crate::job::{Job, JobState};
use crate::protocol::OutboundEvent;

/// 伺服器連線的生命週期。
///
/// 成功時一次前進一步；任何狀態都可能退回 `Disconnected`。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    /// 傳輸層已建立，但伺服器尚未確認握手。
    Connected,
    /// 伺服器已送出 `connected` 確認。
    Authenticated,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Authenticated => "authenticated",
        };
        f.write_str(label)
    }
}

/// 識別一次任務佔用槽位的憑證。
///
/// 結束的任務只能用自己的憑證釋放槽位，不會清掉之後才接受的任務。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobTicket(u64);

/// 佔用槽位的任務，以及用來停止它的控制代碼。
#[derive(Debug)]
pub struct ActiveJob {
    pub ticket: JobTicket,
    pub job: Job,
    pub cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct LinkStatus {
    state: ConnectionState,
    degraded: bool,
}

/// 一個執行中代理的所有可變狀態。
///
/// 以 `Arc` 在監聽迴圈與任務之間共用。任務槽位是唯一競爭的資源，
/// 接受任務是在鎖內完成的一次檢查並設定。
#[derive(Debug, Default)]
pub struct AgentSession {
    link: Mutex<LinkStatus>,
    active_job: Mutex<Option<ActiveJob>>,
    outbound: Mutex<Option<UnboundedSender<OutboundEvent>>>,
    next_ticket: AtomicU64,
}

impl AgentSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.link.lock().await.state
    }

    pub async fn set_connection_state(&self, state: ConnectionState) {
        let mut link = self.link.lock().await;
        if link.state != state {
            debug!("Connection state {} -> {}", link.state, state);
        }
        link.state = state;
        if state == ConnectionState::Disconnected {
            link.degraded = false;
        }
    }

    /// 目前連線從未收到握手確認時為 `true`。
    pub async fn is_degraded(&self) -> bool {
        self.link.lock().await.degraded
    }

    pub async fn mark_degraded(&self) {
        self.link.lock().await.degraded = true;
    }

    /// 將出站事件導向 `tx`，直到呼叫 [`detach_outbound`](Self::detach_outbound)。
    pub async fn attach_outbound(&self, tx: UnboundedSender<OutboundEvent>) {
        *self.outbound.lock().await = Some(tx);
    }

    pub async fn detach_outbound(&self) {
        self.outbound.lock().await.take();
    }

    /// 將一個事件排入送往伺服器的佇列。
    ///
    /// 沒有連線時回傳 `false` 並丟棄事件，不做重送緩衝。
    pub async fn send(&self, event: OutboundEvent) -> bool {
        let outbound = self.outbound.lock().await;
        match outbound.as_ref() {
            Some(tx) if !tx.is_closed() => {
                trace!("Queued {} event", event.kind());
                tx.send(event).is_ok()
            }
            _ => {
                debug!("Dropped {} event: not connected", event.kind());
                false
            }
        }
    }

    /// 為 `job` 佔用任務槽位；已被佔用時回傳 `Busy`。
    pub async fn try_claim(
        &self,
        job: Job,
    ) -> Result<(JobTicket, CancellationToken), AdmissionError> {
        let mut slot = self.active_job.lock().await;
        if let Some(active) = slot.as_ref() {
            return Err(AdmissionError::Busy {
                training_id: active.job.training_id.clone(),
            });
        }
        let ticket = JobTicket(self.next_ticket.fetch_add(1, Ordering::Relaxed));
        let cancel = CancellationToken::new();
        *slot = Some(ActiveJob {
            ticket,
            job,
            cancel: cancel.clone(),
        });
        Ok((ticket, cancel))
    }

    pub async fn set_job_state(&self, ticket: JobTicket, state: JobState) {
        let mut slot = self.active_job.lock().await;
        if let Some(active) = slot.as_mut().filter(|active| active.ticket == ticket) {
            active.job.state = state;
        }
    }

    /// 若槽位仍是 `ticket` 對應的任務，則釋放它。
    pub async fn release(&self, ticket: JobTicket) -> Option<Job> {
        let mut slot = self.active_job.lock().await;
        if slot.as_ref().is_some_and(|active| active.ticket == ticket) {
            slot.take().map(|active| active.job)
        } else {
            None
        }
    }

    /// 不論哪個任務佔用，直接清空槽位。
    pub async fn take_active(&self) -> Option<ActiveJob> {
        self.active_job.lock().await.take()
    }

    /// 槽位中任務的副本（若有）。
    pub async fn active_job(&self) -> Option<Job> {
        self.active_job
            .lock()
            .await
            .as_ref()
            .map(|active| active.job.clone())
    }

    pub async fn is_busy(&self) -> bool {
        self.active_job.lock().await.is_some()
    }
}
