use std::collections::BTreeMap;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use log::{debug, warn};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::error::JobError;

use super::Job;

/// 行程結束後等待 stderr 讀取工作的時間。
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// 執行中的任務行程，stdout 逐行提供。
///
/// stderr 由獨立的工作持續讀取，只保留尾段供失敗回報使用。
/// 行程仍在執行時若此物件被釋放，行程會被終止。
pub struct JobProcess {
    child: Child,
    stdout: BufReader<ChildStdout>,
    line: Vec<u8>,
    stderr: JoinHandle<String>,
    label: String,
}

/// 任務行程的結束方式。
#[derive(Debug)]
pub struct ExitReport {
    pub status: ExitStatus,
    /// 行程寫入 stderr 內容的尾段。
    pub stderr: String,
}

impl ExitReport {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// 回報給伺服器的失敗訊息：stderr 尾段；若沒有輸出則為結束狀態。
    pub fn failure_reason(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            match self.status.code() {
                Some(code) => format!("Training script exited with code {code}"),
                None => format!("Training script terminated ({})", self.status),
            }
        } else {
            stderr.to_string()
        }
    }
}

impl JobProcess {
    /// 以任務資料夾為工作目錄啟動 `job`。
    ///
    /// 行程繼承代理的環境變數，加上 `extra_env` 以及訓練腳本慣用的
    /// `PYTHONUNBUFFERED`、`MODEL_OUTPUT_DIR` 與 `MODEL_NAME`。
    pub fn spawn(
        job: &Job,
        model_name: &str,
        extra_env: &BTreeMap<String, String>,
        stderr_limit: usize,
    ) -> Result<Self, JobError> {
        let label = job
            .script_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| job.training_id.clone());

        let mut command = Command::new(&job.interpreter_command);
        command
            .arg(&job.script_path)
            .current_dir(&job.folder_path)
            .env("PYTHONUNBUFFERED", "1")
            .env("MODEL_OUTPUT_DIR", job.folder_path.join("saved_models"))
            .env("MODEL_NAME", model_name)
            .envs(extra_env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| JobError::Spawn {
            program: job.interpreter_command.clone(),
            source,
        })?;
        debug!(
            "Started {} {} (pid {:?})",
            job.interpreter_command,
            job.script_path.display(),
            child.id()
        );

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| JobError::Io(std::io::Error::other("job stdout pipe missing")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| JobError::Io(std::io::Error::other("job stderr pipe missing")))?;

        Ok(Self {
            child,
            stdout: BufReader::new(stdout),
            line: Vec::new(),
            stderr: tokio::spawn(collect_stderr(stderr, label.clone(), stderr_limit)),
            label,
        })
    }

    /// 下一行 stdout；行程關閉 stdout 後回傳 `None`。
    ///
    /// 非 UTF-8 的位元組會被替換，不視為錯誤。
    pub async fn next_line(&mut self) -> Result<Option<String>, JobError> {
        Ok(read_line_lossy(&mut self.stdout, &mut self.line).await?)
    }

    /// 等待行程結束並收集 stderr 尾段。
    pub async fn wait(&mut self) -> Result<ExitReport, JobError> {
        let status = self.child.wait().await?;
        debug!("{} exited with {status}", self.label);
        Ok(ExitReport {
            status,
            stderr: self.stderr_tail().await,
        })
    }

    /// 要求行程停止，最多等待 `grace`，逾時則強制終止。
    pub async fn terminate(&mut self, grace: Duration) -> Result<ExitStatus, JobError> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(status);
        }
        send_terminate(&mut self.child)?;
        match timeout(grace, self.child.wait()).await {
            Ok(status) => Ok(status?),
            Err(_) => {
                warn!(
                    "{} still running {}s after SIGTERM, killing it",
                    self.label,
                    grace.as_secs()
                );
                self.child.kill().await?;
                Ok(self.child.wait().await?)
            }
        }
    }

    async fn stderr_tail(&mut self) -> String {
        match timeout(STDERR_DRAIN_TIMEOUT, &mut self.stderr).await {
            Ok(Ok(tail)) => tail,
            Ok(Err(err)) => {
                warn!("stderr reader for {} failed: {err}", self.label);
                String::new()
            }
            Err(_) => {
                // 脫離的孫行程可能仍持有管線。
                self.stderr.abort();
                String::new()
            }
        }
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) -> std::io::Result<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return Ok(());
    };
    let pid = i32::try_from(pid).map_err(std::io::Error::other)?;
    kill(Pid::from_raw(pid), Signal::SIGTERM)?;
    Ok(())
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) -> std::io::Result<()> {
    child.start_kill()
}

async fn collect_stderr(stderr: ChildStderr, label: String, limit: usize) -> String {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    let mut tail = String::new();
    loop {
        match read_line_lossy(&mut reader, &mut buf).await {
            Ok(Some(line)) => {
                debug!("[{label} stderr] {line}");
                push_tail(&mut tail, &line, limit);
            }
            Ok(None) => break,
            Err(err) => {
                warn!("Failed to read stderr of {label}: {err}");
                break;
            }
        }
    }
    tail
}

/// 讀取一行以 `\n` 結尾的資料，並以寬鬆方式解碼。
///
/// 若 future 被中途釋放，已讀到的部分會留在 `buf`，下次呼叫接續讀取。
async fn read_line_lossy<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let read = reader.read_until(b'\n', buf).await?;
    if read == 0 && buf.is_empty() {
        return Ok(None);
    }
    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }
    let line = String::from_utf8_lossy(buf).into_owned();
    buf.clear();
    Ok(Some(line))
}

/// 將 `line` 附加到 `tail`，超過 `limit` 位元組時捨棄最舊的內容。
fn push_tail(tail: &mut String, line: &str, limit: usize) {
    tail.push_str(line);
    tail.push('\n');
    if tail.len() > limit {
        let mut cut = tail.len() - limit;
        while !tail.is_char_boundary(cut) {
            cut += 1;
        }
        tail.drain(..cut);
    }
}
