use std::process::Stdio;
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::time::timeout;

const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Asks the interpreter about its deep learning stack. Prints one JSON line.
const TORCH_PROBE: &str = "\
import json
try:
    import torch
    cuda = torch.cuda.is_available()
    print(json.dumps({
        'pytorch_version': torch.__version__,
        'cuda_available': cuda,
        'gpu_count': torch.cuda.device_count() if cuda else 0,
        'gpu_name': torch.cuda.get_device_name(0) if cuda else None,
    }))
except Exception:
    print(json.dumps({}))
";

/// Platform description reported in `system_info` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub platform: String,
    pub arch: String,
    pub hostname: Option<String>,
    pub cpu_count: usize,
    pub agent_version: String,
    pub python_version: Option<String>,
    pub pytorch_version: Option<String>,
    pub cuda_available: bool,
    pub gpu_count: u32,
    pub gpu_name: String,
}

#[derive(Debug, Default, Deserialize)]
struct TorchProbe {
    #[serde(default)]
    pytorch_version: Option<String>,
    #[serde(default)]
    cuda_available: bool,
    #[serde(default)]
    gpu_count: u32,
    #[serde(default)]
    gpu_name: Option<String>,
}

impl SystemInfo {
    /// Static facts about this machine, without asking any interpreter.
    pub fn host() -> Self {
        Self {
            platform: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            hostname: hostname::get()
                .ok()
                .map(|name| name.to_string_lossy().into_owned()),
            cpu_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            python_version: None,
            pytorch_version: None,
            cuda_available: false,
            gpu_count: 0,
            gpu_name: String::from("None"),
        }
    }

    /// Host facts plus whatever `interpreter` can tell about itself.
    ///
    /// Probe failures leave the corresponding fields at their defaults.
    pub async fn collect(interpreter: &str) -> Self {
        let mut info = Self::host();
        info.python_version = interpreter_version(interpreter).await;

        let probe = run_probe(interpreter, &["-c", TORCH_PROBE])
            .await
            .and_then(|stdout| serde_json::from_str::<TorchProbe>(stdout.trim()).ok())
            .unwrap_or_default();
        info.pytorch_version = probe.pytorch_version;
        info.cuda_available = probe.cuda_available;
        info.gpu_count = probe.gpu_count;
        if let Some(name) = probe.gpu_name {
            info.gpu_name = name;
        }
        info
    }
}

async fn interpreter_version(interpreter: &str) -> Option<String> {
    let output = timeout(
        PROBE_TIMEOUT,
        Command::new(interpreter)
            .arg("--version")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output(),
    )
    .await
    .ok()?
    .ok()?;
    // Older interpreters print their version on stderr.
    [output.stdout, output.stderr]
        .iter()
        .map(|bytes| String::from_utf8_lossy(bytes).trim().to_string())
        .find(|text| !text.is_empty())
}

async fn run_probe(interpreter: &str, args: &[&str]) -> Option<String> {
    let result = timeout(
        PROBE_TIMEOUT,
        Command::new(interpreter)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output(),
    )
    .await;
    match result {
        Ok(Ok(output)) if output.status.success() => {
            Some(String::from_utf8_lossy(&output.stdout).into_owned())
        }
        Ok(Ok(output)) => {
            debug!("Interpreter probe exited with {}", output.status);
            None
        }
        Ok(Err(err)) => {
            debug!("Interpreter probe could not start {interpreter}: {err}");
            None
        }
        Err(_) => {
            debug!("Interpreter probe timed out");
            None
        }
    }
}
