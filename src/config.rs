use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// 指定設定檔路徑的環境變數。
pub const CONFIG_ENV: &str = "TRAINER_AGENT_CONFIG";
/// 覆寫 `server_url` 的環境變數。
pub const SERVER_URL_ENV: &str = "TRAINER_AGENT_SERVER_URL";
const DEFAULT_CONFIG_PATH: &str = "config/agent.toml";

/// 代理的設定，通常從 `config/agent.toml` 載入。
///
/// 每個欄位都有預設值，只要環境中有 api key 即可啟動。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// 控制伺服器位址。接受 `http(s)://`，並改寫為 `ws(s)://`。
    pub server_url: String,
    /// 直接寫在設定中的 api key，優先於 `api_key_env`。
    pub api_key: Option<String>,
    /// 存放 api key 的環境變數名稱。
    pub api_key_env: Option<String>,
    pub handshake_timeout_secs: u64,
    pub reconnect_delay_secs: u64,
    /// 送出 SIGTERM 後，等待任務結束的秒數，逾時則強制終止。
    pub stop_grace_secs: u64,
    /// `train` 指令未指定腳本時使用的腳本。
    pub default_script: String,
    /// `train` 指令未指定直譯器時使用的直譯器。
    pub default_interpreter: String,
    /// 單次模型上傳的時限，從連線到讀完回應為止。
    pub upload_timeout_secs: u64,
    /// 失敗回報中保留的 stderr 尾段上限（位元組）。
    pub stderr_limit_bytes: usize,
    /// 每個任務行程額外設定的環境變數。
    pub env: BTreeMap<String, String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            server_url: String::from("ws://localhost:8081"),
            api_key: None,
            api_key_env: Some(String::from("TRAINER_AGENT_API_KEY")),
            handshake_timeout_secs: 5,
            reconnect_delay_secs: 5,
            stop_grace_secs: 10,
            default_script: String::from("train.py"),
            default_interpreter: String::from("python3"),
            upload_timeout_secs: 300,
            stderr_limit_bytes: 64 * 1024,
            env: BTreeMap::new(),
        }
    }
}

impl AgentSettings {
    /// 依代理執行檔的方式載入設定。
    ///
    /// 優先讀取 `TRAINER_AGENT_CONFIG` 指定的檔案，其次是 `workspace_root` 下的
    /// `config/agent.toml`，兩者皆無則使用內建預設值。
    /// `TRAINER_AGENT_SERVER_URL` 會覆寫檔案中的位址。
    pub fn load(workspace_root: &Path) -> Result<Self> {
        let explicit = env::var_os(CONFIG_ENV).map(PathBuf::from);
        let mut settings = match explicit {
            Some(path) => Self::from_file(&path)?,
            None => {
                let path = workspace_root.join(DEFAULT_CONFIG_PATH);
                if path.exists() {
                    Self::from_file(&path)?
                } else {
                    Self::default()
                }
            }
        };
        if let Ok(url) = env::var(SERVER_URL_ENV) {
            settings.server_url = url;
        }
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read agent settings: {}", path.display()))?;
        Self::from_toml(&raw)
            .with_context(|| format!("failed to parse agent settings: {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// 取得 api key：先看設定中的值，再看指定的環境變數。
    pub fn resolved_api_key(&self) -> Option<String> {
        if let Some(key) = &self.api_key {
            Some(key.clone())
        } else if let Some(var) = &self.api_key_env {
            env::var(var).ok().filter(|key| !key.is_empty())
        } else {
            None
        }
    }

    /// 與 [`resolved_api_key`](Self::resolved_api_key) 相同，但找不到時回傳設定說明。
    pub fn require_api_key(&self) -> Result<String> {
        self.resolved_api_key().ok_or_else(|| {
            let var = self.api_key_env.as_deref().unwrap_or("TRAINER_AGENT_API_KEY");
            anyhow!("no api key configured: set `api_key` in {DEFAULT_CONFIG_PATH} or export {var}")
        })
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }
}
