//! 與控制伺服器交換的 JSON 訊框。
//!
//! 兩個方向都是以 `type` 欄位標記的封閉列舉。未知 `type` 的入站訊框會解碼為
//! [`InboundCommand::Unrecognized`]，不會視為錯誤。

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::system_info::SystemInfo;

/// 伺服器送給代理的指令。
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundCommand {
    /// 握手確認。
    Connected {
        #[serde(default)]
        message: String,
    },
    Ping,
    SystemInfoRequest,
    Train { data: TrainRequest },
    Stop,
    #[serde(other)]
    Unrecognized,
}

impl InboundCommand {
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// `train` 指令的內容。
///
/// `script_name` 與 `python_command` 可省略，省略時使用代理設定的預設值。
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TrainRequest {
    pub training_id: String,
    pub folder_path: PathBuf,
    #[serde(default)]
    pub script_name: Option<String>,
    #[serde(default)]
    pub python_command: Option<String>,
}

/// 代理送給伺服器的事件，最多送達一次。
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    Pong,
    SystemInfo {
        data: SystemInfo,
    },
    TrainingStarted {
        training_id: String,
    },
    TrainingOutput {
        training_id: String,
        output: String,
    },
    TrainingCompleted {
        training_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        model_path: Option<String>,
    },
    TrainingFailed {
        training_id: String,
        error: String,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        training_id: Option<String>,
        message: String,
    },
}

impl OutboundEvent {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// 事件在協定中的名稱，用於日誌。
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundEvent::Pong => "pong",
            OutboundEvent::SystemInfo { .. } => "system_info",
            OutboundEvent::TrainingStarted { .. } => "training_started",
            OutboundEvent::TrainingOutput { .. } => "training_output",
            OutboundEvent::TrainingCompleted { .. } => "training_completed",
            OutboundEvent::TrainingFailed { .. } => "training_failed",
            OutboundEvent::Error { .. } => "error",
        }
    }
}
