use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use url::Url;

use crate::endpoints;
use crate::error::UploadError;

/// 將偵測到的模型檔上傳到伺服器。
///
/// 由 [`UploadClient`] 實作；任務監督者只依賴這個 trait。
#[async_trait]
pub trait ArtifactUploader: Send + Sync {
    /// 上傳 `local_file`，回傳伺服器儲存的路徑。
    async fn upload(
        &self,
        training_id: &str,
        local_file: &Path,
        relative_path: &str,
    ) -> Result<String, UploadError>;
}

/// 從訓練 ID 推導模型名稱。
///
/// 訓練 ID 形如 `<model>_<timestamp>`，模型名稱為第一個 `_` 之前的文字；
/// 沒有 `_` 時使用整個 ID。
pub fn model_name(training_id: &str) -> &str {
    match training_id.split_once('_') {
        Some((name, _)) if !name.is_empty() => name,
        _ => training_id,
    }
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    server_path: String,
}

/// 以代理的 api key 驗證，透過 multipart 上傳模型檔。
#[derive(Debug)]
pub struct UploadClient {
    client: Client,
    endpoint: Url,
    api_key: String,
}

impl UploadClient {
    /// `timeout` 限制每次上傳從連線到讀完回應的時間。
    pub fn new(
        server_url: &str,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, UploadError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoints::upload_url(server_url)?,
            api_key: api_key.into(),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn headers(&self) -> Result<HeaderMap, UploadError> {
        let mut headers = HeaderMap::new();
        let value = format!("Bearer {}", self.api_key);
        let value = HeaderValue::from_str(&value).map_err(|_| UploadError::InvalidCredential)?;
        headers.insert(AUTHORIZATION, value);
        Ok(headers)
    }
}

#[async_trait]
impl ArtifactUploader for UploadClient {
    async fn upload(
        &self,
        training_id: &str,
        local_file: &Path,
        relative_path: &str,
    ) -> Result<String, UploadError> {
        let bytes = tokio::fs::read(local_file)
            .await
            .map_err(|source| UploadError::ReadArtifact {
                path: local_file.to_path_buf(),
                source,
            })?;
        let file_name = local_file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| String::from("model"));
        let model = model_name(training_id).to_string();
        info!(
            "Uploading {} ({} bytes) as model {model}",
            local_file.display(),
            bytes.len()
        );

        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("application/octet-stream")?;
        let form = Form::new()
            .text("model_name", model)
            .text("original_path", relative_path.to_string())
            .part("model_file", part);

        let response = self
            .client
            .post(self.endpoint.clone())
            .headers(self.headers()?)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            warn!("Upload of {relative_path} rejected with HTTP {status}");
            return Err(UploadError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let parsed: UploadResponse = response.json().await?;
        info!("Artifact stored on server at {}", parsed.server_path);
        Ok(parsed.server_path)
    }
}
