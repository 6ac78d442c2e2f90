//! REST client for the file/device service.

use async_trait::async_trait;
use namespace_core::device::{DevicePrediction, DeviceTelemetry};
use namespace_core::records::{FileRecord, Source};
use namespace_core::service::{CloudListing, FileService, FolderOutcome, Result, ScanProgressFn, ServiceError};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

/// File record as the service sends it. Missing fields get defaults; the
/// source is assigned by the endpoint the record came from.
#[derive(Debug, Clone, Deserialize)]
struct WireRecord {
    file_path: String,
    #[serde(default)]
    file_name: String,
    #[serde(default)]
    device_name: String,
    #[serde(default, alias = "file_type")]
    kind: String,
    #[serde(default)]
    file_size: u64,
    #[serde(default)]
    original_device: Option<String>,
    #[serde(default)]
    owner: Option<String>,
    #[serde(default)]
    is_public: Option<bool>,
    #[serde(default)]
    shared_with: Option<Vec<String>>,
}

impl WireRecord {
    fn into_record(self, source: Source) -> FileRecord {
        let mut record = FileRecord::new(&self.file_path, &self.device_name, &self.kind, source)
            .with_size(self.file_size);
        if !self.file_name.is_empty() {
            record.file_name = self.file_name;
        }
        record.original_device = self.original_device;
        record.owner = self.owner;
        record.is_public = self.is_public;
        record.shared_with = self.shared_with;
        record
    }
}

fn into_records(wire: Vec<WireRecord>, source: Source) -> Vec<FileRecord> {
    wire.into_iter().map(|w| w.into_record(source)).collect()
}

/// `{shared_files: {shared_files: [...]}}`
#[derive(Debug, Deserialize)]
struct SharedEnvelope {
    shared_files: SharedInner,
}

#[derive(Debug, Deserialize)]
struct SharedInner {
    #[serde(default)]
    shared_files: Vec<WireRecord>,
}

#[derive(Debug, Deserialize)]
struct CloudEnvelope {
    #[serde(default)]
    files: Vec<WireRecord>,
    #[serde(default)]
    s3_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FolderResponse {
    result: FolderOutcome,
}

#[derive(Debug, Serialize)]
struct FolderRequest<'a> {
    device_name: &'a str,
    folder_path: &'a str,
}

/// Map a non-success HTTP status to a service error.
fn status_error(status: StatusCode, endpoint: &str) -> ServiceError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ServiceError::Unauthorized(format!("{} returned {}", endpoint, status))
        }
        StatusCode::NOT_FOUND => ServiceError::NotFound(format!("{} returned {}", endpoint, status)),
        _ => ServiceError::Transport(format!("{} returned {}", endpoint, status)),
    }
}

fn decode<T: DeserializeOwned>(body: &[u8], endpoint: &str) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| ServiceError::Decode(format!("{}: {}", endpoint, e)))
}

/// `FileService` over HTTP.
pub struct HttpFileService {
    client: Client,
    base_url: String,
}

impl HttpFileService {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint)
    }

    async fn call<T: DeserializeOwned>(&self, endpoint: &str, request: RequestBuilder) -> Result<T> {
        debug!("Calling {}", endpoint);
        let response = request
            .send()
            .await
            .map_err(|e| ServiceError::Transport(format!("{}: {}", endpoint, e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, endpoint));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| ServiceError::Transport(format!("{}: {}", endpoint, e)))?;
        decode(&body, endpoint)
    }

    async fn get<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T> {
        self.call(endpoint, self.client.get(self.url(endpoint))).await
    }

    async fn post<T: DeserializeOwned>(&self, endpoint: &str, body: &impl Serialize) -> Result<T> {
        self.call(endpoint, self.client.post(self.url(endpoint)).json(body))
            .await
    }

    async fn folder_op(&self, endpoint: &str, device: &str, path: &str) -> Result<FolderOutcome> {
        let request = FolderRequest {
            device_name: device,
            folder_path: path,
        };
        let response: FolderResponse = self.post(endpoint, &request).await?;
        Ok(response.result)
    }
}

#[async_trait]
impl FileService for HttpFileService {
    async fn devices(&self) -> Result<Vec<DeviceTelemetry>> {
        self.get("devices").await
    }

    async fn device_predictions(&self) -> Result<Vec<DevicePrediction>> {
        self.get("device-predictions").await
    }

    async fn files_by_path(&self, global_file_path: &str) -> Result<Vec<FileRecord>> {
        let wire: Vec<WireRecord> = self
            .post("files-by-path", &json!({ "global_file_path": global_file_path }))
            .await?;
        Ok(into_records(wire, Source::Files))
    }

    async fn sync_files_by_path(&self, global_file_path: Option<&str>) -> Result<Vec<FileRecord>> {
        let wire: Vec<WireRecord> = self
            .post("sync-files-by-path", &json!({ "global_file_path": global_file_path }))
            .await?;
        Ok(into_records(wire, Source::Sync))
    }

    async fn shared_files(&self, username: &str) -> Result<Vec<FileRecord>> {
        let envelope: SharedEnvelope = self
            .post("shared-files", &json!({ "username": username }))
            .await?;
        Ok(into_records(envelope.shared_files.shared_files, Source::Shared))
    }

    async fn s3_files(&self, username: &str) -> Result<CloudListing> {
        let request = self
            .client
            .get(self.url("s3-files"))
            .query(&[("username", username)]);
        let envelope: CloudEnvelope = self.call("s3-files", request).await?;
        Ok(CloudListing {
            files: into_records(envelope.files, Source::S3files),
            s3_url: envelope.s3_url,
        })
    }

    async fn add_folder(&self, device: &str, path: &str) -> Result<FolderOutcome> {
        self.folder_op("add-sync-folder", device, path).await
    }

    async fn remove_folder(&self, device: &str, path: &str) -> Result<FolderOutcome> {
        self.folder_op("remove-sync-folder", device, path).await
    }

    /// The REST endpoint answers once the scan finished; progress reported
    /// here is the final 100 on success.
    async fn scan_folder(&self, device: &str, path: &str, progress: ScanProgressFn) -> Result<FolderOutcome> {
        let outcome = self.folder_op("scan-folder", device, path).await?;
        if outcome == FolderOutcome::Success {
            progress(100.0, None);
        }
        Ok(outcome)
    }
}
