use std::collections::HashMap;

use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::config::S3Config;
use crate::proxy::compression::gzip_compress;
use crate::Result;

/// Bounded upload queue; past the cap submissions are dropped with a
/// warning.
const UPLOAD_QUEUE_CAPACITY: usize = 1000;

/// Object keys start with this many characters of the operator key id.
const KEY_PREFIX_LEN: usize = 16;

/// One archived round trip headed for object storage.
pub struct BodyUpload {
    pub key: String,
    pub request_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub request_method: String,
    pub request_path: String,
    pub request_headers: HashMap<String, String>,
    pub request_body: Bytes,
    pub response_status: u16,
    pub response_headers: HashMap<String, String>,
    pub response_body: Bytes,
}

#[derive(Serialize)]
struct BodyEnvelope {
    request_id: String,
    timestamp: String,
    request: RequestEnvelope,
    response: ResponseEnvelope,
}

#[derive(Serialize)]
struct RequestEnvelope {
    method: String,
    path: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    headers: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<Value>,
}

#[derive(Serialize)]
struct ResponseEnvelope {
    status_code: u16,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    headers: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<Value>,
}

/// Archives request/response bodies as gzip'd JSON envelopes in object
/// storage, off the request path. Failures are logged and never surfaced.
pub struct S3BodyStore {
    bucket: String,
    tx: std::sync::Mutex<Option<tokio::sync::mpsc::Sender<BodyUpload>>>,
    uploader: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl S3BodyStore {
    pub async fn new(config: &S3Config) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));
        if !config.access_key_id.is_empty() && !config.secret_access_key.is_empty() {
            loader = loader.credentials_provider(Credentials::new(
                config.access_key_id.clone(),
                config.secret_access_key.clone(),
                None,
                None,
                "majordomo-config",
            ));
        }
        let sdk_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if !config.endpoint.is_empty() {
            builder = builder
                .endpoint_url(config.endpoint.clone())
                .force_path_style(true);
        }
        let client = aws_sdk_s3::Client::from_conf(builder.build());

        let (tx, rx) = tokio::sync::mpsc::channel(UPLOAD_QUEUE_CAPACITY);
        let uploader = tokio::spawn(upload_loop(rx, client, config.bucket.clone()));

        Ok(Self {
            bucket: config.bucket.clone(),
            tx: std::sync::Mutex::new(Some(tx)),
            uploader: std::sync::Mutex::new(Some(uploader)),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Builds the opaque object key:
    /// `{operator_id_prefix}/{YYYY-MM-DD}/{request_id}.json.gz`.
    pub fn generate_key(owner_id: Uuid, request_id: Uuid, timestamp: DateTime<Utc>) -> String {
        let owner = owner_id.to_string();
        let prefix = &owner[..KEY_PREFIX_LEN.min(owner.len())];
        format!("{prefix}/{}/{request_id}.json.gz", timestamp.format("%Y-%m-%d"))
    }

    /// Enqueues an upload without blocking; a full queue drops it with a
    /// warning.
    pub fn submit(&self, upload: BodyUpload) {
        let sender = self.tx.lock().expect("upload sender lock poisoned");
        let Some(tx) = sender.as_ref() else {
            tracing::warn!(request_id = %upload.request_id, "S3 uploader closed, dropping upload");
            return;
        };
        if let Err(tokio::sync::mpsc::error::TrySendError::Full(upload)) = tx.try_send(upload) {
            tracing::warn!(request_id = %upload.request_id, "S3 upload queue full, dropping upload");
        }
    }

    /// Drains the remaining queue and stops the uploader.
    pub async fn close(&self) {
        let sender = self.tx.lock().expect("upload sender lock poisoned").take();
        drop(sender);
        let handle = self.uploader.lock().expect("uploader lock poisoned").take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "S3 uploader exited abnormally");
            }
        }
    }
}

async fn upload_loop(
    mut rx: tokio::sync::mpsc::Receiver<BodyUpload>,
    client: aws_sdk_s3::Client,
    bucket: String,
) {
    while let Some(upload) = rx.recv().await {
        do_upload(&client, &bucket, upload).await;
    }
}

async fn do_upload(client: &aws_sdk_s3::Client, bucket: &str, upload: BodyUpload) {
    let request_id = upload.request_id;
    let key = upload.key.clone();

    let compressed = match build_object(&upload) {
        Ok(compressed) => compressed,
        Err(err) => {
            tracing::error!(request_id = %request_id, error = %err, "failed to build S3 body object");
            return;
        }
    };

    let result = client
        .put_object()
        .bucket(bucket)
        .key(&key)
        .body(ByteStream::from(compressed))
        .content_type("application/json")
        .content_encoding("gzip")
        .send()
        .await;

    match result {
        Ok(_) => tracing::debug!(request_id = %request_id, key = %key, "uploaded body to S3"),
        Err(err) => {
            tracing::error!(request_id = %request_id, key = %key, error = %err, "failed to upload to S3");
        }
    }
}

/// Serializes the envelope and gzips it.
fn build_object(upload: &BodyUpload) -> std::io::Result<Vec<u8>> {
    let envelope = BodyEnvelope {
        request_id: upload.request_id.to_string(),
        timestamp: upload.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
        request: RequestEnvelope {
            method: upload.request_method.clone(),
            path: upload.request_path.clone(),
            headers: upload.request_headers.clone(),
            body: body_to_json(&upload.request_body),
        },
        response: ResponseEnvelope {
            status_code: upload.response_status,
            headers: upload.response_headers.clone(),
            body: body_to_json(&upload.response_body),
        },
    };
    let serialized = serde_json::to_vec(&envelope).map_err(std::io::Error::other)?;
    gzip_compress(&serialized)
}

/// Bodies that parse as JSON are embedded as-is; anything else is stored as
/// a JSON string.
fn body_to_json(body: &Bytes) -> Option<Value> {
    if body.is_empty() {
        return None;
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(value) => Some(value),
        Err(_) => Some(Value::String(String::from_utf8_lossy(body).into_owned())),
    }
}
