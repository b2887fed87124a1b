//! Inbound start/reconnect operations.
//!
//! This is the layer an HTTP front end would call: it makes sure the signaling channel
//! exists, turns a camera request into a [`WorkerDescriptor`], and hands it to the
//! [`Supervisor`]. Failures never escape as errors; they become a
//! [`StreamResponse::Failed`] payload carrying the message.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::supervisor::Supervisor;
use crate::worker::{CameraSource, Credentials, WorkerDescriptor};
use crate::{rlog, rlog_error, Error, Result};

/// A signaling channel as reported by the channel API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInfo {
    pub arn: String,
    pub created: bool,
}

/// Ensures a named signaling channel exists.
pub trait ChannelProvisioner: Send + Sync {
    fn ensure_channel(&self, name: &str) -> impl Future<Output = Result<ChannelInfo>> + Send;
}

/// In-process channel registry: the first request for a name creates it.
#[derive(Debug, Default)]
pub struct LocalChannels {
    region: String,
    known: Mutex<HashSet<String>>,
}

impl LocalChannels {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            known: Mutex::new(HashSet::new()),
        }
    }

    fn arn(&self, name: &str) -> String {
        format!("arn:aws:kinesisvideo:{}:local:channel/{}", self.region, name)
    }
}

impl ChannelProvisioner for LocalChannels {
    async fn ensure_channel(&self, name: &str) -> Result<ChannelInfo> {
        if name.trim().is_empty() {
            return Err(Error::Channel("channel name cannot be empty".to_string()));
        }
        let created = self
            .known
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.to_string());
        Ok(ChannelInfo {
            arn: self.arn(name),
            created,
        })
    }
}

/// Camera stream request body.
#[derive(Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StreamRequest {
    pub stream_name: String,
    pub camera_id: String,
    pub camera_password: String,
    pub camera_ip: String,
}

impl std::fmt::Debug for StreamRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRequest")
            .field("stream_name", &self.stream_name)
            .field("camera_id", &self.camera_id)
            .field("camera_password", &"***")
            .field("camera_ip", &self.camera_ip)
            .finish()
    }
}

impl StreamRequest {
    pub fn camera(&self) -> CameraSource {
        CameraSource::new(&self.camera_id, &self.camera_password, &self.camera_ip)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum StreamResponse {
    #[serde(rename_all = "camelCase")]
    Started {
        message: String,
        channel_arn: String,
        channel_name: String,
        created: bool,
    },
    #[serde(rename_all = "camelCase")]
    Reconnected {
        message: String,
        channel_name: String,
    },
    Failed {
        message: String,
    },
}

impl StreamResponse {
    fn failed(err: &Error) -> Self {
        StreamResponse::Failed {
            message: format!("Error: {}", err),
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, StreamResponse::Failed { .. })
    }

    /// HTTP status a front end should answer with.
    pub fn status_code(&self) -> u16 {
        if self.is_success() {
            200
        } else {
            500
        }
    }

    pub fn message(&self) -> &str {
        match self {
            StreamResponse::Started { message, .. }
            | StreamResponse::Reconnected { message, .. }
            | StreamResponse::Failed { message } => message,
        }
    }
}

pub struct StreamService<P> {
    channels: P,
    supervisor: Arc<Supervisor>,
    credentials: Credentials,
}

impl<P: ChannelProvisioner> StreamService<P> {
    pub fn new(channels: P, supervisor: Arc<Supervisor>, credentials: Credentials) -> Self {
        Self {
            channels,
            supervisor,
            credentials,
        }
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn descriptor_for(&self, request: &StreamRequest) -> Result<WorkerDescriptor> {
        let uri = request.camera().rtsp_uri()?;
        Ok(WorkerDescriptor::new(&request.stream_name, uri).with_credentials(&self.credentials))
    }

    /// Ensure the channel exists, then start streaming into it.
    pub async fn start(&self, request: &StreamRequest) -> StreamResponse {
        match self.try_start(request).await {
            Ok(response) => response,
            Err(e) => {
                rlog_error!("Error starting stream {}: {}", request.stream_name, e);
                StreamResponse::failed(&e)
            }
        }
    }

    async fn try_start(&self, request: &StreamRequest) -> Result<StreamResponse> {
        let descriptor = self.descriptor_for(request)?;
        let channel = self.channels.ensure_channel(&request.stream_name).await?;
        rlog!(
            "Channel {} ({}): {}",
            request.stream_name,
            if channel.created { "created" } else { "exists" },
            channel.arn
        );

        let outcome = self.supervisor.start(descriptor).await?;
        let message = if channel.created {
            "Channel created and stream started"
        } else {
            "Stream started on existing channel"
        };
        Ok(StreamResponse::Started {
            message: message.to_string(),
            channel_arn: channel.arn,
            channel_name: outcome.target_id,
            created: channel.created,
        })
    }

    /// Replace the running worker, waiting for the old one to exit first.
    pub async fn reconnect(&self, request: &StreamRequest) -> StreamResponse {
        let result = match self.descriptor_for(request) {
            Ok(descriptor) => self.supervisor.reconnect(descriptor).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(outcome) => StreamResponse::Reconnected {
                message: "GStreamer reconnected".to_string(),
                channel_name: outcome.target_id,
            },
            Err(e) => {
                rlog_error!("Error reconnecting stream {}: {}", request.stream_name, e);
                StreamResponse::failed(&e)
            }
        }
    }

    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }
}
