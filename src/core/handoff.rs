//! Post-production hand-off of finished videos.
//!
//! The default sink drives the DaVinci Resolve bridge script: it is spawned
//! once per video with `import <file> <folder> <clip-name> [<metadata>]`
//! and answers with a single JSON object on stdout. Every call runs under a
//! wall-clock limit; a bridge that overruns it is killed.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info};

use crate::core::config::HandoffConfig;
use crate::core::graph::{MediaContent, Node, NodeId};

/// One finished video to hand off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffRequest {
    pub node_id: NodeId,
    /// Local path when the provider stored the file, otherwise its URL.
    pub file: String,
    pub name: String,
    pub metadata: ClipMetadata,
}

/// Clip fields the bridge writes into the media pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClipMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scene: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ClipMetadata {
    pub fn is_empty(&self) -> bool {
        self.scene.is_none() && self.comments.is_none() && self.description.is_none()
    }
}

impl HandoffRequest {
    pub fn for_video(node: &Node, content: &MediaContent) -> Self {
        Self {
            node_id: node.id.clone(),
            file: content
                .local_path
                .clone()
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(|| content.url.clone()),
            name: node.display_name().to_string(),
            metadata: ClipMetadata {
                scene: Some(node.display_name().to_string()),
                comments: Some(format!("Generated from {}", content.url)),
                description: node.instructions().map(str::to_string),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffReceipt {
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub folder: Option<String>,
    #[serde(default)]
    pub clip_name: Option<String>,
}

#[async_trait]
pub trait HandoffSink: Send + Sync {
    async fn deliver(&self, request: &HandoffRequest) -> Result<HandoffReceipt>;
}

/// Connection state reported by the bridge's `status` command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStatus {
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub media_pool_folder: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolveBridge {
    python: String,
    script: PathBuf,
    target_folder: Option<String>,
    timeout: Duration,
}

impl ResolveBridge {
    pub fn new(python: impl Into<String>, script: impl Into<PathBuf>) -> Self {
        Self {
            python: python.into(),
            script: script.into(),
            target_folder: None,
            timeout: Duration::from_secs(120),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_target_folder(mut self, folder: impl Into<String>) -> Self {
        self.target_folder = Some(folder.into());
        self
    }

    /// `None` unless the hand-off is enabled and a script is configured.
    pub fn from_config(config: &HandoffConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        let script = config.script.clone()?;
        Some(Self {
            python: config.python.clone(),
            script,
            target_folder: config.target_folder.clone(),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
        })
    }

    async fn run(&self, args: &[&str]) -> Result<Value> {
        debug!("Running bridge {} {:?}", self.script.display(), args);
        let child = Command::new(&self.python)
            .arg(&self.script)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start {}", self.python))?;

        // Dropping the wait on expiry kills the child.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output.context("failed to read the bridge output")?,
            Err(_) => bail!("bridge did not answer within {:?}", self.timeout),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let reply = stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| l.starts_with('{'))
            .and_then(|l| serde_json::from_str::<Value>(l).ok());

        match reply {
            Some(value) => Ok(value),
            None if !output.status.success() => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                bail!("bridge exited with {}: {}", output.status, stderr.trim())
            }
            None => bail!("bridge printed no JSON reply"),
        }
    }

    pub async fn status(&self) -> Result<BridgeStatus> {
        let value = self.run(&["status"]).await?;
        serde_json::from_value(value).context("unexpected bridge status reply")
    }
}

#[async_trait]
impl HandoffSink for ResolveBridge {
    async fn deliver(&self, request: &HandoffRequest) -> Result<HandoffReceipt> {
        let folder = self.target_folder.as_deref().unwrap_or("");
        let metadata = if request.metadata.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&request.metadata)?)
        };
        let mut args = vec!["import", request.file.as_str(), folder, request.name.as_str()];
        if let Some(metadata) = &metadata {
            args.push(metadata.as_str());
        }
        let reply = self.run(&args).await?;

        let succeeded = reply.get("success").and_then(Value::as_bool) == Some(true);
        if !succeeded {
            let message = reply
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("import failed");
            return Err(anyhow!("{}", message));
        }
        let receipt: HandoffReceipt =
            serde_json::from_value(reply).context("unexpected bridge import reply")?;
        info!(
            "Imported {} into {} / {}",
            request.name,
            receipt.project.as_deref().unwrap_or("?"),
            receipt.folder.as_deref().unwrap_or("Master")
        );
        Ok(receipt)
    }
}
