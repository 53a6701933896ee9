//! The sandbox capability consumed by the session controller.
//!
//! A [`Sandbox`] boots at most one [`Environment`]; the environment mounts a
//! [`FileSystemTree`], spawns [`ProcessHandle`]s and broadcasts a
//! [`ReadyEvent`] whenever a server inside it becomes reachable.

use crate::error::EnvironmentError;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Mount input: path segment to file or nested directory.
pub type FileSystemTree = BTreeMap<String, FileSystemNode>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileSystemNode {
    File { contents: String },
    Directory(FileSystemTree),
}

impl FileSystemNode {
    pub fn file(contents: impl Into<String>) -> Self {
        FileSystemNode::File {
            contents: contents.into(),
        }
    }
}

/// Text chunks written by a process.
pub type OutputStream = BoxStream<'static, std::io::Result<String>>;

/// Fired when a server inside the environment becomes reachable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadyEvent {
    pub port: u16,
    pub url: String,
}

/// A process currently running inside the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub command: String,
}

/// Boots the environment. Implementations may refuse a second boot.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn boot(&self) -> Result<Arc<dyn Environment>, EnvironmentError>;
}

#[async_trait]
pub trait Environment: Send + Sync {
    async fn mount(&self, tree: &FileSystemTree) -> Result<(), EnvironmentError>;

    async fn spawn(
        &self,
        program: &str,
        args: &[String],
    ) -> Result<Box<dyn ProcessHandle>, EnvironmentError>;

    /// Spawn a long-running service. Only servers announced by services
    /// raise readiness events; transient processes such as installers never do.
    async fn spawn_service(
        &self,
        program: &str,
        args: &[String],
    ) -> Result<Box<dyn ProcessHandle>, EnvironmentError> {
        self.spawn(program, args).await
    }

    /// Processes still running.
    async fn processes(&self) -> Vec<ProcessInfo>;

    /// Terminate a process by id and wait for it to exit.
    async fn kill(&self, pid: u32) -> Result<(), EnvironmentError>;

    /// Listener for readiness events. Listeners are additive and live as
    /// long as the environment.
    fn subscribe_ready(&self) -> broadcast::Receiver<ReadyEvent>;

    /// Release whatever the environment holds on the host.
    async fn teardown(&self) -> Result<(), EnvironmentError> {
        Ok(())
    }
}

#[async_trait]
pub trait ProcessHandle: Send {
    fn id(&self) -> u32;

    /// The output stream; `None` once taken.
    fn take_output(&mut self) -> Option<OutputStream>;

    /// Wait for exit and return the exit code.
    async fn wait(&mut self) -> Result<i32, EnvironmentError>;

    /// Terminate and wait until the process is gone. Succeeds if it already exited.
    async fn kill(&mut self) -> Result<(), EnvironmentError>;
}
