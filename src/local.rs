//! Host-backed sandbox: a scratch directory per boot, plain child processes,
//! and readiness detected from process output plus a TCP probe.

use crate::config::LocalSandboxConfig;
use crate::environment::{
    Environment, FileSystemNode, FileSystemTree, OutputStream, ProcessHandle, ProcessInfo,
    ReadyEvent, Sandbox,
};
use crate::error::EnvironmentError;
use async_trait::async_trait;
use futures_util::stream;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tracing::{debug, info, warn};

const READY_CHANNEL_CAPACITY: usize = 16;

fn ansi_escape() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").expect("valid regex"))
}

fn local_url() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"https?://(?:localhost|127\.0\.0\.1|0\.0\.0\.0):(\d{1,5})").expect("valid regex")
    })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poison| poison.into_inner())
}

/// Boots a [`LocalEnvironment`] rooted under `base_dir`.
#[derive(Debug, Clone, Default)]
pub struct LocalSandbox {
    config: LocalSandboxConfig,
}

impl LocalSandbox {
    pub fn new(config: LocalSandboxConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    async fn boot(&self) -> Result<Arc<dyn Environment>, EnvironmentError> {
        let root = self
            .config
            .base_dir
            .join(format!("sandbox-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&root).await?;
        info!(root = ?root, "Local sandbox booted");
        Ok(Arc::new(LocalEnvironment::new(root, self.config.clone())))
    }
}

struct ProcessControl {
    command: String,
    kill: Arc<Notify>,
    exit: watch::Receiver<Option<i32>>,
}

type Registry = Arc<Mutex<HashMap<u32, ProcessControl>>>;

pub struct LocalEnvironment {
    root: PathBuf,
    config: LocalSandboxConfig,
    processes: Registry,
    ready: broadcast::Sender<ReadyEvent>,
}

impl LocalEnvironment {
    pub fn new(root: PathBuf, config: LocalSandboxConfig) -> Self {
        let (ready, _) = broadcast::channel(READY_CHANNEL_CAPACITY);
        Self {
            root,
            config,
            processes: Arc::new(Mutex::new(HashMap::new())),
            ready,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn start(
        &self,
        program: &str,
        args: &[String],
        watch_ready: bool,
    ) -> Result<Box<dyn ProcessHandle>, EnvironmentError> {
        let mut child = Command::new(program)
            .args(args)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EnvironmentError::Spawn(format!("{program}: {e}")))?;
        let pid = child
            .id()
            .ok_or_else(|| EnvironmentError::Spawn(format!("{program}: exited before tracking")))?;
        let command = std::iter::once(program)
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        debug!(pid, command = %command, "Spawned process");

        let (tx, rx) = mpsc::unbounded_channel();
        let detector =
            watch_ready.then(|| ReadinessDetector::new(self.ready.clone(), &self.config));
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone(), detector.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx, detector));
        }
        let output: OutputStream = Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        }));

        let kill = Arc::new(Notify::new());
        let (exit_tx, exit_rx) = watch::channel(None);
        lock(&self.processes).insert(
            pid,
            ProcessControl {
                command,
                kill: Arc::clone(&kill),
                exit: exit_rx.clone(),
            },
        );
        tokio::spawn(supervise(
            child,
            pid,
            Arc::clone(&kill),
            exit_tx,
            Arc::clone(&self.processes),
            self.config.kill_grace(),
        ));

        Ok(Box::new(LocalProcess {
            pid,
            output: Some(output),
            kill,
            exit: exit_rx,
        }))
    }
}

#[async_trait]
impl Environment for LocalEnvironment {
    async fn mount(&self, tree: &FileSystemTree) -> Result<(), EnvironmentError> {
        write_tree(&self.root, tree).await
    }

    async fn spawn(
        &self,
        program: &str,
        args: &[String],
    ) -> Result<Box<dyn ProcessHandle>, EnvironmentError> {
        self.start(program, args, false)
    }

    async fn spawn_service(
        &self,
        program: &str,
        args: &[String],
    ) -> Result<Box<dyn ProcessHandle>, EnvironmentError> {
        self.start(program, args, true)
    }

    async fn processes(&self) -> Vec<ProcessInfo> {
        let mut list: Vec<ProcessInfo> = lock(&self.processes)
            .iter()
            .map(|(pid, control)| ProcessInfo {
                pid: *pid,
                command: control.command.clone(),
            })
            .collect();
        list.sort_by_key(|p| p.pid);
        list
    }

    async fn kill(&self, pid: u32) -> Result<(), EnvironmentError> {
        let (kill, exit) = {
            let processes = lock(&self.processes);
            let control = processes
                .get(&pid)
                .ok_or(EnvironmentError::ProcessNotFound(pid))?;
            (Arc::clone(&control.kill), control.exit.clone())
        };
        terminate_and_wait(&kill, exit).await.map(|_| ())
    }

    fn subscribe_ready(&self) -> broadcast::Receiver<ReadyEvent> {
        self.ready.subscribe()
    }

    async fn teardown(&self) -> Result<(), EnvironmentError> {
        let pids: Vec<u32> = lock(&self.processes).keys().copied().collect();
        for pid in pids {
            match self.kill(pid).await {
                Ok(()) | Err(EnvironmentError::ProcessNotFound(_)) => {}
                Err(e) => warn!(pid, error = %e, "Failed to kill process on teardown"),
            }
        }
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(root = ?self.root, "Local sandbox removed");
        Ok(())
    }
}

struct LocalProcess {
    pid: u32,
    output: Option<OutputStream>,
    kill: Arc<Notify>,
    exit: watch::Receiver<Option<i32>>,
}

#[async_trait]
impl ProcessHandle for LocalProcess {
    fn id(&self) -> u32 {
        self.pid
    }

    fn take_output(&mut self) -> Option<OutputStream> {
        self.output.take()
    }

    async fn wait(&mut self) -> Result<i32, EnvironmentError> {
        wait_exit(self.exit.clone()).await
    }

    async fn kill(&mut self) -> Result<(), EnvironmentError> {
        terminate_and_wait(&self.kill, self.exit.clone()).await.map(|_| ())
    }
}

async fn wait_exit(mut exit: watch::Receiver<Option<i32>>) -> Result<i32, EnvironmentError> {
    let code = *exit
        .wait_for(Option::is_some)
        .await
        .map_err(|_| EnvironmentError::Closed)?;
    code.ok_or(EnvironmentError::Closed)
}

async fn terminate_and_wait(
    kill: &Notify,
    exit: watch::Receiver<Option<i32>>,
) -> Result<i32, EnvironmentError> {
    let exited = *exit.borrow();
    if let Some(code) = exited {
        return Ok(code);
    }
    kill.notify_one();
    wait_exit(exit).await
}

/// Owns the child until it exits, then publishes the exit code.
async fn supervise(
    mut child: Child,
    pid: u32,
    kill: Arc<Notify>,
    exit: watch::Sender<Option<i32>>,
    registry: Registry,
    grace: Duration,
) {
    let finished = tokio::select! {
        status = child.wait() => Some(status),
        _ = kill.notified() => None,
    };
    let status = match finished {
        Some(status) => status,
        None => terminate(&mut child, pid, grace).await,
    };
    let code = match status {
        Ok(status) => exit_code(status),
        Err(e) => {
            warn!(pid, error = %e, "Failed to reap process");
            1
        }
    };
    debug!(pid, code, "Process exited");
    lock(&registry).remove(&pid);
    exit.send_replace(Some(code));
}

async fn terminate(child: &mut Child, pid: u32, grace: Duration) -> std::io::Result<ExitStatus> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Ok(raw) = i32::try_from(pid) {
            if kill(Pid::from_raw(raw), Signal::SIGTERM).is_ok() {
                if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
                    return status;
                }
                debug!(pid, "Process ignored SIGTERM, killing");
            }
        }
    }
    #[cfg(not(unix))]
    let _ = (pid, grace);

    child.kill().await?;
    child.wait().await
}

fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

/// Forwards output line by line until EOF. Bytes that are not UTF-8 are
/// replaced rather than ending the stream, and reading continues after the
/// receiver goes away, so the child never blocks on or dies from its pipe.
async fn forward_lines<R>(
    reader: R,
    tx: mpsc::UnboundedSender<std::io::Result<String>>,
    detector: Option<ReadinessDetector>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).into_owned();
                if let Some(detector) = &detector {
                    detector.inspect(&line);
                }
                let _ = tx.send(Ok(line));
            }
            Err(e) => {
                let _ = tx.send(Err(e));
                break;
            }
        }
    }
}

/// Watches one process's output for local server URLs.
#[derive(Clone)]
struct ReadinessDetector {
    ready: broadcast::Sender<ReadyEvent>,
    seen: Arc<Mutex<HashSet<u16>>>,
    attempts: u32,
    interval: Duration,
}

impl ReadinessDetector {
    fn new(ready: broadcast::Sender<ReadyEvent>, config: &LocalSandboxConfig) -> Self {
        Self {
            ready,
            seen: Arc::new(Mutex::new(HashSet::new())),
            attempts: config.probe_attempts,
            interval: config.probe_interval(),
        }
    }

    fn inspect(&self, line: &str) {
        let plain = ansi_escape().replace_all(line, "");
        for port in local_url()
            .captures_iter(&plain)
            .filter_map(|c| c.get(1)?.as_str().parse::<u16>().ok())
        {
            if lock(&self.seen).insert(port) {
                tokio::spawn(self.clone().probe(port));
            }
        }
    }

    async fn probe(self, port: u16) {
        for _ in 0..self.attempts {
            if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                let event = ReadyEvent {
                    port,
                    url: format!("http://localhost:{port}"),
                };
                debug!(port, "Port reachable");
                // No subscribers yet is not an error.
                let _ = self.ready.send(event);
                return;
            }
            tokio::time::sleep(self.interval).await;
        }
        warn!(port, "Port announced but never became reachable");
        lock(&self.seen).remove(&port);
    }
}

fn check_segment(name: &str) -> Result<(), EnvironmentError> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(EnvironmentError::InvalidPath(name.to_string()));
    }
    Ok(())
}

async fn write_tree(dir: &Path, tree: &FileSystemTree) -> Result<(), EnvironmentError> {
    let mut pending: Vec<(PathBuf, &FileSystemTree)> = vec![(dir.to_path_buf(), tree)];
    while let Some((dir, tree)) = pending.pop() {
        tokio::fs::create_dir_all(&dir).await?;
        for (name, node) in tree {
            check_segment(name)?;
            let path = dir.join(name);
            match node {
                FileSystemNode::File { contents } => tokio::fs::write(&path, contents).await?,
                FileSystemNode::Directory(children) => pending.push((path, children)),
            }
        }
    }
    Ok(())
}
