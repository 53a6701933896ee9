//! In-memory sandbox used to drive the controller in tests.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::stream;
use sandbox_session::{
    Environment, EnvironmentError, FileSystemNode, FileSystemTree, OutputKind, OutputSink,
    OutputStream, ProcessHandle, ProcessInfo, ReadyEvent, Sandbox,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};

pub const KILLED: i32 = 143;

/// Ordered record of everything the mock observed.
#[derive(Clone, Default)]
pub struct Log(Arc<Mutex<Vec<String>>>);

impl Log {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.position(entry).is_some()
    }

    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.entries().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

/// Writes forwarded output into the shared log.
pub struct RecordingSink(pub Log);

impl OutputSink for RecordingSink {
    fn write(&self, kind: OutputKind, chunk: &str) {
        self.0.push(format!("output {kind} {chunk}"));
    }
}

#[derive(Default)]
pub struct MockSandbox {
    pub log: Log,
    pub boots: AtomicUsize,
    pub teardowns: Arc<AtomicUsize>,
    pub subscriptions: Arc<AtomicUsize>,
    /// Spawns made through `spawn_service`.
    pub service_spawns: Arc<AtomicUsize>,
    pub boot_delay_ms: AtomicU32,
    pub teardown_delay_ms: Arc<AtomicU32>,
    pub spawn_delay_ms: Arc<AtomicU32>,
    pub kill_delay_ms: Arc<AtomicU32>,
    pub fail_boot: AtomicBool,
    pub fail_mount: AtomicBool,
    pub fail_spawn: Arc<AtomicBool>,
    pub install_exit: Arc<AtomicI32>,
    /// Installer runs until killed.
    pub install_blocks: Arc<AtomicBool>,
    current: Mutex<Option<Arc<MockEnvironment>>>,
}

impl MockSandbox {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn environment(&self) -> Option<Arc<MockEnvironment>> {
        self.current.lock().unwrap().clone()
    }

    /// Broadcast a readiness event from the current environment.
    pub fn fire_ready(&self, port: u16) {
        let env = self.environment().expect("environment booted");
        let _ = env.ready.send(ReadyEvent {
            port,
            url: format!("http://localhost:{port}"),
        });
    }
}

#[async_trait]
impl Sandbox for MockSandbox {
    async fn boot(&self) -> Result<Arc<dyn Environment>, EnvironmentError> {
        self.boots.fetch_add(1, Ordering::SeqCst);
        self.log.push("boot");
        let delay = self.boot_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay.into())).await;
        }
        if self.fail_boot.load(Ordering::SeqCst) {
            return Err(EnvironmentError::Spawn("boot refused".into()));
        }
        let (ready, _) = broadcast::channel(8);
        let env = Arc::new(MockEnvironment {
            log: self.log.clone(),
            fail_mount: self.fail_mount.load(Ordering::SeqCst),
            fail_spawn: Arc::clone(&self.fail_spawn),
            install_exit: Arc::clone(&self.install_exit),
            install_blocks: Arc::clone(&self.install_blocks),
            teardowns: Arc::clone(&self.teardowns),
            teardown_delay_ms: Arc::clone(&self.teardown_delay_ms),
            spawn_delay_ms: Arc::clone(&self.spawn_delay_ms),
            kill_delay_ms: Arc::clone(&self.kill_delay_ms),
            subscriptions: Arc::clone(&self.subscriptions),
            service_spawns: Arc::clone(&self.service_spawns),
            next_pid: AtomicU32::new(1),
            processes: Arc::new(Mutex::new(HashMap::new())),
            ready,
        });
        *self.current.lock().unwrap() = Some(Arc::clone(&env));
        Ok(env)
    }
}

struct Running {
    command: String,
    exit: watch::Sender<Option<i32>>,
    output: Option<mpsc::UnboundedSender<std::io::Result<String>>>,
}

type Table = Arc<Mutex<HashMap<u32, Running>>>;

async fn pause(delay_ms: &AtomicU32) {
    let delay = delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay.into())).await;
    }
}

fn finish(table: &Table, log: &Log, pid: u32, code: i32, reason: &str) -> bool {
    match table.lock().unwrap().remove(&pid) {
        Some(running) => {
            log.push(format!("{reason} {pid}"));
            running.exit.send_replace(Some(code));
            true
        }
        None => false,
    }
}

pub struct MockEnvironment {
    log: Log,
    fail_mount: bool,
    fail_spawn: Arc<AtomicBool>,
    install_exit: Arc<AtomicI32>,
    install_blocks: Arc<AtomicBool>,
    teardowns: Arc<AtomicUsize>,
    teardown_delay_ms: Arc<AtomicU32>,
    spawn_delay_ms: Arc<AtomicU32>,
    kill_delay_ms: Arc<AtomicU32>,
    subscriptions: Arc<AtomicUsize>,
    service_spawns: Arc<AtomicUsize>,
    next_pid: AtomicU32,
    processes: Table,
    ready: broadcast::Sender<ReadyEvent>,
}

#[async_trait]
impl Environment for MockEnvironment {
    async fn mount(&self, tree: &FileSystemTree) -> Result<(), EnvironmentError> {
        if self.fail_mount {
            return Err(EnvironmentError::InvalidPath("mount refused".into()));
        }
        self.log.push(format!("mount {}", tree.len()));
        Ok(())
    }

    async fn spawn(
        &self,
        program: &str,
        args: &[String],
    ) -> Result<Box<dyn ProcessHandle>, EnvironmentError> {
        let command = std::iter::once(program.to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        pause(&self.spawn_delay_ms).await;
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(EnvironmentError::Spawn(format!("{command}: not found")));
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.log.push(format!("spawn {pid} {command}"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _ = tx.send(Ok(format!("pid {pid} started")));
        let output: OutputStream = Box::pin(stream::poll_fn(move |cx| rx.poll_recv(cx)));
        let (exit_tx, exit_rx) = watch::channel(None);

        let installer = args.first().map(String::as_str) == Some("install");
        self.processes.lock().unwrap().insert(
            pid,
            Running {
                command,
                exit: exit_tx,
                output: Some(tx),
            },
        );

        if installer && !self.install_blocks.load(Ordering::SeqCst) {
            let table = Arc::clone(&self.processes);
            let log = self.log.clone();
            let code = self.install_exit.load(Ordering::SeqCst);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                finish(&table, &log, pid, code, "exit");
            });
        }

        Ok(Box::new(MockProcess {
            pid,
            output: Some(output),
            exit: exit_rx,
            table: Arc::clone(&self.processes),
            log: self.log.clone(),
            kill_delay_ms: Arc::clone(&self.kill_delay_ms),
        }))
    }

    async fn spawn_service(
        &self,
        program: &str,
        args: &[String],
    ) -> Result<Box<dyn ProcessHandle>, EnvironmentError> {
        self.service_spawns.fetch_add(1, Ordering::SeqCst);
        self.spawn(program, args).await
    }

    async fn processes(&self) -> Vec<ProcessInfo> {
        let mut list: Vec<ProcessInfo> = self
            .processes
            .lock()
            .unwrap()
            .iter()
            .map(|(pid, running)| ProcessInfo {
                pid: *pid,
                command: running.command.clone(),
            })
            .collect();
        list.sort_by_key(|p| p.pid);
        list
    }

    async fn kill(&self, pid: u32) -> Result<(), EnvironmentError> {
        if finish(&self.processes, &self.log, pid, KILLED, "kill") {
            Ok(())
        } else {
            Err(EnvironmentError::ProcessNotFound(pid))
        }
    }

    fn subscribe_ready(&self) -> broadcast::Receiver<ReadyEvent> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        self.ready.subscribe()
    }

    async fn teardown(&self) -> Result<(), EnvironmentError> {
        pause(&self.teardown_delay_ms).await;
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        self.log.push("teardown");
        Ok(())
    }
}

pub struct MockProcess {
    pid: u32,
    output: Option<OutputStream>,
    exit: watch::Receiver<Option<i32>>,
    table: Table,
    log: Log,
    kill_delay_ms: Arc<AtomicU32>,
}

#[async_trait]
impl ProcessHandle for MockProcess {
    fn id(&self) -> u32 {
        self.pid
    }

    fn take_output(&mut self) -> Option<OutputStream> {
        self.output.take()
    }

    async fn wait(&mut self) -> Result<i32, EnvironmentError> {
        let code = *self
            .exit
            .wait_for(Option::is_some)
            .await
            .map_err(|_| EnvironmentError::Closed)?;
        code.ok_or(EnvironmentError::Closed)
    }

    async fn kill(&mut self) -> Result<(), EnvironmentError> {
        pause(&self.kill_delay_ms).await;
        let killed = finish(&self.table, &self.log, self.pid, KILLED, "kill");
        let exited = self.exit.borrow().is_some();
        if killed || exited {
            Ok(())
        } else {
            Err(EnvironmentError::ProcessNotFound(self.pid))
        }
    }
}

pub fn project() -> FileSystemTree {
    let mut tree = FileSystemTree::new();
    tree.insert(
        "package.json".into(),
        FileSystemNode::file(r#"{"scripts":{"dev":"vite"}}"#),
    );
    tree.insert("index.html".into(), FileSystemNode::file("<div id=\"root\"></div>"));
    tree
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
