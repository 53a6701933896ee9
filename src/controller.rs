//! Session lifecycle controller.
//!
//! Owns at most one booted [`Environment`] and at most one dev server
//! process. Concurrent `initialize` calls join one shared outcome, the
//! boot-once constraint is tracked by a [`BootLatch`] shared by every
//! controller of a page, and `dispose` unwinds whatever subset of
//! boot → mount → install → start has completed.

use crate::config::{BootPolicy, CommandSpec, SessionConfig};
use crate::environment::{Environment, FileSystemTree, ProcessHandle, ReadyEvent, Sandbox};
use crate::error::{SessionError, SessionResult};
use crate::output::{pipe_output, OutputKind, OutputSink, TracingSink};
use futures_util::future::{join_all, BoxFuture, Shared};
use futures_util::FutureExt;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::sync::{broadcast, watch, Mutex, MutexGuard as StateGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Invoked with the reachable URL of the dev server.
pub type ReadyCallback = Arc<dyn Fn(&str) + Send + Sync>;

type InitOutcome = Shared<BoxFuture<'static, SessionResult<()>>>;

/// Page-wide "the sandbox has been booted" flag.
///
/// Clone it into every controller that lives in the same page.
#[derive(Debug, Clone, Default)]
pub struct BootLatch(Arc<AtomicBool>);

impl BootLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_booted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn try_acquire(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn release(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Unbooted,
    Booting,
    Ready,
    Disposing,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub phase: SessionPhase,
    pub booted: bool,
    pub service_pid: Option<u32>,
    pub disposing: bool,
    pub epoch: u64,
}

#[derive(Default)]
struct SessionState {
    environment: Option<Arc<dyn Environment>>,
    service: Option<Box<dyn ProcessHandle>>,
    ready_relay: Option<JoinHandle<()>>,
    booting: bool,
}

impl SessionState {
    fn summary(&self) -> Summary {
        Summary {
            booting: self.booting,
            booted: self.environment.is_some(),
            service_pid: self.service.as_ref().map(|s| s.id()),
        }
    }
}

/// Copy of the state published after each change, so `status` never waits
/// on an operation that holds the state lock.
#[derive(Debug, Clone, Copy, Default)]
struct Summary {
    booting: bool,
    booted: bool,
    service_pid: Option<u32>,
}

struct Initialization {
    generation: u64,
    outcome: InitOutcome,
}

struct Inner {
    sandbox: Arc<dyn Sandbox>,
    tree: FileSystemTree,
    config: SessionConfig,
    latch: BootLatch,
    sink: Arc<dyn OutputSink>,
    state: Mutex<SessionState>,
    summary: watch::Sender<Summary>,
    initialization: StdMutex<Option<Initialization>>,
    generation: AtomicU64,
    epoch: AtomicU64,
    disposing: watch::Sender<bool>,
    installing: AtomicBool,
    on_ready: Arc<StdMutex<Option<ReadyCallback>>>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poison| poison.into_inner())
}

/// Builds a [`SessionController`].
pub struct SessionBuilder {
    sandbox: Arc<dyn Sandbox>,
    tree: FileSystemTree,
    config: SessionConfig,
    latch: BootLatch,
    sink: Arc<dyn OutputSink>,
}

impl SessionBuilder {
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Share the boot-once flag with other controllers of the same page.
    pub fn boot_latch(mut self, latch: BootLatch) -> Self {
        self.latch = latch;
        self
    }

    pub fn output_sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn build(self) -> SessionController {
        let (disposing, _) = watch::channel(false);
        let (summary, _) = watch::channel(Summary::default());
        SessionController {
            inner: Arc::new(Inner {
                sandbox: self.sandbox,
                tree: self.tree,
                config: self.config,
                latch: self.latch,
                sink: self.sink,
                state: Mutex::new(SessionState::default()),
                summary,
                initialization: StdMutex::new(None),
                generation: AtomicU64::new(0),
                epoch: AtomicU64::new(0),
                disposing,
                installing: AtomicBool::new(false),
                on_ready: Arc::new(StdMutex::new(None)),
            }),
        }
    }
}

/// Handle to one session. Clones share the same session.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    pub fn builder(sandbox: Arc<dyn Sandbox>, tree: FileSystemTree) -> SessionBuilder {
        SessionBuilder {
            sandbox,
            tree,
            config: SessionConfig::default(),
            latch: BootLatch::new(),
            sink: Arc::new(TracingSink),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn boot_latch(&self) -> &BootLatch {
        &self.inner.latch
    }

    /// Boot the sandbox and mount the file tree, or join the attempt already
    /// in flight. After `Ok`, the environment is booted and mounted.
    pub async fn initialize(&self) -> SessionResult<()> {
        // A disposal clears the memoized outcome when it finishes.
        self.inner.wait_for_disposal().await?;
        let outcome = {
            let mut slot = lock(&self.inner.initialization);
            match slot.as_ref() {
                Some(init) => init.outcome.clone(),
                None => {
                    let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    let inner = Arc::clone(&self.inner);
                    // Spawned so the attempt settles even if every caller goes away.
                    let task = tokio::spawn(inner.run_initialization(generation));
                    let outcome = async move {
                        task.await.unwrap_or_else(|e| {
                            Err(SessionError::BootFailed(format!("initialization task: {e}")))
                        })
                    }
                    .boxed()
                    .shared();
                    *slot = Some(Initialization {
                        generation,
                        outcome: outcome.clone(),
                    });
                    outcome
                }
            }
        };
        outcome.await
    }

    /// Run the install command and return its exit code.
    ///
    /// A second call while one is running fails with `InstallInProgress`
    /// instead of spawning another installer.
    pub async fn install_dependencies(&self) -> SessionResult<i32> {
        let inner = &self.inner;
        let state = inner.settled_state().await?;
        let environment = state
            .environment
            .clone()
            .ok_or(SessionError::NotInitialized)?;

        if inner.installing.swap(true, Ordering::SeqCst) {
            return Err(SessionError::InstallInProgress);
        }
        let _installing = InstallGuard(&inner.installing);

        // The state lock keeps a disposal out until the installer is
        // registered with the environment, where the disposal sweep finds it.
        let command = &inner.config.install;
        let mut process = spawn(environment.as_ref(), command, false).await?;
        info!(pid = process.id(), command = %command.display(), "Installing dependencies");

        if let Some(output) = process.take_output() {
            tokio::spawn(pipe_output(output, Arc::clone(&inner.sink), OutputKind::Install));
        }
        drop(state);

        let code = process
            .wait()
            .await
            .map_err(|e| SessionError::Process(e.to_string()))?;
        info!(code, "Dependency installation finished");
        Ok(code)
    }

    /// Start the dev server, replacing any running one. `on_ready` is called
    /// with the URL each time the environment reports a reachable server.
    pub async fn start_dev_server<F>(&self, on_ready: F) -> SessionResult<()>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let inner = &self.inner;
        let mut state = inner.settled_state().await?;
        let environment = state
            .environment
            .clone()
            .ok_or(SessionError::NotInitialized)?;

        if let Some(mut previous) = state.service.take() {
            let pid = previous.id();
            info!(pid, "Stopping previous dev server");
            if let Err(e) = previous.kill().await {
                warn!(pid, error = %e, "Failed to stop dev server");
            }
            *lock(&inner.on_ready) = None;
            inner.publish(&state);
        }

        if state.ready_relay.is_none() {
            state.ready_relay = Some(spawn_ready_relay(
                environment.subscribe_ready(),
                Arc::clone(&inner.on_ready),
            ));
        }

        let command = &inner.config.server;
        let mut process = spawn(environment.as_ref(), command, true)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to start dev server");
                e
            })?;
        info!(pid = process.id(), command = %command.display(), "Dev server started");

        let callback: ReadyCallback = Arc::new(on_ready);
        *lock(&inner.on_ready) = Some(callback);
        if let Some(output) = process.take_output() {
            tokio::spawn(pipe_output(output, Arc::clone(&inner.sink), OutputKind::Server));
        }
        state.service = Some(process);
        inner.publish(&state);
        Ok(())
    }

    /// Initialize, install, and start the dev server. A non-zero install
    /// exit code stops the sequence with `InstallFailed`.
    pub async fn bootstrap<F>(&self, on_ready: F) -> SessionResult<()>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.initialize().await?;
        let code = self.install_dependencies().await?;
        if code != 0 {
            return Err(SessionError::InstallFailed { code });
        }
        self.start_dev_server(on_ready).await
    }

    /// Tear down the session. Every step is best-effort and logged; this
    /// never fails and may be called in any state.
    pub async fn dispose(&self) {
        let inner = &self.inner;
        if inner.disposing.send_replace(true) {
            debug!("Disposal already in progress, waiting for it");
            let mut rx = inner.disposing.subscribe();
            let _ = rx.wait_for(|disposing| !*disposing).await;
            return;
        }
        let _disposing = DisposeGuard(&inner.disposing);

        let mut state = inner.state.lock().await;

        if let Some(mut service) = state.service.take() {
            let pid = service.id();
            if let Err(e) = service.kill().await {
                warn!(pid, error = %e, "Failed to stop dev server during disposal");
            }
            inner.publish(&state);
        }

        if let Some(relay) = state.ready_relay.take() {
            relay.abort();
        }

        if let Some(environment) = state.environment.take() {
            if inner.config.sweep_processes {
                let processes = environment.processes().await;
                let kills = processes.iter().map(|p| {
                    let environment = Arc::clone(&environment);
                    async move {
                        if let Err(e) = environment.kill(p.pid).await {
                            warn!(pid = p.pid, command = %p.command, error = %e, "Failed to kill process");
                        }
                    }
                });
                join_all(kills).await;
            }
            if let Err(e) = environment.teardown().await {
                warn!(error = %e, "Failed to tear down environment");
            }
            if inner.config.boot_policy == BootPolicy::ResetOnDispose {
                inner.latch.release();
            }
            info!("Session disposed");
        }
        inner.publish(&state);

        *lock(&inner.initialization) = None;
        *lock(&inner.on_ready) = None;
    }

    pub async fn status(&self) -> SessionStatus {
        let inner = &self.inner;
        let disposing = *inner.disposing.borrow();
        let pending = self.initialization_pending();
        let Summary {
            booting,
            booted,
            service_pid,
        } = *inner.summary.borrow();

        let phase = if disposing {
            SessionPhase::Disposing
        } else if booted {
            SessionPhase::Ready
        } else if booting || pending {
            SessionPhase::Booting
        } else {
            SessionPhase::Unbooted
        };

        SessionStatus {
            phase,
            booted,
            service_pid,
            disposing,
            epoch: inner.epoch.load(Ordering::SeqCst),
        }
    }

    fn initialization_pending(&self) -> bool {
        lock(&self.inner.initialization)
            .as_ref()
            .map(|init| init.outcome.peek().is_none())
            .unwrap_or(false)
    }
}

impl Inner {
    async fn run_initialization(self: Arc<Self>, generation: u64) -> SessionResult<()> {
        let result = self.boot_and_mount().await;
        if let Err(e) = &result {
            warn!(error = %e, "Initialization failed");
            let mut slot = lock(&self.initialization);
            if slot.as_ref().map(|init| init.generation) == Some(generation) {
                *slot = None;
            }
        }
        result
    }

    async fn boot_and_mount(&self) -> SessionResult<()> {
        let mut state = self.settled_state().await?;
        if state.environment.is_some() {
            return Ok(());
        }
        if !self.latch.try_acquire() {
            return Err(SessionError::AlreadyBooted);
        }

        state.booting = true;
        self.publish(&state);
        info!("Booting sandbox");
        let environment = match self.sandbox.boot().await {
            Ok(environment) => environment,
            Err(e) => {
                state.booting = false;
                self.publish(&state);
                self.latch.release();
                return Err(SessionError::BootFailed(e.to_string()));
            }
        };

        if let Err(e) = environment.mount(&self.tree).await {
            state.booting = false;
            self.publish(&state);
            if let Err(teardown) = environment.teardown().await {
                warn!(error = %teardown, "Failed to tear down partially initialized environment");
            }
            if self.config.boot_policy == BootPolicy::ResetOnDispose {
                self.latch.release();
            }
            return Err(SessionError::MountFailed(e.to_string()));
        }

        state.booting = false;
        state.environment = Some(environment);
        self.publish(&state);
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        info!(epoch, entries = self.tree.len(), "Sandbox booted and mounted");
        Ok(())
    }

    /// Lock the state once no disposal is running. A disposal that started
    /// while we waited for the lock gets the lock first.
    async fn settled_state(&self) -> SessionResult<StateGuard<'_, SessionState>> {
        loop {
            self.wait_for_disposal().await?;
            let state = self.state.lock().await;
            if !*self.disposing.borrow() {
                return Ok(state);
            }
        }
    }

    async fn wait_for_disposal(&self) -> SessionResult<()> {
        let mut rx = self.disposing.subscribe();
        if !*rx.borrow_and_update() {
            return Ok(());
        }
        debug!("Waiting for disposal to finish");
        let settled = tokio::time::timeout(
            self.config.dispose_wait(),
            rx.wait_for(|disposing| !*disposing),
        )
        .await
        .is_ok();
        if settled {
            Ok(())
        } else {
            Err(SessionError::DisposalTimeout)
        }
    }

    fn publish(&self, state: &SessionState) {
        self.summary.send_replace(state.summary());
    }
}

async fn spawn(
    environment: &dyn Environment,
    command: &CommandSpec,
    service: bool,
) -> SessionResult<Box<dyn ProcessHandle>> {
    let spawned = if service {
        environment.spawn_service(&command.program, &command.args).await
    } else {
        environment.spawn(&command.program, &command.args).await
    };
    spawned.map_err(|e| SessionError::SpawnFailed {
            command: command.display(),
            reason: e.to_string(),
        })
}

fn spawn_ready_relay(
    mut events: broadcast::Receiver<ReadyEvent>,
    callback: Arc<StdMutex<Option<ReadyCallback>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    info!(port = event.port, url = %event.url, "Dev server ready");
                    let current = lock(&callback).clone();
                    if let Some(on_ready) = current {
                        on_ready(&event.url);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Missed readiness events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

struct InstallGuard<'a>(&'a AtomicBool);

impl Drop for InstallGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct DisposeGuard<'a>(&'a watch::Sender<bool>);

impl Drop for DisposeGuard<'_> {
    fn drop(&mut self) {
        self.0.send_replace(false);
    }
}
