//! Execution context handle and its lifecycle state machine.
//!
//! ```text
//! Uninitialized --initialize--> Loading --ok--> Ready <--send--> Busy
//!                                  |                  \          /
//!                                  +--fail--> Errored <--fault--+
//! any --terminate--> Terminated (final)
//! Uninitialized/Ready/Busy/Errored --restart--> Loading
//! Busy --request timeout--> Loading (the stalled context is replaced)
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use super::collaborator::CollaboratorFactory;
use super::worker::{spawn_context, ContextCommand, ContextEvent, SpawnedContext};
use crate::config::{ContextConfig, RpcConfig};
use crate::protocol::{ImagePayload, Operation, ResponseData};
use crate::rpc::{CorrelationRegistry, RpcChannel, RpcError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContextState {
    Uninitialized,
    Loading,
    Ready,
    Busy,
    Errored,
    Terminated,
}

/// Why a handle is `Errored`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextFault {
    Initialization(String),
    Transport(String),
}

struct Lifecycle {
    state: ContextState,
    fault: Option<ContextFault>,
    /// Bumped whenever the running context is replaced or torn down, so that stale pumps
    /// and guards leave the current context alone.
    generation: u64,
    channel: Option<RpcChannel>,
}

struct Shared {
    name: Arc<str>,
    lifecycle: Mutex<Lifecycle>,
}

impl Shared {
    fn unavailable(&self, lifecycle: &Lifecycle) -> RpcError {
        match (&lifecycle.state, &lifecycle.fault) {
            (ContextState::Terminated, _) => RpcError::Terminated {
                context: self.name.to_string(),
            },
            (_, Some(ContextFault::Initialization(cause))) => {
                RpcError::InitializationFailure(cause.clone())
            }
            (_, Some(ContextFault::Transport(cause))) => RpcError::TransportError(cause.clone()),
            (ContextState::Busy, None) => RpcError::ChannelBusy {
                context: self.name.to_string(),
            },
            _ => RpcError::ChannelNotReady {
                context: self.name.to_string(),
            },
        }
    }

    /// Moves a live context to `Errored`. Returns false if `generation` is stale.
    fn mark_faulted(&self, generation: u64, message: &str) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.generation != generation
            || !matches!(lifecycle.state, ContextState::Ready | ContextState::Busy)
        {
            return false;
        }
        lifecycle.state = ContextState::Errored;
        lifecycle.fault = Some(ContextFault::Transport(message.to_string()));
        lifecycle.channel = None;
        true
    }
}

/// Restores `Ready` once the send that made the handle `Busy` settles or is dropped.
struct BusyGuard<'a> {
    shared: &'a Shared,
    generation: u64,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let mut lifecycle = self.shared.lifecycle.lock();
        if lifecycle.generation == self.generation && lifecycle.state == ContextState::Busy {
            lifecycle.state = ContextState::Ready;
        }
    }
}

/// Rolls a half-finished initialization back to `Uninitialized` if its future is dropped.
struct LoadingGuard<'a> {
    shared: &'a Shared,
    generation: u64,
    commands: Option<mpsc::UnboundedSender<ContextCommand>>,
}

impl LoadingGuard<'_> {
    fn disarm(mut self) -> Option<mpsc::UnboundedSender<ContextCommand>> {
        self.commands.take()
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        let Some(commands) = self.commands.take() else {
            return;
        };
        let _ = commands.send(ContextCommand::Shutdown);
        let mut lifecycle = self.shared.lifecycle.lock();
        if lifecycle.generation == self.generation && lifecycle.state == ContextState::Loading {
            lifecycle.state = ContextState::Uninitialized;
            warn!(context = %self.shared.name, "Initialization abandoned before completion");
        }
    }
}

/// Owns one isolated execution context and the channel into it.
pub struct ExecutionContextHandle {
    shared: Arc<Shared>,
    factory: CollaboratorFactory,
    context_config: ContextConfig,
    rpc_config: RpcConfig,
    init_lock: tokio::sync::Mutex<()>,
    /// Queues `submit` callers so the context only ever sees one of them at a time.
    submit_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for ExecutionContextHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContextHandle")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .finish()
    }
}

impl ExecutionContextHandle {
    pub fn new(name: impl Into<Arc<str>>, factory: CollaboratorFactory) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                lifecycle: Mutex::new(Lifecycle {
                    state: ContextState::Uninitialized,
                    fault: None,
                    generation: 0,
                    channel: None,
                }),
            }),
            factory,
            context_config: ContextConfig::default(),
            rpc_config: RpcConfig::default(),
            init_lock: tokio::sync::Mutex::new(()),
            submit_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_context_config(mut self, config: ContextConfig) -> Self {
        self.context_config = config;
        self
    }

    pub fn with_rpc_config(mut self, config: RpcConfig) -> Self {
        self.rpc_config = config;
        self
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> ContextState {
        self.shared.lifecycle.lock().state
    }

    pub fn fault(&self) -> Option<ContextFault> {
        self.shared.lifecycle.lock().fault.clone()
    }

    /// Requests currently awaiting a response on the live channel.
    pub fn pending_requests(&self) -> usize {
        self.shared
            .lifecycle
            .lock()
            .channel
            .as_ref()
            .map(|channel| channel.registry().pending_count())
            .unwrap_or(0)
    }

    /// Starts the context if it has not been started yet.
    ///
    /// Concurrent callers share one initialization. A handle that already failed reports the
    /// stored cause until it is restarted.
    #[instrument(skip(self), fields(context = %self.shared.name))]
    pub async fn initialize(&self) -> Result<(), RpcError> {
        if let Some(settled) = self.settled_initialization() {
            return settled;
        }

        let _init = self.init_lock.lock().await;
        if let Some(settled) = self.settled_initialization() {
            return settled;
        }
        self.start_context().await
    }

    /// Tears down the current context and starts a fresh one.
    #[instrument(skip(self), fields(context = %self.shared.name))]
    pub async fn restart(&self) -> Result<(), RpcError> {
        let _init = self
            .init_lock
            .try_lock()
            .map_err(|_| RpcError::InitializationInProgress {
                context: self.shared.name.to_string(),
            })?;

        self.teardown(ContextState::Uninitialized)?;
        info!("Restarting execution context");
        self.start_context().await
    }

    /// Permanently shuts the context down. Pending requests fail with `Terminated`.
    pub fn terminate(&self) {
        if self.teardown(ContextState::Terminated).is_ok() {
            info!(context = %self.shared.name, "Execution context terminated");
        }
    }

    /// Waits for exclusive use of the handle, then sends one request.
    ///
    /// Unlike [`send`](Self::send), concurrent callers queue instead of failing with
    /// `ChannelBusy`. The context is started on first use, and a context lost to a transport
    /// fault is restarted before the request goes out.
    pub async fn submit(
        &self,
        operation: Operation,
        payload: ImagePayload,
    ) -> Result<ResponseData, RpcError> {
        let _turn = self.submit_lock.lock().await;
        self.ensure_running().await?;
        self.send(operation, payload).await
    }

    async fn ensure_running(&self) -> Result<(), RpcError> {
        match self.fault() {
            Some(ContextFault::Transport(cause)) => {
                info!(context = %self.shared.name, cause = %cause, "Replacing faulted execution context");
                self.restart().await
            }
            _ => self.initialize().await,
        }
    }

    /// Sends one request. The handle is `Busy` until it settles.
    ///
    /// A timed-out request is still running inside the context, so the context is replaced
    /// before the timeout is returned.
    pub async fn send(
        &self,
        operation: Operation,
        payload: ImagePayload,
    ) -> Result<ResponseData, RpcError> {
        let (channel, generation) = {
            let mut lifecycle = self.shared.lifecycle.lock();
            match (lifecycle.state, lifecycle.channel.clone()) {
                (ContextState::Ready, Some(channel)) => {
                    lifecycle.state = ContextState::Busy;
                    (channel, lifecycle.generation)
                }
                _ => return Err(self.shared.unavailable(&lifecycle)),
            }
        };

        let busy = BusyGuard {
            shared: &self.shared,
            generation,
        };
        let result = channel.send(operation, payload).await;
        drop(busy);

        if let Err(RpcError::Timeout { id, timeout_ms }) = &result {
            warn!(
                context = %self.shared.name,
                correlation_id = %id,
                timeout_ms = *timeout_ms,
                "Request timed out, replacing execution context"
            );
            if let Err(e) = self.restart().await {
                warn!(context = %self.shared.name, error = %e, "Could not replace stalled execution context");
            }
        }
        result
    }

    fn settled_initialization(&self) -> Option<Result<(), RpcError>> {
        let lifecycle = self.shared.lifecycle.lock();
        match lifecycle.state {
            ContextState::Ready | ContextState::Busy => Some(Ok(())),
            ContextState::Errored | ContextState::Terminated => {
                Some(Err(self.shared.unavailable(&lifecycle)))
            }
            ContextState::Uninitialized | ContextState::Loading => None,
        }
    }

    /// Drops the live context and moves to `next`. Fails once the handle is terminated.
    fn teardown(&self, next: ContextState) -> Result<(), RpcError> {
        let channel = {
            let mut lifecycle = self.shared.lifecycle.lock();
            if lifecycle.state == ContextState::Terminated {
                return Err(self.shared.unavailable(&lifecycle));
            }
            lifecycle.state = next;
            lifecycle.fault = None;
            lifecycle.generation += 1;
            lifecycle.channel.take()
        };

        if let Some(channel) = channel {
            let rejected = channel.fail_all(RpcError::Terminated {
                context: self.shared.name.to_string(),
            });
            channel.shutdown();
            debug!(context = %self.shared.name, rejected = rejected, "Released execution context");
        }
        Ok(())
    }

    /// Spawns the context thread and waits for its collaborator to initialize.
    /// Callers hold `init_lock`.
    async fn start_context(&self) -> Result<(), RpcError> {
        let generation = {
            let mut lifecycle = self.shared.lifecycle.lock();
            lifecycle.state = ContextState::Loading;
            lifecycle.fault = None;
            lifecycle.generation += 1;
            lifecycle.generation
        };

        let thread_name = format!(
            "{}-{}",
            self.context_config.thread_name_prefix, self.shared.name
        );
        let SpawnedContext {
            commands,
            mut events,
        } = match spawn_context(thread_name, self.factory.clone()) {
            Ok(spawned) => spawned,
            Err(e) => {
                return Err(self.fail_initialization(
                    generation,
                    format!("failed to spawn execution context: {}", e),
                ))
            }
        };

        let guard = LoadingGuard {
            shared: &self.shared,
            generation,
            commands: Some(commands),
        };
        let init_timeout = self.context_config.init_timeout();
        let initialized = match tokio::time::timeout(init_timeout, events.recv()).await {
            Ok(Some(ContextEvent::Initialized(result))) => result,
            Ok(Some(other)) => Err(format!(
                "unexpected event before initialization: {:?}",
                other
            )),
            Ok(None) => Err("execution context exited during initialization".to_string()),
            Err(_) => Err(format!(
                "initialization timed out after {}ms",
                init_timeout.as_millis()
            )),
        };
        let Some(commands) = guard.disarm() else {
            return Err(self.fail_initialization(generation, "initialization guard released"));
        };

        if let Err(cause) = initialized {
            let _ = commands.send(ContextCommand::Shutdown);
            return Err(self.fail_initialization(generation, cause));
        }

        let channel = RpcChannel::new(
            self.shared.name.clone(),
            commands,
            CorrelationRegistry::new(self.rpc_config.default_timeout()),
        );
        {
            let mut lifecycle = self.shared.lifecycle.lock();
            if lifecycle.generation != generation || lifecycle.state != ContextState::Loading {
                drop(lifecycle);
                channel.shutdown();
                return Err(RpcError::Terminated {
                    context: self.shared.name.to_string(),
                });
            }
            lifecycle.state = ContextState::Ready;
            lifecycle.channel = Some(channel.clone());
        }

        tokio::spawn(pump(self.shared.clone(), generation, channel, events));
        info!(context = %self.shared.name, "Execution context ready");
        Ok(())
    }

    fn fail_initialization(&self, generation: u64, cause: impl Into<String>) -> RpcError {
        let cause = cause.into();
        let mut lifecycle = self.shared.lifecycle.lock();
        if lifecycle.generation == generation && lifecycle.state == ContextState::Loading {
            lifecycle.state = ContextState::Errored;
            lifecycle.fault = Some(ContextFault::Initialization(cause.clone()));
            error!(context = %self.shared.name, cause = %cause, "Execution context failed to initialize");
            RpcError::InitializationFailure(cause)
        } else {
            self.shared.unavailable(&lifecycle)
        }
    }
}

impl Drop for ExecutionContextHandle {
    fn drop(&mut self) {
        let _ = self.teardown(ContextState::Terminated);
    }
}

/// Routes events from a running context until it stops.
async fn pump(
    shared: Arc<Shared>,
    generation: u64,
    channel: RpcChannel,
    mut events: mpsc::UnboundedReceiver<ContextEvent>,
) {
    let fault = loop {
        match events.recv().await {
            Some(ContextEvent::Response(frame)) => {
                if let Err(e) = channel.deliver(&frame) {
                    break e.to_string();
                }
            }
            Some(ContextEvent::Fault(message)) => break message,
            Some(ContextEvent::Initialized(_)) => {
                warn!(context = %shared.name, "Ignoring repeated initialization event");
            }
            None => break "execution context exited unexpectedly".to_string(),
        }
    };

    if shared.mark_faulted(generation, &fault) {
        error!(context = %shared.name, fault = %fault, "Execution context faulted");
    }
    // No-op after an intentional teardown, which already rejected everything.
    channel.fail_all(RpcError::TransportError(fault));
    channel.shutdown();
}
