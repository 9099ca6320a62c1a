//! Daemon orchestrator for wiring together all components.
//!
//! The `DaemonOrchestrator` owns the session registry and the room
//! broadcaster, and serves IPC connections on the daemon socket until it is
//! stopped.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::ipc::{
    IpcConnection, IpcError, IpcErrorKind, IpcRequest, IpcResponse, IpcServer, ResponseWriter,
};
use crate::session::{
    Broadcaster, ClientId, DriverFactory, PtyDriverFactory, RoomBroadcaster, RoomEvent, SessionId,
    SessionRegistry,
};

/// Requests buffered between a connection's reader task and its handler.
const REQUEST_QUEUE_SIZE: usize = 16;

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Binding the socket.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// A session was started or restarted over IPC.
    SessionStarted { session_id: SessionId },
    /// A session was terminated over IPC.
    SessionTerminated { session_id: SessionId },
    /// An IPC connection joined a room.
    ClientAttached {
        session_id: SessionId,
        client_id: ClientId,
    },
    /// An attached connection left its room.
    ClientDetached {
        session_id: SessionId,
        client_id: ClientId,
    },
    /// A client asked the daemon to stop.
    StopRequested,
    /// Error occurred.
    Error { message: String },
}

/// Everything a connection handler needs, shared by all connections.
struct ConnectionContext {
    registry: Arc<SessionRegistry>,
    rooms: Arc<RoomBroadcaster>,
    started_at: Instant,
    shutdown_token: CancellationToken,
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

/// The room a connection is attached to.
struct Attachment {
    session_id: SessionId,
    client_id: ClientId,
    events: mpsc::Receiver<RoomEvent>,
    /// The room's `Closed` event has been forwarded.
    closed: bool,
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    /// Configuration.
    config: Config,
    socket_path: PathBuf,
    /// Current state.
    state: Arc<RwLock<OrchestratorState>>,
    registry: Arc<SessionRegistry>,
    rooms: Arc<RoomBroadcaster>,
    started_at: Instant,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
    /// Event sender.
    event_tx: broadcast::Sender<OrchestratorEvent>,
    accept_task: Option<JoinHandle<()>>,
}

impl DaemonOrchestrator {
    /// Creates an orchestrator whose sessions run on real pseudo-terminals.
    pub fn new(config: Config, socket_path: impl Into<PathBuf>) -> Self {
        let drivers = Arc::new(PtyDriverFactory::new(config.driver_defaults()));
        Self::with_driver_factory(config, socket_path, drivers)
    }

    /// Creates an orchestrator that builds drivers with `drivers`.
    pub fn with_driver_factory(
        config: Config,
        socket_path: impl Into<PathBuf>,
        drivers: Arc<dyn DriverFactory>,
    ) -> Self {
        let rooms = Arc::new(RoomBroadcaster::new());
        let broadcaster: Arc<dyn Broadcaster> = rooms.clone();
        let registry = Arc::new(SessionRegistry::new(
            config.registry_settings(),
            config.output_filter(),
            broadcaster,
            drivers,
        ));

        let (event_tx, _) = broadcast::channel(256);

        Self {
            config,
            socket_path: socket_path.into(),
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            registry,
            rooms,
            started_at: Instant::now(),
            shutdown_token: CancellationToken::new(),
            event_tx,
            accept_task: None,
        }
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn rooms(&self) -> &Arc<RoomBroadcaster> {
        &self.rooms
    }

    /// Returns the shutdown token. It is cancelled by `stop()` and by a
    /// client's `Stop` request.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Binds the IPC socket and starts serving connections.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            if self.shutdown_token.is_cancelled() {
                anyhow::bail!("Orchestrator cannot be restarted after shutdown");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!(socket = %self.socket_path.display(), "Starting daemon orchestrator...");

        let server = match IpcServer::bind(&self.socket_path)
            .await
            .with_context(|| format!("Failed to bind socket {}", self.socket_path.display()))
        {
            Ok(server) => server,
            Err(e) => {
                *self.state.write().await = OrchestratorState::Stopped;
                self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));
                return Err(e);
            }
        };

        self.started_at = Instant::now();
        let context = Arc::new(ConnectionContext {
            registry: Arc::clone(&self.registry),
            rooms: Arc::clone(&self.rooms),
            started_at: self.started_at,
            shutdown_token: self.shutdown_token.clone(),
            event_tx: self.event_tx.clone(),
        });
        self.accept_task = Some(tokio::spawn(Self::accept_loop(server, context)));

        {
            let mut state = self.state.write().await;
            *state = OrchestratorState::Running;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!(
            capacity = self.registry.capacity(),
            "Daemon orchestrator started successfully"
        );
        Ok(())
    }

    /// Accepts connections until shutdown. The server, and with it the
    /// socket file, is dropped when the loop ends.
    async fn accept_loop(server: IpcServer, context: Arc<ConnectionContext>) {
        loop {
            tokio::select! {
                _ = context.shutdown_token.cancelled() => {
                    debug!("Accept loop received shutdown signal");
                    break;
                }
                accepted = server.accept() => match accepted {
                    Ok(connection) => {
                        debug!("Accepted IPC connection");
                        tokio::spawn(Self::handle_connection(connection, Arc::clone(&context)));
                    }
                    Err(e) => {
                        error!("Failed to accept IPC connection: {}", e);
                        let _ = context.event_tx.send(OrchestratorEvent::Error {
                            message: format!("accept failed: {}", e),
                        });
                    }
                },
            }
        }
    }

    /// Serves one connection: answers requests in order and, once attached,
    /// forwards the room's events as they arrive.
    async fn handle_connection(connection: IpcConnection, context: Arc<ConnectionContext>) {
        let (mut reader, mut writer) = connection.into_split();

        // Reads stay in their own task; `read_line` is not cancel safe.
        let (request_tx, mut request_rx) = mpsc::channel(REQUEST_QUEUE_SIZE);
        let reader_task = tokio::spawn(async move {
            loop {
                match reader.read_request().await {
                    Ok(Some(request)) => {
                        if request_tx.send(Ok(request)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let fatal = matches!(e, IpcError::Io(_));
                        if request_tx.send(Err(e)).await.is_err() || fatal {
                            break;
                        }
                    }
                }
            }
        });

        let mut attachment: Option<Attachment> = None;

        loop {
            tokio::select! {
                _ = context.shutdown_token.cancelled() => break,
                request = request_rx.recv() => {
                    let response = match request {
                        None => break,
                        Some(Err(IpcError::Io(e))) => {
                            debug!("IPC read failed: {}", e);
                            break;
                        }
                        Some(Err(e)) => {
                            IpcResponse::error(IpcErrorKind::InvalidRequest, e.to_string())
                        }
                        Some(Ok(IpcRequest::Stop)) => {
                            info!("Stop requested over IPC");
                            let _ = writer.send_response(&IpcResponse::Stopping).await;
                            let _ = context.event_tx.send(OrchestratorEvent::StopRequested);
                            context.shutdown_token.cancel();
                            break;
                        }
                        Some(Ok(IpcRequest::Attach { session_id, client_id })) => {
                            context.attach(&mut attachment, session_id, client_id)
                        }
                        Some(Ok(request)) => context.handle_request(request).await,
                    };
                    if !send(&mut writer, &response).await {
                        break;
                    }
                }
                event = next_event(&mut attachment) => match event {
                    Some(event) => {
                        if let (RoomEvent::Closed { .. }, Some(current)) = (&event, attachment.as_mut()) {
                            current.closed = true;
                        }
                        if !send(&mut writer, &IpcResponse::Event { event }).await {
                            break;
                        }
                    }
                    // Out of the room; the connection stays usable for requests.
                    None => {
                        let dropped = attachment
                            .as_ref()
                            .filter(|current| !current.closed)
                            .map(|current| RoomEvent::Dropped {
                                session_id: current.session_id.clone(),
                            });
                        context.forget(&mut attachment);
                        if let Some(event) = dropped {
                            if !send(&mut writer, &IpcResponse::Event { event }).await {
                                break;
                            }
                        }
                    }
                },
            }
        }

        context.detach(&mut attachment);
        reader_task.abort();
        debug!("IPC connection closed");
    }

    /// Stops the daemon: closes the socket and terminates every session.
    pub async fn stop(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping daemon orchestrator...");

        // Signal shutdown to all tasks
        self.shutdown_token.cancel();

        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                warn!("Accept loop ended abnormally: {}", e);
            }
        }

        self.registry.shutdown();

        {
            let mut state = self.state.write().await;
            *state = OrchestratorState::Stopped;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Daemon orchestrator stopped");
        Ok(())
    }

    /// Emits an orchestrator event.
    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl ConnectionContext {
    async fn handle_request(&self, request: IpcRequest) -> IpcResponse {
        match request {
            IpcRequest::Ping => IpcResponse::Pong,
            IpcRequest::Status => IpcResponse::Status {
                running: !self.shutdown_token.is_cancelled(),
                uptime_secs: self.started_at.elapsed().as_secs(),
                session_count: self.registry.len(),
                capacity: self.registry.capacity(),
            },
            IpcRequest::ListSessions => IpcResponse::Sessions {
                sessions: self.registry.list(),
            },
            IpcRequest::StartSession { session_id, params } => {
                match self.registry.start_session(&session_id, &params).await {
                    Ok(session) => {
                        self.emit(OrchestratorEvent::SessionStarted { session_id });
                        IpcResponse::SessionStarted {
                            session: session.summary(),
                        }
                    }
                    Err(e) => IpcResponse::from(&e),
                }
            }
            IpcRequest::RestartSession { session_id, params } => {
                match self.registry.restart_session(&session_id, &params).await {
                    Ok(session) => {
                        self.emit(OrchestratorEvent::SessionStarted { session_id });
                        IpcResponse::SessionStarted {
                            session: session.summary(),
                        }
                    }
                    Err(e) => IpcResponse::from(&e),
                }
            }
            IpcRequest::StopSession { session_id } => {
                self.on_blocking_pool(move |registry| match registry.stop_session(&session_id) {
                    Ok(()) => IpcResponse::SessionStopped { session_id },
                    Err(e) => IpcResponse::from(&e),
                })
                .await
            }
            IpcRequest::TerminateSession { session_id } => {
                let target = session_id.clone();
                let response = self
                    .on_blocking_pool(move |registry| {
                        registry.terminate(&target);
                        IpcResponse::SessionTerminated { session_id: target }
                    })
                    .await;
                if matches!(response, IpcResponse::SessionTerminated { .. }) {
                    self.emit(OrchestratorEvent::SessionTerminated { session_id });
                }
                response
            }
            IpcRequest::SendInput { session_id, text } => {
                self.on_blocking_pool(move |registry| match registry.send_input(&session_id, &text) {
                    Ok(()) => IpcResponse::InputSent { session_id },
                    Err(e) => IpcResponse::from(&e),
                })
                .await
            }
            IpcRequest::Broadcast { targets, inputs } => {
                self.on_blocking_pool(move |registry| IpcResponse::Broadcasted {
                    report: registry.broadcast(targets.as_deref(), &inputs),
                })
                .await
            }
            IpcRequest::GetHistory { session_id } => match self.registry.history(&session_id) {
                Ok(chunks) => IpcResponse::History { session_id, chunks },
                Err(e) => IpcResponse::from(&e),
            },
            IpcRequest::Stop | IpcRequest::Attach { .. } => IpcResponse::error(
                IpcErrorKind::InvalidRequest,
                "request must be handled by the connection",
            ),
        }
    }

    /// Runs a registry call that takes driver locks off the async workers.
    async fn on_blocking_pool<F>(&self, f: F) -> IpcResponse
    where
        F: FnOnce(&SessionRegistry) -> IpcResponse + Send + 'static,
    {
        let registry = Arc::clone(&self.registry);
        tokio::task::spawn_blocking(move || f(&registry))
            .await
            .unwrap_or_else(|e| {
                error!("Registry task failed: {}", e);
                IpcResponse::error(IpcErrorKind::Internal, format!("request task failed: {}", e))
            })
    }

    /// Joins the connection to a session's room, leaving any previous one.
    fn attach(
        &self,
        attachment: &mut Option<Attachment>,
        session_id: SessionId,
        client_id: Option<ClientId>,
    ) -> IpcResponse {
        let session = match self.registry.get(&session_id) {
            Ok(session) => session,
            Err(e) => return IpcResponse::from(&e),
        };

        self.detach(attachment);

        let client_id = client_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let events = self.rooms.observe(&session, client_id.clone());
        info!(session_id = %session_id, client_id = %client_id, "Client attached");
        self.emit(OrchestratorEvent::ClientAttached {
            session_id: session_id.clone(),
            client_id: client_id.clone(),
        });

        *attachment = Some(Attachment {
            session_id: session_id.clone(),
            client_id: client_id.clone(),
            events,
            closed: false,
        });
        IpcResponse::Attached {
            session_id,
            client_id,
        }
    }

    fn detach(&self, attachment: &mut Option<Attachment>) {
        if let Some(current) = attachment.as_ref() {
            self.rooms.leave(&current.session_id, &current.client_id);
        }
        self.forget(attachment);
    }

    /// Drops the attachment without touching the room, for observers the
    /// room has already let go of.
    fn forget(&self, attachment: &mut Option<Attachment>) {
        if let Some(Attachment {
            session_id,
            client_id,
            ..
        }) = attachment.take()
        {
            debug!(session_id = %session_id, client_id = %client_id, "Client detached");
            self.emit(OrchestratorEvent::ClientDetached {
                session_id,
                client_id,
            });
        }
    }

    fn emit(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// Next event of the attached room. Pending forever when not attached.
async fn next_event(attachment: &mut Option<Attachment>) -> Option<RoomEvent> {
    match attachment {
        Some(attachment) => attachment.events.recv().await,
        None => std::future::pending().await,
    }
}

/// Writes a response. Returns `false` once the client is gone.
async fn send(writer: &mut ResponseWriter, response: &IpcResponse) -> bool {
    match writer.send_response(response).await {
        Ok(()) => true,
        Err(e) => {
            debug!("Failed to write IPC response: {}", e);
            false
        }
    }
}
