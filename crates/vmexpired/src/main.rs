//! vmexpired - The VM expiration background service
//!
//! This is the main entry point for the vmexpired service.
//! It wires together all the components:
//! - Configuration loading
//! - Store initialization and crash recovery
//! - Adapters (compute deleter, owner notifier)
//! - Task dispatch (inline or worker pool)
//! - Expiration engine, scheduler and creation listener
//! - Control socket

use anyhow::{Context, Result};
use clap::Parser;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use vmexpire_adapter_api::{Deleter, Notifier};
use vmexpire_adapters::{ComputeDeleter, LogNotifier, RelayNotifier};
use vmexpire_api::{
    Command, ErrorCode, ErrorInfo, Event, EventPayload, HealthStatus, Request, Response,
    ResponsePayload, Task, VmCreatedEvent,
};
use vmexpire_config::{load_config, DispatchMode, NotifierConfig, Policy};
use vmexpire_core::{
    Clock, CoreError, CoreEvent, CreationListener, EventSink, ExpirationEngine, InlineDispatcher,
    QueuedDispatcher, Scheduler, SystemClock, TaskDispatcher, TaskExecutor, WorkerPool,
};
use vmexpire_ipc::{IpcServer, ServerMessage};
use vmexpire_store::{AuditEvent, AuditEventType, SqliteStore, Store, TaskQueue};
use vmexpire_util::{default_config_path, ClientId, VmId};

/// Created-VM events buffered between the control socket and the listener
const CREATION_BUFFER: usize = 1024;

/// vmexpired - Expires virtual machines past their allowed lifetime
#[derive(Parser, Debug)]
#[command(name = "vmexpired")]
#[command(about = "Expires virtual machines past their allowed lifetime", long_about = None)]
struct Args {
    /// Configuration file path (default: /etc/vmexpire/vmexpire.toml, else ~/.config/vmexpire/vmexpire.toml)
    #[arg(short, long, default_value_os_t = default_config_path())]
    config: PathBuf,

    /// Socket path override (or set VMEXPIRE_SOCKET env var)
    #[arg(short, long, env = "VMEXPIRE_SOCKET")]
    socket: Option<PathBuf>,

    /// Data directory override (or set VMEXPIRE_DATA_DIR env var)
    #[arg(short, long, env = "VMEXPIRE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

/// Main service state
struct Service {
    store: Arc<SqliteStore>,
    events: EventSink,
    engine: Arc<ExpirationEngine>,
    scheduler: Arc<Scheduler>,
    workers: Option<WorkerPool>,
    listener: CreationListener,
    creations: mpsc::Sender<VmCreatedEvent>,
    ipc: Arc<IpcServer>,
    clock: Arc<dyn Clock>,
}

impl Service {
    async fn new(args: &Args) -> Result<Self> {
        let policy = if args.config.exists() {
            load_config(&args.config)
                .with_context(|| format!("Failed to load config from {:?}", args.config))?
        } else {
            warn!(config_path = %args.config.display(), "Configuration file not found, using defaults");
            Policy::default()
        };

        info!(
            config_path = %args.config.display(),
            dispatch_mode = ?policy.dispatch.mode,
            max_duration_days = policy.expiration.max_duration_days,
            "Configuration loaded"
        );

        let socket_path = args
            .socket
            .clone()
            .unwrap_or_else(|| policy.service.socket_path.clone());

        let data_dir = args
            .data_dir
            .clone()
            .unwrap_or_else(|| policy.service.data_dir.clone());

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;

        let db_path = data_dir.join("vmexpired.db");
        let store = Arc::new(
            SqliteStore::open(&db_path)
                .with_context(|| format!("Failed to open database {:?}", db_path))?,
        );
        info!(db_path = %db_path.display(), "Store initialized");

        store.append_audit(AuditEvent::new(AuditEventType::ServiceStarted))?;

        let notifier = build_notifier(&policy)?;
        let deleter: Arc<dyn Deleter> = Arc::new(
            ComputeDeleter::new(
                policy.compute.url.clone(),
                policy.compute.auth_token.clone(),
                policy.adapters.call_timeout,
            )
            .context("Failed to create compute client")?,
        );
        info!(compute_url = %policy.compute.url, "Compute deleter initialized");

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let events = EventSink::default();
        let executor = Arc::new(TaskExecutor::new(
            policy.expiration.clone(),
            store.clone(),
            notifier,
            deleter,
            policy.adapters.call_timeout,
            clock.clone(),
            events.clone(),
        ));

        let (dispatcher, wake, outstanding) = build_dispatcher(&policy, &store, &executor, &events)?;

        let engine = Arc::new(ExpirationEngine::new(
            policy.expiration.clone(),
            &policy.scheduler,
            store.clone(),
            dispatcher.clone(),
            events.clone(),
        ));

        let recovered = engine
            .recover_interrupted(&outstanding, clock.now())
            .context("Failed to recover interrupted deletions")?;
        if recovered > 0 {
            warn!(recovered, "Rolled back deletions interrupted by a previous run");
        }

        // Workers start after recovery so they never race the rollback
        let workers = wake.map(|wake| {
            WorkerPool::start(
                policy.dispatch.workers,
                store.clone(),
                executor.clone(),
                wake,
                policy.dispatch.poll_interval,
                policy.dispatch.drain_timeout,
            )
        });

        let scheduler = Arc::new(Scheduler::new(
            engine.clone(),
            clock.clone(),
            policy.scheduler.tick_interval,
        ));
        let (creations, listener) = CreationListener::new(CREATION_BUFFER, dispatcher);

        let mut ipc = IpcServer::new(&socket_path);
        ipc.start().await?;
        info!(socket_path = %socket_path.display(), "Control socket started");

        Ok(Self {
            store,
            events,
            engine,
            scheduler,
            workers,
            listener,
            creations,
            ipc: Arc::new(ipc),
            clock,
        })
    }

    async fn run(self) -> Result<()> {
        let ipc = self.ipc.clone();
        let mut ipc_messages = ipc
            .take_message_receiver()
            .await
            .context("Control socket message receiver already taken")?;
        let mut core_events = self.events.subscribe();

        let ipc_accept = ipc.clone();
        let accept_handle = tokio::spawn(async move {
            if let Err(e) = ipc_accept.run().await {
                error!(error = %e, "Control socket error");
            }
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scheduler_handle = tokio::spawn(self.scheduler.clone().run(shutdown_rx.clone()));
        let listener_handle = tokio::spawn(self.listener.run(shutdown_rx));

        let handler = Handler {
            engine: self.engine.clone(),
            scheduler: self.scheduler.clone(),
            store: self.store.clone(),
            ipc: ipc.clone(),
            creations: self.creations.clone(),
            clock: self.clock.clone(),
        };

        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to create SIGTERM handler")?;
        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to create SIGINT handler")?;

        info!("Service running");

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down gracefully");
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down gracefully");
                    break;
                }

                event = core_events.recv() => match event {
                    Ok(event) => ipc.broadcast_event(Event::new(event_payload(event))),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Event forwarding fell behind, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },

                Some(msg) = ipc_messages.recv() => {
                    handler.handle_message(msg).await;
                }
            }
        }

        info!("Shutting down vmexpired");

        let _ = shutdown_tx.send(true);
        for (name, handle) in [("scheduler", scheduler_handle), ("listener", listener_handle)] {
            if let Err(e) = handle.await {
                warn!(task = name, error = %e, "Task did not stop cleanly");
            }
        }

        // Drain in-flight tasks before the store goes away
        if let Some(workers) = self.workers {
            workers.shutdown().await;
        }

        ipc.broadcast_event(Event::new(EventPayload::Shutdown));

        if let Err(e) = self
            .store
            .append_audit(AuditEvent::new(AuditEventType::ServiceStopped))
        {
            warn!(error = %e, "Failed to log service shutdown");
        }

        accept_handle.abort();
        ipc.shutdown();

        info!("Shutdown complete");
        Ok(())
    }
}

fn build_notifier(policy: &Policy) -> Result<Arc<dyn Notifier>> {
    match &policy.notifier {
        NotifierConfig::Log => {
            info!("Owner messages go to the service log");
            Ok(Arc::new(LogNotifier::new()))
        }
        NotifierConfig::Relay {
            url,
            from,
            auth_token,
        } => {
            info!(relay_url = %url, "Owner messages go to the mail relay");
            let notifier = RelayNotifier::new(
                url.clone(),
                from.clone(),
                auth_token.clone(),
                policy.adapters.call_timeout,
            )
            .context("Failed to create mail relay client")?;
            Ok(Arc::new(notifier))
        }
    }
}

/// Pick the dispatcher for the configured mode.
///
/// Queued mode also returns the workers' wake handle and the VMs whose delete
/// task survived in the queue, which recovery must leave alone.
fn build_dispatcher(
    policy: &Policy,
    store: &Arc<SqliteStore>,
    executor: &Arc<TaskExecutor>,
    events: &EventSink,
) -> Result<(Arc<dyn TaskDispatcher>, Option<Arc<Notify>>, HashSet<VmId>)> {
    match policy.dispatch.mode {
        DispatchMode::Inline => {
            info!("Tasks run inline");
            let dispatcher: Arc<dyn TaskDispatcher> =
                Arc::new(InlineDispatcher::new(executor.clone()));
            Ok((dispatcher, None, HashSet::new()))
        }
        DispatchMode::Queued => {
            let requeued = store
                .requeue_claimed()
                .context("Failed to requeue claimed tasks")?;
            if requeued > 0 {
                warn!(requeued, "Requeued tasks claimed by a previous run");
            }

            let outstanding = store
                .list_pending()
                .context("Failed to read task queue")?
                .into_iter()
                .filter_map(|queued| match queued.task {
                    Task::DeleteVm { vm_id } => Some(vm_id),
                    _ => None,
                })
                .collect();

            let queue: Arc<dyn TaskQueue> = store.clone();
            let queued = QueuedDispatcher::new(queue, events.clone());
            let wake = queued.wake_handle();
            info!(workers = policy.dispatch.workers, "Tasks go through the durable queue");

            let dispatcher: Arc<dyn TaskDispatcher> = Arc::new(queued);
            Ok((dispatcher, Some(wake), outstanding))
        }
    }
}

/// Answers control socket requests
#[derive(Clone)]
struct Handler {
    engine: Arc<ExpirationEngine>,
    scheduler: Arc<Scheduler>,
    store: Arc<SqliteStore>,
    ipc: Arc<IpcServer>,
    creations: mpsc::Sender<VmCreatedEvent>,
    clock: Arc<dyn Clock>,
}

impl Handler {
    async fn handle_message(&self, msg: ServerMessage) {
        match msg {
            ServerMessage::Request { client_id, request } => {
                // Sweeps and inline adapter calls can be slow; keep the loop free
                let handler = self.clone();
                tokio::spawn(async move {
                    let request_id = request.request_id;
                    let response = handler.handle_request(&client_id, request).await;
                    if let Err(e) = handler.ipc.send_response(&client_id, response).await {
                        debug!(client_id = %client_id, request_id, error = %e, "Response not delivered");
                    }
                });
            }

            ServerMessage::ClientConnected { client_id, info } => {
                debug!(client_id = %client_id, role = ?info.role, uid = ?info.uid, "Client registered");
            }

            ServerMessage::ClientDisconnected { client_id } => {
                debug!(client_id = %client_id, "Client disconnected");
            }
        }
    }

    async fn handle_request(&self, client_id: &ClientId, request: Request) -> Response {
        let request_id = request.request_id;

        if request.command.requires_admin() {
            let is_admin = self
                .ipc
                .get_client_info(client_id)
                .await
                .is_some_and(|info| info.role.can_manage_exclusions());
            if !is_admin {
                warn!(client_id = %client_id, command = ?request.command, "Admin command refused");
                return Response::error(
                    request_id,
                    ErrorInfo::new(ErrorCode::PermissionDenied, "Admin role required"),
                );
            }
        }

        match self.handle_command(client_id, request.command).await {
            Ok(payload) => Response::success(request_id, payload),
            Err(e) => Response::error(request_id, error_info(&e)),
        }
    }

    async fn handle_command(
        &self,
        client_id: &ClientId,
        command: Command,
    ) -> Result<ResponsePayload, CoreError> {
        let now = self.clock.now();

        match command {
            Command::ListVms { page } => Ok(ResponsePayload::Vms(
                self.engine.list_vms(page.clamped())?,
            )),

            Command::GetVm { vm_id } => Ok(ResponsePayload::Vm(self.engine.get_vm(&vm_id)?)),

            Command::ListProjectVms { project_id, page } => Ok(ResponsePayload::Vms(
                self.engine.list_project_vms(&project_id, page.clamped())?,
            )),

            Command::RequestExtension { vm_id, days } => {
                updated_or_rejected(self.engine.request_extension(&vm_id, days, now).await)
            }

            Command::Exclude { vm_id } => updated_or_rejected(self.engine.exclude(&vm_id, now)),

            Command::Include { vm_id } => updated_or_rejected(self.engine.include(&vm_id, now)),

            Command::VmCreated { event } => {
                let vm_id = event.vm_id.clone();
                self.creations.send(event).await.map_err(|_| {
                    CoreError::Dispatch(vmexpire_core::DispatchError::Unavailable(
                        "creation listener stopped".into(),
                    ))
                })?;
                Ok(ResponsePayload::CreationAccepted { vm_id })
            }

            Command::RunSweep => match self.scheduler.try_sweep().await {
                Some(report) => Ok(ResponsePayload::SweepFinished(report.summary)),
                None => Ok(ResponsePayload::SweepBusy),
            },

            Command::GetHealth => {
                let dispatcher = self.engine.dispatcher();
                Ok(ResponsePayload::Health(HealthStatus {
                    live: true,
                    store_ok: self.store.is_healthy(),
                    dispatcher_ok: dispatcher.is_healthy(),
                    queue_depth: dispatcher.queue_depth(),
                    last_sweep: self.scheduler.last_sweep(),
                }))
            }

            Command::SubscribeEvents => Ok(ResponsePayload::Subscribed {
                client_id: client_id.clone(),
            }),

            Command::UnsubscribeEvents => Ok(ResponsePayload::Unsubscribed),

            Command::Ping => Ok(ResponsePayload::Pong),
        }
    }
}

/// A policy refusal is an answer, not a protocol error
fn updated_or_rejected(
    result: Result<vmexpire_api::VmRecord, CoreError>,
) -> Result<ResponsePayload, CoreError> {
    match result {
        Ok(record) => Ok(ResponsePayload::Updated(record)),
        Err(CoreError::PolicyViolation(reason)) => Ok(ResponsePayload::Rejected { reason }),
        Err(e) => Err(e),
    }
}

fn error_info(error: &CoreError) -> ErrorInfo {
    let code = match error {
        CoreError::NotFound(_) => ErrorCode::VmNotFound,
        CoreError::PolicyViolation(_) | CoreError::InvalidTimestamp { .. } => {
            ErrorCode::InvalidRequest
        }
        CoreError::Conflict(_) => ErrorCode::Conflict,
        CoreError::Store(_) => ErrorCode::StoreError,
        CoreError::Dispatch(_)
        | CoreError::TransientExternalFailure(_)
        | CoreError::TerminalExternalFailure(_) => ErrorCode::DispatchError,
    };
    ErrorInfo::new(code, error.to_string())
}

fn event_payload(event: CoreEvent) -> EventPayload {
    match event {
        CoreEvent::VmRegistered {
            vm_id,
            project_id,
            expires_at,
            excluded,
        } => EventPayload::VmRegistered {
            vm_id,
            project_id,
            expires_at,
            excluded,
        },
        CoreEvent::VmNotified { vm_id, expires_at } => {
            EventPayload::VmNotified { vm_id, expires_at }
        }
        CoreEvent::VmExtended {
            vm_id,
            days,
            expires_at,
            extended_days,
        } => EventPayload::VmExtended {
            vm_id,
            days,
            expires_at,
            extended_days,
        },
        CoreEvent::VmExpired { vm_id } => EventPayload::VmExpired { vm_id },
        CoreEvent::DeletionDispatched { vm_id } => EventPayload::DeletionDispatched { vm_id },
        CoreEvent::VmDeleted { vm_id } => EventPayload::VmDeleted { vm_id },
        CoreEvent::DeletionFailed { vm_id, error } => {
            EventPayload::DeletionFailed { vm_id, error }
        }
        CoreEvent::ExclusionChanged {
            vm_id,
            excluded: true,
        } => EventPayload::VmExcluded { vm_id },
        CoreEvent::ExclusionChanged {
            vm_id,
            excluded: false,
        } => EventPayload::VmIncluded { vm_id },
        CoreEvent::SweepCompleted(summary) => EventPayload::SweepCompleted(summary),
        CoreEvent::DispatcherUnhealthy { error } => EventPayload::DispatcherUnhealthy { error },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if args.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "vmexpired starting");

    let service = Service::new(&args).await?;
    service.run().await
}
