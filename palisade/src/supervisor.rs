//! The privileged supervisor: wires the engine together, owns the control
//! socket, babysits the sandboxed API child, and drives reload, integrity,
//! list refresh and upgrade handoff.

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use palisade_lib::command::{Command, PendingStatus, Response};
use palisade_lib::config::{self, Config};
use palisade_lib::dirs::{StateDirs, ROLLBACK_CHECKPOINT};
use palisade_lib::dynamic::{self, ScheduledEntry, Scheduler};
use palisade_lib::fetch::Fetcher;
use palisade_lib::integrity::IntegrityMonitor;
use palisade_lib::ipset::IpSetManager;
use palisade_lib::kernel::{Backend, NftCli};
use palisade_lib::lockout;
use palisade_lib::logging::LogReloadHandle;
use palisade_lib::manager::{ProcSysctl, RuleSetManager};
use palisade_lib::pending::SafeApply;
use palisade_lib::safemode::{self, SafeMode};
use palisade_lib::store::Store;
use palisade_lib::{handoff, script::SetFlag};

use crate::cli::Cli;
use crate::lock::{self, InstanceLock};
use crate::sandbox::{self, netns, JAIL_PATH, NS_ADDR};

enum SignalMessage {
    Shutdown,
    RotateLogs,
}

struct Services {
    manager: Arc<RuleSetManager>,
    ipsets: Arc<IpSetManager>,
    safe_apply: Arc<SafeApply>,
    store: Arc<Store>,
    fetcher: Arc<Fetcher>,
    safe_mode: std::sync::Mutex<SafeMode>,
    safe_mode_active: AtomicBool,
}

impl Services {
    /// WAN interface for dynamic DNAT: the first member of an external zone.
    async fn wan_interface(&self) -> Option<String> {
        let config = self.manager.base_config().await?;
        for zone in config.zones.iter().filter(|z| z.external) {
            if let Some(iface) = zone.interfaces.first() {
                return Some(iface.clone());
            }
        }
        config.interfaces.iter().find(|i| i.dhcp).map(|i| i.name.clone())
    }
}

pub async fn run(
    cli: Cli,
    reload_handle: Option<LogReloadHandle>,
    inherited_api_listener: Option<OwnedFd>,
) -> Result<(), exitcode::ExitCode> {
    let _lock = match InstanceLock::acquire(Path::new(lock::LOCK_PATH)).await {
        Ok(lock) => lock,
        Err(lock::Error::Held(path)) => {
            tracing::error!(path = %path.display(), "another instance is already running");
            print_access_urls(&cli);
            return Err(exitcode::TEMPFAIL);
        }
        Err(error) => {
            tracing::error!(error = %error, "cannot acquire instance lock");
            return Err(exitcode::IOERR);
        }
    };

    if let Some(pid_file) = &cli.pid_file {
        if let Err(error) = tokio::fs::write(pid_file, std::process::id().to_string()).await {
            tracing::error!(error = %error, "error writing pid file");
            return Err(exitcode::IOERR);
        }
    }

    let state_dirs = StateDirs::new(&cli.state_dir);
    state_dirs.ensure().map_err(|error| {
        tracing::error!(error = %error, "cannot prepare state directory");
        exitcode::IOERR
    })?;

    let config = config::read(&cli.config_path).await.map_err(|error| {
        tracing::error!(error = ?error, path = %cli.config_path.display(), "unable to read configuration");
        exitcode::NOINPUT
    })?;

    // engine assembly: one backend for the mutator path, a second
    // connection for the integrity monitor
    let backend: Arc<dyn Backend> = Arc::new(NftCli::new());
    let monitor_backend: Arc<dyn Backend> = Arc::new(NftCli::new());
    let ipsets = Arc::new(IpSetManager::new(backend.clone()));
    let manager = Arc::new(RuleSetManager::new(
        backend.clone(),
        ipsets.clone(),
        Arc::new(ProcSysctl),
    ));
    let store = Arc::new(Store::open(&state_dirs.store_db()).map_err(|error| {
        tracing::error!(error = %error, "cannot open state store");
        exitcode::IOERR
    })?);
    let safe_apply = Arc::new(SafeApply::new(manager.clone(), store.clone(), ROLLBACK_CHECKPOINT));
    let fetcher = Arc::new(Fetcher::new(state_dirs.iplists_dir()));

    let services = Arc::new(Services {
        manager: manager.clone(),
        ipsets: ipsets.clone(),
        safe_apply,
        store: store.clone(),
        fetcher: fetcher.clone(),
        safe_mode: std::sync::Mutex::new(SafeMode::from_config(&config)),
        safe_mode_active: AtomicBool::new(false),
    });

    // first apply; a broken boot config must not leave the box open
    if let Err(error) = manager.apply(config.clone()).await {
        tracing::error!(error = %error, "initial apply failed, entering safe mode");
        let script = services.safe_mode.lock().unwrap().script().clone();
        if let Err(error) = backend.apply(&script).await {
            tracing::error!(error = %error, "safe mode apply failed");
            return Err(exitcode::UNAVAILABLE);
        }
        services.safe_mode_active.store(true, Ordering::SeqCst);
    }

    apply_lockout(&backend, &config).await;
    refresh_lists(&services, &config).await;

    let cancel = CancellationToken::new();

    let mut monitor = IntegrityMonitor::new(monitor_backend, manager.clone());
    if let Some(interval) = config.options.integrity_poll {
        monitor = monitor.with_interval(interval);
    }
    let monitor_task = monitor.spawn(cancel.clone());

    let scheduler_entries: Vec<ScheduledEntry> = config.scheduled.iter().map(ScheduledEntry::from).collect();
    let scheduler_task = if scheduler_entries.is_empty() {
        None
    } else {
        Some(Scheduler::new(manager.clone(), scheduler_entries).spawn(cancel.clone()))
    };

    let refresh_task = spawn_list_refresh(services.clone(), cancel.clone());

    let mut signal_receiver = signal_channel()?;

    let control_socket = bind_control_socket(&cli.socket_path).await?;
    let control_task = spawn_control_loop(control_socket, services.clone(), cancel.clone());

    // API sandbox
    let api_listener_fd = prepare_api_listener(&cli, inherited_api_listener)?;
    let mut cmd = if sandbox::sandbox_disabled() {
        tracing::warn!("NO_SANDBOX=1, running api child without namespace");
        netns::api_child_command_plain(
            &cli.api_listen,
            Path::new(JAIL_PATH),
            &cli.api_user,
            api_listener_fd.as_ref().map(|fd| fd.as_raw_fd()),
        )
    } else {
        netns::create().await.map_err(|error| {
            tracing::error!(error = %error, "sandbox setup failed");
            exitcode::OSERR
        })?;
        netns::api_child_command(
            &cli.api_listen,
            Path::new(JAIL_PATH),
            &cli.api_user,
            api_listener_fd.as_ref().map(|fd| fd.as_raw_fd()),
        )
    }
    .map_err(|error| {
        tracing::error!(error = %error, "cannot build api child command");
        exitcode::OSERR
    })?;
    let child = cmd.kill_on_drop(true).spawn().map_err(|error| {
        tracing::error!(error = %error, "cannot spawn api child");
        exitcode::OSERR
    })?;
    tracing::info!(pid = ?child.id(), "api child started");
    let mut api_child = Some(child);

    // upgrade handoff endpoint for a successor binary
    let handoff_task = spawn_handoff(
        store.clone(),
        api_listener_fd.as_ref().map(|fd| fd.as_raw_fd()),
        cancel.clone(),
    )
    .await;

    let config_events = watch_config(&cli.config_path);

    tracing::info!("entering supervisor loop");
    let exit = supervisor_loop(
        &cli,
        services.clone(),
        &mut signal_receiver,
        config_events,
        &mut api_child,
        reload_handle,
        &cancel,
    )
    .await;

    // teardown
    cancel.cancel();
    if let Some(mut child) = api_child {
        let _ = child.start_kill();
        let _ = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
    }
    if !sandbox::sandbox_disabled() {
        netns::destroy().await;
    }
    let _ = tokio::fs::remove_file(&cli.socket_path).await;
    let _ = monitor_task.await;
    control_task.abort();
    refresh_task.abort();
    if let Some(task) = scheduler_task {
        task.abort();
    }
    handoff_task.abort();

    exit
}

#[allow(clippy::too_many_arguments)]
async fn supervisor_loop(
    cli: &Cli,
    services: Arc<Services>,
    signal_receiver: &mut mpsc::Receiver<SignalMessage>,
    mut config_events: mpsc::Receiver<()>,
    api_child: &mut Option<tokio::process::Child>,
    reload_handle: Option<LogReloadHandle>,
    cancel: &CancellationToken,
) -> Result<(), exitcode::ExitCode> {
    loop {
        let child_pid = api_child.as_ref().and_then(|c| c.id());
        tokio::select! {
            Some(signal) = signal_receiver.recv() => match signal {
                SignalMessage::Shutdown => {
                    tracing::info!("initiating shutdown");
                    return Ok(());
                }
                SignalMessage::RotateLogs => {
                    rotate_logs(cli, &reload_handle);
                    if let Some(pid) = child_pid {
                        unsafe {
                            libc::kill(pid as i32, libc::SIGHUP);
                        }
                    }
                }
            },
            Some(()) = config_events.recv() => {
                reload_config(cli, &services).await;
            }
            _ = cancel.cancelled() => {
                tracing::info!("shutdown requested by handoff");
                return Ok(());
            }
            status = wait_child(api_child) => {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                tracing::error!(status = ?status, "api child exited unexpectedly");
                return Err(exitcode::IOERR);
            }
        }
    }
}

async fn wait_child(child: &mut Option<tokio::process::Child>) -> Option<std::process::ExitStatus> {
    match child {
        Some(child) => child.wait().await.ok(),
        None => std::future::pending().await,
    }
}

fn signal_channel() -> Result<mpsc::Receiver<SignalMessage>, exitcode::ExitCode> {
    let (sender, receiver) = mpsc::channel(32);
    let mut sigint = signal(SignalKind::interrupt()).map_err(|error| {
        tracing::error!(?error, "error setting up SIGINT handler");
        exitcode::IOERR
    })?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(|error| {
        tracing::error!(?error, "error setting up SIGTERM handler");
        exitcode::IOERR
    })?;
    let mut sighup = signal(SignalKind::hangup()).map_err(|error| {
        tracing::error!(?error, "error setting up SIGHUP handler");
        exitcode::IOERR
    })?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(_) = sigint.recv() => {
                    if sender.send(SignalMessage::Shutdown).await.is_err() {
                        break;
                    }
                },
                Some(_) = sigterm.recv() => {
                    if sender.send(SignalMessage::Shutdown).await.is_err() {
                        break;
                    }
                },
                Some(_) = sighup.recv() => {
                    if sender.send(SignalMessage::RotateLogs).await.is_err() {
                        break;
                    }
                }
                else => break,
            }
        }
    });

    Ok(receiver)
}

fn rotate_logs(cli: &Cli, reload_handle: &Option<LogReloadHandle>) {
    let (Some(handle), Some(path)) = (reload_handle, &cli.log_file) else {
        tracing::debug!("no log file configured, skipping log reload on SIGHUP");
        return;
    };
    match palisade_lib::logging::make_file_fmt_layer(path) {
        Ok(layer) => {
            if let Err(error) = handle.reload(layer) {
                tracing::error!(error = %error, "failed swapping log layer");
            } else {
                tracing::info!("reloaded log layer after SIGHUP");
            }
        }
        Err(error) => {
            eprintln!("failed to reopen log file {}: {}", path.display(), error);
        }
    }
}

fn print_access_urls(cli: &Cli) {
    let ns_ip = NS_ADDR.split('/').next().unwrap_or("169.254.255.2");
    if cli.api_listen.starts_with('/') {
        println!("palisade is already running; API socket: {}", cli.api_listen);
    } else {
        let port = cli.api_listen.rsplit(':').next().unwrap_or("8080");
        println!("palisade is already running; UI: http://{ns_ip}:{port}/");
        println!("configured listen address: {}", api_url(cli));
    }
}

async fn bind_control_socket(path: &Path) -> Result<UnixListener, exitcode::ExitCode> {
    if path.exists() {
        // probe for a live instance before clearing the stale socket
        if palisade_lib::socket::process_cmd(path, &Command::Ping).is_ok() {
            tracing::error!("control socket already answered, refusing to start");
            return Err(exitcode::TEMPFAIL);
        }
        let _ = tokio::fs::remove_file(path).await;
    }
    if let Some(parent) = path.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    UnixListener::bind(path).map_err(|error| {
        tracing::error!(error = %error, path = %path.display(), "cannot bind control socket");
        exitcode::OSFILE
    })
}

fn spawn_control_loop(
    listener: UnixListener,
    services: Arc<Services>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let Ok((stream, _addr)) = accepted else { continue };
                    let services = services.clone();
                    tokio::spawn(async move {
                        if let Err(error) = handle_connection(stream, &services).await {
                            tracing::warn!(error = %error, "control connection failed");
                        }
                    });
                }
                _ = cancel.cancelled() => return,
            }
        }
    })
}

async fn handle_connection(mut stream: UnixStream, services: &Services) -> std::io::Result<()> {
    let mut raw = String::new();
    stream.read_to_string(&mut raw).await?;
    let response = match serde_json::from_str::<Command>(raw.trim()) {
        Ok(command) => handle_command(services, command).await,
        Err(error) => Response::error(format!("bad command: {error}")),
    };
    let payload = serde_json::to_string(&response).unwrap_or_else(|_| "{\"status\":\"error\"}".to_string());
    stream.write_all(payload.as_bytes()).await?;
    stream.shutdown().await
}

async fn handle_command(services: &Services, command: Command) -> Response {
    match command {
        Command::Ping => Response::ok("pong"),
        Command::Status => {
            let (pending, cause) = services.safe_apply.status().await;
            Response::Status {
                safe_mode: services.safe_mode_active.load(Ordering::SeqCst),
                pending: pending.map(|p| PendingStatus {
                    id: p.id,
                    rollback_at_epoch: epoch(p.rollback_time),
                    client_ip: p.client_ip,
                    backup_version: p.config_backup_version,
                }),
                last_rollback_cause: cause,
                generation: services.manager.expected_generation().await,
            }
        }
        Command::Apply { config } => match services.manager.apply(*config.clone()).await {
            Ok(outcome) => {
                refresh_collaterals(services, &config).await;
                Response::ok(outcome.message)
            }
            Err(error) => Response::error(error),
        },
        Command::SafeApply {
            config,
            client_ip,
            options,
        } => match services
            .safe_apply
            .safe_apply(*config.clone(), client_ip, options.into())
            .await
        {
            Ok(outcome) => {
                refresh_collaterals(services, &config).await;
                match outcome.pending_id {
                    Some(id) => Response::Pending {
                        id,
                        rollback_at_epoch: outcome.rollback_time.map(epoch).unwrap_or(0),
                        backup_version: outcome.backup_version,
                    },
                    None => Response::ok(outcome.message),
                }
            }
            Err(error) => Response::error(error),
        },
        Command::Confirm { id } => match services.safe_apply.confirm(id).await {
            Ok(outcome) => Response::ok(outcome.message),
            Err(error) => Response::error(error),
        },
        Command::Cancel { id } => match services.safe_apply.cancel(id).await {
            Ok(outcome) => Response::ok(outcome.message),
            Err(error) => Response::error(error),
        },
        Command::SafeMode => {
            let script = services.safe_mode.lock().unwrap().script().clone();
            match services.manager.backend().apply(&script).await {
                Ok(()) => {
                    services.safe_mode_active.store(true, Ordering::SeqCst);
                    Response::ok("safe mode active")
                }
                Err(error) => Response::error(error),
            }
        }
        Command::ExitSafeMode => match safemode::exit_safe_mode(&services.manager).await {
            Ok(()) => {
                services.safe_mode_active.store(false, Ordering::SeqCst);
                Response::ok("safe mode exited")
            }
            Err(error) => Response::error(error),
        },
        Command::ReloadLists => {
            let Some(config) = services.manager.base_config().await else {
                return Response::error("no configuration loaded");
            };
            refresh_lists(services, &config).await;
            Response::ok("lists refreshed")
        }
        Command::AddPortMapping { mapping } => {
            let Some(wan) = services.wan_interface().await else {
                return Response::error("no external interface known");
            };
            match dynamic::add_port_mapping(&services.manager, &wan, &mapping).await {
                Ok(_) => Response::ok("mapping installed"),
                Err(error) => Response::error(error),
            }
        }
        Command::RemovePortMapping { mapping } => {
            let Some(wan) = services.wan_interface().await else {
                return Response::error("no external interface known");
            };
            match dynamic::remove_port_mapping(&services.manager, &wan, &mapping).await {
                Ok(_) => Response::ok("mapping removed"),
                Err(error) => Response::error(error),
            }
        }
        Command::AuthorizeIp { address, ttl_secs } => {
            match dynamic::authorize_ip(&services.ipsets, address, Duration::from_secs(ttl_secs)).await {
                Ok(()) => Response::ok("address authorized"),
                Err(error) => Response::error(error),
            }
        }
    }
}

fn epoch(time: std::time::SystemTime) -> u64 {
    time.duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Lockout table and safe-mode pre-render follow every configuration
/// change.
async fn refresh_collaterals(services: &Services, config: &Config) {
    apply_lockout(&services.manager.backend(), config).await;
    *services.safe_mode.lock().unwrap() = SafeMode::from_config(config);
}

async fn apply_lockout(backend: &Arc<dyn Backend>, config: &Config) {
    let script = lockout::lockout_script(&config.web_api_interfaces());
    if let Err(error) = backend.apply(&script).await {
        tracing::warn!(error = %error, "anti-lockout apply failed");
    }
}

/// Download every URL/list-backed set and reload it atomically. Failures
/// leave existing contents in place.
async fn refresh_lists(services: &Services, config: &Config) {
    for set in &config.ipsets {
        let url = match (&set.url, &set.list) {
            (Some(url), _) => url.clone(),
            (None, Some(list)) => match palisade_lib::fetch::well_known_url(list) {
                Ok(url) => url.to_string(),
                Err(error) => {
                    tracing::warn!(set = %set.name, error = %error, "unknown list name");
                    continue;
                }
            },
            (None, None) => continue,
        };
        match services.fetcher.fetch(&url).await {
            Ok(entries) => {
                if let Err(error) = services
                    .ipsets
                    .create(&set.name, set.set_type.element_type(), &[SetFlag::Interval])
                    .await
                {
                    tracing::warn!(set = %set.name, error = %error, "set create failed");
                    continue;
                }
                match services.ipsets.atomic_reload(&set.name, &entries).await {
                    Ok(count) => {
                        tracing::info!(set = %set.name, count, "list reloaded");
                        let _ = services.store.set(
                            "ipsets",
                            &set.name,
                            &serde_json::json!({ "url": url, "entries": count }),
                        );
                    }
                    Err(error) => {
                        tracing::warn!(set = %set.name, error = %error, "list reload failed, keeping contents");
                    }
                }
            }
            Err(error) => {
                tracing::warn!(set = %set.name, %url, error = %error, "list fetch failed, keeping contents");
            }
        }
    }
}

/// Periodic auto-update driven by the shortest configured refresh interval.
fn spawn_list_refresh(services: Arc<Services>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let interval = {
                let config = services.manager.base_config().await;
                config
                    .iter()
                    .flat_map(|c| c.ipsets.iter())
                    .filter(|s| s.auto_update && (s.url.is_some() || s.list.is_some()))
                    .map(|s| s.refresh_hours.max(1))
                    .min()
                    .map(|hours| Duration::from_secs(u64::from(hours) * 3600))
            };
            let Some(interval) = interval else {
                // nothing to refresh; check again in an hour
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(3600)) => continue,
                    _ = cancel.cancelled() => return,
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Some(config) = services.manager.base_config().await {
                        refresh_lists(&services, &config).await;
                    }
                }
                _ = cancel.cancelled() => return,
            }
        }
    })
}

/// Parent-side bind of the API TCP listener so restarts and upgrades can
/// inherit it. Unix-socket listeners are bound by the child inside the
/// jail.
fn prepare_api_listener(cli: &Cli, inherited: Option<OwnedFd>) -> Result<Option<OwnedFd>, exitcode::ExitCode> {
    if let Some(fd) = inherited {
        return Ok(Some(fd));
    }
    if cli.api_listen.starts_with('/') {
        return Ok(None);
    }
    let addr: SocketAddr = cli.api_listen.parse().map_err(|error| {
        tracing::error!(error = %error, listen = %cli.api_listen, "invalid api listen address");
        exitcode::USAGE
    })?;
    let listener = std::net::TcpListener::bind(addr).map_err(|error| {
        tracing::error!(error = %error, listen = %cli.api_listen, "cannot bind api listener");
        exitcode::OSERR
    })?;
    Ok(Some(OwnedFd::from(listener)))
}

async fn spawn_handoff(
    store: Arc<Store>,
    api_listener: Option<std::os::fd::RawFd>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let path = PathBuf::from(handoff::DEFAULT_SOCKET);
    let _ = tokio::fs::remove_file(&path).await;
    let listener = match UnixListener::bind(&path) {
        Ok(listener) => listener,
        Err(error) => {
            tracing::warn!(error = %error, "cannot bind handoff socket, upgrades disabled");
            return tokio::spawn(async {});
        }
    };
    tokio::spawn(async move {
        let listeners = api_listener
            .map(|fd| vec![("api".to_string(), fd)])
            .unwrap_or_default();
        match handoff::serve(listener, store, listeners, cancel.clone()).await {
            Ok(()) => {
                tracing::info!("state handed off to successor, shutting down");
                cancel.cancel();
            }
            Err(handoff::Error::NoSuccessor) => {}
            Err(error) => {
                tracing::warn!(error = %error, "handoff failed");
            }
        }
    })
}

/// Debounced config-file watch; events collapse into one reload.
fn watch_config(path: &Path) -> mpsc::Receiver<()> {
    let (sender, receiver) = mpsc::channel(4);
    let path = path.to_path_buf();
    std::thread::spawn(move || {
        use notify::Watcher;
        let (raw_sender, raw_receiver) = std::sync::mpsc::channel();
        let mut watcher = match notify::recommended_watcher(move |event: Result<notify::Event, notify::Error>| {
            if let Ok(event) = event {
                if event.kind.is_modify() || event.kind.is_create() {
                    let _ = raw_sender.send(());
                }
            }
        }) {
            Ok(watcher) => watcher,
            Err(error) => {
                tracing::warn!(error = %error, "config watch unavailable");
                return;
            }
        };
        let watch_target = path.parent().unwrap_or(&path);
        if let Err(error) = watcher.watch(watch_target, notify::RecursiveMode::NonRecursive) {
            tracing::warn!(error = %error, "config watch failed");
            return;
        }
        while raw_receiver.recv().is_ok() {
            // debounce editor write bursts
            std::thread::sleep(Duration::from_millis(500));
            while raw_receiver.try_recv().is_ok() {}
            if sender.blocking_send(()).is_err() {
                return;
            }
        }
    });
    receiver
}

async fn reload_config(cli: &Cli, services: &Services) {
    match config::read(&cli.config_path).await {
        Ok(config) => match services.manager.apply(config.clone()).await {
            Ok(_) => {
                tracing::info!("configuration reloaded from file");
                refresh_collaterals(services, &config).await;
                refresh_lists(services, &config).await;
            }
            Err(error) => {
                tracing::error!(error = %error, "reloaded configuration failed to apply");
            }
        },
        Err(error) => {
            tracing::error!(error = ?error, "cannot re-read configuration");
        }
    }
}

/// Successor path: adopt state and listeners from the running instance,
/// wait for it to exit, then swap the adopted store in.
pub async fn take_over(cli: &Cli, handoff_socket: &Path) -> Result<Option<OwnedFd>, exitcode::ExitCode> {
    let state_dirs = StateDirs::new(&cli.state_dir);
    state_dirs.ensure().map_err(|_| exitcode::IOERR)?;

    let staging = cli.state_dir.join("api_state.db.next");
    let _ = tokio::fs::remove_dir_all(&staging).await;
    let store = Store::open(&staging).map_err(|error| {
        tracing::error!(error = %error, "cannot open staging store");
        exitcode::IOERR
    })?;

    let successor = handoff::Successor::connect(handoff_socket).await.map_err(|error| {
        tracing::error!(error = %error, "cannot reach running instance");
        exitcode::UNAVAILABLE
    })?;
    let mut inherited = successor.adopt(&store).await.map_err(|error| {
        tracing::error!(error = %error, "handoff failed");
        exitcode::PROTOCOL
    })?;
    drop(store);
    tracing::info!(listeners = inherited.len(), "handoff complete");

    // the old instance releases the lock on exit; acquiring it here is the
    // cut-over barrier
    let lock = InstanceLock::acquire(Path::new(lock::LOCK_PATH)).await.map_err(|_| {
        tracing::error!("old instance never released the lock");
        exitcode::TEMPFAIL
    })?;
    drop(lock);

    let db = state_dirs.store_db();
    let backup = cli.state_dir.join("api_state.db.old");
    let _ = tokio::fs::remove_dir_all(&backup).await;
    if db.exists() {
        tokio::fs::rename(&db, &backup).await.map_err(|_| exitcode::IOERR)?;
    }
    tokio::fs::rename(&staging, &db).await.map_err(|_| exitcode::IOERR)?;

    let api = inherited
        .iter()
        .position(|(name, _)| name == "api")
        .map(|idx| inherited.swap_remove(idx).1);
    Ok(api)
}

/// Used by the lock-held banner and by ctl defaults.
pub fn api_url(cli: &Cli) -> String {
    if cli.api_listen.starts_with('/') {
        cli.api_listen.clone()
    } else {
        format!("http://{}/", cli.api_listen)
    }
}
