//! The sandboxed API process: re-executed inside the namespace, it enters
//! the chroot jail, drops privileges, and serves on the inherited listener
//! (fd 3) or a freshly bound one. The HTTP API router itself is mounted by
//! the web layer; this module owns only the lifecycle around it.

use std::os::fd::{BorrowedFd, FromRawFd};
use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UnixListener};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::sandbox::{self, jail};

/// Inherited-listener slot by convention.
const INHERITED_FD: i32 = 3;

const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

pub async fn run(listen: &str, jail_path: &Path, user: &str) -> Result<(), exitcode::ExitCode> {
    // passwd lookup must happen before the chroot hides /etc
    let target = jail::resolve_user(user).map_err(|error| {
        tracing::error!(error = %error, "cannot resolve api user");
        exitcode::NOUSER
    })?;

    let listener = acquire_listener(listen).map_err(|error| {
        tracing::error!(error = %error, %listen, "cannot acquire listener");
        exitcode::OSERR
    })?;

    if sandbox::sandbox_disabled() {
        tracing::warn!("NO_SANDBOX=1, skipping chroot and privilege drop");
    } else {
        jail::enter(jail_path, &target).map_err(|error| {
            tracing::error!(error = %error, "jail entry failed");
            exitcode::NOPERM
        })?;
    }

    // toggles consumed by the web layer once it mounts on the listener
    if std::env::var("FORCE_TLS").as_deref() == Ok("1") {
        tracing::info!("FORCE_TLS=1, web layer will require HTTPS");
    }
    if std::env::var("NO_TLS").as_deref() == Ok("1") {
        tracing::info!("NO_TLS=1, web layer will serve plain HTTP");
    }
    if let Ok(ui_dist) = std::env::var("UI_DIST") {
        tracing::info!(%ui_dist, "serving UI assets from override path");
    }

    tracing::info!(%listen, "api child serving");
    serve(listener).await;
    Ok(())
}

fn inherited_socket() -> Option<std::os::fd::RawFd> {
    let fd = unsafe { BorrowedFd::borrow_raw(INHERITED_FD) };
    match nix::sys::stat::fstat(fd) {
        Ok(stat) => {
            let is_socket = (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK;
            is_socket.then_some(INHERITED_FD)
        }
        Err(_) => None,
    }
}

/// Leading `/` selects a Unix socket; anything else is a TCP address.
fn acquire_listener(listen: &str) -> std::io::Result<Listener> {
    if let Some(fd) = inherited_socket() {
        tracing::info!(fd, "using inherited listener");
        if listen.starts_with('/') {
            let std_listener = unsafe { std::os::unix::net::UnixListener::from_raw_fd(fd) };
            std_listener.set_nonblocking(true)?;
            return Ok(Listener::Unix(UnixListener::from_std(std_listener)?));
        }
        let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
        std_listener.set_nonblocking(true)?;
        return Ok(Listener::Tcp(TcpListener::from_std(std_listener)?));
    }

    if listen.starts_with('/') {
        let _ = std::fs::remove_file(listen);
        let std_listener = std::os::unix::net::UnixListener::bind(listen)?;
        std_listener.set_nonblocking(true)?;
        Ok(Listener::Unix(UnixListener::from_std(std_listener)?))
    } else {
        let std_listener = std::net::TcpListener::bind(listen)?;
        std_listener.set_nonblocking(true)?;
        Ok(Listener::Tcp(TcpListener::from_std(std_listener)?))
    }
}

async fn serve(listener: Listener) {
    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(_) => return,
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => return,
        };
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
        tracing::info!("api child shutting down");
        signal_cancel.cancel();
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = accept(&listener) => {
                match accepted {
                    Ok(mut stream) => {
                        tracker.spawn(async move {
                            let _ = answer(&mut stream).await;
                        });
                    }
                    Err(error) => {
                        tracing::warn!(error = %error, "accept failed");
                    }
                }
            }
        }
    }

    // bounded drain of in-flight connections
    tracker.close();
    let _ = tokio::time::timeout(SHUTDOWN_DRAIN, tracker.wait()).await;
}

enum Stream {
    Tcp(tokio::net::TcpStream),
    Unix(tokio::net::UnixStream),
}

async fn accept(listener: &Listener) -> std::io::Result<Stream> {
    match listener {
        Listener::Tcp(l) => l.accept().await.map(|(s, _)| Stream::Tcp(s)),
        Listener::Unix(l) => l.accept().await.map(|(s, _)| Stream::Unix(s)),
    }
}

/// Placeholder responder until the web layer mounts its router on the
/// listener: reports liveness so probes and the anti-lockout path can be
/// verified end to end.
async fn answer(stream: &mut Stream) -> std::io::Result<()> {
    let body = "{\"service\":\"palisade-api\",\"status\":\"starting\"}";
    let response = format!(
        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let mut buf = [0u8; 4096];
    match stream {
        Stream::Tcp(s) => {
            let _ = s.read(&mut buf).await?;
            s.write_all(response.as_bytes()).await?;
            s.shutdown().await
        }
        Stream::Unix(s) => {
            let _ = s.read(&mut buf).await?;
            s.write_all(response.as_bytes()).await?;
            s.shutdown().await
        }
    }
}
