//! Upgrade handoff: stream a snapshot plus the tail of changes to a
//! successor process over a private Unix socket, with a signalled
//! cut-over.
//!
//! Wire order: the old process passes its named listener fds as
//! SCM_RIGHTS immediately after accept (an empty set when there are
//! none), then the successor sends `ready`, receives the snapshot,
//! reports `handoff_complete`, and drains the forwarded change tail.
//! Clients on the inherited listeners never observe a dropped
//! connection.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Interest};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};

use crate::store::{self, Change, Snapshot, Store};

pub const DEFAULT_SOCKET: &str = "/var/run/palisade_handoff.sock";

/// Successor connect budget: 30 s in 1 s steps.
const CONNECT_RETRIES: u32 = 30;
const CONNECT_STEP: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store error: {0}")]
    Store(#[from] store::Error),
    #[error("successor never connected")]
    NoSuccessor,
    #[error("fd passing failed: {0}")]
    FdPassing(String),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Ready,
    Snapshot { snapshot: Snapshot },
    Change { change: Change },
    HandoffComplete,
}

/// Old-process side: wait for the successor, hand over listeners and
/// state, forward live changes until the successor reports completion.
pub async fn serve(
    listener: UnixListener,
    store: Arc<Store>,
    listeners: Vec<(String, RawFd)>,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let (stream, _addr) = tokio::select! {
        accepted = listener.accept() => accepted?,
        _ = cancel.cancelled() => return Err(Error::NoSuccessor),
    };
    serve_stream(stream, store, listeners, cancel).await
}

async fn serve_stream(
    stream: UnixStream,
    store: Arc<Store>,
    listeners: Vec<(String, RawFd)>,
    cancel: CancellationToken,
) -> Result<(), Error> {
    send_listeners(&stream, &listeners).await?;

    let (read_half, mut writer) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let ready = lines
        .next_line()
        .await?
        .ok_or_else(|| Error::Protocol("successor closed before ready".to_string()))?;
    match serde_json::from_str::<Message>(&ready)? {
        Message::Ready => {}
        other => return Err(Error::Protocol(format!("expected ready, got {other:?}"))),
    }

    // subscribe before snapshotting so no committed change falls between
    let mut changes = store.subscribe();
    let snapshot = store.create_snapshot()?;
    let snapshot_version = snapshot.version;
    write_message(&mut writer, &Message::Snapshot { snapshot }).await?;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) => match serde_json::from_str::<Message>(&line)? {
                        Message::HandoffComplete => {
                            tracing::info!("successor completed handoff, stopping forwarding");
                            return Ok(());
                        }
                        other => return Err(Error::Protocol(format!("unexpected message {other:?}"))),
                    },
                    None => return Err(Error::Protocol("successor closed mid-handoff".to_string())),
                }
            }
            change = changes.recv() => {
                match change {
                    Some(change) if change.version > snapshot_version => {
                        write_message(&mut writer, &Message::Change { change }).await?;
                    }
                    Some(_) => {}
                    None => return Err(Error::Protocol("store closed".to_string())),
                }
            }
            _ = cancel.cancelled() => {
                return Err(Error::Protocol("cancelled before completion".to_string()));
            }
        }
    }
}

async fn write_message(
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    message: &Message,
) -> Result<(), Error> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Successor-side session.
pub struct Successor {
    stream: UnixStream,
}

impl Successor {
    /// Connect with the control-plane retry budget.
    pub async fn connect(path: &Path) -> Result<Self, Error> {
        let mut last_error: Option<io::Error> = None;
        for _ in 0..CONNECT_RETRIES {
            match UnixStream::connect(path).await {
                Ok(stream) => return Ok(Successor { stream }),
                Err(error) => {
                    last_error = Some(error);
                    tokio::time::sleep(CONNECT_STEP).await;
                }
            }
        }
        Err(last_error.map(Error::IO).unwrap_or(Error::NoSuccessor))
    }

    pub fn from_stream(stream: UnixStream) -> Self {
        Successor { stream }
    }

    /// Receive listeners and state: apply the snapshot, signal cut-over,
    /// then foreground-apply the change tail. Returns the inherited
    /// listeners by name.
    pub async fn adopt(self, store: &Store) -> Result<Vec<(String, OwnedFd)>, Error> {
        let inherited = recv_listeners(&self.stream).await?;
        let mut stream = self.stream;

        let mut line = serde_json::to_vec(&Message::Ready)?;
        line.push(b'\n');
        stream.write_all(&line).await?;
        stream.flush().await?;

        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let first = lines
            .next_line()
            .await?
            .ok_or_else(|| Error::Protocol("old process closed before snapshot".to_string()))?;
        match serde_json::from_str::<Message>(&first)? {
            Message::Snapshot { snapshot } => store.restore_snapshot(&snapshot)?,
            other => return Err(Error::Protocol(format!("expected snapshot, got {other:?}"))),
        }

        // listeners and state are in place: tell the old side to stop, then
        // drain whatever it still had in flight
        let mut complete = serde_json::to_vec(&Message::HandoffComplete)?;
        complete.push(b'\n');
        write_half.write_all(&complete).await?;
        write_half.flush().await?;

        while let Some(line) = lines.next_line().await? {
            match serde_json::from_str::<Message>(&line)? {
                Message::Change { change } => store.apply_change(&change)?,
                other => return Err(Error::Protocol(format!("unexpected message {other:?}"))),
            }
        }
        Ok(inherited)
    }
}

/// One SCM_RIGHTS message: a JSON header naming each fd, the fds in the
/// control message. Always sent, possibly empty.
async fn send_listeners(stream: &UnixStream, listeners: &[(String, RawFd)]) -> Result<(), Error> {
    let names: Vec<&str> = listeners.iter().map(|(name, _)| name.as_str()).collect();
    let fds: Vec<RawFd> = listeners.iter().map(|(_, fd)| *fd).collect();
    let header = serde_json::to_vec(&names)?;

    loop {
        stream.writable().await?;
        let result = stream.try_io(Interest::WRITABLE, || {
            let iov = [io::IoSlice::new(&header)];
            let cmsg: Vec<ControlMessage> = if fds.is_empty() {
                Vec::new()
            } else {
                vec![ControlMessage::ScmRights(&fds)]
            };
            sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)
                .map_err(|e| io::Error::from_raw_os_error(e as i32))
        });
        match result {
            Ok(_) => return Ok(()),
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => continue,
            Err(error) => return Err(Error::FdPassing(error.to_string())),
        }
    }
}

async fn recv_listeners(stream: &UnixStream) -> Result<Vec<(String, OwnedFd)>, Error> {
    loop {
        stream.readable().await?;
        let mut header = vec![0u8; 4096];
        let mut received_fds: Vec<OwnedFd> = Vec::new();
        let result = stream.try_io(Interest::READABLE, || {
            let mut iov = [io::IoSliceMut::new(&mut header)];
            let mut cmsg_buffer = nix::cmsg_space!([RawFd; 16]);
            let message = recvmsg::<()>(
                stream.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buffer),
                MsgFlags::empty(),
            )
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
            for cmsg in message
                .cmsgs()
                .map_err(|e| io::Error::from_raw_os_error(e as i32))?
            {
                if let ControlMessageOwned::ScmRights(fds) = cmsg {
                    for fd in fds {
                        received_fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
                    }
                }
            }
            Ok(message.bytes)
        });
        match result {
            Ok(bytes) => {
                let names: Vec<String> = serde_json::from_slice(&header[..bytes])?;
                if names.len() != received_fds.len() {
                    return Err(Error::FdPassing(format!(
                        "{} names for {} fds",
                        names.len(),
                        received_fds.len()
                    )));
                }
                return Ok(names.into_iter().zip(received_fds).collect());
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => continue,
            Err(error) => return Err(Error::FdPassing(error.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snapshot_and_listeners_reach_successor() {
        let old_store = Arc::new(Store::open_temporary().unwrap());
        old_store.set("keys", "api", &"k-1").unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("handoff.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let tcp = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = tcp.local_addr().unwrap().port();

        let cancel = CancellationToken::new();
        let serve_store = old_store.clone();
        let tcp_fd = tcp.as_raw_fd();
        let server = tokio::spawn(async move {
            serve(listener, serve_store, vec![("http".to_string(), tcp_fd)], cancel).await
        });

        let new_store = Store::open_temporary().unwrap();
        let successor = Successor::connect(&path).await.unwrap();
        let inherited = successor.adopt(&new_store).await.unwrap();
        server.await.unwrap().unwrap();

        let value: Option<String> = new_store.get("keys", "api").unwrap();
        assert_eq!(value, Some("k-1".to_string()));
        assert_eq!(new_store.current_version(), old_store.current_version());

        assert_eq!(inherited.len(), 1);
        assert_eq!(inherited[0].0, "http");
        let adopted = unsafe { std::net::TcpListener::from_raw_fd(inherited[0].1.as_raw_fd()) };
        assert_eq!(adopted.local_addr().unwrap().port(), port);
        std::mem::forget(adopted);
    }

    #[tokio::test]
    async fn empty_listener_set_is_fine() {
        let old_store = Arc::new(Store::open_temporary().unwrap());
        old_store.set("b", "k", &1).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("handoff.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let cancel = CancellationToken::new();
        let serve_store = old_store.clone();
        let server = tokio::spawn(async move { serve(listener, serve_store, Vec::new(), cancel).await });

        let new_store = Store::open_temporary().unwrap();
        let successor = Successor::connect(&path).await.unwrap();
        let inherited = successor.adopt(&new_store).await.unwrap();
        assert!(inherited.is_empty());
        server.await.unwrap().unwrap();
    }
}
