//! Client side of the control socket.
//!
//! One JSON command per connection: write, half-close, read the response.
//! Failures surface through the crate error taxonomy; a missing socket
//! means no supervisor is running, which callers treat as
//! `NotInitialized`.

use std::io::{BufReader, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use crate::command::{Command, Response};
use crate::Error;

pub const DEFAULT_PATH: &str = "/var/run/palisade.sock";
pub const ENV_VAR: &str = "PALISADE_SOCKET_PATH";

pub fn socket_path() -> PathBuf {
    std::env::var(ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_PATH))
}

/// Handle to a running supervisor's control socket.
pub struct ControlClient {
    path: PathBuf,
}

impl ControlClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ControlClient { path: path.into() }
    }

    pub fn from_env() -> Self {
        ControlClient::new(socket_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Send one command and wait for the supervisor's response.
    pub fn send(&self, cmd: &Command) -> Result<Response, Error> {
        if !self.path.try_exists()? {
            return Err(Error::NotInitialized);
        }

        let mut stream = UnixStream::connect(&self.path).map_err(|error| {
            tracing::debug!(path = %self.path.display(), %error, "control socket connect failed");
            Error::NotInitialized
        })?;

        let payload = serde_json::to_vec(cmd).map_err(invalid_data)?;
        stream.write_all(&payload)?;
        stream.flush()?;
        // the half-close marks end-of-command for the supervisor
        stream.shutdown(Shutdown::Write)?;

        let mut raw = String::new();
        BufReader::new(stream).read_to_string(&mut raw)?;
        serde_json::from_str(raw.trim()).map_err(invalid_data)
    }
}

fn invalid_data(error: serde_json::Error) -> Error {
    Error::IO(std::io::Error::new(std::io::ErrorKind::InvalidData, error))
}

/// One-shot form for callers without a client around.
pub fn process_cmd(socket_path: &Path, cmd: &Command) -> Result<Response, Error> {
    ControlClient::new(socket_path).send(cmd)
}
