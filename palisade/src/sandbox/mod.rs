//! Sandbox lifecycle for the API process: a dedicated network namespace
//! with a veth pair, an anti-lockout table, and a chroot + privilege-drop
//! jail the re-executed binary enters before serving.

use thiserror::Error;

pub mod jail;
pub mod netns;

pub const NETNS_NAME: &str = "palisade-api";
pub const JAIL_PATH: &str = "/run/palisade-api-jail";

pub const VETH_HOST: &str = "veth-api-host";
pub const VETH_NS: &str = "veth-api-ns";
pub const HOST_ADDR: &str = "169.254.255.1/30";
pub const NS_ADDR: &str = "169.254.255.2/30";
pub const HOST_GATEWAY: &str = "169.254.255.1";

/// `NO_SANDBOX=1` disables namespace and chroot uniformly; nothing else
/// may force the sandbox off.
pub fn sandbox_disabled() -> bool {
    std::env::var("NO_SANDBOX").map(|v| v == "1").unwrap_or(false)
}

#[derive(Debug, Error)]
#[error("sandbox step `{step}` failed: {detail}")]
pub struct Error {
    pub step: &'static str,
    pub detail: String,
}

impl Error {
    pub fn step(step: &'static str, detail: impl std::fmt::Display) -> Self {
        Error {
            step,
            detail: detail.to_string(),
        }
    }
}

impl From<Error> for palisade_lib::Error {
    fn from(error: Error) -> Self {
        palisade_lib::Error::Sandbox {
            step: format!("{}: {}", error.step, error.detail),
        }
    }
}
