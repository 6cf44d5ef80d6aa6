//! Control-plane command protocol between `palisade-ctl`, the API child
//! and the supervisor. Newline-delimited JSON over the control socket.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::net::IpAddr;
use std::time::Duration;

use crate::config::Config;
use crate::dynamic::PortMapping;
use crate::pending::SafeApplyOptions;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Ping,
    Status,
    Apply {
        config: Box<Config>,
    },
    SafeApply {
        config: Box<Config>,
        client_ip: IpAddr,
        options: SafeApplyRequest,
    },
    Confirm {
        id: Uuid,
    },
    Cancel {
        id: Uuid,
    },
    SafeMode,
    ExitSafeMode,
    ReloadLists,
    AddPortMapping {
        mapping: PortMapping,
    },
    RemovePortMapping {
        mapping: PortMapping,
    },
    AuthorizeIp {
        address: IpAddr,
        ttl_secs: u64,
    },
}

/// Wire form of [`SafeApplyOptions`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SafeApplyRequest {
    pub ping_targets: Vec<IpAddr>,
    pub ping_timeout_secs: Option<u64>,
    pub require_confirmation: bool,
    pub rollback_delay_secs: Option<u64>,
}

impl From<SafeApplyRequest> for SafeApplyOptions {
    fn from(request: SafeApplyRequest) -> Self {
        let mut options = SafeApplyOptions {
            ping_targets: request.ping_targets,
            ping_timeout: request.ping_timeout_secs.map(Duration::from_secs),
            require_confirmation: request.require_confirmation,
            ..Default::default()
        };
        if let Some(delay) = request.rollback_delay_secs {
            options.rollback_delay = Duration::from_secs(delay);
        }
        options
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok {
        message: String,
    },
    Pending {
        id: Uuid,
        rollback_at_epoch: u64,
        backup_version: Option<u64>,
    },
    Status {
        safe_mode: bool,
        pending: Option<PendingStatus>,
        last_rollback_cause: Option<String>,
        generation: Option<u64>,
    },
    Error {
        message: String,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PendingStatus {
    pub id: Uuid,
    pub rollback_at_epoch: u64,
    pub client_ip: IpAddr,
    pub backup_version: u64,
}

impl Response {
    pub fn ok(message: impl Into<String>) -> Self {
        Response::Ok {
            message: message.into(),
        }
    }

    pub fn error(message: impl std::fmt::Display) -> Self {
        Response::Error {
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_round_trip() {
        let cmd = Command::AuthorizeIp {
            address: "8.8.8.8".parse().unwrap(),
            ttl_secs: 300,
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"command\":\"authorize_ip\""));
        let back: Command = serde_json::from_str(&json).unwrap();
        match back {
            Command::AuthorizeIp { ttl_secs, .. } => assert_eq!(ttl_secs, 300),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn safe_apply_request_defaults() {
        let request: SafeApplyRequest = serde_json::from_str("{}").unwrap();
        let options: SafeApplyOptions = request.into();
        assert_eq!(options.rollback_delay, crate::pending::DEFAULT_ROLLBACK_DELAY);
        assert!(!options.require_confirmation);
    }
}
