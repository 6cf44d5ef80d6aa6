//! Network namespace and veth plumbing for the API sandbox.

use tokio::process::Command;

use std::os::fd::RawFd;
use std::path::Path;

use super::{Error, HOST_ADDR, HOST_GATEWAY, NETNS_NAME, NS_ADDR, VETH_HOST, VETH_NS};

/// Run one named setup step; a failure carries the step name and stderr so
/// the supervisor can report exactly where the sandbox broke.
async fn run_step(name: &'static str, cmd: &mut Command) -> Result<(), Error> {
    let output = cmd.output().await.map_err(|e| Error::step(name, e))?;
    if output.status.success() {
        if !output.stderr.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::warn!(step = name, stderr = %stderr.trim(), "sandbox command warned");
        }
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(Error::step(
        name,
        format!("exit {:?}: {}", output.status.code(), stderr.trim()),
    ))
}

/// Best-effort step whose failure is expected (teardown, optional tuning).
async fn run_quiet(cmd: &mut Command) {
    let _ = cmd.output().await;
}

/// Create the namespace, the veth pair and the namespace-side routing.
/// Idempotent: stale leftovers from a crash are removed first.
pub async fn create() -> Result<(), Error> {
    destroy().await;

    run_step("netns-add", Command::new("ip").args(["netns", "add", NETNS_NAME])).await?;
    run_step(
        "veth-add",
        Command::new("ip").args(["link", "add", VETH_HOST, "type", "veth", "peer", "name", VETH_NS]),
    )
    .await?;
    run_step(
        "veth-move",
        Command::new("ip").args(["link", "set", VETH_NS, "netns", NETNS_NAME]),
    )
    .await?;

    run_step(
        "host-addr",
        Command::new("ip").args(["addr", "add", HOST_ADDR, "dev", VETH_HOST]),
    )
    .await?;
    run_step("host-up", Command::new("ip").args(["link", "set", VETH_HOST, "up"])).await?;

    run_step(
        "ns-addr",
        &mut ns_command(&["ip", "addr", "add", NS_ADDR, "dev", VETH_NS]),
    )
    .await?;
    run_step("ns-up", &mut ns_command(&["ip", "link", "set", VETH_NS, "up"])).await?;
    run_step("ns-lo-up", &mut ns_command(&["ip", "link", "set", "lo", "up"])).await?;
    run_step(
        "ns-route",
        &mut ns_command(&["ip", "route", "add", "default", "via", HOST_GATEWAY]),
    )
    .await?;

    // TX checksum offload corrupts checksums across the veth
    run_quiet(Command::new("ethtool").args(["-K", VETH_HOST, "tx", "off"])).await;
    run_quiet(&mut ns_command(&["ethtool", "-K", VETH_NS, "tx", "off"])).await;

    Ok(())
}

/// Tear the namespace down; errors are expected when nothing exists.
pub async fn destroy() {
    run_quiet(Command::new("ip").args(["netns", "delete", NETNS_NAME])).await;
    run_quiet(Command::new("ip").args(["link", "delete", VETH_HOST])).await;
}

fn ns_command(args: &[&str]) -> Command {
    let mut cmd = Command::new("ip");
    cmd.args(["netns", "exec", NETNS_NAME]);
    cmd.args(args);
    cmd
}

/// Re-execute this binary inside the namespace as the API child. The
/// inherited listener, when present, becomes fd 3 of the child.
pub fn api_child_command(
    listen: &str,
    jail: &Path,
    user: &str,
    listener_fd: Option<RawFd>,
) -> std::io::Result<Command> {
    let exe = std::env::current_exe()?;
    let mut cmd = Command::new("ip");
    cmd.args(["netns", "exec", NETNS_NAME]);
    cmd.arg(exe);
    child_args(&mut cmd, listen, jail, user, listener_fd);
    Ok(cmd)
}

/// `NO_SANDBOX` variant: same child, no namespace.
pub fn api_child_command_plain(
    listen: &str,
    jail: &Path,
    user: &str,
    listener_fd: Option<RawFd>,
) -> std::io::Result<Command> {
    let exe = std::env::current_exe()?;
    let mut cmd = Command::new(exe);
    child_args(&mut cmd, listen, jail, user, listener_fd);
    Ok(cmd)
}

fn child_args(cmd: &mut Command, listen: &str, jail: &Path, user: &str, listener_fd: Option<RawFd>) {
    cmd.arg("api-child");
    cmd.args(["--listen", listen]);
    cmd.arg("--jail").arg(jail);
    cmd.args(["--user", user]);

    if let Some(fd) = listener_fd {
        // clear close-on-exec and pin the listener to fd 3
        unsafe {
            cmd.pre_exec(move || {
                if libc::dup2(fd, 3) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                let flags = libc::fcntl(3, libc::F_GETFD);
                libc::fcntl(3, libc::F_SETFD, flags & !libc::FD_CLOEXEC);
                Ok(())
            });
        }
    }
}
