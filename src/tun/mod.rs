//! TUN device management: the device trait, IP packet parsing, and
//! the platform shims that install addresses and routes.

mod device;
mod packet;

pub use device::{
    create_tun, MemTun, MemTunHarness, TunConfig, TunDevice, DARWIN_HEADER_OFFSET,
    DEFAULT_BATCH_SIZE, LINUX_HEADER_OFFSET, VIRTIO_HEADER_OFFSET,
};
pub use packet::IpPacketInfo;

use crate::error::{Result, VpnError};
use ipnetwork::IpNetwork;
use std::process::Command;
use tracing::{debug, info, warn};

/// Install routes for the advertised prefixes through the TUN
/// interface. A route that already exists is not an error.
pub fn install_routes(tun_name: &str, routes: &[IpNetwork]) -> Result<()> {
    for route in routes {
        let output = route_add_command(tun_name, route)
            .output()
            .map_err(|e| VpnError::System(format!("running route install: {e}")))?;

        if output.status.success() {
            info!(route = %route, tun = %tun_name, "route installed");
            continue;
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if route_exists(&stderr) {
            debug!(route = %route, "route already present");
        } else {
            return Err(VpnError::System(format!(
                "installing route {route} via {tun_name}: {}",
                stderr.trim()
            )));
        }
    }
    Ok(())
}

/// Remove routes installed by [`install_routes`]. Failures are logged,
/// not propagated: teardown keeps going.
pub fn remove_routes(tun_name: &str, routes: &[IpNetwork]) {
    for route in routes {
        match route_del_command(tun_name, route).status() {
            Ok(status) if status.success() => {
                info!(route = %route, "route removed")
            }
            Ok(_) => debug!(route = %route, "route removal returned non-zero (may not exist)"),
            Err(e) => warn!(route = %route, %e, "route removal failed"),
        }
    }
}

fn route_exists(stderr: &str) -> bool {
    stderr.contains("File exists")
        || stderr.contains("already in table")
        || stderr.contains("object already exists")
}

#[cfg(target_os = "linux")]
fn route_add_command(tun_name: &str, route: &IpNetwork) -> Command {
    let mut cmd = Command::new("ip");
    if route.is_ipv6() {
        cmd.arg("-6");
    }
    cmd.args(["route", "add", &route.to_string(), "dev", tun_name]);
    cmd
}

#[cfg(target_os = "linux")]
fn route_del_command(tun_name: &str, route: &IpNetwork) -> Command {
    let mut cmd = Command::new("ip");
    if route.is_ipv6() {
        cmd.arg("-6");
    }
    cmd.args(["route", "del", &route.to_string(), "dev", tun_name]);
    cmd
}

#[cfg(target_os = "macos")]
fn route_add_command(tun_name: &str, route: &IpNetwork) -> Command {
    let mut cmd = Command::new("route");
    cmd.args(["-n", "add", "-net", &route.to_string(), "-interface", tun_name]);
    cmd
}

#[cfg(target_os = "macos")]
fn route_del_command(tun_name: &str, route: &IpNetwork) -> Command {
    let mut cmd = Command::new("route");
    cmd.args(["-n", "delete", "-net", &route.to_string(), "-interface", tun_name]);
    cmd
}

#[cfg(target_os = "windows")]
fn route_add_command(tun_name: &str, route: &IpNetwork) -> Command {
    let mut cmd = Command::new("netsh");
    cmd.args([
        "interface",
        "ipv4",
        "add",
        "route",
        &route.to_string(),
        tun_name,
    ]);
    cmd
}

#[cfg(target_os = "windows")]
fn route_del_command(tun_name: &str, route: &IpNetwork) -> Command {
    let mut cmd = Command::new("netsh");
    cmd.args([
        "interface",
        "ipv4",
        "delete",
        "route",
        &route.to_string(),
        tun_name,
    ]);
    cmd
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn route_add_command(_tun_name: &str, _route: &IpNetwork) -> Command {
    Command::new("false")
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn route_del_command(_tun_name: &str, _route: &IpNetwork) -> Command {
    Command::new("false")
}
