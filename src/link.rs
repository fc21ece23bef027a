use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::time::Instant;

use anyhow::bail;
use spin_sleep::SpinSleeper;
use tracing::{debug, info};

use crate::config::LinkSettings;

/// Local address the host would use to reach `probe`, if it has a route.
///
/// Connecting a UDP socket sends nothing; it only asks the kernel to pick a
/// route and a source address.
pub fn route_to(probe: SocketAddr) -> io::Result<IpAddr> {
    let bind: SocketAddr = if probe.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind)?;
    socket.connect(probe)?;
    Ok(socket.local_addr()?.ip())
}

/// Block until the host has a usable (non-loopback unless the probe itself is
/// loopback) route to the probe address.
///
/// Runs once at start-up, before the scheduler loop. Without a timeout it
/// waits forever.
pub fn wait_for_link(link: &LinkSettings) -> anyhow::Result<IpAddr> {
    wait_until_routed(link, || route_to(link.probe))
}

fn wait_until_routed<F>(link: &LinkSettings, mut probe: F) -> anyhow::Result<IpAddr>
where
    F: FnMut() -> io::Result<IpAddr>,
{
    let sleeper = SpinSleeper::new(100_000);
    let started = Instant::now();
    let mut attempts: u32 = 0;

    info!(probe = %link.probe, "waiting for network association");
    loop {
        attempts += 1;
        match probe() {
            Ok(local) if !local.is_loopback() || link.probe.ip().is_loopback() => {
                info!(%local, attempts, elapsed = ?started.elapsed(), "network associated");
                return Ok(local);
            }
            Ok(local) => debug!(%local, attempts, "only a loopback route so far"),
            Err(e) => debug!(error = %e, attempts, "no route to probe yet"),
        }

        if let Some(timeout) = link.timeout() {
            if started.elapsed() >= timeout {
                bail!(
                    "no route to {} after {:?} ({} attempts)",
                    link.probe,
                    timeout,
                    attempts
                );
            }
        }
        sleeper.sleep(link.poll_interval());
    }
}
