//! Active discovery by TCP connect-probing.

use std::time::Duration;
use tokio::net::{lookup_host, TcpSocket};
use tracing::{debug, info};

/// Probe a single port with a bounded connect.
///
/// The connect runs non-blocking and is abandoned after `timeout`; a completed
/// connect is confirmed by reading the socket's pending error. The probe
/// socket is dropped (closed) on every path.
pub async fn is_port_open(host: &str, port: u16, timeout: Duration) -> bool {
    let addr = match lookup_host((host, port)).await {
        Ok(mut addrs) => match addrs.next() {
            Some(addr) => addr,
            None => return false,
        },
        Err(_) => return false,
    };

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    };
    let Ok(socket) = socket else {
        return false;
    };

    match tokio::time::timeout(timeout, socket.connect(addr)).await {
        Ok(Ok(stream)) => matches!(stream.take_error(), Ok(None)),
        _ => false,
    }
}

/// Probe every port in `start..=end` except `exclude_port`, one at a time.
pub async fn scan_for_servers(
    host: &str,
    start: u16,
    end: u16,
    exclude_port: u16,
    timeout: Duration,
) -> Vec<u16> {
    info!(host, start, end, "Scanning for servers");
    let mut open = Vec::new();

    for port in start..=end {
        if port == exclude_port {
            continue;
        }
        if is_port_open(host, port, timeout).await {
            debug!(host, port, "Found open port");
            open.push(port);
        }
        if (port - start) % 20 == 0 {
            debug!(port, end, "Scan progress");
        }
    }

    info!(host, found = open.len(), "Scan complete");
    open
}

/// Pick up to `max_connections` ports closest to `my_port`.
///
/// Half the slots go to the nearest ports below and half to the nearest
/// above, each side closest-first. If one side runs short, the other side's
/// remaining ports fill the gap, still in proximity order.
pub fn select_neighbors(candidates: &[u16], my_port: u16, max_connections: usize) -> Vec<u16> {
    let mut below: Vec<u16> = candidates.iter().copied().filter(|&p| p < my_port).collect();
    let mut above: Vec<u16> = candidates.iter().copied().filter(|&p| p > my_port).collect();
    below.sort_unstable_by(|a, b| b.cmp(a));
    above.sort_unstable();

    let half = max_connections / 2;
    let mut selected: Vec<u16> = below.iter().take(half).copied().collect();
    selected.extend(above.iter().take(half));

    let leftovers = below.iter().skip(half).chain(above.iter().skip(half));
    for &port in leftovers {
        if selected.len() >= max_connections {
            break;
        }
        selected.push(port);
    }

    selected
}
