//! Local debugging port allocation
//!
//! A [`PortPool`] hands out ports from a reserved range. A port is only handed
//! out after a probe socket with address reuse enabled could bind it, and it
//! stays reserved until its [`PortLease`] is dropped. Pools are plain values:
//! whoever launches local browsers owns one and passes it along.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex};
use tokio::net::TcpSocket;
use tracing::{debug, trace};

use crate::config::Config;
use crate::{Error, Result};

#[derive(Debug)]
struct PoolState {
    in_use: HashSet<u16>,
    /// Next port to probe, so released ports are not reused right away
    cursor: u16,
}

/// Pool of local TCP ports
#[derive(Debug, Clone)]
pub struct PortPool {
    range: RangeInclusive<u16>,
    state: Arc<Mutex<PoolState>>,
}

impl PortPool {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        let cursor = *range.start();
        Self {
            range,
            state: Arc::new(Mutex::new(PoolState {
                in_use: HashSet::new(),
                cursor,
            })),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.port_range_start..=config.port_range_end)
    }

    pub fn range(&self) -> &RangeInclusive<u16> {
        &self.range
    }

    /// Number of ports currently leased
    pub fn in_use(&self) -> usize {
        self.lock().in_use.len()
    }

    /// Reserve a free, bindable port
    pub fn allocate(&self) -> Result<PortLease> {
        let (start, end) = (*self.range.start(), *self.range.end());
        let Some(span) = end.checked_sub(start) else {
            return Err(Error::configuration(format!("Empty port range {}-{}", start, end)));
        };
        let size = usize::from(span) + 1;

        let mut state = self.lock();
        for step in 0..size {
            let offset = (usize::from(state.cursor - start) + step) % size;
            let Ok(port) = u16::try_from(usize::from(start) + offset) else {
                continue;
            };
            if state.in_use.contains(&port) || !probe(port) {
                continue;
            }

            state.in_use.insert(port);
            state.cursor = if port == end { start } else { port + 1 };
            debug!("Leased port {}", port);
            return Ok(PortLease {
                port,
                state: Arc::clone(&self.state),
            });
        }

        Err(Error::internal(format!(
            "No free port in {}-{} ({} leased)",
            start,
            end,
            state.in_use.len()
        )))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Whether a reuse-address socket can bind the port on the loopback interface
fn probe(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let bound = TcpSocket::new_v4()
        .and_then(|socket| {
            socket.set_reuseaddr(true)?;
            socket.bind(addr)
        })
        .is_ok();
    if !bound {
        trace!("Port {} is busy", port);
    }
    bound
}

/// A leased port, returned to its pool on drop
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    state: Arc<Mutex<PoolState>>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.in_use.remove(&self.port);
        debug!("Released port {}", self.port);
    }
}
