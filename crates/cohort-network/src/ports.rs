//! Free-port discovery
//!
//! A port is certified free by binding it and dropping the listener right
//! away. Nothing holds the port between the check and the worker's own bind,
//! so workers can still lose the race; the launcher retries those jobs on
//! the next candidate port.

use cohort_core::{CohortError, CohortResult};
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, TcpListener};
use tracing::{debug, trace};

/// Checks whether a local port can be bound right now
pub trait PortProbe: Send + Sync {
    fn is_available(&self, port: u16) -> bool;
}

/// Probe that binds a TCP listener on the loopback interface
#[derive(Debug, Clone)]
pub struct TcpPortProbe {
    host: IpAddr,
}

impl TcpPortProbe {
    pub fn new(host: IpAddr) -> Self {
        Self { host }
    }
}

impl Default for TcpPortProbe {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}

impl PortProbe for TcpPortProbe {
    fn is_available(&self, port: u16) -> bool {
        match TcpListener::bind((self.host, port)) {
            Ok(_) => true,
            Err(e) => {
                trace!(port = port, error = %e, "Port is bound");
                false
            }
        }
    }
}

/// First port at or above `start` that can be bound on localhost
pub fn next_free_port(start: u16) -> CohortResult<u16> {
    next_free_port_with(&TcpPortProbe::default(), start)
}

/// First port at or above `start` the probe reports as available
pub fn next_free_port_with(probe: &dyn PortProbe, start: u16) -> CohortResult<u16> {
    (start..=u16::MAX)
        .find(|port| probe.is_available(*port))
        .ok_or_else(|| CohortError::Network(format!("No free port at or above {}", start)))
}

/// Ports handed to the jobs of one run
///
/// The cursor only moves forward, so a pass never hands out the same port
/// twice. Ports returned by finished jobs can be claimed again explicitly.
pub struct PortPool {
    probe: Box<dyn PortProbe>,
    cursor: u16,
    in_use: BTreeSet<u16>,
}

impl PortPool {
    /// Pool probing real TCP ports from `base_port` upwards
    pub fn new(base_port: u16) -> Self {
        Self::with_probe(base_port, Box::new(TcpPortProbe::default()))
    }

    pub fn with_probe(base_port: u16, probe: Box<dyn PortProbe>) -> Self {
        Self {
            probe,
            cursor: base_port,
            in_use: BTreeSet::new(),
        }
    }

    /// Next free port at or above the cursor, marked as in use
    pub fn allocate(&mut self) -> CohortResult<u16> {
        let mut start = self.cursor;
        loop {
            let port = next_free_port_with(self.probe.as_ref(), start)?;
            if !self.in_use.contains(&port) {
                self.in_use.insert(port);
                self.cursor = port.checked_add(1).unwrap_or(u16::MAX);
                debug!(port = port, "Allocated port");
                return Ok(port);
            }
            start = port.checked_add(1).ok_or_else(|| {
                CohortError::Network(format!("No free port at or above {}", self.cursor))
            })?;
        }
    }

    /// Mark a port as in use again, e.g. when a freed slot is handed on
    pub fn claim(&mut self, port: u16) -> CohortResult<()> {
        if !self.in_use.insert(port) {
            return Err(CohortError::Internal(format!(
                "port {} is already held by a job",
                port
            )));
        }
        Ok(())
    }

    /// Return a port to the pool
    pub fn release(&mut self, port: u16) {
        if self.in_use.remove(&port) {
            debug!(port = port, "Released port");
        }
    }

    pub fn is_in_use(&self, port: u16) -> bool {
        self.in_use.contains(&port)
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.len()
    }
}
