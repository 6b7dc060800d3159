//! In-use tracking and allocation for the proxy port range.
//!
//! Port numbers are a host-wide shared resource: unrelated processes
//! can bind anything in our range at any time. The set therefore only
//! records what *we* have handed out; every allocation re-verifies
//! availability with a live bind probe before trusting the in-memory
//! flags.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};

use rand::Rng;
use tracing::debug;

use crate::error::ProxyError;

/// Tracks which ports in `[min, max)` this process has handed out.
///
/// Released ports stay in the map with an `in_use = false` flag; the
/// allocator prefers re-verifying a previously used port over scanning
/// fresh ones, which keeps datapath rules stable across policy churn.
#[derive(Debug)]
pub(crate) struct PortSet {
    min: u16,
    max: u16,
    in_use: HashMap<u16, bool>,
    /// Where the next range scan starts. Advanced past every scanned
    /// allocation so consecutive allocations spread over the range.
    next_offset: u16,
}

impl PortSet {
    pub(crate) fn new(min: u16, max: u16) -> Self {
        debug_assert!(min < max);
        let span = max - min;
        Self {
            min,
            max,
            in_use: HashMap::new(),
            next_offset: rand::rng().random_range(0..span),
        }
    }

    /// Allocate a bound, available port.
    ///
    /// If `preferred` is non-zero and both unclaimed here and bindable
    /// on the host it is reused. Otherwise the range is scanned once,
    /// starting at the rotating offset; the first port that is free in
    /// the set and passes the bind probe is taken.
    pub(crate) fn allocate(&mut self, preferred: u16) -> Result<u16, ProxyError> {
        if preferred != 0 && !self.is_in_use(preferred) && probe_bind(preferred) {
            self.in_use.insert(preferred, true);
            debug!(port = preferred, "Reusing preferred proxy port");
            return Ok(preferred);
        }

        let span = self.max - self.min;
        for i in 0..span {
            let port = self.min + ((u32::from(self.next_offset) + u32::from(i)) % u32::from(span)) as u16;
            if self.is_in_use(port) {
                continue;
            }
            if !probe_bind(port) {
                // Some other process holds it; skip without claiming.
                continue;
            }
            self.next_offset = ((u32::from(self.next_offset) + u32::from(i) + 1) % u32::from(span)) as u16;
            self.in_use.insert(port, true);
            debug!(port, "Allocated proxy port");
            return Ok(port);
        }

        Err(ProxyError::AllocationExhausted {
            min: self.min,
            max: self.max,
        })
    }

    /// Return a port to the set. The entry lingers with the flag
    /// cleared so a later allocation can prefer it.
    pub(crate) fn release(&mut self, port: u16) {
        if let Some(flag) = self.in_use.get_mut(&port) {
            *flag = false;
        }
    }

    pub(crate) fn is_in_use(&self, port: u16) -> bool {
        self.in_use.get(&port).copied().unwrap_or(false)
    }

    /// Claim a port without probing, as if an external process took it.
    #[cfg(test)]
    pub(crate) fn mark_in_use(&mut self, port: u16) {
        self.in_use.insert(port, true);
    }
}

/// Check OS-level availability by opening and immediately dropping a
/// listening socket. The in-memory flags alone are not authoritative.
fn probe_bind(port: u16) -> bool {
    TcpListener::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).is_ok()
}
