//! The proxy port registry: listener identity to allocated port.
//!
//! One record exists per distinct `(proxy_type, name, ingress)`
//! listener identity. Records are created lazily on first allocation
//! (or on checkpoint restore) and are never removed: a released record
//! lingers with `port == 0` so lookups by name stay stable and the last
//! committed `rules_port` remains discoverable for datapath cleanup.
//!
//! The record map and the port set are guarded by a single lock and
//! updated atomically together. Critical sections are short; nothing
//! that can block on I/O runs under this lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::checkpoint::ProxyPortRecord;
use crate::error::ProxyError;
use crate::ports::PortSet;

/// The kind of L7 proxy backing a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyType {
    /// Listener defined by a CRD resource.
    Crd,
    /// Built-in HTTP proxy.
    Http,
    /// Built-in DNS proxy.
    Dns,
    /// Built-in Kafka proxy.
    Kafka,
}

impl std::fmt::Display for ProxyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Crd => "crd",
            Self::Http => "http",
            Self::Dns => "dns",
            Self::Kafka => "kafka",
        };
        write!(f, "{s}")
    }
}

/// Bookkeeping for one listener's proxy port.
#[derive(Debug, Clone)]
pub struct ProxyPort {
    /// The kind of proxy behind this listener.
    pub proxy_type: ProxyType,

    /// Listener name; unique within `(proxy_type, ingress)` and used
    /// as the registry key.
    pub name: String,

    /// Direction the listener applies to.
    pub ingress: bool,

    /// Currently allocated port, 0 while unallocated.
    pub port: u16,

    /// True while the port is actively backing at least one redirect.
    pub configured: bool,

    /// Fixed-port listeners are never reassigned by the allocator;
    /// their port is reserved out-of-band.
    pub is_static: bool,

    /// Reference count of active users of this redirect.
    pub n_redirects: u64,

    /// The port last successfully pushed into datapath rules. Survives
    /// release so cleanup can tell the datapath which rule to remove.
    pub rules_port: u16,

    /// Serializes ack rule installation per listener; at most one
    /// in-flight ack per name.
    pub(crate) ack_lock: Arc<tokio::sync::Mutex<()>>,
}

impl ProxyPort {
    fn new(proxy_type: ProxyType, name: &str, ingress: bool) -> Self {
        Self {
            proxy_type,
            name: name.to_string(),
            ingress,
            port: 0,
            configured: false,
            is_static: false,
            n_redirects: 0,
            rules_port: 0,
            ack_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn to_record(&self) -> ProxyPortRecord {
        ProxyPortRecord {
            proxy_type: self.proxy_type,
            name: self.name.clone(),
            ingress: self.ingress,
            port: self.port,
            configured: self.configured,
            is_static: self.is_static,
            n_redirects: self.n_redirects,
            rules_port: self.rules_port,
        }
    }
}

struct State {
    ports: HashMap<String, ProxyPort>,
    port_set: PortSet,
}

/// Shared, lock-protected registry of [`ProxyPort`] records plus the
/// port set they draw from.
#[derive(Clone)]
pub struct ProxyPortRegistry {
    inner: Arc<Mutex<State>>,
}

impl ProxyPortRegistry {
    pub fn new(min_port: u16, max_port: u16) -> Self {
        Self {
            inner: Arc::new(Mutex::new(State {
                ports: HashMap::new(),
                port_set: PortSet::new(min_port, max_port),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.lock().expect("proxy port registry lock poisoned")
    }

    /// Look up a record by full listener identity. Returns a snapshot.
    pub fn find(&self, proxy_type: ProxyType, name: &str, ingress: bool) -> Option<ProxyPort> {
        let state = self.lock();
        state
            .ports
            .get(name)
            .filter(|pp| pp.proxy_type == proxy_type && pp.ingress == ingress)
            .cloned()
    }

    /// Current allocated port for a listener name. `Some(0)` means the
    /// record lingers unallocated; `None` means the name was never seen.
    pub fn get_proxy_port(&self, name: &str) -> Option<u16> {
        let state = self.lock();
        state.ports.get(name).map(|pp| pp.port)
    }

    /// Listener names with a currently open port, for status reporting.
    pub fn open_listener_ports(&self) -> HashMap<String, u16> {
        let state = self.lock();
        state
            .ports
            .iter()
            .filter(|(_, pp)| pp.port != 0)
            .map(|(name, pp)| (name.clone(), pp.port))
            .collect()
    }

    /// Register a listener with a fixed, non-reassignable port.
    ///
    /// The port is assumed reserved out-of-band and is not claimed in
    /// the port set.
    pub fn register_static_listener(
        &self,
        name: &str,
        proxy_type: ProxyType,
        ingress: bool,
        port: u16,
    ) {
        let mut state = self.lock();
        let pp = state
            .ports
            .entry(name.to_string())
            .or_insert_with(|| ProxyPort::new(proxy_type, name, ingress));
        pp.is_static = true;
        pp.port = port;
        info!(listener = name, port, %proxy_type, "Registered static listener");
    }

    /// Allocate a port for a listener, creating the record on first
    /// use. Idempotent: an already configured listener returns its
    /// existing port.
    ///
    /// Returns the port and whether the durable view changed.
    pub(crate) fn allocate(
        &self,
        name: &str,
        proxy_type: ProxyType,
        ingress: bool,
    ) -> Result<(u16, bool), ProxyError> {
        let mut state = self.lock();
        let State { ports, port_set } = &mut *state;

        // A name maps to exactly one listener identity; a second
        // identity under the same name must not alias the first.
        if let Some(existing) = ports.get(name) {
            if existing.proxy_type != proxy_type || existing.ingress != ingress {
                return Err(ProxyError::AlreadyRegistered(name.to_string()));
            }
        }

        let pp = ports
            .entry(name.to_string())
            .or_insert_with(|| ProxyPort::new(proxy_type, name, ingress));

        if pp.configured && pp.port != 0 {
            return Ok((pp.port, false));
        }

        if pp.is_static {
            pp.configured = true;
            return Ok((pp.port, true));
        }

        // Prefer the last committed port so datapath rules stay stable
        // across re-evaluation; the allocator re-probes it regardless.
        let port = port_set.allocate(pp.rules_port)?;
        pp.port = port;
        pp.configured = true;
        debug!(listener = name, port, %proxy_type, ingress, "Proxy port allocated");
        Ok((port, true))
    }

    /// Release one reference to a listener's redirect.
    ///
    /// Never fails: unknown names and zero-count unconfigured records
    /// are no-ops, so cleanup paths can call this unconditionally. On
    /// the last reference the port is returned to the set and zeroed;
    /// `rules_port` is deliberately left for later rule cleanup.
    ///
    /// Returns whether the durable view changed.
    pub(crate) fn release(&self, name: &str) -> bool {
        let mut state = self.lock();
        let State { ports, port_set } = &mut *state;

        let Some(pp) = ports.get_mut(name) else {
            return false;
        };

        if pp.n_redirects > 0 {
            pp.n_redirects -= 1;
            if pp.n_redirects > 0 {
                return false;
            }
        }

        if !pp.configured {
            return false;
        }

        pp.configured = false;
        if !pp.is_static && pp.port != 0 {
            port_set.release(pp.port);
            pp.port = 0;
        }
        debug!(listener = name, rules_port = pp.rules_port, "Proxy port released");
        true
    }

    /// The per-listener guard serializing ack and release; `None` for
    /// names that were never seen.
    pub(crate) fn ack_guard(&self, name: &str) -> Option<Arc<tokio::sync::Mutex<()>>> {
        let state = self.lock();
        state.ports.get(name).map(|pp| Arc::clone(&pp.ack_lock))
    }

    /// First half of an ack: snapshot the state needed to decide
    /// whether datapath rules must be installed. Callers must hold the
    /// listener's [`Self::ack_guard`].
    pub(crate) fn begin_ack(&self, name: &str) -> Result<AckState, ProxyError> {
        let state = self.lock();
        let pp = state
            .ports
            .get(name)
            .ok_or_else(|| ProxyError::ListenerNotFound(name.to_string()))?;
        if !pp.configured || pp.port == 0 {
            return Err(ProxyError::NotConfigured(name.to_string()));
        }
        Ok(AckState {
            port: pp.port,
            ingress: pp.ingress,
            needs_install: pp.n_redirects == 0,
        })
    }

    /// Second half of an ack, after rule installation (if any)
    /// succeeded: bump the reference count and commit `rules_port`.
    pub(crate) fn complete_ack(&self, name: &str, installed_port: Option<u16>) -> Result<(), ProxyError> {
        let mut state = self.lock();
        let pp = state
            .ports
            .get_mut(name)
            .ok_or_else(|| ProxyError::ListenerNotFound(name.to_string()))?;
        if !pp.configured {
            return Err(ProxyError::NotConfigured(name.to_string()));
        }
        if let Some(port) = installed_port {
            pp.rules_port = port;
        }
        pp.n_redirects += 1;
        debug!(
            listener = name,
            n_redirects = pp.n_redirects,
            rules_port = pp.rules_port,
            "Proxy port acked"
        );
        Ok(())
    }

    /// Serialize all records, ordered by name for a stable file.
    pub(crate) fn snapshot(&self) -> Vec<ProxyPortRecord> {
        let state = self.lock();
        let mut records: Vec<_> = state.ports.values().map(ProxyPort::to_record).collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    /// Populate the registry from checkpoint records.
    ///
    /// Restored entries come back known-but-unconfigured: `port = 0`,
    /// `configured = false`, no redirects. Re-binding happens through
    /// the normal allocate/ack path as policies are re-evaluated.
    /// Static listeners keep their fixed port. When the datapath
    /// reports a live rule for a restored name, the live port wins over
    /// the checkpointed `rules_port`.
    pub(crate) fn restore(&self, records: Vec<ProxyPortRecord>, live_rules: &HashMap<String, u16>) {
        let mut state = self.lock();
        let mut restored = 0usize;

        for record in records {
            if state.ports.contains_key(&record.name) {
                // Already registered this run (e.g. a static listener);
                // live state wins over the checkpoint.
                continue;
            }

            let mut pp = ProxyPort::new(record.proxy_type, &record.name, record.ingress);
            pp.is_static = record.is_static;
            pp.rules_port = record.rules_port;
            if record.is_static {
                pp.port = record.port;
            }

            if let Some(&live_port) = live_rules.get(&record.name) {
                if live_port != pp.rules_port {
                    warn!(
                        listener = %record.name,
                        checkpoint_port = pp.rules_port,
                        live_port,
                        "Datapath rules disagree with checkpoint; trusting datapath"
                    );
                    pp.rules_port = live_port;
                }
            }

            state.ports.insert(record.name.clone(), pp);
            restored += 1;
        }

        info!(restored, "Restored proxy ports from checkpoint");
    }

    /// Claim a port behind the allocator's back, as if some other
    /// process on the host bound it.
    #[cfg(test)]
    pub(crate) fn mark_port_in_use(&self, port: u16) {
        self.lock().port_set.mark_in_use(port);
    }
}

/// Snapshot handed from [`ProxyPortRegistry::begin_ack`] to the manager
/// while the registry lock is released.
pub(crate) struct AckState {
    pub(crate) port: u16,
    pub(crate) ingress: bool,
    pub(crate) needs_install: bool,
}
