//! Interface to the packet-forwarding layer.
//!
//! The proxy port manager does not install forwarding rules itself; it
//! drives an implementation of [`DatapathUpdater`] provided by the
//! datapath backend. The trait is async because rule installation may
//! block on kernel or network I/O, and callers must not hold registry
//! locks across it.

use std::collections::HashMap;

use async_trait::async_trait;

/// Operations the datapath backend exposes to the proxy port manager.
#[async_trait]
pub trait DatapathUpdater: Send + Sync {
    /// Install (or update) the rules redirecting matching traffic for
    /// `name` into the proxy listening on `proxy_port`.
    async fn install_proxy_rules(
        &self,
        proxy_port: u16,
        ingress: bool,
        name: &str,
    ) -> anyhow::Result<()>;

    /// Whether the datapath can preserve the original source address
    /// when redirecting into a proxy.
    fn supports_original_source_addr(&self) -> bool;

    /// The proxy redirect rules currently live in the datapath, by
    /// listener name. Queried at startup to reconcile restored state.
    fn get_proxy_ports(&self) -> HashMap<String, u16>;
}

/// In-memory [`DatapathUpdater`] that records installed rules.
///
/// Used by tests and by the agent's dry-run mode.
#[derive(Debug, Default)]
pub struct MockDatapath {
    installed: std::sync::Mutex<HashMap<String, u16>>,
    install_count: std::sync::atomic::AtomicU64,
    fail_installs: std::sync::atomic::AtomicBool,
}

impl MockDatapath {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `install_proxy_rules` calls fail.
    pub fn set_fail_installs(&self, fail: bool) {
        self.fail_installs
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    /// Number of successful `install_proxy_rules` calls so far.
    pub fn install_count(&self) -> u64 {
        self.install_count
            .load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Pre-seed a live rule, as if it survived an agent restart.
    pub fn seed_rule(&self, name: &str, port: u16) {
        self.installed
            .lock()
            .expect("mock datapath lock poisoned")
            .insert(name.to_string(), port);
    }
}

#[async_trait]
impl DatapathUpdater for MockDatapath {
    async fn install_proxy_rules(
        &self,
        proxy_port: u16,
        _ingress: bool,
        name: &str,
    ) -> anyhow::Result<()> {
        if self.fail_installs.load(std::sync::atomic::Ordering::SeqCst) {
            anyhow::bail!("mock datapath: install failure requested");
        }
        self.installed
            .lock()
            .expect("mock datapath lock poisoned")
            .insert(name.to_string(), proxy_port);
        self.install_count
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    fn supports_original_source_addr(&self) -> bool {
        true
    }

    fn get_proxy_ports(&self) -> HashMap<String, u16> {
        self.installed
            .lock()
            .expect("mock datapath lock poisoned")
            .clone()
    }
}
