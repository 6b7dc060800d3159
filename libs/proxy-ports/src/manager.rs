//! The proxy port manager: ties the registry, allocator, redirect
//! lifecycle, and checkpoint persistence together.
//!
//! One manager exists per agent process and lives for the lifetime of
//! the network control plane. All state is owned by the manager; there
//! is no ambient/static allocation map.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use npa_trigger::{Trigger, TriggerParams};
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::ProxyConfig;
use crate::datapath::DatapathUpdater;
use crate::error::ProxyError;
use crate::redirect::{
    FinalizeFn, ParserType, Redirect, RedirectRules, RedirectSpec, RedirectUpdate, RevertFn,
};
use crate::registry::{ProxyPort, ProxyPortRegistry, ProxyType};

/// Well-known listener name for a built-in proxy kind and direction.
fn builtin_listener_name(proxy_type: ProxyType, ingress: bool) -> String {
    let direction = if ingress { "ingress" } else { "egress" };
    format!("{proxy_type}-{direction}")
}

/// Owns proxy port allocation and redirect lifecycle for the agent.
pub struct ProxyPortManager {
    config: ProxyConfig,
    registry: ProxyPortRegistry,
    datapath: Arc<dyn DatapathUpdater>,
    redirects: Mutex<HashMap<String, Redirect>>,
    checkpoint: CheckpointStore,
    /// Armed by [`Self::start`], after restore.
    trigger: OnceLock<Trigger>,
}

impl ProxyPortManager {
    pub fn new(config: ProxyConfig, datapath: Arc<dyn DatapathUpdater>) -> Self {
        let registry = ProxyPortRegistry::new(config.min_port, config.max_port);
        let checkpoint = CheckpointStore::new(&config.state_dir);
        Self {
            config,
            registry,
            datapath,
            redirects: Mutex::new(HashMap::new()),
            checkpoint,
            trigger: OnceLock::new(),
        }
    }

    /// Restore the registry from the last checkpoint and arm the
    /// debounced checkpoint writer.
    ///
    /// Restore happens before the trigger exists so the file being read
    /// cannot be overwritten by an early write. Must be called from
    /// within a tokio runtime.
    pub fn start(&self) {
        if self.trigger.get().is_some() {
            warn!("Proxy port manager already started");
            return;
        }

        let records = match self.checkpoint.load(self.config.restore_age_limit) {
            Ok(records) => records,
            Err(error) => {
                // A broken checkpoint is not fatal; ports are re-bound
                // through policy re-evaluation either way.
                warn!(error = %error, "Failed to load proxy ports checkpoint, starting fresh");
                Vec::new()
            }
        };
        let live_rules = self.datapath.get_proxy_ports();
        self.registry.restore(records, &live_rules);

        let registry = self.registry.clone();
        let store = self.checkpoint.clone();
        let trigger = Trigger::new(TriggerParams {
            name: "proxy-ports-checkpoint".to_string(),
            min_interval: self.config.checkpoint_min_interval,
            on_trigger: Box::new(move || {
                let registry = registry.clone();
                let store = store.clone();
                Box::pin(async move {
                    let records = registry.snapshot();
                    if let Err(error) = store.save(&records) {
                        warn!(error = %error, "Failed to write proxy ports checkpoint");
                    }
                })
            }),
        });
        let _ = self.trigger.set(trigger);

        info!(
            min_port = self.config.min_port,
            max_port = self.config.max_port,
            original_source_addr = self.datapath.supports_original_source_addr(),
            "Proxy port manager started"
        );
    }

    /// Flush one final checkpoint and stop the writer. The registry
    /// must not be torn down before this returns.
    pub async fn shutdown(&self) {
        if let Some(trigger) = self.trigger.get() {
            trigger.shutdown().await;
        }
    }

    fn request_checkpoint(&self) {
        if let Some(trigger) = self.trigger.get() {
            trigger.trigger();
        }
    }

    /// Look up a listener record by full identity. Returns a snapshot.
    pub fn find(&self, proxy_type: ProxyType, name: &str, ingress: bool) -> Option<ProxyPort> {
        self.registry.find(proxy_type, name, ingress)
    }

    /// Current allocated port for a listener name; `Some(0)` for a
    /// lingering released record.
    pub fn get_proxy_port(&self, name: &str) -> Option<u16> {
        self.registry.get_proxy_port(name)
    }

    /// Listener names with a currently open port.
    pub fn open_listener_ports(&self) -> HashMap<String, u16> {
        self.registry.open_listener_ports()
    }

    /// Whether redirected traffic keeps its original source address.
    pub fn supports_original_source_addr(&self) -> bool {
        self.datapath.supports_original_source_addr()
    }

    /// Register a listener with a fixed port that the allocator must
    /// never reassign.
    pub fn register_static_listener(
        &self,
        name: &str,
        proxy_type: ProxyType,
        ingress: bool,
        port: u16,
    ) {
        self.registry
            .register_static_listener(name, proxy_type, ingress, port);
        self.request_checkpoint();
    }

    /// Allocate (or re-confirm) the port backing a listener.
    ///
    /// Idempotent: an already configured listener returns its existing
    /// port. A lingering record prefers its last committed `rules_port`
    /// when that port is still free.
    pub fn allocate_proxy_port(
        &self,
        name: &str,
        proxy_type: ProxyType,
        ingress: bool,
    ) -> Result<u16, ProxyError> {
        let (port, changed) = self.registry.allocate(name, proxy_type, ingress)?;
        if changed {
            self.request_checkpoint();
        }
        Ok(port)
    }

    /// Allocate a port for a CRD-defined listener, registering it so
    /// later redirects can resolve it by name.
    pub fn allocate_crd_proxy_port(&self, name: &str) -> Result<u16, ProxyError> {
        self.allocate_proxy_port(name, ProxyType::Crd, false)
    }

    /// Confirm that a redirect using this listener's port is live.
    ///
    /// The first ack per configuration cycle pushes the port into
    /// datapath rules and commits it as `rules_port`; every successful
    /// ack takes one reference. Rule installation runs with the
    /// registry lock released, serialized per listener. Cancelling
    /// (dropping) this future before installation completes leaves the
    /// reference count unchanged.
    pub async fn ack_proxy_port(&self, name: &str) -> Result<(), ProxyError> {
        let guard = self
            .registry
            .ack_guard(name)
            .ok_or_else(|| ProxyError::ListenerNotFound(name.to_string()))?;
        let _guard = guard.lock().await;

        // Re-read under the ack guard; a concurrent ack may have
        // installed the rules already.
        let ack = self.registry.begin_ack(name)?;
        let installed_port = if ack.needs_install {
            self.datapath
                .install_proxy_rules(ack.port, ack.ingress, name)
                .await
                .map_err(|source| ProxyError::RuleInstall {
                    name: name.to_string(),
                    port: ack.port,
                    source,
                })?;
            Some(ack.port)
        } else {
            None
        };

        self.registry.complete_ack(name, installed_port)?;
        self.request_checkpoint();
        Ok(())
    }

    /// Drop one reference to a listener's redirect.
    ///
    /// Always safe to call, including for names that were never
    /// allocated; redundant releases are no-ops. Serialized against any
    /// in-flight ack for the same listener, so a teardown can never
    /// interleave with rule installation.
    pub async fn release_proxy_port(&self, name: &str) {
        let Some(guard) = self.registry.ack_guard(name) else {
            return;
        };
        let _guard = guard.lock().await;
        if self.registry.release(name) {
            self.request_checkpoint();
        }
    }

    /// Resolve a policy's L7 configuration to a listener, bring its
    /// port up, and stage the redirect's rules.
    ///
    /// `proxy_id` identifies the caller's redirect across updates. On
    /// success the staged rules are not yet visible to traffic: the
    /// caller commits them through [`RedirectUpdate::finalize`] or
    /// discards them through [`RedirectUpdate::revert`] as part of its
    /// own policy transaction.
    pub async fn create_or_update_redirect(
        self: &Arc<Self>,
        spec: &RedirectSpec,
        proxy_id: &str,
    ) -> Result<RedirectUpdate, ProxyError> {
        let proxy_type = spec.parser_type.proxy_type();
        let name = match spec.parser_type {
            ParserType::Crd => {
                // CRD listeners must have been registered up front; a
                // listener pending creation fails the whole update.
                let name = spec.listener_name.clone().unwrap_or_default();
                if self
                    .registry
                    .find(ProxyType::Crd, &name, spec.ingress)
                    .is_none()
                {
                    return Err(ProxyError::ListenerNotFound(name));
                }
                name
            }
            _ => builtin_listener_name(proxy_type, spec.ingress),
        };

        // One reference is held per redirect, not per update: only a
        // newly created redirect allocates and acks. An update of an
        // existing redirect stages rules without touching the count.
        let created = !self
            .redirects
            .lock()
            .expect("redirect map lock poisoned")
            .contains_key(proxy_id);

        let port = if created {
            let was_configured = self
                .registry
                .find(proxy_type, &name, spec.ingress)
                .map(|pp| pp.configured)
                .unwrap_or(false);

            let port = self.allocate_proxy_port(&name, proxy_type, spec.ingress)?;

            if let Err(error) = self.ack_proxy_port(&name).await {
                // Unwind a fresh allocation; a previously configured
                // listener keeps its state.
                if !was_configured {
                    self.release_proxy_port(&name).await;
                }
                return Err(error);
            }
            port
        } else {
            self.registry.get_proxy_port(&name).unwrap_or(0)
        };

        {
            let mut redirects = self
                .redirects
                .lock()
                .expect("redirect map lock poisoned");
            let redirect = redirects
                .entry(proxy_id.to_string())
                .or_insert_with(|| Redirect::new(name.clone()));
            redirect.stage(RedirectRules::from_spec(spec));
        }
        debug!(proxy_id, listener = %name, port, created, "Staged redirect update");

        let finalize: FinalizeFn = {
            let manager = Arc::clone(self);
            let proxy_id = proxy_id.to_string();
            Box::new(move || manager.finalize_redirect(&proxy_id))
        };
        let revert: RevertFn = {
            let manager = Arc::clone(self);
            let proxy_id = proxy_id.to_string();
            let name = name.clone();
            Box::new(move || {
                Box::pin(async move {
                    manager.revert_redirect(&proxy_id, &name, created).await;
                    Ok(())
                })
            })
        };

        Ok(RedirectUpdate {
            port,
            finalize,
            revert,
        })
    }

    fn finalize_redirect(&self, proxy_id: &str) {
        let mut redirects = self
            .redirects
            .lock()
            .expect("redirect map lock poisoned");
        if let Some(redirect) = redirects.get_mut(proxy_id) {
            redirect.finalize();
            debug!(proxy_id, listener = %redirect.listener, "Redirect finalized");
        }
    }

    async fn revert_redirect(&self, proxy_id: &str, name: &str, created: bool) {
        {
            let mut redirects = self
                .redirects
                .lock()
                .expect("redirect map lock poisoned");
            if created {
                redirects.remove(proxy_id);
            } else if let Some(redirect) = redirects.get_mut(proxy_id) {
                redirect.revert();
            }
        }
        if created {
            // Roll back the reference the creating update's ack took.
            self.release_proxy_port(name).await;
        }
        debug!(proxy_id, listener = %name, "Redirect update reverted");
    }

    /// Committed rules for a redirect, if any. Staged-only redirects
    /// return `None` until finalized.
    pub fn committed_redirect_rules(&self, proxy_id: &str) -> Option<RedirectRules> {
        let redirects = self
            .redirects
            .lock()
            .expect("redirect map lock poisoned");
        redirects
            .get(proxy_id)
            .and_then(|redirect| redirect.committed.clone())
    }
}
