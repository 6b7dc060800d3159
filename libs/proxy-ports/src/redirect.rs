//! Redirect specifications and bookkeeping.
//!
//! A redirect is the live association between a listener, its allocated
//! port, and the L7 proxy handling traffic on it. Redirect updates are
//! two-phase: [`crate::ProxyPortManager::create_or_update_redirect`]
//! stages the new rules and returns finalize/revert closures so the
//! caller's policy transaction decides whether the change sticks.

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::ProxyError;
use crate::registry::ProxyType;

/// L7 parser kind named by a policy rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParserType {
    Http,
    Dns,
    Kafka,
    /// Parser implemented by a CRD-defined listener.
    Crd,
}

impl ParserType {
    /// The proxy kind that implements this parser.
    pub fn proxy_type(&self) -> ProxyType {
        match self {
            Self::Http => ProxyType::Http,
            Self::Dns => ProxyType::Dns,
            Self::Kafka => ProxyType::Kafka,
            Self::Crd => ProxyType::Crd,
        }
    }
}

/// Transport protocol of the redirected traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Tcp,
    Udp,
}

/// Policy-derived description of an L7 redirect.
#[derive(Debug, Clone)]
pub struct RedirectSpec {
    /// Which parser should handle the traffic.
    pub parser_type: ParserType,

    /// Name of the CRD listener to use; required for
    /// [`ParserType::Crd`], ignored otherwise.
    pub listener_name: Option<String>,

    /// Direction of the traffic being redirected.
    pub ingress: bool,

    /// Destination port the policy matches on.
    pub port: u16,

    /// Transport protocol the policy matches on.
    pub protocol: Protocol,
}

/// The rules a redirect applies, as staged or committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectRules {
    pub parser_type: ParserType,
    pub dst_port: u16,
    pub protocol: Protocol,
}

impl RedirectRules {
    pub(crate) fn from_spec(spec: &RedirectSpec) -> Self {
        Self {
            parser_type: spec.parser_type,
            dst_port: spec.port,
            protocol: spec.protocol,
        }
    }
}

/// One redirect tracked by the manager, keyed by the caller's proxy id.
#[derive(Debug)]
pub(crate) struct Redirect {
    /// Name of the listener serving this redirect.
    pub(crate) listener: String,

    /// Rules currently visible to traffic.
    pub(crate) committed: Option<RedirectRules>,

    /// Rules staged by an uncommitted update.
    pub(crate) staged: Option<RedirectRules>,
}

impl Redirect {
    pub(crate) fn new(listener: String) -> Self {
        Self {
            listener,
            committed: None,
            staged: None,
        }
    }

    pub(crate) fn stage(&mut self, rules: RedirectRules) {
        self.staged = Some(rules);
    }

    /// Make the staged rules live.
    pub(crate) fn finalize(&mut self) {
        if let Some(rules) = self.staged.take() {
            self.committed = Some(rules);
        }
    }

    /// Drop the staged rules, leaving the committed ones untouched.
    pub(crate) fn revert(&mut self) {
        self.staged = None;
    }
}

/// Closure committing a staged redirect update.
pub type FinalizeFn = Box<dyn FnOnce() + Send>;

/// Closure discarding a staged redirect update. For the update that
/// created the redirect it also rolls the listener's reference count
/// back, which is serialized against in-flight acks, hence the future.
pub type RevertFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), ProxyError>> + Send>;

/// Successful result of a redirect update: the allocated port plus the
/// two-phase commit handles.
///
/// Exactly one of `finalize` and `revert` must be invoked; invoking
/// neither leaves the redirect staged indefinitely. Both are `FnOnce`,
/// so neither can be invoked twice.
pub struct RedirectUpdate {
    /// The port the listener is bound to.
    pub port: u16,

    /// Commits the staged rules.
    pub finalize: FinalizeFn,

    /// Discards the staged rules and releases the reference taken by
    /// the update.
    pub revert: RevertFn,
}

impl std::fmt::Debug for RedirectUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedirectUpdate")
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}
