//! Per-request context threaded through the interceptor chain and into the
//! user services.

use std::sync::Arc;
use std::time::{Duration, Instant};

use csirpc::MetaData;
use tokio_util::sync::CancellationToken;

use crate::config::{self, PluginConfig};
use crate::message::Method;

/// Metadata key carrying the request identifier on the wire.
pub const REQUEST_ID_KEY: &str = "csi.requestid";

/// Metadata key carrying the client's call budget in whole milliseconds.
/// The server derives the request deadline from it.
pub const TIMEOUT_KEY: &str = "csi.timeout";

/// Environment lookup function injected into the option chain.
///
/// Tests supply a synthetic function here instead of mutating the process
/// environment.
pub type EnvLookupFn = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Option lookup chain: plug-in option map, then the injected environment
/// function, then the ambient process environment.
#[derive(Clone)]
pub struct OptionLookup {
    /// The plug-in's option map
    config: Arc<PluginConfig>,
    /// Optional injected environment function
    env_fn: Option<EnvLookupFn>,
}

impl OptionLookup {
    /// Create a lookup chain over the given option map.
    #[must_use]
    pub fn new(config: Arc<PluginConfig>) -> Self {
        Self {
            config,
            env_fn: None,
        }
    }

    /// Replace the environment step of the chain.
    #[must_use]
    pub fn with_env_fn(mut self, env_fn: EnvLookupFn) -> Self {
        self.env_fn = Some(env_fn);
        self
    }

    /// The underlying option map.
    #[must_use]
    pub fn config(&self) -> &Arc<PluginConfig> {
        &self.config
    }

    /// Look an option up through the chain.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<String> {
        if let Some(value) = self.config.get(name) {
            return Some(value);
        }
        if let Some(env_fn) = &self.env_fn {
            if let Some(value) = env_fn(name) {
                return Some(value);
            }
        }
        std::env::var(name).ok()
    }

    /// Look an option up, defaulting to the empty string.
    #[must_use]
    pub fn getenv(&self, name: &str) -> String {
        self.lookup(name).unwrap_or_default()
    }

    /// Interpret an option as a boolean; absent options are false.
    #[must_use]
    pub fn bool(&self, name: &str) -> bool {
        self.lookup(name).is_some_and(|v| config::parse_bool(&v))
    }

    /// Interpret an option as a duration; absent or malformed options are
    /// `None`.
    #[must_use]
    pub fn duration(&self, name: &str) -> Option<Duration> {
        self.lookup(name).and_then(|v| config::parse_duration(&v))
    }

    /// The pre-loaded secret map from `X_CSI_SECRETS`, parsed as CSV pairs.
    #[must_use]
    pub fn secrets(&self) -> std::collections::HashMap<String, String> {
        self.lookup(config::SECRETS)
            .map(|v| config::parse_map(&v))
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for OptionLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptionLookup")
            .field("config", &self.config)
            .field("env_fn", &self.env_fn.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// Context for a single RPC.
///
/// Interceptors may rewrite the metadata (the request-id stage does) before
/// handing the context to the next stage; the user service observes the final
/// state.
#[derive(Debug)]
pub struct RequestContext {
    /// The RPC being served
    method: Method,
    /// Request metadata, visible to downstream stages
    meta: MetaData,
    /// Deadline derived from the client, if any
    deadline: Option<Instant>,
    /// Cancellation signal; fires when the server tears the request down
    cancel: CancellationToken,
    /// Option lookup chain
    options: OptionLookup,
}

impl RequestContext {
    /// Create a context for the given method with the inbound metadata.
    #[must_use]
    pub fn new(method: Method, meta: MetaData, options: OptionLookup) -> Self {
        Self {
            method,
            meta,
            deadline: None,
            cancel: CancellationToken::new(),
            options,
        }
    }

    /// Attach a deadline.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Attach a cancellation signal. The default token never fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The RPC being served.
    #[must_use]
    pub fn method(&self) -> Method {
        self.method
    }

    /// Request metadata.
    #[must_use]
    pub fn meta(&self) -> &MetaData {
        &self.meta
    }

    /// Mutable request metadata, for stages that enrich it.
    pub fn meta_mut(&mut self) -> &mut MetaData {
        &mut self.meta
    }

    /// The deadline, if the client supplied one.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Remaining time until the deadline. `None` when no deadline is set;
    /// `Some(ZERO)` when it has already passed.
    #[must_use]
    pub fn time_remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// The request's cancellation signal. Stages that block (the
    /// serial-volume wait) race against it and abandon their work when it
    /// fires.
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether the request has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Option lookup chain.
    #[must_use]
    pub fn options(&self) -> &OptionLookup {
        &self.options
    }

    /// The request id carried in metadata, if present and well-formed.
    ///
    /// A malformed id reads as absent; it never fails the RPC.
    #[must_use]
    pub fn request_id(&self) -> Option<u64> {
        self.meta
            .get(REQUEST_ID_KEY)
            .and_then(|s| s.parse::<u64>().ok())
    }
}
