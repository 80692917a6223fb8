//! The storage plug-in runtime: service registration, interceptor assembly,
//! serving, and shutdown.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use csirpc::Status;
use tokio::sync::watch;
use tracing::info;

use crate::config::{self, PluginConfig};
use crate::context::{EnvLookupFn, OptionLookup};
use crate::controller::Controller;
use crate::dispatch::ServiceDispatcher;
use crate::endpoint::BoundListener;
use crate::identity::Identity;
use crate::node::Node;
use crate::middleware::logging::LoggingInterceptor;
use crate::middleware::requestid::RequestIdInjector;
use crate::middleware::serialvolume::etcd::{EtcdConfig, EtcdLockProvider};
use crate::middleware::serialvolume::SerialVolumeAccess;
use crate::middleware::specvalidator::SpecValidator;
use crate::middleware::{ServerChain, ServerInterceptor};
use crate::transport::server::{RpcServer, StopMode};

/// Key prefix for distributed volume locks.
const LOCK_PREFIX: &str = "/csiplugin/locks";

/// A hook invoked after interceptor assembly, just before serving begins.
/// Returning an error aborts startup.
pub type BeforeServeFn =
    Box<dyn FnOnce(&OptionLookup, &BoundListener) -> Result<(), Status> + Send>;

/// A CSI storage plug-in: the user's services plus the runtime state needed
/// to serve them behind the composed interceptor chain.
///
/// The chain is built exactly once, inside [`StoragePlugin::serve`];
/// rebuilding while serving is not possible.
pub struct StoragePlugin {
    /// Identity service; required
    identity: Option<Arc<dyn Identity>>,
    /// Controller service; required in `controller` mode
    controller: Option<Arc<dyn Controller>>,
    /// Node service; required in `node` mode
    node: Option<Arc<dyn Node>>,
    /// Additional user interceptors, run innermost (after the built-ins)
    interceptors: Vec<Arc<dyn ServerInterceptor>>,
    /// Optional before-serve hook
    before_serve: Mutex<Option<BeforeServeFn>>,
    /// The plug-in's option map
    config: Arc<PluginConfig>,
    /// Injected environment lookup, mostly for tests
    env_fn: Option<EnvLookupFn>,
    /// Serve-once latch
    serving: AtomicBool,
    /// Shutdown signal; `None` until a stop is requested
    shutdown: watch::Sender<Option<StopMode>>,
    /// Completion signal, set when the serve loop has fully drained
    done: watch::Sender<bool>,
    /// Unix-socket path once bound, for unlink-on-shutdown
    sock_path: OnceLock<PathBuf>,
    /// Unlink-once latch
    sock_removed: AtomicBool,
}

impl StoragePlugin {
    /// Create a plug-in with no services registered.
    #[must_use]
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(None);
        let (done, _) = watch::channel(false);
        Self {
            identity: None,
            controller: None,
            node: None,
            interceptors: Vec::new(),
            before_serve: Mutex::new(None),
            config: Arc::new(PluginConfig::new()),
            env_fn: None,
            serving: AtomicBool::new(false),
            shutdown,
            done,
            sock_path: OnceLock::new(),
            sock_removed: AtomicBool::new(false),
        }
    }

    /// Register the Identity service.
    #[must_use]
    pub fn with_identity(mut self, identity: Arc<dyn Identity>) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Register the Controller service.
    #[must_use]
    pub fn with_controller(mut self, controller: Arc<dyn Controller>) -> Self {
        self.controller = Some(controller);
        self
    }

    /// Register the Node service.
    #[must_use]
    pub fn with_node(mut self, node: Arc<dyn Node>) -> Self {
        self.node = Some(node);
        self
    }

    /// Append a user interceptor. It runs after the built-in chain and
    /// before the user service.
    #[must_use]
    pub fn with_interceptor(mut self, interceptor: Arc<dyn ServerInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Install a before-serve hook.
    #[must_use]
    pub fn with_before_serve(self, hook: BeforeServeFn) -> Self {
        *self.before_serve.lock().unwrap_or_else(|e| e.into_inner()) = Some(hook);
        self
    }

    /// Replace the option map.
    #[must_use]
    pub fn with_config(mut self, config: Arc<PluginConfig>) -> Self {
        self.config = config;
        self
    }

    /// Inject an environment lookup function (the middle step of the option
    /// chain). Tests use this instead of mutating the process environment.
    #[must_use]
    pub fn with_env_fn(mut self, env_fn: EnvLookupFn) -> Self {
        self.env_fn = Some(env_fn);
        self
    }

    /// The plug-in's option lookup chain.
    #[must_use]
    pub fn options(&self) -> OptionLookup {
        let lookup = OptionLookup::new(Arc::clone(&self.config));
        match &self.env_fn {
            Some(env_fn) => lookup.with_env_fn(Arc::clone(env_fn)),
            None => lookup,
        }
    }

    /// Serve on the bound listener until stopped.
    ///
    /// Builds the interceptor chain from options, registers services by
    /// mode, invokes the before-serve hook, and then accepts connections.
    /// Returns when the server has fully stopped; the unix socket file, if
    /// any, has been unlinked by then.
    ///
    /// # Errors
    /// Any initialization failure is fatal; serving failures propagate.
    pub async fn serve(&self, listener: BoundListener) -> Result<(), Status> {
        if self.serving.swap(true, Ordering::SeqCst) {
            return Err(Status::failed_precondition("plug-in is already serving"));
        }
        if let Some(path) = listener.unix_path() {
            let _ = self.sock_path.set(path.to_owned());
        }

        let result = self.serve_inner(listener).await;

        self.remove_sock_file();
        let _ = self.done.send(true);
        result
    }

    async fn serve_inner(&self, listener: BoundListener) -> Result<(), Status> {
        let options = self.options();

        // Debug mode implies debug logging plus both logging phases.
        if options.bool(config::DEBUG) {
            self.config.set(config::LOG_LEVEL, "debug");
            self.config.set(config::REQ_LOGGING, "true");
            self.config.set(config::REP_LOGGING, "true");
        }

        let chain = self.build_chain(&options).await?;
        let dispatcher = self.build_dispatcher(&options)?;

        if let Some(hook) = self
            .before_serve
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            hook(&options, &listener)?;
        }

        let server = Arc::new(RpcServer::new(chain, dispatcher, options));
        server.serve(listener, self.shutdown.subscribe()).await
    }

    /// Compose the server chain: request-id, logging, spec validation,
    /// serial volume access, then any user interceptors.
    async fn build_chain(&self, options: &OptionLookup) -> Result<ServerChain, Status> {
        let mut interceptors: Vec<Arc<dyn ServerInterceptor>> =
            vec![Arc::new(RequestIdInjector::new())];

        let req_logging = options.bool(config::REQ_LOGGING);
        let rep_logging = options.bool(config::REP_LOGGING);
        if req_logging || rep_logging {
            let mut logging = LoggingInterceptor::new();
            if req_logging {
                logging = logging.with_request_logging(TracingWriter::default());
            }
            if rep_logging {
                logging = logging.with_response_logging(TracingWriter::default());
            }
            if options.bool(config::LOG_DISABLE_VOL_CTX) {
                logging = logging.with_disable_log_volume_context();
            }
            interceptors.push(Arc::new(logging));
        }

        let validator = SpecValidator::from_options(options);
        if validator.is_active() {
            interceptors.push(Arc::new(validator));
        }

        if options.bool(config::SERIAL_VOL_ACCESS) {
            let mut serial = SerialVolumeAccess::new();
            if let Some(timeout) = options.duration(config::SERIAL_VOL_ACCESS_TIMEOUT) {
                serial = serial.with_timeout(timeout);
            }
            if !options
                .getenv(config::SERIAL_VOL_ACCESS_ETCD_ENDPOINTS)
                .trim()
                .is_empty()
            {
                let cfg = EtcdConfig::from_options(options)?;
                let provider = EtcdLockProvider::new(LOCK_PREFIX, cfg).await?;
                serial = serial.with_lock_provider(Arc::new(provider));
            }
            interceptors.push(Arc::new(serial));
        }

        interceptors.extend(self.interceptors.iter().cloned());
        Ok(ServerChain::new(interceptors))
    }

    /// Select and register services by mode. The Identity service is always
    /// required; `controller` and `node` modes require the eponymous service,
    /// and any other mode registers whichever of the two are present (at
    /// least one must be).
    fn build_dispatcher(&self, options: &OptionLookup) -> Result<ServiceDispatcher, Status> {
        let identity = self
            .identity
            .as_ref()
            .ok_or_else(|| Status::failed_precondition("identity service is required"))?;

        let mode = options.getenv(config::MODE).trim().to_ascii_lowercase();
        let (controller, node) = match mode.as_str() {
            "controller" => {
                let controller = self.controller.as_ref().ok_or_else(|| {
                    Status::failed_precondition("controller service is required")
                })?;
                (Some(Arc::clone(controller)), None)
            }
            "node" => {
                let node = self
                    .node
                    .as_ref()
                    .ok_or_else(|| Status::failed_precondition("node service is required"))?;
                (None, Some(Arc::clone(node)))
            }
            _ => {
                if self.controller.is_none() && self.node.is_none() {
                    return Err(Status::failed_precondition(
                        "either a controller or node service is required",
                    ));
                }
                (self.controller.clone(), self.node.clone())
            }
        };

        info!("identity service registered");
        if controller.is_some() {
            info!("controller service registered");
        }
        if node.is_some() {
            info!("node service registered");
        }
        Ok(ServiceDispatcher::new(
            Arc::clone(identity),
            controller,
            node,
        ))
    }

    /// Stop immediately, aborting active RPCs. Idempotent; a later stop
    /// request never downgrades an earlier one.
    pub async fn stop(&self) {
        self.signal(StopMode::Immediate);
        self.wait_done().await;
        info!("stopped");
    }

    /// Stop gracefully: no new RPCs are accepted and the call returns once
    /// every in-flight RPC has drained. Idempotent.
    pub async fn graceful_stop(&self) {
        self.signal(StopMode::Graceful);
        self.wait_done().await;
        info!("gracefully stopped");
    }

    fn signal(&self, mode: StopMode) {
        self.shutdown.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(mode);
                true
            } else {
                false
            }
        });
    }

    async fn wait_done(&self) {
        if !self.serving.load(Ordering::SeqCst) {
            return;
        }
        let mut rx = self.done.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Unlink the unix socket file. Runs at most once per process lifetime
    /// of this plug-in, whichever shutdown path gets here first.
    pub(crate) fn remove_sock_file(&self) {
        if self.sock_removed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(path) = self.sock_path.get() {
            if std::fs::remove_file(path).is_ok() {
                info!(path = %path.display(), "removed sock file");
            }
        }
    }
}

impl Default for StoragePlugin {
    fn default() -> Self {
        Self::new()
    }
}

/// Forwards sink lines to `tracing` at info level. Wired in when request or
/// response logging is enabled without an explicit sink.
#[derive(Debug, Default, Clone)]
struct TracingWriter {
    /// Carry-over for partial lines
    buf: Vec<u8>,
}

impl std::io::Write for TracingWriter {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(data);
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            info!("{line}");
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
