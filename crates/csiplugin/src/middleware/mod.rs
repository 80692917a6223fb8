//! The interceptor pipeline.
//!
//! Every inbound RPC flows through the composed server chain before the user
//! service runs; every outbound client call flows through the client chain
//! before the wire invoker runs. Interception order is left-to-right, the
//! post-invocation unwind observes results right-to-left, and an empty chain
//! reduces to a direct terminal invocation.

use std::sync::Arc;

use async_trait::async_trait;
use csirpc::{MetaData, Status};

use crate::context::RequestContext;
use crate::message::{CsiRequest, CsiResponse, Method};

pub mod logging;
pub mod requestid;
pub mod serialvolume;
pub mod specvalidator;

/// A server-side interceptor.
///
/// Implementations may short-circuit with an error, mutate the context, or
/// call `next` and observe its result.
#[async_trait]
pub trait ServerInterceptor: Send + Sync {
    /// Intercept one RPC.
    async fn handle(
        &self,
        ctx: &mut RequestContext,
        req: CsiRequest,
        next: ServerNext<'_>,
    ) -> Result<CsiResponse, Status>;
}

/// The terminal handler of a server chain (the service dispatcher).
#[async_trait]
pub trait ServerHandler: Send + Sync {
    /// Invoke the user service for this request.
    async fn call(&self, ctx: &mut RequestContext, req: CsiRequest)
        -> Result<CsiResponse, Status>;
}

/// The rest of a server chain, handed to each interceptor as its `next`.
pub struct ServerNext<'a> {
    /// Interceptors not yet run
    rest: &'a [Arc<dyn ServerInterceptor>],
    /// The terminal handler
    terminal: &'a dyn ServerHandler,
}

impl ServerNext<'_> {
    /// Run the remainder of the chain.
    ///
    /// # Errors
    /// Whatever the downstream stages produce.
    pub async fn run(
        self,
        ctx: &mut RequestContext,
        req: CsiRequest,
    ) -> Result<CsiResponse, Status> {
        match self.rest.split_first() {
            Some((head, rest)) => {
                let next = ServerNext {
                    rest,
                    terminal: self.terminal,
                };
                head.handle(ctx, req, next).await
            }
            None => self.terminal.call(ctx, req).await,
        }
    }
}

/// A composed server chain. Built exactly once per plug-in; the dispatcher
/// only ever reaches the user service through it.
#[derive(Clone, Default)]
pub struct ServerChain {
    /// The interceptors, outermost first
    interceptors: Vec<Arc<dyn ServerInterceptor>>,
}

impl ServerChain {
    /// Compose a chain from interceptors, outermost first.
    #[must_use]
    pub fn new(interceptors: Vec<Arc<dyn ServerInterceptor>>) -> Self {
        Self { interceptors }
    }

    /// Number of interceptors in the chain.
    #[must_use]
    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    /// Whether the chain is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Run a request through the chain into `terminal`.
    ///
    /// # Errors
    /// Whatever the chain or the terminal handler produce.
    pub async fn call(
        &self,
        ctx: &mut RequestContext,
        req: CsiRequest,
        terminal: &dyn ServerHandler,
    ) -> Result<CsiResponse, Status> {
        ServerNext {
            rest: &self.interceptors,
            terminal,
        }
        .run(ctx, req)
        .await
    }
}

/// A client-side interceptor, symmetric to [`ServerInterceptor`] with the
/// outgoing metadata in place of a full request context.
#[async_trait]
pub trait ClientInterceptor: Send + Sync {
    /// Intercept one outgoing call.
    async fn handle(
        &self,
        meta: &mut MetaData,
        method: Method,
        req: CsiRequest,
        next: ClientNext<'_>,
    ) -> Result<CsiResponse, Status>;
}

/// The terminal invoker of a client chain (the wire transport).
#[async_trait]
pub trait ClientInvoker: Send + Sync {
    /// Perform the wire exchange.
    async fn invoke(
        &self,
        meta: &mut MetaData,
        method: Method,
        req: CsiRequest,
    ) -> Result<CsiResponse, Status>;
}

/// The rest of a client chain.
pub struct ClientNext<'a> {
    /// Interceptors not yet run
    rest: &'a [Arc<dyn ClientInterceptor>],
    /// The terminal invoker
    terminal: &'a dyn ClientInvoker,
}

impl ClientNext<'_> {
    /// Run the remainder of the chain.
    ///
    /// # Errors
    /// Whatever the downstream stages produce.
    pub async fn run(
        self,
        meta: &mut MetaData,
        method: Method,
        req: CsiRequest,
    ) -> Result<CsiResponse, Status> {
        match self.rest.split_first() {
            Some((head, rest)) => {
                let next = ClientNext {
                    rest,
                    terminal: self.terminal,
                };
                head.handle(meta, method, req, next).await
            }
            None => self.terminal.invoke(meta, method, req).await,
        }
    }
}

/// A composed client chain.
#[derive(Clone, Default)]
pub struct ClientChain {
    /// The interceptors, outermost first
    interceptors: Vec<Arc<dyn ClientInterceptor>>,
}

impl ClientChain {
    /// Compose a chain from interceptors, outermost first.
    #[must_use]
    pub fn new(interceptors: Vec<Arc<dyn ClientInterceptor>>) -> Self {
        Self { interceptors }
    }

    /// Run an outgoing call through the chain into `terminal`.
    ///
    /// # Errors
    /// Whatever the chain or the terminal invoker produce.
    pub async fn call(
        &self,
        meta: &mut MetaData,
        method: Method,
        req: CsiRequest,
        terminal: &dyn ClientInvoker,
    ) -> Result<CsiResponse, Status> {
        ClientNext {
            rest: &self.interceptors,
            terminal,
        }
        .run(meta, method, req)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PluginConfig;
    use crate::context::OptionLookup;
    use crate::proto::{CreateVolumeRequest, CreateVolumeResponse};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ServerHandler for Echo {
        async fn call(
            &self,
            _ctx: &mut RequestContext,
            _req: CsiRequest,
        ) -> Result<CsiResponse, Status> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(CsiResponse::CreateVolume(CreateVolumeResponse::default()))
        }
    }

    struct Tag {
        label: &'static str,
        trace: Arc<std::sync::Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl ServerInterceptor for Tag {
        async fn handle(
            &self,
            ctx: &mut RequestContext,
            req: CsiRequest,
            next: ServerNext<'_>,
        ) -> Result<CsiResponse, Status> {
            self.trace.lock().unwrap().push(self.label);
            let rep = next.run(ctx, req).await;
            self.trace.lock().unwrap().push(self.label);
            rep
        }
    }

    struct Reject;

    #[async_trait]
    impl ServerInterceptor for Reject {
        async fn handle(
            &self,
            _ctx: &mut RequestContext,
            _req: CsiRequest,
            _next: ServerNext<'_>,
        ) -> Result<CsiResponse, Status> {
            Err(Status::invalid_argument("rejected"))
        }
    }

    fn test_ctx() -> RequestContext {
        RequestContext::new(
            Method::CreateVolume,
            MetaData::new(),
            OptionLookup::new(Arc::new(PluginConfig::new())),
        )
    }

    fn create_req() -> CsiRequest {
        CsiRequest::CreateVolume(CreateVolumeRequest {
            name: "v1".to_string(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn empty_chain_invokes_terminal_once() {
        let chain = ServerChain::default();
        let echo = Echo {
            calls: AtomicUsize::new(0),
        };
        let mut ctx = test_ctx();
        let rep = chain.call(&mut ctx, create_req(), &echo).await;
        assert!(rep.is_ok());
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn chain_order_left_to_right_then_unwind() {
        let trace = Arc::new(std::sync::Mutex::new(Vec::new()));
        let chain = ServerChain::new(vec![
            Arc::new(Tag {
                label: "a",
                trace: Arc::clone(&trace),
            }),
            Arc::new(Tag {
                label: "b",
                trace: Arc::clone(&trace),
            }),
        ]);
        let echo = Echo {
            calls: AtomicUsize::new(0),
        };
        let mut ctx = test_ctx();
        chain.call(&mut ctx, create_req(), &echo).await.unwrap();
        assert_eq!(*trace.lock().unwrap(), vec!["a", "b", "b", "a"]);
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn error_short_circuits_descent() {
        let trace = Arc::new(std::sync::Mutex::new(Vec::new()));
        let chain = ServerChain::new(vec![
            Arc::new(Tag {
                label: "outer",
                trace: Arc::clone(&trace),
            }),
            Arc::new(Reject),
        ]);
        let echo = Echo {
            calls: AtomicUsize::new(0),
        };
        let mut ctx = test_ctx();
        let err = chain.call(&mut ctx, create_req(), &echo).await.unwrap_err();
        assert_eq!(err.code(), csirpc::Code::InvalidArgument);
        // The terminal handler is never reached.
        assert_eq!(echo.calls.load(Ordering::SeqCst), 0);
        // The outer interceptor still observes the unwind.
        assert_eq!(*trace.lock().unwrap(), vec!["outer", "outer"]);
    }
}
