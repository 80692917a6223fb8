//! Request-id injection.
//!
//! Every server-observed request and every outgoing client request carries a
//! numeric identifier in metadata under `csi.requestid`. The counter is
//! process-global and starts at one; ids are strictly increasing in
//! assignment order but carry no happens-before meaning.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use csirpc::{MetaData, Status};

use crate::context::{RequestContext, REQUEST_ID_KEY};
use crate::message::{CsiRequest, CsiResponse, Method};
use crate::middleware::{ClientInterceptor, ClientNext, ServerInterceptor, ServerNext};

/// Process-global request-id counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// The request-id interceptor. Stateless; the counter is process-global.
#[derive(Debug, Default, Clone, Copy)]
pub struct RequestIdInjector;

impl RequestIdInjector {
    /// Create a new injector.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ServerInterceptor for RequestIdInjector {
    /// Keep a well-formed incoming id; otherwise assign a fresh one and make
    /// it visible to downstream stages. A malformed incoming id is ignored
    /// and replaced, never an error.
    async fn handle(
        &self,
        ctx: &mut RequestContext,
        req: CsiRequest,
        next: ServerNext<'_>,
    ) -> Result<CsiResponse, Status> {
        if ctx.request_id().is_none() {
            let id = next_request_id();
            ctx.meta_mut().insert(REQUEST_ID_KEY, id.to_string());
        }
        next.run(ctx, req).await
    }
}

#[async_trait]
impl ClientInterceptor for RequestIdInjector {
    /// Append a fresh id to the outgoing metadata. A caller-supplied entry is
    /// never overwritten.
    async fn handle(
        &self,
        meta: &mut MetaData,
        method: Method,
        req: CsiRequest,
        next: ClientNext<'_>,
    ) -> Result<CsiResponse, Status> {
        if meta.get(REQUEST_ID_KEY).is_none() {
            let id = next_request_id();
            meta.insert(REQUEST_ID_KEY, id.to_string());
        }
        next.run(meta, method, req).await
    }
}
