//! Serialized per-volume access.
//!
//! Prevents two RPCs that touch the same logical volume from running inside
//! the user service at the same time. The lock key (fingerprint) is the
//! volume name for CreateVolume (no id exists yet) and the volume id for
//! every other volume-bearing RPC; all remaining RPCs pass through unlocked.
//!
//! Only mutual exclusion is guaranteed. Waiters are not served FIFO. A
//! request whose context is cancelled while waiting abandons the wait and
//! fails with the cancelled status; the service is never invoked for it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use csirpc::Status;
use tracing::warn;

use crate::context::RequestContext;
use crate::message::{CsiRequest, CsiResponse};
use crate::middleware::{ServerInterceptor, ServerNext};

pub mod etcd;
pub mod lockprovider;

pub use lockprovider::{MemoryLockProvider, TryLock, VolumeLockProvider};

/// The lock key derived from a request.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Fingerprint {
    /// Lock by volume name (CreateVolume)
    Name(String),
    /// Lock by volume id
    Id(String),
    /// No locking; pass through
    None,
}

fn fingerprint(req: &CsiRequest) -> Fingerprint {
    match req {
        CsiRequest::CreateVolume(r) => Fingerprint::Name(r.name.clone()),
        CsiRequest::DeleteVolume(r) => Fingerprint::Id(r.volume_id.clone()),
        CsiRequest::ControllerPublishVolume(r) => Fingerprint::Id(r.volume_id.clone()),
        CsiRequest::ControllerUnpublishVolume(r) => Fingerprint::Id(r.volume_id.clone()),
        CsiRequest::NodeStageVolume(r) => Fingerprint::Id(r.volume_id.clone()),
        CsiRequest::NodeUnstageVolume(r) => Fingerprint::Id(r.volume_id.clone()),
        CsiRequest::NodePublishVolume(r) => Fingerprint::Id(r.volume_id.clone()),
        CsiRequest::NodeUnpublishVolume(r) => Fingerprint::Id(r.volume_id.clone()),
        _ => Fingerprint::None,
    }
}

/// The serial-volume-access interceptor.
#[derive(Clone)]
pub struct SerialVolumeAccess {
    /// Try-lock wait budget; zero fails immediately on contention
    timeout: Duration,
    /// The lock backend
    provider: Arc<dyn VolumeLockProvider>,
}

impl Default for SerialVolumeAccess {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialVolumeAccess {
    /// Create an interceptor with the in-memory provider and a zero timeout.
    #[must_use]
    pub fn new() -> Self {
        Self {
            timeout: Duration::ZERO,
            provider: Arc::new(MemoryLockProvider::new()),
        }
    }

    /// Set the try-lock wait budget.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace the lock backend.
    #[must_use]
    pub fn with_lock_provider(mut self, provider: Arc<dyn VolumeLockProvider>) -> Self {
        self.provider = provider;
        self
    }
}

#[async_trait]
impl ServerInterceptor for SerialVolumeAccess {
    async fn handle(
        &self,
        ctx: &mut RequestContext,
        req: CsiRequest,
        next: ServerNext<'_>,
    ) -> Result<CsiResponse, Status> {
        let (lock, volume) = match fingerprint(&req) {
            Fingerprint::None => return next.run(ctx, req).await,
            Fingerprint::Name(name) => (self.provider.lock_with_name(&name).await?, name),
            Fingerprint::Id(id) => (self.provider.lock_with_id(&id).await?, id),
        };

        // The wait budget is the lesser of the configured timeout and the
        // remaining request deadline.
        let mut wait = self.timeout;
        let mut deadline_bound = false;
        if let Some(remaining) = ctx.time_remaining() {
            if remaining.is_zero() {
                return Err(Status::deadline_exceeded(format!(
                    "deadline expired before lock acquisition: {volume}"
                )));
            }
            if remaining < wait {
                wait = remaining;
                deadline_bound = true;
            }
        }

        // A cancelled request abandons the wait without invoking the
        // service; timeout and cancellation surface as distinct codes.
        if ctx.is_cancelled() {
            return Err(Status::cancelled(format!(
                "request cancelled before lock acquisition: {volume}"
            )));
        }
        let cancel = ctx.cancellation();
        let acquired = tokio::select! {
            () = cancel.cancelled() => {
                return Err(Status::cancelled(format!(
                    "request cancelled while waiting for volume lock: {volume}"
                )));
            }
            acquired = lock.try_lock(wait) => acquired?,
        };
        if !acquired {
            if deadline_bound && ctx.time_remaining().is_some_and(|r| r.is_zero()) {
                return Err(Status::deadline_exceeded(format!(
                    "deadline expired before lock acquisition: {volume}"
                )));
            }
            return Err(Status::aborted(format!(
                "pending operation on volume: {volume}"
            )));
        }

        let result = next.run(ctx, req).await;

        if let Err(e) = lock.unlock().await {
            warn!(volume = %volume, error = %e, "volume lock release failed");
        }
        if let Err(e) = lock.close().await {
            warn!(volume = %volume, error = %e, "volume lock close failed");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PluginConfig;
    use crate::context::OptionLookup;
    use crate::middleware::{ServerChain, ServerHandler};
    use crate::proto::*;
    use csirpc::{Code, MetaData};
    use std::time::Instant;

    struct Immediate;

    #[async_trait]
    impl ServerHandler for Immediate {
        async fn call(
            &self,
            _ctx: &mut RequestContext,
            req: CsiRequest,
        ) -> Result<CsiResponse, Status> {
            Ok(match req {
                CsiRequest::CreateVolume(_) => {
                    CsiResponse::CreateVolume(CreateVolumeResponse::default())
                }
                CsiRequest::DeleteVolume(_) => {
                    CsiResponse::DeleteVolume(DeleteVolumeResponse::default())
                }
                CsiRequest::ControllerPublishVolume(_) => CsiResponse::ControllerPublishVolume(
                    ControllerPublishVolumeResponse::default(),
                ),
                CsiRequest::Probe(_) => CsiResponse::Probe(ProbeResponse::default()),
                _ => return Err(Status::unimplemented("test handler")),
            })
        }
    }

    /// Tracks how many callers are inside the handler at once.
    struct Slow {
        current: std::sync::atomic::AtomicUsize,
        peak: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl ServerHandler for Slow {
        async fn call(
            &self,
            _ctx: &mut RequestContext,
            _req: CsiRequest,
        ) -> Result<CsiResponse, Status> {
            use std::sync::atomic::Ordering;
            let inside = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(inside, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(CsiResponse::CreateVolume(CreateVolumeResponse::default()))
        }
    }

    fn ctx_for(req: &CsiRequest) -> RequestContext {
        RequestContext::new(
            req.method(),
            MetaData::new(),
            OptionLookup::new(Arc::new(PluginConfig::new())),
        )
    }

    fn create_req(name: &str) -> CsiRequest {
        CsiRequest::CreateVolume(CreateVolumeRequest {
            name: name.to_string(),
            ..Default::default()
        })
    }

    fn delete_req(id: &str) -> CsiRequest {
        CsiRequest::DeleteVolume(DeleteVolumeRequest {
            volume_id: id.to_string(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn uncontended_create_passes() {
        let chain = ServerChain::new(vec![Arc::new(
            SerialVolumeAccess::new().with_timeout(Duration::from_secs(1)),
        )]);
        let req = create_req("test-volume");
        let mut ctx = ctx_for(&req);
        assert!(chain.call(&mut ctx, req, &Immediate).await.is_ok());
    }

    #[tokio::test]
    async fn contended_create_aborts_and_names_volume() {
        let provider = Arc::new(MemoryLockProvider::new());
        // Hold the name lock to simulate a pending create.
        let held = provider.lock_with_name("test-volume").await.unwrap();
        assert!(held.try_lock(Duration::ZERO).await.unwrap());

        let chain = ServerChain::new(vec![Arc::new(
            SerialVolumeAccess::new()
                .with_lock_provider(provider)
                .with_timeout(Duration::from_millis(1)),
        )]);
        let req = create_req("test-volume");
        let mut ctx = ctx_for(&req);
        let err = chain.call(&mut ctx, req, &Immediate).await.unwrap_err();
        assert_eq!(err.code(), Code::Aborted);
        assert!(err.message().contains("test-volume"));
        held.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn contended_delete_aborts() {
        let provider = Arc::new(MemoryLockProvider::new());
        let held = provider.lock_with_id("vol-1").await.unwrap();
        assert!(held.try_lock(Duration::ZERO).await.unwrap());

        let chain = ServerChain::new(vec![Arc::new(
            SerialVolumeAccess::new()
                .with_lock_provider(provider)
                .with_timeout(Duration::from_millis(1)),
        )]);
        let req = delete_req("vol-1");
        let mut ctx = ctx_for(&req);
        let err = chain.call(&mut ctx, req, &Immediate).await.unwrap_err();
        assert_eq!(err.code(), Code::Aborted);
        held.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn non_volume_rpcs_pass_through() {
        let provider = Arc::new(MemoryLockProvider::new());
        // Probe has no fingerprint; a held lock on any volume is irrelevant.
        let held = provider.lock_with_id("vol-1").await.unwrap();
        assert!(held.try_lock(Duration::ZERO).await.unwrap());

        let chain = ServerChain::new(vec![Arc::new(
            SerialVolumeAccess::new().with_lock_provider(provider),
        )]);
        let req = CsiRequest::Probe(ProbeRequest::default());
        let mut ctx = ctx_for(&req);
        assert!(chain.call(&mut ctx, req, &Immediate).await.is_ok());
        held.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn same_fingerprint_executions_do_not_overlap() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let chain = Arc::new(ServerChain::new(vec![Arc::new(
            SerialVolumeAccess::new().with_timeout(Duration::from_secs(5)),
        ) as Arc<dyn ServerInterceptor>]));
        let handler = Arc::new(Slow {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });

        let mut tasks = Vec::new();
        for _ in 0..2 {
            let chain = Arc::clone(&chain);
            let handler = Arc::clone(&handler);
            tasks.push(tokio::spawn(async move {
                let req = create_req("v1");
                let mut ctx = ctx_for(&req);
                chain.call(&mut ctx, req, handler.as_ref()).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        // Both calls ran; never at the same time.
        assert_eq!(handler.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_while_waiting_returns_cancelled() {
        use tokio_util::sync::CancellationToken;

        let provider = Arc::new(MemoryLockProvider::new());
        let held = provider.lock_with_name("v1").await.unwrap();
        assert!(held.try_lock(Duration::ZERO).await.unwrap());

        let chain = ServerChain::new(vec![Arc::new(
            SerialVolumeAccess::new()
                .with_lock_provider(Arc::clone(&provider) as Arc<dyn VolumeLockProvider>)
                .with_timeout(Duration::from_secs(5)),
        )]);

        let token = CancellationToken::new();
        let req = create_req("v1");
        let mut ctx = ctx_for(&req).with_cancellation(token.clone());

        let cancel = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let start = Instant::now();
        let err = chain.call(&mut ctx, req, &Immediate).await.unwrap_err();
        assert_eq!(err.code(), Code::Cancelled);
        assert!(err.message().contains("v1"));
        // The wait was abandoned well before the configured timeout.
        assert!(start.elapsed() < Duration::from_secs(1));

        cancel.await.unwrap();
        held.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn already_cancelled_request_skips_the_wait() {
        use tokio_util::sync::CancellationToken;

        let token = CancellationToken::new();
        token.cancel();

        let chain = ServerChain::new(vec![Arc::new(
            SerialVolumeAccess::new().with_timeout(Duration::from_secs(5)),
        )]);
        let req = create_req("v1");
        let mut ctx = ctx_for(&req).with_cancellation(token);
        let err = chain.call(&mut ctx, req, &Immediate).await.unwrap_err();
        assert_eq!(err.code(), Code::Cancelled);
    }

    #[tokio::test]
    async fn expired_deadline_is_deadline_exceeded() {
        let chain = ServerChain::new(vec![Arc::new(
            SerialVolumeAccess::new().with_timeout(Duration::from_secs(5)),
        )]);
        let req = create_req("v1");
        let mut ctx = ctx_for(&req).with_deadline(Instant::now() - Duration::from_secs(1));
        let err = chain.call(&mut ctx, req, &Immediate).await.unwrap_err();
        assert_eq!(err.code(), Code::DeadlineExceeded);
    }

    #[tokio::test]
    async fn lock_released_after_service_error() {
        struct Fail;

        #[async_trait]
        impl ServerHandler for Fail {
            async fn call(
                &self,
                _ctx: &mut RequestContext,
                _req: CsiRequest,
            ) -> Result<CsiResponse, Status> {
                Err(Status::not_found("no such volume"))
            }
        }

        let provider = Arc::new(MemoryLockProvider::new());
        let chain = ServerChain::new(vec![Arc::new(
            SerialVolumeAccess::new()
                .with_lock_provider(Arc::clone(&provider) as Arc<dyn VolumeLockProvider>),
        )]);

        let req = delete_req("vol-1");
        let mut ctx = ctx_for(&req);
        // The service error passes through unchanged.
        let err = chain.call(&mut ctx, req, &Fail).await.unwrap_err();
        assert_eq!(err.code(), Code::NotFound);

        // And the lock is free again.
        let lock = provider.lock_with_id("vol-1").await.unwrap();
        assert!(lock.try_lock(Duration::ZERO).await.unwrap());
        lock.unlock().await.unwrap();
    }
}
