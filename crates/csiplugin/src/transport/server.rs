//! The serving loop.
//!
//! Accepts connections on the bound listener and spawns a task per
//! connection; each connection carries sequential unary exchanges. Every
//! request is funneled through the composed interceptor chain into the
//! service dispatcher; the loop never touches the user services directly.

use std::sync::Arc;
use std::time::{Duration, Instant};

use csirpc::{envelope, read_method, Frame, FrameReader, FrameWriter, MetaData, Status};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::{OptionLookup, RequestContext, REQUEST_ID_KEY, TIMEOUT_KEY};
use crate::dispatch::ServiceDispatcher;
use crate::endpoint::{BoundListener, IoStream};
use crate::message::{CsiRequest, Method};
use crate::middleware::ServerChain;

/// How a server is being stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Stop accepting and wait for in-flight RPCs to drain
    Graceful,
    /// Abort everything now
    Immediate,
}

/// The wired-up server: chain, dispatcher, and configuration.
pub(crate) struct RpcServer {
    /// The composed interceptor chain
    chain: ServerChain,
    /// The registered services
    dispatcher: ServiceDispatcher,
    /// Option lookup handed to every request context
    options: OptionLookup,
    /// Cancels every in-flight request context on immediate stop
    cancel: CancellationToken,
}

impl RpcServer {
    pub(crate) fn new(
        chain: ServerChain,
        dispatcher: ServiceDispatcher,
        options: OptionLookup,
    ) -> Self {
        Self {
            chain,
            dispatcher,
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// Accept and serve until a stop is signalled or the listener fails.
    ///
    /// On [`StopMode::Graceful`] every connection finishes its in-flight
    /// exchange before the call returns; on [`StopMode::Immediate`] all
    /// connection tasks are aborted.
    pub(crate) async fn serve(
        self: Arc<Self>,
        listener: BoundListener,
        mut shutdown: watch::Receiver<Option<StopMode>>,
    ) -> Result<(), Status> {
        info!(endpoint = %listener.describe(), "serving");
        let mut connections = JoinSet::new();

        let mode = loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break StopMode::Immediate;
                    }
                    if let Some(mode) = *shutdown.borrow() {
                        break mode;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok(stream) => {
                            let server = Arc::clone(&self);
                            let rx = shutdown.clone();
                            connections.spawn(async move {
                                server.handle_connection(stream, rx).await;
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            connections.abort_all();
                            while connections.join_next().await.is_some() {}
                            return Err(Status::from(e));
                        }
                    }
                }
            }
        };

        // Close the accepting socket before draining.
        drop(listener);

        match mode {
            StopMode::Immediate => {
                // Let in-flight waits observe cancellation before the tasks
                // are torn down.
                self.cancel.cancel();
                connections.abort_all();
                while connections.join_next().await.is_some() {}
                info!("stopped");
            }
            StopMode::Graceful => {
                while connections.join_next().await.is_some() {}
                info!("gracefully stopped");
            }
        }
        Ok(())
    }

    /// Serve sequential unary exchanges on one connection until the peer
    /// hangs up or a shutdown is signalled.
    async fn handle_connection(
        &self,
        stream: IoStream,
        mut shutdown: watch::Receiver<Option<StopMode>>,
    ) {
        let (mut reader, mut writer) = tokio::io::split(stream);
        loop {
            let method_path = tokio::select! {
                _ = shutdown.changed() => break,
                res = read_method(&mut reader) => match res {
                    Ok(path) => path,
                    Err(e) => {
                        debug!(error = %e, "connection closed");
                        break;
                    }
                }
            };

            if let Err(e) = self
                .handle_exchange(&method_path, &mut reader, &mut writer)
                .await
            {
                debug!(method = %method_path, error = %e, "exchange failed");
                break;
            }
        }
    }

    /// One request/response exchange. An RPC-level failure is written as a
    /// STATUS frame; only transport failures propagate as errors.
    async fn handle_exchange<R, W>(
        &self,
        method_path: &str,
        reader: &mut R,
        writer: &mut W,
    ) -> Result<(), Status>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let mut frames = FrameReader::new_request(&mut *reader);
        let data = match frames.read_frame().await? {
            Frame::Data(data) => data,
            frame => {
                return Err(Status::internal(format!(
                    "expected DATA frame, got {frame:?}"
                )))
            }
        };
        match frames.read_frame().await? {
            Frame::End => {}
            frame => {
                return Err(Status::internal(format!(
                    "expected END frame, got {frame:?}"
                )))
            }
        }

        let result = match Method::from_path(method_path) {
            Some(method) => self.dispatch_unary(method, &data).await,
            None => Err(Status::unimplemented(format!(
                "unknown method: {method_path}"
            ))),
        };

        let mut frames = FrameWriter::new(&mut *writer);
        match result {
            Ok(payload) => {
                frames.write_frame(&Frame::Data(payload)).await?;
                frames
                    .write_frame(&Frame::Status(Status::ok().to_wire()))
                    .await?;
            }
            Err(status) => {
                frames.write_frame(&Frame::Status(status.to_wire())).await?;
            }
        }
        frames.flush().await
    }

    /// Decode, run the chain, encode.
    async fn dispatch_unary(&self, method: Method, data: &[u8]) -> Result<Vec<u8>, Status> {
        let (meta, payload) = envelope::decode(data)
            .map_err(|e| Status::internal(format!("malformed request envelope: {e}")))?;
        let req = CsiRequest::decode(method, payload)?;

        let mut ctx = RequestContext::new(method, meta, self.options.clone())
            .with_cancellation(self.cancel.clone());
        if let Some(ms) = ctx
            .meta()
            .get(TIMEOUT_KEY)
            .and_then(|s| s.parse::<u64>().ok())
        {
            ctx = ctx.with_deadline(Instant::now() + Duration::from_millis(ms));
        }

        let rep = self.chain.call(&mut ctx, req, &self.dispatcher).await?;

        // Echo the request id so the client can correlate the response.
        let mut rep_meta = MetaData::new();
        if let Some(id) = ctx.meta().get(REQUEST_ID_KEY) {
            rep_meta.insert(REQUEST_ID_KEY, id);
        }
        envelope::encode(&rep.encode_to_vec(), &rep_meta)
            .map_err(|e| Status::internal(format!("encode response envelope: {e}")))
    }
}
