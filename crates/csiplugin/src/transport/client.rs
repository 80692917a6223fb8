//! A thin unary client over one connection.
//!
//! Sends one request at a time and reads its response before the next call;
//! the client interceptor chain (request-id injection, logging) runs around
//! every exchange. The richer CLI that drives a plug-in is external to this
//! crate.

use std::time::Duration;

use async_trait::async_trait;
use csirpc::{envelope, write_method, Frame, FrameReader, FrameWriter, MetaData, Status};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::Mutex;
use tracing::debug;

use crate::context::TIMEOUT_KEY;
use crate::endpoint::{Endpoint, IoStream};
use crate::message::{CsiRequest, CsiResponse, Method};
use crate::middleware::{ClientChain, ClientInvoker};

/// A CSI client bound to a single server connection.
pub struct CsiClient {
    /// The connection; exchanges are strictly sequential
    io: Mutex<IoStream>,
    /// The client interceptor chain
    chain: ClientChain,
    /// Per-call budget propagated to the server as a deadline
    timeout: Option<Duration>,
}

impl CsiClient {
    /// Connect to the server at `endpoint`.
    ///
    /// # Errors
    /// Connection failures surface as [`Status::unavailable`].
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, Status> {
        let io = match endpoint {
            Endpoint::Tcp(addr) => IoStream::Tcp(
                TcpStream::connect(addr.as_str())
                    .await
                    .map_err(|e| Status::unavailable(format!("connect {addr}: {e}")))?,
            ),
            Endpoint::Unix(path) => IoStream::Unix(
                UnixStream::connect(path)
                    .await
                    .map_err(|e| {
                        Status::unavailable(format!("connect {}: {e}", path.display()))
                    })?,
            ),
        };
        debug!(endpoint = ?endpoint, "csi client connected");
        Ok(Self {
            io: Mutex::new(io),
            chain: ClientChain::default(),
            timeout: None,
        })
    }

    /// Install the client interceptor chain.
    #[must_use]
    pub fn with_interceptors(mut self, chain: ClientChain) -> Self {
        self.chain = chain;
        self
    }

    /// Set the per-call budget. It bounds the whole exchange locally and is
    /// propagated to the server as the request deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Invoke one RPC through the interceptor chain.
    ///
    /// # Errors
    /// The server's status for failed RPCs, [`Status::deadline_exceeded`]
    /// when the local budget runs out, transport failures otherwise.
    pub async fn invoke(&self, method: Method, req: CsiRequest) -> Result<CsiResponse, Status> {
        let mut meta = MetaData::new();
        if let Some(timeout) = self.timeout {
            meta.insert(TIMEOUT_KEY, timeout.as_millis().to_string());
        }
        self.chain.call(&mut meta, method, req, &WireInvoker { client: self }).await
    }

    /// The raw exchange: method header, request frames, response frames.
    async fn exchange(
        &self,
        meta: &MetaData,
        method: Method,
        req: &CsiRequest,
    ) -> Result<CsiResponse, Status> {
        let mut io = self.io.lock().await;

        write_method(&mut *io, method.path()).await?;
        let sealed = envelope::encode(&req.encode_to_vec(), meta)
            .map_err(|e| Status::internal(format!("encode request envelope: {e}")))?;
        let mut frames = FrameWriter::new(&mut *io);
        frames.write_frame(&Frame::Data(sealed)).await?;
        frames.write_frame(&Frame::End).await?;
        frames.flush().await?;

        let mut frames = FrameReader::new_response(&mut *io);
        let data = match frames.read_frame().await? {
            Frame::Data(data) => data,
            Frame::Status(payload) => {
                // The server failed the RPC before producing a response.
                return Err(Status::from_wire(&payload));
            }
            Frame::End => return Err(Status::internal("unexpected END frame in response")),
        };
        let status = match frames.read_frame().await? {
            Frame::Status(payload) => Status::from_wire(&payload),
            frame => {
                return Err(Status::internal(format!(
                    "expected STATUS frame, got {frame:?}"
                )))
            }
        };
        if status.code() != csirpc::Code::Ok {
            return Err(status);
        }

        let (_rep_meta, payload) = envelope::decode(&data)
            .map_err(|e| Status::internal(format!("malformed response envelope: {e}")))?;
        CsiResponse::decode(method, payload)
    }
}

/// The terminal invoker of the client chain: the wire exchange itself.
struct WireInvoker<'a> {
    /// The owning client
    client: &'a CsiClient,
}

#[async_trait]
impl ClientInvoker for WireInvoker<'_> {
    async fn invoke(
        &self,
        meta: &mut MetaData,
        method: Method,
        req: CsiRequest,
    ) -> Result<CsiResponse, Status> {
        match self.client.timeout {
            Some(budget) => tokio::time::timeout(budget, self.client.exchange(meta, method, &req))
                .await
                .map_err(|_| {
                    Status::deadline_exceeded(format!("call budget exhausted: {}", method.name()))
                })?,
            None => self.client.exchange(meta, method, &req).await,
        }
    }
}
