//! # csiplugin — a runtime for hosting CSI storage plug-ins
//!
//! `csiplugin` takes a user-provided trio of storage services (Identity,
//! Controller, Node) and exposes them as a single RPC endpoint behind a
//! consistent middleware pipeline: request identification, structured
//! logging with redaction, CSI message-shape validation, and serialized
//! per-volume access with a pluggable (in-memory or etcd-backed) lock
//! provider.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`proto`] | CSI v1 wire messages (`prost` derives). |
//! | [`identity`], [`controller`], [`node`] | The service traits a plug-in author implements. |
//! | [`message`] | [`Method`] identities and the [`CsiRequest`]/[`CsiResponse`] envelopes. |
//! | [`context`] | Per-request context: metadata, deadline, option lookup chain. |
//! | [`config`] | Option names, the option store, and parsers. |
//! | [`endpoint`] | `CSI_ENDPOINT` resolution, listener binding, socket permissions. |
//! | [`middleware`] | Interceptor contracts, chain composition, and the built-in interceptors. |
//! | [`dispatch`] | The terminal handler mapping requests onto registered services. |
//! | [`transport`] | The serving loop and the unary client. |
//! | [`plugin`] | [`StoragePlugin`]: registration, lifecycle, shutdown. |
//! | [`run`] | The process entry helper with signal trapping and exit codes. |
//!
//! ## Serving a plug-in
//!
//! ```no_run
//! use std::sync::Arc;
//! use csiplugin::{Endpoint, StoragePlugin};
//! # async fn serve(identity: Arc<dyn csiplugin::Identity>,
//! #                node: Arc<dyn csiplugin::Node>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let plugin = StoragePlugin::new()
//!     .with_identity(identity)
//!     .with_node(node);
//! let listener = Endpoint::parse("unix:///var/run/csi.sock")?.bind().await?;
//! plugin.serve(listener).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod controller;
pub mod dispatch;
pub mod endpoint;
pub mod identity;
pub mod message;
pub mod middleware;
pub mod node;
pub mod plugin;
pub mod proto;
pub mod run;
pub mod transport;

pub use context::{OptionLookup, RequestContext, REQUEST_ID_KEY};
pub use controller::Controller;
pub use dispatch::ServiceDispatcher;
pub use endpoint::{BoundListener, Endpoint, EndpointError};
pub use identity::Identity;
pub use message::{CsiRequest, CsiResponse, Method, Service};
pub use middleware::{
    ClientChain, ClientInterceptor, ServerChain, ServerHandler, ServerInterceptor,
};
pub use node::Node;
pub use plugin::{BeforeServeFn, StoragePlugin};
pub use run::run;
pub use transport::{CsiClient, StopMode};

// The wire-level status type is part of this crate's public API surface.
pub use csirpc::{Code, MetaData, Status};
