//! CSI Identity service trait.
//!
//! The Identity service allows callers to discover plugin metadata and check
//! plugin health. Every CSI plug-in must supply an implementation; the
//! runtime refuses to serve without one.

use async_trait::async_trait;
use csirpc::Status;

use crate::context::RequestContext;
use crate::proto::*;

/// Identity service — plugin discovery and health probing.
///
/// Methods are invoked by the runtime only after the composed interceptor
/// chain has run.
#[async_trait]
pub trait Identity: Send + Sync {
    /// Return the plugin name, vendor version, and manifest.
    async fn get_plugin_info(
        &self,
        ctx: &RequestContext,
        req: GetPluginInfoRequest,
    ) -> Result<GetPluginInfoResponse, Status>;

    /// Advertise the capabilities supported by this plugin.
    async fn get_plugin_capabilities(
        &self,
        ctx: &RequestContext,
        req: GetPluginCapabilitiesRequest,
    ) -> Result<GetPluginCapabilitiesResponse, Status>;

    /// Liveness probe.
    async fn probe(&self, ctx: &RequestContext, req: ProbeRequest)
        -> Result<ProbeResponse, Status>;
}
