//! Maps decoded requests onto the registered user services.
//!
//! The dispatcher is the terminal handler of the server chain; the serve loop
//! never calls it directly, only through the composed chain. An RPC for an
//! unregistered service fails with unimplemented.

use std::sync::Arc;

use async_trait::async_trait;
use csirpc::Status;

use crate::context::RequestContext;
use crate::controller::Controller;
use crate::identity::Identity;
use crate::message::{CsiRequest, CsiResponse};
use crate::middleware::ServerHandler;
use crate::node::Node;

/// The registered services of one plug-in.
#[derive(Clone)]
pub struct ServiceDispatcher {
    /// Identity service; always present
    identity: Arc<dyn Identity>,
    /// Controller service, when registered by mode selection
    controller: Option<Arc<dyn Controller>>,
    /// Node service, when registered by mode selection
    node: Option<Arc<dyn Node>>,
}

impl ServiceDispatcher {
    /// Create a dispatcher over the registered services.
    #[must_use]
    pub fn new(
        identity: Arc<dyn Identity>,
        controller: Option<Arc<dyn Controller>>,
        node: Option<Arc<dyn Node>>,
    ) -> Self {
        Self {
            identity,
            controller,
            node,
        }
    }

    fn controller(&self) -> Result<&Arc<dyn Controller>, Status> {
        self.controller
            .as_ref()
            .ok_or_else(|| Status::unimplemented("controller service is not registered"))
    }

    fn node(&self) -> Result<&Arc<dyn Node>, Status> {
        self.node
            .as_ref()
            .ok_or_else(|| Status::unimplemented("node service is not registered"))
    }
}

#[async_trait]
impl ServerHandler for ServiceDispatcher {
    async fn call(
        &self,
        ctx: &mut RequestContext,
        req: CsiRequest,
    ) -> Result<CsiResponse, Status> {
        let ctx = &*ctx;
        match req {
            // --- Identity ---------------------------------------------------
            CsiRequest::GetPluginInfo(r) => Ok(CsiResponse::GetPluginInfo(
                self.identity.get_plugin_info(ctx, r).await?,
            )),
            CsiRequest::GetPluginCapabilities(r) => Ok(CsiResponse::GetPluginCapabilities(
                self.identity.get_plugin_capabilities(ctx, r).await?,
            )),
            CsiRequest::Probe(r) => Ok(CsiResponse::Probe(self.identity.probe(ctx, r).await?)),

            // --- Controller -------------------------------------------------
            CsiRequest::CreateVolume(r) => Ok(CsiResponse::CreateVolume(
                self.controller()?.create_volume(ctx, r).await?,
            )),
            CsiRequest::DeleteVolume(r) => Ok(CsiResponse::DeleteVolume(
                self.controller()?.delete_volume(ctx, r).await?,
            )),
            CsiRequest::ControllerPublishVolume(r) => Ok(CsiResponse::ControllerPublishVolume(
                self.controller()?.controller_publish_volume(ctx, r).await?,
            )),
            CsiRequest::ControllerUnpublishVolume(r) => {
                Ok(CsiResponse::ControllerUnpublishVolume(
                    self.controller()?
                        .controller_unpublish_volume(ctx, r)
                        .await?,
                ))
            }
            CsiRequest::ValidateVolumeCapabilities(r) => {
                Ok(CsiResponse::ValidateVolumeCapabilities(
                    self.controller()?
                        .validate_volume_capabilities(ctx, r)
                        .await?,
                ))
            }
            CsiRequest::ListVolumes(r) => Ok(CsiResponse::ListVolumes(
                self.controller()?.list_volumes(ctx, r).await?,
            )),
            CsiRequest::GetCapacity(r) => Ok(CsiResponse::GetCapacity(
                self.controller()?.get_capacity(ctx, r).await?,
            )),
            CsiRequest::ControllerGetCapabilities(r) => {
                Ok(CsiResponse::ControllerGetCapabilities(
                    self.controller()?
                        .controller_get_capabilities(ctx, r)
                        .await?,
                ))
            }
            CsiRequest::ListSnapshots(r) => Ok(CsiResponse::ListSnapshots(
                self.controller()?.list_snapshots(ctx, r).await?,
            )),

            // --- Node -------------------------------------------------------
            CsiRequest::NodeStageVolume(r) => Ok(CsiResponse::NodeStageVolume(
                self.node()?.node_stage_volume(ctx, r).await?,
            )),
            CsiRequest::NodeUnstageVolume(r) => Ok(CsiResponse::NodeUnstageVolume(
                self.node()?.node_unstage_volume(ctx, r).await?,
            )),
            CsiRequest::NodePublishVolume(r) => Ok(CsiResponse::NodePublishVolume(
                self.node()?.node_publish_volume(ctx, r).await?,
            )),
            CsiRequest::NodeUnpublishVolume(r) => Ok(CsiResponse::NodeUnpublishVolume(
                self.node()?.node_unpublish_volume(ctx, r).await?,
            )),
            CsiRequest::NodeGetCapabilities(r) => Ok(CsiResponse::NodeGetCapabilities(
                self.node()?.node_get_capabilities(ctx, r).await?,
            )),
            CsiRequest::NodeGetInfo(r) => Ok(CsiResponse::NodeGetInfo(
                self.node()?.node_get_info(ctx, r).await?,
            )),
        }
    }
}
