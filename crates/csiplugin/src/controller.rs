//! CSI Controller service trait.
//!
//! The Controller service manages the centralized volume lifecycle: creation,
//! deletion, attach/detach, capability validation, listing, and capacity
//! queries. Registered when the plug-in runs in `controller` mode (or in the
//! combined default mode).

use async_trait::async_trait;
use csirpc::Status;

use crate::context::RequestContext;
use crate::proto::*;

/// Controller service — centralized volume management.
#[async_trait]
pub trait Controller: Send + Sync {
    /// Provision a new volume.
    ///
    /// The returned [`Volume`] carries the assigned `volume_id` and the
    /// `volume_context` that must be forwarded to subsequent operations.
    async fn create_volume(
        &self,
        ctx: &RequestContext,
        req: CreateVolumeRequest,
    ) -> Result<CreateVolumeResponse, Status>;

    /// Delete a previously provisioned volume.
    async fn delete_volume(
        &self,
        ctx: &RequestContext,
        req: DeleteVolumeRequest,
    ) -> Result<DeleteVolumeResponse, Status>;

    /// Make a volume available on the named node.
    async fn controller_publish_volume(
        &self,
        ctx: &RequestContext,
        req: ControllerPublishVolumeRequest,
    ) -> Result<ControllerPublishVolumeResponse, Status>;

    /// Revoke a previous publish on the named node.
    async fn controller_unpublish_volume(
        &self,
        ctx: &RequestContext,
        req: ControllerUnpublishVolumeRequest,
    ) -> Result<ControllerUnpublishVolumeResponse, Status>;

    /// Check whether the given capabilities are compatible with the volume.
    async fn validate_volume_capabilities(
        &self,
        ctx: &RequestContext,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> Result<ValidateVolumeCapabilitiesResponse, Status>;

    /// List volumes known to this controller.
    async fn list_volumes(
        &self,
        ctx: &RequestContext,
        req: ListVolumesRequest,
    ) -> Result<ListVolumesResponse, Status>;

    /// Return the available capacity of the storage pool.
    async fn get_capacity(
        &self,
        ctx: &RequestContext,
        req: GetCapacityRequest,
    ) -> Result<GetCapacityResponse, Status>;

    /// Advertise the controller RPCs this plugin supports.
    async fn controller_get_capabilities(
        &self,
        ctx: &RequestContext,
        req: ControllerGetCapabilitiesRequest,
    ) -> Result<ControllerGetCapabilitiesResponse, Status>;

    /// List snapshots known to this controller.
    async fn list_snapshots(
        &self,
        ctx: &RequestContext,
        req: ListSnapshotsRequest,
    ) -> Result<ListSnapshotsResponse, Status>;
}
