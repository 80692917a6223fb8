//! CSI Node service trait.
//!
//! The Node service runs on each worker node and performs the local
//! operations that make a volume available to workloads:
//!
//! 1. **Stage** — mount the volume at a node-global path.
//! 2. **Publish** — expose the staged volume at the workload target path.
//! 3. **Unpublish** — remove the target path.
//! 4. **Unstage** — tear down the global mount.

use async_trait::async_trait;
use csirpc::Status;

use crate::context::RequestContext;
use crate::proto::*;

/// Node service — per-node mount and publish operations.
#[async_trait]
pub trait Node: Send + Sync {
    /// Stage a volume at the node-global staging path. Idempotent.
    async fn node_stage_volume(
        &self,
        ctx: &RequestContext,
        req: NodeStageVolumeRequest,
    ) -> Result<NodeStageVolumeResponse, Status>;

    /// Unstage a previously staged volume. Idempotent.
    async fn node_unstage_volume(
        &self,
        ctx: &RequestContext,
        req: NodeUnstageVolumeRequest,
    ) -> Result<NodeUnstageVolumeResponse, Status>;

    /// Publish a staged volume at the workload target path. Idempotent.
    async fn node_publish_volume(
        &self,
        ctx: &RequestContext,
        req: NodePublishVolumeRequest,
    ) -> Result<NodePublishVolumeResponse, Status>;

    /// Unpublish a volume from the workload target path. Idempotent.
    async fn node_unpublish_volume(
        &self,
        ctx: &RequestContext,
        req: NodeUnpublishVolumeRequest,
    ) -> Result<NodeUnpublishVolumeResponse, Status>;

    /// Advertise the node RPCs this plugin supports.
    async fn node_get_capabilities(
        &self,
        ctx: &RequestContext,
        req: NodeGetCapabilitiesRequest,
    ) -> Result<NodeGetCapabilitiesResponse, Status>;

    /// Return information about the node this service runs on.
    async fn node_get_info(
        &self,
        ctx: &RequestContext,
        req: NodeGetInfoRequest,
    ) -> Result<NodeGetInfoResponse, Status>;
}
