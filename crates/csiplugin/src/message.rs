//! RPC method identities and the decoded request/response envelopes.
//!
//! All per-RPC policy in this crate (fingerprints, validation rules,
//! dispatch) is keyed by [`Method`] or switches over the [`CsiRequest`] /
//! [`CsiResponse`] tagged enums, so the full set of gated RPCs is reviewable
//! in one place.

use csirpc::Status;
use prost::Message as _;

use crate::proto::*;

macro_rules! define_csi_methods {
    ( $( $(#[$meta:meta])* $variant:ident : $path:literal => $req:ty, $rep:ty; )* ) => {
        /// RPC method identifier.
        ///
        /// The wire form is the gRPC-style path, e.g.
        /// `/csi.v1.Controller/CreateVolume`. Client and server must agree on
        /// the mapping (guaranteed by this single macro definition).
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Method {
            $( $(#[$meta])* $variant, )*
        }

        impl Method {
            /// All defined methods.
            pub const ALL: &'static [Method] = &[ $( Method::$variant, )* ];

            /// The full wire path of this method.
            #[must_use]
            pub fn path(self) -> &'static str {
                match self {
                    $( Self::$variant => $path, )*
                }
            }

            /// Resolve a wire path. Returns `None` for unknown methods.
            #[must_use]
            pub fn from_path(path: &str) -> Option<Self> {
                match path {
                    $( $path => Some(Self::$variant), )*
                    _ => None,
                }
            }
        }

        /// A decoded CSI request, tagged by method.
        #[derive(Debug, Clone, PartialEq)]
        pub enum CsiRequest {
            $( $(#[$meta])* $variant($req), )*
        }

        impl CsiRequest {
            /// The method this request belongs to.
            #[must_use]
            pub fn method(&self) -> Method {
                match self {
                    $( Self::$variant(_) => Method::$variant, )*
                }
            }

            /// Decode the protobuf payload of `method`.
            ///
            /// # Errors
            /// Returns [`Status::internal`] when the payload does not decode.
            pub fn decode(method: Method, bytes: &[u8]) -> Result<Self, Status> {
                Ok(match method {
                    $( Method::$variant => Self::$variant(
                        <$req>::decode(bytes).map_err(|e| Status::internal(
                            format!("decode {} request error: {e}", method.name()),
                        ))?,
                    ), )*
                })
            }

            /// Encode the protobuf payload.
            #[must_use]
            pub fn encode_to_vec(&self) -> Vec<u8> {
                match self {
                    $( Self::$variant(m) => m.encode_to_vec(), )*
                }
            }
        }

        /// A decoded CSI response, tagged by method.
        #[derive(Debug, Clone, PartialEq)]
        pub enum CsiResponse {
            $( $(#[$meta])* $variant($rep), )*
        }

        impl CsiResponse {
            /// The method this response belongs to.
            #[must_use]
            pub fn method(&self) -> Method {
                match self {
                    $( Self::$variant(_) => Method::$variant, )*
                }
            }

            /// Decode the protobuf payload of a response to `method`.
            ///
            /// # Errors
            /// Returns [`Status::internal`] when the payload does not decode.
            pub fn decode(method: Method, bytes: &[u8]) -> Result<Self, Status> {
                Ok(match method {
                    $( Method::$variant => Self::$variant(
                        <$rep>::decode(bytes).map_err(|e| Status::internal(
                            format!("decode {} response error: {e}", method.name()),
                        ))?,
                    ), )*
                })
            }

            /// Encode the protobuf payload.
            #[must_use]
            pub fn encode_to_vec(&self) -> Vec<u8> {
                match self {
                    $( Self::$variant(m) => m.encode_to_vec(), )*
                }
            }
        }
    };
}

define_csi_methods! {
    // Identity service
    /// Query plugin name and version
    GetPluginInfo : "/csi.v1.Identity/GetPluginInfo" => GetPluginInfoRequest, GetPluginInfoResponse;
    /// Query plugin capabilities
    GetPluginCapabilities : "/csi.v1.Identity/GetPluginCapabilities" => GetPluginCapabilitiesRequest, GetPluginCapabilitiesResponse;
    /// Health probe
    Probe : "/csi.v1.Identity/Probe" => ProbeRequest, ProbeResponse;

    // Controller service
    /// Provision a volume
    CreateVolume : "/csi.v1.Controller/CreateVolume" => CreateVolumeRequest, CreateVolumeResponse;
    /// Delete a volume
    DeleteVolume : "/csi.v1.Controller/DeleteVolume" => DeleteVolumeRequest, DeleteVolumeResponse;
    /// Attach a volume to a node
    ControllerPublishVolume : "/csi.v1.Controller/ControllerPublishVolume" => ControllerPublishVolumeRequest, ControllerPublishVolumeResponse;
    /// Detach a volume from a node
    ControllerUnpublishVolume : "/csi.v1.Controller/ControllerUnpublishVolume" => ControllerUnpublishVolumeRequest, ControllerUnpublishVolumeResponse;
    /// Validate volume capabilities
    ValidateVolumeCapabilities : "/csi.v1.Controller/ValidateVolumeCapabilities" => ValidateVolumeCapabilitiesRequest, ValidateVolumeCapabilitiesResponse;
    /// List volumes
    ListVolumes : "/csi.v1.Controller/ListVolumes" => ListVolumesRequest, ListVolumesResponse;
    /// Query pool capacity
    GetCapacity : "/csi.v1.Controller/GetCapacity" => GetCapacityRequest, GetCapacityResponse;
    /// Query controller capabilities
    ControllerGetCapabilities : "/csi.v1.Controller/ControllerGetCapabilities" => ControllerGetCapabilitiesRequest, ControllerGetCapabilitiesResponse;
    /// List snapshots
    ListSnapshots : "/csi.v1.Controller/ListSnapshots" => ListSnapshotsRequest, ListSnapshotsResponse;

    // Node service
    /// Stage a volume at the node-global path
    NodeStageVolume : "/csi.v1.Node/NodeStageVolume" => NodeStageVolumeRequest, NodeStageVolumeResponse;
    /// Unstage a volume
    NodeUnstageVolume : "/csi.v1.Node/NodeUnstageVolume" => NodeUnstageVolumeRequest, NodeUnstageVolumeResponse;
    /// Publish a volume at the workload target path
    NodePublishVolume : "/csi.v1.Node/NodePublishVolume" => NodePublishVolumeRequest, NodePublishVolumeResponse;
    /// Unpublish a volume
    NodeUnpublishVolume : "/csi.v1.Node/NodeUnpublishVolume" => NodeUnpublishVolumeRequest, NodeUnpublishVolumeResponse;
    /// Query node capabilities
    NodeGetCapabilities : "/csi.v1.Node/NodeGetCapabilities" => NodeGetCapabilitiesRequest, NodeGetCapabilitiesResponse;
    /// Query node identity and topology
    NodeGetInfo : "/csi.v1.Node/NodeGetInfo" => NodeGetInfoRequest, NodeGetInfoResponse;
}

/// The three CSI services a method can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    /// Identity service
    Identity,
    /// Controller service
    Controller,
    /// Node service
    Node,
}

impl Method {
    /// The method name without the service prefix, e.g. `CreateVolume`.
    #[must_use]
    pub fn name(self) -> &'static str {
        let path = self.path();
        match path.rsplit_once('/') {
            Some((_, name)) => name,
            None => path,
        }
    }

    /// The service this method belongs to.
    #[must_use]
    pub fn service(self) -> Service {
        let path = self.path();
        if path.starts_with("/csi.v1.Identity/") {
            Service::Identity
        } else if path.starts_with("/csi.v1.Controller/") {
            Service::Controller
        } else {
            Service::Node
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.path())
    }
}
