//! End-to-end tests: a mock plug-in served over a unix socket in a temp
//! directory, driven through the unary client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use csiplugin::proto::*;
use csiplugin::{
    Code, Controller, CsiClient, CsiRequest, CsiResponse, Endpoint, Identity, Method, Node,
    RequestContext, Status, StoragePlugin,
};
use csiplugin::config::PluginConfig;
use csiplugin::middleware::requestid::RequestIdInjector;
use csiplugin::middleware::{ClientChain, ClientInterceptor, ClientNext};
use csirpc::MetaData;

/// A mock storage plug-in. Counts service entries and records the request id
/// each call observed.
#[derive(Default)]
struct Mock {
    create_calls: AtomicUsize,
    seen_request_ids: Mutex<Vec<Option<u64>>>,
    create_delay: Option<Duration>,
    node_id: Mutex<String>,
}

impl Mock {
    fn new() -> Self {
        Self {
            node_id: Mutex::new("mock-node".to_string()),
            ..Default::default()
        }
    }

    fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    fn with_node_id(self, node_id: &str) -> Self {
        *self.node_id.lock().unwrap() = node_id.to_string();
        self
    }

    fn record(&self, ctx: &RequestContext) {
        self.seen_request_ids.lock().unwrap().push(ctx.request_id());
    }
}

#[async_trait]
impl Identity for Mock {
    async fn get_plugin_info(
        &self,
        ctx: &RequestContext,
        _req: GetPluginInfoRequest,
    ) -> Result<GetPluginInfoResponse, Status> {
        self.record(ctx);
        Ok(GetPluginInfoResponse {
            name: "io.example.mock".to_string(),
            vendor_version: "1.1.0".to_string(),
            manifest: HashMap::from([("url".to_string(), "example.com/mock".to_string())]),
        })
    }

    async fn get_plugin_capabilities(
        &self,
        ctx: &RequestContext,
        _req: GetPluginCapabilitiesRequest,
    ) -> Result<GetPluginCapabilitiesResponse, Status> {
        self.record(ctx);
        Ok(GetPluginCapabilitiesResponse {
            capabilities: vec![PluginCapability {
                r#type: Some(plugin_capability::Type::Service(
                    plugin_capability::Service {
                        r#type: plugin_capability::service::Type::ControllerService as i32,
                    },
                )),
            }],
        })
    }

    async fn probe(
        &self,
        ctx: &RequestContext,
        _req: ProbeRequest,
    ) -> Result<ProbeResponse, Status> {
        self.record(ctx);
        Ok(ProbeResponse { ready: Some(true) })
    }
}

#[async_trait]
impl Controller for Mock {
    async fn create_volume(
        &self,
        ctx: &RequestContext,
        req: CreateVolumeRequest,
    ) -> Result<CreateVolumeResponse, Status> {
        self.record(ctx);
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(CreateVolumeResponse {
            volume: Some(Volume {
                volume_id: "1".to_string(),
                capacity_bytes: req
                    .capacity_range
                    .map(|r| r.required_bytes)
                    .unwrap_or_default(),
                ..Default::default()
            }),
        })
    }

    async fn delete_volume(
        &self,
        ctx: &RequestContext,
        _req: DeleteVolumeRequest,
    ) -> Result<DeleteVolumeResponse, Status> {
        self.record(ctx);
        Ok(DeleteVolumeResponse::default())
    }

    async fn controller_publish_volume(
        &self,
        ctx: &RequestContext,
        _req: ControllerPublishVolumeRequest,
    ) -> Result<ControllerPublishVolumeResponse, Status> {
        self.record(ctx);
        Ok(ControllerPublishVolumeResponse::default())
    }

    async fn controller_unpublish_volume(
        &self,
        ctx: &RequestContext,
        _req: ControllerUnpublishVolumeRequest,
    ) -> Result<ControllerUnpublishVolumeResponse, Status> {
        self.record(ctx);
        Ok(ControllerUnpublishVolumeResponse::default())
    }

    async fn validate_volume_capabilities(
        &self,
        ctx: &RequestContext,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> Result<ValidateVolumeCapabilitiesResponse, Status> {
        self.record(ctx);
        Ok(ValidateVolumeCapabilitiesResponse {
            confirmed: Some(validate_volume_capabilities_response::Confirmed {
                volume_context: HashMap::new(),
                volume_capabilities: req.volume_capabilities,
            }),
            message: String::new(),
        })
    }

    async fn list_volumes(
        &self,
        ctx: &RequestContext,
        _req: ListVolumesRequest,
    ) -> Result<ListVolumesResponse, Status> {
        self.record(ctx);
        Ok(ListVolumesResponse::default())
    }

    async fn get_capacity(
        &self,
        ctx: &RequestContext,
        _req: GetCapacityRequest,
    ) -> Result<GetCapacityResponse, Status> {
        self.record(ctx);
        Ok(GetCapacityResponse {
            available_capacity: 1 << 40,
        })
    }

    async fn controller_get_capabilities(
        &self,
        ctx: &RequestContext,
        _req: ControllerGetCapabilitiesRequest,
    ) -> Result<ControllerGetCapabilitiesResponse, Status> {
        self.record(ctx);
        Ok(ControllerGetCapabilitiesResponse {
            capabilities: vec![ControllerServiceCapability {
                r#type: Some(controller_service_capability::Type::Rpc(
                    controller_service_capability::Rpc {
                        r#type: controller_service_capability::rpc::Type::CreateDeleteVolume
                            as i32,
                    },
                )),
            }],
        })
    }

    async fn list_snapshots(
        &self,
        ctx: &RequestContext,
        _req: ListSnapshotsRequest,
    ) -> Result<ListSnapshotsResponse, Status> {
        self.record(ctx);
        Ok(ListSnapshotsResponse::default())
    }
}

#[async_trait]
impl Node for Mock {
    async fn node_stage_volume(
        &self,
        ctx: &RequestContext,
        _req: NodeStageVolumeRequest,
    ) -> Result<NodeStageVolumeResponse, Status> {
        self.record(ctx);
        Ok(NodeStageVolumeResponse::default())
    }

    async fn node_unstage_volume(
        &self,
        ctx: &RequestContext,
        _req: NodeUnstageVolumeRequest,
    ) -> Result<NodeUnstageVolumeResponse, Status> {
        self.record(ctx);
        Ok(NodeUnstageVolumeResponse::default())
    }

    async fn node_publish_volume(
        &self,
        ctx: &RequestContext,
        _req: NodePublishVolumeRequest,
    ) -> Result<NodePublishVolumeResponse, Status> {
        self.record(ctx);
        Ok(NodePublishVolumeResponse::default())
    }

    async fn node_unpublish_volume(
        &self,
        ctx: &RequestContext,
        _req: NodeUnpublishVolumeRequest,
    ) -> Result<NodeUnpublishVolumeResponse, Status> {
        self.record(ctx);
        Ok(NodeUnpublishVolumeResponse::default())
    }

    async fn node_get_capabilities(
        &self,
        ctx: &RequestContext,
        _req: NodeGetCapabilitiesRequest,
    ) -> Result<NodeGetCapabilitiesResponse, Status> {
        self.record(ctx);
        Ok(NodeGetCapabilitiesResponse {
            capabilities: vec![NodeServiceCapability {
                r#type: Some(node_service_capability::Type::Rpc(
                    node_service_capability::Rpc {
                        r#type: node_service_capability::rpc::Type::StageUnstageVolume as i32,
                    },
                )),
            }],
        })
    }

    async fn node_get_info(
        &self,
        ctx: &RequestContext,
        _req: NodeGetInfoRequest,
    ) -> Result<NodeGetInfoResponse, Status> {
        self.record(ctx);
        Ok(NodeGetInfoResponse {
            node_id: self.node_id.lock().unwrap().clone(),
            ..Default::default()
        })
    }
}

/// A running test plug-in.
struct Harness {
    plugin: Arc<StoragePlugin>,
    mock: Arc<Mock>,
    sock: std::path::PathBuf,
    serve_task: tokio::task::JoinHandle<Result<(), Status>>,
    _dir: tempfile::TempDir,
}

impl Harness {
    async fn start(mock: Mock, options: &[&str]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("csi.sock");
        let mock = Arc::new(mock);

        let mut pairs = vec![format!("CSI_ENDPOINT=unix://{}", sock.display())];
        pairs.extend(options.iter().map(|s| (*s).to_string()));

        let plugin = Arc::new(
            StoragePlugin::new()
                .with_identity(Arc::clone(&mock) as Arc<dyn Identity>)
                .with_controller(Arc::clone(&mock) as Arc<dyn Controller>)
                .with_node(Arc::clone(&mock) as Arc<dyn Node>)
                .with_config(Arc::new(PluginConfig::from_pairs(&pairs))),
        );

        let listener = Endpoint::parse(&format!("unix://{}", sock.display()))
            .unwrap()
            .bind()
            .await
            .unwrap();

        let serve_task = tokio::spawn({
            let plugin = Arc::clone(&plugin);
            async move { plugin.serve(listener).await }
        });

        Self {
            plugin,
            mock,
            sock,
            serve_task,
            _dir: dir,
        }
    }

    async fn client(&self) -> CsiClient {
        CsiClient::connect(&Endpoint::Unix(self.sock.clone()))
            .await
            .unwrap()
            .with_interceptors(ClientChain::new(vec![Arc::new(RequestIdInjector::new())]))
    }
}

fn create_volume_request(name: &str) -> CsiRequest {
    CsiRequest::CreateVolume(CreateVolumeRequest {
        name: name.to_string(),
        volume_capabilities: vec![VolumeCapability {
            access_mode: Some(volume_capability::AccessMode {
                mode: volume_capability::access_mode::Mode::SingleNodeWriter as i32,
            }),
            access_type: Some(volume_capability::AccessType::Mount(
                volume_capability::MountVolume::default(),
            )),
        }],
        secrets: HashMap::from([("k".to_string(), "v".to_string())]),
        ..Default::default()
    })
}

#[tokio::test]
async fn create_volume_succeeds_with_all_validation() {
    let harness = Harness::start(
        Mock::new(),
        &["X_CSI_SPEC_VALIDATION=true", "X_CSI_REQUIRE_CREDS_CREATE_VOL=true"],
    )
    .await;
    let client = harness.client().await;

    let rep = client
        .invoke(Method::CreateVolume, create_volume_request("v1"))
        .await
        .unwrap();

    match rep {
        CsiResponse::CreateVolume(rep) => {
            assert_eq!(rep.volume.unwrap().volume_id, "1");
        }
        other => panic!("unexpected response: {other:?}"),
    }

    // The service observed a generated request id.
    let seen = harness.mock.seen_request_ids.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].is_some());

    harness.plugin.graceful_stop().await;
    harness.serve_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn serialized_create_aborts_second_caller() {
    let harness = Harness::start(
        Mock::new().with_create_delay(Duration::from_millis(200)),
        &[
            "X_CSI_SERIAL_VOL_ACCESS=true",
            "X_CSI_SERIAL_VOL_ACCESS_TIMEOUT=1ms",
        ],
    )
    .await;

    // Two connections so the calls are concurrent on the server.
    let first = harness.client().await;
    let second = harness.client().await;

    let slow = tokio::spawn(async move {
        first
            .invoke(Method::CreateVolume, create_volume_request("v1"))
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let contended = second
        .invoke(Method::CreateVolume, create_volume_request("v1"))
        .await;

    let err = contended.unwrap_err();
    assert_eq!(err.code(), Code::Aborted);
    assert!(err.message().contains("v1"), "message: {}", err.message());

    assert!(slow.await.unwrap().is_ok());
    harness.plugin.graceful_stop().await;
}

#[tokio::test]
async fn invalid_request_never_reaches_service() {
    let harness = Harness::start(
        Mock::new(),
        &["X_CSI_SPEC_VALIDATION=true", "X_CSI_SERIAL_VOL_ACCESS=true"],
    )
    .await;
    let client = harness.client().await;

    let err = client
        .invoke(
            Method::CreateVolume,
            CsiRequest::CreateVolume(CreateVolumeRequest::default()),
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), Code::InvalidArgument);
    assert!(err.message().contains("Name"));
    assert_eq!(harness.mock.create_calls.load(Ordering::SeqCst), 0);

    harness.plugin.graceful_stop().await;
}

/// Injects a fixed request id ahead of the id injector.
struct FixedId(u64);

#[async_trait]
impl ClientInterceptor for FixedId {
    async fn handle(
        &self,
        meta: &mut MetaData,
        method: Method,
        req: CsiRequest,
        next: ClientNext<'_>,
    ) -> Result<CsiResponse, Status> {
        meta.insert(csiplugin::REQUEST_ID_KEY, self.0.to_string());
        next.run(meta, method, req).await
    }
}

#[tokio::test]
async fn incoming_request_id_is_preserved() {
    let harness = Harness::start(Mock::new(), &[]).await;
    let client = CsiClient::connect(&Endpoint::Unix(harness.sock.clone()))
        .await
        .unwrap()
        .with_interceptors(ClientChain::new(vec![
            Arc::new(FixedId(42)),
            Arc::new(RequestIdInjector::new()),
        ]));

    client
        .invoke(Method::Probe, CsiRequest::Probe(ProbeRequest::default()))
        .await
        .unwrap();

    let seen = harness.mock.seen_request_ids.lock().unwrap().clone();
    assert_eq!(seen, vec![Some(42)]);

    harness.plugin.graceful_stop().await;
}

#[tokio::test]
async fn graceful_stop_removes_socket_file() {
    let harness = Harness::start(Mock::new(), &[]).await;
    let client = harness.client().await;
    client
        .invoke(Method::Probe, CsiRequest::Probe(ProbeRequest::default()))
        .await
        .unwrap();
    assert!(harness.sock.exists());

    harness.plugin.graceful_stop().await;
    harness.serve_task.await.unwrap().unwrap();
    assert!(!harness.sock.exists());
}

#[tokio::test]
async fn graceful_stop_drains_in_flight_rpcs() {
    let harness = Harness::start(
        Mock::new().with_create_delay(Duration::from_millis(150)),
        &[],
    )
    .await;
    let client = harness.client().await;

    let call = tokio::spawn(async move {
        client
            .invoke(Method::CreateVolume, create_volume_request("v1"))
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    harness.plugin.graceful_stop().await;

    // The RPC that entered before the stop completed exactly once.
    assert!(call.await.unwrap().is_ok());
    assert_eq!(harness.mock.create_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn oversized_node_id_fails_response_validation() {
    let harness = Harness::start(
        Mock::new().with_node_id(&"n".repeat(257)),
        &["X_CSI_SPEC_REP_VALIDATION=true"],
    )
    .await;
    let client = harness.client().await;

    let err = client
        .invoke(
            Method::NodeGetInfo,
            CsiRequest::NodeGetInfo(NodeGetInfoRequest::default()),
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), Code::InvalidArgument);
    assert!(err.message().contains("NodeId"));

    harness.plugin.graceful_stop().await;
}

#[tokio::test]
async fn controller_mode_leaves_node_unregistered() {
    let harness = Harness::start(Mock::new(), &["X_CSI_MODE=Controller"]).await;
    let client = harness.client().await;

    // Controller RPCs work.
    client
        .invoke(Method::CreateVolume, create_volume_request("v1"))
        .await
        .unwrap();

    // Node RPCs are unimplemented.
    let err = client
        .invoke(
            Method::NodeGetInfo,
            CsiRequest::NodeGetInfo(NodeGetInfoRequest::default()),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);

    harness.plugin.graceful_stop().await;
}

#[tokio::test]
async fn node_mode_requires_node_service() {
    let dir = tempfile::tempdir().unwrap();
    let sock = dir.path().join("csi.sock");
    let mock = Arc::new(Mock::new());

    let plugin = StoragePlugin::new()
        .with_identity(mock as Arc<dyn Identity>)
        .with_config(Arc::new(PluginConfig::from_pairs([
            format!("CSI_ENDPOINT=unix://{}", sock.display()),
            "X_CSI_MODE=node".to_string(),
        ])));

    let listener = Endpoint::Unix(sock).bind().await.unwrap();
    let err = plugin.serve(listener).await.unwrap_err();
    assert!(err.message().contains("node service is required"));
}

#[tokio::test]
async fn immediate_stop_aborts_in_flight_rpcs() {
    let harness = Harness::start(
        Mock::new().with_create_delay(Duration::from_secs(30)),
        &[],
    )
    .await;
    let client = harness.client().await;

    let call = tokio::spawn(async move {
        client
            .invoke(Method::CreateVolume, create_volume_request("v1"))
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    harness.plugin.stop().await;

    // The aborted exchange surfaces as a transport-level failure.
    assert!(call.await.unwrap().is_err());
    harness.serve_task.await.unwrap().unwrap();
}
