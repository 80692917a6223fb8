//! Request/response logging with field redaction.
//!
//! Emits a compact pre-request line and a post-request line per RPC to the
//! configured sinks. Secret maps are always rendered as `***`; volume
//! contexts can be suppressed wholesale. Concurrent RPCs give no ordering
//! guarantee between their lines.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::Write;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use csirpc::{MetaData, Status};
use tracing::warn;

use crate::context::{RequestContext, REQUEST_ID_KEY};
use crate::message::{CsiRequest, CsiResponse, Method};
use crate::middleware::{ClientInterceptor, ClientNext, ServerInterceptor, ServerNext};

/// A shared log sink.
type Sink = Arc<Mutex<dyn Write + Send>>;

/// The logging interceptor, usable on both the server and client chains.
#[derive(Default, Clone)]
pub struct LoggingInterceptor {
    /// Pre-request sink, if request logging is enabled
    req_sink: Option<Sink>,
    /// Post-request sink, if response logging is enabled
    rep_sink: Option<Sink>,
    /// Suppress volume-context fields
    disable_volume_context: bool,
}

impl LoggingInterceptor {
    /// Create a logging interceptor with both phases disabled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable pre-request logging to `w`.
    #[must_use]
    pub fn with_request_logging<W: Write + Send + 'static>(mut self, w: W) -> Self {
        self.req_sink = Some(Arc::new(Mutex::new(w)));
        self
    }

    /// Enable post-request logging to `w`.
    #[must_use]
    pub fn with_response_logging<W: Write + Send + 'static>(mut self, w: W) -> Self {
        self.rep_sink = Some(Arc::new(Mutex::new(w)));
        self
    }

    /// Suppress the volume-context field in logged messages.
    #[must_use]
    pub fn with_disable_log_volume_context(mut self) -> Self {
        self.disable_volume_context = true;
        self
    }

    fn write_line(&self, sink: &Sink, line: &str) {
        let mut w = sink.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writeln!(w, "{line}") {
            warn!(error = %e, "log sink write failed");
        }
    }

    fn log_request(&self, method: Method, id: Option<u64>, req: &CsiRequest) {
        if let Some(sink) = &self.req_sink {
            let line = format!(
                "{}: REQ {}: {}",
                method.name(),
                render_id(id),
                render_request(req, self.disable_volume_context),
            );
            self.write_line(sink, &line);
        }
    }

    fn log_response(&self, method: Method, id: Option<u64>, result: &Result<CsiResponse, Status>) {
        if let Some(sink) = &self.rep_sink {
            let line = match result {
                Ok(rep) => format!(
                    "{}: REP {}: {}",
                    method.name(),
                    render_id(id),
                    render_response(rep, self.disable_volume_context),
                ),
                Err(status) => format!(
                    "{}: REP {}: {status}",
                    method.name(),
                    render_id(id),
                ),
            };
            self.write_line(sink, &line);
        }
    }
}

#[async_trait]
impl ServerInterceptor for LoggingInterceptor {
    async fn handle(
        &self,
        ctx: &mut RequestContext,
        req: CsiRequest,
        next: ServerNext<'_>,
    ) -> Result<CsiResponse, Status> {
        let method = ctx.method();
        let id = ctx.request_id();
        self.log_request(method, id, &req);

        let result = next.run(ctx, req).await;

        // Errors are observed, never rewritten.
        self.log_response(method, id, &result);
        result
    }
}

#[async_trait]
impl ClientInterceptor for LoggingInterceptor {
    async fn handle(
        &self,
        meta: &mut MetaData,
        method: Method,
        req: CsiRequest,
        next: ClientNext<'_>,
    ) -> Result<CsiResponse, Status> {
        let id = meta
            .get(REQUEST_ID_KEY)
            .and_then(|s| s.parse::<u64>().ok());
        self.log_request(method, id, &req);

        let result = next.run(meta, method, req).await;

        self.log_response(method, id, &result);
        result
    }
}

fn render_id(id: Option<u64>) -> String {
    match id {
        Some(id) => format!("{id:04}"),
        None => "-".to_owned(),
    }
}

/// Accumulates `name=value` fields into one compact line.
struct Fields {
    out: String,
    log_volume_context: bool,
}

impl Fields {
    fn new(disable_volume_context: bool) -> Self {
        Self {
            out: String::new(),
            log_volume_context: !disable_volume_context,
        }
    }

    fn push(&mut self, name: &str, value: impl std::fmt::Display) {
        if !self.out.is_empty() {
            self.out.push_str(", ");
        }
        let _ = write!(self.out, "{name}={value}");
    }

    /// A string field; empty values are elided.
    fn string(&mut self, name: &str, value: &str) {
        if !value.is_empty() {
            self.push(name, value);
        }
    }

    /// A map field rendered with sorted keys; empty maps are elided.
    fn map(&mut self, name: &str, map: &HashMap<String, String>) {
        if map.is_empty() {
            return;
        }
        let mut keys: Vec<&String> = map.keys().collect();
        keys.sort();
        let body = keys
            .iter()
            .map(|k| format!("{k}={}", map[*k]))
            .collect::<Vec<_>>()
            .join(",");
        self.push(name, format_args!("{{{body}}}"));
    }

    /// Secrets are never logged; a populated map renders as `***`.
    fn secrets(&mut self, map: &HashMap<String, String>) {
        if !map.is_empty() {
            self.push("secrets", "***");
        }
    }

    /// Volume contexts honor the suppression option.
    fn volume_context(&mut self, map: &HashMap<String, String>) {
        if self.log_volume_context {
            self.map("volume_context", map);
        }
    }

    fn finish(self) -> String {
        self.out
    }
}

fn render_request(req: &CsiRequest, disable_volume_context: bool) -> String {
    let mut f = Fields::new(disable_volume_context);
    match req {
        CsiRequest::GetPluginInfo(_)
        | CsiRequest::GetPluginCapabilities(_)
        | CsiRequest::Probe(_)
        | CsiRequest::ControllerGetCapabilities(_)
        | CsiRequest::NodeGetCapabilities(_)
        | CsiRequest::NodeGetInfo(_) => {}
        CsiRequest::CreateVolume(r) => {
            f.string("name", &r.name);
            if let Some(range) = &r.capacity_range {
                f.push("required_bytes", range.required_bytes);
            }
            f.push("capabilities", r.volume_capabilities.len());
            f.map("parameters", &r.parameters);
            f.secrets(&r.secrets);
        }
        CsiRequest::DeleteVolume(r) => {
            f.string("volume_id", &r.volume_id);
            f.secrets(&r.secrets);
        }
        CsiRequest::ControllerPublishVolume(r) => {
            f.string("volume_id", &r.volume_id);
            f.string("node_id", &r.node_id);
            f.push("readonly", r.readonly);
            f.volume_context(&r.volume_context);
            f.secrets(&r.secrets);
        }
        CsiRequest::ControllerUnpublishVolume(r) => {
            f.string("volume_id", &r.volume_id);
            f.string("node_id", &r.node_id);
            f.secrets(&r.secrets);
        }
        CsiRequest::ValidateVolumeCapabilities(r) => {
            f.string("volume_id", &r.volume_id);
            f.push("capabilities", r.volume_capabilities.len());
            f.volume_context(&r.volume_context);
            f.secrets(&r.secrets);
        }
        CsiRequest::ListVolumes(r) => {
            f.push("max_entries", r.max_entries);
            f.string("starting_token", &r.starting_token);
        }
        CsiRequest::GetCapacity(r) => {
            f.push("capabilities", r.volume_capabilities.len());
        }
        CsiRequest::ListSnapshots(r) => {
            f.push("max_entries", r.max_entries);
            f.string("source_volume_id", &r.source_volume_id);
            f.string("snapshot_id", &r.snapshot_id);
            f.secrets(&r.secrets);
        }
        CsiRequest::NodeStageVolume(r) => {
            f.string("volume_id", &r.volume_id);
            f.string("staging_target_path", &r.staging_target_path);
            f.map("publish_context", &r.publish_context);
            f.volume_context(&r.volume_context);
            f.secrets(&r.secrets);
        }
        CsiRequest::NodeUnstageVolume(r) => {
            f.string("volume_id", &r.volume_id);
            f.string("staging_target_path", &r.staging_target_path);
        }
        CsiRequest::NodePublishVolume(r) => {
            f.string("volume_id", &r.volume_id);
            f.string("staging_target_path", &r.staging_target_path);
            f.string("target_path", &r.target_path);
            f.push("readonly", r.readonly);
            f.volume_context(&r.volume_context);
            f.secrets(&r.secrets);
        }
        CsiRequest::NodeUnpublishVolume(r) => {
            f.string("volume_id", &r.volume_id);
            f.string("target_path", &r.target_path);
        }
    }
    f.finish()
}

fn render_response(rep: &CsiResponse, disable_volume_context: bool) -> String {
    let mut f = Fields::new(disable_volume_context);
    match rep {
        CsiResponse::DeleteVolume(_)
        | CsiResponse::ControllerUnpublishVolume(_)
        | CsiResponse::NodeStageVolume(_)
        | CsiResponse::NodeUnstageVolume(_)
        | CsiResponse::NodePublishVolume(_)
        | CsiResponse::NodeUnpublishVolume(_) => {}
        CsiResponse::GetPluginInfo(r) => {
            f.string("name", &r.name);
            f.string("vendor_version", &r.vendor_version);
        }
        CsiResponse::GetPluginCapabilities(r) => {
            f.push("capabilities", r.capabilities.len());
        }
        CsiResponse::Probe(r) => {
            if let Some(ready) = r.ready {
                f.push("ready", ready);
            }
        }
        CsiResponse::CreateVolume(r) => {
            if let Some(volume) = &r.volume {
                f.string("volume_id", &volume.volume_id);
                f.push("capacity_bytes", volume.capacity_bytes);
                f.volume_context(&volume.volume_context);
            }
        }
        CsiResponse::ControllerPublishVolume(r) => {
            f.map("publish_context", &r.publish_context);
        }
        CsiResponse::ValidateVolumeCapabilities(r) => {
            f.push("confirmed", r.confirmed.is_some());
            f.string("message", &r.message);
        }
        CsiResponse::ListVolumes(r) => {
            f.push("entries", r.entries.len());
            f.string("next_token", &r.next_token);
        }
        CsiResponse::GetCapacity(r) => {
            f.push("available_capacity", r.available_capacity);
        }
        CsiResponse::ControllerGetCapabilities(r) => {
            f.push("capabilities", r.capabilities.len());
        }
        CsiResponse::ListSnapshots(r) => {
            f.push("entries", r.entries.len());
            f.string("next_token", &r.next_token);
        }
        CsiResponse::NodeGetCapabilities(r) => {
            f.push("capabilities", r.capabilities.len());
        }
        CsiResponse::NodeGetInfo(r) => {
            f.string("node_id", &r.node_id);
            f.push("max_volumes_per_node", r.max_volumes_per_node);
        }
    }
    f.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PluginConfig;
    use crate::context::OptionLookup;
    use crate::middleware::{ServerChain, ServerHandler};
    use crate::proto::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    /// A sink that hands its lines back out through shared state.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    struct CreateOk;

    #[async_trait]
    impl ServerHandler for CreateOk {
        async fn call(
            &self,
            _ctx: &mut RequestContext,
            req: CsiRequest,
        ) -> Result<CsiResponse, Status> {
            match req {
                CsiRequest::CreateVolume(_) => {
                    Ok(CsiResponse::CreateVolume(CreateVolumeResponse {
                        volume: Some(Volume {
                            volume_id: "1".to_string(),
                            ..Default::default()
                        }),
                    }))
                }
                _ => Err(Status::unimplemented("test handler")),
            }
        }
    }

    fn create_req_with_secrets() -> CsiRequest {
        CsiRequest::CreateVolume(CreateVolumeRequest {
            name: "v1".to_string(),
            secrets: HashMap::from([("user".to_string(), "hunter2".to_string())]),
            volume_capabilities: vec![],
            ..Default::default()
        })
    }

    fn ctx_for(method: Method) -> RequestContext {
        RequestContext::new(
            method,
            MetaData::with_entry(REQUEST_ID_KEY, "123"),
            OptionLookup::new(Arc::new(PluginConfig::new())),
        )
    }

    #[tokio::test]
    async fn request_line_redacts_secrets() {
        let buf = SharedBuf::default();
        let chain = ServerChain::new(vec![Arc::new(
            LoggingInterceptor::new().with_request_logging(buf.clone()),
        )]);
        let mut ctx = ctx_for(Method::CreateVolume);
        chain
            .call(&mut ctx, create_req_with_secrets(), &CreateOk)
            .await
            .unwrap();

        let line = buf.contents();
        assert!(line.contains("CreateVolume: REQ 0123:"), "line: {line}");
        assert!(line.contains("name=v1"));
        assert!(line.contains("secrets=***"));
        assert!(!line.contains("hunter2"));
    }

    #[tokio::test]
    async fn response_line_carries_result() {
        let buf = SharedBuf::default();
        let chain = ServerChain::new(vec![Arc::new(
            LoggingInterceptor::new().with_response_logging(buf.clone()),
        )]);
        let mut ctx = ctx_for(Method::CreateVolume);
        chain
            .call(&mut ctx, create_req_with_secrets(), &CreateOk)
            .await
            .unwrap();

        let line = buf.contents();
        assert!(line.contains("CreateVolume: REP 0123:"), "line: {line}");
        assert!(line.contains("volume_id=1"));
    }

    #[tokio::test]
    async fn response_line_carries_error_text() {
        let buf = SharedBuf::default();
        let chain = ServerChain::new(vec![Arc::new(
            LoggingInterceptor::new().with_response_logging(buf.clone()),
        )]);
        let mut ctx = ctx_for(Method::Probe);
        let result = chain
            .call(&mut ctx, CsiRequest::Probe(ProbeRequest::default()), &CreateOk)
            .await;
        assert!(result.is_err());

        let line = buf.contents();
        assert!(line.contains("Probe: REP 0123:"), "line: {line}");
        assert!(line.contains("not implemented"), "line: {line}");
    }

    #[test]
    fn volume_context_suppressed_when_disabled() {
        let req = CsiRequest::NodeStageVolume(NodeStageVolumeRequest {
            volume_id: "v1".to_string(),
            staging_target_path: "/stage".to_string(),
            volume_context: HashMap::from([("zone".to_string(), "z1".to_string())]),
            ..Default::default()
        });
        let visible = render_request(&req, false);
        assert!(visible.contains("volume_context={zone=z1}"), "{visible}");
        let hidden = render_request(&req, true);
        assert!(!hidden.contains("volume_context"), "{hidden}");
    }

    #[test]
    fn map_rendering_is_deterministic() {
        let map = HashMap::from([
            ("b".to_string(), "2".to_string()),
            ("a".to_string(), "1".to_string()),
        ]);
        let mut f = Fields::new(false);
        f.map("m", &map);
        assert_eq!(f.finish(), "m={a=1,b=2}");
    }
}
