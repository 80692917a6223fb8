//! Semantic validation of CSI request and response messages.
//!
//! Enforces the message-shape requirements of the CSI specification plus the
//! optional policy toggles (per-RPC secret requirements, required contexts,
//! field-size ceilings). Every failure surfaces as invalid-argument naming
//! the offending field. Validation never rewrites a message.

use std::collections::HashMap;

use async_trait::async_trait;
use csirpc::Status;

use crate::config;
use crate::context::{OptionLookup, RequestContext};
use crate::message::{CsiRequest, CsiResponse};
use crate::middleware::{ServerInterceptor, ServerNext};
use crate::proto::*;

/// Default ceiling for string fields, in bytes.
const MAX_FIELD_STRING: usize = 128;
/// Ceiling for node ids, in bytes.
const MAX_FIELD_NODE_ID: usize = 256;
/// Ceiling for the aggregate byte size of a map field.
const MAX_FIELD_MAP: usize = 4096;
/// Maximum length of a plugin name.
const MAX_PLUGIN_NAME: usize = 63;

/// The validator's option set. Each toggle is independently selectable.
#[derive(Debug, Default, Clone)]
pub struct SpecValidator {
    /// Validate requests before the user service runs
    request_validation: bool,
    /// Validate responses after the user service returns
    response_validation: bool,
    /// Require secrets on CreateVolume
    requires_creds_create_volume: bool,
    /// Require secrets on DeleteVolume
    requires_creds_delete_volume: bool,
    /// Require secrets on ControllerPublishVolume
    requires_creds_controller_publish: bool,
    /// Require secrets on ControllerUnpublishVolume
    requires_creds_controller_unpublish: bool,
    /// Require secrets on NodeStageVolume
    requires_creds_node_stage: bool,
    /// Require secrets on NodePublishVolume
    requires_creds_node_publish: bool,
    /// Require a populated volume context on publish and downstream RPCs
    requires_volume_context: bool,
    /// Require a populated publish context on publish responses and
    /// downstream RPCs
    requires_publish_context: bool,
    /// Require a staging target path on NodePublishVolume
    requires_staging_target_path: bool,
    /// Skip the field-size ceilings
    disable_field_len_check: bool,
    /// Raised ceiling for map entries whose key names a path
    max_path_len: Option<usize>,
}

impl SpecValidator {
    /// Create a validator with every toggle off.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable request validation.
    #[must_use]
    pub fn with_request_validation(mut self) -> Self {
        self.request_validation = true;
        self
    }

    /// Enable response validation.
    #[must_use]
    pub fn with_response_validation(mut self) -> Self {
        self.response_validation = true;
        self
    }

    /// Require secrets on CreateVolume.
    #[must_use]
    pub fn with_requires_create_volume_secrets(mut self) -> Self {
        self.requires_creds_create_volume = true;
        self
    }

    /// Require secrets on DeleteVolume.
    #[must_use]
    pub fn with_requires_delete_volume_secrets(mut self) -> Self {
        self.requires_creds_delete_volume = true;
        self
    }

    /// Require secrets on ControllerPublishVolume.
    #[must_use]
    pub fn with_requires_controller_publish_volume_secrets(mut self) -> Self {
        self.requires_creds_controller_publish = true;
        self
    }

    /// Require secrets on ControllerUnpublishVolume.
    #[must_use]
    pub fn with_requires_controller_unpublish_volume_secrets(mut self) -> Self {
        self.requires_creds_controller_unpublish = true;
        self
    }

    /// Require secrets on NodeStageVolume.
    #[must_use]
    pub fn with_requires_node_stage_volume_secrets(mut self) -> Self {
        self.requires_creds_node_stage = true;
        self
    }

    /// Require secrets on NodePublishVolume.
    #[must_use]
    pub fn with_requires_node_publish_volume_secrets(mut self) -> Self {
        self.requires_creds_node_publish = true;
        self
    }

    /// Require a populated volume context where applicable.
    #[must_use]
    pub fn with_requires_volume_context(mut self) -> Self {
        self.requires_volume_context = true;
        self
    }

    /// Require a populated publish context where applicable.
    #[must_use]
    pub fn with_requires_publish_context(mut self) -> Self {
        self.requires_publish_context = true;
        self
    }

    /// Require a staging target path on NodePublishVolume.
    #[must_use]
    pub fn with_requires_staging_target_path(mut self) -> Self {
        self.requires_staging_target_path = true;
        self
    }

    /// Disable the field-size ceilings.
    #[must_use]
    pub fn with_disable_field_len_check(mut self) -> Self {
        self.disable_field_len_check = true;
        self
    }

    /// Raise the ceiling for path-valued map entries. Values below the
    /// default ceiling are ignored; the override can never lower a limit.
    #[must_use]
    pub fn with_max_path_len(mut self, len: usize) -> Self {
        if len > MAX_FIELD_STRING {
            self.max_path_len = Some(len);
        }
        self
    }

    /// Build a validator from configuration.
    #[must_use]
    pub fn from_options(lookup: &OptionLookup) -> Self {
        let both = lookup.bool(config::SPEC_VALIDATION);
        let all_creds = lookup.bool(config::REQUIRE_CREDS);
        let mut v = Self {
            request_validation: both || lookup.bool(config::SPEC_REQ_VALIDATION),
            response_validation: both || lookup.bool(config::SPEC_REP_VALIDATION),
            requires_creds_create_volume: all_creds
                || lookup.bool(config::REQUIRE_CREDS_CREATE_VOL),
            requires_creds_delete_volume: all_creds
                || lookup.bool(config::REQUIRE_CREDS_DELETE_VOL),
            requires_creds_controller_publish: all_creds
                || lookup.bool(config::REQUIRE_CREDS_CTRLR_PUB_VOL),
            requires_creds_controller_unpublish: all_creds
                || lookup.bool(config::REQUIRE_CREDS_CTRLR_UNPUB_VOL),
            requires_creds_node_stage: all_creds
                || lookup.bool(config::REQUIRE_CREDS_NODE_STG_VOL),
            requires_creds_node_publish: all_creds
                || lookup.bool(config::REQUIRE_CREDS_NODE_PUB_VOL),
            requires_volume_context: lookup.bool(config::REQUIRE_VOL_CONTEXT),
            requires_publish_context: lookup.bool(config::REQUIRE_PUB_CONTEXT),
            requires_staging_target_path: lookup.bool(config::REQUIRE_STAGING_TARGET_PATH),
            disable_field_len_check: lookup.bool(config::DISABLE_FIELD_LEN),
            max_path_len: None,
        };
        if let Some(raw) = lookup.lookup(config::MAX_PATH) {
            if let Ok(len) = raw.trim().parse::<usize>() {
                v = v.with_max_path_len(len);
            }
        }
        v
    }

    /// Whether either validation phase is active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.request_validation || self.response_validation
    }

    fn sizes(&self) -> SizeChecker {
        SizeChecker {
            max_path: self.max_path_len.unwrap_or(MAX_FIELD_STRING),
        }
    }
}

#[async_trait]
impl ServerInterceptor for SpecValidator {
    async fn handle(
        &self,
        ctx: &mut RequestContext,
        req: CsiRequest,
        next: ServerNext<'_>,
    ) -> Result<CsiResponse, Status> {
        if self.request_validation {
            self.validate_request(&req)?;
            if !self.disable_field_len_check {
                check_request_sizes(&req, &self.sizes())?;
            }
        }

        let rep = next.run(ctx, req).await?;

        if self.response_validation {
            self.validate_response(&rep)?;
            if !self.disable_field_len_check {
                check_response_sizes(&rep, &self.sizes())?;
            }
        }
        Ok(rep)
    }
}

fn required(field: &str) -> Status {
    Status::invalid_argument(format!("required: {field}"))
}

fn require_string(field: &str, value: &str) -> Result<(), Status> {
    if value.is_empty() {
        return Err(required(field));
    }
    Ok(())
}

fn require_secrets(enabled: bool, secrets: &HashMap<String, String>) -> Result<(), Status> {
    if enabled && secrets.is_empty() {
        return Err(required("Secrets"));
    }
    Ok(())
}

fn require_map(enabled: bool, field: &str, map: &HashMap<String, String>) -> Result<(), Status> {
    if enabled && map.is_empty() {
        return Err(required(field));
    }
    Ok(())
}

/// A capability is well-formed when it names an access mode and an access
/// type (block or mount).
fn require_capability(cap: &VolumeCapability) -> Result<(), Status> {
    if cap.access_mode.is_none() {
        return Err(required("VolumeCapability.AccessMode"));
    }
    if cap.access_type.is_none() {
        return Err(required("VolumeCapability.AccessType"));
    }
    Ok(())
}

fn require_capabilities(caps: &[VolumeCapability], at_least_one: bool) -> Result<(), Status> {
    if at_least_one && caps.is_empty() {
        return Err(required("VolumeCapabilities"));
    }
    for cap in caps {
        require_capability(cap)?;
    }
    Ok(())
}

impl SpecValidator {
    fn validate_request(&self, req: &CsiRequest) -> Result<(), Status> {
        match req {
            CsiRequest::GetPluginInfo(_)
            | CsiRequest::GetPluginCapabilities(_)
            | CsiRequest::Probe(_)
            | CsiRequest::ListVolumes(_)
            | CsiRequest::ListSnapshots(_)
            | CsiRequest::ControllerGetCapabilities(_)
            | CsiRequest::NodeGetCapabilities(_)
            | CsiRequest::NodeGetInfo(_) => Ok(()),
            CsiRequest::CreateVolume(r) => {
                require_string("Name", &r.name)?;
                require_capabilities(&r.volume_capabilities, false)?;
                require_secrets(self.requires_creds_create_volume, &r.secrets)
            }
            CsiRequest::DeleteVolume(r) => {
                require_string("VolumeId", &r.volume_id)?;
                require_secrets(self.requires_creds_delete_volume, &r.secrets)
            }
            CsiRequest::ControllerPublishVolume(r) => {
                require_string("VolumeId", &r.volume_id)?;
                require_string("NodeId", &r.node_id)?;
                match &r.volume_capability {
                    Some(cap) => require_capability(cap)?,
                    None => return Err(required("VolumeCapability")),
                }
                require_map(
                    self.requires_volume_context,
                    "VolumeContext",
                    &r.volume_context,
                )?;
                require_secrets(self.requires_creds_controller_publish, &r.secrets)
            }
            CsiRequest::ControllerUnpublishVolume(r) => {
                require_string("VolumeId", &r.volume_id)?;
                require_secrets(self.requires_creds_controller_unpublish, &r.secrets)
            }
            CsiRequest::ValidateVolumeCapabilities(r) => {
                require_string("VolumeId", &r.volume_id)?;
                require_capabilities(&r.volume_capabilities, true)
            }
            CsiRequest::GetCapacity(r) => require_capabilities(&r.volume_capabilities, false),
            CsiRequest::NodeStageVolume(r) => {
                require_string("VolumeId", &r.volume_id)?;
                require_string("StagingTargetPath", &r.staging_target_path)?;
                match &r.volume_capability {
                    Some(cap) => require_capability(cap)?,
                    None => return Err(required("VolumeCapability")),
                }
                require_map(
                    self.requires_publish_context,
                    "PublishContext",
                    &r.publish_context,
                )?;
                require_map(
                    self.requires_volume_context,
                    "VolumeContext",
                    &r.volume_context,
                )?;
                require_secrets(self.requires_creds_node_stage, &r.secrets)
            }
            CsiRequest::NodeUnstageVolume(r) => {
                require_string("VolumeId", &r.volume_id)?;
                require_string("StagingTargetPath", &r.staging_target_path)
            }
            CsiRequest::NodePublishVolume(r) => {
                require_string("VolumeId", &r.volume_id)?;
                require_string("TargetPath", &r.target_path)?;
                match &r.volume_capability {
                    Some(cap) => require_capability(cap)?,
                    None => return Err(required("VolumeCapability")),
                }
                if self.requires_staging_target_path {
                    require_string("StagingTargetPath", &r.staging_target_path)?;
                }
                require_map(
                    self.requires_publish_context,
                    "PublishContext",
                    &r.publish_context,
                )?;
                require_map(
                    self.requires_volume_context,
                    "VolumeContext",
                    &r.volume_context,
                )?;
                require_secrets(self.requires_creds_node_publish, &r.secrets)
            }
            CsiRequest::NodeUnpublishVolume(r) => {
                require_string("VolumeId", &r.volume_id)?;
                require_string("TargetPath", &r.target_path)
            }
        }
    }

    fn validate_response(&self, rep: &CsiResponse) -> Result<(), Status> {
        match rep {
            CsiResponse::Probe(_)
            | CsiResponse::GetPluginCapabilities(_)
            | CsiResponse::DeleteVolume(_)
            | CsiResponse::ControllerUnpublishVolume(_)
            | CsiResponse::ValidateVolumeCapabilities(_)
            | CsiResponse::GetCapacity(_)
            | CsiResponse::ListSnapshots(_)
            | CsiResponse::NodeStageVolume(_)
            | CsiResponse::NodeUnstageVolume(_)
            | CsiResponse::NodePublishVolume(_)
            | CsiResponse::NodeUnpublishVolume(_) => Ok(()),
            CsiResponse::GetPluginInfo(r) => {
                require_string("Name", &r.name)?;
                if r.name.len() > MAX_PLUGIN_NAME {
                    return Err(Status::invalid_argument(format!(
                        "exceeds size limit: Name: max={MAX_PLUGIN_NAME}"
                    )));
                }
                if !is_dns_name(&r.name) {
                    return Err(Status::invalid_argument(format!(
                        "invalid: Name={}",
                        r.name
                    )));
                }
                require_string("VendorVersion", &r.vendor_version)?;
                if !is_semver(&r.vendor_version) {
                    return Err(Status::invalid_argument(format!(
                        "invalid: VendorVersion={}",
                        r.vendor_version
                    )));
                }
                if r.manifest.is_empty() {
                    return Err(required("Manifest"));
                }
                Ok(())
            }
            CsiResponse::CreateVolume(r) => {
                let volume = r.volume.as_ref().ok_or_else(|| required("Volume"))?;
                require_string("Volume.VolumeId", &volume.volume_id)?;
                require_map(
                    self.requires_volume_context,
                    "Volume.VolumeContext",
                    &volume.volume_context,
                )
            }
            CsiResponse::ControllerPublishVolume(r) => require_map(
                self.requires_publish_context,
                "PublishContext",
                &r.publish_context,
            ),
            CsiResponse::ListVolumes(r) => {
                for (i, entry) in r.entries.iter().enumerate() {
                    let volume = entry
                        .volume
                        .as_ref()
                        .ok_or_else(|| required(&format!("Entries[{i}].Volume")))?;
                    require_string(&format!("Entries[{i}].Volume.VolumeId"), &volume.volume_id)?;
                    require_map(
                        self.requires_volume_context,
                        &format!("Entries[{i}].Volume.VolumeContext"),
                        &volume.volume_context,
                    )?;
                }
                Ok(())
            }
            CsiResponse::ControllerGetCapabilities(r) => {
                if r.capabilities.is_empty() {
                    return Err(required("Capabilities"));
                }
                Ok(())
            }
            CsiResponse::NodeGetCapabilities(r) => {
                if r.capabilities.is_empty() {
                    return Err(required("Capabilities"));
                }
                Ok(())
            }
            CsiResponse::NodeGetInfo(r) => require_string("NodeId", &r.node_id),
        }
    }
}

/// Plugin names follow DNS-subdomain-with-dot form: alphanumeric labels
/// joined by dots, dashes allowed inside a label.
fn is_dns_name(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    for label in name.split('.') {
        if label.is_empty() {
            return false;
        }
        let bytes = label.as_bytes();
        if !bytes[0].is_ascii_alphanumeric() || !bytes[bytes.len() - 1].is_ascii_alphanumeric() {
            return false;
        }
        if !bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || *b == b'-')
        {
            return false;
        }
    }
    true
}

/// Accepts `MAJOR.MINOR.PATCH` with optional pre-release/build suffix.
fn is_semver(version: &str) -> bool {
    let core = version
        .split_once(['-', '+'])
        .map_or(version, |(core, _)| core);
    let mut parts = 0;
    for part in core.split('.') {
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
        parts += 1;
    }
    parts == 3
}

/// Field-size ceilings. Map entries whose key names a path get the raised
/// ceiling, which is never below the default.
struct SizeChecker {
    max_path: usize,
}

impl SizeChecker {
    fn string(&self, field: &str, value: &str) -> Result<(), Status> {
        self.string_max(field, value, MAX_FIELD_STRING)
    }

    fn string_max(&self, field: &str, value: &str, max: usize) -> Result<(), Status> {
        if value.len() > max {
            return Err(Status::invalid_argument(format!(
                "exceeds size limit: {field}: max={max}"
            )));
        }
        Ok(())
    }

    fn map(&self, field: &str, map: &HashMap<String, String>) -> Result<(), Status> {
        let mut total = 0usize;
        for (key, value) in map {
            total += key.len() + value.len();
            if key.len() > MAX_FIELD_STRING {
                return Err(Status::invalid_argument(format!(
                    "exceeds size limit: {field}[{key}]: max={MAX_FIELD_STRING}"
                )));
            }
            let value_max = if key.to_ascii_lowercase().contains("path") {
                self.max_path
            } else {
                MAX_FIELD_STRING
            };
            if value.len() > value_max {
                return Err(Status::invalid_argument(format!(
                    "exceeds size limit: {field}[{key}]={value}: max={value_max}"
                )));
            }
        }
        if total > MAX_FIELD_MAP {
            return Err(Status::invalid_argument(format!(
                "exceeds size limit: {field}: max={MAX_FIELD_MAP}"
            )));
        }
        Ok(())
    }

    /// Paths get the raised ceiling too.
    fn path(&self, field: &str, value: &str) -> Result<(), Status> {
        self.string_max(field, value, self.max_path)
    }
}

fn check_request_sizes(req: &CsiRequest, sizes: &SizeChecker) -> Result<(), Status> {
    match req {
        CsiRequest::GetPluginInfo(_)
        | CsiRequest::GetPluginCapabilities(_)
        | CsiRequest::Probe(_)
        | CsiRequest::ControllerGetCapabilities(_)
        | CsiRequest::NodeGetCapabilities(_)
        | CsiRequest::NodeGetInfo(_) => Ok(()),
        CsiRequest::CreateVolume(r) => {
            sizes.string("Name", &r.name)?;
            sizes.map("Parameters", &r.parameters)?;
            sizes.map("Secrets", &r.secrets)
        }
        CsiRequest::DeleteVolume(r) => {
            sizes.string("VolumeId", &r.volume_id)?;
            sizes.map("Secrets", &r.secrets)
        }
        CsiRequest::ControllerPublishVolume(r) => {
            sizes.string("VolumeId", &r.volume_id)?;
            sizes.string_max("NodeId", &r.node_id, MAX_FIELD_NODE_ID)?;
            sizes.map("VolumeContext", &r.volume_context)?;
            sizes.map("Secrets", &r.secrets)
        }
        CsiRequest::ControllerUnpublishVolume(r) => {
            sizes.string("VolumeId", &r.volume_id)?;
            sizes.string_max("NodeId", &r.node_id, MAX_FIELD_NODE_ID)?;
            sizes.map("Secrets", &r.secrets)
        }
        CsiRequest::ValidateVolumeCapabilities(r) => {
            sizes.string("VolumeId", &r.volume_id)?;
            sizes.map("VolumeContext", &r.volume_context)?;
            sizes.map("Parameters", &r.parameters)?;
            sizes.map("Secrets", &r.secrets)
        }
        CsiRequest::ListVolumes(r) => sizes.string("StartingToken", &r.starting_token),
        CsiRequest::GetCapacity(r) => sizes.map("Parameters", &r.parameters),
        CsiRequest::ListSnapshots(r) => {
            sizes.string("StartingToken", &r.starting_token)?;
            sizes.string("SourceVolumeId", &r.source_volume_id)?;
            sizes.string("SnapshotId", &r.snapshot_id)?;
            sizes.map("Secrets", &r.secrets)
        }
        CsiRequest::NodeStageVolume(r) => {
            sizes.string("VolumeId", &r.volume_id)?;
            sizes.path("StagingTargetPath", &r.staging_target_path)?;
            sizes.map("PublishContext", &r.publish_context)?;
            sizes.map("VolumeContext", &r.volume_context)?;
            sizes.map("Secrets", &r.secrets)
        }
        CsiRequest::NodeUnstageVolume(r) => {
            sizes.string("VolumeId", &r.volume_id)?;
            sizes.path("StagingTargetPath", &r.staging_target_path)
        }
        CsiRequest::NodePublishVolume(r) => {
            sizes.string("VolumeId", &r.volume_id)?;
            sizes.path("StagingTargetPath", &r.staging_target_path)?;
            sizes.path("TargetPath", &r.target_path)?;
            sizes.map("PublishContext", &r.publish_context)?;
            sizes.map("VolumeContext", &r.volume_context)?;
            sizes.map("Secrets", &r.secrets)
        }
        CsiRequest::NodeUnpublishVolume(r) => {
            sizes.string("VolumeId", &r.volume_id)?;
            sizes.path("TargetPath", &r.target_path)
        }
    }
}

fn check_response_sizes(rep: &CsiResponse, sizes: &SizeChecker) -> Result<(), Status> {
    match rep {
        CsiResponse::GetPluginInfo(_)
        | CsiResponse::GetPluginCapabilities(_)
        | CsiResponse::Probe(_)
        | CsiResponse::DeleteVolume(_)
        | CsiResponse::ControllerUnpublishVolume(_)
        | CsiResponse::ValidateVolumeCapabilities(_)
        | CsiResponse::GetCapacity(_)
        | CsiResponse::ControllerGetCapabilities(_)
        | CsiResponse::ListSnapshots(_)
        | CsiResponse::NodeStageVolume(_)
        | CsiResponse::NodeUnstageVolume(_)
        | CsiResponse::NodePublishVolume(_)
        | CsiResponse::NodeUnpublishVolume(_)
        | CsiResponse::NodeGetCapabilities(_) => Ok(()),
        CsiResponse::CreateVolume(r) => match &r.volume {
            Some(volume) => {
                sizes.string("Volume.VolumeId", &volume.volume_id)?;
                sizes.map("Volume.VolumeContext", &volume.volume_context)
            }
            None => Ok(()),
        },
        CsiResponse::ControllerPublishVolume(r) => {
            sizes.map("PublishContext", &r.publish_context)
        }
        CsiResponse::ListVolumes(r) => {
            for (i, entry) in r.entries.iter().enumerate() {
                if let Some(volume) = &entry.volume {
                    sizes.string(&format!("Entries[{i}].Volume.VolumeId"), &volume.volume_id)?;
                    sizes.map(
                        &format!("Entries[{i}].Volume.VolumeContext"),
                        &volume.volume_context,
                    )?;
                }
            }
            Ok(())
        }
        CsiResponse::NodeGetInfo(r) => {
            sizes.string_max("NodeId", &r.node_id, MAX_FIELD_NODE_ID)
        }
    }
}
