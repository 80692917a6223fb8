//! Plug-in configuration: option names, the option store, and parsers.
//!
//! All runtime behavior is driven by a flat map of named options. The map is
//! written during startup and read-only afterwards; lookups that miss the map
//! fall through to an injectable environment function and finally to the
//! ambient process environment (see [`crate::context::OptionLookup`]).

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

/// Name of the option that holds the listener address. Required.
pub const ENDPOINT: &str = "CSI_ENDPOINT";
/// Truthy value forces debug log level and request/response logging.
pub const DEBUG: &str = "X_CSI_DEBUG";
/// Log level: one of panic/fatal/error/warn/info/debug.
pub const LOG_LEVEL: &str = "X_CSI_LOG_LEVEL";
/// Service selection: `controller`, `node`, or empty for both.
pub const MODE: &str = "X_CSI_MODE";
/// Octal permission mask for unix-socket endpoints; default `0755`.
pub const ENDPOINT_PERMS: &str = "X_CSI_ENDPOINT_PERMS";
/// Owning user (name or numeric id) for unix-socket endpoints.
pub const ENDPOINT_USER: &str = "X_CSI_ENDPOINT_USER";
/// Owning group (name or numeric id) for unix-socket endpoints.
pub const ENDPOINT_GROUP: &str = "X_CSI_ENDPOINT_GROUP";
/// Enable request logging.
pub const REQ_LOGGING: &str = "X_CSI_REQ_LOGGING";
/// Enable response logging.
pub const REP_LOGGING: &str = "X_CSI_REP_LOGGING";
/// Suppress the volume-context field in logged messages.
pub const LOG_DISABLE_VOL_CTX: &str = "X_CSI_LOG_DISABLE_VOL_CTX";
/// Validator: require a staging target path on NodePublishVolume.
pub const REQUIRE_STAGING_TARGET_PATH: &str = "X_CSI_REQUIRE_STAGING_TARGET_PATH";
/// Validator: require a populated volume context where applicable.
pub const REQUIRE_VOL_CONTEXT: &str = "X_CSI_REQUIRE_VOL_CONTEXT";
/// Validator: require a populated publish context where applicable.
pub const REQUIRE_PUB_CONTEXT: &str = "X_CSI_REQUIRE_PUB_CONTEXT";
/// Validator: require secrets on every secret-bearing RPC.
pub const REQUIRE_CREDS: &str = "X_CSI_REQUIRE_CREDS";
/// Validator: require secrets on CreateVolume.
pub const REQUIRE_CREDS_CREATE_VOL: &str = "X_CSI_REQUIRE_CREDS_CREATE_VOL";
/// Validator: require secrets on DeleteVolume.
pub const REQUIRE_CREDS_DELETE_VOL: &str = "X_CSI_REQUIRE_CREDS_DELETE_VOL";
/// Validator: require secrets on ControllerPublishVolume.
pub const REQUIRE_CREDS_CTRLR_PUB_VOL: &str = "X_CSI_REQUIRE_CREDS_CTRLR_PUB_VOL";
/// Validator: require secrets on ControllerUnpublishVolume.
pub const REQUIRE_CREDS_CTRLR_UNPUB_VOL: &str = "X_CSI_REQUIRE_CREDS_CTRLR_UNPUB_VOL";
/// Validator: require secrets on NodeStageVolume.
pub const REQUIRE_CREDS_NODE_STG_VOL: &str = "X_CSI_REQUIRE_CREDS_NODE_STG_VOL";
/// Validator: require secrets on NodePublishVolume.
pub const REQUIRE_CREDS_NODE_PUB_VOL: &str = "X_CSI_REQUIRE_CREDS_NODE_PUB_VOL";
/// Enable both validator phases.
pub const SPEC_VALIDATION: &str = "X_CSI_SPEC_VALIDATION";
/// Enable request validation.
pub const SPEC_REQ_VALIDATION: &str = "X_CSI_SPEC_REQ_VALIDATION";
/// Enable response validation.
pub const SPEC_REP_VALIDATION: &str = "X_CSI_SPEC_REP_VALIDATION";
/// Disable field-size ceilings.
pub const DISABLE_FIELD_LEN: &str = "X_CSI_DISABLE_FIELD_LEN";
/// Raise the ceiling for map keys containing "path".
pub const MAX_PATH: &str = "X_CSI_MAX_PATH";
/// Emit additional plug-in info.
pub const PLUGIN_INFO: &str = "X_CSI_PLUGIN_INFO";
/// Enable the serial-volume-access interceptor.
pub const SERIAL_VOL_ACCESS: &str = "X_CSI_SERIAL_VOL_ACCESS";
/// Serial-volume try-lock timeout as a duration string.
pub const SERIAL_VOL_ACCESS_TIMEOUT: &str = "X_CSI_SERIAL_VOL_ACCESS_TIMEOUT";
/// Pre-loaded secret map as CSV pairs.
pub const SECRETS: &str = "X_CSI_SECRETS";

/// etcd lock provider: comma-separated endpoint list. Setting this selects
/// the distributed lock provider.
pub const SERIAL_VOL_ACCESS_ETCD_ENDPOINTS: &str = "X_CSI_SERIAL_VOL_ACCESS_ETCD_ENDPOINTS";
/// etcd lock provider: auto-sync interval.
pub const SERIAL_VOL_ACCESS_ETCD_AUTO_SYNC_INTERVAL: &str =
    "X_CSI_SERIAL_VOL_ACCESS_ETCD_AUTO_SYNC_INTERVAL";
/// etcd lock provider: dial keep-alive time.
pub const SERIAL_VOL_ACCESS_ETCD_DIAL_KEEP_ALIVE_TIME: &str =
    "X_CSI_SERIAL_VOL_ACCESS_ETCD_DIAL_KEEP_ALIVE_TIME";
/// etcd lock provider: dial keep-alive timeout.
pub const SERIAL_VOL_ACCESS_ETCD_DIAL_KEEP_ALIVE_TIMEOUT: &str =
    "X_CSI_SERIAL_VOL_ACCESS_ETCD_DIAL_KEEP_ALIVE_TIMEOUT";
/// etcd lock provider: dial timeout.
pub const SERIAL_VOL_ACCESS_ETCD_DIAL_TIMEOUT: &str = "X_CSI_SERIAL_VOL_ACCESS_ETCD_DIAL_TIMEOUT";
/// etcd lock provider: max receive message size in bytes.
pub const SERIAL_VOL_ACCESS_ETCD_MAX_CALL_RECV_MSG_SZ: &str =
    "X_CSI_SERIAL_VOL_ACCESS_ETCD_MAX_CALL_RECV_MSG_SZ";
/// etcd lock provider: max send message size in bytes.
pub const SERIAL_VOL_ACCESS_ETCD_MAX_CALL_SEND_MSG_SZ: &str =
    "X_CSI_SERIAL_VOL_ACCESS_ETCD_MAX_CALL_SEND_MSG_SZ";
/// etcd lock provider: username.
pub const SERIAL_VOL_ACCESS_ETCD_USERNAME: &str = "X_CSI_SERIAL_VOL_ACCESS_ETCD_USERNAME";
/// etcd lock provider: password.
pub const SERIAL_VOL_ACCESS_ETCD_PASSWORD: &str = "X_CSI_SERIAL_VOL_ACCESS_ETCD_PASSWORD";
/// etcd lock provider: reject clusters older than this client.
pub const SERIAL_VOL_ACCESS_ETCD_REJECT_OLD_CLUSTER: &str =
    "X_CSI_SERIAL_VOL_ACCESS_ETCD_REJECT_OLD_CLUSTER";
/// etcd lock provider: enable TLS.
pub const SERIAL_VOL_ACCESS_ETCD_TLS: &str = "X_CSI_SERIAL_VOL_ACCESS_ETCD_TLS";
/// etcd lock provider: skip TLS certificate verification.
pub const SERIAL_VOL_ACCESS_ETCD_TLS_INSECURE: &str = "X_CSI_SERIAL_VOL_ACCESS_ETCD_TLS_INSECURE";
/// etcd lock provider: session lease TTL.
pub const SERIAL_VOL_ACCESS_ETCD_TTL: &str = "X_CSI_SERIAL_VOL_ACCESS_ETCD_TTL";

/// The plug-in's option store.
///
/// Seeded from the plug-in author's defaults before startup, adjusted during
/// startup (debug mode rewrites the log-level and logging options), read-only
/// once serving begins.
#[derive(Debug, Default)]
pub struct PluginConfig {
    /// Option values by name
    vars: RwLock<HashMap<String, String>>,
}

impl PluginConfig {
    /// Create an empty config store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store from `name=value` pairs. Malformed entries (no `=`)
    /// store the whole token as a name with an empty value.
    #[must_use]
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let config = Self::new();
        for pair in pairs {
            let pair = pair.as_ref();
            match pair.split_once('=') {
                Some((name, value)) => config.set(name, value),
                None => config.set(pair, ""),
            }
        }
        config
    }

    /// Look up an option by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<String> {
        self.vars
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Set an option. Only called during startup.
    pub fn set(&self, name: &str, value: &str) {
        let mut vars = self.vars.write().unwrap_or_else(|e| e.into_inner());
        vars.insert(name.to_owned(), value.to_owned());
    }
}

/// Interpret an option value as a boolean.
///
/// `1`, `t`, `true`, `y`, `yes` (case-insensitive) are true; anything else,
/// including unparseable garbage, is false.
#[must_use]
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "t" | "true" | "y" | "yes"
    )
}

/// Parse a duration option with `humantime` syntax (`3s`, `100ms`).
#[must_use]
pub fn parse_duration(value: &str) -> Option<Duration> {
    humantime::parse_duration(value.trim()).ok()
}

/// Parse a CSV list of `k=v` pairs into a map.
///
/// Keys and values are trimmed of surrounding whitespace; empty tokens are
/// dropped. A token without `=` maps the whole token to an empty value.
#[must_use]
pub fn parse_map(line: &str) -> HashMap<String, String> {
    let mut data = HashMap::new();
    for token in line.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        match token.split_once('=') {
            Some((key, value)) => {
                let key = key.trim();
                if key.is_empty() {
                    continue;
                }
                data.insert(key.to_owned(), value.trim().to_owned());
            }
            None => {
                data.insert(token.to_owned(), String::new());
            }
        }
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_from_pairs() {
        let config = PluginConfig::from_pairs(["CSI_ENDPOINT=/tmp/csi.sock", "X_CSI_DEBUG=true"]);
        assert_eq!(config.get(ENDPOINT).as_deref(), Some("/tmp/csi.sock"));
        assert_eq!(config.get(DEBUG).as_deref(), Some("true"));
        assert_eq!(config.get(MODE), None);
    }

    #[test]
    fn config_set_overrides() {
        let config = PluginConfig::from_pairs(["X_CSI_LOG_LEVEL=info"]);
        config.set(LOG_LEVEL, "debug");
        assert_eq!(config.get(LOG_LEVEL).as_deref(), Some("debug"));
    }

    #[test]
    fn parse_bool_values() {
        assert!(parse_bool("true"));
        assert!(parse_bool("TRUE"));
        assert!(parse_bool("1"));
        assert!(parse_bool(" yes "));
        assert!(!parse_bool("false"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("maybe"));
        assert!(!parse_bool(""));
    }

    #[test]
    fn parse_duration_values() {
        assert_eq!(parse_duration("3s"), Some(Duration::from_secs(3)));
        assert_eq!(parse_duration("100ms"), Some(Duration::from_millis(100)));
        assert_eq!(parse_duration("split second"), None);
    }

    #[test]
    fn parse_map_pairs() {
        let data = parse_map("k1=v1, k2=v2");
        assert_eq!(data.len(), 2);
        assert_eq!(data["k1"], "v1");
        assert_eq!(data["k2"], "v2");
    }

    #[test]
    fn parse_map_empty_line() {
        assert!(parse_map("").is_empty());
        assert!(parse_map("  ,  ,").is_empty());
    }

    #[test]
    fn parse_map_key_sans_value() {
        let data = parse_map("k1");
        assert_eq!(data.len(), 1);
        assert_eq!(data["k1"], "");

        let data = parse_map("k1=, k2=v2");
        assert_eq!(data.len(), 2);
        assert_eq!(data["k1"], "");
    }

    #[test]
    fn parse_map_trims_whitespace() {
        let data = parse_map(" k1 = v1 ,   k2=v2");
        assert_eq!(data.len(), 2);
        assert_eq!(data["k1"], "v1");
        assert_eq!(data["k2"], "v2");
    }
}
