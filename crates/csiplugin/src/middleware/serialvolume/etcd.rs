//! Distributed lock provider backed by etcd.
//!
//! Lock keys live under a configured prefix. The provider owns one
//! lease-backed session, created on first use with the configured TTL; every
//! lock the provider hands out is tied to that lease, so losing the session
//! releases all held locks on the server side. A try-lock is a transaction
//! that creates the key only when absent; a contended attempt waits on a
//! delete-watch of the key. Release deletes the key; closing the provider
//! revokes the lease.
//!
//! Store errors propagate to the caller unchanged. The caller may retry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use csirpc::Status;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, EventType, PutOptions, TlsOptions, Txn, TxnOp,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config;
use crate::context::OptionLookup;
use crate::middleware::serialvolume::lockprovider::{TryLock, VolumeLockProvider};

/// Default session lease TTL.
const DEFAULT_TTL: Duration = Duration::from_secs(10);

/// Connection and session settings for the etcd lock provider, read from the
/// `X_CSI_SERIAL_VOL_ACCESS_ETCD_*` options.
#[derive(Debug, Clone, Default)]
pub struct EtcdConfig {
    /// Cluster endpoints
    pub endpoints: Vec<String>,
    /// Endpoint list auto-sync interval
    pub auto_sync_interval: Option<Duration>,
    /// Keep-alive probe interval
    pub dial_keep_alive_time: Option<Duration>,
    /// Keep-alive probe timeout
    pub dial_keep_alive_timeout: Option<Duration>,
    /// Connect timeout
    pub dial_timeout: Option<Duration>,
    /// Max receive message size in bytes
    pub max_call_recv_msg_sz: Option<usize>,
    /// Max send message size in bytes
    pub max_call_send_msg_sz: Option<usize>,
    /// Username for authenticated clusters
    pub username: Option<String>,
    /// Password for authenticated clusters
    pub password: Option<String>,
    /// Refuse to talk to clusters older than this client
    pub reject_old_cluster: bool,
    /// Enable TLS
    pub tls: bool,
    /// Skip TLS certificate verification
    pub tls_insecure: bool,
    /// Session lease TTL
    pub ttl: Duration,
}

impl EtcdConfig {
    /// Read the provider configuration. Every malformed value is a startup
    /// error naming the option.
    ///
    /// # Errors
    /// [`Status::invalid_argument`] naming the offending option.
    pub fn from_options(lookup: &OptionLookup) -> Result<Self, Status> {
        let endpoints = lookup
            .getenv(config::SERIAL_VOL_ACCESS_ETCD_ENDPOINTS)
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect::<Vec<_>>();

        Ok(Self {
            endpoints,
            auto_sync_interval: parse_duration_opt(
                lookup,
                config::SERIAL_VOL_ACCESS_ETCD_AUTO_SYNC_INTERVAL,
            )?,
            dial_keep_alive_time: parse_duration_opt(
                lookup,
                config::SERIAL_VOL_ACCESS_ETCD_DIAL_KEEP_ALIVE_TIME,
            )?,
            dial_keep_alive_timeout: parse_duration_opt(
                lookup,
                config::SERIAL_VOL_ACCESS_ETCD_DIAL_KEEP_ALIVE_TIMEOUT,
            )?,
            dial_timeout: parse_duration_opt(lookup, config::SERIAL_VOL_ACCESS_ETCD_DIAL_TIMEOUT)?,
            max_call_recv_msg_sz: parse_size_opt(
                lookup,
                config::SERIAL_VOL_ACCESS_ETCD_MAX_CALL_RECV_MSG_SZ,
            )?,
            max_call_send_msg_sz: parse_size_opt(
                lookup,
                config::SERIAL_VOL_ACCESS_ETCD_MAX_CALL_SEND_MSG_SZ,
            )?,
            username: lookup.lookup(config::SERIAL_VOL_ACCESS_ETCD_USERNAME),
            password: lookup.lookup(config::SERIAL_VOL_ACCESS_ETCD_PASSWORD),
            reject_old_cluster: parse_bool_opt(
                lookup,
                config::SERIAL_VOL_ACCESS_ETCD_REJECT_OLD_CLUSTER,
            )?,
            tls: parse_bool_opt(lookup, config::SERIAL_VOL_ACCESS_ETCD_TLS)?,
            tls_insecure: parse_bool_opt(lookup, config::SERIAL_VOL_ACCESS_ETCD_TLS_INSECURE)?,
            ttl: parse_duration_opt(lookup, config::SERIAL_VOL_ACCESS_ETCD_TTL)?
                .unwrap_or(DEFAULT_TTL),
        })
    }
}

fn parse_duration_opt(lookup: &OptionLookup, name: &str) -> Result<Option<Duration>, Status> {
    match lookup.lookup(name) {
        None => Ok(None),
        Some(raw) => config::parse_duration(&raw)
            .map(Some)
            .ok_or_else(|| Status::invalid_argument(format!("invalid duration: {name}={raw}"))),
    }
}

fn parse_size_opt(lookup: &OptionLookup, name: &str) -> Result<Option<usize>, Status> {
    match lookup.lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|_| Status::invalid_argument(format!("invalid size: {name}={raw}"))),
    }
}

fn parse_bool_opt(lookup: &OptionLookup, name: &str) -> Result<bool, Status> {
    match lookup.lookup(name) {
        None => Ok(false),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "t" | "true" | "y" | "yes" => Ok(true),
            "0" | "f" | "false" | "n" | "no" | "" => Ok(false),
            _ => Err(Status::invalid_argument(format!(
                "invalid boolean: {name}={raw}"
            ))),
        },
    }
}

fn etcd_status(err: &etcd_client::Error) -> Status {
    Status::unavailable(format!("etcd: {err}"))
}

/// The provider's lease-backed session.
struct Session {
    /// The granted lease id
    lease_id: i64,
    /// Background keep-alive task
    keeper: JoinHandle<()>,
}

/// Distributed lock provider over an etcd cluster.
pub struct EtcdLockProvider {
    /// Shared client; cloned per operation
    client: Client,
    /// Key prefix under which all locks live
    prefix: String,
    /// Session lease TTL
    ttl: Duration,
    /// Lazily created session
    session: Mutex<Option<Session>>,
}

impl EtcdLockProvider {
    /// Connect to the cluster and create a provider rooted at `prefix`.
    ///
    /// # Errors
    /// Connection failures surface as [`Status::unavailable`].
    pub async fn new(prefix: &str, cfg: EtcdConfig) -> Result<Self, Status> {
        let mut opts = ConnectOptions::new();
        if let (Some(user), Some(password)) = (&cfg.username, &cfg.password) {
            opts = opts.with_user(user, password);
        }
        if let (Some(time), Some(timeout)) =
            (cfg.dial_keep_alive_time, cfg.dial_keep_alive_timeout)
        {
            opts = opts.with_keep_alive(time, timeout);
        }
        if let Some(timeout) = cfg.dial_timeout {
            opts = opts.with_connect_timeout(timeout);
        }
        if cfg.tls {
            opts = opts.with_tls(TlsOptions::new());
        }

        let client = Client::connect(&cfg.endpoints, Some(opts))
            .await
            .map_err(|e| etcd_status(&e))?;
        debug!(endpoints = ?cfg.endpoints, prefix = %prefix, "etcd lock provider connected");

        Ok(Self {
            client,
            prefix: prefix.trim_end_matches('/').to_owned(),
            ttl: cfg.ttl,
            session: Mutex::new(None),
        })
    }

    /// The session lease, granting it on first use.
    async fn session_lease(&self) -> Result<i64, Status> {
        let mut session = self.session.lock().await;
        if let Some(session) = session.as_ref() {
            return Ok(session.lease_id);
        }

        let mut client = self.client.clone();
        let ttl_secs = self.ttl.as_secs().max(1) as i64;
        let granted = client
            .lease_grant(ttl_secs, None)
            .await
            .map_err(|e| etcd_status(&e))?;
        let lease_id = granted.id();

        let (mut keeper, mut responses) = client
            .lease_keep_alive(lease_id)
            .await
            .map_err(|e| etcd_status(&e))?;
        let interval = Duration::from_secs((ttl_secs as u64 / 3).max(1));
        let keeper_task = tokio::spawn(async move {
            loop {
                if keeper.keep_alive().await.is_err() {
                    warn!(lease_id, "etcd lease keep-alive send failed");
                    break;
                }
                match responses.message().await {
                    Ok(Some(_)) => {}
                    Ok(None) | Err(_) => {
                        warn!(lease_id, "etcd lease keep-alive stream closed");
                        break;
                    }
                }
                tokio::time::sleep(interval).await;
            }
        });

        debug!(lease_id, ttl = ?self.ttl, "etcd lock session created");
        *session = Some(Session {
            lease_id,
            keeper: keeper_task,
        });
        Ok(lease_id)
    }

    async fn lock_for_key(&self, key: String) -> Result<Arc<dyn TryLock>, Status> {
        let lease_id = self.session_lease().await?;
        Ok(Arc::new(EtcdTryLock {
            client: self.client.clone(),
            key,
            lease_id,
        }))
    }

    /// Revoke the session lease, releasing every lock it holds.
    ///
    /// # Errors
    /// Store failures surface as [`Status::unavailable`].
    pub async fn close(&self) -> Result<(), Status> {
        let mut session = self.session.lock().await;
        if let Some(session) = session.take() {
            session.keeper.abort();
            self.client
                .clone()
                .lease_revoke(session.lease_id)
                .await
                .map_err(|e| etcd_status(&e))?;
        }
        Ok(())
    }
}

impl Drop for EtcdLockProvider {
    fn drop(&mut self) {
        if let Ok(session) = self.session.try_lock() {
            if let Some(session) = session.as_ref() {
                session.keeper.abort();
            }
        }
    }
}

#[async_trait]
impl VolumeLockProvider for EtcdLockProvider {
    async fn lock_with_id(&self, id: &str) -> Result<Arc<dyn TryLock>, Status> {
        self.lock_for_key(format!("{}/ids/{id}", self.prefix)).await
    }

    async fn lock_with_name(&self, name: &str) -> Result<Arc<dyn TryLock>, Status> {
        self.lock_for_key(format!("{}/names/{name}", self.prefix))
            .await
    }
}

/// A lease-owned keyed try-mutex in the store.
struct EtcdTryLock {
    /// Clonable client handle
    client: Client,
    /// The lock's key
    key: String,
    /// The provider session's lease
    lease_id: i64,
}

impl EtcdTryLock {
    /// One acquisition attempt: create the key only when absent.
    async fn try_acquire_once(&self) -> Result<bool, Status> {
        let txn = Txn::new()
            .when([Compare::create_revision(
                self.key.as_str(),
                CompareOp::Equal,
                0,
            )])
            .and_then([TxnOp::put(
                self.key.as_str(),
                Vec::new(),
                Some(PutOptions::new().with_lease(self.lease_id)),
            )]);
        let resp = self
            .client
            .clone()
            .txn(txn)
            .await
            .map_err(|e| etcd_status(&e))?;
        Ok(resp.succeeded())
    }

    /// Wait until the holder's key is deleted or the budget runs out.
    /// Returns `false` on timeout.
    async fn wait_for_release(&self, budget: Duration) -> Result<bool, Status> {
        let (mut watcher, mut stream) = self
            .client
            .clone()
            .watch(self.key.as_str(), None)
            .await
            .map_err(|e| etcd_status(&e))?;

        let waited = tokio::time::timeout(budget, async {
            loop {
                match stream.message().await {
                    Ok(Some(resp)) => {
                        if resp
                            .events()
                            .iter()
                            .any(|e| e.event_type() == EventType::Delete)
                        {
                            return Ok(());
                        }
                    }
                    Ok(None) => return Err(Status::unavailable("etcd watch stream closed")),
                    Err(e) => return Err(etcd_status(&e)),
                }
            }
        })
        .await;

        if let Err(e) = watcher.cancel().await {
            debug!(key = %self.key, error = %e, "etcd watch cancel failed");
        }

        match waited {
            Ok(Ok(())) => Ok(true),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(false),
        }
    }
}

#[async_trait]
impl TryLock for EtcdTryLock {
    async fn try_lock(&self, timeout: Duration) -> Result<bool, Status> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_acquire_once().await? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            if !self.wait_for_release(deadline - now).await? {
                return Ok(false);
            }
            // The key vanished; race the other waiters for it.
        }
    }

    async fn unlock(&self) -> Result<(), Status> {
        self.client
            .clone()
            .delete(self.key.as_str(), None)
            .await
            .map_err(|e| etcd_status(&e))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), Status> {
        // The key is already gone after unlock; deleting again is harmless
        // and also covers callers that drop a held lock.
        self.client
            .clone()
            .delete(self.key.as_str(), None)
            .await
            .map_err(|e| etcd_status(&e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PluginConfig;
    use std::sync::Arc as StdArc;

    fn lookup_from(pairs: &[&str]) -> OptionLookup {
        OptionLookup::new(StdArc::new(PluginConfig::from_pairs(pairs)))
    }

    #[test]
    fn config_parses_valid_options() {
        let lookup = lookup_from(&[
            "X_CSI_SERIAL_VOL_ACCESS_ETCD_ENDPOINTS=127.0.0.1:2379, 127.0.0.2:2379",
            "X_CSI_SERIAL_VOL_ACCESS_ETCD_AUTO_SYNC_INTERVAL=10s",
            "X_CSI_SERIAL_VOL_ACCESS_ETCD_DIAL_KEEP_ALIVE_TIME=10s",
            "X_CSI_SERIAL_VOL_ACCESS_ETCD_DIAL_KEEP_ALIVE_TIMEOUT=10s",
            "X_CSI_SERIAL_VOL_ACCESS_ETCD_DIAL_TIMEOUT=1s",
            "X_CSI_SERIAL_VOL_ACCESS_ETCD_MAX_CALL_SEND_MSG_SZ=2097152",
            "X_CSI_SERIAL_VOL_ACCESS_ETCD_MAX_CALL_RECV_MSG_SZ=32",
            "X_CSI_SERIAL_VOL_ACCESS_ETCD_USERNAME=user1name",
            "X_CSI_SERIAL_VOL_ACCESS_ETCD_PASSWORD=pass7word",
            "X_CSI_SERIAL_VOL_ACCESS_ETCD_TLS=true",
            "X_CSI_SERIAL_VOL_ACCESS_ETCD_TLS_INSECURE=true",
            "X_CSI_SERIAL_VOL_ACCESS_ETCD_REJECT_OLD_CLUSTER=true",
            "X_CSI_SERIAL_VOL_ACCESS_ETCD_TTL=10s",
        ]);
        let cfg = EtcdConfig::from_options(&lookup).unwrap();
        assert_eq!(
            cfg.endpoints,
            vec!["127.0.0.1:2379".to_owned(), "127.0.0.2:2379".to_owned()]
        );
        assert_eq!(cfg.auto_sync_interval, Some(Duration::from_secs(10)));
        assert_eq!(cfg.dial_timeout, Some(Duration::from_secs(1)));
        assert_eq!(cfg.max_call_send_msg_sz, Some(2_097_152));
        assert_eq!(cfg.max_call_recv_msg_sz, Some(32));
        assert_eq!(cfg.username.as_deref(), Some("user1name"));
        assert_eq!(cfg.password.as_deref(), Some("pass7word"));
        assert!(cfg.tls);
        assert!(cfg.tls_insecure);
        assert!(cfg.reject_old_cluster);
        assert_eq!(cfg.ttl, Duration::from_secs(10));
    }

    #[test]
    fn config_defaults() {
        let cfg = EtcdConfig::from_options(&lookup_from(&[])).unwrap();
        assert!(cfg.endpoints.is_empty());
        assert_eq!(cfg.ttl, DEFAULT_TTL);
        assert!(!cfg.tls);
    }

    #[test]
    fn config_rejects_malformed_values() {
        for (name, value) in [
            ("X_CSI_SERIAL_VOL_ACCESS_ETCD_AUTO_SYNC_INTERVAL", "split second"),
            ("X_CSI_SERIAL_VOL_ACCESS_ETCD_DIAL_KEEP_ALIVE_TIME", "often"),
            ("X_CSI_SERIAL_VOL_ACCESS_ETCD_DIAL_KEEP_ALIVE_TIMEOUT", "shortly"),
            ("X_CSI_SERIAL_VOL_ACCESS_ETCD_DIAL_TIMEOUT", "nevergiveup"),
            ("X_CSI_SERIAL_VOL_ACCESS_ETCD_MAX_CALL_SEND_MSG_SZ", "bad"),
            ("X_CSI_SERIAL_VOL_ACCESS_ETCD_MAX_CALL_RECV_MSG_SZ", "wrong"),
            ("X_CSI_SERIAL_VOL_ACCESS_ETCD_TLS", "troo"),
            ("X_CSI_SERIAL_VOL_ACCESS_ETCD_TLS_INSECURE", "!"),
            ("X_CSI_SERIAL_VOL_ACCESS_ETCD_REJECT_OLD_CLUSTER", "maybe"),
        ] {
            let pair = format!("{name}={value}");
            let lookup = lookup_from(&[pair.as_str()]);
            let err = EtcdConfig::from_options(&lookup).unwrap_err();
            assert_eq!(err.code(), csirpc::Code::InvalidArgument, "option {name}");
            assert!(err.message().contains(name), "message: {}", err.message());
        }
    }
}
