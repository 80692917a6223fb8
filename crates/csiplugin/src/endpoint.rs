//! Endpoint resolution and listener setup.
//!
//! The listener address comes from the `CSI_ENDPOINT` option. Accepted forms:
//!
//! - `tcp://host:port`
//! - `unix:///absolute/path` and `unix://relative/path`
//! - a bare filesystem path, which implies a unix socket
//!
//! Unix-socket endpoints additionally honor `X_CSI_ENDPOINT_PERMS` (octal
//! permission mask, default `0755`) and `X_CSI_ENDPOINT_USER` /
//! `X_CSI_ENDPOINT_GROUP` (owner by name or numeric id).

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use nix::unistd::{chown, Gid, Group, Uid, User};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tracing::info;

use crate::config;
use crate::context::OptionLookup;

/// Errors raised while resolving or preparing the endpoint. All of them are
/// fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    /// The `CSI_ENDPOINT` option is missing or blank.
    #[error("missing CSI_ENDPOINT")]
    Missing,
    /// The endpoint scheme is not `tcp` or `unix`.
    #[error("invalid network address: {0}")]
    InvalidNetworkAddress(String),
    /// The permission mask does not parse as octal.
    #[error("invalid endpoint permissions: {0}")]
    InvalidPerms(String),
    /// The configured owner could not be resolved.
    #[error("unknown endpoint {kind}: {name}")]
    UnknownOwner {
        /// "user" or "group"
        kind: &'static str,
        /// The unresolvable name or id
        name: String,
    },
    /// Socket setup failed.
    #[error("endpoint io error: {0}")]
    Io(#[from] std::io::Error),
    /// A system call failed.
    #[error("endpoint system error: {0}")]
    Sys(#[from] nix::Error),
}

/// A parsed endpoint descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// TCP listener at `host:port`
    Tcp(String),
    /// Unix-socket listener at the given path
    Unix(PathBuf),
}

impl Endpoint {
    /// Resolve the endpoint from configuration.
    ///
    /// # Errors
    /// [`EndpointError::Missing`] when the option is unset or blank, and
    /// [`EndpointError::InvalidNetworkAddress`] for unrecognized schemes.
    pub fn from_options(lookup: &OptionLookup) -> Result<Self, EndpointError> {
        let raw = lookup.getenv(config::ENDPOINT);
        Self::parse(&raw)
    }

    /// Parse an endpoint string.
    ///
    /// # Errors
    /// See [`Endpoint::from_options`].
    pub fn parse(raw: &str) -> Result<Self, EndpointError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(EndpointError::Missing);
        }
        match raw.split_once("://") {
            Some(("tcp", addr)) => {
                // "*" binds every interface.
                Ok(Self::Tcp(addr.replacen('*', "0.0.0.0", 1)))
            }
            Some(("unix", path)) => Ok(Self::Unix(PathBuf::from(path))),
            Some((_, _)) => Err(EndpointError::InvalidNetworkAddress(raw.to_owned())),
            // A bare path implies a unix socket.
            None => Ok(Self::Unix(PathBuf::from(raw))),
        }
    }

    /// Bind the listening socket.
    ///
    /// A pre-existing socket file at a unix endpoint is removed first; a
    /// stale file would otherwise make the bind fail on every restart.
    ///
    /// # Errors
    /// Any bind failure is fatal at startup.
    pub async fn bind(&self) -> Result<BoundListener, EndpointError> {
        match self {
            Self::Tcp(addr) => {
                let listener = TcpListener::bind(addr.as_str()).await?;
                info!(endpoint = format!("tcp://{addr}"), "listener bound");
                Ok(BoundListener::Tcp(listener))
            }
            Self::Unix(path) => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                let listener = UnixListener::bind(path)?;
                info!(endpoint = format!("unix://{}", path.display()), "listener bound");
                Ok(BoundListener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
        }
    }
}

/// A bound listener, either TCP or unix-socket.
#[derive(Debug)]
pub enum BoundListener {
    /// TCP listener
    Tcp(TcpListener),
    /// Unix-socket listener and the path it owns
    Unix {
        /// The accepting socket
        listener: UnixListener,
        /// Path of the socket file, unlinked on shutdown
        path: PathBuf,
    },
}

impl BoundListener {
    /// Accept the next connection.
    ///
    /// # Errors
    /// Propagates accept failures from the socket.
    pub async fn accept(&self) -> std::io::Result<IoStream> {
        match self {
            Self::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(IoStream::Tcp(stream))
            }
            Self::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(IoStream::Unix(stream))
            }
        }
    }

    /// The unix-socket path, when this is a filesystem endpoint.
    #[must_use]
    pub fn unix_path(&self) -> Option<&Path> {
        match self {
            Self::Tcp(_) => None,
            Self::Unix { path, .. } => Some(path),
        }
    }

    /// Human-readable endpoint description for logs.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Tcp(listener) => match listener.local_addr() {
                Ok(addr) => format!("tcp://{addr}"),
                Err(_) => "tcp://<unknown>".to_owned(),
            },
            Self::Unix { path, .. } => format!("unix://{}", path.display()),
        }
    }
}

/// A single accepted connection.
#[derive(Debug)]
pub enum IoStream {
    /// TCP connection
    Tcp(TcpStream),
    /// Unix-socket connection
    Unix(UnixStream),
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Self::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Self::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_flush(cx),
            Self::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Self::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Apply the configured permission mask to a unix-socket file.
///
/// The default mask `0755` is left alone.
///
/// # Errors
/// Fails startup when the mask is not octal or the chmod fails.
pub fn apply_endpoint_perms(lookup: &OptionLookup, path: &Path) -> Result<(), EndpointError> {
    let Some(raw) = lookup.lookup(config::ENDPOINT_PERMS) else {
        return Ok(());
    };
    if raw == "0755" {
        return Ok(());
    }
    let mode = u32::from_str_radix(raw.trim_start_matches("0o"), 8)
        .map_err(|_| EndpointError::InvalidPerms(raw.clone()))?;

    info!(path = %path.display(), mode = format!("{mode:04o}"), "chmod csi endpoint");
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// Chown a unix-socket file to the configured user/group.
///
/// Owners may be names or numeric ids. The chown is skipped entirely when
/// both resolve to the current process owner.
///
/// # Errors
/// Fails startup when a name does not resolve or the chown fails.
pub fn apply_endpoint_owner(lookup: &OptionLookup, path: &Path) -> Result<(), EndpointError> {
    let process_uid = Uid::current();
    let process_gid = Gid::current();
    let mut uid = process_uid;
    let mut gid = process_gid;

    if let Some(raw) = lookup.lookup(config::ENDPOINT_USER) {
        uid = resolve_uid(&raw)?;
    }
    if let Some(raw) = lookup.lookup(config::ENDPOINT_GROUP) {
        gid = resolve_gid(&raw)?;
    }

    if uid != process_uid || gid != process_gid {
        info!(path = %path.display(), uid = %uid, gid = %gid, "chown csi endpoint");
        chown(path, Some(uid), Some(gid))?;
    }
    Ok(())
}

fn resolve_uid(raw: &str) -> Result<Uid, EndpointError> {
    if let Ok(n) = raw.parse::<u32>() {
        return Ok(Uid::from_raw(n));
    }
    match User::from_name(raw) {
        Ok(Some(user)) => Ok(user.uid),
        _ => Err(EndpointError::UnknownOwner {
            kind: "user",
            name: raw.to_owned(),
        }),
    }
}

fn resolve_gid(raw: &str) -> Result<Gid, EndpointError> {
    if let Ok(n) = raw.parse::<u32>() {
        return Ok(Gid::from_raw(n));
    }
    match Group::from_name(raw) {
        Ok(Some(group)) => Ok(group.gid),
        _ => Err(EndpointError::UnknownOwner {
            kind: "group",
            name: raw.to_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PluginConfig;
    use std::sync::Arc;

    #[test]
    fn parse_tcp_forms() {
        assert_eq!(
            Endpoint::parse("tcp://127.0.0.1:8080").unwrap(),
            Endpoint::Tcp("127.0.0.1:8080".to_owned())
        );
        assert_eq!(
            Endpoint::parse("tcp://*:8080").unwrap(),
            Endpoint::Tcp("0.0.0.0:8080".to_owned())
        );
    }

    #[test]
    fn parse_unix_forms() {
        assert_eq!(
            Endpoint::parse("unix:///path/to/sock.sock").unwrap(),
            Endpoint::Unix(PathBuf::from("/path/to/sock.sock"))
        );
        assert_eq!(
            Endpoint::parse("unix://path/to/sock.sock").unwrap(),
            Endpoint::Unix(PathBuf::from("path/to/sock.sock"))
        );
    }

    #[test]
    fn parse_bare_paths_imply_unix() {
        assert_eq!(
            Endpoint::parse("/tmp/sock.sock").unwrap(),
            Endpoint::Unix(PathBuf::from("/tmp/sock.sock"))
        );
        assert_eq!(
            Endpoint::parse("sock.sock").unwrap(),
            Endpoint::Unix(PathBuf::from("sock.sock"))
        );
    }

    #[test]
    fn parse_missing() {
        assert!(matches!(Endpoint::parse(""), Err(EndpointError::Missing)));
        assert!(matches!(
            Endpoint::parse("    "),
            Err(EndpointError::Missing)
        ));
    }

    #[test]
    fn parse_invalid_schemes() {
        assert!(matches!(
            Endpoint::parse("tcp5://localhost:5000"),
            Err(EndpointError::InvalidNetworkAddress(_))
        ));
        assert!(matches!(
            Endpoint::parse("unixpcket://path/to/sock.sock"),
            Err(EndpointError::InvalidNetworkAddress(_))
        ));
    }

    #[tokio::test]
    async fn bind_unix_socket_and_accept() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("csi.sock");
        let endpoint = Endpoint::Unix(sock.clone());
        let listener = endpoint.bind().await.unwrap();
        assert_eq!(listener.unix_path(), Some(sock.as_path()));
        assert!(sock.exists());

        let client = UnixStream::connect(&sock);
        let (accepted, connected) = tokio::join!(listener.accept(), client);
        assert!(accepted.is_ok());
        assert!(connected.is_ok());
    }

    #[tokio::test]
    async fn perms_mask_applied_to_socket_file() {
        use std::os::unix::fs::MetadataExt;

        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("csi.sock");
        let _listener = Endpoint::Unix(sock.clone()).bind().await.unwrap();

        let lookup = OptionLookup::new(Arc::new(PluginConfig::from_pairs([
            "X_CSI_ENDPOINT_PERMS=0770",
        ])));
        apply_endpoint_perms(&lookup, &sock).unwrap();

        let mode = std::fs::metadata(&sock).unwrap().mode() & 0o777;
        assert_eq!(mode, 0o770);
    }

    #[test]
    fn perms_default_mask_is_skipped_and_garbage_rejected() {
        let lookup = OptionLookup::new(Arc::new(PluginConfig::from_pairs([
            "X_CSI_ENDPOINT_PERMS=0755",
        ])));
        // The default mask never touches the file, so a missing path is fine.
        assert!(apply_endpoint_perms(&lookup, std::path::Path::new("/nonexistent")).is_ok());

        let lookup = OptionLookup::new(Arc::new(PluginConfig::from_pairs([
            "X_CSI_ENDPOINT_PERMS=rwxrwx---",
        ])));
        assert!(matches!(
            apply_endpoint_perms(&lookup, std::path::Path::new("/nonexistent")),
            Err(EndpointError::InvalidPerms(_))
        ));
    }

    #[tokio::test]
    async fn bind_replaces_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("csi.sock");
        std::fs::write(&sock, b"stale").unwrap();

        let endpoint = Endpoint::Unix(sock.clone());
        let listener = endpoint.bind().await;
        assert!(listener.is_ok());
    }
}
