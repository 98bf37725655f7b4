//! Source-IP-preserving SSH tunnels.
//!
//! A [`Tunnel`] relays TCP between three endpoints: a local listener (or
//! dial target), a gateway's SSH server, and a remote endpoint. Forward
//! tunnels carry egress traffic out of the forwarder pod; remote-forward
//! tunnels carry ingress traffic back in. Cancellation is first-class: every
//! reconciler sync may need to revoke a tunnel, and revocation must also
//! terminate in-flight copy loops, not just the listener.

use std::fmt;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::Error;
use crate::retry::{supervise, RetryConfig};
use crate::ssh::{self, ClientHandler, SshClientConfig};
use crate::Result;

/// Split an `ip:port` endpoint.
pub fn parse_endpoint(endpoint: &str) -> Result<(String, u16)> {
    let (ip, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| Error::validation(format!("invalid endpoint {endpoint:?}")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| Error::validation(format!("invalid port in endpoint {endpoint:?}")))?;
    Ok((ip.to_string(), port))
}

/// A supervised bidirectional SSH tunnel.
pub struct Tunnel {
    local_endpoint: String,
    server_endpoint: String,
    remote_endpoint: String,
    config: SshClientConfig,
    retry: RetryConfig,
    cancel: CancellationToken,
}

impl Tunnel {
    /// Create a tunnel between `local`, `server`, and `remote` endpoints
    /// (each `ip:port`).
    pub fn new(local: &str, server: &str, remote: &str, config: SshClientConfig) -> Self {
        Self {
            local_endpoint: local.to_string(),
            server_endpoint: server.to_string(),
            remote_endpoint: remote.to_string(),
            config,
            retry: RetryConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Build a tunnel from a canonical 6-segment key
    /// `localIP:localPort:serverIP:serverPort:remoteIP:remotePort`.
    pub fn from_key(key: &str, config: SshClientConfig) -> Result<Self> {
        let segments: Vec<&str> = key.split(':').collect();
        if segments.len() != 6 {
            return Err(Error::validation(format!("invalid tunnel key {key:?}")));
        }
        let local = format!("{}:{}", segments[0], segments[1]);
        let server = format!("{}:{}", segments[2], segments[3]);
        let remote = format!("{}:{}", segments[4], segments[5]);
        Ok(Self::new(&local, &server, &remote, config))
    }

    /// Cancel the tunnel: the supervisor, the listener, and all in-flight
    /// copy loops terminate.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Forward the remote endpoint to the local endpoint via the server.
    ///
    /// Listens on the local endpoint; each inbound connection is relayed
    /// through a `direct-tcpip` channel whose origin is pinned to the
    /// server's own IP, which is what makes the packet leaving the gateway
    /// carry the gateway source address. Blocks until cancellation or error.
    pub async fn forward(&self) -> Result<()> {
        info!(tunnel = %self, "starting forward");

        let handle = ssh::connect(
            &self.server_endpoint,
            &self.config,
            ClientHandler {
                local_endpoint: None,
                cancel: self.cancel.clone(),
            },
        )
        .await?;

        let listener = TcpListener::bind(&self.local_endpoint).await?;
        let (server_ip, _) = parse_endpoint(&self.server_endpoint)?;
        let (remote_ip, remote_port) = parse_endpoint(&self.remote_endpoint)?;

        loop {
            let (mut local_conn, peer) = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted?,
            };
            debug!(tunnel = %self, peer = %peer, "accepted local connection");

            // The origin sent on the channel is what the gateway binds as
            // the outgoing local address; port 0 lets its kernel pick.
            let channel = handle
                .channel_open_direct_tcpip(
                    remote_ip.clone(),
                    u32::from(remote_port),
                    server_ip.clone(),
                    0,
                )
                .await?;

            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                let mut channel_stream = channel.into_stream();
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    res = tokio::io::copy_bidirectional(&mut local_conn, &mut channel_stream) => {
                        if let Err(e) = res {
                            debug!(error = %e, "forward copy ended");
                        }
                    }
                }
            });
        }
    }

    /// Forward the local endpoint to the remote endpoint via the server.
    ///
    /// Requests a `tcpip-forward` listener on the server side; connections
    /// it pushes back are joined to fresh dials of the local endpoint by the
    /// client handler. Blocks until cancellation or connection loss.
    pub async fn remote_forward(&self) -> Result<()> {
        info!(tunnel = %self, "starting remote forward");

        let mut handle = ssh::connect(
            &self.server_endpoint,
            &self.config,
            ClientHandler {
                local_endpoint: Some(self.local_endpoint.clone()),
                cancel: self.cancel.clone(),
            },
        )
        .await?;

        let (remote_ip, remote_port) = parse_endpoint(&self.remote_endpoint)?;
        let _ = handle
            .tcpip_forward(remote_ip, u32::from(remote_port))
            .await?;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(Duration::from_secs(1)) => {
                    if handle.is_closed() {
                        return Err(Error::Ssh(russh::Error::Disconnect));
                    }
                }
            }
        }
    }

    /// Non-blocking [`Tunnel::forward`] with exponential backoff supervision.
    pub fn forward_nb(self: std::sync::Arc<Self>) {
        let retry = self.retry.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            supervise(&retry, &format!("forward {self}"), &cancel, || {
                let tunnel = self.clone();
                async move { tunnel.forward().await }
            })
            .await;
        });
    }

    /// Non-blocking [`Tunnel::remote_forward`] with exponential backoff
    /// supervision.
    pub fn remote_forward_nb(self: std::sync::Arc<Self>) {
        let retry = self.retry.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            supervise(&retry, &format!("remote forward {self}"), &cancel, || {
                let tunnel = self.clone();
                async move { tunnel.remote_forward().await }
            })
            .await;
        });
    }
}

impl fmt::Display for Tunnel {
    /// ex) "local: 192.168.122.100:8080, server: 192.168.122.101:2022, remote: 192.168.122.102:80"
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "local: {}, server: {}, remote: {}",
            self.local_endpoint, self.server_endpoint, self.remote_endpoint
        )
    }
}
