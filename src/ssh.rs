//! SSH transport: client configuration and the embedded gateway server.
//!
//! The gateway runs one embedded SSH server per configured source address.
//! It differs from a stock server in exactly one way: the `direct-tcpip`
//! handler dials the destination with the client-supplied origin as the
//! local bind address, so the packet leaving the gateway carries the source
//! IP chosen by the forwarder. Reverse forwards (`tcpip-forward` /
//! `cancel-tcpip-forward`) are standard.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use russh::keys::ssh_key;
use russh::server::{Auth, Msg, Server};
use russh::{client, server, Channel};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::Result;

/// Username/password pair shared by the forwarder client and gateway server.
///
/// The pair is operator-supplied configuration; key-based authentication of
/// the transport is an external concern.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshCredentials {
    /// Username presented by forwarders
    pub user: String,
    /// Password presented by forwarders
    pub password: String,
}

impl Default for SshCredentials {
    fn default() -> Self {
        Self {
            user: "relay".to_string(),
            password: "relaygate".to_string(),
        }
    }
}

/// Client-side SSH configuration used by tunnels.
#[derive(Clone, Debug)]
pub struct SshClientConfig {
    /// Credentials presented to the gateway server
    pub credentials: SshCredentials,
    /// Dial timeout for the SSH TCP connection
    pub connect_timeout: Duration,
}

impl Default for SshClientConfig {
    fn default() -> Self {
        Self {
            credentials: SshCredentials::default(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Client handler for tunnel connections.
///
/// Host keys are not verified: gateways generate an ephemeral host key at
/// startup and are addressed by IP inside a controlled segment. When
/// `local_endpoint` is set, forwarded-tcpip channels pushed by the server
/// (reverse forwards) are joined to fresh dials of that endpoint.
pub struct ClientHandler {
    /// Endpoint reverse-forwarded channels are joined to
    pub local_endpoint: Option<String>,
    /// Cancellation shared with the owning tunnel
    pub cancel: CancellationToken,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        let Some(local) = self.local_endpoint.clone() else {
            debug!(
                address = %connected_address,
                port = connected_port,
                "dropping forwarded channel: no local endpoint configured"
            );
            return Ok(());
        };

        debug!(
            origin = %format!("{originator_address}:{originator_port}"),
            local = %local,
            "joining forwarded channel to local endpoint"
        );

        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut local_conn = match TcpStream::connect(&local).await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(local = %local, error = %e, "failed to dial local endpoint");
                    return;
                }
            };
            let mut channel_stream = channel.into_stream();
            tokio::select! {
                _ = cancel.cancelled() => {}
                res = tokio::io::copy_bidirectional(&mut channel_stream, &mut local_conn) => {
                    if let Err(e) = res {
                        debug!(error = %e, "forwarded copy ended");
                    }
                }
            }
        });

        Ok(())
    }
}

/// Dial and authenticate an SSH session to `server` ("ip:port").
pub async fn connect(
    server: &str,
    config: &SshClientConfig,
    handler: ClientHandler,
) -> Result<client::Handle<ClientHandler>> {
    let ssh_config = Arc::new(client::Config::default());

    let mut handle = tokio::time::timeout(
        config.connect_timeout,
        client::connect(ssh_config, server, handler),
    )
    .await
    .map_err(|_| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("timed out dialing ssh server {server}"),
        ))
    })??;

    let auth = handle
        .authenticate_password(
            config.credentials.user.clone(),
            config.credentials.password.clone(),
        )
        .await?;
    if !auth.success() {
        return Err(Error::Ssh(russh::Error::NotAuthenticated));
    }

    Ok(handle)
}

/// Embedded SSH forwarding server bound to one gateway address.
pub struct SshServer {
    addr: String,
    credentials: SshCredentials,
    cancel: CancellationToken,
}

impl SshServer {
    /// Create a server for `ip:port` with the given credentials.
    pub fn new(ip: &str, port: u16, credentials: SshCredentials, cancel: CancellationToken) -> Self {
        Self {
            addr: format!("{ip}:{port}"),
            credentials,
            cancel,
        }
    }

    /// Listen and serve until an error occurs or the token fires.
    ///
    /// Runs under backoff supervision; errors bubble up so the supervisor
    /// restarts the listener.
    pub async fn run(&self) -> Result<()> {
        // Ephemeral host key: gateways are addressed by IP and clients do
        // not pin host keys.
        let key = russh::keys::PrivateKey::from(ssh_key::private::Ed25519Keypair::from_seed(
            &rand::random(),
        ));
        let config = Arc::new(server::Config {
            keys: vec![key],
            auth_rejection_time: Duration::from_secs(3),
            auth_rejection_time_initial: Some(Duration::ZERO),
            ..Default::default()
        });

        let mut runner = SshServerRunner {
            credentials: self.credentials.clone(),
            cancel: self.cancel.clone(),
        };

        info!(addr = %self.addr, "ssh forwarding server listening");
        tokio::select! {
            _ = self.cancel.cancelled() => Ok(()),
            res = runner.run_on_address(config, self.addr.clone()) => {
                res?;
                Ok(())
            }
        }
    }
}

#[derive(Clone)]
struct SshServerRunner {
    credentials: SshCredentials,
    cancel: CancellationToken,
}

impl Server for SshServerRunner {
    type Handler = GatewayHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> GatewayHandler {
        debug!(peer = ?peer_addr, "new ssh client connection");
        GatewayHandler {
            credentials: self.credentials.clone(),
            peer_addr,
            cancel: self.cancel.clone(),
            reverse_listeners: HashMap::new(),
        }
    }

    fn handle_session_error(&mut self, error: <Self::Handler as server::Handler>::Error) {
        warn!(error = %error, "ssh session error");
    }
}

/// Per-connection handler of the gateway server.
pub struct GatewayHandler {
    credentials: SshCredentials,
    peer_addr: Option<SocketAddr>,
    cancel: CancellationToken,
    /// Reverse-forward listeners opened by this session, by (address, port).
    reverse_listeners: HashMap<(String, u32), CancellationToken>,
}

impl Drop for GatewayHandler {
    fn drop(&mut self) {
        for token in self.reverse_listeners.values() {
            token.cancel();
        }
    }
}

impl server::Handler for GatewayHandler {
    type Error = russh::Error;

    async fn auth_password(
        &mut self,
        user: &str,
        password: &str,
    ) -> std::result::Result<Auth, Self::Error> {
        if user == self.credentials.user && password == self.credentials.password {
            return Ok(Auth::Accept);
        }
        warn!(user = %user, peer = ?self.peer_addr, "password authentication rejected");
        Ok(Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        })
    }

    /// Source-IP-preserving `direct-tcpip`.
    ///
    /// The connection to the destination is bound to the client-supplied
    /// origin address, so the outgoing packet carries the source IP the
    /// forwarder chose rather than the gateway's default address.
    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut server::Session,
    ) -> std::result::Result<bool, Self::Error> {
        let Ok(dest_ip) = host_to_connect.parse::<IpAddr>() else {
            warn!(host = %host_to_connect, "rejecting direct-tcpip: destination is not an IP");
            return Ok(false);
        };
        let Ok(origin_ip) = originator_address.parse::<IpAddr>() else {
            warn!(origin = %originator_address, "rejecting direct-tcpip: origin is not an IP");
            return Ok(false);
        };
        let dest = SocketAddr::new(dest_ip, port_to_connect as u16);
        let origin = SocketAddr::new(origin_ip, originator_port as u16);

        let stream = match dial_from(origin, dest).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(dest = %dest, origin = %origin, error = %e, "direct-tcpip dial failed");
                return Ok(false);
            }
        };

        debug!(dest = %dest, origin = %origin, "direct-tcpip open");

        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut stream = stream;
            let mut channel_stream = channel.into_stream();
            tokio::select! {
                _ = cancel.cancelled() => {}
                res = tokio::io::copy_bidirectional(&mut channel_stream, &mut stream) => {
                    if let Err(e) = res {
                        debug!(error = %e, "direct-tcpip copy ended");
                    }
                }
            }
        });

        Ok(true)
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut server::Session,
    ) -> std::result::Result<bool, Self::Error> {
        let listener = match TcpListener::bind((address, *port as u16)).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(address = %address, port = *port, error = %e, "tcpip-forward bind failed");
                return Ok(false);
            }
        };
        if *port == 0 {
            *port = u32::from(listener.local_addr()?.port());
        }

        info!(address = %address, port = *port, "tcpip-forward listening");

        let token = self.cancel.child_token();
        self.reverse_listeners
            .insert((address.to_string(), *port), token.clone());

        let handle = session.handle();
        let address = address.to_string();
        let port = *port;
        tokio::spawn(async move {
            loop {
                let (stream, peer) = tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(address = %address, port, error = %e, "tcpip-forward accept failed");
                            break;
                        }
                    },
                };

                let channel = match handle
                    .channel_open_forwarded_tcpip(
                        address.clone(),
                        port,
                        peer.ip().to_string(),
                        u32::from(peer.port()),
                    )
                    .await
                {
                    Ok(channel) => channel,
                    Err(e) => {
                        warn!(error = %e, "failed to open forwarded-tcpip channel");
                        break;
                    }
                };

                let token = token.clone();
                tokio::spawn(async move {
                    let mut stream = stream;
                    let mut channel_stream = channel.into_stream();
                    tokio::select! {
                        _ = token.cancelled() => {}
                        res = tokio::io::copy_bidirectional(&mut stream, &mut channel_stream) => {
                            if let Err(e) = res {
                                debug!(error = %e, "forwarded copy ended");
                            }
                        }
                    }
                });
            }
        });

        Ok(true)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut server::Session,
    ) -> std::result::Result<bool, Self::Error> {
        if let Some(token) = self
            .reverse_listeners
            .remove(&(address.to_string(), port))
        {
            token.cancel();
            return Ok(true);
        }
        Ok(false)
    }
}

/// Connect to `dest` with the local address bound to `origin`.
async fn dial_from(origin: SocketAddr, dest: SocketAddr) -> std::io::Result<TcpStream> {
    let socket = if dest.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.bind(origin)?;
    socket.connect(dest).await
}
