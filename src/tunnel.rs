//! Secure-shell backed local port-forward to a tenant's remote database.
//!
//! A [`Tunnel`] is owned by exactly one sync cycle. Opening one resolves the
//! tenant host, connects over TCP, performs the SSH handshake and
//! authentication, then binds an ephemeral port on `127.0.0.1` whose
//! connections are forwarded through `direct-tcpip` channels. Dropping the
//! tunnel aborts the forwarder (and with it every forwarded socket) before
//! the SSH session is released.

use std::{fmt, net::SocketAddr, sync::Arc, time::Duration};

use russh::{
    client::{self, Handle},
    keys::{decode_secret_key, HashAlg, PrivateKeyWithHashAlg, PublicKey},
    Disconnect,
};
use thiserror::Error;
use tokio::{
    net::{lookup_host, TcpListener, TcpStream},
    task::{JoinHandle, JoinSet},
    time::timeout,
};
use tracing::{debug, info, warn};

#[derive(Clone)]
pub enum SshAuth {
    Password(String),
    PrivateKey {
        pem: String,
        passphrase: Option<String>,
    },
}

impl fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SshAuth::Password(_) => f.write_str("Password(*****)"),
            SshAuth::PrivateKey { .. } => f.write_str("PrivateKey(*****)"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TunnelParams {
    pub ssh_host: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    pub auth: SshAuth,
    /// SHA-256 fingerprint (`SHA256:...`) the server key must match, when pinned.
    pub host_fingerprint: Option<String>,
    /// Database host as seen from the SSH server.
    pub remote_host: String,
    pub remote_port: u16,
    pub connect_timeout: Duration,
    pub inactivity_timeout: Duration,
}

/// The stage a tunnel failed at, so "unreachable" and "bad credentials" read differently.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TunnelStage {
    Config,
    Dns,
    Tcp,
    Handshake,
    Auth,
    Forward,
}

impl TunnelStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelStage::Config => "config",
            TunnelStage::Dns => "dns",
            TunnelStage::Tcp => "tcp",
            TunnelStage::Handshake => "handshake",
            TunnelStage::Auth => "auth",
            TunnelStage::Forward => "forward",
        }
    }
}

impl fmt::Display for TunnelStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("invalid tunnel parameter {field}: {reason}")]
    InvalidParameter { field: &'static str, reason: String },

    #[error("no ssh credentials configured for {user}@{host}")]
    MissingCredentials { host: String, user: String },

    #[error("could not resolve {host}: {reason}")]
    Dns { host: String, reason: String },

    #[error("{stage} timed out after {after:?} for {host}")]
    Timeout {
        stage: TunnelStage,
        host: String,
        after: Duration,
    },

    #[error("tcp connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("ssh handshake with {host} failed: {reason}")]
    Handshake { host: String, reason: String },

    #[error("ssh authentication rejected for {user}@{host}")]
    Authentication { host: String, user: String },

    #[error("port forward failed: {0}")]
    Forward(String),
}

impl TunnelError {
    pub fn stage(&self) -> TunnelStage {
        match self {
            TunnelError::InvalidParameter { .. } => TunnelStage::Config,
            TunnelError::MissingCredentials { .. } => TunnelStage::Auth,
            TunnelError::Dns { .. } => TunnelStage::Dns,
            TunnelError::Timeout { stage, .. } => *stage,
            TunnelError::Connect { .. } => TunnelStage::Tcp,
            TunnelError::Handshake { .. } => TunnelStage::Handshake,
            TunnelError::Authentication { .. } => TunnelStage::Auth,
            TunnelError::Forward(_) => TunnelStage::Forward,
        }
    }
}

pub(crate) struct TunnelClient {
    expected_fingerprint: Option<String>,
}

impl client::Handler for TunnelClient {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256).to_string();
        match &self.expected_fingerprint {
            Some(expected) if expected.trim() != fingerprint => {
                warn!(%fingerprint, %expected, "ssh host key does not match pinned fingerprint");
                Ok(false)
            }
            Some(_) => Ok(true),
            None => {
                debug!(%fingerprint, "accepting unpinned ssh host key");
                Ok(true)
            }
        }
    }
}

pub struct Tunnel {
    local_addr: SocketAddr,
    session: Arc<Handle<TunnelClient>>,
    forwarder: Option<JoinHandle<()>>,
}

impl Tunnel {
    pub async fn open(params: &TunnelParams) -> Result<Self, TunnelError> {
        let addr = resolve(&params.ssh_host, params.ssh_port, params.connect_timeout).await?;
        let stream = connect_tcp(addr, &params.ssh_host, params.connect_timeout).await?;
        let session = establish_session(stream, params).await?;
        let session = Arc::new(session);

        // Port 0 lets the OS hand out a fresh ephemeral port for every cycle.
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|err| TunnelError::Forward(format!("bind local port: {err}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| TunnelError::Forward(format!("read local port: {err}")))?;

        let forwarder = tokio::spawn(accept_loop(
            listener,
            session.clone(),
            params.remote_host.clone(),
            params.remote_port,
        ));

        info!(
            ssh_host = %params.ssh_host,
            local_port = local_addr.port(),
            remote_port = params.remote_port,
            "tunnel opened"
        );

        Ok(Self {
            local_addr,
            session,
            forwarder: Some(forwarder),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Stops forwarding, then ends the SSH session.
    pub async fn close(mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
            let _ = forwarder.await;
        }
        if let Err(err) = self
            .session
            .disconnect(Disconnect::ByApplication, "sync cycle finished", "en")
            .await
        {
            debug!(error = %err, "ssh disconnect after close failed");
        }
        info!(local_port = self.local_addr.port(), "tunnel closed");
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
            warn!(
                local_port = self.local_addr.port(),
                "tunnel dropped without close; forwarder aborted"
            );
        }
    }
}

pub(crate) async fn resolve(
    host: &str,
    port: u16,
    limit: Duration,
) -> Result<SocketAddr, TunnelError> {
    let lookup = timeout(limit, lookup_host((host, port)))
        .await
        .map_err(|_| TunnelError::Timeout {
            stage: TunnelStage::Dns,
            host: host.to_string(),
            after: limit,
        })?;

    lookup
        .map_err(|err| TunnelError::Dns {
            host: host.to_string(),
            reason: err.to_string(),
        })?
        .next()
        .ok_or_else(|| TunnelError::Dns {
            host: host.to_string(),
            reason: "no addresses returned".into(),
        })
}

pub(crate) async fn connect_tcp(
    addr: SocketAddr,
    host: &str,
    limit: Duration,
) -> Result<TcpStream, TunnelError> {
    let stream = timeout(limit, TcpStream::connect(addr))
        .await
        .map_err(|_| TunnelError::Timeout {
            stage: TunnelStage::Tcp,
            host: host.to_string(),
            after: limit,
        })?
        .map_err(|source| TunnelError::Connect { addr, source })?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

pub(crate) async fn establish_session(
    stream: TcpStream,
    params: &TunnelParams,
) -> Result<Handle<TunnelClient>, TunnelError> {
    let config = Arc::new(client::Config {
        inactivity_timeout: Some(params.inactivity_timeout),
        keepalive_interval: Some(Duration::from_secs(15)),
        ..Default::default()
    });
    let handler = TunnelClient {
        expected_fingerprint: params.host_fingerprint.clone(),
    };

    let mut session = timeout(
        params.connect_timeout,
        client::connect_stream(config, stream, handler),
    )
    .await
    .map_err(|_| TunnelError::Timeout {
        stage: TunnelStage::Handshake,
        host: params.ssh_host.clone(),
        after: params.connect_timeout,
    })?
    .map_err(|err| TunnelError::Handshake {
        host: params.ssh_host.clone(),
        reason: err.to_string(),
    })?;

    let authenticated = timeout(params.connect_timeout, authenticate(&mut session, params))
        .await
        .map_err(|_| TunnelError::Timeout {
            stage: TunnelStage::Auth,
            host: params.ssh_host.clone(),
            after: params.connect_timeout,
        })??;

    if !authenticated {
        return Err(TunnelError::Authentication {
            host: params.ssh_host.clone(),
            user: params.ssh_user.clone(),
        });
    }

    Ok(session)
}

async fn authenticate(
    session: &mut Handle<TunnelClient>,
    params: &TunnelParams,
) -> Result<bool, TunnelError> {
    let handshake_error = |err: russh::Error| TunnelError::Handshake {
        host: params.ssh_host.clone(),
        reason: err.to_string(),
    };

    let result = match &params.auth {
        SshAuth::Password(password) => session
            .authenticate_password(params.ssh_user.clone(), password.clone())
            .await
            .map_err(handshake_error)?,
        SshAuth::PrivateKey { pem, passphrase } => {
            // An undecodable key is a credential problem, not a network one.
            let key = decode_secret_key(pem, passphrase.as_deref()).map_err(|err| {
                warn!(error = %err, "failed to decode ssh private key");
                TunnelError::Authentication {
                    host: params.ssh_host.clone(),
                    user: params.ssh_user.clone(),
                }
            })?;
            let key = PrivateKeyWithHashAlg::new(Arc::new(key), Some(HashAlg::Sha256));
            session
                .authenticate_publickey(params.ssh_user.clone(), key)
                .await
                .map_err(handshake_error)?
        }
    };

    Ok(result.success())
}

async fn accept_loop(
    listener: TcpListener,
    session: Arc<Handle<TunnelClient>>,
    remote_host: String,
    remote_port: u16,
) {
    // Owning the set here means aborting this task aborts every forwarded socket.
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    let session = session.clone();
                    let remote_host = remote_host.clone();
                    connections.spawn(async move {
                        if let Err(err) =
                            forward_connection(session, socket, peer, remote_host, remote_port).await
                        {
                            warn!(error = %err, %peer, "forwarded connection ended with error");
                        }
                    });
                }
                Err(err) => {
                    warn!(error = %err, "tunnel listener failed; stopping forwarder");
                    break;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    connections.shutdown().await;
}

async fn forward_connection(
    session: Arc<Handle<TunnelClient>>,
    mut socket: TcpStream,
    peer: SocketAddr,
    remote_host: String,
    remote_port: u16,
) -> Result<(), TunnelError> {
    let channel = session
        .channel_open_direct_tcpip(
            remote_host,
            u32::from(remote_port),
            peer.ip().to_string(),
            u32::from(peer.port()),
        )
        .await
        .map_err(|err| TunnelError::Forward(format!("open direct-tcpip channel: {err}")))?;

    let mut remote = channel.into_stream();
    tokio::io::copy_bidirectional(&mut socket, &mut remote)
        .await
        .map_err(|err| TunnelError::Forward(format!("copy: {err}")))?;
    Ok(())
}
