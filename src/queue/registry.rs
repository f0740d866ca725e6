//! The network registry that serves the queue set to every host in a run.
//!
//! Clients authenticate once per connection on a dedicated handshake stream,
//! then send one [`Request`] per bi-stream. The registry never interprets
//! queued messages; it only moves them between producers and consumers.

use std::{
    fs::File,
    io::{self, BufReader},
    net::{SocketAddr, UdpSocket},
    sync::Arc,
    time::Duration,
};

use quinn::{default_runtime, Connecting, Connection, VarInt};
use rustls::{Certificate as RustlsCert, PrivateKey};
use tracing::{debug, debug_span, info, warn, Instrument};

use super::{
    auth::{Challenge, SharedSecret},
    local::LocalQueue,
    wire::{
        FrameRecvStream, FrameSendStream, HandshakeMessage::{self, *}, Request, Response, ALPN,
        PROTOCOL_VERSION,
    },
    Parcel, QueueName,
};
use crate::{
    config::QueueConfig,
    error::{Error, Result},
};

/// Name baked into the generated self-signed certificate.
pub const SERVER_NAME: &str = "nbm-registry";

/// Application close code for a peer that failed the challenge.
pub const AUTH_FAILED: VarInt = VarInt::from_u32(1);

/// Upper bound on a single server-side blocking receive.
const MAX_WAIT: Duration = Duration::from_secs(60);

/// Shared transport settings for both ends of a registry connection.
pub(super) fn transport_config() -> Arc<quinn::TransportConfig> {
    let mut transport_config = quinn::TransportConfig::default();
    let bbr_config = quinn::congestion::BbrConfig::default();
    transport_config.congestion_controller_factory(Arc::new(bbr_config));
    transport_config.keep_alive_interval(Some(Duration::from_secs(5)));
    transport_config.max_idle_timeout(Some(VarInt::from_u32(60_000).into()));
    // every pending blocking get holds a stream open
    transport_config.max_concurrent_bidi_streams(VarInt::from_u32(1024));
    Arc::new(transport_config)
}

#[derive(Debug)]
struct Registry {
    work: LocalQueue<Parcel>,
    result: LocalQueue<Parcel>,
    directive: LocalQueue<Parcel>,
}

impl Registry {
    fn new() -> Self {
        Self {
            work: LocalQueue::new(),
            result: LocalQueue::new(),
            directive: LocalQueue::new(),
        }
    }

    fn queue(&self, name: QueueName) -> &LocalQueue<Parcel> {
        match name {
            QueueName::Work => &self.work,
            QueueName::Result => &self.result,
            QueueName::Directive => &self.directive,
        }
    }
}

/// A running registry. Dropping it does not stop the acceptor; call
/// [`RegistryServer::close`].
pub struct RegistryServer {
    ep: quinn::Endpoint,
}

impl RegistryServer {
    /// Binds the registry to `queue_ip:distributed_port` and starts accepting
    /// clients in the background.
    pub fn bind(config: &QueueConfig) -> Result<Self> {
        Self::bind_addr(config.socket_addr()?, config)
    }

    /// Like [`RegistryServer::bind`] but on an explicit address, e.g. port 0
    /// on loopback.
    pub fn bind_addr(addr: SocketAddr, config: &QueueConfig) -> Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        let runtime = default_runtime().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "no async runtime found")
        })?;

        let (cert, key) = match (&config.queue_cert, &config.queue_key) {
            (Some(cert), Some(key)) => load_pem(cert, key)?,
            _ => self_signed()?,
        };
        let mut server_tls = rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)?;
        server_tls.alpn_protocols = vec![ALPN.to_vec()];

        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(server_tls));
        server_config.transport_config(transport_config());

        let ep = quinn::Endpoint::new(
            quinn::EndpointConfig::default(),
            Some(server_config),
            socket,
            runtime,
        )?;
        let registry = Arc::new(Registry::new());
        let secret = SharedSecret::new(&config.auth_key);
        info!(addr = %ep.local_addr()?, "queue registry listening");
        tokio::spawn(Self::start_acceptor(ep.clone(), registry, secret));
        Ok(Self { ep })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.ep.local_addr()?)
    }

    /// Closes every client connection and stops accepting new ones.
    pub fn close(&self) {
        self.ep.close(VarInt::from_u32(0), b"registry shutting down");
    }

    /// Resolves once the endpoint has shut down.
    pub async fn wait_idle(&self) {
        self.ep.wait_idle().await;
    }

    async fn start_acceptor(ep: quinn::Endpoint, registry: Arc<Registry>, secret: SharedSecret) {
        while let Some(in_progress) = ep.accept().await {
            let registry = registry.clone();
            let secret = secret.clone();
            tokio::spawn(async move {
                let remote = in_progress.remote_address();
                if let Err(e) = serve_client(in_progress, registry, secret).await {
                    debug!(%remote, error = %e, "client session ended");
                }
            });
        }
    }
}

async fn serve_client(
    in_progress: Connecting,
    registry: Arc<Registry>,
    secret: SharedSecret,
) -> Result<()> {
    let remote = in_progress.remote_address();
    let span = debug_span!("registry", %remote);
    async move {
        let conn = in_progress.await?;
        debug!("connected via QUIC");
        authenticate(&conn, &secret).await?;
        debug!("client authenticated");
        serve_requests(conn, registry).await
    }
    .instrument(span)
    .await
}

/// One spawned task per request stream until the client goes away.
async fn serve_requests(conn: Connection, registry: Arc<Registry>) -> Result<()> {
    loop {
        let (tx, rx) = conn.accept_bi().await?;
        let registry = registry.clone();
        tokio::spawn(
            async move {
                let mut tx = FrameSendStream::new(tx);
                let mut rx = FrameRecvStream::new(rx);
                if let Err(e) = handle_request(&registry, &mut tx, &mut rx).await {
                    debug!(error = %e, "request failed");
                }
            }
            .in_current_span(),
        );
    }
}

/// Server side of the challenge exchange on the first bi-stream.
async fn authenticate(conn: &Connection, secret: &SharedSecret) -> Result<()> {
    let (tx, rx) = conn.accept_bi().await?;
    let mut tx = FrameSendStream::new(tx);
    let mut rx = FrameRecvStream::new(rx);

    match rx.receive::<HandshakeMessage>().await? {
        Hello { version } if version == PROTOCOL_VERSION => {}
        Hello { version } => {
            warn!(version, "client speaks a different protocol version");
            conn.close(VarInt::from_u32(2), b"protocol version mismatch");
            Err(Error::BadHandshake("protocol version mismatch"))?
        }
        _ => Err(Error::BadHandshake("expected Hello"))?,
    }

    let challenge = Challenge::new();
    tx.send(&AChallengeForYou(challenge.clone())).await?;

    let proof = match rx.receive::<HandshakeMessage>().await? {
        MyProof(proof) => proof,
        _ => Err(Error::BadHandshake("expected MyProof"))?,
    };
    if !secret.verify(&challenge, proof) {
        warn!("client failed the shared-secret challenge");
        conn.close(AUTH_FAILED, b"authentication failed");
        Err(Error::AuthenticationFailed)?
    }

    tx.send(&Ready).await?;
    tx.finish().await?;
    Ok(())
}

async fn handle_request(
    registry: &Registry,
    tx: &mut FrameSendStream,
    rx: &mut FrameRecvStream,
) -> Result<()> {
    let response = match rx.receive::<Request>().await? {
        Request::Put(parcel) => {
            registry.queue(parcel.queue()).put(parcel).await;
            Response::Done
        }
        Request::Get { queue, wait_ms } => {
            let wait = Duration::from_millis(wait_ms).min(MAX_WAIT);
            let item = tokio::select! {
                item = registry.queue(queue).get_timeout(wait) => item,
                // the client gave up on this receive
                _ = tx.stopped() => return Ok(()),
            };
            match item {
                Some(parcel) => {
                    let response = Response::Item(parcel);
                    if let Err(e) = tx.send(&response).await {
                        if let Response::Item(parcel) = response {
                            registry.queue(queue).put_front(parcel).await;
                        }
                        Err(e)?
                    }
                    tx.finish().await?;
                    return Ok(());
                }
                None => Response::Empty,
            }
        }
        Request::Size(queue) => Response::Size(registry.queue(queue).size().await as u64),
        Request::Purge(queue) => Response::Purged(registry.queue(queue).purge().await as u64),
    };
    tx.send(&response).await?;
    tx.finish().await?;
    Ok(())
}

fn self_signed() -> Result<(RustlsCert, PrivateKey)> {
    let cert = rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_string()])?;
    let key = PrivateKey(cert.serialize_private_key_der());
    Ok((RustlsCert(cert.serialize_der()?), key))
}

fn load_pem(cert: &std::path::Path, key: &std::path::Path) -> Result<(RustlsCert, PrivateKey)> {
    let mut certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert)?))?;
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(File::open(key)?))?;
    if certs.is_empty() {
        Err(Error::InvalidConfig(format!("no certificate in {}", cert.display())))?
    }
    if keys.len() != 1 {
        Err(Error::InvalidConfig(format!(
            "expected exactly one PKCS#8 key in {}",
            key.display()
        )))?
    }
    Ok((RustlsCert(certs.remove(0)), PrivateKey(keys.remove(0))))
}
