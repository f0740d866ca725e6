use std::{
    net::{SocketAddr, UdpSocket},
    sync::Arc,
    time::{Duration, SystemTime},
};

use quinn::{default_runtime, ConnectionError, ReadError, ReadExactError};
use rustls::{
    client::{ServerCertVerified, ServerCertVerifier},
    Certificate, ServerName,
};
use tracing::{debug, debug_span, warn, Instrument};

use super::{
    auth::SharedSecret,
    registry::{transport_config, AUTH_FAILED, SERVER_NAME},
    wire::{
        FrameRecvStream, FrameSendStream, HandshakeMessage::{self, *}, Request, Response, ALPN,
        PROTOCOL_VERSION,
    },
};
use crate::{
    config::QueueConfig,
    error::{Error, Result},
};

/// The registry's certificate is not checked: trust comes from the
/// shared-secret challenge that follows the TLS handshake.
struct SkipServerVerification;

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

/// An authenticated connection to the queue registry.
///
/// Can be cloned to obtain another handle to the same connection.
#[derive(Clone)]
pub struct RegistryClient {
    conn: quinn::Connection,
    // keeps the client socket alive as long as any handle exists
    _ep: quinn::Endpoint,
}

impl RegistryClient {
    pub async fn connect(config: &QueueConfig) -> Result<Self> {
        Self::connect_addr(config.socket_addr()?, &config.auth_key).await
    }

    /// Retries [`RegistryClient::connect`] until it succeeds or `attempts`
    /// are used up. Servants usually start before the registry is up.
    pub async fn connect_with_retry(
        config: &QueueConfig,
        attempts: u32,
        delay: Duration,
    ) -> Result<Self> {
        let mut attempt = 1;
        loop {
            match Self::connect(config).await {
                Ok(client) => return Ok(client),
                Err(e) if attempt < attempts && !matches!(e, Error::AuthenticationFailed) => {
                    warn!(attempt, error = %e, "queue registry not reachable yet");
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => Err(e)?,
            }
        }
    }

    pub async fn connect_addr(remote: SocketAddr, auth_key: &str) -> Result<Self> {
        let bind: SocketAddr = if remote.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind)?;
        let runtime = default_runtime().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "no async runtime found")
        })?;

        let mut client_tls = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
            .with_no_client_auth();
        client_tls.alpn_protocols = vec![ALPN.to_vec()];
        let mut client_config = quinn::ClientConfig::new(Arc::new(client_tls));
        client_config.transport_config(transport_config());

        let mut ep =
            quinn::Endpoint::new(quinn::EndpointConfig::default(), None, socket, runtime)?;
        ep.set_default_client_config(client_config);

        let secret = SharedSecret::new(auth_key);
        let span = debug_span!("registry_client", %remote);
        async move {
            debug!("establishing QUIC connection");
            let conn = ep.connect(remote, SERVER_NAME)?.await?;
            debug!("connected via QUIC");
            match handshake(&conn, &secret).await {
                Ok(()) => {}
                Err(Error::ReadExactError(ReadExactError::ReadError(ReadError::ConnectionLost(
                    ConnectionError::ApplicationClosed(close),
                )))) if close.error_code == AUTH_FAILED => Err(Error::AuthenticationFailed)?,
                Err(e) => Err(e)?,
            }
            debug!("handshake complete");
            Ok(Self { conn, _ep: ep })
        }
        .instrument(span)
        .await
    }

    /// Sends one request on a fresh stream and waits for its response.
    pub async fn request(&self, request: Request) -> Result<Response> {
        let (tx, rx) = self.conn.open_bi().await?;
        let mut tx = FrameSendStream::new(tx);
        let mut rx = FrameRecvStream::new(rx);
        tx.send(&request).await?;
        tx.finish().await?;
        rx.receive().await
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.conn.remote_address()
    }
}

/// Client side of the challenge exchange.
async fn handshake(conn: &quinn::Connection, secret: &SharedSecret) -> Result<()> {
    let (tx, rx) = conn.open_bi().await?;
    let mut tx = FrameSendStream::new(tx);
    let mut rx = FrameRecvStream::new(rx);

    tx.send(&Hello {
        version: PROTOCOL_VERSION,
    })
    .await?;
    let challenge = match rx.receive::<HandshakeMessage>().await? {
        AChallengeForYou(challenge) => challenge,
        _ => Err(Error::BadHandshake("expected AChallengeForYou"))?,
    };
    tx.send(&MyProof(secret.answer(&challenge))).await?;
    match rx.receive::<HandshakeMessage>().await? {
        Ready => Ok(()),
        _ => Err(Error::BadHandshake("expected Ready")),
    }
}
