//! WebSocket transport and connection multiplexer
//!
//! [`WebSocketDialer`] opens the coordinator tunnel endpoint and, once the
//! upgrade succeeds, hands back a future that multiplexes coordinator-issued
//! connections over the socket until it closes. Each Connect frame is checked
//! against the session's [`DialFilter`]; allowed dials get a TCP connection
//! whose bytes are pumped both ways as Data frames.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::dial::{DialDecision, DialFilter};
use super::protocol::{Frame, MessageType, EOF_MESSAGE};
use super::{DialRequest, SessionFuture, TunnelDialer};
use crate::config::AgentConfig;
use crate::{Error, Result};

/// Upper bound on the WebSocket handshake
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on dialling a tunnelled destination
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

const READ_BUFFER_SIZE: usize = 32 * 1024;

/// Data frames queued for one connection before it is closed as stalled
pub const CONN_BUFFER_FRAMES: usize = 64;

/// Accepts any coordinator certificate while still checking handshake
/// signatures
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Build the rustls client config used for `wss://` tunnels
pub fn tls_config(config: &AgentConfig) -> Result<rustls::ClientConfig> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::config(format!("TLS setup failed: {}", e)))?;

    if config.insecure_skip_tls_verify {
        return Ok(builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }))
            .with_no_client_auth());
    }

    let mut roots = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    if let Some(path) = &config.coordinator_ca_path {
        let pem = std::fs::read(path)
            .map_err(|e| Error::config(format!("failed to read {}: {}", path.display(), e)))?;
        for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
            let cert = cert
                .map_err(|e| Error::config(format!("invalid PEM in {}: {}", path.display(), e)))?;
            roots
                .add(cert)
                .map_err(|e| Error::config(format!("invalid CA in {}: {}", path.display(), e)))?;
        }
    }

    Ok(builder
        .with_root_certificates(roots)
        .with_no_client_auth())
}

/// [`TunnelDialer`] over tokio-tungstenite
pub struct WebSocketDialer {
    tls: Arc<rustls::ClientConfig>,
}

impl WebSocketDialer {
    /// Build a dialer from the agent configuration
    pub fn new(config: &AgentConfig) -> Result<Self> {
        Ok(Self {
            tls: Arc::new(tls_config(config)?),
        })
    }
}

fn handshake_error(cluster_id: &str, err: tokio_tungstenite::tungstenite::Error) -> Error {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Http(response)
            if matches!(
                response.status(),
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
            ) =>
        {
            Error::tunnel_auth(
                cluster_id,
                format!("coordinator rejected credentials ({})", response.status()),
            )
        }
        WsError::Http(response) => Error::tunnel_transport(
            cluster_id,
            format!("handshake returned {}", response.status()),
        ),
        other => Error::tunnel_transport(cluster_id, other.to_string()),
    }
}

#[async_trait]
impl TunnelDialer for WebSocketDialer {
    async fn connect(&self, request: DialRequest) -> Result<SessionFuture> {
        let cluster_id = request.cluster_id.clone();
        let mut ws_request = request
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::tunnel_transport(&cluster_id, e.to_string()))?;

        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::tunnel_auth(&cluster_id, format!("bad header name: {}", e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::tunnel_auth(&cluster_id, format!("bad header value: {}", e)))?;
            ws_request.headers_mut().insert(name, value);
        }

        let connector = request
            .url
            .starts_with("wss://")
            .then(|| Connector::Rustls(self.tls.clone()));

        let handshake = tokio::time::timeout(
            CONNECT_TIMEOUT,
            tokio_tungstenite::connect_async_tls_with_config(ws_request, None, false, connector),
        );
        let (stream, response) = tokio::select! {
            _ = request.cancel.cancelled() => return Err(Error::cancelled(&cluster_id)),
            result = handshake => match result {
                Ok(Ok(connected)) => connected,
                Ok(Err(e)) => return Err(handshake_error(&cluster_id, e)),
                Err(_) => return Err(Error::tunnel_transport(&cluster_id, "handshake timed out")),
            },
        };

        debug!(
            cluster_id = %cluster_id,
            role = %request.role,
            status = %response.status(),
            "Tunnel handshake complete"
        );

        Ok(Box::pin(run_multiplexer(
            stream,
            cluster_id,
            request.filter,
            request.cancel,
        )))
    }
}

/// Bytes headed to one tunnelled connection, plus its read gate
struct Conn {
    data: mpsc::Sender<Vec<u8>>,
    paused: watch::Sender<bool>,
}

/// Connections open over one tunnel session
struct Multiplexer {
    cluster_id: String,
    filter: DialFilter,
    next_id: AtomicI64,
    conns: DashMap<i64, Conn>,
    outbound: mpsc::UnboundedSender<Frame>,
}

impl Multiplexer {
    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn send(&self, frame: Frame) {
        // Receiver only goes away when the session is ending
        let _ = self.outbound.send(frame);
    }

    fn close_with_error(&self, conn_id: i64, message: &str) {
        self.conns.remove(&conn_id);
        self.send(Frame::error(self.next_id(), conn_id, message));
    }

    fn handle(self: &Arc<Self>, data: &[u8], session: &CancellationToken) {
        let frame = match Frame::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(cluster_id = %self.cluster_id, error = %e, "Dropping undecodable frame");
                return;
            }
        };

        match frame.kind {
            MessageType::Connect => self.open(frame, session),
            MessageType::Data => {
                let sent = match self.conns.get(&frame.conn_id) {
                    Some(conn) => conn.data.try_send(frame.payload),
                    None => {
                        self.close_with_error(frame.conn_id, "unknown connection");
                        return;
                    }
                };
                match sent {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(
                            cluster_id = %self.cluster_id,
                            conn_id = frame.conn_id,
                            "Destination is not draining, closing connection"
                        );
                        self.close_with_error(frame.conn_id, "connection buffer full");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        self.close_with_error(frame.conn_id, "unknown connection");
                    }
                }
            }
            MessageType::Pause | MessageType::Resume => {
                let paused = frame.kind == MessageType::Pause;
                if let Some(conn) = self.conns.get(&frame.conn_id) {
                    conn.paused.send_replace(paused);
                }
            }
            MessageType::Error => {
                debug!(
                    cluster_id = %self.cluster_id,
                    conn_id = frame.conn_id,
                    reason = %frame.error_message(),
                    "Coordinator closed connection"
                );
                self.conns.remove(&frame.conn_id);
            }
            other => {
                debug!(cluster_id = %self.cluster_id, kind = ?other, "Ignoring control frame");
            }
        }
    }

    fn open(self: &Arc<Self>, frame: Frame, session: &CancellationToken) {
        let decision = self.filter.check(&frame.proto, &frame.address);
        let target = match &decision {
            DialDecision::Deny => {
                warn!(
                    cluster_id = %self.cluster_id,
                    proto = %frame.proto,
                    address = %frame.address,
                    "Refusing dial outside allow-list"
                );
                self.send(Frame::error(
                    self.next_id(),
                    frame.conn_id,
                    &format!("connect to {}/{} not allowed", frame.proto, frame.address),
                ));
                return;
            }
            DialDecision::Rewrite { from, to } => {
                debug!(cluster_id = %self.cluster_id, from = %from, to = %to, "Rewriting probe dial");
                to.clone()
            }
            DialDecision::Allow(address) => address.clone(),
        };

        let (data, inbound) = mpsc::channel(CONN_BUFFER_FRAMES);
        let (paused, gate) = watch::channel(false);
        self.conns.insert(frame.conn_id, Conn { data, paused });

        let mux = self.clone();
        let token = session.child_token();
        tokio::spawn(async move { mux.pump(frame.conn_id, target, inbound, gate, token).await });
    }

    async fn pump(
        self: Arc<Self>,
        conn_id: i64,
        target: String,
        mut inbound: mpsc::Receiver<Vec<u8>>,
        mut gate: watch::Receiver<bool>,
        token: CancellationToken,
    ) {
        let stream = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&target)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!(cluster_id = %self.cluster_id, target = %target, error = %e, "Dial failed");
                self.close_with_error(conn_id, &e.to_string());
                return;
            }
            Err(_) => {
                self.close_with_error(conn_id, "dial timed out");
                return;
            }
        };
        let (mut reader, mut writer) = stream.into_split();

        let upstream = async {
            let mut buf = vec![0u8; READ_BUFFER_SIZE];
            loop {
                if gate.wait_for(|paused| !*paused).await.is_err() {
                    return EOF_MESSAGE.to_string();
                }
                let read = tokio::select! {
                    biased;
                    // Re-check the gate; an interrupted read loses no bytes
                    _ = gate.changed() => continue,
                    read = reader.read(&mut buf) => read,
                };
                match read {
                    Ok(0) => return EOF_MESSAGE.to_string(),
                    Ok(n) => self.send(Frame::data(self.next_id(), conn_id, buf[..n].to_vec())),
                    Err(e) => return e.to_string(),
                }
            }
        };

        let downstream = async {
            while let Some(bytes) = inbound.recv().await {
                if writer.write_all(&bytes).await.is_err() {
                    break;
                }
            }
            let _ = writer.shutdown().await;
        };

        tokio::select! {
            _ = token.cancelled() => {
                self.conns.remove(&conn_id);
            }
            reason = upstream => self.close_with_error(conn_id, &reason),
            _ = downstream => {
                self.conns.remove(&conn_id);
            }
        }
    }
}

/// Drive one tunnel session until it closes or `cancel` fires
///
/// Returns `Ok(())` only on cancellation; any other end of the session is a
/// transport error that feeds the reconnect loop.
pub async fn run_multiplexer<S>(
    ws: WebSocketStream<S>,
    cluster_id: String,
    filter: DialFilter,
    cancel: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (outbound, mut frames) = mpsc::unbounded_channel::<Frame>();
    let mux = Arc::new(Multiplexer {
        cluster_id: cluster_id.clone(),
        filter,
        next_id: AtomicI64::new(1),
        conns: DashMap::new(),
        outbound,
    });
    let session = cancel.child_token();

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break Ok(());
            }
            Some(frame) = frames.recv() => {
                if let Err(e) = sink.send(Message::Binary(frame.encode().into())).await {
                    break Err(Error::tunnel_transport(&cluster_id, e.to_string()));
                }
            }
            message = stream.next() => match message {
                Some(Ok(Message::Binary(data))) => mux.handle(&data, &session),
                Some(Ok(Message::Close(reason))) => {
                    info!(cluster_id = %cluster_id, reason = ?reason, "Coordinator closed tunnel");
                    break Err(Error::tunnel_transport(&cluster_id, "closed by coordinator"));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(Error::tunnel_transport(&cluster_id, e.to_string())),
                None => break Err(Error::tunnel_transport(&cluster_id, "stream ended")),
            },
        }
    };

    session.cancel();
    mux.conns.clear();
    result
}
