use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use tlsgauge_tls::rsa::pkcs1::DecodeRsaPrivateKey;
use tlsgauge_tls::rsa::pkcs8::DecodePrivateKey;
use tlsgauge_tls::rsa::RsaPrivateKey;
use tlsgauge_tls::{CertifiedKey, ServerConfig, TlsAcceptor, TlsError};

mod http;

#[derive(Parser)]
#[command(name = "tlsgauge-server")]
#[command(about = "HTTPS endpoint that inspects and grades each client's TLS handshake")]
struct Cli {
    /// Address to serve HTTPS on
    #[arg(long, default_value = "127.0.0.1:8443")]
    addr: SocketAddr,

    /// File path to the PEM certificate chain to serve with
    #[arg(long, default_value = "./config/development_cert.pem")]
    cert: PathBuf,

    /// File path to the PEM-encoded RSA private key
    #[arg(long, default_value = "./config/development_key.pem")]
    key: PathBuf,

    /// Seconds to wait for in-flight connections when shutting down
    #[arg(long, default_value_t = 20)]
    shutdown_timeout: u64,

    /// Per-connection deadline in seconds for the whole request cycle
    #[arg(long, default_value_t = 30)]
    request_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let cli = Cli::parse();

    let certified_key = load_certified_key(&cli.cert, &cli.key)?;
    let config = Arc::new(ServerConfig::new(certified_key));
    let acceptor = TlsAcceptor::new(config);

    let listener = TcpListener::bind(cli.addr)
        .await
        .with_context(|| format!("unable to listen on {}", cli.addr))?;
    info!("serving https on {}", cli.addr);

    let (drain_tx, drain_rx) = watch::channel(false);
    let request_timeout = Duration::from_secs(cli.request_timeout);
    // The JoinSet is the connection registry: shutdown drains it, panicked
    // connection tasks are reaped like any other.
    let mut connections: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer)) => {
                        let acceptor = acceptor.clone();
                        let drain = drain_rx.clone();
                        connections.spawn(async move {
                            handle_connection(acceptor, socket, peer, drain, request_timeout).await;
                        });
                        // Reap whatever already finished so the set stays small.
                        while connections.try_join_next().is_some() {}
                    }
                    Err(err) => warn!("accept failed: {err}"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    drop(listener);
    let _ = drain_tx.send(true);
    info!(
        "shutdown requested, draining {} connection(s)",
        connections.len()
    );
    let drained = tokio::time::timeout(Duration::from_secs(cli.shutdown_timeout), async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            "drain deadline passed, force-closing {} connection(s)",
            connections.len()
        );
        connections.abort_all();
        while connections.join_next().await.is_some() {}
    }
    info!("bye");
    Ok(())
}

fn load_certified_key(cert_path: &Path, key_path: &Path) -> Result<CertifiedKey> {
    let cert_pem = std::fs::read(cert_path)
        .with_context(|| format!("unable to read certificate {}", cert_path.display()))?;
    let mut reader = std::io::BufReader::new(&cert_pem[..]);
    let certificate_chain: Vec<Vec<u8>> = rustls_pemfile::certs(&mut reader)
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("bad certificate PEM in {}", cert_path.display()))?
        .into_iter()
        .map(|der| der.as_ref().to_vec())
        .collect();
    if certificate_chain.is_empty() {
        bail!("no certificates found in {}", cert_path.display());
    }

    let key_pem = std::fs::read_to_string(key_path)
        .with_context(|| format!("unable to read key {}", key_path.display()))?;
    let private_key = RsaPrivateKey::from_pkcs8_pem(&key_pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&key_pem))
        .with_context(|| format!("{} is not an RSA private key", key_path.display()))?;

    Ok(CertifiedKey {
        certificate_chain,
        private_key,
    })
}

async fn handle_connection<IO>(
    acceptor: TlsAcceptor,
    socket: IO,
    peer: SocketAddr,
    drain: watch::Receiver<bool>,
    request_timeout: Duration,
) where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let mut conn = acceptor.accept(socket);

    let result = if *drain.borrow() {
        // Accepted after the shutdown signal won the select race.
        Err(TlsError::ShutdownInProgress)
    } else {
        match tokio::time::timeout(request_timeout, http::serve(&mut conn, peer)).await {
            Ok(result) => result,
            Err(_) => Err(TlsError::IoFailed(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "request deadline exceeded",
            ))),
        }
    };

    if let Err(err) = result {
        match &err {
            TlsError::HandshakeFailed(kind) => debug!("handshake with {peer} failed: {kind}"),
            TlsError::PeerClosed => debug!("{peer} closed the connection"),
            TlsError::ShutdownInProgress => debug!("{peer} refused during drain"),
            TlsError::IoFailed(io_err) => debug!("connection with {peer} errored: {io_err}"),
        }
        // Past the handshake there is HTTP framing to answer on, so emit a
        // 500 line; failures during the handshake are dropped without one.
        if conn.snapshot().is_some() {
            conn.write(http::error_500_response(0).as_bytes()).await.ok();
        }
    }
    conn.shutdown().await.ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_acceptor() -> TlsAcceptor {
        let private_key = RsaPrivateKey::new(&mut rand::rngs::OsRng, 1024).unwrap();
        TlsAcceptor::new(Arc::new(ServerConfig::new(CertifiedKey {
            // The client below skips certificate verification.
            certificate_chain: vec![vec![0x30, 0x82, 0x01, 0x00]],
            private_key,
        })))
    }

    #[derive(Debug)]
    struct NoVerifier;

    impl rustls::client::danger::ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &rustls::pki_types::CertificateDer<'_>,
            _intermediates: &[rustls::pki_types::CertificateDer<'_>],
            _server_name: &rustls::pki_types::ServerName<'_>,
            _ocsp_response: &[u8],
            _now: rustls::pki_types::UnixTime,
        ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
            Ok(rustls::client::danger::ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &rustls::pki_types::CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &rustls::pki_types::CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            vec![
                rustls::SignatureScheme::RSA_PKCS1_SHA256,
                rustls::SignatureScheme::RSA_PKCS1_SHA384,
            ]
        }
    }

    async fn connect(
        io: tokio::io::DuplexStream,
    ) -> tokio_rustls::client::TlsStream<tokio::io::DuplexStream> {
        let mut config = rustls::ClientConfig::builder()
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth();
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoVerifier));
        let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
        let name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
        connector.connect(name, io).await.expect("client handshake")
    }

    async fn read_to_end_lossy(
        tls: &mut tokio_rustls::client::TlsStream<tokio::io::DuplexStream>,
    ) -> String {
        let mut response = Vec::new();
        let mut chunk = [0u8; 512];
        loop {
            match tls.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => response.extend_from_slice(&chunk[..n]),
            }
        }
        String::from_utf8_lossy(&response).into_owned()
    }

    #[tokio::test]
    async fn stalled_request_past_the_handshake_gets_a_500() {
        let (client_io, server_io) = tokio::io::duplex(1 << 16);
        let (_drain_tx, drain_rx) = watch::channel(false);
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let server = tokio::spawn(handle_connection(
            test_acceptor(),
            server_io,
            peer,
            drain_rx,
            Duration::from_millis(500),
        ));

        let mut tls = connect(client_io).await;
        // Half a request head, then silence until the deadline fires.
        tls.write_all(b"GET / HT").await.unwrap();
        tls.flush().await.unwrap();

        let response = read_to_end_lossy(&mut tls).await;
        assert!(
            response.starts_with("HTTP/1.0 500 Internal Server Error\r\n"),
            "got: {response:?}"
        );
        assert!(response.ends_with("500 Internal Server Error\n"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn aborted_connection_before_the_handshake_stays_silent() {
        let (client_io, server_io) = tokio::io::duplex(1 << 16);
        let (_drain_tx, drain_rx) = watch::channel(false);
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let server = tokio::spawn(handle_connection(
            test_acceptor(),
            server_io,
            peer,
            drain_rx,
            Duration::from_secs(5),
        ));

        // Not even a ClientHello: the task must drop the connection without
        // writing any HTTP framing.
        drop(client_io);
        server.await.unwrap();
    }
}
