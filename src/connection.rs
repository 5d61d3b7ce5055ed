//! Internal module for establishing transport connections to IMAP servers.
//!
//! Supports TLS (optionally without certificate verification) and plain TCP.

use crate::error::{Error, Result};
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, ServerName};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument, warn};
use webpki_roots::TLS_SERVER_ROOTS;

/// Byte stream an IMAP session can run over.
pub(crate) trait MailStream: AsyncRead + AsyncWrite + Unpin + Send + Debug {}

impl<T> MailStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + Debug {}

/// A TLS or plain TCP stream, used for IMAP communication.
pub(crate) type BoxedStream = Box<dyn MailStream>;

/// How the transport should be secured.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TransportSecurity {
    pub tls: bool,
    pub accept_invalid_certs: bool,
}

/// Establishes a transport connection to an IMAP server.
#[instrument(
    name = "connection::establish",
    skip_all,
    fields(
        imap_host = %imap_host,
        target_addr = %target_addr,
        tls = security.tls
    )
)]
pub(crate) async fn establish_connection(
    imap_host: &str,
    target_addr: &str,
    security: TransportSecurity,
) -> Result<BoxedStream> {
    if !security.tls {
        let tcp_stream = connect_tcp(target_addr).await?;
        return Ok(Box::new(tcp_stream));
    }

    let connector = create_tls_connector(security.accept_invalid_certs);
    let server_name = parse_server_name(imap_host)?;
    let tcp_stream = connect_tcp(target_addr).await?;

    debug!("Performing TLS handshake");

    let tls_stream = connector
        .connect(server_name, tcp_stream)
        .await
        .map_err(|source| Error::TlsConnect {
            target: target_addr.to_string(),
            source,
        })?;

    Ok(Box::new(tls_stream))
}

/// Creates a TLS connector with the webpki root certificates, or one that
/// accepts any certificate.
fn create_tls_connector(accept_invalid_certs: bool) -> TlsConnector {
    let builder = ClientConfig::builder().with_safe_defaults();

    let tls_config = if accept_invalid_certs {
        warn!("TLS certificate verification is disabled for the mailbox connection");
        builder
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
            .with_no_client_auth()
    } else {
        let mut root_cert_store = rustls::RootCertStore::empty();
        root_cert_store.add_trust_anchors(TLS_SERVER_ROOTS.iter().map(|ta| {
            rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));
        builder
            .with_root_certificates(root_cert_store)
            .with_no_client_auth()
    };

    TlsConnector::from(Arc::new(tls_config))
}

/// Certificate verifier for servers with self-signed certificates.
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

/// Parses server name for TLS SNI.
fn parse_server_name(host: &str) -> Result<ServerName> {
    ServerName::try_from(host).map_err(|source| Error::InvalidDnsName {
        host: host.to_string(),
        source,
    })
}

/// Direct TCP connection.
#[instrument(name = "connection::tcp_connect", skip_all)]
async fn connect_tcp(target_addr: &str) -> Result<TcpStream> {
    debug!(target = %target_addr, "Establishing TCP connection");

    TcpStream::connect(target_addr)
        .await
        .map_err(|source| Error::TcpConnect {
            target: target_addr.to_string(),
            source,
        })
}
