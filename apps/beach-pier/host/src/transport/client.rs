//! Minimal client for the host's QUIC endpoint.
//!
//! The host presents a self-signed certificate, so there is no CA to check
//! against. Instead the client either pins the fingerprint it got from the
//! pairing payload, or on first use accepts whatever the host presents and
//! reports the fingerprint so the caller can pin it next time.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use beach_pier_core::{CoreError, NetworkMessage, ALPN_PROTOCOL};
use parking_lot::Mutex;
use quinn::crypto::rustls::QuicClientConfig;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, SignatureScheme};
use tracing::{debug, info};

use super::frame::{read_message, write_message};
use super::{transport_config, SERVER_NAME};
use crate::identity::fingerprint;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustPolicy {
    /// Only a certificate with this fingerprint is accepted.
    Pinned(String),
    /// Accept any certificate and record its fingerprint.
    FirstUse,
}

#[derive(Debug)]
struct FingerprintVerifier {
    policy: TrustPolicy,
    observed: Mutex<Option<String>>,
    provider: Arc<CryptoProvider>,
}

impl FingerprintVerifier {
    fn new(policy: TrustPolicy, provider: Arc<CryptoProvider>) -> Self {
        Self {
            policy,
            observed: Mutex::new(None),
            provider,
        }
    }

    fn observed(&self) -> Option<String> {
        self.observed.lock().clone()
    }
}

impl ServerCertVerifier for FingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let presented = fingerprint(end_entity.as_ref());
        *self.observed.lock() = Some(presented.clone());
        match &self.policy {
            TrustPolicy::Pinned(expected) if !expected.eq_ignore_ascii_case(&presented) => {
                debug!(expected = %expected, presented = %presented, "host fingerprint mismatch");
                Err(rustls::Error::InvalidCertificate(
                    CertificateError::ApplicationVerificationFailure,
                ))
            }
            _ => Ok(ServerCertVerified::assertion()),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
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
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
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

pub struct PierClient {
    endpoint: quinn::Endpoint,
    verifier: Arc<FingerprintVerifier>,
}

impl PierClient {
    /// Binds an ephemeral local endpoint of the same address family as `remote`.
    pub fn new(remote: SocketAddr, policy: TrustPolicy) -> Result<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let verifier = Arc::new(FingerprintVerifier::new(policy, provider.clone()));
        let mut tls = rustls::ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13])
            .context("configure tls protocol versions")?
            .dangerous()
            .with_custom_certificate_verifier(verifier.clone())
            .with_no_client_auth();
        tls.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

        let crypto = QuicClientConfig::try_from(tls).context("build quic client crypto")?;
        let mut config = quinn::ClientConfig::new(Arc::new(crypto));
        config.transport_config(Arc::new(transport_config()?));

        let local: SocketAddr = if remote.is_ipv6() {
            "[::]:0".parse()?
        } else {
            "0.0.0.0:0".parse()?
        };
        let mut endpoint = quinn::Endpoint::client(local).context("bind client endpoint")?;
        endpoint.set_default_client_config(config);
        Ok(Self { endpoint, verifier })
    }

    /// Fingerprint of the last certificate the host presented, accepted or not.
    pub fn observed_fingerprint(&self) -> Option<String> {
        self.verifier.observed()
    }

    pub async fn connect(&self, remote: SocketAddr) -> Result<PierConnection> {
        let connection = self
            .endpoint
            .connect(remote, SERVER_NAME)
            .context("start quic connection")?
            .await
            .with_context(|| format!("connect to {remote}"))?;
        let (send, recv) = connection.open_bi().await.context("open stream")?;
        let fingerprint = self.verifier.observed().unwrap_or_default();
        info!(remote = %remote, fingerprint = %fingerprint, "connected to host");
        Ok(PierConnection {
            connection,
            send,
            recv,
            fingerprint,
        })
    }

    pub async fn shutdown(&self) {
        self.endpoint
            .close(quinn::VarInt::from_u32(0), b"client done");
        self.endpoint.wait_idle().await;
    }
}

pub struct PierConnection {
    connection: quinn::Connection,
    send: quinn::SendStream,
    recv: quinn::RecvStream,
    fingerprint: String,
}

impl PierConnection {
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub async fn send(&mut self, message: &NetworkMessage) -> Result<(), CoreError> {
        write_message(&mut self.send, message).await
    }

    /// `Ok(None)` once the host finished its side of the stream.
    pub async fn recv(&mut self) -> Result<Option<NetworkMessage>, CoreError> {
        read_message(&mut self.recv).await
    }

    /// Resolves once the connection is gone, with the reason the host gave.
    pub async fn closed(&self) -> quinn::ConnectionError {
        self.connection.closed().await
    }

    pub fn close(mut self) {
        let _ = self.send.finish();
        self.connection
            .close(quinn::VarInt::from_u32(0), b"bye");
    }
}
