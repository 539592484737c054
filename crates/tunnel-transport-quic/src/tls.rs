//! TLS 材料：自签名身份、客户端与服务端 QUIC 加密配置。
//!
//! # 教案式说明
//! - **意图 (Why)**：隧道出口在没有外部 PKI 的环境中运行，启动时即时生成自签名证书；
//!   隧道入口默认不校验服务端身份，宿主也可以提供受信任证书以启用校验；
//! - **逻辑 (How)**：`rcgen` 生成证书与 PKCS#8 私钥，`rustls` 以 `ring` 后端、仅 TLS 1.3 构建配置，
//!   再通过 `quinn::crypto::rustls` 包装为 QUIC 配置；双方 ALPN 必须一致；
//! - **风险 (Trade-offs)**：跳过校验的客户端易受中间人攻击，只适用于受控实验网络。

use std::{fs, path::Path, sync::Arc};

use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use rustls::{
    DigitallySignedStruct, RootCertStore, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{CryptoProvider, ring},
};
use rustls_pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime, pem::PemObject,
};
use tracing::warn;

use crate::error::{self, StartError};

/// 服务端证书与私钥。
#[derive(Debug)]
pub struct Identity {
    certificate: CertificateDer<'static>,
    key: PrivatePkcs8KeyDer<'static>,
}

impl Identity {
    /// 为给定主机名生成自签名证书。
    pub fn self_signed(names: impl Into<Vec<String>>) -> Result<Self, StartError> {
        let certified = rcgen::generate_simple_self_signed(names).map_err(error::map_rcgen_error)?;
        Ok(Self {
            certificate: certified.cert.der().clone(),
            key: PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()),
        })
    }

    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.certificate
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

pub(crate) fn server_crypto(identity: &Identity, alpn: &str) -> Result<QuicServerConfig, StartError> {
    let mut crypto = rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(error::map_tls_error)?
        .with_no_client_auth()
        .with_single_cert(
            vec![identity.certificate.clone()],
            PrivateKeyDer::Pkcs8(identity.key.clone_key()),
        )
        .map_err(error::map_tls_error)?;
    crypto.alpn_protocols = vec![alpn.as_bytes().to_vec()];
    QuicServerConfig::try_from(crypto).map_err(|err| StartError::new(error::TLS, err))
}

pub(crate) fn client_crypto(
    trusted: Option<&[CertificateDer<'static>]>,
    alpn: &str,
) -> Result<QuicClientConfig, StartError> {
    let provider = provider();
    let builder = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(error::map_tls_error)?;
    let mut crypto = match trusted {
        Some(certificates) => {
            let mut roots = RootCertStore::empty();
            for certificate in certificates {
                roots
                    .add(certificate.clone())
                    .map_err(error::map_tls_error)?;
            }
            builder.with_root_certificates(roots).with_no_client_auth()
        }
        None => {
            warn!("no trusted certificate configured, server identity will not be verified");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
                .with_no_client_auth()
        }
    };
    crypto.alpn_protocols = vec![alpn.as_bytes().to_vec()];
    QuicClientConfig::try_from(crypto).map_err(|err| StartError::new(error::TLS, err))
}

/// 读取受信任证书，支持 PEM（可含多张）与单张 DER。
pub fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, StartError> {
    let raw = fs::read(path).map_err(|err| error::map_io_error(error::CREDENTIALS, err))?;
    if !raw.starts_with(b"-----BEGIN") {
        return Ok(vec![CertificateDer::from(raw)]);
    }
    let certificates = CertificateDer::pem_slice_iter(&raw)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| StartError::new(error::CREDENTIALS, err))?;
    if certificates.is_empty() {
        return Err(error::closed_error(
            error::CREDENTIALS,
            "no certificate found in PEM file",
        ));
    }
    Ok(certificates)
}

/// 接受任意服务端证书，但仍校验握手签名本身。
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
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
            &self.0.signature_verification_algorithms,
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
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_signed_identity_builds_both_sides() {
        let identity = Identity::self_signed(vec!["localhost".to_owned()]).expect("identity");
        assert!(!identity.certificate().is_empty());
        server_crypto(&identity, "quic-echo-example").expect("server crypto");
        client_crypto(None, "quic-echo-example").expect("unverified client");
        client_crypto(Some(&[identity.certificate().clone()]), "quic-echo-example")
            .expect("verified client");
    }

    #[test]
    fn der_and_missing_certificate_files() {
        let identity = Identity::self_signed(vec!["localhost".to_owned()]).expect("identity");
        let file = tempfile::NamedTempFile::new().expect("temp file");
        fs::write(file.path(), identity.certificate().as_ref()).expect("write");
        let loaded = load_certificates(file.path()).expect("load");
        assert_eq!(loaded, vec![identity.certificate().clone()]);

        let err = load_certificates(Path::new("/nonexistent/cert.der")).expect_err("missing");
        assert_eq!(err.code(), "tunnel.quic.credentials_failed");
    }
}
