use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use rustls::{
    RootCertStore,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
};

/// User-facing TLS settings for the upstream connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsOptions {
    /// SNI and certificate name to present/expect. Usually the upstream host.
    pub server_name: String,
    /// Client certificate presented to the upstream (PEM). Requires `key_file`.
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    /// Extra trust roots (PEM). Replaces the bundled web PKI roots when set.
    pub ca_file: Option<PathBuf>,
    /// Accept any server certificate. Ignores `ca_file`.
    pub allow_invalid_cert: bool,
}

/// Resolved TLS client policy, ready to wrap upstream connections.
#[derive(Clone)]
pub struct TlsPolicy {
    server_name: ServerName<'static>,
    config: Arc<rustls::ClientConfig>,
}

impl std::fmt::Debug for TlsPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsPolicy")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

impl TlsPolicy {
    pub fn from_options(opts: &TlsOptions) -> anyhow::Result<Self> {
        let name = opts.server_name.trim();
        if name.is_empty() {
            anyhow::bail!("tls: empty server name");
        }
        let server_name = ServerName::try_from(name.to_string())
            .with_context(|| format!("tls: invalid server name {name:?}"))?;

        let provider = provider();
        let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .context("tls: protocol versions")?;

        let builder = if opts.allow_invalid_cert {
            builder
                .dangerous()
                .with_custom_certificate_verifier(SkipServerVerification::new(provider))
        } else {
            let roots = match &opts.ca_file {
                Some(path) => load_roots(path)?,
                None => RootCertStore {
                    roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
                },
            };
            builder.with_root_certificates(roots)
        };

        let config = match (&opts.cert_file, &opts.key_file) {
            (Some(cert), Some(key)) => {
                let certs = load_certs(cert)?;
                let key = load_key(key)?;
                builder
                    .with_client_auth_cert(certs, key)
                    .context("tls: client certificate")?
            }
            (None, None) => builder.with_no_client_auth(),
            _ => anyhow::bail!("tls: cert_file and key_file must be set together"),
        };

        Ok(Self {
            server_name,
            config: Arc::new(config),
        })
    }

    pub fn server_name(&self) -> &ServerName<'static> {
        &self.server_name
    }

    pub fn connector(&self) -> tokio_rustls::TlsConnector {
        tokio_rustls::TlsConnector::from(self.config.clone())
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let data = fs::read(path).with_context(|| format!("tls: read {}", path.display()))?;
    let mut rd = std::io::Cursor::new(&data);
    let certs = rustls_pemfile::certs(&mut rd)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("tls: parse {}", path.display()))?;
    if certs.is_empty() {
        anyhow::bail!("tls: no certificate found in {}", path.display());
    }
    Ok(certs)
}

fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let data = fs::read(path).with_context(|| format!("tls: read {}", path.display()))?;
    let mut rd = std::io::Cursor::new(&data);
    let key = rustls_pemfile::private_key(&mut rd)
        .with_context(|| format!("tls: parse {}", path.display()))?;
    let Some(k) = key else {
        anyhow::bail!("tls: no private key found in {}", path.display());
    };
    Ok(k)
}

fn load_roots(path: &Path) -> anyhow::Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    let (added, _ignored) = roots.add_parsable_certificates(load_certs(path)?);
    if added == 0 {
        anyhow::bail!(
            "tls: failed to append PEM encoded certificates from {}",
            path.display()
        );
    }
    Ok(roots)
}

/// Certificate verifier that treats any certificate as valid.
///
/// NOTE: vulnerable to MITM. Only for local services with self-signed certs.
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl SkipServerVerification {
    fn new(provider: Arc<CryptoProvider>) -> Arc<Self> {
        Arc::new(Self(provider))
    }
}

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
        dss: &rustls::DigitallySignedStruct,
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
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::{path::PathBuf, sync::Arc};

    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

    pub struct SelfSigned {
        pub cert_pem: String,
        pub key_pem: String,
        pub cert_der: CertificateDer<'static>,
        pub key_der: PrivateKeyDer<'static>,
    }

    pub fn self_signed(name: &str) -> SelfSigned {
        let rcgen::CertifiedKey { cert, signing_key } =
            rcgen::generate_simple_self_signed(vec![name.to_string()]).expect("rcgen");
        SelfSigned {
            cert_pem: cert.pem(),
            key_pem: signing_key.serialize_pem(),
            cert_der: cert.der().clone(),
            key_der: PrivateKeyDer::from(PrivatePkcs8KeyDer::from(signing_key.serialize_der())),
        }
    }

    pub fn acceptor(ss: &SelfSigned) -> tokio_rustls::TlsAcceptor {
        let cfg = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .expect("versions")
        .with_no_client_auth()
        .with_single_cert(vec![ss.cert_der.clone()], ss.key_der.clone_key())
        .expect("server config");
        tokio_rustls::TlsAcceptor::from(Arc::new(cfg))
    }

    pub fn temp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        p.push(format!(
            "tunnelfwd_test_{name}_{}_{}",
            std::process::id(),
            now
        ));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    fn opts(name: &str) -> TlsOptions {
        TlsOptions {
            server_name: name.into(),
            ..Default::default()
        }
    }

    #[test]
    fn default_policy_uses_web_roots() {
        let p = TlsPolicy::from_options(&opts("localhost")).expect("policy");
        assert_eq!(
            p.server_name(),
            &ServerName::try_from("localhost").expect("name")
        );
    }

    #[test]
    fn rejects_empty_server_name() {
        assert!(TlsPolicy::from_options(&opts("  ")).is_err());
    }

    #[test]
    fn cert_without_key_is_rejected() {
        let dir = temp_dir("cert_without_key");
        let ss = self_signed("localhost");
        let cert = dir.join("cert.pem");
        std::fs::write(&cert, &ss.cert_pem).expect("write");

        let mut o = opts("localhost");
        o.cert_file = Some(cert);
        let err = TlsPolicy::from_options(&o).unwrap_err();
        assert!(err.to_string().contains("must be set together"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn loads_client_identity_and_ca() {
        let dir = temp_dir("identity");
        let ss = self_signed("localhost");
        let cert = dir.join("cert.pem");
        let key = dir.join("key.pem");
        std::fs::write(&cert, &ss.cert_pem).expect("write");
        std::fs::write(&key, &ss.key_pem).expect("write");

        let mut o = opts("localhost");
        o.cert_file = Some(cert.clone());
        o.key_file = Some(key);
        o.ca_file = Some(cert);
        TlsPolicy::from_options(&o).expect("policy");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn ca_file_without_certificates_is_rejected() {
        let dir = temp_dir("empty_ca");
        let ca = dir.join("ca.pem");
        std::fs::write(&ca, "not a certificate\n").expect("write");

        let mut o = opts("localhost");
        o.ca_file = Some(ca);
        let err = TlsPolicy::from_options(&o).unwrap_err();
        assert!(format!("{err:#}").contains("no certificate found"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_ca_file_is_reported() {
        let mut o = opts("localhost");
        o.ca_file = Some(PathBuf::from("/nonexistent/tunnelfwd/ca.pem"));
        let err = TlsPolicy::from_options(&o).unwrap_err();
        assert!(format!("{err:#}").contains("tls: read"));
    }
}
