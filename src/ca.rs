use std::{
    collections::HashMap,
    fs,
    net::IpAddr,
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Context as _;
use rand::Rng as _;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SanType, SerialNumber,
};
use rcgen::string::Ia5String;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use time::{Duration as CertDuration, OffsetDateTime};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use x509_parser::prelude::{FromDer as _, GeneralName, X509Certificate};

use crate::archive::{Archive, DEFAULT_NEGOTIATED_PROTOCOL, WritableArchive};

pub const H2: &str = "h2";

const LEAF_VALIDITY_DAYS: i64 = 39 * 30;
const LEAF_SERIAL_LEN: usize = 20;
const ORIGIN_DIAL_TIMEOUT: Duration = Duration::from_secs(30);
const ORIGIN_TLS_PORT: u16 = 443;

/// Root CA material plus the per-host leaf state both proxy modes need.
/// Every leaf this mint produces reuses the root key pair, so the archive
/// only ever has to carry certificates, never private keys.
pub struct CertificateMint {
    root_der: CertificateDer<'static>,
    root_key_der: PrivateKeyDer<'static>,
    root_key: KeyPair,
    issuer: Issuer<'static, KeyPair>,
    dummy_cache: Mutex<HashMap<String, CertificateDer<'static>>>,
}

impl CertificateMint {
    pub fn load(cert_path: &Path, key_path: &Path) -> anyhow::Result<Self> {
        let cert_pem = fs::read_to_string(cert_path)
            .with_context(|| format!("read CA certificate {}", cert_path.display()))?;
        let key_pem = fs::read_to_string(key_path)
            .with_context(|| format!("read CA private key {}", key_path.display()))?;

        let root_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .transpose()
            .with_context(|| format!("parse CA certificate {}", cert_path.display()))?
            .ok_or_else(|| {
                anyhow::anyhow!("no CERTIFICATE block in {}", cert_path.display())
            })?;
        let root_key_der = rustls_pemfile::private_key(&mut key_pem.as_bytes())
            .with_context(|| format!("parse CA private key {}", key_path.display()))?
            .ok_or_else(|| anyhow::anyhow!("no private key block in {}", key_path.display()))?;

        let root_key =
            KeyPair::from_pem(&key_pem).context("parse CA private key for leaf issuance")?;
        let issuer_key =
            KeyPair::from_pem(&key_pem).context("parse CA private key for leaf issuance")?;
        let issuer = Issuer::from_ca_cert_pem(&cert_pem, issuer_key)
            .context("parse CA certificate for leaf issuance")?;

        Ok(Self {
            root_der,
            root_key_der,
            root_key,
            issuer,
            dummy_cache: Mutex::new(HashMap::new()),
        })
    }

    /// TLS configuration for one replay-mode connection, chosen by SNI:
    /// archived leaves are served verbatim over the root key, unknown hosts
    /// get a cached self-signed dummy, and a hello without SNI is answered
    /// with the root certificate itself.
    pub fn replay_server_config(
        &self,
        sni: Option<&str>,
        archive: &Archive,
    ) -> anyhow::Result<Arc<rustls::ServerConfig>> {
        let (chain, negotiated) = match sni {
            None => (vec![self.root_der.clone()], DEFAULT_NEGOTIATED_PROTOCOL),
            Some(host) => match archive.find_host_tls(host) {
                Some((der, alpn)) => {
                    (vec![CertificateDer::from(der.to_vec())], alpn)
                }
                None => {
                    tracing::debug!(host = %host, "no archived certificate; minting dummy");
                    (vec![self.dummy_for_host(host)?], DEFAULT_NEGOTIATED_PROTOCOL)
                }
            },
        };
        self.server_config(chain, negotiated)
    }

    /// TLS configuration for one record-mode connection. On the first hello
    /// for a host the origin's leaf is harvested over a live TLS dial,
    /// re-minted under the root, and persisted with the negotiated ALPN.
    pub async fn record_server_config(
        &self,
        sni: Option<&str>,
        archive: &WritableArchive,
    ) -> anyhow::Result<Arc<rustls::ServerConfig>> {
        let Some(host) = sni else {
            return self.server_config(vec![self.root_der.clone()], DEFAULT_NEGOTIATED_PROTOCOL);
        };

        if let Some((der, alpn)) = archive.find_host_tls(host) {
            return self.server_config(vec![CertificateDer::from(der)], &alpn);
        }

        let (der, alpn) = self.fetch_and_mint_origin_leaf(host).await?;
        archive.record_tls(host, der.clone(), &alpn);
        self.server_config(vec![CertificateDer::from(der)], &alpn)
    }

    fn server_config(
        &self,
        chain: Vec<CertificateDer<'static>>,
        negotiated: &str,
    ) -> anyhow::Result<Arc<rustls::ServerConfig>> {
        let mut config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, self.root_key_der.clone_key())
            .map_err(|err| anyhow::anyhow!("build TLS server certificate: {err}"))?;
        config.alpn_protocols = alpn_protocols(negotiated);
        Ok(Arc::new(config))
    }

    /// Self-signed placeholder for a host the archive has never seen.
    /// Write-once per host; later hellos reuse the cached certificate.
    fn dummy_for_host(&self, host: &str) -> anyhow::Result<CertificateDer<'static>> {
        let mut cache = self
            .dummy_cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = cache.get(host) {
            return Ok(existing.clone());
        }

        let mut params = CertificateParams::new(Vec::<String>::new())
            .with_context(|| format!("initialize dummy certificate parameters for `{host}`"))?;
        params.subject_alt_names.push(host_san(host)?);
        params
            .distinguished_name
            .push(DnType::CommonName, host);
        params.serial_number = Some(random_serial());
        let cert = params
            .self_signed(&self.root_key)
            .with_context(|| format!("self-sign dummy certificate for `{host}`"))?;

        let der = cert.der().clone();
        cache.insert(host.to_owned(), der.clone());
        Ok(der)
    }

    async fn fetch_and_mint_origin_leaf(&self, host: &str) -> anyhow::Result<(Vec<u8>, String)> {
        let stream = tokio::time::timeout(
            ORIGIN_DIAL_TIMEOUT,
            TcpStream::connect((host, ORIGIN_TLS_PORT)),
        )
        .await
        .map_err(|_| anyhow::anyhow!("dial {host}:{ORIGIN_TLS_PORT}: connect timed out"))?
        .with_context(|| format!("dial {host}:{ORIGIN_TLS_PORT}"))?;
        let keepalive = socket2::TcpKeepalive::new().with_time(ORIGIN_DIAL_TIMEOUT);
        socket2::SockRef::from(&stream)
            .set_tcp_keepalive(&keepalive)
            .with_context(|| format!("enable keep-alive toward {host}"))?;

        let mut client_config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
            .with_no_client_auth();
        client_config.alpn_protocols = vec![H2.as_bytes().to_vec(), b"http/1.1".to_vec()];

        let server_name = ServerName::try_from(host.to_owned())
            .with_context(|| format!("`{host}` is not a valid TLS server name"))?;
        let connector = TlsConnector::from(Arc::new(client_config));
        let tls = connector
            .connect(server_name, stream)
            .await
            .with_context(|| format!("TLS handshake with {host}:{ORIGIN_TLS_PORT}"))?;

        let (_, session) = tls.get_ref();
        let origin_leaf = session
            .peer_certificates()
            .and_then(|certs| certs.first())
            .ok_or_else(|| anyhow::anyhow!("{host} presented no certificate"))?;
        let negotiated = session
            .alpn_protocol()
            .map(|proto| String::from_utf8_lossy(proto).into_owned())
            .unwrap_or_else(|| DEFAULT_NEGOTIATED_PROTOCOL.to_owned());

        let minted = self.mint_leaf_from_origin(host, origin_leaf)?;
        tracing::info!(host = %host, alpn = %negotiated, "minted leaf from origin certificate");
        Ok((minted, negotiated))
    }

    /// Re-issues an origin leaf under the root: the origin's subject
    /// alternative names are carried over, the subject is forced to the
    /// requested host, and the validity window and serial are freshly chosen.
    fn mint_leaf_from_origin(
        &self,
        host: &str,
        origin_der: &CertificateDer<'_>,
    ) -> anyhow::Result<Vec<u8>> {
        let (_, origin) = X509Certificate::from_der(origin_der)
            .map_err(|err| anyhow::anyhow!("parse origin certificate for `{host}`: {err}"))?;

        let mut params = CertificateParams::new(Vec::<String>::new())
            .with_context(|| format!("initialize leaf certificate parameters for `{host}`"))?;
        params.subject_alt_names.push(host_san(host)?);
        if let Ok(Some(san)) = origin.subject_alternative_name() {
            for name in &san.value.general_names {
                match name {
                    GeneralName::DNSName(dns) if *dns != host => {
                        if let Ok(dns) = Ia5String::try_from(*dns) {
                            params.subject_alt_names.push(SanType::DnsName(dns));
                        }
                    }
                    GeneralName::IPAddress(raw) => {
                        if let Some(ip) = ip_from_octets(raw) {
                            params.subject_alt_names.push(SanType::IpAddress(ip));
                        }
                    }
                    _ => {}
                }
            }
        }

        params.distinguished_name.push(DnType::CommonName, host);
        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + CertDuration::days(LEAF_VALIDITY_DAYS);
        params.serial_number = Some(random_serial());
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.is_ca = IsCa::NoCa;

        let cert = params
            .signed_by(&self.root_key, &self.issuer)
            .with_context(|| format!("sign leaf certificate for `{host}`"))?;
        Ok(cert.der().to_vec())
    }
}

/// ALPN list to advertise for a host's recorded protocol.
pub fn alpn_protocols(negotiated: &str) -> Vec<Vec<u8>> {
    if negotiated == H2 {
        vec![H2.as_bytes().to_vec(), b"http/1.1".to_vec()]
    } else {
        vec![b"http/1.1".to_vec()]
    }
}

/// Writes a fresh self-signed root CA to `cert_path`/`key_path`. Browsers
/// under test are pointed at this certificate; the proxy signs every leaf
/// with its key.
pub fn generate_root_ca(cert_path: &Path, key_path: &Path) -> anyhow::Result<()> {
    let mut params =
        CertificateParams::new(Vec::<String>::new()).context("initialize root CA parameters")?;
    params
        .distinguished_name
        .push(DnType::CommonName, "web page replay root CA");
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];

    let key_pair = KeyPair::generate().context("generate root CA private key")?;
    let cert = params
        .self_signed(&key_pair)
        .context("self-sign root CA certificate")?;

    fs::write(cert_path, cert.pem())
        .with_context(|| format!("write CA certificate {}", cert_path.display()))?;
    fs::write(key_path, key_pair.serialize_pem())
        .with_context(|| format!("write CA private key {}", key_path.display()))?;
    Ok(())
}

pub fn ensure_rustls_crypto_provider() -> anyhow::Result<()> {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return Ok(());
    }

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err(anyhow::anyhow!("install rustls ring crypto provider"));
    }
    Ok(())
}

fn host_san(host: &str) -> anyhow::Result<SanType> {
    match host.parse::<IpAddr>() {
        Ok(ip) => Ok(SanType::IpAddress(ip)),
        Err(_) => Ia5String::try_from(host)
            .map(SanType::DnsName)
            .map_err(|err| anyhow::anyhow!("`{host}` is not usable as a DNS SAN: {err}")),
    }
}

fn random_serial() -> SerialNumber {
    let mut serial = [0u8; LEAF_SERIAL_LEN];
    rand::thread_rng().fill(&mut serial[..]);
    SerialNumber::from_slice(&serial)
}

fn ip_from_octets(raw: &[u8]) -> Option<IpAddr> {
    match raw.len() {
        4 => {
            let octets: [u8; 4] = raw.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        16 => {
            let octets: [u8; 16] = raw.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}

/// Record mode must be able to harvest a leaf from any origin, including
/// ones whose chain the local trust store cannot build; the harvested leaf
/// is re-signed under the replay root before a client ever sees it.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
