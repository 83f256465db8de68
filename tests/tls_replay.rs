use std::{io::ErrorKind, sync::Arc};

use bytes::Bytes;
use hyper::{Method, Request, Response, StatusCode, header};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    net::TcpStream,
};
use tokio_rustls::TlsConnector;
use webpagereplay::{
    archive::{Archive, WritableArchive},
    ca,
    config::Config,
    proxy::{self, SessionMode},
};

/// The tests only assert which certificate the proxy presents; chain
/// building is out of scope, so verification is disabled client-side.
#[derive(Debug)]
struct NoVerify;

impl rustls::client::danger::ServerCertVerifier for NoVerify {
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

struct TlsExchange {
    peer_cert: Vec<u8>,
    response: Vec<u8>,
}

async fn tls_get(
    addr: std::net::SocketAddr,
    sni: &str,
    host_header: &str,
    path: &str,
) -> TlsExchange {
    ca::ensure_rustls_crypto_provider().unwrap();
    let tcp = TcpStream::connect(addr).await.unwrap();
    let client_config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerify))
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(client_config));
    let server_name = ServerName::try_from(sni.to_owned()).unwrap();
    let mut tls = connector.connect(server_name, tcp).await.unwrap();

    let peer_cert = tls
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|cert| cert.as_ref().to_vec())
        .expect("server should present a certificate");

    let request =
        format!("GET {path} HTTP/1.1\r\nHost: {host_header}\r\nConnection: close\r\n\r\n");
    tls.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    match tls.read_to_end(&mut response).await {
        Ok(_) => {}
        // Acceptable: the peer may drop without close_notify after the
        // Connection: close response is fully written.
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => {}
        Err(err) => panic!("read TLS response: {err}"),
    }

    TlsExchange {
        peer_cert,
        response,
    }
}

fn tls_config(dir: &std::path::Path, https_port: bool) -> Config {
    let cert_path = dir.join("ca-cert.pem");
    let key_path = dir.join("ca-key.pem");
    ca::generate_root_ca(&cert_path, &key_path).unwrap();
    Config {
        host: "127.0.0.1".parse().unwrap(),
        http_port: None,
        https_port: https_port.then_some(0),
        https_to_http_port: (!https_port).then_some(0),
        https_cert_file: Some(cert_path),
        https_key_file: Some(key_path),
        inject_scripts: Vec::new(),
        rules_file: None,
    }
}

/// Seeds an archive with one page for `host` plus a recorded leaf
/// certificate, returning the leaf's DER bytes.
fn archived_page(archive_path: &std::path::Path, scheme: &str, host: &str) -> Vec<u8> {
    let writable = WritableArchive::create(archive_path).unwrap();
    let req = Request::builder()
        .method(Method::GET)
        .uri(format!("{scheme}://{host}/index.html"))
        .header(header::HOST, host)
        .body(Bytes::new())
        .unwrap();
    let resp = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Bytes::from_static(b"replayed over tls"))
        .unwrap();
    writable.record_request(scheme, &req, &resp).unwrap();

    let leaf_key = rcgen::KeyPair::generate().unwrap();
    let leaf = rcgen::CertificateParams::new(vec![host.to_owned()])
        .unwrap()
        .self_signed(&leaf_key)
        .unwrap();
    let der = leaf.der().to_vec();
    writable.record_tls(host, der.clone(), "http/1.1");
    writable.close().unwrap();
    der
}

#[tokio::test]
async fn https_listener_serves_archived_leaf_for_known_sni() {
    let dir = tempfile::tempdir().unwrap();
    let archive_path = dir.path().join("tls.wprgo");
    let archived_der = archived_page(&archive_path, "https", "example.com");

    let config = tls_config(dir.path(), true);
    let archive = Arc::new(Archive::open(&archive_path).unwrap());
    let handle = proxy::serve(&config, SessionMode::Replay(archive))
        .await
        .unwrap();

    let exchange = tls_get(
        handle.https_addr.unwrap(),
        "example.com",
        "example.com",
        "/index.html",
    )
    .await;

    // The presented leaf must be the archived DER, byte for byte.
    assert_eq!(exchange.peer_cert, archived_der);
    let response = String::from_utf8_lossy(&exchange.response);
    assert!(response.starts_with("HTTP/1.1 200"), "response: {response}");
    assert!(response.contains("replayed over tls"), "response: {response}");

    handle.shutdown().await;
}

#[tokio::test]
async fn https_listener_mints_dummy_leaf_for_unknown_sni() {
    let dir = tempfile::tempdir().unwrap();
    let archive_path = dir.path().join("tls.wprgo");
    archived_page(&archive_path, "https", "example.com");

    let config = tls_config(dir.path(), true);
    let archive = Arc::new(Archive::open(&archive_path).unwrap());
    let handle = proxy::serve(&config, SessionMode::Replay(archive))
        .await
        .unwrap();
    let addr = handle.https_addr.unwrap();

    let first = tls_get(addr, "unknown.test", "unknown.test", "/missing").await;
    let response = String::from_utf8_lossy(&first.response);
    assert!(response.starts_with("HTTP/1.1 404"), "response: {response}");

    // The dummy is a real parsable certificate naming the host, and it is
    // cached per host across hellos.
    let (_, cert) =
        x509_parser::parse_x509_certificate(&first.peer_cert).expect("dummy cert should parse");
    assert!(
        cert.subject()
            .iter_common_name()
            .any(|attr| attr.as_str() == Ok("unknown.test"))
    );
    let second = tls_get(addr, "unknown.test", "unknown.test", "/missing").await;
    assert_eq!(first.peer_cert, second.peer_cert);

    handle.shutdown().await;
}

#[tokio::test]
async fn https_to_http_listener_serves_http_entries_over_tls() {
    let dir = tempfile::tempdir().unwrap();
    let archive_path = dir.path().join("tunnel.wprgo");
    archived_page(&archive_path, "http", "tunnel.test");

    let config = tls_config(dir.path(), false);
    let archive = Arc::new(Archive::open(&archive_path).unwrap());
    let handle = proxy::serve(&config, SessionMode::Replay(archive))
        .await
        .unwrap();

    let exchange = tls_get(
        handle.https_to_http_addr.unwrap(),
        "tunnel.test",
        "tunnel.test",
        "/index.html",
    )
    .await;
    let response = String::from_utf8_lossy(&exchange.response);
    assert!(response.starts_with("HTTP/1.1 200"), "response: {response}");
    assert!(response.contains("replayed over tls"), "response: {response}");

    handle.shutdown().await;
}
