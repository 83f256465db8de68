use std::{
    convert::Infallible,
    error::Error as StdError,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, SystemTime},
};

use anyhow::Context as _;
use bytes::Bytes;
use http_body_util::{BodyExt as _, Full, combinators::BoxBody};
use hyper::{
    Request, Response, StatusCode, Uri,
    body::Incoming,
    header::{self, HeaderValue},
    service::service_fn,
};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{Notify, oneshot},
};
use tokio_rustls::LazyConfigAcceptor;

use crate::{
    archive::{self, Archive, WritableArchive},
    ca::{self, CertificateMint},
    codec,
    config::Config,
    matching,
    transform::{self, ScriptInjector, TransformRules, Transformer},
};

/// Synchronous reachability probe; answered before any archive lookup.
pub const GENERATE_200_PATH: &str = "/web-page-replay-generate-200";
/// Flushes the archive (when writable) and asks the harness to exit.
pub const COMMAND_EXIT_PATH: &str = "/web-page-replay-command-exit";

const KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(180);

type ProxyBody = BoxBody<Bytes, Box<dyn StdError + Send + Sync>>;
type OriginClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// The archive a session serves from: read-only for replay, writable under
/// its own mutex for record.
#[derive(Clone)]
pub enum SessionMode {
    Replay(Arc<Archive>),
    Record(Arc<WritableArchive>),
}

struct ProxyState {
    mode: SessionMode,
    transformers: Vec<Box<dyn Transformer>>,
    origin_client: Option<OriginClient>,
    exit: Arc<Notify>,
}

/// Running listeners bound to one archive. Dropping the handle leaves the
/// listeners running; call [`ServerHandle::shutdown`] to stop them.
pub struct ServerHandle {
    pub http_addr: Option<SocketAddr>,
    pub https_addr: Option<SocketAddr>,
    pub https_to_http_addr: Option<SocketAddr>,
    exit: Arc<Notify>,
    shutdown_txs: Vec<oneshot::Sender<()>>,
    joins: Vec<tokio::task::JoinHandle<()>>,
}

impl ServerHandle {
    /// Resolves when a handler served the exit magic URL.
    pub async fn exit_requested(&self) {
        self.exit.notified().await;
    }

    pub async fn shutdown(self) {
        for tx in self.shutdown_txs {
            let _ = tx.send(());
        }
        for join in self.joins {
            let _ = join.await;
        }
    }
}

/// Opens every configured listener against the same archive: plain HTTP,
/// HTTPS with SNI-minted leaves, and HTTPS that tunnels the plain-HTTP
/// handler. Startup is parallel only in the sense that no listener waits on
/// another; each bind failure is fatal.
pub async fn serve(config: &Config, mode: SessionMode) -> anyhow::Result<ServerHandle> {
    ca::ensure_rustls_crypto_provider()?;
    config.validate()?;

    let needs_tls = config.https_port.is_some() || config.https_to_http_port.is_some();
    let mint = if needs_tls {
        let cert_path = config
            .https_cert_file
            .as_deref()
            .context("`--https_cert_file` is required for TLS listeners")?;
        let key_path = config
            .https_key_file
            .as_deref()
            .context("`--https_key_file` is required for TLS listeners")?;
        Some(Arc::new(CertificateMint::load(cert_path, key_path)?))
    } else {
        None
    };

    let origin_client = match &mode {
        SessionMode::Record(_) => Some(build_origin_client()?),
        SessionMode::Replay(_) => None,
    };
    let transformers = build_transformers(config, &mode)?;
    let exit = Arc::new(Notify::new());
    let state = Arc::new(ProxyState {
        mode,
        transformers,
        origin_client,
        exit: Arc::clone(&exit),
    });

    let mut handle = ServerHandle {
        http_addr: None,
        https_addr: None,
        https_to_http_addr: None,
        exit,
        shutdown_txs: Vec::new(),
        joins: Vec::new(),
    };

    if let Some(port) = config.http_port {
        let listener = bind(config, port).await?;
        handle.http_addr = Some(listener.local_addr().context("get http local_addr")?);
        let (tx, rx) = oneshot::channel();
        handle.shutdown_txs.push(tx);
        handle
            .joins
            .push(spawn_plain_listener(listener, Arc::clone(&state), "http", rx));
        tracing::info!(addr = ?handle.http_addr, "http listener started");
    }

    if let Some(port) = config.https_port {
        let listener = bind(config, port).await?;
        handle.https_addr = Some(listener.local_addr().context("get https local_addr")?);
        let mint = Arc::clone(mint.as_ref().context("TLS listener without CA material")?);
        let (tx, rx) = oneshot::channel();
        handle.shutdown_txs.push(tx);
        handle.joins.push(spawn_tls_listener(
            listener,
            Arc::clone(&state),
            mint,
            "https",
            rx,
        ));
        tracing::info!(addr = ?handle.https_addr, "https listener started");
    }

    if let Some(port) = config.https_to_http_port {
        let listener = bind(config, port).await?;
        handle.https_to_http_addr =
            Some(listener.local_addr().context("get https_to_http local_addr")?);
        let mint = Arc::clone(mint.as_ref().context("TLS listener without CA material")?);
        let (tx, rx) = oneshot::channel();
        handle.shutdown_txs.push(tx);
        handle.joins.push(spawn_tls_listener(
            listener,
            Arc::clone(&state),
            mint,
            "http",
            rx,
        ));
        tracing::info!(addr = ?handle.https_to_http_addr, "https-to-http listener started");
    }

    Ok(handle)
}

async fn bind(config: &Config, port: u16) -> anyhow::Result<TcpListener> {
    let addr = SocketAddr::new(config.host, port);
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))
}

fn build_origin_client() -> anyhow::Result<OriginClient> {
    let connector = HttpsConnectorBuilder::new()
        .with_native_roots()
        .map_err(|err| anyhow::anyhow!("load native TLS root certificates: {err}"))?
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .build();
    Ok(Client::builder(TokioExecutor::new()).build(connector))
}

fn build_transformers(
    config: &Config,
    mode: &SessionMode,
) -> anyhow::Result<Vec<Box<dyn Transformer>>> {
    let seed_ms = match mode {
        SessionMode::Record(writable) => writable.deterministic_time_seed_ms(),
        SessionMode::Replay(archive) => match archive.deterministic_time_seed_ms() {
            0 => {
                tracing::warn!("archive has no time seed; falling back to wall clock");
                now_unix_ms()
            }
            seed => seed,
        },
    };
    let replacements = std::collections::HashMap::from([(
        transform::TIME_SEED_TOKEN.to_owned(),
        seed_ms.to_string(),
    )]);

    let mut transformers: Vec<Box<dyn Transformer>> = Vec::new();
    for script in &config.inject_scripts {
        transformers.push(Box::new(ScriptInjector::from_file(script, &replacements)?));
    }
    if let Some(rules_file) = &config.rules_file {
        let rules = TransformRules::from_file(rules_file)?;
        tracing::info!(path = %rules_file.display(), rules = rules.len(), "loaded transform rules");
        transformers.push(Box::new(rules));
    }
    Ok(transformers)
}

fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

fn spawn_plain_listener(
    listener: TcpListener,
    state: Arc<ProxyState>,
    scheme: &'static str,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let Ok((stream, _peer)) = accept else { continue };
                    enable_keep_alive(&stream);
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        let service = service_fn(move |req| {
                            proxy_handler(req, Arc::clone(&state), scheme)
                        });
                        let builder = ConnectionBuilder::new(TokioExecutor::new());
                        if let Err(err) = builder.serve_connection(io, service).await {
                            tracing::debug!("connection error: {err}");
                        }
                    });
                }
            }
        }
    })
}

fn spawn_tls_listener(
    listener: TcpListener,
    state: Arc<ProxyState>,
    mint: Arc<CertificateMint>,
    scheme: &'static str,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let Ok((stream, _peer)) = accept else { continue };
                    enable_keep_alive(&stream);
                    let state = Arc::clone(&state);
                    let mint = Arc::clone(&mint);
                    tokio::spawn(async move {
                        if let Err(err) = serve_tls_connection(stream, state, mint, scheme).await {
                            tracing::debug!("TLS connection error: {err}");
                        }
                    });
                }
            }
        }
    })
}

/// Completes one TLS connection: the client hello's SNI picks the
/// certificate and ALPN list, then the handshake resumes with that
/// per-connection configuration and the HTTP handler takes over.
async fn serve_tls_connection(
    stream: TcpStream,
    state: Arc<ProxyState>,
    mint: Arc<CertificateMint>,
    scheme: &'static str,
) -> anyhow::Result<()> {
    let start = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream)
        .await
        .context("read TLS client hello")?;
    let sni = start.client_hello().server_name().map(str::to_owned);

    let tls_config = match &state.mode {
        SessionMode::Replay(archive) => mint.replay_server_config(sni.as_deref(), archive)?,
        SessionMode::Record(writable) => {
            mint.record_server_config(sni.as_deref(), writable).await?
        }
    };
    let tls_stream = start
        .into_stream(tls_config)
        .await
        .with_context(|| format!("TLS handshake (sni {sni:?})"))?;

    let io = TokioIo::new(tls_stream);
    let service = service_fn(move |req| proxy_handler(req, Arc::clone(&state), scheme));
    let builder = ConnectionBuilder::new(TokioExecutor::new());
    builder
        .serve_connection(io, service)
        .await
        .map_err(|err| anyhow::anyhow!("serve TLS session: {err}"))?;
    Ok(())
}

fn enable_keep_alive(stream: &TcpStream) {
    let keepalive = socket2::TcpKeepalive::new().with_time(KEEP_ALIVE_PERIOD);
    if let Err(err) = socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        tracing::debug!("enable TCP keep-alive: {err}");
    }
}

async fn proxy_handler(
    req: Request<Incoming>,
    state: Arc<ProxyState>,
    scheme: &'static str,
) -> Result<Response<ProxyBody>, Infallible> {
    tracing::debug!(method = %req.method(), path = %req.uri().path(), scheme, "request");

    // Magic URLs short-circuit before any archive work.
    match req.uri().path() {
        GENERATE_200_PATH => {
            return Ok(simple_response(StatusCode::OK, ""));
        }
        COMMAND_EXIT_PATH => {
            if let SessionMode::Record(writable) = &state.mode {
                if let Err(err) = writable.close() {
                    tracing::error!("flush archive on exit command: {err}");
                }
            }
            tracing::info!("exit command received");
            state.exit.notify_one();
            return Ok(simple_response(StatusCode::OK, ""));
        }
        _ => {}
    }

    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            tracing::debug!("failed to buffer request body: {err}");
            return Ok(simple_response(StatusCode::BAD_REQUEST, "unreadable request body"));
        }
    };

    let Some(host) = request_host(&parts) else {
        return Ok(simple_response(
            StatusCode::BAD_REQUEST,
            "request has no Host header",
        ));
    };

    let response = match &state.mode {
        SessionMode::Replay(archive) => {
            replay_response(archive, &state.transformers, scheme, &host, parts, body)
        }
        SessionMode::Record(writable) => {
            record_response(&state, writable, scheme, &host, parts, body).await
        }
    };

    let (resp_parts, resp_body) = response.into_parts();
    Ok(Response::from_parts(resp_parts, boxed_full(resp_body)))
}

/// Resolves a live request against the read-only archive and replays the
/// recorded response: translate the content encoding to the client's accept
/// set, move the date headers to the present, then run the transformers.
fn replay_response(
    archive: &Archive,
    transformers: &[Box<dyn Transformer>],
    scheme: &str,
    host: &str,
    parts: hyper::http::request::Parts,
    body: Bytes,
) -> Response<Bytes> {
    let found = matching::find_request(
        archive,
        scheme,
        &parts.method,
        host,
        &parts.uri,
        &parts.headers,
    );
    let (_, mut resp) = match found {
        Ok(pair) => pair,
        Err(err) => {
            tracing::debug!(host = %host, uri = %parts.uri, "replay miss: {err}");
            return simple_bytes_response(StatusCode::NOT_FOUND, "not found in archive");
        }
    };

    let accept_encoding = joined_header_values(&parts.headers, header::ACCEPT_ENCODING);
    if let Err(err) = translate_content_encoding(&mut resp, &accept_encoding) {
        tracing::debug!(host = %host, uri = %parts.uri, "encoding translation failed: {err}");
        return simple_bytes_response(StatusCode::NOT_FOUND, "not found in archive");
    }

    rewrite_dates(resp.headers_mut(), SystemTime::now());

    let live = live_request(scheme, host, parts, body);
    transform::apply_transformers(transformers, &live, &mut resp);
    resp
}

/// Forwards a live request to the real origin, persists the exchange before
/// any mutation, then serves the transformed copy to the client. An origin
/// failure becomes a recorded 500 rather than an error.
async fn record_response(
    state: &ProxyState,
    writable: &WritableArchive,
    scheme: &str,
    host: &str,
    mut parts: hyper::http::request::Parts,
    body: Bytes,
) -> Response<Bytes> {
    strip_brotli_accept_encoding(&mut parts.headers);

    // A zero-length declared body is forwarded as no body at all; some
    // origins retry indefinitely otherwise.
    let body = match parse_content_length(&parts.headers) {
        Some(0) => Bytes::new(),
        _ => body,
    };

    let live = live_request(scheme, host, parts, body);

    let origin_resp = match round_trip(state, &live).await {
        Ok(resp) => resp,
        Err(err) => {
            tracing::warn!(host = %host, uri = %live.uri(), "origin round trip failed: {err}");
            let mut failed = Response::new(Bytes::new());
            *failed.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            *failed.version_mut() = live.version();
            failed
        }
    };

    if let Err(err) = writable.record_request(scheme, &live, &origin_resp) {
        tracing::error!(host = %host, uri = %live.uri(), "failed to record exchange: {err}");
    }

    let mut client_resp = origin_resp;
    transform::apply_transformers(&state.transformers, &live, &mut client_resp);
    client_resp
}

async fn round_trip(
    state: &ProxyState,
    live: &Request<Bytes>,
) -> anyhow::Result<Response<Bytes>> {
    let client = state
        .origin_client
        .as_ref()
        .context("record mode has no origin client")?;

    let mut builder = Request::builder()
        .method(live.method().clone())
        .uri(live.uri().clone());
    if let Some(headers) = builder.headers_mut() {
        *headers = live.headers().clone();
        strip_hop_by_hop_headers(headers);
    }
    let origin_req = builder
        .body(Full::new(live.body().clone()))
        .context("build origin request")?;

    let origin_resp = client
        .request(origin_req)
        .await
        .context("origin request failed")?;
    let (mut resp_parts, resp_body) = origin_resp.into_parts();
    strip_hop_by_hop_headers(&mut resp_parts.headers);
    let resp_body = resp_body
        .collect()
        .await
        .context("buffer origin response body")?
        .to_bytes();
    Ok(Response::from_parts(resp_parts, resp_body))
}

/// Rebuilds the live request with the absolute URL the archive keys on.
fn live_request(
    scheme: &str,
    host: &str,
    parts: hyper::http::request::Parts,
    body: Bytes,
) -> Request<Bytes> {
    let absolute = archive::absolute_url(scheme, host, &parts.uri);
    let mut req = Request::from_parts(parts, body);
    if let Ok(uri) = absolute.parse::<Uri>() {
        *req.uri_mut() = uri;
    }
    if !req.headers().contains_key(header::HOST)
        && let Ok(value) = HeaderValue::from_str(host)
    {
        req.headers_mut().insert(header::HOST, value);
    }
    req
}

fn request_host(parts: &hyper::http::request::Parts) -> Option<String> {
    parts
        .headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| parts.uri.host())
        .map(str::to_owned)
}

/// Re-encodes a stored response whose `Content-Encoding` the client did not
/// offer in `Accept-Encoding`. Substring semantics mirror what browsers
/// send: an identity/empty stored encoding always passes.
fn translate_content_encoding(
    resp: &mut Response<Bytes>,
    accept_encoding: &str,
) -> Result<(), codec::CodecError> {
    let stored = resp
        .headers()
        .get(header::CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_ascii_lowercase())
        .unwrap_or_default();
    let accept = accept_encoding.to_ascii_lowercase();
    if accept.contains(&stored) {
        return Ok(());
    }

    let decoded = codec::decompress(&stored, resp.body())?;
    let (encoded, chosen) = codec::compress(&accept, &decoded)?;

    resp.headers_mut()
        .insert(header::CONTENT_ENCODING, HeaderValue::from_static(chosen));
    if resp.headers().contains_key(header::CONTENT_LENGTH)
        && let Ok(value) = HeaderValue::from_str(&encoded.len().to_string())
    {
        resp.headers_mut().insert(header::CONTENT_LENGTH, value);
    }
    *resp.body_mut() = Bytes::from(encoded);
    Ok(())
}

/// Sets `Date` to now and shifts `Last-Modified` and `Expires` by the same
/// delta the stored `Date` moved. Headers that fail to parse stay as
/// recorded.
fn rewrite_dates(headers: &mut hyper::HeaderMap, now: SystemTime) {
    let stored_date = headers
        .get(header::DATE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| httpdate::parse_http_date(value).ok());

    if let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(now)) {
        headers.insert(header::DATE, value);
    }

    let Some(stored_date) = stored_date else {
        return;
    };
    let (delta, forward) = match now.duration_since(stored_date) {
        Ok(delta) => (delta, true),
        Err(err) => (err.duration(), false),
    };

    for name in [header::LAST_MODIFIED, header::EXPIRES] {
        let Some(parsed) = headers
            .get(&name)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| httpdate::parse_http_date(value).ok())
        else {
            continue;
        };
        let shifted = if forward {
            parsed.checked_add(delta)
        } else {
            parsed.checked_sub(delta)
        };
        if let Some(shifted) = shifted
            && let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(shifted))
        {
            headers.insert(name, value);
        }
    }
}

/// Rewrites `Accept-Encoding` without the brotli token; recorded bodies must
/// stay decodable by the replay pipeline.
fn strip_brotli_accept_encoding(headers: &mut hyper::HeaderMap) {
    let joined = joined_header_values(headers, header::ACCEPT_ENCODING);
    if joined.is_empty() {
        return;
    }
    let filtered = joined
        .split(',')
        .map(str::trim)
        .filter(|token| !token.eq_ignore_ascii_case("br") && !token.is_empty())
        .collect::<Vec<_>>()
        .join(", ");
    headers.remove(header::ACCEPT_ENCODING);
    if !filtered.is_empty()
        && let Ok(value) = HeaderValue::from_str(&filtered)
    {
        headers.insert(header::ACCEPT_ENCODING, value);
    }
}

fn joined_header_values(headers: &hyper::HeaderMap, name: header::HeaderName) -> String {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect::<Vec<_>>()
        .join(", ")
}

fn parse_content_length(headers: &hyper::HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
}

/// Drops connection-scoped headers before a message crosses a hop: the
/// RFC 7230 set, the de-facto `proxy-connection`/`keep-alive` pair, and
/// whatever names the `Connection` header itself lists.
fn strip_hop_by_hop_headers(headers: &mut hyper::HeaderMap) {
    let listed: Vec<header::HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| token.trim().parse::<header::HeaderName>().ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }

    headers.remove(header::CONNECTION);
    headers.remove(header::PROXY_AUTHENTICATE);
    headers.remove(header::PROXY_AUTHORIZATION);
    headers.remove(header::TE);
    headers.remove(header::TRAILER);
    headers.remove(header::TRANSFER_ENCODING);
    headers.remove(header::UPGRADE);
    headers.remove("keep-alive");
    headers.remove("proxy-connection");
}

fn simple_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(boxed_full(Bytes::from(message.to_owned())));
    *response.status_mut() = status;
    response
}

fn simple_bytes_response(status: StatusCode, message: &str) -> Response<Bytes> {
    let mut response = Response::new(Bytes::from(message.to_owned()));
    *response.status_mut() = status;
    response
}

fn boxed_full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into())
        .map_err(|never| -> Box<dyn StdError + Send + Sync> { match never {} })
        .boxed()
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use bytes::Bytes;
    use hyper::{HeaderMap, Response, StatusCode, header::HeaderValue};

    use super::{
        joined_header_values, rewrite_dates, strip_brotli_accept_encoding,
        strip_hop_by_hop_headers, translate_content_encoding,
    };
    use crate::codec;

    fn stored_response(encoding: Option<&str>, body: &[u8]) -> Response<Bytes> {
        let mut builder = Response::builder().status(StatusCode::OK);
        if let Some(encoding) = encoding {
            builder = builder
                .header("content-encoding", encoding)
                .header("content-length", body.len().to_string());
        }
        builder.body(Bytes::copy_from_slice(body)).unwrap()
    }

    #[test]
    fn stored_encoding_accepted_by_client_is_untouched() {
        let (gzipped, _) = codec::compress("gzip", b"payload").unwrap();
        let mut resp = stored_response(Some("gzip"), &gzipped);
        translate_content_encoding(&mut resp, "gzip, deflate, br").unwrap();
        assert_eq!(&resp.body()[..], &gzipped[..]);
    }

    #[test]
    fn stored_encoding_is_recoded_to_first_supported() {
        let (gzipped, _) = codec::compress("gzip", b"payload").unwrap();
        let mut resp = stored_response(Some("gzip"), &gzipped);

        translate_content_encoding(&mut resp, "deflate").unwrap();

        assert_eq!(
            resp.headers().get("content-encoding"),
            Some(&HeaderValue::from_static("deflate"))
        );
        assert_eq!(
            resp.headers()
                .get("content-length")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<usize>().ok()),
            Some(resp.body().len())
        );
        assert_eq!(codec::decompress("deflate", resp.body()).unwrap(), b"payload");
    }

    #[test]
    fn unsupported_stored_encoding_fails_instead_of_corrupting() {
        let mut resp = stored_response(Some("br"), b"opaque brotli bytes");
        let err = translate_content_encoding(&mut resp, "gzip, deflate").unwrap_err();
        assert!(matches!(err, codec::CodecError::UnknownEncoding(_)));
    }

    #[test]
    fn identity_stored_encoding_passes_regardless_of_accept() {
        let mut resp = stored_response(None, b"plain");
        translate_content_encoding(&mut resp, "gzip").unwrap();
        assert_eq!(&resp.body()[..], b"plain");
    }

    #[test]
    fn date_rewrite_shifts_last_modified_and_expires_by_the_same_delta() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "date",
            HeaderValue::from_static("Thu, 17 Aug 2017 12:00:00 GMT"),
        );
        headers.insert(
            "last-modified",
            HeaderValue::from_static("Thu, 17 Aug 2017 09:00:00 GMT"),
        );
        headers.insert(
            "expires",
            HeaderValue::from_static("Thu, 17 Aug 2017 17:00:00 GMT"),
        );

        let now = httpdate::parse_http_date("Fri, 17 Aug 2018 12:00:00 GMT").unwrap();
        rewrite_dates(&mut headers, now);

        assert_eq!(
            headers.get("date").unwrap(),
            &HeaderValue::from_static("Fri, 17 Aug 2018 12:00:00 GMT")
        );
        assert_eq!(
            headers.get("last-modified").unwrap(),
            &HeaderValue::from_static("Fri, 17 Aug 2018 09:00:00 GMT")
        );
        assert_eq!(
            headers.get("expires").unwrap(),
            &HeaderValue::from_static("Fri, 17 Aug 2018 17:00:00 GMT")
        );
    }

    #[test]
    fn date_rewrite_leaves_unparsable_values_alone() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "last-modified",
            HeaderValue::from_static("not a real date"),
        );
        rewrite_dates(&mut headers, SystemTime::now());

        assert!(headers.contains_key("date"));
        assert_eq!(
            headers.get("last-modified").unwrap(),
            &HeaderValue::from_static("not a real date")
        );
    }

    #[test]
    fn brotli_is_stripped_from_accept_encoding() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "accept-encoding",
            HeaderValue::from_static("gzip, deflate, br"),
        );
        strip_brotli_accept_encoding(&mut headers);
        assert_eq!(
            headers.get("accept-encoding"),
            Some(&HeaderValue::from_static("gzip, deflate"))
        );

        let mut only_br = HeaderMap::new();
        only_br.insert("accept-encoding", HeaderValue::from_static("br"));
        strip_brotli_accept_encoding(&mut only_br);
        assert!(only_br.get("accept-encoding").is_none());
    }

    #[test]
    fn connection_listed_and_standard_hop_headers_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("x-session-token"));
        headers.insert("x-session-token", HeaderValue::from_static("abc"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("proxy-connection", HeaderValue::from_static("keep-alive"));
        headers.insert("accept", HeaderValue::from_static("text/html"));

        strip_hop_by_hop_headers(&mut headers);

        assert!(headers.get("x-session-token").is_none());
        assert!(headers.get("connection").is_none());
        assert!(headers.get("transfer-encoding").is_none());
        assert!(headers.get("proxy-connection").is_none());
        assert_eq!(
            headers.get("accept"),
            Some(&HeaderValue::from_static("text/html"))
        );
    }

    #[test]
    fn joined_header_values_collects_repeated_headers() {
        let mut headers = HeaderMap::new();
        headers.append("accept-encoding", HeaderValue::from_static("gzip"));
        headers.append("accept-encoding", HeaderValue::from_static("deflate"));
        assert_eq!(
            joined_header_values(&headers, hyper::header::ACCEPT_ENCODING),
            "gzip, deflate"
        );
    }
}
