use std::{
    collections::{BTreeMap, HashMap},
    fs::File,
    io::{BufReader, BufWriter, Read as _, Write as _},
    path::{Path, PathBuf},
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context as _;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use hyper::{Request, Response, Uri};
use serde::{Deserialize, Serialize};

use crate::wire;

pub const DEFAULT_NEGOTIATED_PROTOCOL: &str = "http/1.1";

/// One captured request/response pair in wire format. An empty response
/// denotes a round trip that failed while recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub request: Vec<u8>,
    pub response: Vec<u8>,
}

/// In-memory index of a recorded browsing session: exchanges keyed by host
/// and absolute URL, plus the TLS material observed per host.
#[derive(Debug, Default, Clone)]
pub struct Archive {
    pub(crate) requests: HashMap<String, HashMap<String, Vec<Exchange>>>,
    certs: HashMap<String, Vec<u8>>,
    negotiated_protocols: HashMap<String, String>,
    deterministic_time_seed_ms: i64,
}

impl Archive {
    /// Reads an archive from a gzip-compressed JSON document on disk.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file =
            File::open(path).with_context(|| format!("open archive {}", path.display()))?;
        Self::decode(BufReader::new(file))
            .with_context(|| format!("decode archive {}", path.display()))
    }

    pub fn decode(reader: impl std::io::Read) -> anyhow::Result<Self> {
        let mut json = Vec::new();
        GzDecoder::new(reader)
            .read_to_end(&mut json)
            .context("gunzip archive stream")?;
        let doc: ArchiveDoc =
            serde_json::from_slice(&json).context("parse archive document")?;
        Self::from_doc(doc)
    }

    /// Gzip-encodes the archive document into `writer`.
    pub fn serialize(&self, writer: impl std::io::Write) -> anyhow::Result<()> {
        let doc = self.to_doc();
        let json = serde_json::to_vec(&doc).context("encode archive document")?;
        let mut encoder = GzEncoder::new(writer, Compression::default());
        encoder.write_all(&json).context("gzip archive document")?;
        encoder.finish().context("finish archive gzip stream")?;
        Ok(())
    }

    /// Invokes `f` with every parsed exchange. Entries whose wire bytes no
    /// longer parse are logged and skipped; they do not abort iteration.
    pub fn for_each(&self, mut f: impl FnMut(Request<Bytes>, Response<Bytes>)) {
        for (host, by_url) in &self.requests {
            for (url, exchanges) in by_url {
                for exchange in exchanges {
                    match parse_exchange(exchange) {
                        Ok((req, resp)) => f(req, resp),
                        Err(err) => {
                            tracing::warn!(host = %host, url = %url, "skipping unparsable archive entry: {err}");
                        }
                    }
                }
            }
        }
    }

    /// Maps every exchange through `f`, producing a new archive. Returning
    /// `None` deletes the exchange; a returned pair is re-serialized and
    /// re-keyed under its (possibly rewritten) request URL.
    pub fn edit(
        &self,
        mut f: impl FnMut(Request<Bytes>, Response<Bytes>) -> Option<(Request<Bytes>, Response<Bytes>)>,
    ) -> anyhow::Result<Self> {
        let mut edited = Self {
            requests: HashMap::new(),
            certs: self.certs.clone(),
            negotiated_protocols: self.negotiated_protocols.clone(),
            deterministic_time_seed_ms: self.deterministic_time_seed_ms,
        };

        for (host, by_url) in &self.requests {
            for (url, exchanges) in by_url {
                let scheme = url.split("://").next().unwrap_or("https");
                for exchange in exchanges {
                    let (req, resp) = match parse_exchange(exchange) {
                        Ok(pair) => pair,
                        Err(err) => {
                            tracing::warn!(host = %host, url = %url, "skipping unparsable archive entry: {err}");
                            continue;
                        }
                    };
                    let Some((req, resp)) = f(req, resp) else {
                        continue;
                    };
                    edited.insert_exchange(scheme, &req, &resp)?;
                }
            }
        }

        Ok(edited)
    }

    /// Resolves a live request to its best recorded exchange; see
    /// [`crate::matching::find_request`] for the matching contract.
    pub fn find_request(
        &self,
        scheme: &str,
        method: &hyper::Method,
        host: &str,
        uri: &Uri,
        headers: &hyper::HeaderMap,
    ) -> Result<(Request<Bytes>, Response<Bytes>), crate::matching::MatchError> {
        crate::matching::find_request(self, scheme, method, host, uri, headers)
    }

    /// Returns the recorded leaf certificate and negotiated ALPN token for a
    /// host. A host with a certificate but no recorded protocol is reported
    /// as `http/1.1`.
    pub fn find_host_tls(&self, host: &str) -> Option<(&[u8], &str)> {
        let der = self.certs.get(host)?;
        let alpn = self
            .negotiated_protocols
            .get(host)
            .map(String::as_str)
            .unwrap_or(DEFAULT_NEGOTIATED_PROTOCOL);
        Some((der.as_slice(), alpn))
    }

    /// Millisecond time seed captured when recording started, or zero for
    /// archives that predate the field.
    pub fn deterministic_time_seed_ms(&self) -> i64 {
        self.deterministic_time_seed_ms
    }

    pub fn exchange_count(&self) -> usize {
        self.requests
            .values()
            .flat_map(|by_url| by_url.values())
            .map(Vec::len)
            .sum()
    }

    fn insert_exchange(
        &mut self,
        scheme: &str,
        req: &Request<Bytes>,
        resp: &Response<Bytes>,
    ) -> anyhow::Result<()> {
        let host = wire::request_host(req)
            .context("request has neither a Host header nor an authority")?
            .to_owned();
        let url = absolute_url(scheme, &host, req.uri());
        self.requests
            .entry(host)
            .or_default()
            .entry(url)
            .or_default()
            .push(Exchange {
                request: wire::serialize_request(req),
                response: wire::serialize_response(resp),
            });
        Ok(())
    }

    fn from_doc(doc: ArchiveDoc) -> anyhow::Result<Self> {
        let mut certs = HashMap::new();
        for (host, encoded) in doc.certs {
            let der = BASE64
                .decode(&encoded)
                .with_context(|| format!("decode certificate for host `{host}`"))?;
            certs.insert(host, der);
        }

        let mut requests: HashMap<String, HashMap<String, Vec<Exchange>>> = HashMap::new();
        for (host, by_url) in doc.requests {
            let bucket = requests.entry(host).or_default();
            for (url, exchanges) in by_url {
                bucket.insert(
                    url,
                    exchanges
                        .into_iter()
                        .map(|entry| Exchange {
                            request: entry.request,
                            response: entry.response,
                        })
                        .collect(),
                );
            }
        }

        Ok(Self {
            requests,
            certs,
            negotiated_protocols: doc.negotiated_protocol.into_iter().collect(),
            deterministic_time_seed_ms: doc.deterministic_time_seed_ms,
        })
    }

    fn to_doc(&self) -> ArchiveDoc {
        let mut requests: BTreeMap<String, BTreeMap<String, Vec<ExchangeDoc>>> = BTreeMap::new();
        for (host, by_url) in &self.requests {
            let bucket = requests.entry(host.clone()).or_default();
            for (url, exchanges) in by_url {
                bucket.insert(
                    url.clone(),
                    exchanges
                        .iter()
                        .map(|exchange| ExchangeDoc {
                            request: exchange.request.clone(),
                            response: exchange.response.clone(),
                        })
                        .collect(),
                );
            }
        }

        ArchiveDoc {
            requests,
            certs: self
                .certs
                .iter()
                .map(|(host, der)| (host.clone(), BASE64.encode(der)))
                .collect(),
            negotiated_protocol: self
                .negotiated_protocols
                .iter()
                .map(|(host, alpn)| (host.clone(), alpn.clone()))
                .collect(),
            deterministic_time_seed_ms: self.deterministic_time_seed_ms,
        }
    }
}

/// Mutable archive owned by a recording session. All mutation happens under
/// one mutex; origin round trips and body buffering stay outside it.
#[derive(Debug)]
pub struct WritableArchive {
    state: Mutex<WritableState>,
}

#[derive(Debug)]
struct WritableState {
    archive: Archive,
    output: Option<(PathBuf, File)>,
}

impl WritableArchive {
    /// Creates (or truncates) the archive file and starts an empty archive.
    /// The time seed is captured here, once, at record start.
    pub fn create(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file =
            File::create(path).with_context(|| format!("create archive {}", path.display()))?;
        let archive = Archive {
            deterministic_time_seed_ms: now_unix_ms(),
            ..Archive::default()
        };
        Ok(Self {
            state: Mutex::new(WritableState {
                archive,
                output: Some((path.to_path_buf(), file)),
            }),
        })
    }

    pub fn record_request(
        &self,
        scheme: &str,
        req: &Request<Bytes>,
        resp: &Response<Bytes>,
    ) -> anyhow::Result<()> {
        let mut state = self.lock();
        state.archive.insert_exchange(scheme, req, resp)
    }

    /// Stores TLS material for a host. The first certificate recorded for a
    /// host wins; the negotiated protocol is always overwritten.
    pub fn record_tls(&self, host: &str, der: Vec<u8>, negotiated_protocol: &str) {
        let mut state = self.lock();
        state
            .archive
            .certs
            .entry(host.to_owned())
            .or_insert(der);
        state
            .archive
            .negotiated_protocols
            .insert(host.to_owned(), negotiated_protocol.to_owned());
    }

    pub fn find_host_tls(&self, host: &str) -> Option<(Vec<u8>, String)> {
        let state = self.lock();
        state
            .archive
            .find_host_tls(host)
            .map(|(der, alpn)| (der.to_vec(), alpn.to_owned()))
    }

    pub fn deterministic_time_seed_ms(&self) -> i64 {
        self.lock().archive.deterministic_time_seed_ms
    }

    /// Serializes the archive to its file and closes it. Closing twice is an
    /// error.
    pub fn close(&self) -> anyhow::Result<()> {
        let mut state = self.lock();
        let Some((path, file)) = state.output.take() else {
            anyhow::bail!("archive is already closed");
        };
        let mut writer = BufWriter::new(file);
        state
            .archive
            .serialize(&mut writer)
            .with_context(|| format!("serialize archive {}", path.display()))?;
        writer
            .into_inner()
            .map_err(|err| anyhow::anyhow!("flush archive {}: {err}", path.display()))?
            .sync_all()
            .with_context(|| format!("sync archive {}", path.display()))?;
        tracing::info!(path = %path.display(), "archive written");
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WritableState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Synthesizes the absolute URL string used as an archive key. Relative
/// request targets are completed with the listener scheme and the host the
/// client addressed.
pub fn absolute_url(scheme: &str, host: &str, uri: &Uri) -> String {
    if uri.scheme().is_some() && uri.authority().is_some() {
        return uri.to_string();
    }
    let path_and_query = uri
        .path_and_query()
        .map(|value| value.as_str())
        .filter(|value| !value.is_empty())
        .unwrap_or("/");
    format!("{scheme}://{host}{path_and_query}")
}

pub(crate) fn parse_exchange(
    exchange: &Exchange,
) -> Result<(Request<Bytes>, Response<Bytes>), wire::WireError> {
    let req = wire::parse_request(&exchange.request)?;
    let resp = wire::parse_response(&exchange.response)?;
    Ok((req, resp))
}

fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[derive(Debug, Serialize, Deserialize)]
struct ExchangeDoc {
    #[serde(rename = "SerializedRequest", with = "base64_bytes")]
    request: Vec<u8>,
    #[serde(rename = "SerializedResponse", with = "base64_bytes", default)]
    response: Vec<u8>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct ArchiveDoc {
    #[serde(rename = "Requests")]
    requests: BTreeMap<String, BTreeMap<String, Vec<ExchangeDoc>>>,
    #[serde(rename = "Certs")]
    certs: BTreeMap<String, String>,
    #[serde(rename = "NegotiatedProtocol")]
    negotiated_protocol: BTreeMap<String, String>,
    #[serde(rename = "DeterministicTimeSeedMs")]
    deterministic_time_seed_ms: i64,
}

mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
    use serde::{Deserialize as _, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(&encoded).map_err(serde::de::Error::custom)
    }
}
