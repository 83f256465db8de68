use std::collections::BTreeMap;

use bytes::Bytes;
use hyper::{HeaderMap, Method, Request, Response, Uri};

use crate::archive::{self, Archive};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchError {
    NotFound,
}

impl std::fmt::Display for MatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "no matching request in archive"),
        }
    }
}

impl std::error::Error for MatchError {}

/// Finds the recorded exchange that best matches a live request.
///
/// The exact-URL pass scores exchanges stored under the live request's
/// absolute URL by header similarity and wins outright when any
/// method-matching candidate exists. Otherwise a fuzzy pass scores every
/// archived URL with the same path by query similarity, inheriting the ratio
/// floor the exact pass left behind; ties between URLs break toward the
/// lexicographically smaller string because the host map has no iteration
/// order of its own.
pub fn find_request(
    archive: &Archive,
    scheme: &str,
    method: &Method,
    host: &str,
    uri: &Uri,
    headers: &HeaderMap,
) -> Result<(Request<Bytes>, Response<Bytes>), MatchError> {
    let Some(by_url) = archive.requests.get(host) else {
        return Err(MatchError::NotFound);
    };
    if by_url.is_empty() {
        return Err(MatchError::NotFound);
    }

    let url = archive::absolute_url(scheme, host, uri);
    let mut best_ratio = 0.0_f64;

    if let Some(exchanges) = by_url.get(&url) {
        let mut best = None;
        for exchange in exchanges {
            let Ok((archived_req, archived_resp)) = archive::parse_exchange(exchange) else {
                tracing::debug!(url = %url, "skipping unparsable exchange during exact match");
                continue;
            };
            if archived_req.method() != method {
                continue;
            }
            let ratio = header_similarity(archived_req.headers(), headers);
            if ratio > best_ratio {
                best_ratio = ratio;
                best = Some((archived_req, archived_resp));
            }
        }
        if let Some(found) = best {
            return Ok(found);
        }
    }

    // Fuzzy pass over every archived URL sharing the live path. best_ratio
    // deliberately carries over from the exact pass.
    let live_query = query_values(uri.query());
    let mut best_url: Option<&String> = None;
    for candidate in by_url.keys() {
        let Ok(candidate_uri) = candidate.parse::<Uri>() else {
            continue;
        };
        if candidate_uri.path() != uri.path() {
            continue;
        }
        let ratio = query_similarity(&query_values(candidate_uri.query()), &live_query);
        let smaller_tie = ratio == best_ratio
            && best_url.is_some_and(|current| candidate.as_str() < current.as_str());
        if ratio > best_ratio || smaller_tie {
            best_ratio = ratio;
            best_url = Some(candidate);
        }
    }

    let Some(best_url) = best_url else {
        return Err(MatchError::NotFound);
    };
    for exchange in &by_url[best_url] {
        let Ok((archived_req, archived_resp)) = archive::parse_exchange(exchange) else {
            continue;
        };
        if archived_req.method() == method {
            return Ok((archived_req, archived_resp));
        }
    }
    Err(MatchError::NotFound)
}

/// Ratio of structurally equal header value lists between an archived and a
/// live request. The +1 keeps the ratio nonzero so a lone candidate always
/// survives even with disjoint headers.
fn header_similarity(archived: &HeaderMap, live: &HeaderMap) -> f64 {
    let mut matching = 0usize;
    for name in archived.keys() {
        let archived_values: Vec<_> = archived.get_all(name).iter().collect();
        let live_values: Vec<_> = live.get_all(name).iter().collect();
        if !live_values.is_empty() && archived_values == live_values {
            matching += 1;
        }
    }
    let total = archived.keys_len() + live.keys_len();
    2.0 * (matching + 1) as f64 / total as f64
}

fn query_similarity(
    archived: &BTreeMap<String, Vec<String>>,
    live: &BTreeMap<String, Vec<String>>,
) -> f64 {
    let matching = archived
        .iter()
        .filter(|(key, values)| live.get(*key) == Some(values))
        .count();
    2.0 * (matching + 1) as f64 / (archived.len() + live.len()) as f64
}

/// Raw `name=value` pairs grouped by name, values kept in order. No percent
/// decoding; the archive stores whatever the client sent.
fn query_values(query: Option<&str>) -> BTreeMap<String, Vec<String>> {
    let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let Some(query) = query else { return out };
    for segment in query.split('&') {
        if segment.is_empty() {
            continue;
        }
        let (name, value) = segment.split_once('=').unwrap_or((segment, ""));
        out.entry(name.to_owned()).or_default().push(value.to_owned());
    }
    out
}
