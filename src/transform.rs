use std::{collections::HashMap, fs, path::Path, sync::LazyLock};

use anyhow::Context as _;
use bytes::Bytes;
use hyper::{
    Request, Response, StatusCode, Uri,
    header::{self, HeaderName, HeaderValue},
};
use regex::bytes::Regex as BytesRegex;
use serde::Deserialize;

use crate::codec;

/// Literal token replaced inside injected scripts with the archive's
/// deterministic time seed.
pub const TIME_SEED_TOKEN: &str = "{{WPR_TIME_SEED_TIMESTAMP}}";

static JS_COMMENTS: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"(?s)/\*.*?\*/|//[^\r\n]*").expect("comment regex"));
static HEAD_TAG: LazyLock<BytesRegex> =
    LazyLock::new(|| BytesRegex::new(r"(?i)<head[^>]*>").expect("head regex"));
static HTML_TAG: LazyLock<BytesRegex> =
    LazyLock::new(|| BytesRegex::new(r"(?i)<html[^>]*>").expect("html regex"));
static DOCTYPE_TAG: LazyLock<BytesRegex> =
    LazyLock::new(|| BytesRegex::new(r"(?i)<!doctype html[^>]*>").expect("doctype regex"));

/// A response-mutating stage. Transformers run in registration order after
/// matching (replay) or persistence (record) and before the response is
/// written to the client.
pub trait Transformer: Send + Sync {
    fn transform(&self, req: &Request<Bytes>, resp: &mut Response<Bytes>) -> anyhow::Result<()>;
}

/// Applies every transformer in order. A failing stage is logged and leaves
/// the response exactly as the previous stage produced it; partial mutations
/// never reach the client.
pub fn apply_transformers(
    transformers: &[Box<dyn Transformer>],
    req: &Request<Bytes>,
    resp: &mut Response<Bytes>,
) {
    for transformer in transformers {
        if let Err(err) = transformer.transform(req, resp) {
            tracing::warn!(url = %req.uri(), "response transformer failed: {err}");
        }
    }
}

/// Runs `f` over the decoded response body, re-encoding with the original
/// `Content-Encoding` and restamping `Content-Length` afterwards. The
/// response is only touched once every step has succeeded.
pub fn transform_response_body<F>(resp: &mut Response<Bytes>, f: F) -> anyhow::Result<()>
where
    F: FnOnce(&[u8]) -> anyhow::Result<Vec<u8>>,
{
    let encoding = content_encoding(resp);
    let decoded = codec::decompress(&encoding, resp.body())
        .with_context(|| format!("decode `{encoding}` response body"))?;

    let transformed = f(&decoded)?;

    let body = if encoding.is_empty() || encoding == codec::IDENTITY {
        transformed
    } else {
        let (encoded, _) = codec::compress(&encoding, &transformed)
            .with_context(|| format!("re-encode `{encoding}` response body"))?;
        encoded
    };

    if resp.headers().contains_key(header::CONTENT_LENGTH) {
        let value = HeaderValue::from_str(&body.len().to_string())
            .context("restamp Content-Length")?;
        resp.headers_mut().insert(header::CONTENT_LENGTH, value);
    }
    *resp.body_mut() = Bytes::from(body);
    Ok(())
}

/// The effective `Content-Encoding`: last header value, last token when the
/// value itself is a chain, lowercased.
fn content_encoding(resp: &Response<Bytes>) -> String {
    resp.headers()
        .get_all(header::CONTENT_ENCODING)
        .iter()
        .last()
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.rsplit(',').next())
        .map(|token| token.trim().to_ascii_lowercase())
        .unwrap_or_default()
}

/// Injects a script into HTML documents, directly after the first of
/// `<head>`, `<html>`, or `<!doctype html>`. Injection is idempotent: a body
/// that already carries the exact tagged script is left alone.
pub struct ScriptInjector {
    tagged_script: String,
}

impl ScriptInjector {
    pub fn new(script: &str, replacements: &HashMap<String, String>) -> Self {
        let mut cleaned = JS_COMMENTS.replace_all(script, "").into_owned();
        for (token, value) in replacements {
            cleaned = cleaned.replace(token, value);
        }
        let cleaned = cleaned.replace("\r\n", "");
        Self {
            tagged_script: format!("<script>{cleaned}</script>"),
        }
    }

    pub fn from_file(
        path: impl AsRef<Path>,
        replacements: &HashMap<String, String>,
    ) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let script = fs::read_to_string(path)
            .with_context(|| format!("read injection script {}", path.display()))?;
        Ok(Self::new(&script, replacements))
    }

    fn inject(&self, body: &[u8]) -> Option<Vec<u8>> {
        let insert_at = [&*HEAD_TAG, &*HTML_TAG, &*DOCTYPE_TAG]
            .iter()
            .find_map(|tag| tag.find(body))?
            .end();

        let mut out = Vec::with_capacity(body.len() + self.tagged_script.len());
        out.extend_from_slice(&body[..insert_at]);
        out.extend_from_slice(self.tagged_script.as_bytes());
        out.extend_from_slice(&body[insert_at..]);
        Some(out)
    }
}

impl Transformer for ScriptInjector {
    fn transform(&self, req: &Request<Bytes>, resp: &mut Response<Bytes>) -> anyhow::Result<()> {
        if resp.status() != StatusCode::OK {
            return Ok(());
        }
        let is_html = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.to_ascii_lowercase().starts_with("text/html"));
        if !is_html {
            return Ok(());
        }

        let url = req.uri().clone();
        let script = self.tagged_script.as_bytes();
        transform_response_body(resp, |body| {
            if body
                .windows(script.len().max(1))
                .any(|window| window == script)
            {
                return Ok(body.to_vec());
            }
            match self.inject(body) {
                Some(out) => Ok(out),
                None => {
                    tracing::warn!(url = %url, "no html/head/doctype tag found; script not injected");
                    Ok(body.to_vec())
                }
            }
        })
    }
}

/// One entry of the rules file: a URL matcher plus headers to append and
/// push intents to record.
#[derive(Debug, Deserialize)]
struct RuleDoc {
    #[serde(rename = "URL")]
    url: Option<String>,
    #[serde(rename = "URLPattern")]
    url_pattern: Option<String>,
    #[serde(rename = "ExtraHeaders", default)]
    extra_headers: HashMap<String, Vec<String>>,
    #[serde(rename = "Push", default)]
    push: Vec<PushDoc>,
}

#[derive(Debug, Deserialize)]
struct PushDoc {
    #[serde(rename = "URL")]
    url: String,
    #[serde(rename = "Headers", default)]
    headers: HashMap<String, Vec<String>>,
}

#[derive(Debug)]
enum RuleMatcher {
    Exact(String),
    Pattern(regex::Regex),
}

#[derive(Debug)]
struct Rule {
    matcher: RuleMatcher,
    extra_headers: Vec<(HeaderName, HeaderValue)>,
    push: Vec<PushIntent>,
}

#[derive(Debug)]
pub struct PushIntent {
    pub url: String,
    pub headers: Vec<(HeaderName, HeaderValue)>,
}

/// Rule-driven transformer: every matching rule appends its headers to the
/// response. Push intents are parsed and validated but not executed; the
/// handler layer has no push capability, so they are logged and dropped.
#[derive(Debug, Default)]
pub struct TransformRules {
    rules: Vec<Rule>,
}

impl TransformRules {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read rules file {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("load rules file {}", path.display()))
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let docs: Vec<RuleDoc> = serde_json::from_str(raw).context("parse rules document")?;
        let mut rules = Vec::with_capacity(docs.len());
        for (idx, doc) in docs.into_iter().enumerate() {
            rules.push(
                compile_rule(doc).with_context(|| format!("invalid rule at index {idx}"))?,
            );
        }
        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Transformer for TransformRules {
    fn transform(&self, req: &Request<Bytes>, resp: &mut Response<Bytes>) -> anyhow::Result<()> {
        let url = req.uri().to_string();
        for rule in &self.rules {
            let matched = match &rule.matcher {
                RuleMatcher::Exact(exact) => *exact == url,
                RuleMatcher::Pattern(pattern) => pattern.is_match(&url),
            };
            if !matched {
                continue;
            }

            for (name, value) in &rule.extra_headers {
                resp.headers_mut().append(name.clone(), value.clone());
            }
            for push in &rule.push {
                tracing::debug!(
                    url = %url,
                    push_url = %push.url,
                    "push promise parsed but not executed"
                );
            }
        }
        Ok(())
    }
}

fn compile_rule(doc: RuleDoc) -> anyhow::Result<Rule> {
    let matcher = match (doc.url, doc.url_pattern) {
        (Some(url), None) => RuleMatcher::Exact(url),
        (None, Some(pattern)) => RuleMatcher::Pattern(
            regex::Regex::new(&pattern)
                .with_context(|| format!("compile URLPattern `{pattern}`"))?,
        ),
        (Some(_), Some(_)) => anyhow::bail!("rule sets both URL and URLPattern"),
        (None, None) => anyhow::bail!("rule sets neither URL nor URLPattern"),
    };

    if doc.extra_headers.is_empty() && doc.push.is_empty() {
        anyhow::bail!("rule has no ExtraHeaders and no Push entries");
    }

    let extra_headers = header_pairs(doc.extra_headers)?;
    let mut push = Vec::with_capacity(doc.push.len());
    for entry in doc.push {
        let uri: Uri = entry
            .url
            .parse()
            .with_context(|| format!("parse push URL `{}`", entry.url))?;
        if !matches!(uri.scheme_str(), Some("http" | "https")) || uri.authority().is_none() {
            anyhow::bail!("push URL `{}` is not an absolute http/https URL", entry.url);
        }
        push.push(PushIntent {
            url: entry.url,
            headers: header_pairs(entry.headers)?,
        });
    }

    Ok(Rule {
        matcher,
        extra_headers,
        push,
    })
}

fn header_pairs(
    raw: HashMap<String, Vec<String>>,
) -> anyhow::Result<Vec<(HeaderName, HeaderValue)>> {
    let mut out = Vec::new();
    for (name, values) in raw {
        let header_name: HeaderName = name
            .parse()
            .with_context(|| format!("invalid header name `{name}`"))?;
        for value in values {
            let header_value = HeaderValue::from_str(&value)
                .with_context(|| format!("invalid value for header `{name}`"))?;
            out.push((header_name.clone(), header_value));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write as _;

    use bytes::Bytes;
    use hyper::{Request, Response, StatusCode, header::HeaderValue};

    use super::{
        ScriptInjector, TIME_SEED_TOKEN, TransformRules, Transformer as _,
        transform_response_body,
    };

    fn html_response(content_type: &str, body: &[u8]) -> Response<Bytes> {
        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", content_type)
            .body(Bytes::copy_from_slice(body))
            .unwrap()
    }

    fn get_request(url: &str) -> Request<Bytes> {
        Request::builder().uri(url).body(Bytes::new()).unwrap()
    }

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    fn gunzip(bytes: &[u8]) -> Vec<u8> {
        use std::io::Read as _;
        let mut out = Vec::new();
        flate2::read::GzDecoder::new(bytes)
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    #[test]
    fn construction_strips_comments_applies_replacements_and_wraps() {
        let replacements =
            HashMap::from([(TIME_SEED_TOKEN.to_owned(), "1234567890".to_owned())]);
        let injector = ScriptInjector::new(
            "/* banner */\nvar time_seed = {{WPR_TIME_SEED_TIMESTAMP}}; // trailing\r\n",
            &replacements,
        );

        assert_eq!(
            injector.tagged_script,
            "<script>\nvar time_seed = 1234567890; </script>"
        );
    }

    #[test]
    fn injects_after_head_tag_first() {
        let injector = ScriptInjector::new("var foo = 1;", &HashMap::new());
        let mut resp = html_response(
            "text/html",
            b"<html><head lang=\"en\"><title>t</title></head></html>",
        );
        injector
            .transform(&get_request("https://example.com/"), &mut resp)
            .unwrap();
        assert_eq!(
            &resp.body()[..],
            b"<html><head lang=\"en\"><script>var foo = 1;</script><title>t</title></head></html>"
                .as_slice()
        );
    }

    #[test]
    fn falls_back_to_html_then_doctype() {
        let injector = ScriptInjector::new("var foo = 1;", &HashMap::new());

        let mut resp = html_response("text/html", b"<HTML><body></body></HTML>");
        injector
            .transform(&get_request("https://example.com/"), &mut resp)
            .unwrap();
        assert_eq!(
            &resp.body()[..],
            b"<HTML><script>var foo = 1;</script><body></body></HTML>".as_slice()
        );

        let mut resp = html_response("text/html", b"<!DOCTYPE html>plain");
        injector
            .transform(&get_request("https://example.com/"), &mut resp)
            .unwrap();
        assert_eq!(
            &resp.body()[..],
            b"<!DOCTYPE html><script>var foo = 1;</script>plain".as_slice()
        );
    }

    #[test]
    fn leaves_tagless_bodies_and_non_html_responses_alone() {
        let injector = ScriptInjector::new("var foo = 1;", &HashMap::new());

        let mut tagless = html_response("text/html", b"no markup here");
        injector
            .transform(&get_request("https://example.com/"), &mut tagless)
            .unwrap();
        assert_eq!(&tagless.body()[..], b"no markup here");

        let mut json = html_response("application/json", b"{\"html\":\"<html></html>\"}");
        injector
            .transform(&get_request("https://example.com/"), &mut json)
            .unwrap();
        assert_eq!(&json.body()[..], b"{\"html\":\"<html></html>\"}");

        let mut redirect = Response::builder()
            .status(StatusCode::FOUND)
            .header("content-type", "text/html")
            .body(Bytes::from_static(b"<html></html>"))
            .unwrap();
        injector
            .transform(&get_request("https://example.com/"), &mut redirect)
            .unwrap();
        assert_eq!(&redirect.body()[..], b"<html></html>");
    }

    #[test]
    fn injection_is_idempotent() {
        let injector = ScriptInjector::new("var foo = 1;", &HashMap::new());
        let mut resp = html_response("text/html", b"<html></html>");

        injector
            .transform(&get_request("https://example.com/"), &mut resp)
            .unwrap();
        let once = resp.body().clone();
        injector
            .transform(&get_request("https://example.com/"), &mut resp)
            .unwrap();
        assert_eq!(resp.body(), &once);
    }

    #[test]
    fn injects_through_gzip_content_encoding() {
        let injector = ScriptInjector::new("var foo = 1;", &HashMap::new());
        let compressed = gzip(b"<html></html>");
        let mut resp = Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/html")
            .header("content-encoding", "gzip")
            .header("content-length", compressed.len().to_string())
            .body(Bytes::from(compressed))
            .unwrap();

        injector
            .transform(&get_request("https://example.com/"), &mut resp)
            .unwrap();

        assert_eq!(
            gunzip(resp.body()),
            b"<html><script>var foo = 1;</script></html>"
        );
        let content_length: usize = resp
            .headers()
            .get("content-length")
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(content_length, resp.body().len());
    }

    #[test]
    fn time_seed_token_is_substituted() {
        let replacements = HashMap::from([(TIME_SEED_TOKEN.to_owned(), "1502971200000".to_owned())]);
        let injector =
            ScriptInjector::new("var time_seed = {{WPR_TIME_SEED_TIMESTAMP}};", &replacements);
        let mut resp = html_response("text/html", b"<html></html>");

        injector
            .transform(&get_request("https://example.com/"), &mut resp)
            .unwrap();
        assert_eq!(
            &resp.body()[..],
            b"<html><script>var time_seed = 1502971200000;</script></html>".as_slice()
        );
    }

    #[test]
    fn body_helper_fails_without_touching_response_on_bad_encoding() {
        let mut resp = Response::builder()
            .status(StatusCode::OK)
            .header("content-encoding", "br")
            .body(Bytes::from_static(b"opaque brotli bytes"))
            .unwrap();

        let err = transform_response_body(&mut resp, |body| Ok(body.to_vec())).unwrap_err();
        assert!(err.to_string().contains("decode `br`"));
        assert_eq!(&resp.body()[..], b"opaque brotli bytes");
    }

    #[test]
    fn rules_require_exactly_one_matcher_and_some_effect() {
        let both = r#"[{"URL":"https://a/","URLPattern":".*","ExtraHeaders":{"x":["1"]}}]"#;
        assert!(
            TransformRules::from_json(both)
                .unwrap_err()
                .to_string()
                .contains("index 0")
        );

        let neither = r#"[{"ExtraHeaders":{"x":["1"]}}]"#;
        assert!(TransformRules::from_json(neither).is_err());

        let no_effect = r#"[{"URL":"https://a/"}]"#;
        assert!(TransformRules::from_json(no_effect).is_err());

        let relative_push =
            r#"[{"URL":"https://a/","Push":[{"URL":"/relative","Headers":{}}]}]"#;
        assert!(TransformRules::from_json(relative_push).is_err());
    }

    #[test]
    fn matching_rules_append_headers_without_overwriting() {
        let rules = TransformRules::from_json(
            r#"[
                {"URL":"https://example.com/page","ExtraHeaders":{"x-extra":["from-exact"]}},
                {"URLPattern":"^https://example\\.com/.*$","ExtraHeaders":{"x-extra":["from-pattern"]}},
                {"URL":"https://other.test/","ExtraHeaders":{"x-extra":["unrelated"]}}
            ]"#,
        )
        .unwrap();
        assert_eq!(rules.len(), 3);

        let mut resp = html_response("text/html", b"<html></html>");
        resp.headers_mut()
            .insert("x-extra", HeaderValue::from_static("original"));
        rules
            .transform(&get_request("https://example.com/page"), &mut resp)
            .unwrap();

        let values: Vec<_> = resp
            .headers()
            .get_all("x-extra")
            .iter()
            .map(|value| value.to_str().unwrap().to_owned())
            .collect();
        assert_eq!(values, vec!["original", "from-exact", "from-pattern"]);
    }

    #[test]
    fn push_intents_are_parsed_but_not_applied() {
        let rules = TransformRules::from_json(
            r#"[{
                "URL":"https://example.com/",
                "Push":[{"URL":"https://example.com/style.css","Headers":{"accept":["text/css"]}}]
            }]"#,
        )
        .unwrap();

        let mut resp = html_response("text/html", b"<html></html>");
        let before = resp.headers().clone();
        rules
            .transform(&get_request("https://example.com/"), &mut resp)
            .unwrap();
        assert_eq!(resp.headers(), &before);
    }
}
