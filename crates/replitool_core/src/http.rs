use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{StatusCode, Url, redirect};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{DEFAULT_USER_AGENT, env_value, env_value_u64, env_value_usize};
use crate::progress::ProgressSink;

const CHUNK_SIZE: usize = 8192;
pub const DEFAULT_MAX_REDIRECTS: usize = 10;

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub retries: usize,
    pub retry_delay_ms: u64,
    pub user_agent: String,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            connect_timeout_ms: 15_000,
            retries: 2,
            retry_delay_ms: 500,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl HttpSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            timeout_ms: env_value_u64("REPLITOOL_HTTP_TIMEOUT_MS", defaults.timeout_ms),
            connect_timeout_ms: defaults.connect_timeout_ms,
            retries: env_value_usize("REPLITOOL_HTTP_RETRIES", defaults.retries),
            retry_delay_ms: env_value_u64("REPLITOOL_HTTP_RETRY_DELAY_MS", defaults.retry_delay_ms),
            user_agent: env_value("REPLITOOL_USER_AGENT", &defaults.user_agent),
        }
    }

    /// Backoff before retry `attempt` (0-based): delay * 2^attempt, plus up to 99 ms jitter.
    pub fn retry_delay(&self, attempt: usize) -> Duration {
        let exponent = u32::try_from(attempt).unwrap_or(16).min(16);
        let base = self
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        Duration::from_millis(base.saturating_add(jitter))
    }
}

#[derive(Debug, Clone, Default)]
pub enum Auth {
    #[default]
    None,
    Bearer(String),
    Basic {
        username: String,
        password: String,
    },
}

impl Auth {
    fn apply(&self, builder: RequestBuilder) -> RequestBuilder {
        match self {
            Self::None => builder,
            Self::Bearer(token) => builder.bearer_auth(token),
            Self::Basic { username, password } => builder.basic_auth(username, Some(password)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RedirectTrace {
    pub final_url: String,
    pub hops: Vec<(String, String)>,
}

/// Cookie-carrying browser-like session shared by the scraping downloaders.
pub struct Session {
    client: Client,
    no_redirect: Client,
    settings: HttpSettings,
}

impl Session {
    pub fn from_env() -> Result<Self> {
        Self::new(HttpSettings::from_env())
    }

    pub fn new(settings: HttpSettings) -> Result<Self> {
        let headers = browser_headers(&settings.user_agent)?;
        let client = Client::builder()
            .cookie_store(true)
            .default_headers(headers.clone())
            .connect_timeout(Duration::from_millis(settings.connect_timeout_ms))
            .timeout(Option::<Duration>::None)
            .build()
            .context("failed to build HTTP client")?;
        let no_redirect = Client::builder()
            .cookie_store(true)
            .default_headers(headers)
            .redirect(redirect::Policy::none())
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()
            .context("failed to build non-redirecting HTTP client")?;
        Ok(Self {
            client,
            no_redirect,
            settings,
        })
    }

    pub fn get(&self, url: &str) -> Result<Response> {
        self.get_with(url, &Auth::None, None)
    }

    /// GET following redirects. Non-retryable HTTP statuses are returned to the caller.
    pub fn get_with(&self, url: &str, auth: &Auth, referer: Option<&str>) -> Result<Response> {
        self.send_with_retry(url, || {
            let mut builder = auth.apply(self.client.get(url));
            if let Some(referer) = referer {
                builder = builder.header(header::REFERER, referer);
            }
            builder
        })
    }

    pub fn head(&self, url: &str) -> Result<Response> {
        self.send_with_retry(url, || {
            self.client
                .head(url)
                .timeout(Duration::from_millis(self.settings.timeout_ms))
        })
    }

    pub fn post_form(
        &self,
        url: &str,
        form: &[(&str, &str)],
        referer: Option<&str>,
    ) -> Result<Response> {
        // Credentials are posted once; a replayed login can lock accounts.
        let mut builder = self
            .client
            .post(url)
            .form(form)
            .timeout(Duration::from_millis(self.settings.timeout_ms));
        if let Some(referer) = referer {
            builder = builder.header(header::REFERER, referer);
        }
        builder
            .send()
            .with_context(|| format!("failed to POST {url}"))
    }

    /// GET a JSON document; any non-success status is an error carrying the body.
    pub fn get_json(&self, url: &str, auth: &Auth) -> Result<Value> {
        let response = self.send_with_retry(url, || {
            auth.apply(self.client.get(url))
                .header(header::ACCEPT, "application/json")
                .timeout(Duration::from_millis(self.settings.timeout_ms))
        })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!("HTTP {} from {url}: {}", status.as_u16(), truncate(&body, 300));
        }
        response
            .json::<Value>()
            .with_context(|| format!("failed to decode JSON from {url}"))
    }

    pub fn fetch_text(&self, url: &str) -> Result<(StatusCode, HeaderMap, String)> {
        let response = self.get(url)?;
        let status = response.status();
        let headers = response.headers().clone();
        let text = response
            .text()
            .with_context(|| format!("failed to read body of {url}"))?;
        Ok((status, headers, text))
    }

    /// Walk redirects hop by hop so each one can be reported.
    pub fn follow_redirects(&self, url: &str, max_redirects: usize) -> Result<RedirectTrace> {
        let mut current = url.to_string();
        let mut hops = Vec::new();
        while hops.len() < max_redirects {
            let response = self
                .no_redirect
                .get(&current)
                .send()
                .with_context(|| format!("failed to GET {current}"))?;
            let status = response.status();
            if status.is_redirection() {
                let Some(location) = header_value(response.headers(), header::LOCATION.as_str())
                else {
                    bail!("HTTP {} at {current} without a Location header", status.as_u16());
                };
                let next = resolve_location(&current, &location)?;
                debug!(from = %current, to = %next, "redirect");
                hops.push((current.clone(), next.clone()));
                current = next;
                continue;
            }
            if status == StatusCode::OK {
                return Ok(RedirectTrace {
                    final_url: current,
                    hops,
                });
            }
            bail!("HTTP {} at {current}", status.as_u16());
        }
        bail!("too many redirects starting from {url}")
    }

    fn send_with_retry<F>(&self, url: &str, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let retries = self.settings.retries;
        for attempt in 0..=retries {
            match build().send() {
                Ok(response) => {
                    let status = response.status();
                    if attempt < retries && is_retryable_status(status) {
                        warn!(%url, status = status.as_u16(), attempt, "retrying request");
                        sleep(self.settings.retry_delay(attempt));
                        continue;
                    }
                    return Ok(response);
                }
                Err(error) => {
                    if attempt < retries && is_retryable_error(&error) {
                        warn!(%url, %error, attempt, "retrying request");
                        sleep(self.settings.retry_delay(attempt));
                        continue;
                    }
                    return Err(error).with_context(|| format!("request to {url} failed"));
                }
            }
        }
        bail!("request to {url} exhausted retry budget")
    }
}

fn browser_headers(user_agent: &str) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::ACCEPT,
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
        ),
    );
    headers.insert(
        header::ACCEPT_LANGUAGE,
        HeaderValue::from_static("en-US,en;q=0.9"),
    );
    headers.insert(header::DNT, HeaderValue::from_static("1"));
    headers.insert(
        header::UPGRADE_INSECURE_REQUESTS,
        HeaderValue::from_static("1"),
    );
    headers.insert(
        header::USER_AGENT,
        HeaderValue::from_str(user_agent)
            .with_context(|| format!("invalid user agent: {user_agent}"))?,
    );
    Ok(headers)
}

pub fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect()
}

pub fn resolve_location(current: &str, location: &str) -> Result<String> {
    let base = Url::parse(current).with_context(|| format!("invalid URL: {current}"))?;
    let joined = base
        .join(location)
        .with_context(|| format!("invalid redirect target {location} from {current}"))?;
    Ok(joined.to_string())
}

pub fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(ToString::to_string)
}

pub fn content_length(headers: &HeaderMap) -> Option<u64> {
    header_value(headers, header::CONTENT_LENGTH.as_str())
        .and_then(|value| value.trim().parse::<u64>().ok())
}

pub fn content_type(headers: &HeaderMap) -> String {
    header_value(headers, header::CONTENT_TYPE.as_str())
        .unwrap_or_default()
        .to_ascii_lowercase()
}

/// Filename carried by a Content-Disposition header, if any.
pub fn content_disposition_filename(disposition: &str) -> Option<String> {
    if let Some(index) = disposition.find("filename*=") {
        let raw = disposition[index + "filename*=".len()..]
            .split(';')
            .next()
            .unwrap_or("")
            .trim();
        let encoded = raw.rsplit("''").next().unwrap_or(raw);
        let decoded = percent_decode(encoded.trim_matches('"'));
        if !decoded.is_empty() {
            return Some(decoded);
        }
    }
    let index = disposition.find("filename=")?;
    let raw = disposition[index + "filename=".len()..]
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .trim_matches('"')
        .trim_matches('\'')
        .to_string();
    if raw.is_empty() { None } else { Some(raw) }
}

pub fn is_file_payload(headers: &HeaderMap) -> bool {
    let content_type = content_type(headers);
    let disposition = header_value(headers, header::CONTENT_DISPOSITION.as_str()).unwrap_or_default();
    content_type.contains("application/zip")
        || content_type.contains("application/octet-stream")
        || disposition.contains("attachment")
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut output = Vec::with_capacity(bytes.len());
    let mut index = 0usize;
    while index < bytes.len() {
        if bytes[index] == b'%'
            && let (Some(high), Some(low)) = (
                bytes.get(index + 1).and_then(|byte| hex_digit(*byte)),
                bytes.get(index + 2).and_then(|byte| hex_digit(*byte)),
            )
        {
            output.push((high << 4) | low);
            index += 3;
            continue;
        }
        output.push(bytes[index]);
        index += 1;
    }
    String::from_utf8_lossy(&output).into_owned()
}

fn hex_digit(byte: u8) -> Option<u8> {
    char::from(byte).to_digit(16).and_then(|digit| u8::try_from(digit).ok())
}

/// Stream `reader` into `path` via a `.part` sibling, renamed into place once complete.
/// A failed transfer removes the `.part` file.
pub fn stream_to_file<R: Read, P: ProgressSink + ?Sized>(
    mut reader: R,
    path: &Path,
    progress: &mut P,
) -> Result<u64> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let partial = partial_path(path);
    let written = match write_partial(&mut reader, path, &partial, progress) {
        Ok(written) => written,
        Err(error) => {
            if let Err(remove_error) = fs::remove_file(&partial) {
                debug!(path = %partial.display(), %remove_error, "could not remove partial download");
            }
            return Err(error);
        }
    };
    fs::rename(&partial, path).with_context(|| {
        format!(
            "failed to move {} into place at {}",
            partial.display(),
            path.display()
        )
    })?;
    Ok(written)
}

fn write_partial<R: Read, P: ProgressSink + ?Sized>(
    reader: &mut R,
    path: &Path,
    partial: &Path,
    progress: &mut P,
) -> Result<u64> {
    let file = File::create(partial)
        .with_context(|| format!("failed to create {}", partial.display()))?;
    let mut writer = BufWriter::new(file);
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut written = 0u64;
    loop {
        let read = reader
            .read(&mut buffer)
            .with_context(|| format!("failed while downloading {}", path.display()))?;
        if read == 0 {
            break;
        }
        writer
            .write_all(&buffer[..read])
            .with_context(|| format!("failed to write {}", partial.display()))?;
        written += read as u64;
        progress.advance(read as u64);
    }
    writer
        .flush()
        .with_context(|| format!("failed to flush {}", partial.display()))?;
    Ok(written)
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    path.with_file_name(name)
}

fn truncate(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        value.to_string()
    } else {
        let mut output = value.chars().take(limit).collect::<String>();
        output.push('…');
        output
    }
}
