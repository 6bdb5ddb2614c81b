use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::http::{Auth, Session, content_length, stream_to_file};
use crate::progress::Progress;

pub const DEFAULT_SERVER_URL: &str = "https://dataverse.harvard.edu";
const HARVARD_HOST: &str = "dataverse.harvard.edu";
const DOI_STEM: &str = "10.7910/DVN/";
const DOI_URL_PREFIX: &str = "https://doi.org/10.7910/DVN/";
const DATASET_PAGE_MARKER: &str = "/dataset.xhtml?persistentId=doi:10.7910/DVN/";

/// A Dataverse dataset reference: the six-character tag plus the hosting server
/// when the input named one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataverseDoi {
    pub server: Option<String>,
    pub tag: String,
}

impl DataverseDoi {
    pub fn persistent_id(&self) -> String {
        format!("doi:{DOI_STEM}{}", self.tag)
    }

    pub fn server_url(&self) -> String {
        match &self.server {
            Some(host) => format!("https://{host}"),
            None => DEFAULT_SERVER_URL.to_string(),
        }
    }
}

fn valid_tag(tag: &str) -> bool {
    tag.len() == 6
        && tag
            .chars()
            .all(|ch| ch.is_ascii_digit() || ch.is_ascii_uppercase())
}

/// Accepts `https://doi.org/10.7910/DVN/TAG`,
/// `https://{server}/dataset.xhtml?persistentId=doi:10.7910/DVN/TAG`, and
/// `10.7910/DVN/TAG` (a leading `doi:` is tolerated by the last form).
pub fn parse_dataverse_doi(input: &str) -> Result<DataverseDoi> {
    let input = input.trim();
    let (server, tag) = if let Some((_, tag)) = input.split_once(DOI_URL_PREFIX) {
        (Some(HARVARD_HOST.to_string()), tag)
    } else if let (Some((_, rest)), true) =
        (input.split_once("https://"), input.contains(DATASET_PAGE_MARKER))
    {
        match rest.split_once(DATASET_PAGE_MARKER) {
            Some((server, tag)) => (Some(server.to_string()), tag),
            None => bail!("invalid format: {input}"),
        }
    } else if let Some((_, tag)) = input.split_once(DOI_STEM) {
        (None, tag)
    } else {
        bail!("invalid format: {input}");
    };
    if !valid_tag(tag) {
        bail!("invalid format: {input} (tag must be 6 characters of 0-9 and A-Z)");
    }
    Ok(DataverseDoi {
        server,
        tag: tag.to_string(),
    })
}

/// Shell-style wildcard (`*`, `?`, `[...]`, `[!...]`) compiled to an anchored regex.
pub fn wildcard_regex(pattern: &str) -> Result<Regex> {
    let mut out = String::from("^");
    let chars = pattern.chars().collect::<Vec<_>>();
    let mut index = 0;
    while index < chars.len() {
        let ch = chars[index];
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                let close = chars[index + 1..]
                    .iter()
                    .enumerate()
                    .skip(1)
                    .find(|(_, ch)| **ch == ']')
                    .map(|(offset, _)| index + 1 + offset);
                match close {
                    Some(close) => {
                        out.push('[');
                        for (position, member) in chars[index + 1..close].iter().enumerate() {
                            match (position, member) {
                                (0, '!') => out.push('^'),
                                (0, '^') => out.push_str("\\^"),
                                (_, '\\' | '[' | ']') => {
                                    out.push('\\');
                                    out.push(*member);
                                }
                                (_, member) => out.push(*member),
                            }
                        }
                        out.push(']');
                        index = close;
                    }
                    None => out.push_str("\\["),
                }
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
        index += 1;
    }
    out.push('$');
    Regex::new(&out).with_context(|| format!("invalid wildcard pattern: {pattern}"))
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DataverseFile {
    pub label: String,
    #[serde(rename = "directoryLabel", default)]
    pub directory_label: Option<String>,
    #[serde(rename = "dataFile")]
    pub data_file: DataFileRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DataFileRef {
    pub id: u64,
}

impl DataverseFile {
    pub fn local_path(&self, output: &Path) -> PathBuf {
        let folder = self.directory_label.as_deref().unwrap_or(".");
        output.join(folder).join(&self.label)
    }
}

pub fn parse_dataset_files(value: &Value) -> Result<Vec<DataverseFile>> {
    let status = value.get("status").and_then(Value::as_str).unwrap_or("");
    if !status.is_empty() && status != "OK" {
        let message = value.get("message").and_then(Value::as_str).unwrap_or("");
        bail!("dataverse returned status {status}: {message}");
    }
    let files = value
        .pointer("/data/latestVersion/files")
        .cloned()
        .context("dataset response has no data.latestVersion.files")?;
    serde_json::from_value(files).context("failed to decode dataset file listing")
}

pub fn dataset_url(server_url: &str, doi: &DataverseDoi) -> String {
    format!(
        "{}/api/datasets/:persistentId/?persistentId={}",
        server_url.trim_end_matches('/'),
        doi.persistent_id()
    )
}

pub fn datafile_url(server_url: &str, id: u64) -> String {
    format!("{}/api/access/datafile/{id}", server_url.trim_end_matches('/'))
}

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub doi: String,
    pub server_url: Option<String>,
    pub pattern: String,
    pub output: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct DownloadReport {
    pub server_url: String,
    pub persistent_id: String,
    pub listed: usize,
    pub downloaded: Vec<PathBuf>,
    pub failed: Vec<(String, String)>,
}

pub fn download(session: &Session, options: &DownloadOptions) -> Result<DownloadReport> {
    let doi = parse_dataverse_doi(&options.doi)?;
    let server_url = options
        .server_url
        .clone()
        .unwrap_or_else(|| doi.server_url());
    let matcher = wildcard_regex(&options.pattern)?;
    info!(server = %server_url, doi = %doi.persistent_id(), pattern = %options.pattern, "listing dataset");

    let listing = session.get_json(&dataset_url(&server_url, &doi), &Auth::None)?;
    let files = parse_dataset_files(&listing)?;
    let mut report = DownloadReport {
        server_url: server_url.clone(),
        persistent_id: doi.persistent_id(),
        listed: files.len(),
        ..DownloadReport::default()
    };

    for file in files.iter().filter(|file| matcher.is_match(&file.label)) {
        let target = file.local_path(&options.output);
        let url = datafile_url(&server_url, file.data_file.id);
        info!(%url, file = %target.display(), "downloading");
        let result = session
            .get(&url)
            .and_then(|response| {
                response
                    .error_for_status()
                    .with_context(|| format!("failed to download {}", file.label))
            })
            .and_then(|response| {
                let mut progress = Progress::new(file.label.clone(), content_length(response.headers()));
                let bytes = stream_to_file(response, &target, &mut progress)?;
                progress.finish();
                Ok(bytes)
            });
        match result {
            Ok(_) => report.downloaded.push(target),
            Err(error) => {
                warn!(file = %file.label, %error, "download failed");
                report.failed.push((file.label.clone(), format!("{error:#}")));
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_three_doi_forms() {
        let doi = parse_dataverse_doi("https://doi.org/10.7910/DVN/JKFYMJ").expect("doi url");
        assert_eq!(doi.server.as_deref(), Some("dataverse.harvard.edu"));
        assert_eq!(doi.persistent_id(), "doi:10.7910/DVN/JKFYMJ");

        let page = parse_dataverse_doi(
            "https://dataverse.example.edu/dataset.xhtml?persistentId=doi:10.7910/DVN/CUFVKE",
        )
        .expect("dataset page");
        assert_eq!(page.server.as_deref(), Some("dataverse.example.edu"));
        assert_eq!(page.tag, "CUFVKE");
        assert_eq!(page.server_url(), "https://dataverse.example.edu");

        let bare = parse_dataverse_doi("10.7910/DVN/ABC123").expect("bare");
        assert_eq!(bare.server, None);
        assert_eq!(bare.server_url(), DEFAULT_SERVER_URL);
    }

    #[test]
    fn rejects_malformed_tags() {
        assert!(parse_dataverse_doi("10.7910/DVN/abc123").is_err());
        assert!(parse_dataverse_doi("10.7910/DVN/ABC12").is_err());
        assert!(parse_dataverse_doi("https://doi.org/10.7910/DVN/ABC1234").is_err());
        assert!(parse_dataverse_doi("10.3886/E12345V1").is_err());
    }

    #[test]
    fn wildcard_matches_like_fnmatch() {
        let csv = wildcard_regex("*.csv").expect("pattern");
        assert!(csv.is_match("data.csv"));
        assert!(!csv.is_match("data.csv.bak"));
        let single = wildcard_regex("file?.do").expect("pattern");
        assert!(single.is_match("file1.do"));
        assert!(!single.is_match("file10.do"));
        let class = wildcard_regex("[!a]*.txt").expect("pattern");
        assert!(class.is_match("b.txt"));
        assert!(!class.is_match("a.txt"));
        let literal = wildcard_regex("a+b(1).txt").expect("pattern");
        assert!(literal.is_match("a+b(1).txt"));
        assert!(wildcard_regex("*").expect("pattern").is_match("anything"));
    }

    #[test]
    fn dataset_listing_decodes_files() {
        let value = json!({
            "status": "OK",
            "data": {"latestVersion": {"files": [
                {"label": "main.do", "directoryLabel": "code", "dataFile": {"id": 11}},
                {"label": "README.pdf", "dataFile": {"id": 12, "filesize": 10}}
            ]}}
        });
        let files = parse_dataset_files(&value).expect("files");
        assert_eq!(files.len(), 2);
        assert_eq!(
            files[0].local_path(Path::new("out")),
            Path::new("out").join("code").join("main.do")
        );
        assert_eq!(
            files[1].local_path(Path::new("out")),
            Path::new("out").join(".").join("README.pdf")
        );
        assert!(parse_dataset_files(&json!({"status": "ERROR", "message": "nope"})).is_err());
    }

    #[test]
    fn api_urls_use_persistent_id() {
        let doi = parse_dataverse_doi("10.7910/DVN/CUFVKE").expect("doi");
        assert_eq!(
            dataset_url("https://dataverse.harvard.edu/", &doi),
            "https://dataverse.harvard.edu/api/datasets/:persistentId/?persistentId=doi:10.7910/DVN/CUFVKE"
        );
        assert_eq!(
            datafile_url("https://dataverse.harvard.edu", 7),
            "https://dataverse.harvard.edu/api/access/datafile/7"
        );
    }
}
