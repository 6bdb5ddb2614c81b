use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use serde_json::Value;
use tracing::{info, warn};

use crate::checksum::{ExpectedChecksum, ManifestEntry, ManifestFiles, file_matches, write_manifests};
use crate::config::{env_non_empty, is_ci};
use crate::http::{Auth, Session, content_length, stream_to_file};
use crate::progress::Progress;
use crate::vcs::{GitRunner, commit_directory};

pub const PRODUCTION_API: &str = "https://zenodo.org/api";
pub const SANDBOX_API: &str = "https://sandbox.zenodo.org/api";

/// `--access-token`, then `ZENODO_ACCESS_TOKEN`, then `ZENODO_TOKEN`.
pub fn resolve_token(arg: Option<&str>) -> Option<String> {
    arg.map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
        .or_else(|| env_non_empty("ZENODO_ACCESS_TOKEN"))
        .or_else(|| env_non_empty("ZENODO_TOKEN"))
}

/// Record URLs collapse to their last path segment.
pub fn normalize_record_id(raw: &str) -> String {
    let raw = raw.trim();
    if raw.contains("zenodo.org") {
        raw.trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(raw)
            .to_string()
    } else {
        raw.to_string()
    }
}

/// `"1,3,5"` to the set of 1-based file numbers.
pub fn parse_selection(raw: &str) -> Result<BTreeSet<usize>> {
    raw.split(',')
        .map(|part| {
            part.trim().parse::<usize>().with_context(|| {
                format!("invalid file selection {raw:?}; use comma-separated numbers such as 1,3,5")
            })
        })
        .collect()
}

pub fn api_base(sandbox: bool) -> &'static str {
    if sandbox { SANDBOX_API } else { PRODUCTION_API }
}

pub fn record_url(base: &str, record_id: &str, published: bool) -> String {
    if published {
        format!("{base}/records/{record_id}")
    } else {
        format!("{base}/deposit/depositions/{record_id}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub filename: String,
    pub size: u64,
    pub checksum: String,
    pub download_url: String,
}

fn string_field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| value.pointer(key).and_then(Value::as_str))
}

/// File entries of a deposition (`filename`/`filesize`/`links.download`) or a
/// published record (`key`/`size`/`links.self`).
pub fn parse_record_files(record: &Value) -> Result<Vec<RemoteFile>> {
    let Some(files) = record.get("files") else {
        return Ok(Vec::new());
    };
    let entries: &[Value] = match files {
        Value::Array(entries) => entries.as_slice(),
        Value::Object(map) => match map.get("entries") {
            Some(Value::Array(entries)) => entries.as_slice(),
            _ => &[],
        },
        _ => &[],
    };
    let mut output = Vec::with_capacity(entries.len());
    for entry in entries {
        let filename = string_field(entry, &["/filename", "/key"])
            .context("file entry without a name")?
            .to_string();
        let download_url = string_field(entry, &["/links/download", "/links/self", "/links/content"])
            .with_context(|| format!("file {filename} has no download link"))?
            .to_string();
        let size = ["/filesize", "/size"]
            .iter()
            .find_map(|key| entry.pointer(key).and_then(Value::as_u64))
            .unwrap_or(0);
        let checksum = string_field(entry, &["/checksum"]).unwrap_or("").to_string();
        output.push(RemoteFile {
            filename,
            size,
            checksum,
            download_url,
        });
    }
    Ok(output)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFile {
    pub number: usize,
    pub remote: RemoteFile,
    pub local_path: PathBuf,
    pub selected: bool,
    pub exists: bool,
}

/// Number files from 1 and mark which are selected and already present intact.
pub fn plan_downloads(
    files: &[RemoteFile],
    selection: Option<&BTreeSet<usize>>,
    output_dir: &Path,
) -> Vec<PlannedFile> {
    let mut plan = Vec::with_capacity(files.len());
    for (index, remote) in files.iter().enumerate() {
        let number = index + 1;
        let selected = selection.is_none_or(|chosen| chosen.contains(&number));
        let local_path = output_dir.join(&remote.filename);
        let exists = selected
            && match ExpectedChecksum::parse(&remote.checksum) {
                Ok(expected) => file_matches(&local_path, expected.as_ref()).unwrap_or(false),
                Err(error) => {
                    warn!(file = %remote.filename, %error, "cannot verify existing file");
                    false
                }
            };
        plan.push(PlannedFile {
            number,
            remote: remote.clone(),
            local_path,
            selected,
            exists,
        });
    }
    plan
}

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub record_id: String,
    pub access_token: Option<String>,
    pub sandbox: bool,
    pub published: bool,
    pub output: PathBuf,
    pub generated_dir: PathBuf,
    pub dry_run: bool,
    pub selection: Option<BTreeSet<usize>>,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, Default)]
pub struct DownloadReport {
    pub record_id: String,
    pub api_base: String,
    pub output_dir: PathBuf,
    pub plan: Vec<PlannedFile>,
    pub downloaded: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub manifests: ManifestFiles,
    pub committed: bool,
}

impl DownloadReport {
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}

pub fn fetch_record(session: &Session, url: &str, auth: &Auth, record_id: &str) -> Result<Value> {
    info!(%url, "fetching record metadata");
    let response = session.get_with(url, auth, None)?;
    match response.status().as_u16() {
        200 => response
            .json::<Value>()
            .with_context(|| format!("failed to decode record {record_id}")),
        401 => bail!("unauthorized; check the Zenodo access token"),
        404 => bail!("record {record_id} not found"),
        status => {
            let body = response.text().unwrap_or_default();
            bail!("HTTP {status} - {}", body.trim())
        }
    }
}

fn fetch_file(session: &Session, file: &PlannedFile, auth: &Auth) -> Result<u64> {
    let response = session
        .get_with(&file.remote.download_url, auth, None)?
        .error_for_status()
        .with_context(|| format!("error downloading {}", file.remote.filename))?;
    let total = content_length(response.headers()).or(Some(file.remote.size));
    let mut progress = Progress::new(file.remote.filename.clone(), total);
    let bytes = stream_to_file(response, &file.local_path, &mut progress)?;
    progress.finish();
    Ok(bytes)
}

pub fn download(
    session: &Session,
    options: &DownloadOptions,
    git: &mut dyn GitRunner,
) -> Result<DownloadReport> {
    let record_id = normalize_record_id(&options.record_id);
    if record_id.is_empty() {
        bail!("no Zenodo record ID given");
    }
    let auth = match (&options.access_token, options.published) {
        (Some(token), _) => Auth::Bearer(token.clone()),
        (None, true) => Auth::None,
        (None, false) => bail!(
            "no access token provided; pass --access-token or set ZENODO_ACCESS_TOKEN or ZENODO_TOKEN (a .env file works too)"
        ),
    };
    let base = api_base(options.sandbox);
    let dir_name = format!("zenodo-{record_id}");
    let output_dir = options.output.join(&dir_name);

    let record = fetch_record(
        session,
        &record_url(base, &record_id, options.published),
        &auth,
        &record_id,
    )?;
    let files = parse_record_files(&record)?;
    let plan = plan_downloads(&files, options.selection.as_ref(), &output_dir);
    let mut report = DownloadReport {
        record_id: record_id.clone(),
        api_base: base.to_string(),
        output_dir: output_dir.clone(),
        plan,
        ..DownloadReport::default()
    };
    if options.dry_run || report.plan.is_empty() {
        return Ok(report);
    }

    fs::create_dir_all(&output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;
    let selected = report
        .plan
        .iter()
        .filter(|file| file.selected)
        .cloned()
        .collect::<Vec<_>>();
    for file in &selected {
        if file.exists {
            info!(file = %file.remote.filename, "already present with matching checksum");
            report.skipped.push(file.remote.filename.clone());
            continue;
        }
        info!(file = %file.remote.filename, "downloading");
        match fetch_file(session, file, &auth) {
            Ok(_) => report.downloaded.push(file.remote.filename.clone()),
            Err(error) => {
                warn!(file = %file.remote.filename, %error, "download failed");
                report
                    .failed
                    .push((file.remote.filename.clone(), format!("{error:#}")));
            }
        }
    }

    let mut entries = Vec::with_capacity(selected.len());
    for file in &selected {
        entries.push(ManifestEntry {
            relative: file.remote.filename.clone(),
            local_path: file.local_path.clone(),
            size: file.remote.size,
            // Unsupported algorithms fall back to hashing the local copy.
            checksum: ExpectedChecksum::parse(&file.remote.checksum).ok().flatten(),
        });
    }
    report.manifests = write_manifests(&options.generated_dir, &dir_name, options.date, &entries)?;

    if !report.has_failures() && is_ci() {
        let message = if options.published {
            format!("[skip ci] Adding files from Zenodo record {record_id}")
        } else {
            format!("[skip ci] Adding files from Zenodo draft deposit {record_id}")
        };
        commit_directory(git, &output_dir, &message)?;
        report.committed = true;
    }
    Ok(report)
}
