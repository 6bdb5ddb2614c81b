use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use regex::{Regex, RegexBuilder};
use reqwest::blocking::Response;
use reqwest::header;
use tracing::{debug, info, warn};

use crate::archive::{ExtractReport, extract_zip};
use crate::config::{ProjectConfig, env_non_empty, is_ci};
use crate::http::{
    Auth, Session, content_disposition_filename, content_length, content_type, header_value,
    is_file_payload, resolve_location, stream_to_file,
};
use crate::progress::Progress;
use crate::vcs::{GitRunner, commit_directory};

pub const OPENICPSR_URL: &str = "https://www.openicpsr.org/openicpsr/";
const OPENICPSR_HOST: &str = "https://www.openicpsr.org";
const DEPOSIT_ZIP_URL: &str = "https://deposit.icpsr.umich.edu/deposit/downloadZip?dirPath=/openicpsr/";
const TERMS_KEYWORDS: [&str; 5] = ["accept", "terms", "conditions", "agreement", "license"];

#[derive(Debug, Clone)]
pub struct Credentials {
    pub login: String,
    pub password: String,
}

impl Credentials {
    /// Login from `login` else `ICPSR_EMAIL`; password from `password` else `ICPSR_PASS`.
    pub fn resolve(login: Option<String>, password: Option<String>) -> Result<Self> {
        let login = login
            .filter(|value| !value.trim().is_empty())
            .or_else(|| env_non_empty("ICPSR_EMAIL"));
        let password = password
            .filter(|value| !value.is_empty())
            .or_else(|| env_non_empty("ICPSR_PASS"));
        let Some(password) = password else {
            bail!(
                "password must be passed via ICPSR_PASS or by giving a login, which prompts for it"
            );
        };
        let Some(login) = login else {
            bail!("login must be passed via ICPSR_EMAIL or as an argument");
        };
        Ok(Self { login, password })
    }
}

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub project_id: String,
    pub path: PathBuf,
    pub public: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DownloadReport {
    pub project_id: String,
    pub zip_path: PathBuf,
    pub bytes: u64,
    pub used_public_fallback: bool,
    pub extract_dir: Option<PathBuf>,
    pub extracted: Option<ExtractReport>,
    pub already_extracted: bool,
    pub committed: bool,
}

/// Trailing `/` is dropped; what remains must be all ASCII digits.
pub fn validate_project_id(raw: &str) -> Result<String> {
    let cleaned = raw.trim().trim_end_matches('/');
    if cleaned.is_empty() || !cleaned.chars().all(|ch| ch.is_ascii_digit()) {
        bail!("Project ID must be numeric. Got '{cleaned}' (example: 12345)");
    }
    Ok(cleaned.to_string())
}

pub fn resolve_project_id(arg: Option<&str>, config: &ProjectConfig) -> Result<String> {
    match arg {
        Some(raw) => validate_project_id(raw),
        None => match config.openicpsr_project() {
            Some(raw) => validate_project_id(&raw),
            None => bail!("no project ID provided via command line or config.yml"),
        },
    }
}

pub fn private_zip_url(pid: &str) -> String {
    format!("{DEPOSIT_ZIP_URL}{pid}")
}

pub fn depositor_workspace_url(pid: &str) -> String {
    format!("{OPENICPSR_URL}workspace?goToPath=/openicpsr/{pid}&goToLevel=project")
}

/// Form target of the login page: the POST form when one exists, else the first
/// `action`, else the page itself.
pub fn find_login_action(html: &str, page_url: &str) -> Result<String> {
    let post_form = RegexBuilder::new(r#"<form[^>]*action="([^"]*)"[^>]*method="post""#)
        .case_insensitive(true)
        .build()
        .context("invalid login form pattern")?;
    let any_action = Regex::new(r#"action="([^"]*)""#).context("invalid action pattern")?;
    let found = post_form
        .captures(html)
        .or_else(|| any_action.captures(html))
        .and_then(|captures| captures.get(1))
        .map(|action| action.as_str().replace("&amp;", "&"));
    match found {
        Some(action) if !action.is_empty() => resolve_location(page_url, &action),
        _ => Ok(page_url.to_string()),
    }
}

fn absolutize(url: &str) -> String {
    if url.starts_with('/') {
        format!("{OPENICPSR_HOST}{url}")
    } else {
        url.to_string()
    }
}

/// First download link for `pid` on a project page.
pub fn find_project_download_link(html: &str, pid: &str) -> Result<Option<String>> {
    let pid = regex::escape(pid);
    let patterns = [
        format!(r#"/openicpsr/project/{pid}/version/[^/]+/download[^"]*"#),
        format!(r#"/openicpsr/project/{pid}/download[^"]*"#),
        format!(r#"href="([^"]*download[^"]*{pid}[^"]*)""#),
        format!(r#"href="([^"]*{pid}[^"]*download[^"]*)""#),
    ];
    for pattern in patterns {
        let regex = Regex::new(&pattern).context("invalid download link pattern")?;
        if let Some(captures) = regex.captures(html) {
            let found = captures
                .get(1)
                .or_else(|| captures.get(0))
                .map(|found| found.as_str())
                .unwrap_or_default();
            return Ok(Some(absolutize(found)));
        }
    }
    Ok(None)
}

pub fn looks_like_terms_page(html: &str) -> bool {
    let lower = html.to_lowercase();
    TERMS_KEYWORDS.iter().any(|keyword| lower.contains(keyword))
}

/// The real download URL embedded in a terms-acceptance page.
pub fn find_terms_download_url(html: &str, pid: &str) -> Result<Option<String>> {
    let patterns = [
        r#"window\.open\(['"]([^'"]*)['"]"#,
        r#"location\.href\s*=\s*['"]([^'"]*download[^'"]*)['"]"#,
        r#"href=['"]([^'"]*download[^'"]*)['"]"#,
    ];
    for pattern in patterns {
        let regex = Regex::new(pattern).context("invalid terms page pattern")?;
        let found = regex
            .captures_iter(html)
            .filter_map(|captures| captures.get(1))
            .map(|found| found.as_str())
            .find(|candidate| candidate.contains("download") && candidate.contains(pid));
        if let Some(url) = found {
            return Ok(Some(absolutize(url)));
        }
    }
    Ok(None)
}

pub fn fallback_download_urls(pid: &str) -> Vec<String> {
    vec![
        format!("{OPENICPSR_URL}project/{pid}/version/V1/download"),
        format!("{OPENICPSR_URL}project/{pid}/download"),
        format!("{OPENICPSR_URL}project/{pid}/version/V1/download/terms"),
    ]
}

/// Cookie bootstrap, OAuth redirect, then credential POST.
pub fn login(session: &Session, credentials: &Credentials) -> Result<()> {
    info!("getting session cookies");
    session
        .get(OPENICPSR_URL)?
        .error_for_status()
        .context("openICPSR landing page failed")?;

    info!("initiating OAuth flow");
    let login_url = format!("{OPENICPSR_URL}login");
    let login_page = session
        .get_with(&login_url, &Auth::None, Some(OPENICPSR_URL))?
        .error_for_status()
        .context("openICPSR login page failed")?;
    let page_url = login_page.url().to_string();
    let html = login_page
        .text()
        .context("failed to read openICPSR login page")?;
    let action = find_login_action(&html, &page_url)?;
    debug!(%action, "submitting login form");

    info!("logging in");
    let response = session
        .post_form(
            &action,
            &[
                ("username", credentials.login.as_str()),
                ("password", credentials.password.as_str()),
            ],
            Some(&page_url),
        )?
        .error_for_status()
        .context("openICPSR login failed")?;
    if response.url().as_str().contains("openicpsr") {
        debug!(url = %response.url(), "login redirected back to openICPSR");
    } else {
        warn!(url = %response.url(), "login may have failed; continuing");
    }
    Ok(())
}

fn public_download(session: &Session, pid: &str) -> Result<Response> {
    info!("accessing project page");
    let mut project_url = format!("{OPENICPSR_URL}project/{pid}/version/V1/view");
    let mut page = session.get(&project_url)?;
    if page.status().as_u16() != 200 {
        warn!(status = page.status().as_u16(), "versioned project page failed");
        project_url = format!("{OPENICPSR_URL}project/{pid}");
        page = session.get(&project_url)?;
        if page.status().as_u16() != 200 {
            bail!(
                "failed to access project page {project_url}: HTTP {}",
                page.status().as_u16()
            );
        }
    }
    let html = page.text().context("failed to read project page")?;

    let mut candidates = Vec::new();
    if let Some(found) = find_project_download_link(&html, pid)? {
        info!(url = %found, "found download link on project page");
        candidates.push(found);
    }
    candidates.extend(fallback_download_urls(pid));

    for candidate in candidates {
        info!(url = %candidate, "trying download");
        let response = match session.get_with(&candidate, &Auth::None, Some(&project_url)) {
            Ok(response) => response,
            Err(error) => {
                warn!(url = %candidate, %error, "download attempt failed");
                continue;
            }
        };
        if response.status().as_u16() != 200 {
            debug!(status = response.status().as_u16(), "not a download");
            continue;
        }
        if is_file_payload(response.headers()) {
            return Ok(response);
        }
        let kind = content_type(response.headers());
        if !kind.starts_with("text/html") {
            debug!(content_type = %kind, "neither HTML nor a file");
            continue;
        }
        let text = response.text().unwrap_or_default();
        if !looks_like_terms_page(&text) {
            debug!("HTML page is not a terms page");
            continue;
        }
        let Some(actual) = find_terms_download_url(&text, pid)? else {
            debug!("terms page has no download URL");
            continue;
        };
        info!(url = %actual, "following download link from terms page");
        let response = session.get_with(&actual, &Auth::None, Some(&candidate))?;
        if response.status().as_u16() == 200 && is_file_payload(response.headers()) {
            return Ok(response);
        }
    }
    bail!("all download attempts failed; project {pid} may not be publicly accessible")
}

/// Log in, fetch the deposit ZIP, and unpack it next to the archive.
pub fn download(
    session: &Session,
    credentials: &Credentials,
    options: &DownloadOptions,
    git: &mut dyn GitRunner,
) -> Result<DownloadReport> {
    let pid = validate_project_id(&options.project_id)?;
    login(session, credentials)?;

    info!("accessing files");
    let response = session.get(&private_zip_url(&pid))?;
    let (response, used_public_fallback) = if response.status().as_u16() == 200 {
        (response, false)
    } else if options.public {
        warn!(
            status = response.status().as_u16(),
            "private download failed; trying public project pages"
        );
        (public_download(session, &pid)?, true)
    } else {
        bail!(
            "failed to download ZIP file (HTTP {}); verify the project ID and credentials at {}",
            response.status().as_u16(),
            depositor_workspace_url(&pid)
        );
    };

    let default_name = if used_public_fallback {
        format!("openicpsr-{pid}.zip")
    } else {
        format!("icpsr-{pid}.zip")
    };
    let filename = header_value(response.headers(), header::CONTENT_DISPOSITION.as_str())
        .and_then(|value| content_disposition_filename(&value))
        .unwrap_or(default_name);
    fs::create_dir_all(&options.path)
        .with_context(|| format!("failed to create {}", options.path.display()))?;
    let zip_path = options.path.join(&filename);
    info!(file = %zip_path.display(), "downloading");
    let mut progress = Progress::new(filename.clone(), content_length(response.headers()));
    let bytes = stream_to_file(response, &zip_path, &mut progress)?;
    progress.finish();

    let mut report = DownloadReport {
        project_id: pid.clone(),
        zip_path: zip_path.clone(),
        bytes,
        used_public_fallback,
        ..DownloadReport::default()
    };
    if used_public_fallback {
        return Ok(report);
    }

    let extract_dir = options.path.join(&pid);
    report.extract_dir = Some(extract_dir.clone());
    if extract_dir.exists() {
        info!(dir = %extract_dir.display(), "directory already exists, not extracting");
        report.already_extracted = true;
        return Ok(report);
    }
    report.extracted = Some(extract_zip(&zip_path, &extract_dir)?);

    if is_ci() {
        commit_directory(
            git,
            &extract_dir,
            &format!("[skip ci] Adding files from openICPSR project {pid}"),
        )?;
        report.committed = true;
    }
    Ok(report)
}
