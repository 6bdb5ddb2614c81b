use std::collections::BTreeSet;
use std::fs;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use chrono::NaiveDate;
use regex::{Regex, RegexBuilder};
use reqwest::header::{self, HeaderMap};
use tracing::{debug, info, warn};

use crate::archive::extract_zip;
use crate::http::{
    DEFAULT_MAX_REDIRECTS, Session, content_disposition_filename, content_length, content_type,
    header_value, resolve_location, stream_to_file,
};
use crate::progress::Progress;

pub const DOI_PREFIX: &str = "10.60572";
const CATALOG_BASE: &str = "https://reproducibility.worldbank.org/index.php/catalog";
const SUFFIX: &str = r"[a-zA-Z0-9]{4}-[a-zA-Z0-9]{4}";
const PROBE_MIN_BYTES: u64 = 100;

/// DOI suffix such as `101y-vn15` from a bare suffix, a DOI, or a DOI URL.
pub fn extract_doi_suffix(input: &str) -> Result<String> {
    let input = input.trim().trim_end_matches('/');
    let bare = Regex::new(&format!("^{SUFFIX}$")).context("invalid suffix pattern")?;
    if bare.is_match(input) {
        return Ok(input.to_string());
    }
    let pattern = if input.contains("doi.org") {
        format!("/({SUFFIX})$")
    } else if input.contains("10.60572/") {
        format!(r"10\.60572/({SUFFIX})")
    } else {
        format!("({SUFFIX})$")
    };
    Regex::new(&pattern)
        .context("invalid suffix pattern")?
        .captures(input)
        .and_then(|captures| captures.get(1))
        .map(|found| found.as_str().to_string())
        .ok_or_else(|| {
            anyhow!(
                "could not extract DOI suffix from: {input} (expected 101y-vn15, 10.60572/101y-vn15, or https://doi.org/10.60572/101y-vn15)"
            )
        })
}

pub fn doi_url(suffix: &str) -> String {
    format!("https://doi.org/{DOI_PREFIX}/{suffix}")
}

pub fn download_base(catalog_id: &str) -> String {
    format!("{CATALOG_BASE}/{catalog_id}/download")
}

/// Target of an HTTP `Refresh` header such as `0;url=https://...`.
pub fn refresh_target(value: &str) -> Option<String> {
    let index = value.find("url=")?;
    let target = value[index + "url=".len()..].trim();
    if target.is_empty() { None } else { Some(target.to_string()) }
}

pub fn meta_refresh_target(html: &str) -> Result<Option<String>> {
    let regex = RegexBuilder::new(
        r#"<meta[^>]*http-equiv=["']refresh["'][^>]*content=["'][^"']*url=([^"']*)["'][^>]*>"#,
    )
    .case_insensitive(true)
    .build()
    .context("invalid meta refresh pattern")?;
    Ok(regex
        .captures(html)
        .and_then(|captures| captures.get(1))
        .map(|found| found.as_str().to_string()))
}

/// Catalog id from download links, then the URL, then any `catalog/N` reference.
pub fn find_catalog_id(page: &str, url: &str) -> Result<Option<String>> {
    let candidates = [
        (r"catalog/(\d+)/download", page),
        (r"catalog/(\d+)", url),
        (r"catalog[/=](\d+)", page),
    ];
    for (pattern, haystack) in candidates {
        let regex = Regex::new(pattern).context("invalid catalog pattern")?;
        if let Some(found) = regex.captures(haystack).and_then(|captures| captures.get(1)) {
            return Ok(Some(found.as_str().to_string()));
        }
    }
    Ok(None)
}

pub fn linked_download_ids(page: &str, catalog_id: &str) -> Result<BTreeSet<u64>> {
    let regex = Regex::new(&format!(
        r"catalog/{}/download/(\d+)",
        regex::escape(catalog_id)
    ))
    .context("invalid download id pattern")?;
    Ok(regex
        .captures_iter(page)
        .filter_map(|captures| captures.get(1))
        .filter_map(|found| found.as_str().parse::<u64>().ok())
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Pdf,
    Zip,
    Text,
    Unknown,
}

impl FileKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Zip => "zip",
            Self::Text => "text",
            Self::Unknown => "unknown",
        }
    }
}

fn disposition_of(headers: &HeaderMap) -> Option<String> {
    header_value(headers, header::CONTENT_DISPOSITION.as_str()).filter(|value| !value.is_empty())
}

/// Classify a download by its disposition filename, falling back to content type.
pub fn identify_file_type(headers: &HeaderMap) -> FileKind {
    let disposition = disposition_of(headers).unwrap_or_default();
    let filename = content_disposition_filename(&disposition)
        .unwrap_or_default()
        .to_lowercase();
    if filename.ends_with(".pdf") {
        return FileKind::Pdf;
    }
    if filename.ends_with(".zip") {
        return FileKind::Zip;
    }
    if [".txt", ".md", ".readme"]
        .iter()
        .any(|ext| filename.ends_with(ext))
    {
        return FileKind::Text;
    }
    let kind = content_type(headers);
    if kind.contains("application/pdf") {
        FileKind::Pdf
    } else if kind.contains("application/zip") {
        FileKind::Zip
    } else if kind.contains("text/plain") {
        FileKind::Text
    } else if kind.contains("application/octet-stream") {
        let disposition = disposition.to_lowercase();
        if filename.contains("readme") || disposition.contains("readme") {
            FileKind::Text
        } else if disposition.contains("zip") {
            FileKind::Zip
        } else {
            FileKind::Unknown
        }
    } else {
        FileKind::Unknown
    }
}

/// Local names for downloads; the first unnamed PDF is the README.
#[derive(Debug, Clone)]
pub struct FileNamer {
    suffix: String,
    date: NaiveDate,
    unnamed_pdfs: usize,
}

impl FileNamer {
    pub fn new(suffix: &str, date: NaiveDate) -> Self {
        Self {
            suffix: suffix.to_string(),
            date,
            unnamed_pdfs: 0,
        }
    }

    fn report_name(&self) -> String {
        format!(
            "reproducibility-wb-{}.{}.pdf",
            self.suffix,
            self.date.format("%Y-%m-%d")
        )
    }

    pub fn name(&mut self, kind: FileKind, disposition: Option<&str>, download_id: u64) -> String {
        if let Some(original) = disposition.and_then(content_disposition_filename) {
            let lower = original.to_lowercase();
            return if lower.ends_with(".pdf") && lower.contains("readme") {
                "README.pdf".to_string()
            } else if lower.ends_with(".pdf") {
                self.report_name()
            } else if lower.ends_with(".zip") {
                format!("wb-{}.zip", self.suffix)
            } else {
                original
            };
        }
        match kind {
            FileKind::Pdf => {
                self.unnamed_pdfs += 1;
                if self.unnamed_pdfs == 1 {
                    "README.pdf".to_string()
                } else {
                    self.report_name()
                }
            }
            FileKind::Zip => format!("wb-{}.zip", self.suffix),
            FileKind::Text | FileKind::Unknown => format!("download-{download_id}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CatalogInfo {
    pub final_url: String,
    pub catalog_id: String,
    pub download_ids: Vec<u64>,
    pub redirects: Vec<(String, String)>,
}

fn study_page(session: &Session, suffix: &str) -> Result<(String, String, Vec<(String, String)>)> {
    let trace = session.follow_redirects(&doi_url(suffix), DEFAULT_MAX_REDIRECTS)?;
    for (from, to) in &trace.hops {
        info!(%from, %to, "redirect");
    }
    let mut final_url = trace.final_url;
    let (status, headers, mut page) = session.fetch_text(&final_url)?;
    if status.as_u16() != 200 {
        bail!("HTTP {} at final URL: {final_url}", status.as_u16());
    }

    if final_url.contains("/catalog/study/") {
        let target = match header_value(&headers, "refresh") {
            Some(refresh) => Some(
                refresh_target(&refresh)
                    .ok_or_else(|| anyhow!("could not parse refresh header: {refresh}"))?,
            ),
            None => meta_refresh_target(&page)?,
        };
        let Some(target) = target else {
            let study = final_url
                .split("/catalog/study/")
                .nth(1)
                .and_then(|rest| rest.split(['/', '?']).next())
                .unwrap_or("");
            bail!("could not resolve study URL to a catalog URL for study ID: {study}");
        };
        let target = resolve_location(&final_url, &target)?;
        info!(url = %target, "following refresh to catalog");
        let (status, _, text) = session.fetch_text(&target)?;
        if status.as_u16() != 200 {
            bail!("failed to access catalog URL {target} (HTTP {})", status.as_u16());
        }
        final_url = target;
        page = text;
    }
    if page.trim().is_empty() {
        bail!("empty page content received from {final_url}");
    }
    Ok((final_url, page, trace.hops))
}

/// Probe candidates: two below the lowest linked id through two above the highest.
pub fn probe_range(linked: &BTreeSet<u64>) -> Option<RangeInclusive<u64>> {
    let (min, max) = (linked.first()?, linked.last()?);
    Some(min.saturating_sub(2)..=max.saturating_add(2))
}

/// Follow the DOI to its catalog page and collect the download ids it exposes,
/// widened by probing neighbouring ids that belong to the same study.
pub fn resolve_catalog(session: &Session, suffix: &str) -> Result<CatalogInfo> {
    let (final_url, page, redirects) = study_page(session, suffix)?;
    let Some(catalog_id) = find_catalog_id(&page, &final_url)? else {
        bail!("could not extract catalog ID from {final_url}");
    };
    info!(%catalog_id, "catalog resolved");

    let linked = linked_download_ids(&page, &catalog_id)?;
    debug!(?linked, "download ids linked from catalog page");
    let mut ids = linked.clone();
    if let Some(range) = probe_range(&linked) {
        let base = download_base(&catalog_id);
        let suffix_lower = suffix.to_lowercase();
        for candidate in range {
            if ids.contains(&candidate) {
                continue;
            }
            let Ok(response) = session.head(&format!("{base}/{candidate}")) else {
                continue;
            };
            if response.status().as_u16() != 200 {
                continue;
            }
            let size = content_length(response.headers()).unwrap_or(0);
            let filename = disposition_of(response.headers())
                .and_then(|value| content_disposition_filename(&value))
                .unwrap_or_default()
                .to_lowercase();
            if size > PROBE_MIN_BYTES && filename.contains(&suffix_lower) {
                info!(id = candidate, size, %filename, "found unlinked download");
                ids.insert(candidate);
            }
        }
    }
    if ids.is_empty() {
        bail!("could not find any download links on {final_url}");
    }
    Ok(CatalogInfo {
        final_url,
        catalog_id,
        download_ids: ids.into_iter().collect(),
        redirects,
    })
}

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub input: String,
    pub output: PathBuf,
    pub dry_run: bool,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFile {
    pub download_id: u64,
    pub kind: FileKind,
    pub size: Option<u64>,
    pub disposition: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DownloadReport {
    pub suffix: String,
    pub output_dir: PathBuf,
    pub catalog_id: String,
    pub catalog_url: String,
    pub redirects: Vec<(String, String)>,
    pub planned: Vec<PlannedFile>,
    pub downloaded: Vec<String>,
    pub extracted: Vec<String>,
    pub failed: Vec<(u64, String)>,
}

impl DownloadReport {
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}

fn inspect(session: &Session, url: &str, download_id: u64) -> Result<PlannedFile> {
    let response = session.head(url)?;
    let headers = response.headers();
    Ok(PlannedFile {
        download_id,
        kind: identify_file_type(headers),
        size: content_length(headers),
        disposition: disposition_of(headers),
    })
}

fn fetch_one(
    session: &Session,
    url: &str,
    path: &Path,
    label: &str,
) -> Result<u64> {
    let response = session
        .get(url)?
        .error_for_status()
        .with_context(|| format!("download of {label} failed"))?;
    let mut progress = Progress::new(label, content_length(response.headers()));
    let bytes = stream_to_file(response, path, &mut progress)?;
    progress.finish();
    Ok(bytes)
}

pub fn download(session: &Session, options: &DownloadOptions) -> Result<DownloadReport> {
    let suffix = extract_doi_suffix(&options.input)?;
    let output_dir = options.output.join(format!("wb-{suffix}"));
    if !options.dry_run {
        if output_dir.exists() {
            bail!(
                "{} already exists - please remove prior to downloading",
                output_dir.display()
            );
        }
        fs::create_dir_all(&output_dir)
            .with_context(|| format!("failed to create {}", output_dir.display()))?;
    }

    let catalog = resolve_catalog(session, &suffix)?;
    let base = download_base(&catalog.catalog_id);
    let mut report = DownloadReport {
        suffix: suffix.clone(),
        output_dir: output_dir.clone(),
        catalog_id: catalog.catalog_id.clone(),
        catalog_url: catalog.final_url.clone(),
        redirects: catalog.redirects.clone(),
        ..DownloadReport::default()
    };

    if options.dry_run {
        for id in &catalog.download_ids {
            match inspect(session, &format!("{base}/{id}"), *id) {
                Ok(planned) => report.planned.push(planned),
                Err(error) => report.failed.push((*id, format!("{error:#}"))),
            }
        }
        return Ok(report);
    }

    let mut namer = FileNamer::new(&suffix, options.date);
    for id in &catalog.download_ids {
        let url = format!("{base}/{id}");
        let planned = match inspect(session, &url, *id) {
            Ok(planned) => planned,
            Err(error) => {
                warn!(id, %error, "could not inspect download");
                report.failed.push((*id, format!("{error:#}")));
                continue;
            }
        };
        let filename = namer.name(planned.kind, planned.disposition.as_deref(), *id);
        let path = output_dir.join(&filename);
        info!(id, kind = planned.kind.as_str(), file = %filename, "downloading");
        if let Err(error) = fetch_one(session, &url, &path, &filename) {
            warn!(id, %error, "download failed");
            report.failed.push((*id, format!("{error:#}")));
            continue;
        }
        report.downloaded.push(filename.clone());
        if planned.kind == FileKind::Zip {
            match extract_zip(&path, &output_dir) {
                Ok(_) => report.extracted.push(filename),
                Err(error) => warn!(file = %filename, %error, "failed to unzip"),
            }
        }
        report.planned.push(planned);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use reqwest::header::{HeaderMap, HeaderValue};

    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 1).expect("date")
    }

    #[test]
    fn doi_suffix_accepts_all_input_forms() {
        for input in [
            "101y-vn15",
            "101y-vn15/",
            "https://doi.org/10.60572/101y-vn15",
            "10.60572/101y-vn15",
            "doi:10.60572/101y-vn15",
            "wb-101y-vn15",
        ] {
            assert_eq!(extract_doi_suffix(input).expect(input), "101y-vn15");
        }
        assert!(extract_doi_suffix("not-a-doi").is_err());
        assert!(extract_doi_suffix("https://doi.org/10.60572/101y-vn15x").is_err());
    }

    #[test]
    fn refresh_targets_are_parsed() {
        assert_eq!(
            refresh_target("0;url=https://reproducibility.worldbank.org/index.php/catalog/254"),
            Some("https://reproducibility.worldbank.org/index.php/catalog/254".to_string())
        );
        assert_eq!(refresh_target("5"), None);
        let html = r#"<head><META HTTP-EQUIV="refresh" content="0; url=/index.php/catalog/77"></head>"#;
        assert_eq!(
            meta_refresh_target(html).expect("meta"),
            Some("/index.php/catalog/77".to_string())
        );
    }

    #[test]
    fn catalog_id_prefers_download_links_then_url() {
        let page = r#"<a href="/index.php/catalog/254/download/1046">x</a> catalog=9"#;
        assert_eq!(
            find_catalog_id(page, "https://x/catalog/study/ABC").expect("find"),
            Some("254".to_string())
        );
        assert_eq!(
            find_catalog_id("nothing here", "https://x/index.php/catalog/31").expect("find"),
            Some("31".to_string())
        );
        assert_eq!(
            find_catalog_id("see catalog=12", "https://x/").expect("find"),
            Some("12".to_string())
        );
        assert_eq!(find_catalog_id("", "https://x/").expect("find"), None);
    }

    #[test]
    fn probe_range_widens_linked_ids_without_overflow() {
        assert_eq!(probe_range(&BTreeSet::new()), None);
        assert_eq!(probe_range(&BTreeSet::from([1, 5])), Some(0..=7));
        assert_eq!(
            probe_range(&BTreeSet::from([u64::MAX - 1])),
            Some(u64::MAX - 3..=u64::MAX)
        );
    }

    #[test]
    fn linked_download_ids_are_unique_and_sorted() {
        let page = "catalog/254/download/1047 catalog/254/download/1046 \
                    catalog/254/download/1047 catalog/999/download/5";
        let ids = linked_download_ids(page, "254").expect("ids");
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![1046, 1047]);
    }

    #[test]
    fn file_type_uses_filename_before_content_type() {
        assert_eq!(
            identify_file_type(&headers(&[
                ("content-type", "application/octet-stream"),
                ("content-disposition", "attachment; filename=\"Report.PDF\""),
            ])),
            FileKind::Pdf
        );
        assert_eq!(
            identify_file_type(&headers(&[("content-type", "application/zip")])),
            FileKind::Zip
        );
        assert_eq!(
            identify_file_type(&headers(&[
                ("content-type", "application/octet-stream"),
                ("content-disposition", "attachment; filename=README"),
            ])),
            FileKind::Text
        );
        assert_eq!(
            identify_file_type(&headers(&[("content-type", "application/octet-stream")])),
            FileKind::Unknown
        );
    }

    #[test]
    fn namer_follows_disposition_then_kind() {
        let mut namer = FileNamer::new("101y-vn15", date());
        assert_eq!(
            namer.name(FileKind::Pdf, Some("attachment; filename=\"ReadMe_study.pdf\""), 1),
            "README.pdf"
        );
        assert_eq!(
            namer.name(FileKind::Pdf, Some("attachment; filename=verification.pdf"), 2),
            "reproducibility-wb-101y-vn15.2025-06-01.pdf"
        );
        assert_eq!(
            namer.name(FileKind::Zip, Some("attachment; filename=package.zip"), 3),
            "wb-101y-vn15.zip"
        );
        assert_eq!(
            namer.name(FileKind::Text, Some("attachment; filename=notes.txt"), 4),
            "notes.txt"
        );
    }

    #[test]
    fn namer_without_disposition_numbers_pdfs() {
        let mut namer = FileNamer::new("abcd-1234", date());
        assert_eq!(namer.name(FileKind::Pdf, None, 1), "README.pdf");
        assert_eq!(
            namer.name(FileKind::Pdf, None, 2),
            "reproducibility-wb-abcd-1234.2025-06-01.pdf"
        );
        assert_eq!(namer.name(FileKind::Zip, None, 3), "wb-abcd-1234.zip");
        assert_eq!(namer.name(FileKind::Unknown, None, 4), "download-4");
    }
}
