use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{Duration, NaiveDate};
use regex::Regex;

const MANIFEST_EXTENSION: &str = ".sha256";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestDiff {
    pub newer: PathBuf,
    pub older: PathBuf,
    pub changed: Vec<String>,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub swapped: bool,
}

impl ManifestDiff {
    pub fn render(&self) -> String {
        let mut out = String::new();
        if self.swapped {
            out.push_str(
                "Warning: The older file has a more recent date than the newer file. Swapping terms.\n",
            );
        }
        out.push_str("Files that exist in both manifests but have different checksums:\n");
        for path in &self.changed {
            let _ = writeln!(out, "  {path}");
        }
        out.push_str("\nFiles only in newer manifest (added):\n");
        for path in &self.added {
            let _ = writeln!(out, "  {path}");
        }
        out.push_str("\nFiles only in older manifest (removed):\n");
        for path in &self.removed {
            let _ = writeln!(out, "  {path}");
        }
        out
    }
}

fn date_pattern() -> Result<Regex> {
    Regex::new(r"\.(\d{4}-\d{2}-\d{2})\.sha256$").context("invalid manifest date pattern")
}

fn date_token(path: &Path) -> Result<Option<String>> {
    let name = path.to_string_lossy();
    Ok(date_pattern()?
        .captures(&name)
        .and_then(|captures| captures.get(1))
        .map(|found| found.as_str().to_string()))
}

pub fn manifest_date(path: &Path) -> Result<NaiveDate> {
    let Some(token) = date_token(path)? else {
        bail!("Filename {} does not contain a valid date.", path.display());
    };
    NaiveDate::parse_from_str(&token, "%Y-%m-%d")
        .with_context(|| format!("Filename {} does not contain a valid date.", path.display()))
}

/// The manifest dated one day before `newer`, which must exist.
pub fn find_previous_manifest(newer: &Path) -> Result<PathBuf> {
    let date = manifest_date(newer)?;
    let Some(previous) = date.checked_sub_signed(Duration::days(1)) else {
        bail!("no day precedes {date}");
    };
    let token = date.format("%Y-%m-%d").to_string();
    let name = newer.to_string_lossy();
    let previous_path = PathBuf::from(name.replace(&token, &previous.format("%Y-%m-%d").to_string()));
    if !previous_path.exists() {
        bail!(
            "Previous manifest file {} not found.",
            previous_path.display()
        );
    }
    Ok(previous_path)
}

/// Parse `"{checksum}  {path}"` lines; anything else is ignored.
pub fn read_manifest(path: &Path) -> Result<BTreeMap<String, String>> {
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(parse_manifest(&content))
}

pub fn parse_manifest(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .filter_map(|line| {
            let (checksum, file) = line.trim().split_once("  ")?;
            Some((file.to_string(), checksum.to_string()))
        })
        .collect()
}

pub fn compare_manifests(newer: &Path, older: Option<&Path>) -> Result<ManifestDiff> {
    if !newer.to_string_lossy().ends_with(MANIFEST_EXTENSION) {
        bail!("The newer file must have a '.sha256' extension.");
    }
    let older = match older {
        Some(path) => {
            if !path.to_string_lossy().ends_with(MANIFEST_EXTENSION) {
                bail!("The older file must have a '.sha256' extension.");
            }
            path.to_path_buf()
        }
        None => find_previous_manifest(newer)?,
    };

    let mut newer = newer.to_path_buf();
    let mut older = older;
    let mut swapped = false;
    if manifest_date(&older)? > manifest_date(&newer)? {
        std::mem::swap(&mut newer, &mut older);
        swapped = true;
    }

    let newer_files = read_manifest(&newer)?;
    let older_files = read_manifest(&older)?;

    let changed = newer_files
        .iter()
        .filter(|(file, checksum)| {
            older_files
                .get(*file)
                .is_some_and(|previous| previous != *checksum)
        })
        .map(|(file, _)| file.clone())
        .collect();
    let added = newer_files
        .keys()
        .filter(|file| !older_files.contains_key(*file))
        .cloned()
        .collect();
    let removed = older_files
        .keys()
        .filter(|file| !newer_files.contains_key(*file))
        .cloned()
        .collect();

    Ok(ManifestDiff {
        newer,
        older,
        changed,
        added,
        removed,
        swapped,
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    fn write_pair(dir: &Path) -> (PathBuf, PathBuf) {
        let newer = dir.join("manifest.case.2024-03-01.sha256");
        let older = dir.join("manifest.case.2024-02-29.sha256");
        fs::write(
            &newer,
            "aaa  ./data/a.csv\nbbb2  ./code/b.do\nddd  ./new.txt\nnot a manifest line\n",
        )
        .expect("write newer");
        fs::write(&older, "aaa  ./data/a.csv\nbbb  ./code/b.do\nccc  ./gone.txt\n")
            .expect("write older");
        (newer, older)
    }

    #[test]
    fn finds_previous_manifest_across_leap_day() {
        let temp = tempdir().expect("tempdir");
        let (newer, older) = write_pair(temp.path());
        assert_eq!(find_previous_manifest(&newer).expect("previous"), older);
    }

    #[test]
    fn previous_manifest_requires_date_and_file() {
        let temp = tempdir().expect("tempdir");
        let undated = temp.path().join("manifest.sha256");
        assert!(
            find_previous_manifest(&undated)
                .expect_err("no date")
                .to_string()
                .contains("does not contain a valid date")
        );
        let lonely = temp.path().join("manifest.x.2024-01-10.sha256");
        assert!(
            find_previous_manifest(&lonely)
                .expect_err("missing")
                .to_string()
                .contains("2024-01-09")
        );
    }

    #[test]
    fn compare_reports_changed_added_removed() {
        let temp = tempdir().expect("tempdir");
        let (newer, _) = write_pair(temp.path());

        let diff = compare_manifests(&newer, None).expect("compare");

        assert!(!diff.swapped);
        assert_eq!(diff.changed, vec!["./code/b.do".to_string()]);
        assert_eq!(diff.added, vec!["./new.txt".to_string()]);
        assert_eq!(diff.removed, vec!["./gone.txt".to_string()]);
        assert_eq!(
            diff.render(),
            "Files that exist in both manifests but have different checksums:\n  ./code/b.do\n\n\
             Files only in newer manifest (added):\n  ./new.txt\n\n\
             Files only in older manifest (removed):\n  ./gone.txt\n"
        );
    }

    #[test]
    fn compare_swaps_when_dates_are_reversed() {
        let temp = tempdir().expect("tempdir");
        let (newer, older) = write_pair(temp.path());

        let diff = compare_manifests(&older, Some(&newer)).expect("compare");

        assert!(diff.swapped);
        assert_eq!(diff.newer, newer);
        assert_eq!(diff.added, vec!["./new.txt".to_string()]);
        assert!(diff.render().starts_with("Warning:"));
    }

    #[test]
    fn compare_rejects_wrong_extensions() {
        let error = compare_manifests(Path::new("manifest.md5"), None).expect_err("ext");
        assert!(error.to_string().contains("newer file must have"));
        let error = compare_manifests(
            Path::new("manifest.x.2024-01-02.sha256"),
            Some(Path::new("old.md5")),
        )
        .expect_err("ext");
        assert!(error.to_string().contains("older file must have"));
    }
}
