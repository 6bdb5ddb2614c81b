use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use crate::archive::{ExtractReport, clear_directory, extract_zip, find_zip_files};
use crate::config::{ProjectConfig, env_value};
use crate::jira::{JiraApi, Keyword, get_info};
use crate::vcs::{GitRunner, checkout_branch, commit_staged};

const CASE_PREFIX: &str = "aearep-";

pub trait SivacorCli {
    /// Fetch every artifact of `submission_id` into `dir`.
    fn download_all(&mut self, submission_id: &str, dir: &Path) -> Result<()>;
}

/// The `sivacor` executable, or whatever `SIVACOR_CLI` names.
#[derive(Debug, Clone)]
pub struct SystemSivacor {
    program: String,
}

impl SystemSivacor {
    pub fn from_env() -> Self {
        Self {
            program: env_value("SIVACOR_CLI", "sivacor"),
        }
    }
}

impl SivacorCli for SystemSivacor {
    fn download_all(&mut self, submission_id: &str, dir: &Path) -> Result<()> {
        info!(program = %self.program, submission_id, dir = %dir.display(), "downloading artifacts");
        let status = Command::new(&self.program)
            .args(["submission", "get", submission_id, "--download", "all"])
            .current_dir(dir)
            .status()
            .with_context(|| format!("failed to run {}", self.program))?;
        if !status.success() {
            bail!("{} exited with {status}", self.program);
        }
        Ok(())
    }
}

/// Case from the argument, an `aearep-*` working directory, or `jiraticket`.
pub fn resolve_jira_case(arg: Option<&str>, cwd: &Path, config: &ProjectConfig) -> Result<String> {
    if let Some(case) = arg.map(str::trim).filter(|value| !value.is_empty()) {
        return Ok(case.to_lowercase());
    }
    if let Some(name) = cwd.file_name().and_then(|name| name.to_str())
        && name.starts_with(CASE_PREFIX)
    {
        return Ok(name.to_lowercase());
    }
    if let Some(ticket) = config.jira_ticket() {
        return Ok(ticket.to_lowercase());
    }
    bail!(
        "could not determine the Jira case; pass it as an argument, run from an aearep-XXXX directory, or set jiraticket in config.yml"
    )
}

pub fn branch_name(submission_id: &str) -> String {
    format!("sivacor-{}", submission_id.to_lowercase())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZipOutcome {
    pub zip_name: Option<String>,
    pub ignored_zips: Vec<String>,
    pub cleared_artifacts: Vec<String>,
    pub extracted: Option<ExtractReport>,
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Replace the folder contents with the first ZIP's contents. On extraction
/// failure the ZIP is put back.
pub fn handle_zip_files(folder: &Path) -> Result<ZipOutcome> {
    let zips = find_zip_files(folder)?;
    let Some(zip) = zips.first() else {
        info!("no ZIP files found, keeping all downloaded artifacts");
        return Ok(ZipOutcome::default());
    };
    let mut outcome = ZipOutcome {
        zip_name: Some(file_name(zip)),
        ignored_zips: zips.iter().skip(1).map(|path| file_name(path)).collect(),
        ..ZipOutcome::default()
    };
    if !outcome.ignored_zips.is_empty() {
        warn!(using = %file_name(zip), ignored = ?outcome.ignored_zips, "multiple ZIP files found");
    }

    for entry in fs::read_dir(folder).with_context(|| format!("failed to read {}", folder.display()))? {
        let path = entry
            .with_context(|| format!("failed to read {}", folder.display()))?
            .path();
        let is_zip = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"));
        if path.is_file() && !is_zip {
            outcome.cleared_artifacts.push(file_name(&path));
        }
    }
    outcome.cleared_artifacts.sort();

    let parent = folder
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let parked = parent.join(format!("{}.tmp", file_name(zip)));
    fs::rename(zip, &parked)
        .with_context(|| format!("failed to move {} to {}", zip.display(), parked.display()))?;
    clear_directory(folder)?;

    match extract_zip(&parked, folder) {
        Ok(report) => {
            fs::remove_file(&parked)
                .with_context(|| format!("failed to remove {}", parked.display()))?;
            outcome.extracted = Some(report);
            Ok(outcome)
        }
        Err(error) => {
            if parked.exists() {
                fs::rename(&parked, zip).with_context(|| {
                    format!("failed to restore {} after extraction error", zip.display())
                })?;
            }
            Err(error.context(format!("error extracting {}", file_name(zip))))
        }
    }
}

#[derive(Debug, Clone)]
pub struct SivacorOptions {
    pub jira_case: Option<String>,
    pub cwd: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct SivacorReport {
    pub jira_case: String,
    pub submission_id: String,
    pub target_folder: PathBuf,
    pub zip: ZipOutcome,
    pub branch: String,
    pub committed: bool,
}

pub fn run(
    options: &SivacorOptions,
    config: &ProjectConfig,
    jira: &mut dyn JiraApi,
    cli: &mut dyn SivacorCli,
    git: &mut dyn GitRunner,
) -> Result<SivacorReport> {
    let jira_case = resolve_jira_case(options.jira_case.as_deref(), &options.cwd, config)?;
    info!(%jira_case, "resolved Jira case");

    let submission_id = get_info(jira, &jira_case, Keyword::SivacorId)?;
    if submission_id.is_empty() {
        bail!(
            "SIVACOR ID field is not populated in Jira ticket {jira_case}; set 'SIVACOR ID' on the ticket"
        );
    }
    let Some(folder) = config.repository_folder() else {
        bail!("no repository folder in config.yml; set one of openicpsr, zenodo, dataverse, or osf");
    };
    let target_folder = options.cwd.join(&folder);
    info!(%submission_id, folder = %target_folder.display(), "downloading SIVACOR artifacts");

    fs::create_dir_all(&target_folder)
        .with_context(|| format!("failed to create {}", target_folder.display()))?;
    cli.download_all(&submission_id, &target_folder)
        .with_context(|| format!("error downloading from SIVACOR submission {submission_id}"))?;

    let zip = handle_zip_files(&target_folder)?;

    let branch = branch_name(&submission_id);
    checkout_branch(git, &branch)?;
    let committed = commit_staged(
        git,
        &[Path::new(&folder)],
        &format!("[sivacor] Adding artifacts from SIVACOR ID {submission_id}"),
    )?;

    Ok(SivacorReport {
        jira_case,
        submission_id,
        target_folder,
        zip,
        branch,
        committed,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs::{self, File};
    use std::io::Write;
    use std::path::Path;

    use serde_json::json;
    use tempfile::tempdir;
    use zip::write::{FileOptions, ZipWriter};

    use super::*;
    use crate::jira::testing::MockJira;
    use crate::vcs::testing::{MockGit, failed, ok};

    fn write_zip(path: &Path, name: &str, content: &str) {
        let mut writer = ZipWriter::new(File::create(path).expect("create"));
        writer.start_file(name, FileOptions::default()).expect("start");
        writer.write_all(content.as_bytes()).expect("write");
        writer.finish().expect("finish");
    }

    struct MockSivacor {
        requested: Vec<String>,
    }

    impl SivacorCli for MockSivacor {
        fn download_all(&mut self, submission_id: &str, dir: &Path) -> anyhow::Result<()> {
            self.requested.push(submission_id.to_string());
            write_zip(&dir.join("results.zip"), "output/log.txt", "done");
            fs::write(dir.join("report.pdf"), "pdf").expect("write artifact");
            Ok(())
        }
    }

    #[test]
    fn jira_case_precedence() {
        let config = ProjectConfig {
            jiraticket: Some("AEAREP-1".to_string()),
            ..ProjectConfig::default()
        };
        assert_eq!(
            resolve_jira_case(Some("AEAREP-9"), Path::new("/work/aearep-5"), &config).expect("arg"),
            "aearep-9"
        );
        assert_eq!(
            resolve_jira_case(None, Path::new("/work/aearep-5"), &config).expect("dir"),
            "aearep-5"
        );
        assert_eq!(
            resolve_jira_case(None, Path::new("/work/case"), &config).expect("config"),
            "aearep-1"
        );
        assert!(resolve_jira_case(None, Path::new("/work/case"), &ProjectConfig::default()).is_err());
    }

    #[test]
    fn zip_handling_replaces_folder_contents() {
        let temp = tempdir().expect("tempdir");
        let folder = temp.path().join("222222");
        fs::create_dir_all(folder.join("old")).expect("mkdir");
        fs::write(folder.join("stale.txt"), "stale").expect("write");
        write_zip(&folder.join("a.zip"), "fresh.txt", "fresh");
        write_zip(&folder.join("b.zip"), "other.txt", "other");

        let outcome = handle_zip_files(&folder).expect("handle");

        assert_eq!(outcome.zip_name.as_deref(), Some("a.zip"));
        assert_eq!(outcome.ignored_zips, vec!["b.zip".to_string()]);
        assert_eq!(outcome.cleared_artifacts, vec!["stale.txt".to_string()]);
        assert_eq!(fs::read_to_string(folder.join("fresh.txt")).expect("read"), "fresh");
        assert!(!folder.join("stale.txt").exists());
        assert!(!folder.join("b.zip").exists());
        assert!(!temp.path().join("a.zip.tmp").exists());
    }

    #[test]
    fn zip_handling_restores_archive_on_failure() {
        let temp = tempdir().expect("tempdir");
        let folder = temp.path().join("case");
        fs::create_dir_all(&folder).expect("mkdir");
        fs::write(folder.join("broken.zip"), "not a zip").expect("write");

        let error = handle_zip_files(&folder).expect_err("must fail");

        assert!(format!("{error:#}").contains("broken.zip"));
        assert!(folder.join("broken.zip").exists());
    }

    #[test]
    fn zip_handling_without_zips_is_noop() {
        let temp = tempdir().expect("tempdir");
        fs::write(temp.path().join("log.txt"), "x").expect("write");
        assert_eq!(handle_zip_files(temp.path()).expect("noop"), ZipOutcome::default());
        assert!(temp.path().join("log.txt").exists());
    }

    #[test]
    fn run_downloads_extracts_and_commits_on_branch() {
        let temp = tempdir().expect("tempdir");
        let cwd = temp.path().join("aearep-8885");
        fs::create_dir_all(&cwd).expect("mkdir");
        let config = ProjectConfig {
            openicpsr: Some("222222".to_string()),
            ..ProjectConfig::default()
        };
        let mut jira = MockJira {
            fields: BTreeMap::from([("SIVACOR ID".to_string(), "customfield_9".to_string())]),
            issues: BTreeMap::from([(
                "AEAREP-8885".to_string(),
                json!({"customfield_9": "SVC-ABC"}),
            )]),
            requested: Vec::new(),
        };
        let mut cli = MockSivacor {
            requested: Vec::new(),
        };
        let mut git = MockGit::with_responses(vec![failed(), ok(), ok(), failed(), ok()]);
        let options = SivacorOptions {
            jira_case: None,
            cwd: cwd.clone(),
        };

        let report = run(&options, &config, &mut jira, &mut cli, &mut git).expect("run");

        assert_eq!(report.jira_case, "aearep-8885");
        assert_eq!(report.submission_id, "SVC-ABC");
        assert_eq!(report.branch, "sivacor-svc-abc");
        assert!(report.committed);
        assert_eq!(cli.requested, vec!["SVC-ABC".to_string()]);
        assert_eq!(
            fs::read_to_string(cwd.join("222222/output/log.txt")).expect("read"),
            "done"
        );
        assert!(!cwd.join("222222/report.pdf").exists());
        assert_eq!(
            git.calls,
            vec![
                "rev-parse --verify sivacor-svc-abc".to_string(),
                "checkout -b sivacor-svc-abc".to_string(),
                "add 222222".to_string(),
                "diff --cached --quiet".to_string(),
                "commit -m [sivacor] Adding artifacts from SIVACOR ID SVC-ABC".to_string(),
            ]
        );
    }

    #[test]
    fn run_requires_sivacor_id() {
        let temp = tempdir().expect("tempdir");
        let mut jira = MockJira::default();
        let mut cli = MockSivacor {
            requested: Vec::new(),
        };
        let mut git = MockGit::default();
        let options = SivacorOptions {
            jira_case: Some("aearep-1".to_string()),
            cwd: temp.path().to_path_buf(),
        };
        let error = run(&options, &ProjectConfig::default(), &mut jira, &mut cli, &mut git)
            .expect_err("must fail");
        assert!(error.to_string().contains("SIVACOR ID field is not populated"));
        assert!(cli.requested.is_empty());
    }
}
