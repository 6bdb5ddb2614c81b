use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, bail};
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

pub trait GitRunner {
    fn run(&mut self, args: &[&str]) -> Result<GitOutput>;
}

/// Runs the `git` executable from the current directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemGit;

impl SystemGit {
    pub fn new() -> Self {
        Self
    }
}

impl GitRunner for SystemGit {
    fn run(&mut self, args: &[&str]) -> Result<GitOutput> {
        let mut command = Command::new("git");
        command.args(args);
        debug!(?args, "running git");
        let output = command
            .output()
            .with_context(|| format!("failed to run git {}", args.join(" ")))?;
        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

fn run_checked(git: &mut dyn GitRunner, args: &[&str]) -> Result<GitOutput> {
    let output = git.run(args)?;
    if !output.success {
        bail!("git {} failed: {}", args.join(" "), output.stderr.trim());
    }
    Ok(output)
}

/// `git add -v dir` then `git commit -m message dir`.
pub fn commit_directory(git: &mut dyn GitRunner, dir: &Path, message: &str) -> Result<()> {
    let dir = dir.to_string_lossy();
    run_checked(git, &["add", "-v", &dir])?;
    run_checked(git, &["commit", "-m", message, &dir])?;
    info!(%dir, "committed directory");
    Ok(())
}

/// Switch to `name`, creating it when it doesn't exist yet.
pub fn checkout_branch(git: &mut dyn GitRunner, name: &str) -> Result<()> {
    let exists = git.run(&["rev-parse", "--verify", name])?.success;
    if exists {
        info!(branch = name, "checking out existing branch");
        run_checked(git, &["checkout", name])?;
    } else {
        info!(branch = name, "creating branch");
        run_checked(git, &["checkout", "-b", name])?;
    }
    Ok(())
}

/// Stage `paths` and commit. Returns false when nothing was staged.
pub fn commit_staged(git: &mut dyn GitRunner, paths: &[&Path], message: &str) -> Result<bool> {
    let paths = paths
        .iter()
        .map(|path| path.to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    let mut add = vec!["add"];
    add.extend(paths.iter().map(String::as_str));
    run_checked(git, &add)?;

    if git.run(&["diff", "--cached", "--quiet"])?.success {
        info!("no staged changes to commit");
        return Ok(false);
    }
    run_checked(git, &["commit", "-m", message])?;
    Ok(true)
}
