use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;
use tracing::debug;

pub const DEFAULT_TEMPLATE: &str = "REPLICATION.md";
pub const DEFAULT_INPUT_DIR: &str = "generated";
pub const DEFAULT_REVISION_OUTPUT: &str = "REPLICATION_modified.md";

const PROGRAMS_APPENDIX: &str =
    r"(?s)((\*\*## Appendix: Programs provided\*\*\n).*?\n)```[\s\S]*?```";
const PROGRAMS_PLACEHOLDER: &str = "${1}```\n{{ programs-list.txt }}\n```";

pub fn placeholder(filename: &str) -> String {
    format!("{{{{ {filename} }}}}")
}

/// `.txt` and `.md` files of `dir`, sorted by name.
pub fn replacement_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let path = entry
            .with_context(|| format!("failed to read {}", dir.display()))?
            .path();
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        if path.is_file() && (name.ends_with(".txt") || name.ends_with(".md")) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[derive(Debug, Clone, Default)]
pub struct Substitution {
    pub text: String,
    pub used: Vec<String>,
}

/// Replace every `{{ name }}` in `template` with the contents of `dir/name`.
pub fn replace_placeholders(template: &str, dir: &Path) -> Result<Substitution> {
    let mut text = template.to_string();
    let mut used = Vec::new();
    for path in replacement_files(dir)? {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tag = placeholder(&name);
        if !text.contains(&tag) {
            continue;
        }
        let replacement = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        debug!(%tag, "substituting");
        text = text.replace(&tag, &replacement);
        used.push(name);
    }
    Ok(Substitution { text, used })
}

pub fn replace_placeholders_in_file(infile: &Path, outfile: &Path, dir: &Path) -> Result<Substitution> {
    let template = fs::read_to_string(infile)
        .with_context(|| format!("failed to read {}", infile.display()))?;
    let substitution = replace_placeholders(&template, dir)?;
    fs::write(outfile, &substitution.text)
        .with_context(|| format!("failed to write {}", outfile.display()))?;
    Ok(substitution)
}

/// Reset the code block under the programs appendix to the `programs-list.txt` placeholder.
pub fn prepare_revision(content: &str) -> Result<String> {
    let pattern = Regex::new(PROGRAMS_APPENDIX).context("invalid appendix pattern")?;
    Ok(pattern.replace_all(content, PROGRAMS_PLACEHOLDER).into_owned())
}

pub fn prepare_revision_file(input: &Path, output: &Path) -> Result<()> {
    let content =
        fs::read_to_string(input).with_context(|| format!("failed to read {}", input.display()))?;
    fs::write(output, prepare_revision(&content)?)
        .with_context(|| format!("failed to write {}", output.display()))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn substitutes_known_placeholders_only() {
        let temp = tempdir().expect("tempdir");
        fs::write(temp.path().join("programs-list.txt"), "main.do\nclean.do").expect("write");
        fs::write(temp.path().join("summary.md"), "**ok**").expect("write");
        fs::write(temp.path().join("data.csv"), "x").expect("write");

        let template = "Programs:\n{{ programs-list.txt }}\nSummary: {{ summary.md }}\nData: {{ data.csv }}\n";
        let result = replace_placeholders(template, temp.path()).expect("replace");

        assert_eq!(
            result.text,
            "Programs:\nmain.do\nclean.do\nSummary: **ok**\nData: {{ data.csv }}\n"
        );
        assert_eq!(result.used, vec!["programs-list.txt".to_string(), "summary.md".to_string()]);
    }

    #[test]
    fn file_variant_writes_output() {
        let temp = tempdir().expect("tempdir");
        let generated = temp.path().join("generated");
        fs::create_dir_all(&generated).expect("mkdir");
        fs::write(generated.join("note.txt"), "hello").expect("write");
        let infile = temp.path().join("REPLICATION.md");
        fs::write(&infile, "say {{ note.txt }}").expect("write");

        replace_placeholders_in_file(&infile, &infile, &generated).expect("replace");

        assert_eq!(fs::read_to_string(&infile).expect("read"), "say hello");
    }

    #[test]
    fn revision_resets_programs_block() {
        let report = "# Report\n\n**## Appendix: Programs provided**\n\nList:\n```\nold.do\nother.do\n```\n\nEnd\n";
        assert_eq!(
            prepare_revision(report).expect("prepare"),
            "# Report\n\n**## Appendix: Programs provided**\n\nList:\n```\n{{ programs-list.txt }}\n```\n\nEnd\n"
        );
    }

    #[test]
    fn revision_without_appendix_is_unchanged() {
        let report = "# Report\n```\ncode\n```\n";
        assert_eq!(prepare_revision(report).expect("prepare"), report);
    }
}
