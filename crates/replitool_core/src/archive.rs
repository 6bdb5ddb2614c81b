use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};
use zip::ZipArchive;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractReport {
    pub files: usize,
    pub directories: usize,
    pub skipped: Vec<String>,
}

/// Extract every entry of `zip_path` below `dest`. Entries whose names would land
/// outside `dest` are skipped and reported.
pub fn extract_zip(zip_path: &Path, dest: &Path) -> Result<ExtractReport> {
    let file =
        File::open(zip_path).with_context(|| format!("failed to open {}", zip_path.display()))?;
    let mut archive = ZipArchive::new(file)
        .with_context(|| format!("{} is not a valid zip archive", zip_path.display()))?;
    fs::create_dir_all(dest).with_context(|| format!("failed to create {}", dest.display()))?;

    let mut report = ExtractReport::default();
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .with_context(|| format!("failed to read entry {index} of {}", zip_path.display()))?;
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            warn!(entry = entry.name(), "skipping zip entry outside destination");
            report.skipped.push(entry.name().to_string());
            continue;
        };
        let target = dest.join(&relative);
        if entry.is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("failed to create {}", target.display()))?;
            report.directories += 1;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut output = File::create(&target)
            .with_context(|| format!("failed to create {}", target.display()))?;
        io::copy(&mut entry, &mut output)
            .with_context(|| format!("failed to extract {}", relative.display()))?;
        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o777))
                .with_context(|| format!("failed to set permissions on {}", target.display()))?;
        }
        report.files += 1;
    }
    debug!(
        archive = %zip_path.display(),
        files = report.files,
        directories = report.directories,
        "extracted archive"
    );
    Ok(report)
}

/// Remove every child of `dir` while keeping `dir` itself.
pub fn clear_directory(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let entry = entry.with_context(|| format!("failed to read {}", dir.display()))?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .with_context(|| format!("failed to stat {}", path.display()))?;
        if file_type.is_dir() {
            fs::remove_dir_all(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
        } else {
            fs::remove_file(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
        }
    }
    Ok(())
}

pub fn find_zip_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut zips = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let path = entry
            .with_context(|| format!("failed to read {}", dir.display()))?
            .path();
        let is_zip = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"));
        if is_zip && path.is_file() {
            zips.push(path);
        }
    }
    zips.sort();
    Ok(zips)
}

#[cfg(test)]
mod tests {
    use std::fs::{self, File};
    use std::io::Write;
    use std::path::Path;

    use tempfile::tempdir;
    use zip::write::{FileOptions, ZipWriter};

    use super::{clear_directory, extract_zip, find_zip_files};

    fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        let file = File::create(path).expect("create zip");
        let mut writer = ZipWriter::new(file);
        for (name, content) in entries {
            if name.ends_with('/') {
                writer
                    .add_directory(*name, FileOptions::default())
                    .expect("add dir");
            } else {
                writer
                    .start_file(*name, FileOptions::default())
                    .expect("start file");
                writer.write_all(content.as_bytes()).expect("write entry");
            }
        }
        writer.finish().expect("finish zip");
    }

    #[test]
    fn extract_zip_writes_nested_entries() {
        let temp = tempdir().expect("tempdir");
        let zip_path = temp.path().join("package.zip");
        write_zip(
            &zip_path,
            &[
                ("code/", ""),
                ("code/main.do", "use data"),
                ("README.md", "# Readme"),
            ],
        );
        let dest = temp.path().join("out");

        let report = extract_zip(&zip_path, &dest).expect("extract");

        assert_eq!(report.files, 2);
        assert_eq!(report.directories, 1);
        assert!(report.skipped.is_empty());
        assert_eq!(
            fs::read_to_string(dest.join("code/main.do")).expect("read"),
            "use data"
        );
    }

    #[test]
    fn extract_zip_skips_entries_escaping_destination() {
        let temp = tempdir().expect("tempdir");
        let zip_path = temp.path().join("evil.zip");
        write_zip(&zip_path, &[("../escape.txt", "nope"), ("ok.txt", "fine")]);
        let dest = temp.path().join("out");

        let report = extract_zip(&zip_path, &dest).expect("extract");

        assert_eq!(report.files, 1);
        assert_eq!(report.skipped, vec!["../escape.txt".to_string()]);
        assert!(!temp.path().join("escape.txt").exists());
    }

    #[test]
    fn extract_zip_rejects_non_archives() {
        let temp = tempdir().expect("tempdir");
        let bogus = temp.path().join("bogus.zip");
        fs::write(&bogus, "<html>login</html>").expect("write");
        let error = extract_zip(&bogus, &temp.path().join("out")).expect_err("must fail");
        assert!(error.to_string().contains("not a valid zip archive"));
    }

    #[test]
    fn clear_directory_keeps_root() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("case");
        fs::create_dir_all(root.join("sub")).expect("mkdir");
        fs::write(root.join("a.txt"), "a").expect("write");
        fs::write(root.join("sub/b.txt"), "b").expect("write");

        clear_directory(&root).expect("clear");

        assert!(root.is_dir());
        assert_eq!(fs::read_dir(&root).expect("read").count(), 0);
    }

    #[test]
    fn find_zip_files_is_sorted_and_shallow() {
        let temp = tempdir().expect("tempdir");
        fs::write(temp.path().join("b.zip"), "").expect("write");
        fs::write(temp.path().join("A.ZIP"), "").expect("write");
        fs::write(temp.path().join("notes.txt"), "").expect("write");
        fs::create_dir_all(temp.path().join("nested")).expect("mkdir");
        fs::write(temp.path().join("nested/c.zip"), "").expect("write");

        let zips = find_zip_files(temp.path()).expect("find");
        let names = zips
            .iter()
            .filter_map(|path| path.file_name().and_then(|name| name.to_str()))
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["A.ZIP", "b.zip"]);
    }
}
