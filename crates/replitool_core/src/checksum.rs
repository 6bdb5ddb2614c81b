use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use md5::Md5;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use walkdir::WalkDir;

const READ_CHUNK: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChecksumAlgorithm {
    Md5,
    Sha256,
}

impl ChecksumAlgorithm {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "md5" => Ok(Self::Md5),
            "sha256" | "sha-256" => Ok(Self::Sha256),
            other => bail!("unsupported checksum algorithm: {other}"),
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha256 => "sha256",
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.extension())
    }
}

/// A checksum as published by a repository: `algo:hash`, or a bare md5 hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedChecksum {
    pub algorithm: ChecksumAlgorithm,
    pub hash: String,
}

impl ExpectedChecksum {
    pub fn parse(raw: &str) -> Result<Option<Self>> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        let (algorithm, hash) = match raw.split_once(':') {
            Some((algorithm, hash)) => (ChecksumAlgorithm::parse(algorithm)?, hash),
            None => (ChecksumAlgorithm::Md5, raw),
        };
        Ok(Some(Self {
            algorithm,
            hash: hash.trim().to_ascii_lowercase(),
        }))
    }
}

impl fmt::Display for ExpectedChecksum {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}:{}", self.algorithm, self.hash)
    }
}

pub fn file_digest(path: &Path, algorithm: ChecksumAlgorithm) -> Result<String> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let reader = BufReader::new(file);
    let digest = match algorithm {
        ChecksumAlgorithm::Md5 => digest_reader::<Md5, _>(reader),
        ChecksumAlgorithm::Sha256 => digest_reader::<Sha256, _>(reader),
    };
    digest.with_context(|| format!("failed to hash {}", path.display()))
}

fn digest_reader<D: Digest, R: Read>(mut reader: R) -> std::io::Result<String> {
    let mut hasher = D::new();
    let mut buffer = [0u8; READ_CHUNK];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    let digest = hasher.finalize();
    let mut output = String::with_capacity(digest.len() * 2);
    for byte in digest.iter() {
        output.push_str(&format!("{byte:02x}"));
    }
    Ok(output)
}

/// Whether `path` already holds the expected content. Without a known checksum,
/// existence is enough.
pub fn file_matches(path: &Path, expected: Option<&ExpectedChecksum>) -> Result<bool> {
    if !path.is_file() {
        return Ok(false);
    }
    let Some(expected) = expected else {
        return Ok(true);
    };
    let actual = file_digest(path, expected.algorithm)?;
    Ok(actual.eq_ignore_ascii_case(&expected.hash))
}

/// One file in a generated manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Path relative to the manifest root, `/`-separated.
    pub relative: String,
    pub local_path: PathBuf,
    pub size: u64,
    pub checksum: Option<ExpectedChecksum>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestFiles {
    pub sha256: Option<PathBuf>,
    pub md5: Option<PathBuf>,
    pub metadata: Option<PathBuf>,
}

pub fn manifest_path(generated_dir: &Path, tag: &str, date: NaiveDate, algorithm: ChecksumAlgorithm) -> PathBuf {
    generated_dir.join(format!(
        "manifest.{tag}.{}.{}",
        date.format("%Y-%m-%d"),
        algorithm.extension()
    ))
}

pub fn metadata_path(generated_dir: &Path, tag: &str) -> PathBuf {
    generated_dir.join(format!("metadata.{tag}.txt"))
}

/// Write sha256/md5 manifests and the size listing for `entries` into `generated_dir`.
pub fn write_manifests(
    generated_dir: &Path,
    tag: &str,
    date: NaiveDate,
    entries: &[ManifestEntry],
) -> Result<ManifestFiles> {
    if entries.is_empty() {
        return Ok(ManifestFiles::default());
    }
    fs::create_dir_all(generated_dir)
        .with_context(|| format!("failed to create {}", generated_dir.display()))?;

    let metadata = metadata_path(generated_dir, tag);
    let mut listing = String::from("filename,bytes\n");
    for entry in entries {
        listing.push_str(&format!("./{},{}\n", entry.relative, entry.size));
    }
    fs::write(&metadata, listing)
        .with_context(|| format!("failed to write {}", metadata.display()))?;

    let mut files = ManifestFiles {
        metadata: Some(metadata),
        ..ManifestFiles::default()
    };
    for algorithm in [ChecksumAlgorithm::Sha256, ChecksumAlgorithm::Md5] {
        let mut lines = Vec::new();
        for entry in entries {
            let hash = match &entry.checksum {
                Some(known) if known.algorithm == algorithm => Some(known.hash.clone()),
                _ if entry.local_path.is_file() => {
                    Some(file_digest(&entry.local_path, algorithm)?)
                }
                _ => None,
            };
            if let Some(hash) = hash {
                lines.push(format!("{hash}  ./{}", entry.relative));
            }
        }
        if lines.is_empty() {
            continue;
        }
        lines.sort();
        let path = manifest_path(generated_dir, tag, date, algorithm);
        let mut body = lines.join("\n");
        body.push('\n');
        fs::write(&path, body).with_context(|| format!("failed to write {}", path.display()))?;
        info!(manifest = %path.display(), entries = lines.len(), "wrote manifest");
        match algorithm {
            ChecksumAlgorithm::Sha256 => files.sha256 = Some(path),
            ChecksumAlgorithm::Md5 => files.md5 = Some(path),
        }
    }
    Ok(files)
}

/// Every regular file below `root` as a manifest entry, sorted by relative path.
pub fn scan_directory(root: &Path) -> Result<Vec<ManifestEntry>> {
    if !root.is_dir() {
        bail!("{} is not a directory", root.display());
    }
    let mut entries = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.with_context(|| format!("failed to walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path
            .strip_prefix(root)
            .with_context(|| format!("{} is outside {}", path.display(), root.display()))?;
        let relative = relative
            .components()
            .map(|component| component.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        let size = entry
            .metadata()
            .with_context(|| format!("failed to stat {}", path.display()))?
            .len();
        entries.push(ManifestEntry {
            relative,
            local_path: path.to_path_buf(),
            size,
            checksum: None,
        });
    }
    entries.sort_by(|left, right| left.relative.cmp(&right.relative));
    debug!(root = %root.display(), files = entries.len(), "scanned directory");
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::NaiveDate;
    use tempfile::tempdir;

    use super::*;

    const HELLO_MD5: &str = "5d41402abc4b2a76b9719d911017c592";
    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 2).expect("date")
    }

    #[test]
    fn expected_checksum_parses_prefixes() {
        let parsed = ExpectedChecksum::parse("SHA-256:ABCD").expect("parse").expect("some");
        assert_eq!(parsed.algorithm, ChecksumAlgorithm::Sha256);
        assert_eq!(parsed.hash, "abcd");

        let bare = ExpectedChecksum::parse(HELLO_MD5).expect("parse").expect("some");
        assert_eq!(bare.algorithm, ChecksumAlgorithm::Md5);

        assert_eq!(ExpectedChecksum::parse("  ").expect("parse"), None);
        assert!(ExpectedChecksum::parse("crc32:1234").is_err());
    }

    #[test]
    fn file_digest_matches_known_vectors() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("hello.txt");
        fs::write(&path, "hello").expect("write");
        assert_eq!(file_digest(&path, ChecksumAlgorithm::Md5).expect("md5"), HELLO_MD5);
        assert_eq!(
            file_digest(&path, ChecksumAlgorithm::Sha256).expect("sha256"),
            HELLO_SHA256
        );
    }

    #[test]
    fn file_matches_covers_missing_unknown_and_mismatch() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("hello.txt");
        let good = ExpectedChecksum::parse(&format!("md5:{}", HELLO_MD5.to_uppercase()))
            .expect("parse");
        assert!(!file_matches(&path, good.as_ref()).expect("missing"));

        fs::write(&path, "hello").expect("write");
        assert!(file_matches(&path, None).expect("no checksum"));
        assert!(file_matches(&path, good.as_ref()).expect("match"));

        let bad = ExpectedChecksum::parse("md5:0000").expect("parse");
        assert!(!file_matches(&path, bad.as_ref()).expect("mismatch"));
    }

    #[test]
    fn write_manifests_prefers_remote_and_hashes_locally_otherwise() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("zenodo-1");
        fs::create_dir_all(&root).expect("mkdir");
        fs::write(root.join("b.txt"), "hello").expect("write");
        let generated = temp.path().join("generated");
        let entries = vec![
            ManifestEntry {
                relative: "b.txt".to_string(),
                local_path: root.join("b.txt"),
                size: 5,
                checksum: ExpectedChecksum::parse("md5:feedface").expect("parse"),
            },
            ManifestEntry {
                relative: "a.txt".to_string(),
                local_path: root.join("a.txt"),
                size: 9,
                checksum: ExpectedChecksum::parse("md5:cafebabe").expect("parse"),
            },
        ];

        let files = write_manifests(&generated, "zenodo-1", date(), &entries).expect("write");

        let md5 = fs::read_to_string(files.md5.expect("md5 path")).expect("read md5");
        assert_eq!(md5, "cafebabe  ./a.txt\nfeedface  ./b.txt\n");
        let sha = fs::read_to_string(files.sha256.expect("sha path")).expect("read sha");
        assert_eq!(sha, format!("{HELLO_SHA256}  ./b.txt\n"));
        assert!(generated.join("manifest.zenodo-1.2024-05-02.sha256").exists());
        let metadata = fs::read_to_string(generated.join("metadata.zenodo-1.txt")).expect("read");
        assert_eq!(metadata, "filename,bytes\n./b.txt,5\n./a.txt,9\n");
    }

    #[test]
    fn write_manifests_skips_empty_input() {
        let temp = tempdir().expect("tempdir");
        let files = write_manifests(temp.path(), "tag", date(), &[]).expect("write");
        assert_eq!(files, ManifestFiles::default());
        assert_eq!(fs::read_dir(temp.path()).expect("read").count(), 0);
    }

    #[test]
    fn scan_directory_lists_nested_files() {
        let temp = tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("code")).expect("mkdir");
        fs::write(temp.path().join("code/main.R"), "x <- 1").expect("write");
        fs::write(temp.path().join("README.md"), "hi").expect("write");

        let entries = scan_directory(temp.path()).expect("scan");
        let names = entries
            .iter()
            .map(|entry| (entry.relative.as_str(), entry.size))
            .collect::<Vec<_>>();
        assert_eq!(names, vec![("README.md", 2), ("code/main.R", 6)]);
    }
}
