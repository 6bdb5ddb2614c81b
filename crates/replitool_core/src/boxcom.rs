use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use pkcs8::{EncryptedPrivateKeyInfo, LineEnding, SecretDocument};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::env_non_empty;
use crate::http::{Auth, Session, content_length, stream_to_file};
use crate::progress::Progress;

pub const TOKEN_URL: &str = "https://api.box.com/oauth2/token";
pub const API_BASE: &str = "https://api.box.com/2.0";
pub const DEFAULT_LISTING_PATH: &str = "generated/manifest.restricted.txt";
const JWT_LIFETIME_SECS: i64 = 45;
const PAGE_LIMIT: usize = 1000;
const CASE_PREFIX: &str = "aearep-";

/// Values given on the command line; anything left `None` falls back to the environment.
#[derive(Debug, Clone, Default)]
pub struct BoxOverrides {
    pub folder_id: Option<String>,
    pub key_id: Option<String>,
    pub enterprise_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub config_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoxSettings {
    pub folder_id: String,
    pub key_id: String,
    pub enterprise_id: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub config_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl BoxSettings {
    pub fn from_env(overrides: BoxOverrides) -> Result<Self> {
        Self::resolve(overrides, env_non_empty)
    }

    /// Every missing required value is named in one error.
    pub fn resolve(overrides: BoxOverrides, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let pick = |value: Option<String>, key: &str| value.filter(|value| !value.is_empty()).or_else(|| lookup(key));
        let folder_id = pick(overrides.folder_id, "BOX_FOLDER_PRIVATE");
        let key_id = pick(overrides.key_id, "BOX_PRIVATE_KEY_ID");
        let enterprise_id = pick(overrides.enterprise_id, "BOX_ENTERPRISE_ID");

        let mut missing = Vec::new();
        if folder_id.is_none() {
            missing.push("BOX_FOLDER_PRIVATE");
        }
        if key_id.is_none() {
            missing.push("BOX_PRIVATE_KEY_ID");
        }
        if enterprise_id.is_none() {
            missing.push("BOX_ENTERPRISE_ID");
        }
        let (Some(folder_id), Some(key_id), Some(enterprise_id)) = (folder_id, key_id, enterprise_id) else {
            bail!("Missing required arguments: {}", missing.join(", "));
        };

        Ok(Self {
            folder_id,
            key_id,
            enterprise_id,
            client_id: pick(overrides.client_id, "BOX_CLIENT_ID"),
            client_secret: pick(overrides.client_secret, "BOX_CLIENT_SECRET"),
            config_dir: overrides
                .config_dir
                .or_else(|| lookup("BOX_CONFIG_PATH").map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from(".")),
            output_dir: overrides
                .output_dir
                .or_else(|| lookup("BOX_OUTPUT_DIR").map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from("restricted")),
        })
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir
            .join(format!("{}_{}_config.json", self.enterprise_id, self.key_id))
    }
}

/// The JSON settings file Box issues for a JWT application.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(rename = "boxAppSettings")]
    pub app: AppSettings,
    #[serde(rename = "enterpriseID", default)]
    pub enterprise_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppSettings {
    #[serde(rename = "clientID")]
    pub client_id: String,
    #[serde(rename = "clientSecret")]
    pub client_secret: String,
    #[serde(rename = "appAuth")]
    pub app_auth: AppAuth,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppAuth {
    #[serde(rename = "publicKeyID")]
    pub public_key_id: String,
    #[serde(rename = "privateKey")]
    pub private_key: String,
    #[serde(default)]
    pub passphrase: String,
}

pub fn parse_app_config(json: &str) -> Result<AppConfig> {
    serde_json::from_str(json).context("failed to parse Box app config JSON")
}

/// `BOX_PRIVATE_JSON` is produced by `base64 config.json`, so line wrapping is tolerated.
pub fn decode_private_json(encoded: &str) -> Result<String> {
    let compact = encoded
        .chars()
        .filter(|ch| !ch.is_whitespace())
        .collect::<String>();
    let bytes = STANDARD.decode(compact.as_bytes()).context(
        "failed to decode BOX_PRIVATE_JSON; it should hold base64 encoded JSON (cat config.json | base64)",
    )?;
    String::from_utf8(bytes).context("BOX_PRIVATE_JSON does not decode to UTF-8 text")
}

pub fn load_app_config(settings: &BoxSettings, private_json: Option<&str>) -> Result<AppConfig> {
    if let Some(encoded) = private_json {
        info!("using Box config from BOX_PRIVATE_JSON");
        return parse_app_config(&decode_private_json(encoded)?);
    }
    let path = settings.config_file();
    info!(path = %path.display(), "using Box config file");
    if !path.exists() {
        bail!(
            "Box config file not found at {}; provide a config directory or set BOX_PRIVATE_JSON",
            path.display()
        );
    }
    let content =
        fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
    parse_app_config(&content).with_context(|| format!("invalid Box config {}", path.display()))
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    sub: &'a str,
    box_sub_type: &'static str,
    aud: &'static str,
    jti: String,
    exp: i64,
}

/// Identity used to request an enterprise access token.
#[derive(Debug, Clone)]
pub struct JwtIdentity {
    pub client_id: String,
    pub client_secret: String,
    pub enterprise_id: String,
    pub key_id: String,
    pub private_key: String,
}

impl JwtIdentity {
    /// Command-line and environment client credentials win over the config file.
    pub fn new(settings: &BoxSettings, config: &AppConfig) -> Result<Self> {
        let auth = &config.app.app_auth;
        let private_key = if auth.private_key.contains("ENCRYPTED PRIVATE KEY") {
            decrypt_private_key(&auth.private_key, &auth.passphrase)?
        } else {
            auth.private_key.clone()
        };
        let enterprise_id = config
            .enterprise_id
            .clone()
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| settings.enterprise_id.clone());
        Ok(Self {
            client_id: settings
                .client_id
                .clone()
                .unwrap_or_else(|| config.app.client_id.clone()),
            client_secret: settings
                .client_secret
                .clone()
                .unwrap_or_else(|| config.app.client_secret.clone()),
            enterprise_id,
            key_id: auth.public_key_id.clone(),
            private_key,
        })
    }

    pub fn assertion(&self, now: i64) -> Result<String> {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.key_id.clone());
        let claims = AssertionClaims {
            iss: &self.client_id,
            sub: &self.enterprise_id,
            box_sub_type: "enterprise",
            aud: TOKEN_URL,
            jti: Uuid::new_v4().to_string(),
            exp: now + JWT_LIFETIME_SECS,
        };
        let key = EncodingKey::from_rsa_pem(self.private_key.as_bytes())
            .context("invalid RSA private key in Box app config")?;
        encode(&header, &claims, &key).context("failed to sign Box JWT assertion")
    }
}

/// Decrypt a PKCS#8 `ENCRYPTED PRIVATE KEY` into an unencrypted `PRIVATE KEY` PEM.
pub fn decrypt_private_key(pem: &str, passphrase: &str) -> Result<String> {
    let (label, document) = SecretDocument::from_pem(pem.trim())
        .map_err(|error| anyhow!("invalid private key PEM in Box app config: {error}"))?;
    if label != "ENCRYPTED PRIVATE KEY" {
        bail!("expected an ENCRYPTED PRIVATE KEY block, found {label}");
    }
    let encrypted = EncryptedPrivateKeyInfo::try_from(document.as_bytes())
        .map_err(|error| anyhow!("invalid encrypted private key in Box app config: {error}"))?;
    let decrypted = encrypted.decrypt(passphrase).map_err(|error| {
        anyhow!("failed to decrypt the Box private key with the configured passphrase: {error}")
    })?;
    let unencrypted = decrypted
        .to_pem("PRIVATE KEY", LineEnding::LF)
        .map_err(|error| anyhow!("failed to encode decrypted private key: {error}"))?;
    Ok(unencrypted.as_str().to_string())
}

pub fn request_access_token(session: &Session, identity: &JwtIdentity) -> Result<String> {
    let assertion = identity.assertion(chrono::Utc::now().timestamp())?;
    info!("authenticating with Box");
    let response = session.post_form(
        TOKEN_URL,
        &[
            ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
            ("assertion", &assertion),
            ("client_id", &identity.client_id),
            ("client_secret", &identity.client_secret),
        ],
        None,
    )?;
    let status = response.status();
    let body = response
        .text()
        .context("failed to read Box token response")?;
    if !status.is_success() {
        bail!("Box authentication failed with HTTP {}: {}", status.as_u16(), body.trim());
    }
    let value: Value = serde_json::from_str(&body).context("Box token response is not JSON")?;
    value
        .get("access_token")
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .context("Box token response has no access_token")
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BoxItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub sha1: Option<String>,
}

impl BoxItem {
    pub fn is_folder(&self) -> bool {
        self.kind == "folder"
    }

    pub fn is_file(&self) -> bool {
        self.kind == "file"
    }
}

pub trait BoxApi {
    fn folder_name(&mut self, folder_id: &str) -> Result<String>;
    fn folder_items(&mut self, folder_id: &str) -> Result<Vec<BoxItem>>;
    fn download_file(&mut self, item: &BoxItem, target: &Path) -> Result<u64>;
}

pub struct BoxClient {
    session: Session,
    auth: Auth,
}

impl BoxClient {
    pub fn connect(session: Session, settings: &BoxSettings, private_json: Option<&str>) -> Result<Self> {
        let config = load_app_config(settings, private_json)?;
        let identity = JwtIdentity::new(settings, &config)?;
        let token = request_access_token(&session, &identity)?;
        info!("authenticated with Box");
        Ok(Self {
            session,
            auth: Auth::Bearer(token),
        })
    }
}

impl BoxApi for BoxClient {
    fn folder_name(&mut self, folder_id: &str) -> Result<String> {
        let url = format!("{API_BASE}/folders/{folder_id}?fields=name");
        let folder = self.session.get_json(&url, &self.auth)?;
        folder
            .get("name")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .with_context(|| format!("Box folder {folder_id} has no name"))
    }

    fn folder_items(&mut self, folder_id: &str) -> Result<Vec<BoxItem>> {
        let mut items = Vec::new();
        loop {
            let url = format!(
                "{API_BASE}/folders/{folder_id}/items?fields=type,id,name,size,sha1&limit={PAGE_LIMIT}&offset={}",
                items.len()
            );
            let page = self.session.get_json(&url, &self.auth)?;
            let entries = page
                .get("entries")
                .cloned()
                .with_context(|| format!("Box folder {folder_id} listing has no entries"))?;
            let entries: Vec<BoxItem> = serde_json::from_value(entries)
                .with_context(|| format!("failed to decode items of Box folder {folder_id}"))?;
            let total = page
                .get("total_count")
                .and_then(Value::as_u64)
                .unwrap_or(0) as usize;
            let fetched = entries.len();
            items.extend(entries);
            if fetched == 0 || items.len() >= total {
                break;
            }
        }
        Ok(items)
    }

    fn download_file(&mut self, item: &BoxItem, target: &Path) -> Result<u64> {
        let url = format!("{API_BASE}/files/{}/content", item.id);
        let response = self
            .session
            .get_with(&url, &self.auth, None)?
            .error_for_status()
            .with_context(|| format!("failed to download {}", item.name))?;
        let total = content_length(response.headers()).or(item.size);
        let mut progress = Progress::new(item.name.clone(), total);
        let bytes = stream_to_file(response, target, &mut progress)?;
        progress.finish();
        Ok(bytes)
    }
}

/// `1234` and `aearep-1234` both name the subfolder `aearep-1234`.
pub fn subfolder_pattern(subfolder: &str) -> String {
    let trimmed = subfolder.trim();
    let number = trimmed
        .get(..CASE_PREFIX.len())
        .filter(|head| head.eq_ignore_ascii_case(CASE_PREFIX))
        .map_or(trimmed, |_| &trimmed[CASE_PREFIX.len()..]);
    format!("{CASE_PREFIX}{number}")
}

/// First child folder whose name contains `aearep-{subfolder}`.
pub fn find_subfolder(api: &mut dyn BoxApi, parent_id: &str, subfolder: &str) -> Result<Option<BoxItem>> {
    let pattern = subfolder_pattern(subfolder);
    info!(%pattern, "looking for subfolder");
    let found = api
        .folder_items(parent_id)?
        .into_iter()
        .find(|item| item.is_folder() && item.name.contains(&pattern));
    if let Some(item) = &found {
        info!(name = %item.name, id = %item.id, "found subfolder");
    }
    Ok(found)
}

#[derive(Debug, Clone, Default)]
pub struct BoxDownloadReport {
    pub folder_id: String,
    pub output_dir: PathBuf,
    pub downloaded: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
    pub failed: Vec<(String, String)>,
}

impl BoxDownloadReport {
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}

fn local_size(path: &Path) -> Option<u64> {
    fs::metadata(path).ok().filter(|meta| meta.is_file()).map(|meta| meta.len())
}

fn download_folder(
    api: &mut dyn BoxApi,
    folder_id: &str,
    local: &Path,
    depth: usize,
    report: &mut BoxDownloadReport,
) -> Result<()> {
    let name = api.folder_name(folder_id)?;
    let current = if depth == 0 { local.to_path_buf() } else { local.join(&name) };
    info!(folder = %name, id = folder_id, "processing folder");
    fs::create_dir_all(&current)
        .with_context(|| format!("failed to create {}", current.display()))?;

    for item in api.folder_items(folder_id)? {
        if item.is_folder() {
            if let Err(error) = download_folder(api, &item.id, &current, depth + 1, report) {
                warn!(folder = %item.name, %error, "folder download failed");
                report.failed.push((item.name.clone(), format!("{error:#}")));
            }
        } else if item.is_file() {
            let target = current.join(&item.name);
            if item.size.is_some() && local_size(&target) == item.size {
                info!(file = %item.name, "skipping existing file");
                report.skipped.push(target);
                continue;
            }
            info!(file = %item.name, "downloading");
            match api.download_file(&item, &target) {
                Ok(_) => report.downloaded.push(target),
                Err(error) => {
                    warn!(file = %item.name, %error, "download failed");
                    report.failed.push((item.name.clone(), format!("{error:#}")));
                }
            }
        } else {
            debug!(kind = %item.kind, name = %item.name, "ignoring item");
        }
    }
    Ok(())
}

/// Mirror the case subfolder into the output directory.
pub fn download(api: &mut dyn BoxApi, settings: &BoxSettings, subfolder: &str) -> Result<BoxDownloadReport> {
    fs::create_dir_all(&settings.output_dir)
        .with_context(|| format!("failed to create {}", settings.output_dir.display()))?;
    let Some(folder) = find_subfolder(api, &settings.folder_id, subfolder)? else {
        bail!(
            "Subfolder with prefix '{}' not found in Box folder {}",
            subfolder_pattern(subfolder),
            settings.folder_id
        );
    };
    let mut report = BoxDownloadReport {
        folder_id: folder.id.clone(),
        output_dir: settings.output_dir.clone(),
        ..BoxDownloadReport::default()
    };
    info!(id = %folder.id, output = %settings.output_dir.display(), "starting Box download");
    download_folder(api, &folder.id, &settings.output_dir, 0, &mut report)?;
    Ok(report)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedFile {
    pub name: String,
    pub size: Option<u64>,
    pub sha1: Option<String>,
}

impl ListedFile {
    pub fn manifest_line(&self) -> String {
        let size = self
            .size
            .map_or_else(|| "UNKNOWN_SIZE".to_string(), |size| size.to_string());
        format!(
            "sha1:{}  {size}  {}",
            self.sha1.as_deref().unwrap_or("NO_CHECKSUM"),
            self.name
        )
    }
}

fn collect_files(api: &mut dyn BoxApi, folder_id: &str, files: &mut Vec<ListedFile>) -> Result<()> {
    for item in api.folder_items(folder_id)? {
        if item.is_folder() {
            debug!(folder = %item.name, id = %item.id, "processing subfolder");
            collect_files(api, &item.id, files)?;
        } else if item.is_file() {
            debug!(file = %item.name, "found file");
            files.push(ListedFile {
                name: item.name,
                size: item.size,
                sha1: item.sha1,
            });
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct BoxListReport {
    pub folder_id: String,
    pub used_parent: bool,
    pub output_file: PathBuf,
    pub files: Vec<ListedFile>,
}

/// Write `sha1:{sha1}  {size}  {name}` for every file below the case subfolder.
/// Without a matching subfolder the parent folder is listed.
pub fn list(
    api: &mut dyn BoxApi,
    settings: &BoxSettings,
    subfolder: &str,
    output_file: &Path,
) -> Result<BoxListReport> {
    let (folder_id, used_parent) = match find_subfolder(api, &settings.folder_id, subfolder)? {
        Some(folder) => (folder.id, false),
        None => {
            warn!(
                pattern = %subfolder_pattern(subfolder),
                "subfolder not found, listing the parent folder"
            );
            (settings.folder_id.clone(), true)
        }
    };
    let mut files = Vec::new();
    collect_files(api, &folder_id, &mut files)?;

    if let Some(parent) = output_file.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let file = File::create(output_file)
        .with_context(|| format!("failed to create {}", output_file.display()))?;
    let mut writer = BufWriter::new(file);
    for listed in &files {
        writeln!(writer, "{}", listed.manifest_line())
            .with_context(|| format!("failed to write {}", output_file.display()))?;
    }
    writer
        .flush()
        .with_context(|| format!("failed to flush {}", output_file.display()))?;
    info!(count = files.len(), output = %output_file.display(), "file listing completed");

    Ok(BoxListReport {
        folder_id,
        used_parent,
        output_file: output_file.to_path_buf(),
        files,
    })
}
