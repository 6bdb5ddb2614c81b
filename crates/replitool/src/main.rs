mod tracing_init;

use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use chrono::Local;
use clap::{ArgAction, Args, Parser, Subcommand};
use replitool_core::boxcom::{self, BoxClient, BoxOverrides, BoxSettings, DEFAULT_LISTING_PATH};
use replitool_core::checksum::{scan_directory, write_manifests};
use replitool_core::config::{DEFAULT_CONFIG_FILENAME, ProjectConfig, env_non_empty};
use replitool_core::csv_markdown::{self, Conversion};
use replitool_core::http::Session;
use replitool_core::jira::{JiraClient, Keyword, get_info};
use replitool_core::manifest::compare_manifests;
use replitool_core::notebook::check_notebook;
use replitool_core::progress::format_bytes;
use replitool_core::sivacor::{self, SivacorOptions, SystemSivacor};
use replitool_core::summary::{
    DEFAULT_DATA_METADATA, DEFAULT_DIFF_STATS, parse_diff_stats_file, render_data_summary,
    render_diff_summary, summarize_data_file, summarize_diff_stats,
};
use replitool_core::template::{
    DEFAULT_INPUT_DIR, DEFAULT_REVISION_OUTPUT, DEFAULT_TEMPLATE, prepare_revision_file,
    replace_placeholders_in_file,
};
use replitool_core::vcs::SystemGit;
use replitool_core::{dataverse, openicpsr, worldbank, zenodo};
use tracing::warn;

#[derive(Debug, Parser)]
#[command(
    name = "replitool",
    version,
    about = "Fetch, compare, and reformat replication-package artifacts"
)]
struct Cli {
    #[arg(short, long, global = true, action = ArgAction::Count, help = "More logging (-v debug, -vv trace)")]
    verbose: u8,
    #[arg(long, global = true, value_name = "PATH", default_value = DEFAULT_CONFIG_FILENAME)]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Download an openICPSR deposit ZIP and unpack it")]
    Openicpsr(OpenicpsrArgs),
    #[command(about = "Download files of a Zenodo draft deposit or published record")]
    Zenodo(ZenodoArgs),
    #[command(about = "Download a World Bank reproducibility package")]
    Worldbank(WorldbankArgs),
    #[command(about = "Download files of a published Dataverse dataset")]
    Dataverse(DataverseArgs),
    #[command(name = "box-download", about = "Download a case folder from private Box storage")]
    BoxDownload(BoxDownloadArgs),
    #[command(name = "box-list", about = "List a private Box case folder with SHA-1 checksums")]
    BoxList(BoxListArgs),
    #[command(about = "Print one field of a Jira issue")]
    Jira(JiraArgs),
    #[command(about = "Download SIVACOR artifacts for a Jira case and commit them")]
    Sivacor(SivacorArgs),
    #[command(name = "compare-manifests", about = "Compare two SHA-256 manifests")]
    CompareManifests(CompareManifestsArgs),
    #[command(name = "create-manifest", about = "Write SHA-256/MD5 manifests for a directory")]
    CreateManifest(CreateManifestArgs),
    #[command(about = "Convert a CSV file to a Markdown table")]
    Csv2md(Csv2mdArgs),
    #[command(name = "check-notebook", about = "Check that notebook cells ran in order")]
    CheckNotebook(CheckNotebookArgs),
    #[command(name = "replace-placeholders", about = "Fill {{ file }} placeholders from generated files")]
    ReplacePlaceholders(ReplacePlaceholdersArgs),
    #[command(name = "prepare-revision", about = "Reset the programs appendix to its placeholder")]
    PrepareRevision(PrepareRevisionArgs),
    #[command(name = "summarize-data", about = "Megabytes per directory from a data metadata CSV")]
    SummarizeData(SummaryFileArgs),
    #[command(name = "summarize-diff-stats", about = "Summarize image difference statistics")]
    SummarizeDiffStats(SummaryFileArgs),
}

#[derive(Debug, Args)]
struct OpenicpsrArgs {
    #[arg(help = "Project id (default: openicpsr in config.yml)")]
    project_id: Option<String>,
    #[arg(default_value = ".")]
    path: PathBuf,
    #[arg(help = "Login email; prompts for the password")]
    login: Option<String>,
    #[arg(long, help = "Fall back to public project pages when the private download fails")]
    public: bool,
}

#[derive(Debug, Args)]
struct ZenodoArgs {
    record_id: String,
    #[arg(long, value_name = "TOKEN")]
    access_token: Option<String>,
    #[arg(long, default_value = ".")]
    output: PathBuf,
    #[arg(long, default_value = "generated")]
    generated: PathBuf,
    #[arg(long, help = "Use sandbox.zenodo.org")]
    sandbox: bool,
    #[arg(long, help = "Fetch a published record instead of a draft deposit")]
    published: bool,
    #[arg(long, help = "Show what would be downloaded")]
    dry_run: bool,
    #[arg(long, value_name = "LIST", help = "Comma-separated file numbers, e.g. 1,3,5")]
    files: Option<String>,
}

#[derive(Debug, Args)]
struct WorldbankArgs {
    #[arg(help = "DOI suffix, DOI, or DOI URL")]
    doi_or_id: String,
    #[arg(long, default_value = ".")]
    output: PathBuf,
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DataverseArgs {
    #[arg(long)]
    doi: String,
    #[arg(long, alias = "server_url", value_name = "URL")]
    server_url: Option<String>,
    #[arg(long, default_value = "*")]
    pattern: String,
    #[arg(long, default_value = ".")]
    output: PathBuf,
}

#[derive(Debug, Args)]
struct BoxAuthArgs {
    #[arg(help = "Case number, e.g. 1234 for aearep-1234")]
    subfolder: String,
    #[arg(long)]
    box_folder_id: Option<String>,
    #[arg(long)]
    box_key_id: Option<String>,
    #[arg(long)]
    box_enterprise_id: Option<String>,
    #[arg(long)]
    box_client_id: Option<String>,
    #[arg(long)]
    box_client_secret: Option<String>,
    #[arg(long, value_name = "DIR")]
    config_path: Option<PathBuf>,
}

impl BoxAuthArgs {
    fn overrides(&self, output_dir: Option<PathBuf>) -> BoxOverrides {
        BoxOverrides {
            folder_id: self.box_folder_id.clone(),
            key_id: self.box_key_id.clone(),
            enterprise_id: self.box_enterprise_id.clone(),
            client_id: self.box_client_id.clone(),
            client_secret: self.box_client_secret.clone(),
            config_dir: self.config_path.clone(),
            output_dir,
        }
    }
}

#[derive(Debug, Args)]
struct BoxDownloadArgs {
    #[command(flatten)]
    auth: BoxAuthArgs,
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct BoxListArgs {
    #[command(flatten)]
    auth: BoxAuthArgs,
    #[arg(long, default_value = DEFAULT_LISTING_PATH)]
    output_file: PathBuf,
}

#[derive(Debug, Args)]
struct JiraArgs {
    issue_key: String,
    #[arg(default_value = "doi", help = "doi, openicpsrurl, dcaf_private, mcid, mctitle, sivacorid")]
    keyword: String,
}

#[derive(Debug, Args)]
struct SivacorArgs {
    #[arg(help = "Jira case, e.g. aearep-1234 (default: directory name or config.yml)")]
    jira_case: Option<String>,
}

#[derive(Debug, Args)]
struct CompareManifestsArgs {
    newer: PathBuf,
    older: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct CreateManifestArgs {
    dir: PathBuf,
    #[arg(long, help = "Manifest tag (default: directory name)")]
    tag: Option<String>,
    #[arg(long, default_value = "generated")]
    generated: PathBuf,
}

#[derive(Debug, Args)]
struct Csv2mdArgs {
    csv_file: PathBuf,
    #[arg(long, help = "Output path (default: input with .csv replaced by .md)")]
    output: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct CheckNotebookArgs {
    notebook: PathBuf,
}

#[derive(Debug, Args)]
struct ReplacePlaceholdersArgs {
    #[arg(long, default_value = DEFAULT_TEMPLATE)]
    infile: PathBuf,
    #[arg(long, default_value = DEFAULT_TEMPLATE)]
    outfile: PathBuf,
    #[arg(long, default_value = DEFAULT_INPUT_DIR)]
    indir: PathBuf,
}

#[derive(Debug, Args)]
struct PrepareRevisionArgs {
    #[arg(long, default_value = DEFAULT_TEMPLATE)]
    input: PathBuf,
    #[arg(long, default_value = DEFAULT_REVISION_OUTPUT)]
    output: PathBuf,
}

#[derive(Debug, Args)]
struct SummaryFileArgs {
    #[arg(long, value_name = "PATH")]
    file: Option<PathBuf>,
}

fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    tracing_init::init_tracing(cli.verbose);

    let clean = match cli.command {
        Commands::Openicpsr(args) => run_openicpsr(&cli.config, args)?,
        Commands::Zenodo(args) => run_zenodo(args)?,
        Commands::Worldbank(args) => run_worldbank(args)?,
        Commands::Dataverse(args) => run_dataverse(args)?,
        Commands::BoxDownload(args) => run_box_download(args)?,
        Commands::BoxList(args) => run_box_list(args)?,
        Commands::Jira(args) => run_jira(args)?,
        Commands::Sivacor(args) => run_sivacor(&cli.config, args)?,
        Commands::CompareManifests(args) => run_compare_manifests(args)?,
        Commands::CreateManifest(args) => run_create_manifest(args)?,
        Commands::Csv2md(args) => run_csv2md(args)?,
        Commands::CheckNotebook(args) => run_check_notebook(args),
        Commands::ReplacePlaceholders(args) => run_replace_placeholders(args)?,
        Commands::PrepareRevision(args) => run_prepare_revision(args)?,
        Commands::SummarizeData(args) => run_summarize_data(args)?,
        Commands::SummarizeDiffStats(args) => run_summarize_diff_stats(args)?,
    };
    Ok(if clean { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn run_openicpsr(config_path: &Path, args: OpenicpsrArgs) -> Result<bool> {
    let config = ProjectConfig::load(config_path)?;
    let project_id = openicpsr::resolve_project_id(args.project_id.as_deref(), &config)?;
    let password = match &args.login {
        Some(login) => {
            println!("project_id: {project_id}");
            println!("path: {}", normalize_path(&args.path));
            println!("login: {login}");
            Some(rpassword::prompt_password("Password: ").context("failed to read password")?)
        }
        None => None,
    };
    let credentials = openicpsr::Credentials::resolve(args.login, password)?;
    let session = Session::from_env()?;
    let mut git = SystemGit::new();
    let report = openicpsr::download(
        &session,
        &credentials,
        &openicpsr::DownloadOptions {
            project_id,
            path: args.path,
            public: args.public,
        },
        &mut git,
    )?;

    println!("openicpsr download");
    println!("project_id: {}", report.project_id);
    println!("zip: {}", normalize_path(&report.zip_path));
    println!("bytes: {} ({})", report.bytes, format_bytes(report.bytes));
    println!("public_fallback: {}", format_flag(report.used_public_fallback));
    if let Some(dir) = &report.extract_dir {
        println!("extract_dir: {}", normalize_path(dir));
    }
    println!("already_extracted: {}", format_flag(report.already_extracted));
    if let Some(extracted) = &report.extracted {
        println!("extracted_files: {}", extracted.files);
        print_list("skipped_entries", &extracted.skipped);
    }
    println!("committed: {}", format_flag(report.committed));
    Ok(true)
}

fn run_zenodo(args: ZenodoArgs) -> Result<bool> {
    let selection = args
        .files
        .as_deref()
        .map(zenodo::parse_selection)
        .transpose()?;
    let session = Session::from_env()?;
    let mut git = SystemGit::new();
    let report = zenodo::download(
        &session,
        &zenodo::DownloadOptions {
            record_id: args.record_id,
            access_token: zenodo::resolve_token(args.access_token.as_deref()),
            sandbox: args.sandbox,
            published: args.published,
            output: args.output,
            generated_dir: args.generated,
            dry_run: args.dry_run,
            selection,
            date: Local::now().date_naive(),
        },
        &mut git,
    )?;

    println!("zenodo {}", if args.dry_run { "dry run" } else { "download" });
    println!("record_id: {}", report.record_id);
    println!("api: {}", report.api_base);
    println!("output_dir: {}", normalize_path(&report.output_dir));
    println!("files: {}", report.plan.len());
    for file in &report.plan {
        let state = match (file.selected, file.exists) {
            (false, _) => "not selected",
            (true, true) => "exists",
            (true, false) => "download",
        };
        println!(
            "  {}. {} ({}) [{state}]",
            file.number,
            file.remote.filename,
            format_bytes(file.remote.size)
        );
    }
    if args.dry_run {
        return Ok(true);
    }
    println!("downloaded: {}", report.downloaded.len());
    println!("skipped: {}", report.skipped.len());
    print_failures(&report.failed);
    for path in [&report.manifests.sha256, &report.manifests.md5, &report.manifests.metadata]
        .into_iter()
        .flatten()
    {
        println!("manifest: {}", normalize_path(path));
    }
    println!("committed: {}", format_flag(report.committed));
    Ok(!report.has_failures())
}

fn run_worldbank(args: WorldbankArgs) -> Result<bool> {
    let session = Session::from_env()?;
    let report = worldbank::download(
        &session,
        &worldbank::DownloadOptions {
            input: args.doi_or_id,
            output: args.output,
            dry_run: args.dry_run,
            date: Local::now().date_naive(),
        },
    )?;

    Ok(print_worldbank_report(&report, args.dry_run))
}

/// Dry runs report HEAD failures the same way downloads do.
fn print_worldbank_report(report: &worldbank::DownloadReport, dry_run: bool) -> bool {
    println!("worldbank {}", if dry_run { "dry run" } else { "download" });
    println!("doi_suffix: {}", report.suffix);
    println!("catalog_id: {}", report.catalog_id);
    println!("catalog_url: {}", report.catalog_url);
    for (from, to) in &report.redirects {
        println!("  redirect: {from} -> {to}");
    }
    println!("output_dir: {}", normalize_path(&report.output_dir));
    for file in &report.planned {
        println!(
            "  id {}: {} {} {}",
            file.download_id,
            file.kind.as_str(),
            file.size.map_or_else(|| "unknown size".to_string(), format_bytes),
            file.disposition.as_deref().unwrap_or("<no filename>")
        );
    }
    if !dry_run {
        print_list("downloaded", &report.downloaded);
        print_list("extracted", &report.extracted);
    }
    let failures = report
        .failed
        .iter()
        .map(|(id, error)| (id.to_string(), error.clone()))
        .collect::<Vec<_>>();
    print_failures(&failures);
    !report.has_failures()
}

fn run_dataverse(args: DataverseArgs) -> Result<bool> {
    let session = Session::from_env()?;
    println!("dataverse download");
    println!("doi: {}", args.doi);
    println!("pattern: {}", args.pattern);
    let report = dataverse::download(
        &session,
        &dataverse::DownloadOptions {
            doi: args.doi,
            server_url: args.server_url,
            pattern: args.pattern,
            output: args.output,
        },
    )?;
    println!("server_url: {}", report.server_url);
    println!("persistent_id: {}", report.persistent_id);
    println!("listed: {}", report.listed);
    println!("downloaded: {}", report.downloaded.len());
    for path in &report.downloaded {
        println!("  - {}", normalize_path(path));
    }
    print_failures(&report.failed);
    Ok(report.failed.is_empty())
}

fn box_client(settings: &BoxSettings) -> Result<BoxClient> {
    let private_json = env_non_empty("BOX_PRIVATE_JSON");
    BoxClient::connect(Session::from_env()?, settings, private_json.as_deref())
}

fn run_box_download(args: BoxDownloadArgs) -> Result<bool> {
    let settings = BoxSettings::from_env(args.auth.overrides(args.output_dir))?;
    let mut client = box_client(&settings)?;
    let report = boxcom::download(&mut client, &settings, &args.auth.subfolder)?;

    println!("box download");
    println!("folder_id: {}", report.folder_id);
    println!("output_dir: {}", normalize_path(&report.output_dir));
    println!("downloaded: {}", report.downloaded.len());
    println!("skipped_existing: {}", report.skipped.len());
    print_failures(&report.failed);
    Ok(!report.has_failures())
}

fn run_box_list(args: BoxListArgs) -> Result<bool> {
    let settings = BoxSettings::from_env(args.auth.overrides(None))?;
    let mut client = box_client(&settings)?;
    let report = boxcom::list(&mut client, &settings, &args.auth.subfolder, &args.output_file)?;

    println!("box listing");
    println!("folder_id: {}", report.folder_id);
    println!("used_parent_folder: {}", format_flag(report.used_parent));
    println!("files: {}", report.files.len());
    println!("output: {}", normalize_path(&report.output_file));
    Ok(true)
}

fn run_jira(args: JiraArgs) -> Result<bool> {
    let keyword = args.keyword.parse::<Keyword>()?;
    let Some(mut client) = JiraClient::from_env(Session::from_env()?) else {
        warn!("JIRA_USERNAME and JIRA_API_KEY must be set");
        return Ok(true);
    };
    let info = get_info(&mut client, &args.issue_key, keyword)?;
    if !info.is_empty() {
        println!("{info}");
    }
    Ok(true)
}

fn run_sivacor(config_path: &Path, args: SivacorArgs) -> Result<bool> {
    let config = ProjectConfig::load(config_path)?;
    let Some(mut jira) = JiraClient::from_env(Session::from_env()?) else {
        bail!("JIRA_USERNAME and JIRA_API_KEY must be set to look up the SIVACOR ID");
    };
    let cwd = env::current_dir().context("failed to resolve current directory")?;
    let mut cli = SystemSivacor::from_env();
    let mut git = SystemGit::new();
    let report = sivacor::run(
        &SivacorOptions {
            jira_case: args.jira_case,
            cwd,
        },
        &config,
        &mut jira,
        &mut cli,
        &mut git,
    )?;

    println!("sivacor download");
    println!("jira_case: {}", report.jira_case);
    println!("sivacor_id: {}", report.submission_id);
    println!("target_folder: {}", normalize_path(&report.target_folder));
    println!("zip: {}", report.zip.zip_name.as_deref().unwrap_or("<none>"));
    print_list("ignored_zips", &report.zip.ignored_zips);
    print_list("cleared_artifacts", &report.zip.cleared_artifacts);
    if let Some(extracted) = &report.zip.extracted {
        println!("extracted_files: {}", extracted.files);
    }
    println!("branch: {}", report.branch);
    println!("committed: {}", format_flag(report.committed));
    Ok(true)
}

fn run_compare_manifests(args: CompareManifestsArgs) -> Result<bool> {
    let diff = compare_manifests(&args.newer, args.older.as_deref())?;
    print!("{}", diff.render());
    Ok(true)
}

fn run_create_manifest(args: CreateManifestArgs) -> Result<bool> {
    let tag = match args.tag {
        Some(tag) => tag,
        None => args
            .dir
            .canonicalize()
            .ok()
            .as_deref()
            .unwrap_or(&args.dir)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .context("cannot derive a manifest tag from the directory; pass --tag")?,
    };
    let entries = scan_directory(&args.dir)?;
    let files = write_manifests(&args.generated, &tag, Local::now().date_naive(), &entries)?;

    println!("manifest");
    println!("dir: {}", normalize_path(&args.dir));
    println!("tag: {tag}");
    println!("files: {}", entries.len());
    for path in [&files.sha256, &files.md5, &files.metadata].into_iter().flatten() {
        println!("wrote: {}", normalize_path(path));
    }
    Ok(true)
}

fn run_csv2md(args: Csv2mdArgs) -> Result<bool> {
    let output = args
        .output
        .unwrap_or_else(|| csv_markdown::default_output_path(&args.csv_file));
    match csv_markdown::convert_file(&args.csv_file, &output)? {
        Conversion::Table { rows } => println!("wrote {rows} rows to {}", normalize_path(&output)),
        Conversion::NotUtf8 => println!("Error: CSV file is not UTF-8 encoded"),
        Conversion::NoData => println!("NOTE: CSV file is empty"),
    }
    Ok(true)
}

fn run_check_notebook(args: CheckNotebookArgs) -> bool {
    println!("{}", check_notebook(&args.notebook).to_markdown());
    true
}

fn run_replace_placeholders(args: ReplacePlaceholdersArgs) -> Result<bool> {
    println!("Input:         {}", normalize_path(&args.infile));
    println!("Output:        {}", normalize_path(&args.outfile));
    println!("Reading from:  {}", normalize_path(&args.indir));
    let substitution = replace_placeholders_in_file(&args.infile, &args.outfile, &args.indir)?;
    print_list("replaced", &substitution.used);
    Ok(true)
}

fn run_prepare_revision(args: PrepareRevisionArgs) -> Result<bool> {
    prepare_revision_file(&args.input, &args.output)?;
    println!("Processed Markdown file saved to {}", normalize_path(&args.output));
    Ok(true)
}

fn run_summarize_data(args: SummaryFileArgs) -> Result<bool> {
    let path = args.file.unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_METADATA));
    print!("{}", render_data_summary(&summarize_data_file(&path)?));
    Ok(true)
}

fn run_summarize_diff_stats(args: SummaryFileArgs) -> Result<bool> {
    let path = args.file.unwrap_or_else(|| PathBuf::from(DEFAULT_DIFF_STATS));
    let stats = parse_diff_stats_file(&path)?;
    let summary = summarize_diff_stats(&stats);
    print!("{}", render_diff_summary(summary.as_ref(), Local::now().naive_local()));
    Ok(true)
}

fn print_list(label: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    println!("{label}:");
    for item in items {
        println!("  - {item}");
    }
}

fn print_failures(failed: &[(String, String)]) {
    if failed.is_empty() {
        return;
    }
    println!("failed: {}", failed.len());
    for (name, error) in failed {
        println!("  - {name}: {error}");
    }
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
