use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use reqwest::blocking::{multipart, Client};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use walkdir::WalkDir;

// Remote service surface
const API_APP: &str = "/api/app";
const API_USER_LOGIN: &str = "/api/user/login";
const API_TAG_LIST: &str = "/api/tag/list";
const API_DOCUMENT: &str = "/api/document";
const API_DOCUMENT_LIST: &str = "/api/document/list";
const API_FILE: &str = "/api/file";

const HTTP_TIMEOUT_SECS: u64 = 30;

// Stock credentials of a fresh service install
const DEFAULT_USERNAME: &str = "admin";
const DEFAULT_PASSWORD: &str = "admin";

/// docsync - mirror a local folder into a tagged remote document collection
#[derive(Parser)]
#[command(name = "docsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true, default_value = ".docsync.toml")]
    config: PathBuf,

    /// Quiet mode - suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile the remote collection against the local folder
    Sync {
        #[command(flatten)]
        service: ServiceArgs,
    },

    /// Show what a sync would do without touching the remote
    Plan {
        #[command(flatten)]
        service: ServiceArgs,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Verify the remote service is reachable
    Check {
        #[command(flatten)]
        service: ServiceArgs,
    },
}

#[derive(Args)]
struct ServiceArgs {
    /// Base URL of the document service
    #[arg(long, env = "HOST")]
    host: Option<String>,

    /// Comma-separated tag names every synced document must carry
    #[arg(long, env = "TAGS")]
    tags: Option<String>,

    /// Language code submitted with created documents
    #[arg(long, env = "LANG")]
    language: Option<String>,

    /// Local folder to mirror
    #[arg(long = "path", env = "IMPORT_PATH")]
    import_path: Option<PathBuf>,

    /// Service account user
    #[arg(long)]
    username: Option<String>,

    /// Service account password
    #[arg(long)]
    password: Option<String>,
}

#[derive(Debug, Error)]
enum SyncError {
    #[error("cannot traverse {path:?}: {source}")]
    Traversal { path: PathBuf, source: walkdir::Error },

    #[error("request to {endpoint} failed: {source}")]
    Service {
        endpoint: String,
        source: reqwest::Error,
    },

    #[error("malformed response from {endpoint}: {source}")]
    Decode {
        endpoint: String,
        source: serde_json::Error,
    },

    #[error("login rejected (status {status})")]
    Auth { status: StatusCode },

    #[error("upload of `{name}` rejected by the service: {detail}")]
    Upload { name: String, detail: String },

    #[error("{0}")]
    Config(String),
}

// Local side of a reconciliation pass
#[derive(Debug, Clone)]
struct LocalFile {
    path: PathBuf,
    display_name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct Tag {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
}

// Remote side of a reconciliation pass, snapshotted once per run
#[derive(Debug, Clone)]
struct RemoteDocument {
    id: String,
    title: String,
    tag_ids: Vec<String>,
    has_file: bool,
}

/// What a reconciliation pass decided for one local/remote pairing.
///
/// `CreateDocument` keeps the local path because a fresh document always
/// receives its file content right after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum Action {
    CreateDocument {
        title: String,
        path: PathBuf,
    },
    UploadFile {
        document_id: String,
        title: String,
        path: PathBuf,
    },
    DeleteDocument {
        document_id: String,
        title: String,
    },
}

impl Action {
    fn local_path(&self) -> Option<&Path> {
        match self {
            Action::CreateDocument { path, .. } | Action::UploadFile { path, .. } => Some(path),
            Action::DeleteDocument { .. } => None,
        }
    }
}

struct Plan {
    signature: Vec<String>,
    actions: Vec<Action>,
    files_total: usize,
    in_sync: usize,
}

// Wire shapes. The service omits fields freely, so everything defaults.
#[derive(Deserialize)]
struct VersionInfo {
    #[serde(default)]
    current_version: String,
}

#[derive(Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Vec<Tag>,
}

#[derive(Deserialize)]
struct DocumentList {
    #[serde(default)]
    documents: Vec<DocumentEntry>,
}

#[derive(Deserialize)]
struct DocumentEntry {
    #[serde(default)]
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    tags: Vec<TagRef>,
    #[serde(default)]
    file_count: u64,
}

#[derive(Deserialize)]
struct TagRef {
    #[serde(default)]
    id: String,
}

#[derive(Deserialize)]
struct CreatedDocument {
    #[serde(default)]
    id: String,
}

#[derive(Deserialize)]
struct UploadOutcome {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    status: String,
}

impl From<DocumentEntry> for RemoteDocument {
    fn from(entry: DocumentEntry) -> Self {
        RemoteDocument {
            has_file: entry.file_count > 0,
            id: entry.id,
            title: entry.title,
            tag_ids: entry.tags.into_iter().map(|t| t.id).collect(),
        }
    }
}

// Values read from the optional TOML config file
#[derive(Deserialize, Default)]
struct FileConfig {
    host: Option<String>,
    tags: Option<String>,
    language: Option<String>,
    import_path: Option<PathBuf>,
    username: Option<String>,
    password: Option<String>,
}

impl FileConfig {
    fn load(path: &Path) -> Result<Self, SyncError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("cannot read {}: {}", path.display(), e)))?;

        toml::from_str(&raw)
            .map_err(|e| SyncError::Config(format!("cannot parse {}: {}", path.display(), e)))
    }
}

// Fully resolved run configuration: flags/env beat the config file,
// credentials fall back to the service's stock pair.
#[derive(Debug)]
struct SyncConfig {
    host: String,
    tag_names: Vec<String>,
    language: String,
    import_path: PathBuf,
    username: String,
    password: String,
}

impl SyncConfig {
    fn resolve(service: ServiceArgs, file: FileConfig) -> Result<Self, SyncError> {
        let host = service.host.or(file.host).ok_or_else(|| {
            SyncError::Config("no host configured (--host, HOST, or a config file entry)".into())
        })?;

        let import_path = service.import_path.or(file.import_path).ok_or_else(|| {
            SyncError::Config(
                "no import path configured (--path, IMPORT_PATH, or a config file entry)".into(),
            )
        })?;

        Ok(SyncConfig {
            host,
            import_path,
            tag_names: parse_tag_names(&service.tags.or(file.tags).unwrap_or_default()),
            language: service.language.or(file.language).unwrap_or_default(),
            username: service
                .username
                .or(file.username)
                .unwrap_or_else(|| DEFAULT_USERNAME.to_string()),
            password: service
                .password
                .or(file.password)
                .unwrap_or_else(|| DEFAULT_PASSWORD.to_string()),
        })
    }
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Sync { service } => cmd_sync(service, &cli.config, cli.quiet),
        Commands::Plan { service, json } => cmd_plan(service, &cli.config, json, cli.quiet),
        Commands::Check { service } => cmd_check(service, &cli.config),
    };

    if let Err(e) = result {
        eprintln!("{}: {}", "error".red().bold(), e);
        std::process::exit(1);
    }
}

fn cmd_sync(service: ServiceArgs, config_path: &Path, quiet: bool) -> Result<(), SyncError> {
    let file = FileConfig::load(config_path)?;
    let config = SyncConfig::resolve(service, file)?;
    let client = DocumentClient::new(&config.host)?;

    let plan = build_plan(&client, &config, quiet)?;

    apply_plan(&client, &config, &plan, quiet)
}

fn cmd_plan(
    service: ServiceArgs,
    config_path: &Path,
    json: bool,
    quiet: bool,
) -> Result<(), SyncError> {
    let file = FileConfig::load(config_path)?;
    let config = SyncConfig::resolve(service, file)?;
    let client = DocumentClient::new(&config.host)?;

    // Progress lines would corrupt piped JSON output
    let plan = build_plan(&client, &config, quiet || json)?;

    if json {
        let rendered = serde_json::to_string_pretty(&plan.actions)
            .map_err(|e| SyncError::Config(format!("cannot render plan: {e}")))?;
        println!("{rendered}");
        return Ok(());
    }

    if plan.actions.is_empty() {
        println!("{}", "Nothing to do".green());
        return Ok(());
    }

    for action in &plan.actions {
        match action {
            Action::CreateDocument { title, .. } => {
                println!("{} {}", "create".green().bold(), title);
            }
            Action::UploadFile {
                document_id, title, ..
            } => {
                println!(
                    "{} {} (document {})",
                    "upload".cyan().bold(),
                    title,
                    document_id
                );
            }
            Action::DeleteDocument { document_id, title } => {
                println!(
                    "{} {} (document {})",
                    "delete".red().bold(),
                    title,
                    document_id
                );
            }
        }
    }

    Ok(())
}

fn cmd_check(service: ServiceArgs, config_path: &Path) -> Result<(), SyncError> {
    let file = FileConfig::load(config_path)?;
    let host = service.host.or(file.host).ok_or_else(|| {
        SyncError::Config("no host configured (--host, HOST, or a config file entry)".into())
    })?;

    let client = DocumentClient::new(&host)?;
    let version = client.check_server()?;
    println!("{} {} (version {})", "Reachable".green().bold(), host, version);

    Ok(())
}

/// Builds the full reconciliation plan from one snapshot of both sides.
///
/// Strictly sequential: health check, login, tag catalog, signature, local
/// walk, document catalog, reconcile. Nothing here mutates the remote.
fn build_plan(
    client: &DocumentClient,
    config: &SyncConfig,
    quiet: bool,
) -> Result<Plan, SyncError> {
    let version = client.check_server()?;
    if !quiet {
        println!(
            "{} {} (version {})",
            "Connected to".cyan().bold(),
            config.host,
            version
        );
    }

    client.login(&config.username, &config.password)?;

    let catalog = client.list_tags()?;
    let signature = resolve_tag_signature(&config.tag_names, &catalog);
    if !quiet && !config.tag_names.is_empty() {
        println!(
            "{} {} -> [{}]",
            "Tag signature".cyan().bold(),
            config.tag_names.join(","),
            signature.join(",")
        );
    }

    let files = gather_files(&config.import_path, quiet)?;
    let documents = client.list_documents()?;

    let actions = reconcile(&files, &documents, &signature);

    // Files no action touches already have a filed document behind them
    let touched: HashSet<&Path> = actions.iter().filter_map(|a| a.local_path()).collect();
    let mut in_sync = 0;
    for file in &files {
        if !touched.contains(file.path.as_path()) {
            in_sync += 1;
            if !quiet {
                println!("{} {} (already synced)", "skip".dimmed(), file.display_name);
            }
        }
    }

    Ok(Plan {
        signature,
        actions,
        files_total: files.len(),
        in_sync,
    })
}

/// Applies the plan in order, stopping on the first remote failure.
///
/// A local file that cannot be opened is the one tolerated failure: the
/// upload is skipped with a warning and the run continues.
fn apply_plan(
    client: &DocumentClient,
    config: &SyncConfig,
    plan: &Plan,
    quiet: bool,
) -> Result<(), SyncError> {
    let mut created = 0;
    let mut uploaded = 0;
    let mut deleted = 0;
    let mut unreadable = 0;

    for action in &plan.actions {
        match action {
            Action::CreateDocument { title, path } => {
                let id = client.create_document(title, &config.language, &plan.signature)?;
                created += 1;
                if !quiet {
                    println!("{} {}", "created".green(), title);
                }

                match File::open(path) {
                    Ok(file) => {
                        let status = client.upload_file(&id, &upload_name(title), file)?;
                        uploaded += 1;
                        if !quiet {
                            println!("{} {} (status: {})", "uploaded".cyan(), title, status);
                        }
                    }
                    Err(err) => {
                        unreadable += 1;
                        eprintln!(
                            "{}: cannot open {}: {}",
                            "warning".yellow().bold(),
                            path.display(),
                            err
                        );
                    }
                }
            }

            Action::UploadFile {
                document_id,
                title,
                path,
            } => match File::open(path) {
                Ok(file) => {
                    let status = client.upload_file(document_id, &upload_name(title), file)?;
                    uploaded += 1;
                    if !quiet {
                        println!("{} {} (status: {})", "uploaded".cyan(), title, status);
                    }
                }
                Err(err) => {
                    unreadable += 1;
                    eprintln!(
                        "{}: cannot open {}: {}",
                        "warning".yellow().bold(),
                        path.display(),
                        err
                    );
                }
            },

            Action::DeleteDocument { document_id, title } => {
                client.delete_document(document_id)?;
                deleted += 1;
                if !quiet {
                    println!("{} {}", "deleted".red(), title);
                }
            }
        }
    }

    if !quiet {
        println!();
        println!("{}", "Sync Summary".green().bold());
        println!("  Files scanned:    {}", plan.files_total.to_string().cyan());
        println!("  Already synced:   {}", plan.in_sync.to_string().cyan());
        println!("  Created:          {}", created.to_string().cyan());
        println!("  Uploaded:         {}", uploaded.to_string().cyan());
        println!("  Deleted:          {}", deleted.to_string().cyan());
        if unreadable > 0 {
            println!("  Unreadable files: {}", unreadable.to_string().yellow());
        }
    }

    Ok(())
}

/// Collects every regular file under `root`, recursively, in walk order.
fn gather_files(root: &Path, quiet: bool) -> Result<Vec<LocalFile>, SyncError> {
    let mut files = Vec::new();

    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|e| SyncError::Traversal {
            path: root.to_path_buf(),
            source: e,
        })?;

        if entry.file_type().is_dir() {
            continue;
        }

        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        if !quiet {
            println!(
                "{} {} ({} bytes)",
                "found".cyan(),
                entry.path().display(),
                size
            );
        }

        files.push(LocalFile {
            display_name: display_name(entry.path()),
            path: entry.into_path(),
        });
    }

    Ok(files)
}

/// Basename with everything from the last `.` onward removed.
///
/// `report.v2.pdf` -> `report.v2`, `README` -> `README`. A basename whose
/// only dot is the leading one derives the empty string.
fn display_name(path: &Path) -> String {
    let base = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    match base.rfind('.') {
        Some(idx) => base[..idx].to_string(),
        None => base,
    }
}

fn parse_tag_names(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Resolves configured tag names against the fetched catalog.
///
/// Each name contributes the id of every catalog entry it equals
/// byte-for-byte - zero, one, or several. Unknown names are silently
/// skipped. The result is sorted so it can be compared against a
/// document's sorted tag set directly.
fn resolve_tag_signature(names: &[String], catalog: &[Tag]) -> Vec<String> {
    let mut ids = Vec::new();

    for name in names {
        for tag in catalog {
            if tag.name == *name {
                ids.push(tag.id.clone());
            }
        }
    }

    ids.sort();
    ids
}

/// Computes the action list that makes the remote mirror the local folder.
///
/// Pass 1 walks the local files: no matching document means create (with
/// the follow-up upload implied), a match without a file means upload, a
/// match with a file means nothing. Pass 2 walks the remote documents and
/// deletes any whose title no local file carries. Both passes read only
/// the snapshot given here; nothing an earlier action changes is visible
/// to a later one.
fn reconcile(
    files: &[LocalFile],
    documents: &[RemoteDocument],
    signature: &[String],
) -> Vec<Action> {
    let mut actions = Vec::new();

    for file in files {
        match find_match(&file.display_name, documents, signature) {
            None => actions.push(Action::CreateDocument {
                title: file.display_name.clone(),
                path: file.path.clone(),
            }),
            Some(doc) if !doc.has_file => actions.push(Action::UploadFile {
                document_id: doc.id.clone(),
                title: file.display_name.clone(),
                path: file.path.clone(),
            }),
            Some(_) => {}
        }
    }

    // Deletion is decided on title alone. A document whose tags differ
    // from the signature is kept alive by a same-named local file even
    // though pass 1 treats it as a stranger.
    for doc in documents {
        let still_present = files.iter().any(|f| f.display_name == doc.title);
        if !still_present {
            actions.push(Action::DeleteDocument {
                document_id: doc.id.clone(),
                title: doc.title.clone(),
            });
        }
    }

    actions
}

// Later snapshot entries shadow earlier ones when several documents carry
// the same title and tag set.
fn find_match<'a>(
    title: &str,
    documents: &'a [RemoteDocument],
    signature: &[String],
) -> Option<&'a RemoteDocument> {
    let mut matched = None;

    for doc in documents {
        if doc.title != title {
            continue;
        }

        let mut tag_ids = doc.tag_ids.clone();
        tag_ids.sort();
        if tag_ids.as_slice() != signature {
            continue;
        }

        matched = Some(doc);
    }

    matched
}

// The service rejects `%` in multipart filenames
fn upload_name(title: &str) -> String {
    title.replace('%', "")
}

struct DocumentClient {
    http: Client,
    base_url: String,
}

impl DocumentClient {
    fn new(host: &str) -> Result<Self, SyncError> {
        let http = Client::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .map_err(|e| SyncError::Config(format!("cannot initialize http client: {e}")))?;

        Ok(DocumentClient {
            http,
            base_url: host.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }

    fn get_json<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, SyncError> {
        let body = self
            .http
            .get(self.url(endpoint))
            .send()
            .and_then(|r| r.text())
            .map_err(|e| SyncError::Service {
                endpoint: endpoint.to_string(),
                source: e,
            })?;

        serde_json::from_str(&body).map_err(|e| SyncError::Decode {
            endpoint: endpoint.to_string(),
            source: e,
        })
    }

    fn check_server(&self) -> Result<String, SyncError> {
        let info: VersionInfo = self.get_json(API_APP)?;
        Ok(info.current_version)
    }

    /// Obtains a session; the cookie store carries it for the rest of
    /// the run.
    fn login(&self, username: &str, password: &str) -> Result<(), SyncError> {
        let resp = self
            .http
            .post(self.url(API_USER_LOGIN))
            .form(&[
                ("username", username),
                ("password", password),
                ("remember", "true"),
            ])
            .send()
            .map_err(|e| SyncError::Service {
                endpoint: API_USER_LOGIN.to_string(),
                source: e,
            })?;

        if resp.status() != StatusCode::OK {
            return Err(SyncError::Auth {
                status: resp.status(),
            });
        }

        Ok(())
    }

    fn list_tags(&self) -> Result<Vec<Tag>, SyncError> {
        let list: TagList = self.get_json(API_TAG_LIST)?;
        Ok(list.tags)
    }

    fn list_documents(&self) -> Result<Vec<RemoteDocument>, SyncError> {
        let list: DocumentList = self.get_json(API_DOCUMENT_LIST)?;
        Ok(list
            .documents
            .into_iter()
            .map(RemoteDocument::from)
            .collect())
    }

    fn create_document(
        &self,
        title: &str,
        language: &str,
        tag_ids: &[String],
    ) -> Result<String, SyncError> {
        let mut form: Vec<(&str, &str)> = vec![("title", title), ("language", language)];
        for id in tag_ids {
            form.push(("tags", id.as_str()));
        }

        let body = self
            .http
            .put(self.url(API_DOCUMENT))
            .form(&form)
            .send()
            .and_then(|r| r.text())
            .map_err(|e| SyncError::Service {
                endpoint: API_DOCUMENT.to_string(),
                source: e,
            })?;

        let created: CreatedDocument =
            serde_json::from_str(&body).map_err(|e| SyncError::Decode {
                endpoint: API_DOCUMENT.to_string(),
                source: e,
            })?;

        Ok(created.id)
    }

    fn delete_document(&self, id: &str) -> Result<(), SyncError> {
        let endpoint = format!("{API_DOCUMENT}/{id}");

        self.http
            .delete(self.url(&endpoint))
            .send()
            .map_err(|e| SyncError::Service { endpoint, source: e })?;

        Ok(())
    }

    /// Attaches file content to a document. The service reports upload
    /// failures inside a successful response, so the payload type is
    /// checked, not just the transport.
    fn upload_file(
        &self,
        document_id: &str,
        file_name: &str,
        file: File,
    ) -> Result<String, SyncError> {
        let part = multipart::Part::reader(file).file_name(file_name.to_string());
        let form = multipart::Form::new()
            .text("id", document_id.to_string())
            .part("file", part);

        let body = self
            .http
            .put(self.url(API_FILE))
            .multipart(form)
            .send()
            .and_then(|r| r.text())
            .map_err(|e| SyncError::Service {
                endpoint: API_FILE.to_string(),
                source: e,
            })?;

        let outcome: UploadOutcome =
            serde_json::from_str(&body).map_err(|e| SyncError::Decode {
                endpoint: API_FILE.to_string(),
                source: e,
            })?;

        if outcome.kind == "FileError" {
            return Err(SyncError::Upload {
                name: file_name.to_string(),
                detail: body,
            });
        }

        Ok(outcome.status)
    }
}
