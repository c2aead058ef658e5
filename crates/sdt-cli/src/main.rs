//! sdt: encrypted transfers to and from the archive inbox
//!
//! Commands:
//!   upload <file> [--to <remote>]      - encrypt and upload a file in parts
//!   download <remote> [<local>]        - download and decrypt a container
//!   config show                        - display current configuration
//!
//! Exit status: 0 completed, 75 interrupted but resumable (rerun the same
//! command), 1 failed.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::SecretString;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use sdt_core::config::SdtConfig;
use sdt_core::{TransferOutcome, TransferResult};
use sdt_storage::{object_key, Credentials, OpendalStore};
use sdt_transfer::{JobConfig, KeyMaterial, TransferOrchestrator};

/// Exit status for a job that stopped with a usable checkpoint (EX_TEMPFAIL).
const EXIT_RESUMABLE: u8 = 75;

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "sdt",
    version,
    about = "Encrypted multipart transfers for the archive inbox",
    long_about = "sdt: encrypt files into the archive container format and upload or download them \
                  in resumable parts"
)]
struct Cli {
    /// Path to sdt.toml configuration file
    #[arg(long, short = 'c', env = "SDT_CONFIG", default_value = "~/.config/sdt/config.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, env = "SDT_LOG")]
    log: Option<String>,

    /// Log format; overrides the config file
    #[arg(long, env = "SDT_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Encrypt a local file and upload it
    ///
    /// Credentials are read from SDT_ACCESS_KEY and SDT_SECRET_KEY (or the
    /// standard AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY). With only
    /// SDT_ACCESS_TOKEN set, the access key doubles as the secret and the
    /// token is sent as the session token.
    Upload {
        /// Local file
        local: PathBuf,
        /// Remote path inside the account (default: the file name)
        #[arg(long)]
        to: Option<String>,
        #[command(flatten)]
        resume: ResumeArgs,
    },

    /// Download a container and decrypt it
    Download {
        /// Remote path inside the account
        remote: String,
        /// Local destination (default: remote file name in the current dir)
        local: Option<PathBuf>,
        /// Replace the destination if it already exists
        #[arg(long)]
        force_overwrite: bool,
        #[command(flatten)]
        resume: ResumeArgs,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args, Debug)]
struct ResumeArgs {
    /// Continue from a matching checkpoint (default)
    #[arg(long, conflicts_with = "restart")]
    resume: bool,
    /// Discard any checkpoint and start over
    #[arg(long)]
    restart: bool,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config_path = expand_tilde(&cli.config);
    let (config, found) = load_config(&config_path).await?;

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = match cli.log_format {
        Some(format) => format,
        None if config.log.format.eq_ignore_ascii_case("json") => LogFormat::Json,
        None => LogFormat::Text,
    };
    init_logging(&level, &format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "sdt starting"
    );
    if !found {
        warn!("config file not found: {}  (using defaults)", config_path.display());
    }

    match cli.command {
        Commands::Config { action: ConfigAction::Show } => {
            cmd_config_show(&config, &config_path, found)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Upload { local, to, resume } => {
            cmd_upload(&config, &local, to.as_deref(), &resume).await
        }
        Commands::Download { remote, local, force_overwrite, resume } => {
            cmd_download(&config, &remote, local.as_deref(), force_overwrite, &resume).await
        }
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // progress bars own stdout; logs go to stderr
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── Config loading ────────────────────────────────────────────────────────────

async fn load_config(path: &Path) -> Result<(SdtConfig, bool)> {
    if !path.exists() {
        return Ok((SdtConfig::default(), false));
    }
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading config: {}", path.display()))?;
    let config = toml::from_str(&content)
        .with_context(|| format!("parsing config: {}", path.display()))?;
    Ok((config, true))
}

/// Expand `~` in path to the user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        let home = std::env::var("HOME").unwrap_or_default();
        PathBuf::from(home).join(rest)
    } else {
        path.to_path_buf()
    }
}

// ── Credentials, keys, orchestrator ───────────────────────────────────────────

/// Resolve credentials through `lookup` (the process environment in
/// practice). The first variable of each group that is set wins.
fn resolve_credentials<F>(lookup: F) -> Result<Credentials>
where
    F: Fn(&str) -> Option<String>,
{
    let first = |names: &[&str]| names.iter().find_map(|n| lookup(*n).filter(|v| !v.is_empty()));

    let access_key = first(&["SDT_ACCESS_KEY", "AWS_ACCESS_KEY_ID"]).context(
        "S3 credentials not set\n\
         Set SDT_ACCESS_KEY and SDT_SECRET_KEY (or SDT_ACCESS_TOKEN) environment variables.\n\
         Example:\n\
         \texport SDT_ACCESS_KEY=user_example.org\n\
         \texport SDT_ACCESS_TOKEN=your-token",
    )?;
    let secret = first(&["SDT_SECRET_KEY", "AWS_SECRET_ACCESS_KEY"]);
    let token = first(&["SDT_ACCESS_TOKEN"]);

    if let Some(token) = &token {
        match token_expires_within(token, unix_now(), TOKEN_EXPIRY_WARNING) {
            Ok(true) => warn!("SDT_ACCESS_TOKEN expires within a day; fetch a new one soon"),
            Ok(false) => {}
            Err(e) => debug!("not checking access token expiry: {e:#}"),
        }
    }

    let (secret, session_token) = match (secret, token) {
        (Some(secret), token) => (secret, token),
        // token-only accounts sign with the access key as the secret
        (None, Some(token)) => (access_key.clone(), Some(token)),
        (None, None) => anyhow::bail!("SDT_SECRET_KEY or SDT_ACCESS_TOKEN environment variable not set"),
    };

    Ok(Credentials {
        access_key,
        secret: SecretString::from(secret),
        session_token: session_token.map(SecretString::from),
    })
}

/// Warn when the access token has less than this left.
const TOKEN_EXPIRY_WARNING: Duration = Duration::from_secs(24 * 60 * 60);

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Whether a JWT access token's `exp` claim falls within `window` of `now`.
/// The signature is not verified; the result is advisory only.
fn token_expires_within(token: &str, now: u64, window: Duration) -> Result<bool> {
    let payload = token
        .split('.')
        .nth(1)
        .context("access token is not a JWT")?;
    let payload = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .context("decoding access token payload")?;
    let claims: serde_json::Value =
        serde_json::from_slice(&payload).context("parsing access token claims")?;
    let exp = claims
        .get("exp")
        .and_then(|v| v.as_u64().or_else(|| v.as_f64().map(|f| f as u64)))
        .context("access token has no expiration date")?;
    Ok(exp <= now.saturating_add(window.as_secs()))
}

fn load_keys(config: &SdtConfig, need_recipients: bool) -> Result<KeyMaterial> {
    let recipients = if need_recipients {
        let paths: Vec<PathBuf> = config.keys.recipients.iter().map(|p| expand_tilde(p)).collect();
        if paths.is_empty() {
            anyhow::bail!("no recipient files configured; set keys.recipients in the config");
        }
        sdt_crypto::keys::load_recipients(&paths)?
    } else {
        Vec::new()
    };

    let identities = match &config.keys.identity {
        Some(path) => sdt_crypto::keys::load_identities(&expand_tilde(path))?,
        None => Vec::new(),
    };
    Ok(KeyMaterial::new(recipients, identities))
}

fn build_orchestrator(
    config: &SdtConfig,
    keys: KeyMaterial,
    resume: &ResumeArgs,
    force_overwrite: bool,
) -> Result<(TransferOrchestrator, String)> {
    let credentials = resolve_credentials(|name| std::env::var(name).ok())?;
    let op = sdt_storage::operator::build_from_core_config(&config.storage, &credentials)
        .context("building storage operator")?;

    let mut job = JobConfig::from_config(&config.transfer);
    job.state_dir = expand_tilde(&config.transfer.state_dir);
    job.resume = resume.resume || !resume.restart;
    job.force_overwrite = force_overwrite;

    let orchestrator = TransferOrchestrator::new(Arc::new(OpendalStore::new(op)), job, keys);
    Ok((orchestrator, credentials.access_key))
}

// ── Progress bar helpers ──────────────────────────────────────────────────────

fn make_progress_bar(prefix: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::with_template(
            "{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec} {msg}",
        )
        .context("progress bar template")?
        .progress_chars("=>-"),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

/// Run a transfer with a progress bar fed from the job's progress stream
/// and Ctrl-C wired to cancellation.
async fn run_with_progress<F>(
    orchestrator: &TransferOrchestrator,
    prefix: &str,
    transfer: F,
) -> Result<TransferResult>
where
    F: std::future::Future<Output = TransferResult>,
{
    let pb = make_progress_bar(prefix)?;

    let mut samples = orchestrator.progress().subscribe();
    let bar = pb.clone();
    let feeder = tokio::spawn(async move {
        while samples.changed().await.is_ok() {
            let sample = *samples.borrow_and_update();
            bar.set_length(sample.total_bytes);
            bar.set_position(sample.confirmed_bytes);
        }
    });

    let cancel = orchestrator.cancel_token();
    let bar = pb.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            bar.set_message("cancelling, waiting for in-flight parts...");
            cancel.cancel();
        }
    });

    let result = transfer.await;
    feeder.abort();
    interrupt.abort();

    let sample = orchestrator.progress().snapshot();
    pb.set_length(sample.total_bytes);
    pb.set_position(sample.confirmed_bytes);
    match result.outcome {
        TransferOutcome::Completed => pb.finish_with_message("done"),
        TransferOutcome::Resumable => pb.abandon_with_message("interrupted"),
        TransferOutcome::Aborted => pb.abandon_with_message("failed"),
    }
    Ok(result)
}

fn report(result: &TransferResult) -> ExitCode {
    println!();
    println!("  job:     {}", result.job_id);
    println!("  parts:   {}", result.confirmed_parts);
    println!("  bytes:   {}", fmt_bytes(result.bytes_transferred));
    match result.outcome {
        TransferOutcome::Completed => ExitCode::SUCCESS,
        TransferOutcome::Resumable => {
            if let Some(token) = &result.resume_token {
                println!("  resume:  {token}");
            }
            if let Some(e) = &result.error {
                eprintln!("interrupted: {e}");
            }
            eprintln!("rerun the same command to continue");
            ExitCode::from(EXIT_RESUMABLE)
        }
        TransferOutcome::Aborted => {
            if let Some(e) = &result.error {
                eprintln!("error: {e}");
            }
            ExitCode::FAILURE
        }
    }
}

// ── `sdt upload` ──────────────────────────────────────────────────────────────

async fn cmd_upload(
    config: &SdtConfig,
    local: &Path,
    to: Option<&str>,
    resume: &ResumeArgs,
) -> Result<ExitCode> {
    if !local.is_file() {
        anyhow::bail!("not a regular file: {}", local.display());
    }
    let keys = load_keys(config, true)?;
    if keys.identities.is_empty() {
        warn!("no keys.identity configured: an interrupted upload cannot be resumed");
    }
    let (orchestrator, account) = build_orchestrator(config, keys, resume, false)?;

    let remote = match to {
        Some(to) => to.trim_matches('/').to_string(),
        None => default_remote_name(local)?,
    };
    let key = object_key(&account, &remote);

    println!(
        "Uploading {} → {} (endpoint: {})",
        local.display(),
        key,
        config.storage.endpoint_url(),
    );

    let result = run_with_progress(&orchestrator, "upload", orchestrator.upload(local, &key)).await?;
    if result.success() {
        println!("  remote:  {key}");
    }
    Ok(report(&result))
}

fn default_remote_name(local: &Path) -> Result<String> {
    local
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .with_context(|| format!("cannot derive a remote name from {}", local.display()))
}

// ── `sdt download` ────────────────────────────────────────────────────────────

async fn cmd_download(
    config: &SdtConfig,
    remote: &str,
    local: Option<&Path>,
    force_overwrite: bool,
    resume: &ResumeArgs,
) -> Result<ExitCode> {
    let keys = load_keys(config, false)?;
    if keys.identities.is_empty() {
        anyhow::bail!("no identity configured; set keys.identity in the config");
    }
    let (orchestrator, account) = build_orchestrator(config, keys, resume, force_overwrite)?;
    let key = object_key(&account, remote);

    let local_path = match local {
        Some(p) => p.to_path_buf(),
        None => default_local_name(remote)?,
    };

    println!("Downloading {} → {}", key, local_path.display());

    let result =
        run_with_progress(&orchestrator, "download", orchestrator.download(&key, &local_path)).await?;
    if result.success() {
        println!("  local:   {}", local_path.display());
    }
    Ok(report(&result))
}

/// Last path component of the remote name.
fn default_local_name(remote: &str) -> Result<PathBuf> {
    remote
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|n| !n.is_empty() && *n != "." && *n != "..")
        .map(PathBuf::from)
        .with_context(|| format!("cannot derive a local name from '{remote}'; pass <local>"))
}

// ── `sdt config show` ─────────────────────────────────────────────────────────

fn cmd_config_show(config: &SdtConfig, config_path: &Path, found: bool) -> Result<()> {
    if found {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
