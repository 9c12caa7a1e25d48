//! Fieldsync CLI - capture records offline and reconcile them with the
//! remote service.

mod config;
mod share;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use fieldsync_common::{BatchId, FormId, Outcome};
use fieldsync_forms::FormsConfig;
use fieldsync_remote::{
    ConnectivityMonitor, ConnectivityProbe, HttpProbe, HttpRemote, ManualProbe, StaticSession,
};
use fieldsync_store::{ReconcileOutcome, Record, RecordStore};
use fieldsync_sync::SyncEngine;

use crate::config::CliConfig;
use crate::share::OpenShare;

#[derive(Parser)]
#[command(name = "fieldsync")]
#[command(about = "Fieldsync - offline record capture and batch export")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Print a {success, error} report as JSON.
    #[arg(long)]
    json: bool,

    /// Config file (default: config.json in the data directory).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Remote service base URL.
    #[arg(long)]
    base_url: Option<String>,

    /// Bearer token.
    #[arg(long, env = "FIELDSYNC_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Operator id sent with each record.
    #[arg(long, env = "FIELDSYNC_USER")]
    user: Option<String>,

    /// Treat the device as offline.
    #[arg(long)]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the available forms.
    Forms,

    /// Capture one record.
    Capture {
        /// Form id.
        #[arg(short, long)]
        form: String,

        /// Field values as field=value.
        #[arg(value_parser = parse_field)]
        values: Vec<(String, String)>,
    },

    /// List a form's records with their sync state.
    List {
        /// Form id.
        #[arg(short, long)]
        form: String,
    },

    /// Export all unexported records of a form as one batch.
    Export {
        /// Form id.
        #[arg(short, long)]
        form: String,
    },

    /// List the export batches created on this device.
    Batches,

    /// Show the records of an export batch.
    OpenBatch {
        /// Batch id.
        id: String,
    },

    /// Ask the server to re-send a batch notification.
    Resend {
        /// Batch id.
        id: String,
    },

    /// Download a batch artifact.
    Download {
        /// Batch id.
        id: String,

        /// Save only, do not open the file.
        #[arg(long)]
        no_share: bool,
    },

    /// List the exports known to the server.
    RemoteBatches,

    /// Deliver unsynced records once.
    Sync,

    /// Run the outbox worker until interrupted.
    Daemon,
}

fn parse_field(s: &str) -> std::result::Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected field=value, got {}", s))
}

/// `Outcome` plus an optional command payload.
#[derive(Serialize)]
struct Report {
    #[serde(flatten)]
    outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let json = cli.json;
    let result = run(cli).await;

    if json {
        let report = match &result {
            Ok(data) => Report {
                outcome: Outcome::ok(),
                data: data.clone(),
            },
            Err(e) => Report {
                outcome: Outcome::failed(format!("{:#}", e)),
                data: None,
            },
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        if result.is_err() {
            std::process::exit(1);
        }
        return Ok(());
    }

    result.map(|_| ())
}

/// Everything a command may need, built from config and flags.
struct App {
    config: CliConfig,
    forms: Arc<FormsConfig>,
}

impl App {
    fn load(cli: &Cli) -> Result<Self> {
        let mut config = CliConfig::load(cli.config.as_deref())?;
        if let Some(url) = &cli.base_url {
            config.remote.base_url = url.clone();
        }
        if cli.token.is_some() {
            config.token = cli.token.clone();
        }
        if cli.user.is_some() {
            config.user_id = cli.user.clone();
        }

        let forms_path = config.forms_path();
        let forms = FormsConfig::load(&forms_path)
            .with_context(|| format!("Failed to load forms from {}", forms_path.display()))?;

        Ok(Self {
            config,
            forms: Arc::new(forms),
        })
    }

    fn engine(&self, offline: bool, share: bool) -> Result<SyncEngine> {
        let store = RecordStore::open(self.config.database_path())
            .context("Failed to open record store")?;

        let session = Arc::new(match &self.config.token {
            Some(token) => StaticSession::new(token.clone(), self.config.user_id.clone()),
            None => StaticSession::anonymous(),
        });
        if !session.is_active() {
            warn!("No bearer token configured; remote calls will be rejected");
        }

        let remote = HttpRemote::new(self.config.remote.clone(), session.clone())
            .context("Failed to create remote client")?;

        let probe: Arc<dyn ConnectivityProbe> = if offline {
            Arc::new(ManualProbe::offline())
        } else {
            Arc::new(HttpProbe::new(&self.config.remote).context("Failed to create probe")?)
        };

        // cmd_capture delivers inline
        let mut sync_config = self.config.sync.clone().with_export_dir(self.config.export_dir());
        sync_config.upload_on_capture = false;

        Ok(SyncEngine::new(
            self.forms.clone(),
            Arc::new(store),
            Arc::new(remote),
            session,
            ConnectivityMonitor::new(probe),
            sync_config,
        )
        .with_share_target(Arc::new(OpenShare::new(share))))
    }
}

async fn run(cli: Cli) -> Result<Option<serde_json::Value>> {
    let app = App::load(&cli)?;

    match cli.command {
        Commands::Forms => cmd_forms(&app),
        Commands::Capture { form, values } => cmd_capture(&app, cli.offline, &form, values).await,
        Commands::List { form } => cmd_list(&app, &form),
        Commands::Export { form } => cmd_export(&app, cli.offline, &form).await,
        Commands::Batches => cmd_batches(&app),
        Commands::OpenBatch { id } => cmd_open_batch(&app, &id),
        Commands::Resend { id } => cmd_resend(&app, &id).await,
        Commands::Download { id, no_share } => cmd_download(&app, &id, !no_share).await,
        Commands::RemoteBatches => cmd_remote_batches(&app).await,
        Commands::Sync => cmd_sync(&app, cli.offline).await,
        Commands::Daemon => cmd_daemon(&app, cli.offline).await,
    }
}

fn form_id(value: &str) -> Result<FormId> {
    FormId::new(value).context("Invalid form id")
}

fn batch_id(value: &str) -> Result<BatchId> {
    BatchId::new(value).context("Invalid batch id")
}

fn print_records(records: &[Record]) {
    for record in records {
        let state = match (&record.export_batch_id, record.synced) {
            (Some(batch), _) => format!("exported:{}", batch),
            (None, true) => "synced".to_string(),
            (None, false) => "pending".to_string(),
        };
        println!(
            "  {}  {}  {}  {}",
            record.captured_at.format("%Y-%m-%d %H:%M:%S"),
            record.key,
            state,
            record.id
        );
    }
}

/// A record's values as `label: value`, in the form's field order.
///
/// Values of fields the form no longer declares follow, keyed by field id.
fn field_lines(record: &Record, forms: &FormsConfig) -> Vec<String> {
    let fields = forms
        .get(&record.form_id)
        .map(|form| form.fields.as_slice())
        .unwrap_or_default();

    let mut lines: Vec<String> = fields
        .iter()
        .filter_map(|f| {
            record
                .data
                .get(&f.id)
                .map(|value| format!("{}: {}", f.label, value))
        })
        .collect();
    lines.extend(
        record
            .data
            .iter()
            .filter(|(id, _)| !fields.iter().any(|f| &f.id == *id))
            .map(|(id, value)| format!("{}: {}", id, value)),
    );
    lines
}

/// List forms.
fn cmd_forms(app: &App) -> Result<Option<serde_json::Value>> {
    if app.forms.forms.is_empty() {
        println!("No forms configured.");
    }
    for form in &app.forms.forms {
        println!("{}  {}", form.id, form.title);
        if !form.subtitle.is_empty() {
            println!("    {}", form.subtitle);
        }
        let fields: Vec<&str> = form.fields.iter().map(|f| f.label.as_str()).collect();
        println!("    fields: {}", fields.join(", "));
    }
    Ok(Some(serde_json::to_value(app.forms.as_ref())?))
}

/// Capture one record and try to deliver it right away.
async fn cmd_capture(
    app: &App,
    offline: bool,
    form: &str,
    values: Vec<(String, String)>,
) -> Result<Option<serde_json::Value>> {
    let engine = app.engine(offline, false)?;
    let form_id = form_id(form)?;
    let raw: HashMap<String, String> = values.into_iter().collect();

    let outcome = engine.capture().capture(&form_id, &raw)?;
    let record = match &outcome {
        ReconcileOutcome::Inserted(r) | ReconcileOutcome::Updated(r) => r.clone(),
        ReconcileOutcome::Rejected { reason } => return Err(anyhow!("{}", reason)),
    };
    println!("Record {}: {} ({})", outcome.status(), record.key, record.id);

    if matches!(outcome, ReconcileOutcome::Inserted(_)) && app.config.sync.upload_on_capture {
        if engine.connectivity().is_online().await {
            match engine.uploader().upload(&record).await {
                Ok(()) => println!("Delivered."),
                Err(e) => warn!("Kept for later delivery: {}", e),
            }
        } else {
            info!("Offline, record kept for later delivery");
        }
    }

    Ok(Some(serde_json::json!({
        "status": outcome.status(),
        "id": record.id,
        "key": record.key,
    })))
}

/// List records of a form.
fn cmd_list(app: &App, form: &str) -> Result<Option<serde_json::Value>> {
    let engine = app.engine(true, false)?;
    let records = engine.capture().records(&form_id(form)?)?;

    if records.is_empty() {
        println!("No records.");
    } else {
        println!("{} record(s):", records.len());
        print_records(&records);
    }
    Ok(Some(serde_json::to_value(&records)?))
}

/// Export a form.
async fn cmd_export(
    app: &App,
    offline: bool,
    form: &str,
) -> Result<Option<serde_json::Value>> {
    let engine = app.engine(offline, false)?;
    let report = engine.exporter().export_form(&form_id(form)?).await?;

    println!(
        "Exported {} record(s) as batch {}",
        report.exported, report.batch_id
    );
    if !report.remaining.is_empty() {
        println!("{} record(s) still unexported", report.remaining.len());
    }
    Ok(Some(serde_json::json!({
        "batchId": report.batch_id,
        "exported": report.exported,
        "remaining": report.remaining.len(),
        "response": report.response,
    })))
}

/// List local batches.
fn cmd_batches(app: &App) -> Result<Option<serde_json::Value>> {
    let engine = app.engine(true, false)?;
    let batches = engine.browser().list_batches()?;

    if batches.is_empty() {
        println!("No exports yet.");
    }
    for batch in &batches {
        println!("  {}", batch);
    }
    Ok(Some(serde_json::to_value(&batches)?))
}

/// Show one batch.
fn cmd_open_batch(app: &App, id: &str) -> Result<Option<serde_json::Value>> {
    let engine = app.engine(true, false)?;
    let records = engine.browser().open_batch(&batch_id(id)?)?;

    println!("Batch {}: {} record(s)", id, records.len());
    for record in &records {
        print_records(std::slice::from_ref(record));
        for line in field_lines(record, &app.forms) {
            println!("      {}", line);
        }
    }
    Ok(Some(serde_json::to_value(&records)?))
}

/// Resend a batch notification.
async fn cmd_resend(app: &App, id: &str) -> Result<Option<serde_json::Value>> {
    let engine = app.engine(false, false)?;
    let response = engine.browser().resend(&batch_id(id)?).await?;

    println!("Resend requested for {}", id);
    Ok(Some(response))
}

/// Download a batch artifact.
async fn cmd_download(app: &App, id: &str, share: bool) -> Result<Option<serde_json::Value>> {
    let engine = app.engine(false, share)?;
    let outcome = engine.browser().download(&batch_id(id)?).await?;

    if outcome.shared {
        println!("Opened {}", outcome.path.display());
    } else {
        println!("Saved to {}", outcome.path.display());
    }
    Ok(Some(serde_json::json!({
        "path": outcome.path,
        "shared": outcome.shared,
    })))
}

/// List server-side exports.
async fn cmd_remote_batches(app: &App) -> Result<Option<serde_json::Value>> {
    let engine = app.engine(false, false)?;
    let listing = engine.browser().remote_batches().await?;

    println!("{}", serde_json::to_string_pretty(&listing)?);
    Ok(Some(listing))
}

/// Drain the outbox once.
async fn cmd_sync(app: &App, offline: bool) -> Result<Option<serde_json::Value>> {
    let engine = app.engine(offline, false)?;
    let (_outbox, worker) = engine.outbox();
    let report = worker.drain().await?;

    if report.offline {
        println!("Offline, nothing delivered.");
    } else {
        println!(
            "{} delivered, {} failed, {} attempted",
            report.synced, report.failed, report.attempted
        );
    }
    if report.auth_rejected {
        return Err(anyhow!("Credential rejected, sign in again"));
    }
    Ok(Some(serde_json::json!({
        "attempted": report.attempted,
        "synced": report.synced,
        "failed": report.failed,
        "offline": report.offline,
    })))
}

/// Run the outbox worker until Ctrl-C.
async fn cmd_daemon(app: &App, offline: bool) -> Result<Option<serde_json::Value>> {
    let engine = app.engine(offline, false)?;
    let (outbox, worker) = engine.outbox();
    let task = tokio::spawn(worker.run());

    info!(
        "Outbox running every {:?}, press Ctrl-C to stop",
        engine.config().outbox_interval()
    );
    let first = outbox.drain().await?;
    info!("Initial round: {} delivered", first.synced);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    outbox.shutdown().await;
    task.await.context("Outbox worker panicked")?;
    Ok(None)
}
