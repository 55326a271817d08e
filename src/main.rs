use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use gridlink::accounting::{AccountingSynchronizer, FinishedStore};
use gridlink::client::ApiClient;
use gridlink::config::{
    BridgeConfig, ClusterConfig, PREF_ACCOUNTING_PASSWORD, PREF_ACCOUNTING_URL,
    PREF_ACCOUNTING_USERNAME, PREF_JOB_FILTER, PREF_RETRIEVAL_METHOD, PREF_USE_ARRAY_JOBS,
};
use gridlink::job::{FinishedRecord, JobHandle, LifecycleState};
use gridlink::shutdown::install_shutdown_handler;
use gridlink::submit::SubmitRequest;
use gridlink::{Bridge, GridError};

#[derive(Parser, Debug)]
#[command(name = "gridlink")]
#[command(version)]
#[command(about = "Bridge between a workflow orchestrator and a Grid Engine cluster")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the bridge: liveness probing, accounting sync and the HTTP API
    Serve(ServeArgs),

    /// Import an accounting file (plain or .gz) into the local table
    Ingest(IngestArgs),

    /// Job commands, answered by a running `gridlink serve`
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a job through qsub
    Submit(SubmitArgs),

    /// Show the lifecycle state of a job
    Status {
        /// Job id, `<job>` or `<job>.<task>`
        job_id: String,
    },

    /// Show the accounting record of a finished job
    Finished {
        /// Job id, `<job>` or `<job>.<task>`
        job_id: String,
    },

    /// Delete a job through qdel
    Kill {
        /// Job id as printed by submit
        job_id: String,

        /// Run qdel as this user
        #[arg(long)]
        user: Option<String>,

        /// Force deletion (qdel -f)
        #[arg(long)]
        force: bool,
    },

    /// List tracked jobs
    List {
        /// Job filter, e.g. "GridJobNamePrefix=pl_"; the server's filter when omitted
        #[arg(long)]
        filter: Option<String>,
    },
}

// =============================================================================
// Cluster Arguments (shared by serve and ingest)
// =============================================================================

#[derive(Parser, Debug)]
struct ClusterArgs {
    /// Grid Engine installation root
    #[arg(long, env = "SGE_ROOT", default_value = "/opt/sge")]
    sge_root: PathBuf,

    /// Grid Engine cell
    #[arg(long, env = "SGE_CELL", default_value = "default")]
    sge_cell: String,

    /// qmaster port
    #[arg(long, env = "SGE_QMASTER_PORT", default_value = "6444")]
    sge_port: u16,

    /// qmaster host; read from `<root>/<cell>/common/act_qmaster` when omitted
    #[arg(long)]
    qmaster_host: Option<String>,

    /// Local database for finished jobs and the sync cursor
    #[arg(long, env = "GRIDLINK_DB", default_value = "gridlink.db")]
    database: PathBuf,

    /// Finished-job retrieval method: local or arco
    #[arg(long, default_value = "local")]
    retrieval_method: String,

    /// External accounting database (ARCo) location
    #[arg(long)]
    accounting_url: Option<String>,

    /// External accounting database user
    #[arg(long)]
    accounting_username: Option<String>,

    /// External accounting database password
    #[arg(long, env = "GRIDLINK_ACCOUNTING_PASSWORD", hide_env_values = true)]
    accounting_password: Option<String>,

    /// Track array tasks individually
    #[arg(long)]
    use_array_jobs: bool,

    /// Job filter, e.g. "GridJobNamePrefix=pl_"
    #[arg(long, default_value = "")]
    job_filter: String,
}

// =============================================================================
// Client Arguments (shared by job commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Address of a running `gridlink serve`
    #[arg(long, short = 'a', env = "GRIDLINK_ADDR", default_value = "http://127.0.0.1:8080")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Command Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServeArgs {
    #[command(flatten)]
    cluster: ClusterArgs,

    /// Port for the HTTP API
    #[arg(long, default_value = "8080")]
    api_port: u16,

    /// Scratch directory for decompressing rotated accounting logs
    #[arg(long, default_value = ".")]
    work_dir: PathBuf,

    /// Accounting log to tail instead of the cell's default
    #[arg(long)]
    accounting_file: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct IngestArgs {
    #[command(flatten)]
    cluster: ClusterArgs,

    /// Accounting file to read
    path: PathBuf,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Parser, Debug)]
struct SubmitArgs {
    /// JSON submission request; other submission flags are ignored when given
    #[arg(long)]
    request: Option<PathBuf>,

    /// Program to run
    #[arg(long)]
    executable: Option<String>,

    /// Submitting user
    #[arg(long)]
    user: Option<String>,

    /// Submit as `user` through sudo
    #[arg(long)]
    escalate: bool,

    /// Job name
    #[arg(long)]
    name: Option<String>,

    /// Native resource specification, e.g. "-l h_vmem=4G"
    #[arg(long, default_value = "")]
    resources: String,

    /// Array specification, e.g. "-t 1-10"; makes this an array submission
    #[arg(long)]
    array: Option<String>,

    /// Standard output path
    #[arg(long)]
    stdout: Option<String>,

    /// Standard error path
    #[arg(long)]
    stderr: Option<String>,

    /// Environment variable passed to the job (KEY=VALUE), repeatable
    #[arg(long = "env", value_parser = parse_env_pair)]
    env: Vec<(String, String)>,

    /// Arguments passed to the executable
    #[arg(last = true)]
    args: Vec<String>,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobSubmitOutput {
    job_id: String,
}

#[derive(Serialize)]
struct JobStatusOutput {
    job_id: String,
    state: LifecycleState,
}

#[derive(Serialize)]
struct FinishedOutput {
    job_id: String,
    found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    record: Option<FinishedRecord>,
}

#[derive(Serialize)]
struct IngestOutput {
    path: String,
    records: usize,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

fn build_config(args: &ClusterArgs) -> Result<BridgeConfig, Box<dyn std::error::Error>> {
    let mut cluster = ClusterConfig {
        sge_root: args.sge_root.clone(),
        sge_cell: args.sge_cell.clone(),
        ..ClusterConfig::default()
    };
    let host = match &args.qmaster_host {
        Some(host) => host.clone(),
        None => cluster.act_qmaster_host().unwrap_or_else(|| {
            tracing::warn!("No act_qmaster file found, assuming localhost");
            "127.0.0.1".to_string()
        }),
    };
    cluster.qmaster_addr = format!("{}:{}", host, args.sge_port);

    let mut config = BridgeConfig::new(cluster);
    config.sync.database_path = args.database.clone();

    // Command-line settings go through the same path as orchestrator preferences.
    let mut prefs = HashMap::new();
    prefs.insert(
        PREF_RETRIEVAL_METHOD.to_string(),
        args.retrieval_method.clone(),
    );
    prefs.insert(
        PREF_USE_ARRAY_JOBS.to_string(),
        args.use_array_jobs.to_string(),
    );
    prefs.insert(PREF_JOB_FILTER.to_string(), args.job_filter.clone());
    if let Some(url) = &args.accounting_url {
        prefs.insert(PREF_ACCOUNTING_URL.to_string(), url.clone());
    }
    if let Some(user) = &args.accounting_username {
        prefs.insert(PREF_ACCOUNTING_USERNAME.to_string(), user.clone());
    }
    if let Some(password) = &args.accounting_password {
        prefs.insert(PREF_ACCOUNTING_PASSWORD.to_string(), password.clone());
    }
    config.apply_preferences(&prefs)?;

    Ok(config)
}

fn submit_request(args: SubmitArgs) -> Result<SubmitRequest, Box<dyn std::error::Error>> {
    if let Some(path) = args.request {
        let raw = std::fs::read_to_string(&path)?;
        return Ok(serde_json::from_str(&raw)?);
    }

    Ok(SubmitRequest {
        executable: args.executable,
        args: Some(args.args.into_iter().map(Some).collect()),
        user: args.user,
        escalate: args.escalate,
        env: args.env.into_iter().collect::<BTreeMap<_, _>>(),
        stdout_path: args.stdout,
        stderr_path: args.stderr,
        name: args.name,
        resources: args.resources,
        array: args.array,
        variables: HashMap::new(),
    })
}

fn parse_handle(job_id: &str) -> JobHandle {
    match job_id.parse() {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    }
}

/// Print a failed API call the way the server phrased it and exit.
fn exit_with(err: GridError) -> ! {
    match err {
        GridError::Api(message) => eprintln!("{}", message),
        other => eprintln!("Error: {}", other),
    }
    std::process::exit(1);
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = build_config(&args.cluster)?;
    let api_addr: SocketAddr = format!("0.0.0.0:{}", args.api_port).parse()?;
    config = config.with_api_addr(api_addr);
    config.sync.work_dir = args.work_dir;
    config.sync.accounting_file = args.accounting_file;

    tracing::info!(
        qmaster = %config.cluster.qmaster_addr,
        accounting_file = %config.accounting_file().display(),
        database = %config.sync.database_path.display(),
        method = ?config.retrieval_method,
        api_addr = %api_addr,
        "Starting gridlink bridge"
    );

    let shutdown = install_shutdown_handler();
    let (bridge, events_rx) = Bridge::connect(config).await?;
    bridge.run(events_rx, shutdown).await;

    Ok(())
}

async fn handle_ingest(args: IngestArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = build_config(&args.cluster)?;
    let store = FinishedStore::open(
        &config.sync.database_path,
        config.sync.pool_size,
        std::time::Duration::from_millis(config.accounting.reconnect_delay_ms),
    )
    .await?;
    let synchronizer =
        AccountingSynchronizer::new(store.clone(), config.accounting_file(), config.sync.clone());

    let shutdown = install_shutdown_handler();
    let records = synchronizer.import(&args.path, &shutdown).await;
    store.close();
    let records = records?;

    match args.output {
        OutputFormat::Json => {
            let output = IngestOutput {
                path: args.path.display().to_string(),
                records,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Imported {} records from {}", records, args.path.display());
        }
    }
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_job_submit(
    client: &ApiClient,
    args: SubmitArgs,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let request = submit_request(args)?;
    let job_id = client.submit(&request).await.unwrap_or_else(|e| exit_with(e));

    match output_format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&JobSubmitOutput { job_id })?
            );
        }
        OutputFormat::Table => {
            println!("Job submitted successfully!");
            println!("Job ID: {}", job_id);
        }
    }
    Ok(())
}

async fn handle_job_status(
    client: &ApiClient,
    job_id: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let handle = parse_handle(&job_id);
    let state = client.status(&handle).await.unwrap_or_else(|e| exit_with(e));

    match output_format {
        OutputFormat::Json => {
            let output = JobStatusOutput {
                job_id: handle.to_string(),
                state,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Job ID: {}", handle);
            println!("State:  {}", state);
        }
    }
    Ok(())
}

async fn handle_job_finished(
    client: &ApiClient,
    job_id: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let handle = parse_handle(&job_id);
    let record = client.finished(&handle).await.unwrap_or_else(|e| exit_with(e));

    match output_format {
        OutputFormat::Json => {
            let output = FinishedOutput {
                job_id: handle.to_string(),
                found: record.is_some(),
                record,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => match record {
            Some(record) => {
                println!("Job ID:      {}", record.handle);
                println!("Started:     {}", record.start_time.to_rfc3339());
                println!("Ended:       {}", record.end_time.to_rfc3339());
                println!("Exit Status: {}", record.exit_status);
                if record.was_killed() {
                    println!("Killed:      yes");
                }
            }
            None => {
                println!("No finished record for job {}.", handle);
            }
        },
    }
    Ok(())
}

async fn handle_job_kill(
    client: &ApiClient,
    job_id: String,
    user: Option<String>,
    force: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = client.kill(&job_id, user.as_deref(), force).await {
        exit_with(e);
    }
    println!("Job {} deleted.", job_id);
    Ok(())
}

async fn handle_job_list(
    client: &ApiClient,
    filter: Option<String>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let jobs = client
        .list(filter.as_deref())
        .await
        .unwrap_or_else(|e| exit_with(e));

    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&jobs)?);
        }
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs tracked.");
                return Ok(());
            }
            println!("{:<16} {:<18} {:<24} UPDATED", "JOB ID", "STATE", "NAME");
            for job in jobs {
                let mut state = job.state.to_string();
                if let Some(error) = job.queue_error {
                    state = format!("{} ({})", state, error);
                }
                println!(
                    "{:<16} {:<18} {:<24} {}",
                    job.job_id,
                    state,
                    job.name.as_deref().unwrap_or("-"),
                    job.updated_at
                );
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Commands::Serve(serve_args) => {
            run_server(serve_args).await?;
        }
        Commands::Ingest(ingest_args) => {
            handle_ingest(ingest_args).await?;
        }
        Commands::Job { client, command } => {
            let api = ApiClient::new(&client.addr);
            let output = &client.output;
            match command {
                JobCommands::Submit(submit_args) => {
                    handle_job_submit(&api, submit_args, output).await?;
                }
                JobCommands::Status { job_id } => {
                    handle_job_status(&api, job_id, output).await?;
                }
                JobCommands::Finished { job_id } => {
                    handle_job_finished(&api, job_id, output).await?;
                }
                JobCommands::Kill {
                    job_id,
                    user,
                    force,
                } => {
                    handle_job_kill(&api, job_id, user, force).await?;
                }
                JobCommands::List { filter } => {
                    handle_job_list(&api, filter, output).await?;
                }
            }
        }
    }

    Ok(())
}
