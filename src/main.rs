use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use jobwarden::config::{parse_env_pair, SchedulerConfig, ServerConfig};
use jobwarden::dashboard::{run_dashboard, DashboardState};
use jobwarden::scheduler::{run_command, JobCommand, JobRequest, Scheduler};
use jobwarden::shutdown::install_shutdown_handler;
use jobwarden::store::{
    ColorHint, CompletionStore, ConsoleLine, ConsoleSink, JsonFileCompletionStore,
    MemoryCompletionStore,
};

#[derive(Parser, Debug)]
#[command(name = "jobwarden")]
#[command(version)]
#[command(about = "A local job runner with lock-key mutual exclusion")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the job queue until SIGTERM or SIGINT
    Serve(ServeArgs),

    /// Queue a single job, stream its output and exit with its return code
    Run(RunArgs),

    /// Run a command synchronously, bypassing the queue and its locks
    Exec(ExecArgs),
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct SchedulerArgs {
    /// Environment override for every job (KEY=VALUE, repeatable)
    #[arg(long = "env", value_parser = parse_env_arg)]
    env: Vec<(String, String)>,

    /// Loop sleep when the queue is empty, in milliseconds
    #[arg(long, default_value = "1000")]
    idle_sleep_ms: u64,

    /// Pause before each non-blocking output read, in milliseconds
    #[arg(long, default_value = "100")]
    read_pause_ms: u64,
}

impl SchedulerArgs {
    fn into_config(self) -> SchedulerConfig {
        SchedulerConfig {
            idle_sleep_ms: self.idle_sleep_ms,
            read_pause_ms: self.read_pause_ms,
            env: self.env,
            ..SchedulerConfig::default()
        }
    }
}

#[derive(Parser, Debug)]
struct ServeArgs {
    #[command(flatten)]
    scheduler: SchedulerArgs,

    /// Port for the HTTP status API (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// File to persist completion records in (optional)
    #[arg(long)]
    completion_path: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct CommandArgs {
    /// Run the command through `sh -c` instead of executing it directly
    #[arg(long)]
    shell: bool,

    /// Working directory for the command
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// The command to run
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

impl CommandArgs {
    fn job_command(&self) -> JobCommand {
        if self.shell {
            JobCommand::shell(self.command.join(" "))
        } else {
            JobCommand::exec(self.command.iter().cloned())
        }
    }
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Job name
    #[arg(long)]
    name: String,

    /// Lock key the job must hold while it runs (repeatable)
    #[arg(long = "lock")]
    lock_keys: Vec<String>,

    #[command(flatten)]
    scheduler: SchedulerArgs,

    #[command(flatten)]
    command: CommandArgs,
}

#[derive(Parser, Debug)]
struct ExecArgs {
    #[command(flatten)]
    command: CommandArgs,

    /// Output format
    #[arg(long, short = 'o', default_value = "text")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

// =============================================================================
// Output Types (for JSON serialization)
// =============================================================================

#[derive(Serialize)]
struct ExecOutput {
    command: String,
    exit_code: i32,
    stdout: String,
    stderr: String,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_env_arg(raw: &str) -> Result<(String, String), String> {
    parse_env_pair(raw).ok_or_else(|| format!("expected KEY=VALUE, got `{}`", raw))
}

fn init_tracing(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Map a recorded return code onto a process exit status.
fn process_exit_code(return_code: i32) -> i32 {
    if (0..=255).contains(&return_code) {
        return_code
    } else {
        1
    }
}

fn print_console_line(line: &ConsoleLine) {
    match line.color {
        ColorHint::Red => eprintln!("{}", line.text),
        _ => println!("{}", line.text),
    }
}

// =============================================================================
// Subcommands
// =============================================================================

async fn run_server(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing("info");

    let mut config = ServerConfig::new(args.scheduler.into_config());
    if let Some(port) = args.dashboard_port {
        config = config.with_dashboard(SocketAddr::from(([0, 0, 0, 0], port)));
    }
    if let Some(path) = args.completion_path {
        config = config.with_completion_path(path);
    }

    tracing::info!(
        dashboard_addr = ?config.dashboard_addr,
        completion_path = ?config.completion_path,
        "Starting jobwarden"
    );

    let completions: Arc<dyn CompletionStore> = match &config.completion_path {
        Some(path) => Arc::new(JsonFileCompletionStore::open(path).await?),
        None => Arc::new(MemoryCompletionStore::new()),
    };

    let shutdown = install_shutdown_handler();
    let (scheduler, handle) =
        Scheduler::new(config.scheduler.clone(), completions, ConsoleSink::in_memory());
    let scheduler_task = scheduler.spawn(shutdown.clone());

    if let Some(addr) = config.dashboard_addr {
        let state = DashboardState {
            scheduler: handle.clone(),
        };
        tokio::spawn(run_dashboard(addr, state, shutdown.clone()));
    }

    scheduler_task.await?;
    drop(handle);

    tracing::info!("jobwarden stopped");
    Ok(())
}

async fn run_job(args: RunArgs) -> Result<i32, Box<dyn std::error::Error>> {
    init_tracing("warn");

    let completions = Arc::new(MemoryCompletionStore::new());
    let (scheduler, handle) = Scheduler::new(
        args.scheduler.into_config(),
        completions.clone(),
        ConsoleSink::in_memory(),
    );
    let scheduler_task = scheduler.spawn(install_shutdown_handler());

    let mut request = JobRequest::new(args.name.clone(), args.command.job_command())
        .lock_keys(args.lock_keys)
        .on_output(print_console_line);
    if let Some(cwd) = args.command.cwd {
        request = request.working_directory(cwd);
    }
    handle.submit(request)?;

    // The loop exits once its last handle is gone and the queue is empty.
    drop(handle);
    scheduler_task.await?;

    match completions.get(&args.name).await? {
        Some(record) => {
            if !record.succeeded() {
                eprintln!("{}: {}", record.job_name, record.message);
            }
            Ok(process_exit_code(record.return_code))
        }
        None => {
            eprintln!("{}: no completion recorded", args.name);
            Ok(1)
        }
    }
}

async fn exec_command(args: ExecArgs) -> Result<i32, Box<dyn std::error::Error>> {
    init_tracing("warn");

    let command = args.command.job_command();
    let output = run_command(&command, args.command.cwd.as_deref(), &[]).await?;

    match args.output {
        OutputFormat::Json => {
            let out = ExecOutput {
                command: command.to_string(),
                exit_code: output.exit_code,
                stdout: output.stdout.clone(),
                stderr: output.stderr.clone(),
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Text => {
            print!("{}", output.stdout);
            eprint!("{}", output.stderr);
        }
    }

    Ok(process_exit_code(output.exit_code))
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let code = match args.command {
        Commands::Serve(serve_args) => {
            run_server(serve_args).await?;
            0
        }
        Commands::Run(run_args) => run_job(run_args).await?,
        Commands::Exec(exec_args) => exec_command(exec_args).await?,
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
