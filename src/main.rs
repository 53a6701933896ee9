//! sandbox-session - run a project's dev server inside a boot-once sandbox.
//!
//! Usage:
//!   sandbox-session serve --project <dir> [--port 8080]   # Start HTTP server
//!   sandbox-session run --project <dir>                   # Bootstrap and wait for Ctrl-C
//!   sandbox-session snapshot --project <dir>              # Print the mount tree as JSON

use clap::{Args, Parser, Subcommand};
use sandbox_session::http_server;
use sandbox_session::snapshot::{snapshot_dir, DEFAULT_IGNORE};
use sandbox_session::state::AppState;
use sandbox_session::{LocalSandbox, LocalSandboxConfig, SessionConfig, SessionController};
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "sandbox-session")]
#[command(about = "Boot-once sandbox session controller")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct ProjectArgs {
    /// Project directory to mount
    #[arg(long, default_value = ".")]
    project: PathBuf,

    /// Session config file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Package registry passed to the install command
    #[arg(long)]
    registry: Option<String>,

    /// Directory under which sandbox roots are created
    #[arg(long)]
    base_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on
        #[arg(long, default_value = "8080")]
        port: u16,

        #[command(flatten)]
        project: ProjectArgs,
    },
    /// Initialize, install, start the dev server and wait for Ctrl-C
    Run {
        #[command(flatten)]
        project: ProjectArgs,
    },
    /// Print the mount tree of a project as JSON
    Snapshot {
        /// Project directory
        #[arg(long, default_value = ".")]
        project: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve { port, project } => match build_session(&project) {
            Ok(session) => http_server::run_server(port, AppState::new(session))
                .await
                .map_err(|e| format!("server: {}", e)),
            Err(e) => Err(e),
        },
        Commands::Run { project } => match build_session(&project) {
            Ok(session) => run(session).await,
            Err(e) => Err(e),
        },
        Commands::Snapshot { project } => snapshot_dir(&project, DEFAULT_IGNORE)
            .map_err(|e| format!("snapshot {}: {}", project.display(), e))
            .and_then(|tree| {
                serde_json::to_string_pretty(&tree).map_err(|e| format!("encode: {}", e))
            })
            .map(|json| println!("{}", json)),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        exit(1);
    }
}

fn build_session(args: &ProjectArgs) -> Result<SessionController, String> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load(path).map_err(|e| e.to_string())?,
        None => SessionConfig::default(),
    };
    if let Some(registry) = &args.registry {
        config = config.with_registry(registry);
    }

    let mut local = LocalSandboxConfig::default();
    if let Some(base_dir) = &args.base_dir {
        local.base_dir = base_dir.clone();
    }

    let tree = snapshot_dir(&args.project, DEFAULT_IGNORE)
        .map_err(|e| format!("snapshot {}: {}", args.project.display(), e))?;
    info!(project = ?args.project, entries = tree.len(), "Project snapshot taken");

    Ok(SessionController::builder(Arc::new(LocalSandbox::new(local)), tree)
        .config(config)
        .build())
}

async fn run(session: SessionController) -> Result<(), String> {
    let outcome = session
        .bootstrap(|url| info!(url, "Dev server ready, open it in a browser"))
        .await;

    if let Err(e) = &outcome {
        error!(error = %e, "Bootstrap failed");
    } else {
        let _ = tokio::signal::ctrl_c().await;
        info!("Interrupted, shutting down");
    }

    session.dispose().await;
    outcome.map_err(|e| e.to_string())
}
