use clap::{Parser, Subcommand};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use holdback::Config;
use holdback::commands::{
    CategoryAction, EquipmentAction, OutputOptions, ProjectAction, Session, check_pin,
    cmd_categories, cmd_equipment, cmd_modified, cmd_projects, cmd_watch,
};
use holdback::error::Result;
use holdback::model::CategoryKind;

#[derive(Parser)]
#[command(name = "holdback")]
#[command(about = "Live project dashboard backed by a hosted table store")]
#[command(version)]
struct Cli {
    /// Use an empty in-process store instead of the configured backend.
    /// Nothing is kept between runs: the store is discarded when the
    /// command exits
    #[arg(long, global = true)]
    memory: bool,

    /// PIN, required when HOLDBACK_PIN is set
    #[arg(long, global = true)]
    pin: Option<String>,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Quoted projects
    #[command(visible_alias = "p")]
    Projects {
        #[command(subcommand)]
        action: Option<ProjectAction>,
    },

    /// Construction or inspection categories
    #[command(visible_alias = "c")]
    Categories {
        /// construction or inspection
        kind: CategoryKind,
        #[command(subcommand)]
        action: Option<CategoryAction>,
    },

    /// Equipment types
    #[command(visible_alias = "e")]
    Equipment {
        #[command(subcommand)]
        action: Option<EquipmentAction>,
    },

    /// Show when the dashboard data last changed
    Modified,

    /// Follow all datasets and print changes as they arrive
    Watch,
}

fn init_tracing() {
    let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter_layer)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::from_env()?;
    check_pin(&config, cli.pin.as_deref())?;
    let session = Session::connect(&config, cli.memory)?;
    let output = OutputOptions { json: cli.json };

    match cli.command {
        Commands::Projects { action } => {
            cmd_projects(&session, action.unwrap_or(ProjectAction::Ls), output).await
        }
        Commands::Categories { kind, action } => {
            cmd_categories(&session, kind, action.unwrap_or(CategoryAction::Ls), output).await
        }
        Commands::Equipment { action } => {
            cmd_equipment(&session, action.unwrap_or(EquipmentAction::Ls), output).await
        }
        Commands::Modified => cmd_modified(&session, output).await,
        Commands::Watch => cmd_watch(&session).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}
