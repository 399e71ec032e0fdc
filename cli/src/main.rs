mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "adrule")]
#[command(about = "Condition-driven campaign adjustment engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate every rule in a rule file
    Validate {
        /// Path to the rule file
        #[arg(short, long, default_value = "adrule.yaml")]
        config: String,
    },
    /// Show which report rows a rule task would select
    Evaluate {
        /// Path to the rule file
        #[arg(short, long, default_value = "adrule.yaml")]
        config: String,

        /// Rule to evaluate
        #[arg(short, long)]
        rule: String,

        /// Report file (csv, ndjson or parquet)
        #[arg(long)]
        report: String,

        /// Task index within the rule
        #[arg(short, long, default_value_t = 0)]
        task: usize,

        /// SQL run against the file (table `report`) before evaluating
        #[arg(long)]
        sql: Option<String>,
    },
    /// List stored history records of a rule
    History {
        /// Path to the history database
        #[arg(long, default_value = "adrule_data/history")]
        db: String,

        /// Rule whose history to list
        #[arg(short, long)]
        rule: String,

        /// Maximum number of records
        #[arg(short, long, default_value_t = 20)]
        limit: usize,

        /// Print records as JSON lines
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Cli::parse();

    match args.command {
        Commands::Validate { config } => commands::validate(&config)?,
        Commands::Evaluate {
            config,
            rule,
            report,
            task,
            sql,
        } => commands::evaluate(&config, &rule, &report, task, sql.as_deref()).await?,
        Commands::History { db, rule, limit, json } => commands::history(&db, &rule, limit, json)?,
    }

    Ok(())
}
