mod commands;

use clap::{Parser, Subcommand};
use anyhow::Result;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "neuroforge-cli")]
#[command(about = "NeuroForge CLI - run submissions through the sandbox engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a local source file in the sandbox and print the outcome
    Run {
        /// Path to the source file
        file: PathBuf,

        /// Language (python, java, rust)
        #[arg(short, long)]
        language: String,

        /// Problem identifier attached to the submission
        #[arg(short, long, default_value = "cli")]
        problem: String,

        /// Run one test case with this data on stdin
        #[arg(long)]
        input: Option<String>,

        /// Expected stdout for the test case (verdict is a trimmed
        /// comparison)
        #[arg(long)]
        expect: Option<String>,

        /// Wall-clock budget in milliseconds
        #[arg(long)]
        wall_time_ms: Option<u64>,

        /// Memory ceiling in megabytes
        #[arg(long)]
        memory_mb: Option<u64>,

        /// Abort the execution after this many milliseconds (exercise
        /// cancellation)
        #[arg(long)]
        cancel_after_ms: Option<u64>,

        /// Path to a catalog.json overriding the built-in language table
        #[arg(long)]
        catalog: Option<PathBuf>,
    },

    /// List the languages the engine is configured for
    Languages {
        /// Path to a catalog.json overriding the built-in language table
        #[arg(long)]
        catalog: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            language,
            problem,
            input,
            expect,
            wall_time_ms,
            memory_mb,
            cancel_after_ms,
            catalog,
        } => {
            commands::run(
                &file,
                &language,
                &problem,
                input.as_deref(),
                expect.as_deref(),
                wall_time_ms,
                memory_mb,
                cancel_after_ms,
                catalog.as_deref(),
            )
            .await?;
        }
        Commands::Languages { catalog } => {
            commands::languages(catalog.as_deref())?;
        }
    }

    Ok(())
}
