use anyhow::Result;
use clap::Parser;
use plf_cli::cli::commands::{self, CliContext};
use plf_cli::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let ctx = CliContext::load(cli.config.as_deref(), cli.database.as_deref(), cli.json)?;

    match cli.command {
        Commands::Status => commands::status(&ctx)?,
        Commands::Config(args) => commands::configure(&ctx, &args)?,
        Commands::Record {
            entity_type,
            entity_id,
            payload,
        } => commands::record(&ctx, &entity_type, &entity_id, &payload)?,
        Commands::Delete {
            entity_type,
            entity_id,
        } => commands::delete(&ctx, &entity_type, &entity_id)?,
        Commands::Show {
            entity_type,
            entity_id,
        } => commands::show(&ctx, &entity_type, &entity_id)?,
        Commands::Pending { limit } => commands::pending(&ctx, limit)?,
        Commands::Prune { days } => commands::prune(&ctx, days)?,
        Commands::Snapshot(cmd) => commands::handle_snapshot_command(&ctx, cmd).await?,
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}
