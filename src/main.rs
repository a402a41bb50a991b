mod cli;

use clap::{CommandFactory, Parser};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("tbingest=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tbingest=info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Init { data_dir } => cli::init::run(data_dir),
        Commands::Submit { files, entity } => cli::submit::run(&files, entity),
        Commands::Normalize {
            file_id,
            entity,
            force,
            mapping,
            period,
        } => cli::normalize::run(file_id, entity, force, &mapping, &period),
        Commands::Status { file_id } => cli::status::run(file_id),
        Commands::Retry { file_id } => cli::retry::run(file_id),
        Commands::Files => cli::files::run(),
        Commands::Rows { file_id, status } => cli::rows::run(file_id, &status),
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "tbingest", &mut std::io::stdout());
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
