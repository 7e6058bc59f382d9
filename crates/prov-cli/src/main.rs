mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use commands::{BuildArgs, StatusError};
use prov_core::{ClientConfig, ConfigFile, ProcessEnv};

#[derive(Parser)]
#[command(name = "prov", about = "Send build contexts to a prov engine")]
#[command(version)]
struct Cli {
    /// Engine address (tcp://, http:// or https://)
    #[arg(short = 'H', long = "host", global = true)]
    hosts: Vec<String>,

    /// Client config file (default: $PROV_CONFIG or ~/.prov/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level, used when RUST_LOG is unset
    #[arg(short = 'l', long = "log-level", global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Work with engines
    Engine {
        #[command(subcommand)]
        action: EngineAction,
    },
}

#[derive(Subcommand)]
enum EngineAction {
    /// Build an engine from a context directory, git repository, URL or stdin
    Build {
        /// Enginefile to use (default: PATH/Enginefile)
        #[arg(short = 'f', long = "file")]
        file: Option<PathBuf>,
        /// Suppress progress and print only the final server output on success
        #[arg(short = 'q', long)]
        quiet: bool,
        /// Compress the build context with gzip
        #[arg(long)]
        compress: bool,
        /// Local directory, git URL, remote URL, or `-` to read from stdin
        context: String,
    },
}

fn main() -> ExitCode {
    let dotenv = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match dotenv {
        Ok(path) => tracing::debug!(path = %path.display(), ".env loaded"),
        Err(e) if e.not_found() => {}
        // arch-lint: allow(no-error-swallowing) reason="a broken .env only loses optional defaults; flags and config still apply"
        Err(e) => tracing::warn!(error = %e, "failed to load .env"),
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => match e.downcast_ref::<StatusError>() {
            Some(status) => {
                eprintln!("{}", status.status);
                exit_code(status.code)
            }
            None => {
                eprintln!("Error: {e:#}");
                ExitCode::FAILURE
            }
        },
    }
}

fn init_tracing(level: &str) {
    // invalid directives in `level` are skipped by EnvFilter::new
    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => tracing_subscriber::EnvFilter::new(level),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let env = ProcessEnv;
    let file = match cli.config.or_else(|| ConfigFile::default_path(&env)) {
        Some(path) => ConfigFile::load(&path)?,
        None => ConfigFile::default(),
    };
    let config = ClientConfig::resolve(&cli.hosts, &env, &file)?;

    match cli.command {
        Commands::Engine { action } => match action {
            EngineAction::Build {
                file,
                quiet,
                compress,
                context,
            } => commands::build(
                &config,
                BuildArgs {
                    file,
                    quiet,
                    compress,
                    context,
                },
            )?,
        },
    }

    Ok(())
}

/// Exit statuses are a byte; anything outside 1..=255 becomes 1.
fn exit_code(code: i32) -> ExitCode {
    match u8::try_from(code) {
        Ok(code) if code != 0 => ExitCode::from(code),
        _ => ExitCode::FAILURE,
    }
}
