use clap::Parser;
use std::process::ExitCode;
use tracing::info;
use wincast::{
    built_info,
    cli::cmd::{Commands, Connection, exec, provision, upload},
};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct CommandLine {
    #[clap(flatten)]
    connection: Connection,

    #[clap(subcommand)]
    command: Commands,
}

pub fn main() -> ExitCode {
    // Parse command line options before we configure logging so we can set the
    // default level
    let command_line = CommandLine::parse();

    let default_filter = if command_line.connection.debug {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    info!(
        version = built_info::PKG_VERSION,
        commit = built_info::GIT_COMMIT_HASH_SHORT,
        built = built_info::BUILT_TIME_UTC,
        "Starting wincast"
    );

    let connection = &command_line.connection;
    match &command_line.command {
        Commands::Exec { elevated, command } => exec::run(connection, *elevated, command),
        Commands::Upload { from, to } => upload::run(connection, from, to),
        Commands::UploadDir { from, to, exclude } => {
            upload::run_dir(connection, from, to, exclude)
        }
        Commands::Provision { path } => provision::run(connection, path),
    }
}
