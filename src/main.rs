//! practica - join practice sessions from the terminal

use anyhow::{bail, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use practica::client::{self, render_snapshot, Client};
use practica::config::Config;
use practica::protocol::Request;
use practica::session::{Role, SessionCode, SessionConfig, TimingType};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "practica")]
#[command(about = "Timed, role-based consultation practice sessions")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Server address (defaults to the configured bind address)
    #[arg(short, long, global = true)]
    server: Option<SocketAddr>,

    /// Credential token
    #[arg(short, long, global = true, env = "PRACTICA_TOKEN")]
    token: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a session and enter it
    Create {
        /// Topic to draw cases from (repeatable)
        #[arg(long = "topic", conflicts_with = "recall")]
        topics: Vec<String>,

        /// Recall date (YYYY-MM-DD) to draw cases from
        #[arg(long)]
        recall: Option<NaiveDate>,

        /// Reading time in seconds
        #[arg(long)]
        reading: Option<u32>,

        /// Consultation time in seconds
        #[arg(long)]
        consultation: Option<u32>,

        /// Let the consultation run until the doctor ends it
        #[arg(long)]
        stopwatch: bool,

        /// Your role in the session
        #[arg(long, default_value = "host")]
        role: Role,
    },
    /// Join a session by code
    Join {
        code: SessionCode,

        #[arg(long, default_value = "observer")]
        role: Role,
    },
    /// List the roles still open in a session
    Roles { code: SessionCode },
    /// Print the current state of a session
    Snapshot { code: SessionCode },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    practica::logging::init(&config.logging);

    let addr = cli.server.unwrap_or(config.server.bind);
    let Some(token) = cli.token else {
        bail!("No credential token given (use --token or PRACTICA_TOKEN)");
    };
    let mut client = Client::connect(addr, &token).await?;
    tracing::debug!(user = %client.user(), server = %addr, "Connected");

    match cli.command {
        Commands::Create {
            topics,
            recall,
            reading,
            consultation,
            stopwatch,
            role,
        } => {
            let defaults = &config.sessions;
            let session = match recall {
                Some(date) => SessionConfig::recall(date, defaults),
                None if !topics.is_empty() => SessionConfig::topics(topics, defaults),
                None => bail!("Give at least one --topic or a --recall date"),
            };
            let session = session.with_durations(
                reading.unwrap_or(defaults.default_reading_secs),
                consultation.unwrap_or(defaults.default_consultation_secs),
            );
            let session = if stopwatch {
                session.with_timing(TimingType::Stopwatch)
            } else {
                session
            };

            let snapshot = client
                .act(Request::CreateSession {
                    config: session,
                    role,
                })
                .await?;
            println!("Share this code to invite others: {}", snapshot.code);
            client::run_console(client, snapshot).await
        }
        Commands::Join { code, role } => {
            let snapshot = client.act(Request::Join { code, role }).await?;
            client::run_console(client, snapshot).await
        }
        Commands::Roles { code } => {
            let roles = client.available_roles(code).await?;
            if roles.is_empty() {
                println!("No open roles");
            }
            for role in roles {
                println!("{}", role);
            }
            Ok(())
        }
        Commands::Snapshot { code } => {
            let snapshot = client
                .act(Request::Snapshot { code: Some(code) })
                .await?;
            println!("{}", render_snapshot(&snapshot));
            Ok(())
        }
    }
}
