//! Entry point for `sliding-window`.
//!
//! Parses CLI arguments and dispatches into either **server** or **client** mode.
//! All actual protocol work is delegated to library modules; `main.rs` owns only
//! process setup (logging, signal handling, argument parsing).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use sliding_window::params::Params;
use sliding_window::server::Server;
use sliding_window::{client, SessionConfig};

/// Reliable in-order message delivery with selective repeat.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Run as a server, receiving one message per client.
    Server {
        /// Local address to bind.
        #[arg(short, long, default_value = "127.0.0.1:8080")]
        bind: String,
        /// Largest chunk size offered to clients, in bytes.
        #[arg(long)]
        max_chunk_size: Option<usize>,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Run as a client, sending one message to a server.
    Client {
        /// Remote server address.
        #[arg(short, long, default_value = "127.0.0.1:8080")]
        server: String,
        /// Message to send; read from the parameter file or stdin if absent.
        #[arg(short, long)]
        message: Option<String>,
        /// Proposed chunk size in bytes.
        #[arg(long)]
        chunk_size: Option<usize>,
        /// Send window, in chunks.
        #[arg(short, long)]
        window: Option<usize>,
        /// Retransmission timeout in milliseconds.
        #[arg(short, long)]
        timeout_ms: Option<u64>,
        /// Permute each filled window before sending it.
        #[arg(long)]
        shuffle: bool,
        #[command(flatten)]
        common: CommonArgs,
    },
}

#[derive(Args)]
struct CommonArgs {
    /// Parameter file (`message:`, `maximum_msg_size:`, `window_size:`, `timeout:`).
    #[arg(short, long)]
    params: Option<PathBuf>,
    /// Hold every outgoing ack for a random delay.
    #[arg(long)]
    delay_acks: bool,
    /// Upper bound of the ack delay in milliseconds (default: twice the timeout).
    #[arg(long)]
    ack_delay_max_ms: Option<u64>,
    /// Seed for shuffling and ack delays.
    #[arg(long)]
    seed: Option<u64>,
}

impl CommonArgs {
    /// Defaults, overlaid by the parameter file.
    fn base_config(&self) -> anyhow::Result<(SessionConfig, Params)> {
        let mut config = SessionConfig::default();
        let params = match &self.params {
            Some(path) => Params::load(path)?,
            None => Params::default(),
        };
        params.apply(&mut config);
        Ok((config, params))
    }

    /// Fault flags; without `--ack-delay-max-ms` the delay follows the negotiated timeout.
    fn apply_faults(&self, config: &mut SessionConfig) {
        config.delay_acks = self.delay_acks;
        config.fault_seed = self.seed;
        config.ack_delay = self
            .ack_delay_max_ms
            .map(|ms| Duration::ZERO..=Duration::from_millis(ms));
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();

    match cli.mode {
        Mode::Server {
            bind,
            max_chunk_size,
            common,
        } => {
            let (mut config, _) = common.base_config()?;
            if let Some(chunk) = max_chunk_size {
                config.chunk_size = chunk;
            }
            common.apply_faults(&mut config);

            log::info!("Starting server on {bind}");
            let server = Server::bind(&bind, config)
                .await
                .with_context(|| format!("cannot start server on {bind}"))?;
            server
                .serve(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        log::error!("cannot listen for ctrl-c: {e}");
                    }
                })
                .await?;
        }
        Mode::Client {
            server,
            message,
            chunk_size,
            window,
            timeout_ms,
            shuffle,
            common,
        } => {
            let (mut config, params) = common.base_config()?;
            if let Some(chunk) = chunk_size {
                config.chunk_size = chunk;
            }
            if let Some(window) = window {
                config.window_size = window;
            }
            if let Some(ms) = timeout_ms {
                config.timeout = Duration::from_millis(ms);
            }
            config.shuffle_on_send = shuffle;
            common.apply_faults(&mut config);

            let message = match message.or(params.message) {
                Some(m) => m,
                None => read_line().await?,
            };

            log::info!("Starting client, connecting to {server}");
            let report = client::send_message(&server, message.into_bytes(), config)
                .await
                .with_context(|| format!("transfer to {server} failed"))?;
            println!(
                "delivered: {} frame(s) sent, {} retransmission(s), {} ack(s) received",
                report.stats.frames_sent, report.stats.retransmissions, report.stats.acks_received
            );
        }
    }
    Ok(())
}

/// One line of stdin, without its line terminator.
async fn read_line() -> anyhow::Result<String> {
    println!("Input: ");
    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("cannot read message from stdin")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_owned())
}
