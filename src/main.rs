use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};

use clippy::broker;
use clippy::client::BrokerClient;
use clippy::config::WrapConfig;
use clippy::protocol::{Role, SinkKind};
use clippy::wrap;

#[derive(Debug, Parser)]
#[command(name = "clippy")]
#[command(about = "Wraps terminal agents in transparent PTYs and relays their latest completed turn")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run an agent under a transparent PTY session.
    /// Usage: clippy wrap --preset claude claude -- --continue
    Wrap(WrapConfig),
    /// Run the per-user broker daemon.
    Broker,
    /// List registered sessions.
    Sessions {
        /// Machine-readable output.
        #[arg(long)]
        json: bool,
    },
    /// Copy a session's latest completed turn into the relay buffer.
    Capture { session: String },
    /// Paste the relay buffer into a session's agent input.
    Paste { session: String },
    /// Send a session's latest completed turn to a sink.
    Deliver {
        session: String,
        #[arg(long, value_enum, default_value = "clipboard")]
        sink: SinkArg,
        /// Target path for the file sink.
        #[arg(long)]
        path: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SinkArg {
    Clipboard,
    File,
}

impl From<SinkArg> for SinkKind {
    fn from(sink: SinkArg) -> Self {
        match sink {
            SinkArg::Clipboard => SinkKind::Clipboard,
            SinkArg::File => SinkKind::File,
        }
    }
}

fn init_tracing() {
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Wrap(cfg) => {
            let disposition = wrap::run_wrap(cfg).await?;
            wrap::exit_like_child(disposition);
        }
        Commands::Broker => broker::Broker::bind().await?.serve().await,
        Commands::Sessions { json } => {
            let client = BrokerClient::connect(Role::Client).await?;
            let sessions = client.list_sessions().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            } else if sessions.is_empty() {
                println!("no sessions registered");
            } else {
                for info in sessions {
                    let turn = if info.has_turn { "turn" } else { "-" };
                    println!("{}\t{}\t{}", info.session, info.pid, turn);
                }
            }
            Ok(())
        }
        Commands::Capture { session } => {
            let client = BrokerClient::connect(Role::Client).await?;
            let (size, turn_id) = client.capture(&session).await?;
            match turn_id {
                Some(turn_id) => println!("captured {size} bytes (turn {turn_id}) from {session}"),
                None => println!("captured {size} bytes from {session}"),
            }
            Ok(())
        }
        Commands::Paste { session } => {
            let client = BrokerClient::connect(Role::Client).await?;
            client.paste(&session).await?;
            println!("pasted into {session}");
            Ok(())
        }
        Commands::Deliver {
            session,
            sink,
            path,
        } => {
            let client = BrokerClient::connect(Role::Client).await?;
            client.deliver(&session, sink.into(), path).await?;
            println!("delivered latest turn of {session}");
            Ok(())
        }
    }
}
