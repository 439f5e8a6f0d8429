// clicker: control surface for clicker-daemon
//
// Commands:
//   clicker listen <id> [--wait]
//   clicker toggle [id]
//   clicker stop
//   clicker status [--json]
//   clicker watch
//   clicker click <id>
//   clicker ping | shutdown

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use clicker_lib::session::{
    config::Config,
    control::{ControlIntent, ControlSurface},
    daemon_client::{expect_status, DaemonClient, ListenOutcome},
    lifecycle::LifecycleEvent,
    notify::emit_terminal_notifications,
    persistence::{FileStore, ListenState},
    protocol::{ChannelId, DaemonNotification, DaemonRequest, DaemonResponse, SupervisorStatus},
    trigger::TriggerClient,
};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "clicker", version, about = "Listen on a clicker channel, or click one")]
struct Cli {
    /// Server host, optionally with port
    #[arg(long, global = true, env = "CLICKER_HOST")]
    host: Option<String>,

    /// Use ws:// and http:// instead of wss:// and https://
    #[arg(long, global = true)]
    insecure: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start listening on a channel (starts the daemon if needed)
    Listen {
        channel_id: String,
        /// Wait until the server accepts or refuses the connection
        #[arg(long)]
        wait: bool,
    },
    /// Start listening when idle, stop when listening
    Toggle { channel_id: Option<String> },
    /// Stop listening
    Stop,
    /// Show the listen state
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Follow lifecycle changes and raise a terminal notification for each
    Watch,
    /// Click a channel once
    Click { channel_id: String },
    /// Check that the daemon answers
    Ping,
    /// Stop the daemon; listening resumes when it next starts
    Shutdown,
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!(e))
}

fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();

    let mut config = Config::from_env();
    if let Some(host) = cli.host.as_deref().map(str::trim).filter(|h| !h.is_empty()) {
        config.endpoint.host = host.to_string();
    }
    if cli.insecure {
        config.endpoint.secure = false;
    }

    run(cli.command, &config)
}

fn run(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Listen { channel_id, wait } => {
            let channel_id = parse_channel_id(&channel_id)?;
            let mut client = DaemonClient::connect(config, true)?;
            let status = expect_status(client.request(DaemonRequest::Start {
                channel_id: channel_id.to_string(),
            })?)?;
            print_status(&status);

            if wait {
                match client.wait_for_listen(&channel_id, &status)? {
                    ListenOutcome::Listening => println!("Listening on '{}'", channel_id),
                    ListenOutcome::Stopped(reason) => {
                        bail!("{}", reason.unwrap_or_else(|| "listener stopped".to_string()))
                    }
                }
            }
            Ok(())
        }

        Commands::Toggle { channel_id } => {
            let store = FileStore::from_config(config);
            let mut surface = ControlSurface::attach(&store)?;
            let input = channel_id.unwrap_or_else(|| surface.channel_id().to_string());

            let request = match surface.listen_pressed(&input) {
                Some(ControlIntent::Start(id)) => DaemonRequest::Start {
                    channel_id: id.to_string(),
                },
                Some(ControlIntent::Stop) => DaemonRequest::Stop,
                None => bail!("No channel id given and none remembered"),
            };

            let mut client = DaemonClient::connect(config, true)?;
            let status = expect_status(client.request(request)?)?;
            print_status(&status);
            println!("[{}]", surface.button_label());
            Ok(())
        }

        Commands::Stop => {
            let mut client = match DaemonClient::connect(config, false) {
                Ok(client) => client,
                Err(_) => {
                    println!("Daemon is not running; nothing to stop");
                    return Ok(());
                }
            };
            let status = expect_status(client.request(DaemonRequest::Stop)?)?;
            print_status(&status);
            Ok(())
        }

        Commands::Status { json } => {
            let store = FileStore::from_config(config);
            let surface = ControlSurface::attach(&store)?;
            let live = DaemonClient::connect(config, false)
                .and_then(|mut client| expect_status(client.request(DaemonRequest::Status)?))
                .ok();

            if json {
                let value = match &live {
                    Some(status) => serde_json::to_value(status)?,
                    None => serde_json::json!({
                        "state": "Idle",
                        "desired_connected": surface.is_listening(),
                        "channel_id": surface.channel_id(),
                        "daemon_running": false,
                    }),
                };
                println!("{}", serde_json::to_string_pretty(&value)?);
                return Ok(());
            }

            match live {
                Some(status) => print_status(&status),
                None => {
                    println!("Daemon not running");
                    if surface.is_listening() {
                        println!(
                            "Will resume listening on '{}' when the daemon starts",
                            surface.channel_id()
                        );
                    }
                }
            }
            Ok(())
        }

        Commands::Watch => {
            let store = FileStore::from_config(config);
            let mut surface = ControlSurface::attach(&store)?;
            print_surface(&surface);

            let mut client = DaemonClient::connect(config, true)?;
            // Re-read after connecting; anything earlier was never going to be replayed
            let status = expect_status(client.request(DaemonRequest::Status)?)?;
            surface = ControlSurface::from_state(&ListenState::new(
                status.desired_connected,
                status.channel_id.clone(),
            ));

            while let Some(DaemonNotification::Lifecycle { event }) = client.next_notification()? {
                surface.apply(&event);
                print_surface(&surface);
                let message = match &event {
                    LifecycleEvent::Started { channel_id } => format!("Listening on '{}'", channel_id),
                    LifecycleEvent::Stopped => "Stopped listening".to_string(),
                };
                emit_terminal_notifications("clicker", &message);
            }

            println!("Daemon went away");
            Ok(())
        }

        Commands::Click { channel_id } => {
            let channel_id = parse_channel_id(&channel_id)?;
            let client = TriggerClient::new(config.endpoint.clone());
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("Failed to start async runtime")?;
            runtime.block_on(client.send(&channel_id))?;
            println!("Clicked '{}'", channel_id);
            Ok(())
        }

        Commands::Ping => {
            let mut client = DaemonClient::connect(config, false)?;
            match client.request(DaemonRequest::Ping)? {
                DaemonResponse::Pong => {
                    println!("pong");
                    Ok(())
                }
                other => Err(anyhow!("Unexpected response: {:?}", other)),
            }
        }

        Commands::Shutdown => {
            let mut client = match DaemonClient::connect(config, false) {
                Ok(client) => client,
                Err(_) => {
                    println!("Daemon is not running");
                    return Ok(());
                }
            };
            match client.request(DaemonRequest::Shutdown)? {
                DaemonResponse::ShuttingDown => {
                    println!("Daemon shutting down");
                    Ok(())
                }
                other => Err(anyhow!("Unexpected response: {:?}", other)),
            }
        }
    }
}

fn parse_channel_id(input: &str) -> Result<ChannelId> {
    ChannelId::new(input.trim()).map_err(|e| anyhow!(e))
}

fn print_status(status: &SupervisorStatus) {
    match (&status.live_channel, status.state) {
        (Some(channel), state) => println!("{} on '{}'", state, channel),
        (None, state) => println!("{}", state),
    }
    if let Some(err) = &status.last_error {
        println!("Last error: {}", err);
    }
}

fn print_surface(surface: &ControlSurface) {
    match surface.info_line() {
        Some(line) => println!("{}  [{}]", line, surface.button_label()),
        None => println!("Not listening  [{}]", surface.button_label()),
    }
}
