// src/main.rs - plotbot-host: controller process entry point
use clap::Parser;
use plotbot::pen::StateEvent;
use plotbot::service::PlotterService;

#[derive(Debug, Parser)]
#[command(name = "plotbot-host", about = "Pen plotter motion controller")]
struct Args {
    /// Path to the bot configuration file.
    #[arg(short, long, default_value = "plotbot.toml")]
    config: String,
    /// Override the serial port from the config.
    #[arg(short, long)]
    port: Option<String>,
    /// Never touch hardware; run the serial link in simulation.
    #[arg(long)]
    simulation: bool,
    /// Run the runner as an in-process task instead of a child process.
    #[arg(long)]
    in_process: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    tracing::info!("Starting plotbot host");
    tracing::info!("Loading configuration from: {}", args.config);

    let mut config = match plotbot::load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(
                "Could not load '{}' ({}); continuing with defaults",
                args.config,
                e
            );
            plotbot::BotConfig::default()
        }
    };
    if let Some(port) = args.port {
        config.serial.port = Some(port);
    }

    tracing::info!(
        "Bot: {} ({}x{} steps, {}-{} sps)",
        config.name,
        config.area.width,
        config.area.height,
        config.speed.min_sps,
        config.speed.max_sps
    );

    let service = if args.in_process {
        PlotterService::spawn_in_process(config, args.simulation)
    } else {
        PlotterService::spawn(config, args.simulation)
    };

    // Log observer events until shutdown.
    let mut events = service.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(StateEvent::ActualChanged(state)) => {
                    tracing::debug!(
                        "Pen at ({:.0}, {:.0}) height {} [{}]",
                        state.x,
                        state.y,
                        state.height,
                        state.buffer_hash
                    );
                }
                Ok(StateEvent::SerialConnected { simulation }) => {
                    tracing::info!("Serial connected (simulation: {})", simulation);
                }
                Ok(StateEvent::SerialDisconnected) => {
                    tracing::warn!("Serial disconnected");
                }
                Ok(StateEvent::SerialError { kind, detail }) => {
                    tracing::warn!("Serial error [{}]: {}", kind, detail);
                }
                Ok(StateEvent::Destroyed) => {
                    tracing::error!("Runner could not be revived; exiting event loop");
                    break;
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Observer lagged by {} events", n);
                }
                Err(_) => break,
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    Ok(())
}
