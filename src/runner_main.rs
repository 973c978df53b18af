// src/runner_main.rs - plotbot-runner: execution engine entry point
//
// Spawned by the host with stdio piped: stdin/stdout carry IPC frames,
// so all logging goes to stderr. Runs a single-threaded runtime; the
// runner is cooperative by design and must never contend for cores
// with controller-side work.
use clap::Parser;
use plotbot::ipc::StdioTransport;
use plotbot::runner::Runner;

#[derive(Debug, Parser)]
#[command(name = "plotbot-runner", about = "Pen plotter serial runner")]
struct Args {
    /// Never touch hardware; simulate the serial link.
    #[arg(long)]
    simulation: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    tracing::info!("Runner starting (simulation: {})", args.simulation);

    let transport = StdioTransport::new(tokio::io::stdin(), tokio::io::stdout());
    let mut runner = Runner::new(transport, args.simulation);
    match runner.run().await {
        Ok(()) => {
            tracing::info!("Runner exiting cleanly");
        }
        Err(e) => {
            // Anything escaping the main loop is an unrecoverable
            // disconnection; the controller respawns us.
            tracing::error!("Runner failed: {}", e);
            std::process::exit(1);
        }
    }
}
