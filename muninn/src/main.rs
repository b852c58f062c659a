use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use clock::Clock;
use futures::channel::mpsc;
use miette::{IntoDiagnostic, Result, WrapErr};
use tokio::net::UdpSocket;

use muninn::config::Config;
use muninn::io;
use muninn::processor::{Processor, ProcessorChannels};

#[derive(Parser, Debug)]
#[command(name = "muninn", about = "Robot soccer perception and control core")]
struct Args {
    /// Root configuration file
    #[arg(long, default_value = "config/muninn.toml")]
    config: PathBuf,

    /// Overlay configuration, keys override the root file
    #[arg(long)]
    overlay: Option<PathBuf>,

    /// Start with the simulator flag set
    #[arg(long)]
    simulator: bool,

    /// Enable the transceiver from the start
    #[arg(long)]
    transceiver: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "muninn=info".into()),
        )
        .init();
    miette::set_panic_hook();

    let args = Args::parse();
    let config = Config::load(&args.config, args.overlay.as_deref())?;
    tracing::info!(config = %args.config.display(), "configuration loaded");

    let clock = Arc::new(Clock::new());

    let (vision_tx, vision_rx) = mpsc::unbounded();
    let (referee_tx, referee_rx) = mpsc::unbounded();
    let (command_tx, command_rx) = mpsc::unbounded();
    let (_strategy_tx, strategy_rx) = mpsc::unbounded();
    let (_response_tx, radio_response_rx) = mpsc::unbounded();
    let (status_tx, status_rx) = mpsc::unbounded();
    let (strategy_status_tx, strategy_status_rx) = mpsc::unbounded();
    let (radio_tx, radio_rx) = mpsc::unbounded();

    // initial switches arrive like any other command
    command_tx
        .unbounded_send(wire::command::Command {
            simulator: Some(wire::command::SimulatorCommand {
                enable: Some(args.simulator),
            }),
            transceiver: Some(wire::command::TransceiverCommand {
                enable: Some(args.transceiver),
            }),
            ..Default::default()
        })
        .into_diagnostic()?;

    let channels = ProcessorChannels {
        vision_rx,
        referee_rx,
        command_rx,
        strategy_rx,
        radio_response_rx,
        status_tx,
        strategy_status_tx,
        radio_tx,
    };
    let processor_clock = clock.clone();
    let controller_config = config.controller.clone();
    let processor_thread = std::thread::Builder::new()
        .name("processor".into())
        .spawn(move || {
            Processor::new(processor_clock, channels, controller_config).run();
        })
        .into_diagnostic()?;

    let runtime = tokio::runtime::Runtime::new().into_diagnostic()?;
    runtime.block_on(async {
        let vision_socket =
            io::bind_multicast(&config.network.vision_addr, config.network.vision_port).await?;
        let referee_socket =
            io::bind_multicast(&config.network.referee_addr, config.network.referee_port).await?;
        tracing::info!(
            vision = %format!("{}:{}", config.network.vision_addr, config.network.vision_port),
            referee = %format!("{}:{}", config.network.referee_addr, config.network.referee_port),
            "listening"
        );

        let status_target: SocketAddr = config
            .network
            .status_addr
            .parse()
            .into_diagnostic()
            .wrap_err("invalid status_addr")?;
        let radio_target: SocketAddr = config
            .network
            .radio_addr
            .parse()
            .into_diagnostic()
            .wrap_err("invalid radio_addr")?;
        let status_socket = UdpSocket::bind("0.0.0.0:0").await.into_diagnostic()?;
        let strategy_status_socket = UdpSocket::bind("0.0.0.0:0").await.into_diagnostic()?;
        let radio_socket = UdpSocket::bind("0.0.0.0:0").await.into_diagnostic()?;

        tokio::spawn(io::vision_receive_loop(
            vision_socket,
            clock.clone(),
            vision_tx,
        ));
        tokio::spawn(io::referee_receive_loop(referee_socket, referee_tx));
        tokio::spawn(io::status_publish_loop(
            status_socket,
            status_target,
            status_rx,
        ));
        tokio::spawn(io::status_publish_loop(
            strategy_status_socket,
            status_target,
            strategy_status_rx,
        ));
        tokio::spawn(io::radio_publish_loop(radio_socket, radio_target, radio_rx));

        // keep the runtime alive until interrupted
        tokio::signal::ctrl_c().await.into_diagnostic()?;
        tracing::info!("shutting down");
        Ok::<(), miette::Report>(())
    })?;

    // dropping the command sender stops the processor after its final tick
    drop(command_tx);
    processor_thread
        .join()
        .map_err(|_| miette::miette!("processor thread panicked"))?;
    Ok(())
}
