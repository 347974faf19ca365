//! Voice Chat Client
//!
//! Streams the microphone to a realtime speech API and plays the spoken
//! responses, cutting playback whenever the user starts talking.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voice_duplex::{
    audio::{device::list_devices, Microphone, Speaker},
    config::ClientConfig,
    constants::REMOTE_PCM16_SAMPLE_RATE,
    network::{TransportChannel, WsTransport},
    prompt::prompt_instructions,
    session::{send_instructions, StreamCoordinator},
};

#[derive(Parser, Debug)]
#[command(name = "voice-chat", version, about = "Full-duplex voice chat with a realtime speech API")]
struct Args {
    /// Configuration file (defaults to the user config directory)
    #[arg(short, long, env = "VOICE_CHAT_CONFIG")]
    config: Option<PathBuf>,

    /// Realtime endpoint URL
    #[arg(long)]
    url: Option<String>,

    /// Response voice
    #[arg(long)]
    voice: Option<String>,

    /// Input device name
    #[arg(long)]
    input_device: Option<String>,

    /// Output device name
    #[arg(long)]
    output_device: Option<String>,

    /// Print available audio devices and exit
    #[arg(long)]
    list_devices: bool,
}

fn print_devices() {
    println!("\n=== Available Audio Devices ===");
    for device in list_devices() {
        let device_type = match (device.is_input, device.is_output) {
            (true, true) => "Input/Output",
            (true, false) => "Input",
            (false, true) => "Output",
            _ => "Unknown",
        };
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {} ({}){}:", device.name, device_type, default_marker);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    if args.list_devices {
        print_devices();
        return Ok(());
    }

    let mut config = ClientConfig::load(args.config.as_deref())?;
    if let Some(url) = args.url {
        config.realtime.url = url;
    }
    if let Some(voice) = args.voice {
        config.realtime.voice = voice;
    }
    if args.input_device.is_some() {
        config.audio.input_device = args.input_device;
    }
    if args.output_device.is_some() {
        config.audio.output_device = args.output_device;
    }

    let api_key = config.realtime.api_key(|name| std::env::var(name).ok())?;

    tracing::info!("Starting voice chat");
    if config.audio.capture_sample_rate != REMOTE_PCM16_SAMPLE_RATE {
        tracing::warn!(
            "Capturing at {}Hz but the remote side assumes {}Hz PCM16 input",
            config.audio.capture_sample_rate,
            REMOTE_PCM16_SAMPLE_RATE
        );
    }

    let transport: Arc<dyn TransportChannel> = Arc::new(
        WsTransport::connect(&config.realtime, &api_key)
            .await
            .context("connecting to realtime endpoint")?,
    );

    let instructions = tokio::task::spawn_blocking(prompt_instructions)
        .await?
        .context("reading instructions")?;
    send_instructions(transport.as_ref(), &instructions, &config.realtime.voice)?;

    let input = Microphone::new(&config.audio);
    let output = Speaker::open(&config.audio).context("opening output device")?;

    let mut coordinator =
        StreamCoordinator::new(&config.audio, transport, Box::new(input), Box::new(output));
    coordinator.start()?;
    let control = coordinator.control();

    println!("Listening. Press Ctrl+C to stop.");

    let mut session = tokio::task::spawn_blocking(move || coordinator.wait());
    let summary = tokio::select! {
        summary = &mut session => summary?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Ctrl+C received");
            control.shutdown();
            session.await?
        }
    };

    tracing::info!("Session ended: {}", summary);
    summary.into_result()?;

    Ok(())
}
