//! Plays a media URL on a cast receiver.
//!
//! Connects to the receiver, launches the configured receiver application,
//! attaches a media channel, loads the URL and prints status updates.
//!
//! Usage:
//!   cargo run -p pmocast --example cast_media -- <receiver_ip> [media_url]
//!
//! Example:
//!   cargo run -p pmocast --example cast_media -- 192.168.1.100

use std::env;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use crossbeam_channel::select;
use pmocast::{
    CastConfig, CastDeviceManager, CastMediaChannel, Device, DeviceManager, DeviceManagerEvent,
    MediaChannelEvent, MediaControlChannel, MediaInformation, MediaMetadata, PlayerState,
    StreamType, guess_content_type,
};

const TEST_MEDIA_URL: &str = "https://www.soundhelix.com/examples/mp3/SoundHelix-Song-1.mp3";

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <receiver_ip> [media_url]", args[0]);
        std::process::exit(1);
    }
    let ip: IpAddr = args[1]
        .parse()
        .with_context(|| format!("invalid IP address {}", args[1]))?;
    let media_url = args.get(2).map(String::as_str).unwrap_or(TEST_MEDIA_URL);

    let config = CastConfig::load(None)?;
    let device = Device::new(
        format!("chromecast-{ip}"),
        "Cast receiver",
        ip,
        config.discovery.default_port,
    );
    let manager = CastDeviceManager::with_config(device, &config);
    let manager_events = manager.subscribe();
    let channel = Arc::new(CastMediaChannel::new());
    let channel_events = channel.subscribe();

    manager.connect();

    loop {
        select! {
            recv(manager_events) -> event => match event? {
                DeviceManagerEvent::Connected => {
                    println!("✓ Connected, launching {}", config.receiver_app_id);
                    manager.launch_application(&config.receiver_app_id)?;
                }
                DeviceManagerEvent::ConnectionFailed(err) => {
                    return Err(anyhow!("connection failed: {err}"));
                }
                DeviceManagerEvent::ApplicationConnected(app) => {
                    println!("✓ {} running (session {})", app.display_name, app.session_id);
                    manager.add_channel(channel.clone())?;
                    let media = MediaInformation::new(
                        media_url,
                        StreamType::Buffered,
                        guess_content_type(media_url),
                        MediaMetadata::new().with_string("title", "pmocast demo"),
                        0.0,
                        None,
                    );
                    let request = channel.load_media(media, true, 0.0)?;
                    println!("→ Loading {media_url} (request {request})");
                }
                DeviceManagerEvent::RequestCompleted { request, result: Err(err) } => {
                    println!("✗ Request {request} failed: {err}");
                }
                DeviceManagerEvent::Disconnected(reason) => {
                    println!("Disconnected: {reason:?}");
                    return Ok(());
                }
                _ => {}
            },
            recv(channel_events) -> event => match event? {
                MediaChannelEvent::StatusUpdated(status) => {
                    println!(
                        "♪ {:?} at {:.1}s / {:?}",
                        status.player_state,
                        status.stream_position,
                        status.stream_duration()
                    );
                    if status.player_state == PlayerState::Idle {
                        println!("Playback finished");
                        manager.disconnect();
                    }
                }
                MediaChannelEvent::RequestCompleted { request, result } => {
                    println!("Request {request}: {result:?}");
                }
                MediaChannelEvent::CommandFailed { command, error } => {
                    println!("✗ {command:?} failed: {error}");
                }
                other => println!("{other:?}"),
            },
            default(Duration::from_secs(30)) => {
                println!(
                    "Position ≈ {:.1}s",
                    channel.approximate_stream_position()
                );
            }
        }
    }
}
