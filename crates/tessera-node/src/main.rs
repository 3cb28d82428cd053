//! Tessera Node
//!
//! Runs one end of a tessera connection with a synthetic stream.
//!
//! - `serve`: streaming host. Waits for a client, sends synthetic video and
//!   audio, and follows the bitrate the client asks for.
//! - `connect`: viewer. Reassembles frames, adapts the bitrate and logs
//!   network statistics.
//! - `loopback`: both ends in one process over 127.0.0.1.

mod source;

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use tessera_transport::bitrate::STARTING_BITRATE;
use tessera_transport::bundle::extract_bundle;
use tessera_transport::config::NodeConfig;
use tessera_transport::queue::FifoQueue;
use tessera_transport::session::{ReceivedFrame, ReceiverLoop, SessionEvent};
use tessera_transport::wire::MAX_PAYLOAD_SIZE;
use tessera_transport::{PacketType, Role, SocketContext, TransportError};
use tracing_subscriber::EnvFilter;

use crate::source::SyntheticSource;

const REPORT_INTERVAL: Duration = Duration::from_secs(5);
const FRAME_POLL: Duration = Duration::from_millis(50);
/// Head start for the loopback server so its listen socket is bound.
const LOOPBACK_SERVER_LEAD: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(name = "tessera-node", about = "Tessera real-time transport node")]
struct Cli {
    /// Node configuration file (TOML).
    #[arg(long, short)]
    config: PathBuf,

    /// Stop after this many seconds; 0 runs until interrupted.
    #[arg(long, default_value_t = 30)]
    duration_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host a synthetic stream for one client.
    Serve {
        #[arg(long, default_value_t = 60)]
        fps: u32,
    },
    /// View the stream of the server in `connection.destination`.
    Connect,
    /// Serve and view in one process over 127.0.0.1.
    Loopback {
        #[arg(long, default_value_t = 60)]
        fps: u32,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .compact()
        .init();

    let cli = Cli::parse();
    let text = std::fs::read_to_string(&cli.config)
        .with_context(|| format!("failed to read {}", cli.config.display()))?;
    let config = NodeConfig::from_toml_str(&text).context("invalid node config")?;
    let run_for = (cli.duration_secs > 0).then(|| Duration::from_secs(cli.duration_secs));

    tracing::info!(
        config = %cli.config.display(),
        port = config.connection.port,
        stun = ?config.connection.stun,
        "tessera-node starting"
    );

    match cli.command {
        Command::Serve { fps } => serve(&config, fps, run_for),
        Command::Connect => view(&config, run_for),
        Command::Loopback { fps } => loopback(config, fps, run_for),
    }
}

// ─── Modes ───────────────────────────────────────────────────────────────────

fn serve(config: &NodeConfig, fps: u32, run_for: Option<Duration>) -> anyhow::Result<()> {
    let ctx = open_context(Role::Server, config)?;
    let frames = Arc::new(FifoQueue::new(config.receiver.frame_queue_capacity));
    let mut receiver = ReceiverLoop::spawn(ctx.clone(), config.receiver.clone(), frames)?;

    let bitrate = Arc::new(AtomicU32::new(STARTING_BITRATE));
    let max_frame_size = config
        .nack_buffers
        .iter()
        .find(|b| b.packet_type == PacketType::Video)
        .map_or(MAX_PAYLOAD_SIZE, |b| b.max_payload_size);
    let mut source = SyntheticSource::new(fps, bitrate.clone(), max_frame_size);
    let tick = Duration::from_secs(1) / source.fps();

    let start = Instant::now();
    let mut next_tick = start;
    let mut last_report = start;
    while !expired(start, run_for) {
        for event in receiver.events().try_iter() {
            match event {
                SessionEvent::NetworkSettings(settings) => {
                    bitrate.store(settings.bitrate, Ordering::Relaxed);
                    tracing::info!(
                        bitrate = settings.bitrate,
                        burst_bitrate = settings.burst_bitrate,
                        fps = settings.fps,
                        "client requested settings"
                    );
                }
                SessionEvent::Message(message) => tracing::debug!(?message, "control message"),
                SessionEvent::Statistics(_) => {}
            }
        }

        let (id, frame) = source.next_video()?;
        if !send(&ctx, PacketType::Video, frame, id)? {
            break;
        }
        let (id, chunk) = source.next_audio();
        if !send(&ctx, PacketType::Audio, &chunk, id)? {
            break;
        }

        if last_report.elapsed() >= REPORT_INTERVAL {
            last_report = Instant::now();
            tracing::info!(frame_size = source.frame_size(), burst_bitrate = ?ctx.burst_bitrate(), "streaming");
            report_socket(&ctx);
        }

        next_tick += tick;
        let now = Instant::now();
        if next_tick > now {
            thread::sleep(next_tick - now);
        } else {
            next_tick = now;
        }
    }

    receiver.shutdown();
    report_socket(&ctx);
    ctx.close();
    Ok(())
}

fn view(config: &NodeConfig, run_for: Option<Duration>) -> anyhow::Result<()> {
    let ctx = open_context(Role::Client, config)?;
    let frames = Arc::new(FifoQueue::new(config.receiver.frame_queue_capacity));
    let mut receiver = ReceiverLoop::spawn(ctx.clone(), config.receiver.clone(), frames.clone())?;

    let start = Instant::now();
    let mut last_report = start;
    let mut tally = Tally::default();
    while !expired(start, run_for) && receiver.is_running() {
        if let Some(frame) = frames.dequeue_timeout(FRAME_POLL) {
            tally.record(&frame);
        }
        for event in receiver.events().try_iter() {
            match event {
                SessionEvent::Statistics(stats) => match serde_json::to_string(&stats) {
                    Ok(json) => tracing::info!(stats = %json, "network statistics"),
                    Err(e) => tracing::warn!(error = %e, "could not serialize statistics"),
                },
                SessionEvent::NetworkSettings(settings) => tracing::debug!(
                    bitrate = settings.bitrate,
                    burst_bitrate = settings.burst_bitrate,
                    "requested settings"
                ),
                SessionEvent::Message(message) => tracing::debug!(?message, "control message"),
            }
        }

        if last_report.elapsed() >= REPORT_INTERVAL {
            last_report = Instant::now();
            tally.log();
            report_socket(&ctx);
        }
    }

    receiver.shutdown();
    tally.log();
    report_socket(&ctx);
    ctx.close();
    Ok(())
}

fn loopback(mut config: NodeConfig, fps: u32, run_for: Option<Duration>) -> anyhow::Result<()> {
    config.connection.stun = None;
    config.connection.destination = Some(Ipv4Addr::LOCALHOST);

    let server_config = config.clone();
    let server = thread::Builder::new()
        .name("tessera-serve".into())
        .spawn(move || serve(&server_config, fps, run_for))?;
    thread::sleep(LOOPBACK_SERVER_LEAD);

    let viewed = view(&config, run_for);
    let served = server.join().map_err(|_| anyhow!("server thread panicked"))?;
    viewed.context("viewer failed")?;
    served.context("server failed")
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn open_context(role: Role, config: &NodeConfig) -> anyhow::Result<Arc<SocketContext>> {
    let ctx = SocketContext::establish(role, &config.connection)
        .with_context(|| format!("failed to connect as {role:?}"))?;
    for buf in &config.nack_buffers {
        ctx.register_nack_buffer(buf.packet_type, buf.max_payload_size, buf.num_buffers)?;
        tracing::debug!(
            packet_type = ?buf.packet_type,
            max_payload_size = buf.max_payload_size,
            num_buffers = buf.num_buffers,
            "nack buffer registered"
        );
    }
    Ok(Arc::new(ctx))
}

/// Send one unit. `Ok(false)` once the context is closed.
fn send(ctx: &SocketContext, packet_type: PacketType, payload: &[u8], id: i32) -> anyhow::Result<bool> {
    match ctx.send_packet(packet_type, payload, id) {
        Ok(()) => Ok(true),
        Err(TransportError::Closed) => Ok(false),
        Err(e @ TransportError::PayloadTooLarge { .. }) => Err(e.into()),
        Err(e) if e.is_transient() => {
            tracing::debug!(?packet_type, id, error = %e, "send interrupted");
            Ok(true)
        }
        Err(e) => {
            tracing::warn!(?packet_type, id, error = %e, "send failed");
            Ok(true)
        }
    }
}

fn report_socket(ctx: &SocketContext) {
    match serde_json::to_string(&ctx.stats()) {
        Ok(json) => tracing::info!(stats = %json, "socket stats"),
        Err(e) => tracing::warn!(error = %e, "could not serialize socket stats"),
    }
}

fn expired(start: Instant, run_for: Option<Duration>) -> bool {
    run_for.is_some_and(|d| start.elapsed() >= d)
}

#[derive(Debug, Default)]
struct Tally {
    video_frames: u64,
    video_units: u64,
    audio_chunks: u64,
    bytes: u64,
    malformed: u64,
}

impl Tally {
    fn record(&mut self, frame: &ReceivedFrame) {
        self.bytes += frame.data.len() as u64;
        match frame.packet_type {
            PacketType::Video => match extract_bundle(&frame.data) {
                Ok(units) => {
                    self.video_frames += 1;
                    self.video_units += units.len() as u64;
                }
                Err(e) => {
                    self.malformed += 1;
                    tracing::warn!(id = frame.id, error = %e, "video frame is not a bundle");
                }
            },
            PacketType::Audio => self.audio_chunks += 1,
            PacketType::Message => {}
        }
    }

    fn log(&self) {
        tracing::info!(
            video_frames = self.video_frames,
            video_units = self.video_units,
            audio_chunks = self.audio_chunks,
            bytes = self.bytes,
            malformed = self.malformed,
            "received"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_transport::bitrate::BitratePolicy;

    #[test]
    fn example_config_parses() {
        let config = NodeConfig::from_toml_str(include_str!("../node.example.toml")).unwrap();
        assert_eq!(config.connection.destination, Some(Ipv4Addr::LOCALHOST));
        assert_eq!(config.nack_buffers.len(), 2);
        assert!(config.receiver.adapt_bitrate);
        assert_eq!(config.receiver.bitrate_policy, BitratePolicy::RatioEwma);
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["tessera-node", "-c", "node.toml", "serve", "--fps", "30"]).unwrap();
        assert!(matches!(cli.command, Command::Serve { fps: 30 }));
        assert_eq!(cli.duration_secs, 30);

        let cli = Cli::try_parse_from(["tessera-node", "--config", "n.toml", "--duration-secs", "0", "connect"]).unwrap();
        assert!(matches!(cli.command, Command::Connect));
        assert_eq!(cli.duration_secs, 0);
    }

    #[test]
    fn tally_counts_units() {
        let mut tally = Tally::default();
        let mut buf = vec![0u8; 64];
        let n = tessera_transport::bundle::write_bundle(&[b"ab".as_slice(), b"cde".as_slice()], &mut buf).unwrap();
        buf.truncate(n);
        tally.record(&ReceivedFrame {
            packet_type: PacketType::Video,
            id: 0,
            data: buf.into(),
        });
        tally.record(&ReceivedFrame {
            packet_type: PacketType::Video,
            id: 1,
            data: vec![1u8, 0].into(),
        });
        assert_eq!(tally.video_frames, 1);
        assert_eq!(tally.video_units, 2);
        assert_eq!(tally.malformed, 1);
    }

    #[test]
    fn run_for_zero_never_expires() {
        let start = Instant::now();
        assert!(!expired(start, None));
        assert!(expired(start, Some(Duration::ZERO)));
    }
}
