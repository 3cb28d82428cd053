//! # Receiver Loop
//!
//! One thread per connection drains the socket context:
//!
//! - MESSAGE packets are decoded as [`ControlMessage`]s. NACKs are answered
//!   from the NACK buffers, network settings are applied to the server's
//!   throttler, and everything else is forwarded on the event channel.
//! - VIDEO and AUDIO packets feed a [`FrameRing`] per type; completed units
//!   go into the shared frame queue for the decoder/renderer.
//! - Every `nack_interval` missing fragments are requested from the peer.
//! - Every `statistics_period` the counters become [`NetworkStatistics`];
//!   with `adapt_bitrate` the [`BitrateController`] turns them into
//!   settings that are sent to the server.
//!
//! The bitrate controller lives entirely on this thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use quanta::Instant;

use crate::bitrate::{BitrateController, NetworkSettings, NetworkStatistics};
use crate::config::ReceiverConfig;
use crate::error::{Result, TransportError};
use crate::message::ControlMessage;
use crate::queue::FifoQueue;
use crate::ring::{FrameRing, FrameRingConfig, ReceiveOutcome};
use crate::socket::{Role, SocketContext};
use crate::stats::StatisticsWindow;
use crate::wire::{Packet, PacketType};

const EVENT_CHANNEL_CAPACITY: usize = 256;
/// Pause after an unexpected read error before trying again.
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(5);

/// A reassembled video frame or audio chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFrame {
    pub packet_type: PacketType,
    pub id: i32,
    pub data: Bytes,
}

/// Things the application may want to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Cursor, clipboard or file payload from the peer.
    Message(ControlMessage),
    /// Settings the client asked for (server) or just requested (client).
    NetworkSettings(NetworkSettings),
    /// One closed statistics period.
    Statistics(NetworkStatistics),
}

pub struct ReceiverLoop {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    events: Receiver<SessionEvent>,
}

impl ReceiverLoop {
    pub fn spawn(
        ctx: Arc<SocketContext>,
        config: ReceiverConfig,
        frames: Arc<FifoQueue<ReceivedFrame>>,
    ) -> Result<Self> {
        let (events_tx, events_rx) = bounded(EVENT_CHANNEL_CAPACITY);
        let running = Arc::new(AtomicBool::new(true));
        let running_clone = running.clone();
        let name = format!("tessera-recv-{:?}", ctx.role()).to_lowercase();

        let handle = thread::Builder::new().name(name).spawn(move || {
            let mut worker = Worker::new(ctx, config, frames, events_tx);
            worker.run(&running_clone);
        })?;

        Ok(ReceiverLoop {
            running,
            handle: Some(handle),
            events: events_rx,
        })
    }

    pub fn events(&self) -> &Receiver<SessionEvent> {
        &self.events
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stop the thread and wait for it. It notices within one read timeout.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ReceiverLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ─── Worker ──────────────────────────────────────────────────────────────────

struct Worker {
    ctx: Arc<SocketContext>,
    config: ReceiverConfig,
    frames: Arc<FifoQueue<ReceivedFrame>>,
    events: Sender<SessionEvent>,
    video: FrameRing,
    audio: FrameRing,
    window: StatisticsWindow,
    controller: BitrateController,
    last_nack_check: Instant,
    /// Ring eviction counts already folded into the window.
    skipped_seen: u64,
}

impl Worker {
    fn new(
        ctx: Arc<SocketContext>,
        config: ReceiverConfig,
        frames: Arc<FifoQueue<ReceivedFrame>>,
        events: Sender<SessionEvent>,
    ) -> Self {
        let ring_config = FrameRingConfig {
            ring_size: config.ring_size,
            ..FrameRingConfig::default()
        };
        Worker {
            video: FrameRing::new(PacketType::Video, ring_config.clone()),
            audio: FrameRing::new(PacketType::Audio, ring_config),
            window: StatisticsWindow::new(config.statistics_period),
            controller: BitrateController::new(config.bitrate_policy),
            last_nack_check: Instant::now(),
            skipped_seen: 0,
            ctx,
            config,
            frames,
            events,
        }
    }

    fn run(&mut self, running: &AtomicBool) {
        tracing::debug!(role = ?self.ctx.role(), "receiver loop started");
        while running.load(Ordering::Relaxed) {
            let ctx = Arc::clone(&self.ctx);
            match ctx.read_packet() {
                Ok(Some(guard)) => {
                    let packet = Packet::clone(&guard);
                    drop(guard);
                    self.handle_packet(packet);
                }
                Ok(None) => {}
                Err(TransportError::Closed) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "read failed");
                    thread::sleep(READ_ERROR_BACKOFF);
                }
            }
            self.tick(Instant::now());
        }
        running.store(false, Ordering::Relaxed);
        tracing::debug!("receiver loop stopped");
    }

    fn handle_packet(&mut self, packet: Packet) {
        match packet.packet_type {
            PacketType::Message => self.handle_message(&packet),
            PacketType::Video | PacketType::Audio => self.handle_media(&packet),
        }
    }

    fn handle_message(&mut self, packet: &Packet) {
        let Some(message) = ControlMessage::decode(&mut packet.payload.clone()) else {
            tracing::warn!(id = packet.id, "undecodable control message");
            return;
        };
        match message {
            ControlMessage::Nack {
                packet_type,
                id,
                index,
            } => {
                // failures are logged by the context
                let _ = self.ctx.nack(packet_type, id, index);
            }
            ControlMessage::NetworkSettings(settings) => {
                if self.ctx.role() == Role::Server {
                    if let Err(e) =
                        self.ctx
                            .update_bitrate_settings(settings.burst_bitrate, settings.fec_packet_ratio)
                    {
                        tracing::warn!(error = %e, "could not apply network settings");
                    }
                }
                self.emit(SessionEvent::NetworkSettings(settings));
            }
            other => self.emit(SessionEvent::Message(other)),
        }
    }

    fn handle_media(&mut self, packet: &Packet) {
        self.window.record_packet(packet.payload_size());
        let ring = match packet.packet_type {
            PacketType::Video => &mut self.video,
            _ => &mut self.audio,
        };
        let outcome = ring.receive(packet);
        let completed = match outcome {
            ReceiveOutcome::Completed => ring.take_frame(packet.id),
            ReceiveOutcome::Invalid => {
                tracing::debug!(packet_type = ?packet.packet_type, id = packet.id, index = packet.index, "invalid fragment");
                None
            }
            _ => None,
        };

        let skipped = self.video.stats().frames_skipped + self.audio.stats().frames_skipped;
        if skipped > self.skipped_seen {
            self.window.record_skipped(skipped - self.skipped_seen);
            self.skipped_seen = skipped;
        }

        if let Some(data) = completed {
            let frame = ReceivedFrame {
                packet_type: packet.packet_type,
                id: packet.id,
                data,
            };
            match self.frames.enqueue(frame) {
                Ok(()) => self.window.record_rendered(),
                Err(frame) => {
                    tracing::warn!(packet_type = ?frame.packet_type, id = frame.id, "frame queue full, dropping frame");
                    self.window.record_skipped(1);
                }
            }
        }
    }

    fn tick(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_nack_check) >= self.config.nack_interval {
            self.last_nack_check = now;
            self.request_missing(now);
        }

        if let Some(stats) = self.window.take(now) {
            self.emit(SessionEvent::Statistics(stats));
            if self.config.adapt_bitrate {
                let settings = self.controller.get_desired_network_settings(&stats);
                tracing::debug!(
                    bitrate = settings.bitrate,
                    burst_bitrate = settings.burst_bitrate,
                    nacks = stats.num_nacks_per_second,
                    "requesting network settings"
                );
                if let Err(e) = self.ctx.send_message(&ControlMessage::NetworkSettings(settings)) {
                    tracing::warn!(error = %e, "failed to send network settings");
                }
                self.emit(SessionEvent::NetworkSettings(settings));
            }
        }
    }

    fn request_missing(&mut self, now: Instant) {
        let mut requested = 0;
        for ring in [&mut self.video, &mut self.audio] {
            let packet_type = ring.packet_type();
            for (id, index) in ring.collect_nacks(now) {
                let nack = ControlMessage::Nack {
                    packet_type,
                    id,
                    index,
                };
                match self.ctx.send_message(&nack) {
                    Ok(()) => requested += 1,
                    Err(e) => tracing::debug!(?packet_type, id, index, error = %e, "failed to send NACK"),
                }
            }
        }
        self.window.record_nacks(requested);
    }

    fn emit(&self, event: SessionEvent) {
        match self.events.try_send(event) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => tracing::debug!("session event channel full, dropping event"),
        }
    }
}
