//! Call quality sampling.
//!
//! [`MetricsAggregator`] turns cumulative transport counters into rates and
//! scores; [`MetricsCollector`] runs it on a fixed cadence in its own task and
//! publishes every snapshot locally and on the relay channel.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LatencySource;
use crate::media::MediaKind;
use crate::signaling::{ClientMessage, SignalingChannel};
use crate::transport::{StatsEntry, StreamDirection, Transport, TransportStats};

pub const MIN_LATENCY_MS: u32 = 50;
pub const MAX_LATENCY_MS: u32 = 1000;

/// Kilobits per second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Bandwidth {
    pub upload: f64,
    pub download: f64,
}

/// Kilobits per second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Bitrate {
    pub video: f64,
    pub audio: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkMetrics {
    /// Round-trip milliseconds.
    pub latency: u32,
    /// Milliseconds.
    pub jitter: f64,
    /// Percent, 0 to 100.
    pub packet_loss: f64,
    pub bandwidth: Bandwidth,
    pub bitrate: Bitrate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Count and accumulated milliseconds of an interruption kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Interruptions {
    pub count: u32,
    pub duration: f64,
}

impl Interruptions {
    fn record(&mut self, duration_ms: f64) {
        self.count += 1;
        self.duration += duration_ms.max(0.0);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoMetrics {
    pub frame_rate: f64,
    pub resolution: Resolution,
    pub freezes: Interruptions,
    /// Milliseconds.
    pub delay: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AudioMetrics {
    /// Milliseconds.
    pub latency: u32,
    pub drops: Interruptions,
    pub mos: f64,
}

impl Default for AudioMetrics {
    fn default() -> Self {
        Self {
            latency: 0,
            drops: Interruptions::default(),
            mos: 5.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub network: NetworkMetrics,
    pub video: VideoMetrics,
    pub audio: AudioMetrics,
}

/// Mean Opinion Score from loss (%), jitter (ms) and latency (ms).
pub fn compute_mos(packet_loss: f64, jitter: f64, latency: f64) -> f64 {
    let mut mos = 5.0;

    if packet_loss > 5.0 {
        mos -= 1.5;
    } else if packet_loss > 2.0 {
        mos -= 0.5;
    } else if packet_loss > 0.5 {
        mos -= 0.2;
    }

    if jitter > 50.0 {
        mos -= 1.0;
    } else if jitter > 20.0 {
        mos -= 0.5;
    } else if jitter > 10.0 {
        mos -= 0.2;
    }

    if latency > 300.0 {
        mos -= 1.0;
    } else if latency > 200.0 {
        mos -= 0.5;
    } else if latency > 100.0 {
        mos -= 0.2;
    }

    f64::clamp(mos, 1.0, 5.0)
}

/// Round-trip estimate from loss and jitter. `noise` is expected in `[0, 1)`.
pub fn estimate_latency(packet_loss: f64, jitter: f64, noise: f64) -> u32 {
    let raw = (50.0 + noise * 50.0 + packet_loss * 5.0 + jitter / 10.0).round();
    clamp_latency(raw)
}

fn clamp_latency(ms: f64) -> u32 {
    if ms.is_nan() {
        return MIN_LATENCY_MS;
    }
    ms.clamp(MIN_LATENCY_MS as f64, MAX_LATENCY_MS as f64) as u32
}

#[derive(Debug, Clone, Copy)]
struct Baseline {
    timestamp_ms: f64,
    bytes: u64,
    packets_sent: u64,
    packets_lost: i64,
}

impl From<&StatsEntry> for Baseline {
    fn from(entry: &StatsEntry) -> Self {
        Self {
            timestamp_ms: entry.timestamp_ms,
            bytes: entry.bytes,
            packets_sent: entry.packets_sent,
            packets_lost: entry.packets_lost,
        }
    }
}

/// Differences a stats sample against the previous one, per peer and entry id.
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    baselines: HashMap<(String, String), Baseline>,
    current: MetricsSnapshot,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.current
    }

    /// Fold one sample of every peer's stats into a new snapshot.
    pub fn ingest(
        &mut self,
        samples: &[(String, TransportStats)],
        noise: f64,
        latency_source: LatencySource,
    ) -> MetricsSnapshot {
        let mut bitrate = Bitrate::default();
        let mut download = 0.0;
        let mut sent_delta: u64 = 0;
        let mut lost_delta: i64 = 0;
        let mut jitter_sum = 0.0;
        let mut jitter_count = 0usize;
        let mut frame_rates = Vec::new();
        let mut round_trips = Vec::new();
        let mut seen = HashSet::new();

        for (peer, stats) in samples {
            for entry in &stats.entries {
                let key = (peer.clone(), entry.id.clone());
                let previous = self.baselines.insert(key.clone(), Baseline::from(entry));
                seen.insert(key);

                if let Some(rtt) = entry.round_trip_time {
                    round_trips.push(rtt * 1000.0);
                }

                let Some(prev) = previous else {
                    continue;
                };
                let elapsed_s = (entry.timestamp_ms - prev.timestamp_ms) / 1000.0;
                let bytes = entry.bytes.saturating_sub(prev.bytes);

                match entry.direction {
                    StreamDirection::Outbound => {
                        sent_delta += entry.packets_sent.saturating_sub(prev.packets_sent);
                        if elapsed_s > 0.0 {
                            let kbps = bytes as f64 * 8.0 / elapsed_s / 1000.0;
                            match entry.kind {
                                MediaKind::Audio => bitrate.audio += kbps,
                                MediaKind::Video => bitrate.video += kbps,
                            }
                        }
                        if entry.kind == MediaKind::Video {
                            if let Some(fps) = entry.frames_per_second {
                                frame_rates.push(fps);
                                if fps < 1.0 && elapsed_s > 0.0 {
                                    self.current.video.freezes.record(elapsed_s * 1000.0);
                                }
                            }
                            if let (Some(width), Some(height)) = (entry.frame_width, entry.frame_height) {
                                self.current.video.resolution = Resolution { width, height };
                            }
                        }
                    }
                    StreamDirection::Inbound => {
                        lost_delta += (entry.packets_lost - prev.packets_lost).max(0);
                        if elapsed_s > 0.0 {
                            download += bytes as f64 * 8.0 / elapsed_s / 1000.0;
                        }
                    }
                    StreamDirection::RemoteInbound => {
                        lost_delta += (entry.packets_lost - prev.packets_lost).max(0);
                    }
                }

                if let Some(jitter) = entry.jitter {
                    if jitter > 0.0 {
                        jitter_sum += jitter;
                        jitter_count += 1;
                    }
                }
            }
        }

        // Entries that stopped reporting would otherwise pin stale baselines.
        self.baselines.retain(|key, _| seen.contains(key));

        let network = &mut self.current.network;
        network.bitrate = Bitrate {
            video: bitrate.video.round(),
            audio: bitrate.audio.round(),
        };
        network.bandwidth = Bandwidth {
            upload: (bitrate.video + bitrate.audio).round(),
            download: download.round(),
        };
        if sent_delta > 0 {
            network.packet_loss = (lost_delta as f64 / sent_delta as f64 * 100.0).clamp(0.0, 100.0);
        }
        if jitter_count > 0 {
            network.jitter = (jitter_sum / jitter_count as f64 * 1000.0).round();
        }

        let estimate = estimate_latency(network.packet_loss, network.jitter, noise);
        network.latency = match latency_source {
            LatencySource::Measured if !round_trips.is_empty() => {
                clamp_latency((round_trips.iter().sum::<f64>() / round_trips.len() as f64).round())
            }
            _ => estimate,
        };

        if !frame_rates.is_empty() {
            self.current.video.frame_rate = frame_rates.iter().sum::<f64>() / frame_rates.len() as f64;
        }

        let latency = network.latency as f64;
        let (loss, jitter) = (network.packet_loss, network.jitter);
        self.current.video.delay = (latency * 1.5 + loss * 2.0 + jitter / 2.0).round() as u32;
        self.current.audio.latency = (latency * 0.9).round() as u32;
        self.current.audio.mos = compute_mos(loss, jitter, latency);

        self.current
    }

    pub fn report_freeze(&mut self, duration_ms: f64) {
        self.current.video.freezes.record(duration_ms);
    }

    pub fn report_audio_drop(&mut self, duration_ms: f64) {
        self.current.audio.drops.record(duration_ms);
    }

    pub fn update_resolution(&mut self, width: u32, height: u32) {
        self.current.video.resolution = Resolution { width, height };
    }
}

struct Shared {
    participant_id: String,
    signaling: Arc<dyn SignalingChannel>,
    latency_source: LatencySource,
    transports: Mutex<HashMap<String, Arc<dyn Transport>>>,
    aggregator: Mutex<MetricsAggregator>,
    snapshot: watch::Sender<MetricsSnapshot>,
}

/// Periodic sampler over every registered transport.
///
/// Owns its own transport table so sampling never waits on negotiation.
#[derive(Clone)]
pub struct MetricsCollector {
    shared: Arc<Shared>,
    period: Duration,
    shutdown: Arc<Mutex<Option<CancellationToken>>>,
}

impl MetricsCollector {
    pub fn new(
        participant_id: impl Into<String>,
        signaling: Arc<dyn SignalingChannel>,
        period: Duration,
        latency_source: LatencySource,
    ) -> Self {
        let (snapshot, _) = watch::channel(MetricsSnapshot::default());
        Self {
            shared: Arc::new(Shared {
                participant_id: participant_id.into(),
                signaling,
                latency_source,
                transports: Mutex::new(HashMap::new()),
                aggregator: Mutex::new(MetricsAggregator::new()),
                snapshot,
            }),
            period,
            shutdown: Arc::new(Mutex::new(None)),
        }
    }

    pub fn add_transport(&self, participant_id: &str, transport: Arc<dyn Transport>) {
        if let Ok(mut transports) = self.shared.transports.lock() {
            transports.insert(participant_id.to_string(), transport);
        }
    }

    pub fn remove_transport(&self, participant_id: &str) {
        if let Ok(mut transports) = self.shared.transports.lock() {
            transports.remove(participant_id);
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<MetricsSnapshot> {
        self.shared.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        *self.shared.snapshot.borrow()
    }

    /// Start sampling. A second call while running is a no-op.
    pub fn start(&self) {
        let Ok(mut slot) = self.shutdown.lock() else {
            return;
        };
        if slot.is_some() {
            return;
        }
        let token = CancellationToken::new();
        *slot = Some(token.clone());

        let shared = self.shared.clone();
        let period = self.period;
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(period_ms = period.as_millis() as u64, "Metrics collection started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let snapshot = shared.sample(rand::random::<f64>()).await;
                        shared.publish(snapshot).await;
                    }
                }
            }
            debug!("Metrics collection stopped");
        });
    }

    /// Stop sampling. Idempotent.
    pub fn stop(&self) {
        if let Ok(mut slot) = self.shutdown.lock() {
            if let Some(token) = slot.take() {
                token.cancel();
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.shutdown.lock().map(|s| s.is_some()).unwrap_or(false)
    }

    pub fn report_freeze(&self, duration_ms: f64) {
        self.update(|a| a.report_freeze(duration_ms));
    }

    pub fn report_audio_drop(&self, duration_ms: f64) {
        self.update(|a| a.report_audio_drop(duration_ms));
    }

    pub fn update_resolution(&self, width: u32, height: u32) {
        self.update(|a| a.update_resolution(width, height));
    }

    fn update(&self, f: impl FnOnce(&mut MetricsAggregator)) {
        if let Ok(mut aggregator) = self.shared.aggregator.lock() {
            f(&mut aggregator);
            self.shared.snapshot.send_replace(aggregator.snapshot());
        }
    }
}

impl Shared {
    async fn sample(&self, noise: f64) -> MetricsSnapshot {
        let transports: Vec<(String, Arc<dyn Transport>)> = match self.transports.lock() {
            Ok(map) => map.iter().map(|(id, t)| (id.clone(), t.clone())).collect(),
            Err(_) => Vec::new(),
        };

        let reports = join_all(transports.into_iter().map(|(id, transport)| async move {
            match transport.stats().await {
                Ok(stats) => Some((id, stats)),
                Err(e) => {
                    debug!(participant_id = %id, error = %e, "Stats unavailable");
                    None
                }
            }
        }))
        .await;
        let samples: Vec<_> = reports.into_iter().flatten().collect();

        let snapshot = match self.aggregator.lock() {
            Ok(mut aggregator) => aggregator.ingest(&samples, noise, self.latency_source),
            Err(_) => MetricsSnapshot::default(),
        };
        self.snapshot.send_replace(snapshot);
        snapshot
    }

    async fn publish(&self, snapshot: MetricsSnapshot) {
        if !self.signaling.is_connected() {
            return;
        }
        let message = ClientMessage::MetricsUpdate {
            participant_id: self.participant_id.clone(),
            network: snapshot.network,
            video: snapshot.video,
            audio: snapshot.audio,
        };
        if let Err(e) = self.signaling.emit(message).await {
            warn!(error = %e, "Failed to publish metrics");
        }
    }
}
