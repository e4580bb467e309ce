//! Host audio through cpal: microphone capture into a G.711 µ-law track and
//! playback of remote µ-law tracks.
//!
//! cpal streams are not `Send`, so each one lives on its own thread and is
//! fed from (or feeds) a tokio task over a channel.

use async_trait::async_trait;
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample as _, SampleFormat, SizedSample};
use std::collections::VecDeque;
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use webrtc::media::Sample;
use webrtc::track::track_remote::TrackRemote;

use crate::media::{
    DeviceCapabilities, LocalTrack, MediaConstraints, MediaDevices, MediaError, MediaKind,
    MediaStream,
};

const PCMU_RATE: u32 = 8000;
const FRAME: Duration = Duration::from_millis(20);
const FRAME_SAMPLES: usize = (PCMU_RATE as usize) * 20 / 1000;
/// Cap on buffered playback audio, in output samples per channel.
const MAX_PLAYBACK_BACKLOG: usize = 48_000;
const ULAW_SILENCE: u8 = 0xFF;
const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 32635;

pub fn linear_to_ulaw(sample: i16) -> u8 {
    let mut magnitude = sample as i32;
    let sign = if magnitude < 0 {
        magnitude = -magnitude;
        0x80
    } else {
        0
    };
    magnitude = magnitude.min(ULAW_CLIP) + ULAW_BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && magnitude & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (magnitude >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}

pub fn ulaw_to_linear(byte: u8) -> i16 {
    let byte = !byte;
    let sign = byte & 0x80;
    let exponent = ((byte >> 4) & 0x07) as i32;
    let mantissa = (byte & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + ULAW_BIAS) << exponent) - ULAW_BIAS;
    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

fn encode_frame(samples: &[f32]) -> Bytes {
    samples
        .iter()
        .map(|s| linear_to_ulaw((s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16))
        .collect::<Vec<u8>>()
        .into()
}

/// Picks samples out of a faster stream to approximate a slower rate.
struct Decimator {
    step: f64,
    position: f64,
}

impl Decimator {
    fn new(input_rate: u32, output_rate: u32) -> Self {
        Self {
            step: input_rate as f64 / output_rate as f64,
            position: 0.0,
        }
    }

    fn push(&mut self, input: &[f32], out: &mut Vec<f32>) {
        while (self.position as usize) < input.len() {
            out.push(input[self.position as usize]);
            self.position += self.step;
        }
        self.position -= input.len() as f64;
    }
}

/// Host capture devices. The microphone is captured through cpal; this host
/// offers no camera or display capture.
#[derive(Default)]
pub struct SystemDevices;

impl SystemDevices {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaDevices for SystemDevices {
    fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities {
            user_media: cpal::default_host().default_input_device().is_some(),
            display_capture: false,
        }
    }

    async fn user_media(&self, constraints: MediaConstraints) -> Result<MediaStream, MediaError> {
        if constraints.video {
            return Err(MediaError::Unavailable("no camera on this host".into()));
        }
        if !constraints.audio {
            return Ok(MediaStream::new());
        }
        let track = start_capture().await?;
        Ok(MediaStream::with_tracks(vec![track]))
    }

    async fn display_media(&self) -> Result<MediaStream, MediaError> {
        Err(MediaError::Unsupported("display capture".into()))
    }
}

async fn start_capture() -> Result<LocalTrack, MediaError> {
    let (pcm_tx, pcm_rx) = mpsc::unbounded_channel::<Vec<f32>>();
    let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<String, MediaError>>(1);
    let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

    thread::Builder::new()
        .name("mic-capture".into())
        .spawn(move || {
            let stream = match build_capture_stream(pcm_tx) {
                Ok((stream, name)) => {
                    let _ = ready_tx.send(Ok(name));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            // Parks until the track stops or the pump goes away.
            let _ = stop_rx.recv();
            drop(stream);
            debug!("Microphone capture thread exiting");
        })
        .map_err(|e| MediaError::Unavailable(e.to_string()))?;

    let name = tokio::task::spawn_blocking(move || ready_rx.recv())
        .await
        .map_err(|e| MediaError::Unavailable(e.to_string()))?
        .map_err(|_| MediaError::Unavailable("capture thread exited".into()))??;

    let track = LocalTrack::new(MediaKind::Audio, name.clone());
    info!(device = %name, track_id = %track.id(), "Microphone capture started");
    tokio::spawn(pump_capture(track.clone(), pcm_rx, stop_tx));
    Ok(track)
}

fn build_capture_stream(
    pcm_tx: mpsc::UnboundedSender<Vec<f32>>,
) -> Result<(cpal::Stream, String), MediaError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| MediaError::Unavailable("no input device available".into()))?;
    let name = device.name().unwrap_or_else(|_| "microphone".to_string());

    let supported = device
        .default_input_config()
        .map_err(|e| MediaError::Unavailable(e.to_string()))?;
    debug!(?supported, "Input config");
    let config = supported.config();

    let stream = match supported.sample_format() {
        SampleFormat::F32 => input_stream::<f32>(&device, &config, pcm_tx),
        SampleFormat::I16 => input_stream::<i16>(&device, &config, pcm_tx),
        SampleFormat::U16 => input_stream::<u16>(&device, &config, pcm_tx),
        other => Err(MediaError::Unsupported(format!("sample format {other:?}"))),
    }?;
    stream
        .play()
        .map_err(|e| MediaError::Unavailable(e.to_string()))?;
    Ok((stream, name))
}

fn input_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    pcm_tx: mpsc::UnboundedSender<Vec<f32>>,
) -> Result<cpal::Stream, MediaError>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    let mut decimator = Decimator::new(config.sample_rate.0, PCMU_RATE);
    let mut mono = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                mono.clear();
                mono.extend(
                    data.chunks(channels)
                        .map(|frame| frame[0].to_sample::<f32>()),
                );
                let mut out = Vec::with_capacity(mono.len() / 4 + 1);
                decimator.push(&mono, &mut out);
                let _ = pcm_tx.send(out);
            },
            |err| error!(error = %err, "Input audio stream error"),
            None,
        )
        .map_err(|e| MediaError::Unavailable(e.to_string()))
}

/// Packs captured audio into 20 ms µ-law samples on the track. A disabled
/// track sends silence so the remote end keeps its jitter buffer warm.
async fn pump_capture(
    track: LocalTrack,
    mut pcm_rx: mpsc::UnboundedReceiver<Vec<f32>>,
    stop_tx: std_mpsc::Sender<()>,
) {
    let mut pending: Vec<f32> = Vec::with_capacity(FRAME_SAMPLES * 2);
    loop {
        tokio::select! {
            _ = track.ended() => break,
            chunk = pcm_rx.recv() => {
                let Some(chunk) = chunk else { break };
                pending.extend(chunk);
                while pending.len() >= FRAME_SAMPLES {
                    let frame: Vec<f32> = pending.drain(..FRAME_SAMPLES).collect();
                    let data = if track.is_enabled() {
                        encode_frame(&frame)
                    } else {
                        Bytes::from(vec![ULAW_SILENCE; FRAME_SAMPLES])
                    };
                    let sample = Sample {
                        data,
                        duration: FRAME,
                        ..Default::default()
                    };
                    if let Err(e) = track.rtc().write_sample(&sample).await {
                        warn!(error = %e, "Failed to write audio sample");
                    }
                }
            }
        }
    }
    let _ = stop_tx.send(());
    debug!(track_id = %track.id(), "Microphone pump stopped");
}

/// Play a remote µ-law track on the default output device until it ends.
pub fn play_remote(track: Arc<TrackRemote>) {
    let backlog = Arc::new(Mutex::new(VecDeque::<f32>::new()));
    let (rate_tx, rate_rx) = std_mpsc::sync_channel::<u32>(1);
    let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

    let output = backlog.clone();
    let spawned = thread::Builder::new()
        .name("remote-playback".into())
        .spawn(move || {
            let stream = match build_playback_stream(output) {
                Ok((stream, rate)) => {
                    let _ = rate_tx.send(rate);
                    stream
                }
                Err(e) => {
                    warn!(error = %e, "Remote audio will not be played");
                    return;
                }
            };
            let _ = stop_rx.recv();
            drop(stream);
        });
    if let Err(e) = spawned {
        warn!(error = %e, "Failed to start playback thread");
    }

    tokio::spawn(async move {
        let rate = tokio::task::spawn_blocking(move || rate_rx.recv().ok())
            .await
            .ok()
            .flatten();
        let mut buf = vec![0u8; 1500];
        let repeat = rate.map(|r| (r / PCMU_RATE).max(1) as usize);

        loop {
            let packet = match track.read(&mut buf).await {
                Ok((packet, _)) => packet,
                Err(e) => {
                    debug!(error = %e, "Remote audio track ended");
                    break;
                }
            };
            let Some(repeat) = repeat else {
                continue;
            };
            if let Ok(mut queue) = backlog.lock() {
                for byte in packet.payload.iter() {
                    let value = ulaw_to_linear(*byte) as f32 / i16::MAX as f32;
                    queue.extend(std::iter::repeat(value).take(repeat));
                }
                let excess = queue.len().saturating_sub(MAX_PLAYBACK_BACKLOG);
                queue.drain(..excess);
            }
        }
        let _ = stop_tx.send(());
    });
}

fn build_playback_stream(
    backlog: Arc<Mutex<VecDeque<f32>>>,
) -> Result<(cpal::Stream, u32), MediaError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| MediaError::Unavailable("no output device available".into()))?;
    let supported = device
        .default_output_config()
        .map_err(|e| MediaError::Unavailable(e.to_string()))?;
    let config = supported.config();
    let rate = config.sample_rate.0;

    let stream = match supported.sample_format() {
        SampleFormat::F32 => output_stream::<f32>(&device, &config, backlog),
        SampleFormat::I16 => output_stream::<i16>(&device, &config, backlog),
        SampleFormat::U16 => output_stream::<u16>(&device, &config, backlog),
        other => Err(MediaError::Unsupported(format!("sample format {other:?}"))),
    }?;
    stream
        .play()
        .map_err(|e| MediaError::Unavailable(e.to_string()))?;
    Ok((stream, rate))
}

fn output_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    backlog: Arc<Mutex<VecDeque<f32>>>,
) -> Result<cpal::Stream, MediaError>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    let channels = config.channels.max(1) as usize;
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let mut queue = backlog.lock().ok();
                for frame in data.chunks_mut(channels) {
                    // Output silence if no samples available
                    let value = queue
                        .as_mut()
                        .and_then(|q| q.pop_front())
                        .unwrap_or(0.0);
                    for out in frame.iter_mut() {
                        *out = T::from_sample(value);
                    }
                }
            },
            |err| error!(error = %err, "Output audio stream error"),
            None,
        )
        .map_err(|e| MediaError::Unavailable(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_encodes_to_the_ulaw_idle_byte() {
        assert_eq!(linear_to_ulaw(0), ULAW_SILENCE);
        assert_eq!(ulaw_to_linear(ULAW_SILENCE), 0);
    }

    #[test]
    fn ulaw_keeps_sign_and_rough_magnitude() {
        for sample in [1000i16, -1000, 12_000, -30_000] {
            let decoded = ulaw_to_linear(linear_to_ulaw(sample));
            assert_eq!(decoded.signum(), sample.signum());
            let error = (decoded as i32 - sample as i32).abs();
            assert!(error <= sample.unsigned_abs() as i32 / 16 + 8, "{sample} -> {decoded}");
        }
    }

    #[test]
    fn loud_samples_are_clipped_not_wrapped() {
        assert_eq!(linear_to_ulaw(i16::MAX), linear_to_ulaw(ULAW_CLIP as i16));
        assert!(ulaw_to_linear(linear_to_ulaw(i16::MIN)) < -30_000);
    }

    #[test]
    fn decimator_reduces_rate_across_buffers() {
        let mut decimator = Decimator::new(48_000, PCMU_RATE);
        let mut out = Vec::new();
        for _ in 0..10 {
            decimator.push(&[0.5; 480], &mut out);
        }
        // 100 ms at 8 kHz
        assert_eq!(out.len(), 800);
    }

    #[test]
    fn frame_is_twenty_milliseconds_of_pcmu() {
        assert_eq!(FRAME_SAMPLES, 160);
        assert_eq!(encode_frame(&[0.0; FRAME_SAMPLES]).len(), FRAME_SAMPLES);
    }

    #[tokio::test]
    async fn host_without_camera_refuses_video() {
        let devices = SystemDevices::new();
        let err = devices
            .user_media(MediaConstraints {
                audio: false,
                video: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::Unavailable(_)));
        assert!(!devices.capabilities().display_capture);
        assert!(matches!(
            devices.display_media().await,
            Err(MediaError::Unsupported(_))
        ));
    }
}
