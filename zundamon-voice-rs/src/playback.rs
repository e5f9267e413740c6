//! Audio output with volume-driven lip-sync.
//!
//! The rodio output stream is not `Send`, so it lives on a dedicated thread
//! that plays one job at a time. The async side decodes the WAV, hands the
//! samples over, and meanwhile pushes a 50 ms RMS envelope to the avatar as
//! mouth openness.

use std::io::Cursor;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use rodio::buffer::SamplesBuffer;
use rodio::{OutputStreamBuilder, Sink};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::avatar::AvatarLink;
use crate::{Error, Result};

pub const ENVELOPE_WINDOW: Duration = Duration::from_millis(50);

// RMS of typical speech sits well below full scale
const ENVELOPE_GAIN: f32 = 4.0;

/// PCM decoded from the engine's WAV output.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub channels: u16,
    pub sample_rate: u32,
}

impl DecodedAudio {
    pub fn duration(&self) -> Duration {
        let frames = (self.samples.len() / usize::from(self.channels.max(1))) as u64;
        Duration::from_micros(frames * 1_000_000 / u64::from(self.sample_rate.max(1)))
    }

    /// Mouth openness per [`ENVELOPE_WINDOW`], in 0..=1.
    pub fn envelope(&self) -> Vec<f32> {
        let frame_len = usize::from(self.channels.max(1));
        let window_frames = (self.sample_rate as usize * ENVELOPE_WINDOW.as_millis() as usize) / 1000;
        let window = (window_frames * frame_len).max(1);

        self.samples
            .chunks(window)
            .map(|w| {
                let mean_sq = w.iter().map(|s| s * s).sum::<f32>() / w.len() as f32;
                (mean_sq.sqrt() * ENVELOPE_GAIN).min(1.0)
            })
            .collect()
    }
}

/// Decode WAV bytes to interleaved f32 samples.
pub fn decode_wav(bytes: &[u8]) -> Result<DecodedAudio> {
    let reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| Error::Audio(format!("invalid wav: {e}")))?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Audio(e.to_string()))?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::Audio(e.to_string()))?
        }
    };

    Ok(DecodedAudio {
        samples,
        channels: spec.channels,
        sample_rate: spec.sample_rate,
    })
}

/// Plays one encoded asset to completion.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Returns once playback has finished. `mouth` receives the lip-sync
    /// envelope while playing and a closing 0 at the end.
    async fn play(&self, wav: Vec<u8>, mouth: Option<Arc<dyn AvatarLink>>) -> Result<Duration>;
}

struct PlayJob {
    audio: DecodedAudio,
    done: oneshot::Sender<()>,
}

pub struct RodioPlayer {
    jobs: std_mpsc::Sender<PlayJob>,
}

impl RodioPlayer {
    /// Open the default output device on its own thread. A missing device
    /// is fatal for speech.
    pub fn start() -> Result<Self> {
        let (jobs, rx) = std_mpsc::channel::<PlayJob>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<std::result::Result<(), String>>();

        thread::Builder::new()
            .name("audio-out".into())
            .spawn(move || {
                let stream = match OutputStreamBuilder::open_default_stream() {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };

                for job in rx {
                    let sink = Sink::connect_new(stream.mixer());
                    let audio = job.audio;
                    sink.append(SamplesBuffer::new(audio.channels, audio.sample_rate, audio.samples));
                    sink.sleep_until_end();
                    let _ = job.done.send(());
                }
                debug!("Audio thread exiting");
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!("Audio output ready");
                Ok(Self { jobs })
            }
            Ok(Err(e)) => Err(Error::LinkInvalidated(format!("no audio output: {e}"))),
            Err(_) => Err(Error::LinkInvalidated("audio thread died".into())),
        }
    }
}

#[async_trait]
impl AudioSink for RodioPlayer {
    async fn play(&self, wav: Vec<u8>, mouth: Option<Arc<dyn AvatarLink>>) -> Result<Duration> {
        let audio = decode_wav(&wav)?;
        let duration = audio.duration();
        let envelope = audio.envelope();

        let (done_tx, mut done_rx) = oneshot::channel();
        self.jobs
            .send(PlayJob {
                audio,
                done: done_tx,
            })
            .map_err(|_| Error::LinkInvalidated("audio thread stopped".into()))?;

        let mut levels = envelope.into_iter();
        let mut ticker = tokio::time::interval(ENVELOPE_WINDOW);
        let finished = loop {
            tokio::select! {
                res = &mut done_rx => break res,
                _ = ticker.tick() => {
                    if let (Some(link), Some(level)) = (&mouth, levels.next()) {
                        link.set_mouth(level);
                    }
                }
            }
        };

        if let Some(link) = &mouth {
            link.set_mouth(0.0);
        }
        match finished {
            Ok(()) => Ok(duration),
            Err(_) => {
                warn!("Audio thread dropped a job");
                Err(Error::LinkInvalidated("audio thread stopped".into()))
            }
        }
    }
}

/// Stand-in when no output device could be opened. Every play fails
/// fatally, which switches speech off for the session.
pub struct Unavailable {
    reason: String,
}

impl Unavailable {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl AudioSink for Unavailable {
    async fn play(&self, _wav: Vec<u8>, _mouth: Option<Arc<dyn AvatarLink>>) -> Result<Duration> {
        Err(Error::LinkInvalidated(self.reason.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wav(samples: &[i16], sample_rate: u32) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for s in samples {
                writer.write_sample(*s).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn decodes_pcm16() {
        let bytes = wav(&[0, i16::MAX, i16::MIN, 16384], 24_000);
        let audio = decode_wav(&bytes).unwrap();
        assert_eq!(audio.channels, 1);
        assert_eq!(audio.sample_rate, 24_000);
        assert_eq!(audio.samples.len(), 4);
        assert_eq!(audio.samples[0], 0.0);
        assert!((audio.samples[1] - 1.0).abs() < 1e-3);
        assert_eq!(audio.samples[2], -1.0);
        assert_eq!(audio.samples[3], 0.5);
    }

    #[test]
    fn rejects_garbage() {
        let err = decode_wav(b"not a wav file").unwrap_err();
        assert!(matches!(err, Error::Audio(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn envelope_tracks_volume() {
        // 100 ms silence then 100 ms loud square wave at 1 kHz sample rate
        let mut samples = vec![0i16; 100];
        samples.extend((0..100).map(|i| if i % 2 == 0 { 16384 } else { -16384 }));
        let audio = decode_wav(&wav(&samples, 1000)).unwrap();

        assert_eq!(audio.duration(), Duration::from_millis(200));
        let env = audio.envelope();
        assert_eq!(env.len(), 4);
        assert_eq!(env[0], 0.0);
        assert_eq!(env[1], 0.0);
        assert_eq!(env[2], 1.0);
        assert_eq!(env[3], 1.0);
    }

    #[tokio::test]
    async fn unavailable_output_is_fatal() {
        let err = Unavailable::new("no device")
            .play(Vec::new(), None)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
