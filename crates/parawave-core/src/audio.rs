//! WAV loading and preprocessing into (log-mel features, waveform) pairs.

use std::f32::consts::PI;
use std::path::Path;

use hound::{SampleFormat, WavReader};
use rand::Rng;
use rustfft::{num_complex::Complex, FftPlanner};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

const LOG_FLOOR: f32 = 1e-5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub n_fft: usize,
    pub hop_length: usize,
    pub n_mels: usize,
    /// Silence threshold in dB below peak, used for trimming.
    pub top_db: f32,
    /// Training crop length in samples; must be a multiple of `hop_length`.
    pub length: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self { sample_rate: 22050, n_fft: 1024, hop_length: 256, n_mels: 80, top_db: 20.0, length: 7680 }
    }
}

impl AudioConfig {
    pub fn validate(&self) -> CoreResult<()> {
        if self.n_fft == 0 || self.hop_length == 0 || self.n_mels == 0 {
            return Err(CoreError::config("audio", "n_fft, hop_length and n_mels must be positive"));
        }
        if self.length == 0 || self.length % self.hop_length != 0 {
            return Err(CoreError::config(
                "audio.length",
                format!("{} is not a positive multiple of hop_length {}", self.length, self.hop_length),
            ));
        }
        Ok(())
    }

    pub fn n_frames(&self) -> usize {
        self.length / self.hop_length
    }
}

/// One preprocessed training example.
#[derive(Debug, Clone, PartialEq)]
pub struct Example {
    /// Log-mel features, row-major `[n_mels, n_frames]`.
    pub features: Vec<f32>,
    pub n_mels: usize,
    pub n_frames: usize,
    /// `n_frames * hop_length` samples in `[-1, 1]`.
    pub waveform: Vec<f32>,
}

/// Read a mono waveform (channels averaged) and its sample rate.
pub fn read_wav(path: &Path) -> CoreResult<(Vec<f32>, u32)> {
    let reader = WavReader::open(path)?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader.into_samples::<f32>().collect::<Result<_, _>>()?,
        SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()?
        }
    };

    let mono = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();
    Ok((mono, spec.sample_rate))
}

/// Drop leading and trailing samples quieter than `top_db` below the peak.
pub fn trim_silence(samples: &[f32], top_db: f32) -> &[f32] {
    let peak = samples.iter().fold(0f32, |m, s| m.max(s.abs()));
    if peak == 0.0 {
        return &samples[..0];
    }
    let threshold = peak * 10f32.powf(-top_db / 20.0);
    let start = samples.iter().position(|s| s.abs() >= threshold).unwrap_or(0);
    let end = samples.iter().rposition(|s| s.abs() >= threshold).map_or(start, |i| i + 1);
    &samples[start..end]
}

/// Random crop to `length`, or zero-pad at the end when shorter.
pub fn crop_or_pad<R: Rng>(samples: &[f32], length: usize, rng: &mut R) -> Vec<f32> {
    if samples.len() >= length {
        let start = rng.gen_range(0..=samples.len() - length);
        samples[start..start + length].to_vec()
    } else {
        let mut out = samples.to_vec();
        out.resize(length, 0.0);
        out
    }
}

/// Log-mel spectrogram with centred, Hann-windowed frames.
pub struct MelSpectrogram {
    n_fft: usize,
    hop_length: usize,
    n_mels: usize,
    window: Vec<f32>,
    /// `[n_mels][n_fft / 2 + 1]`
    filters: Vec<Vec<f32>>,
}

impl MelSpectrogram {
    pub fn new(cfg: &AudioConfig) -> Self {
        Self {
            n_fft: cfg.n_fft,
            hop_length: cfg.hop_length,
            n_mels: cfg.n_mels,
            window: hann_window(cfg.n_fft),
            filters: mel_filterbank(cfg.sample_rate, cfg.n_fft, cfg.n_mels),
        }
    }

    /// `samples.len() / hop_length` frames, row-major `[n_mels, frames]`.
    pub fn compute(&self, samples: &[f32]) -> Vec<f32> {
        let n_frames = samples.len() / self.hop_length;
        let pad = self.n_fft / 2;
        let padded = reflect_pad(samples, pad);

        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(self.n_fft);
        let n_bins = self.n_fft / 2 + 1;

        let mut out = vec![0f32; self.n_mels * n_frames];
        let mut buffer = vec![Complex::new(0f32, 0f32); self.n_fft];
        for frame in 0..n_frames {
            let start = frame * self.hop_length;
            for (j, slot) in buffer.iter_mut().enumerate() {
                let s = padded.get(start + j).copied().unwrap_or(0.0);
                *slot = Complex::new(s * self.window[j], 0.0);
            }
            fft.process(&mut buffer);
            let magnitude: Vec<f32> = buffer[..n_bins].iter().map(|c| c.norm()).collect();
            for (m, filter) in self.filters.iter().enumerate() {
                let energy: f32 = filter.iter().zip(&magnitude).map(|(f, a)| f * a).sum();
                out[m * n_frames + frame] = energy.max(LOG_FLOOR).ln();
            }
        }
        out
    }
}

/// Path → [`Example`]. Randomness comes only from the caller's RNG.
pub struct Preprocess {
    config: AudioConfig,
    mel: MelSpectrogram,
}

impl Preprocess {
    pub fn new(config: AudioConfig) -> CoreResult<Self> {
        config.validate()?;
        let mel = MelSpectrogram::new(&config);
        Ok(Self { config, mel })
    }

    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    pub fn load<R: Rng>(&self, path: &Path, rng: &mut R) -> CoreResult<Example> {
        let (samples, sr) = read_wav(path)?;
        if sr != self.config.sample_rate {
            return Err(CoreError::Audio(format!(
                "{}: sample rate {sr} Hz, expected {} Hz",
                path.display(),
                self.config.sample_rate
            )));
        }
        Ok(self.process(&samples, rng))
    }

    pub fn process<R: Rng>(&self, samples: &[f32], rng: &mut R) -> Example {
        let trimmed = trim_silence(samples, self.config.top_db);
        let waveform = crop_or_pad(trimmed, self.config.length, rng);
        let features = self.mel.compute(&waveform);
        Example {
            features,
            n_mels: self.config.n_mels,
            n_frames: self.config.n_frames(),
            waveform,
        }
    }
}

fn reflect_pad(samples: &[f32], pad: usize) -> Vec<f32> {
    let n = samples.len();
    let mut out = Vec::with_capacity(n + 2 * pad);
    if n < 2 {
        out.resize(pad, 0.0);
        out.extend_from_slice(samples);
        out.resize(n + 2 * pad, 0.0);
        return out;
    }
    // Reflection index folded back into [0, n) for pads longer than the signal.
    let fold = |i: isize| -> usize {
        let period = 2 * (n as isize - 1);
        let m = i.rem_euclid(period);
        (if m < n as isize { m } else { period - m }) as usize
    };
    for i in 0..pad {
        out.push(samples[fold(pad as isize - i as isize)]);
    }
    out.extend_from_slice(samples);
    for i in 0..pad {
        out.push(samples[fold(n as isize + i as isize)]);
    }
    out
}

fn hann_window(len: usize) -> Vec<f32> {
    (0..len).map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / len as f32).cos())).collect()
}

fn hz_to_mel(f: f32) -> f32 {
    const F_SP: f32 = 200.0 / 3.0;
    const MIN_LOG_HZ: f32 = 1000.0;
    const LOGSTEP: f32 = 0.068_751_74;
    if f < MIN_LOG_HZ {
        f / F_SP
    } else {
        MIN_LOG_HZ / F_SP + (f / MIN_LOG_HZ).ln() / LOGSTEP
    }
}

fn mel_to_hz(m: f32) -> f32 {
    const F_SP: f32 = 200.0 / 3.0;
    const MIN_LOG_HZ: f32 = 1000.0;
    const LOGSTEP: f32 = 0.068_751_74;
    let min_log_mel = MIN_LOG_HZ / F_SP;
    if m < min_log_mel {
        m * F_SP
    } else {
        MIN_LOG_HZ * ((m - min_log_mel) * LOGSTEP).exp()
    }
}

/// Slaney-scale, area-normalised triangular filters from 0 Hz to Nyquist.
fn mel_filterbank(sample_rate: u32, n_fft: usize, n_mels: usize) -> Vec<Vec<f32>> {
    let n_bins = n_fft / 2 + 1;
    let mel_max = hz_to_mel(sample_rate as f32 / 2.0);
    let hz: Vec<f32> =
        (0..n_mels + 2).map(|i| mel_to_hz(mel_max * i as f32 / (n_mels + 1) as f32)).collect();
    let bin_hz: Vec<f32> = (0..n_bins).map(|j| j as f32 * sample_rate as f32 / n_fft as f32).collect();

    (0..n_mels)
        .map(|i| {
            let (lo, mid, hi) = (hz[i], hz[i + 1], hz[i + 2]);
            let norm = if hi > lo { 2.0 / (hi - lo) } else { 0.0 };
            bin_hz
                .iter()
                .map(|&f| {
                    let w = if f >= lo && f <= mid && mid > lo {
                        (f - lo) / (mid - lo)
                    } else if f > mid && f <= hi && hi > mid {
                        (hi - f) / (hi - mid)
                    } else {
                        0.0
                    };
                    w * norm
                })
                .collect()
        })
        .collect()
}
