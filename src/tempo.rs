//! Tempo and beat estimation from a mono waveform.
//!
//! Energy-flux onset envelope, autocorrelation tempo with a log-normal
//! prior centred on 120 BPM, then dynamic-programming beat tracking.

use anyhow::Result;

use crate::recipe::AudioTrack;

const FRAME_SIZE: usize = 1024;
const HOP_SIZE: usize = 512;
const PRIOR_CENTER_BPM: f64 = 120.0;
/// Penalty weight for beat intervals that drift from the period
const TIGHTNESS: f64 = 100.0;

#[derive(Debug, Clone)]
pub struct TempoEstimator {
    sample_rate: u32,
    min_bpm: f64,
    max_bpm: f64,
}

impl TempoEstimator {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            min_bpm: 60.0,
            max_bpm: 200.0,
        }
    }

    fn envelope_rate(&self) -> f64 {
        self.sample_rate as f64 / HOP_SIZE as f64
    }

    pub fn estimate(&self, samples: &[f32]) -> Result<AudioTrack> {
        let min_len = self.sample_rate as usize * 2;
        if samples.len() < min_len {
            anyhow::bail!(
                "audio too short for tempo estimation ({:.2}s)",
                samples.len() as f64 / self.sample_rate.max(1) as f64
            );
        }

        let envelope = onset_envelope(samples);
        let mean = envelope.iter().sum::<f64>() / envelope.len() as f64;
        let var = envelope.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / envelope.len() as f64;
        if var <= 1e-12 {
            anyhow::bail!("no onsets found (silent or constant audio)");
        }
        let std = var.sqrt();
        let normalized: Vec<f64> = envelope.iter().map(|v| (v - mean) / std).collect();

        let period = self.tempo_period(&gaussian_smooth(&normalized, 1.5))?;
        let bpm = 60.0 * self.envelope_rate() / period;
        let beats = track_beats(&envelope, period)
            .into_iter()
            .map(|frame| frame as f64 * HOP_SIZE as f64 / self.sample_rate as f64)
            .collect();

        Ok(AudioTrack {
            bpm: (bpm * 100.0).round() / 100.0,
            beats,
        })
    }

    /// Beat period in envelope frames.
    fn tempo_period(&self, envelope: &[f64]) -> Result<f64> {
        let rate = self.envelope_rate();
        let min_lag = (60.0 * rate / self.max_bpm).floor().max(1.0) as usize;
        let max_lag = (60.0 * rate / self.min_bpm).ceil() as usize;
        if max_lag + 1 >= envelope.len() {
            anyhow::bail!("audio too short for the tempo search range");
        }

        let acf: Vec<f64> = (0..=max_lag + 1)
            .map(|lag| {
                let n = envelope.len() - lag;
                envelope[..n]
                    .iter()
                    .zip(&envelope[lag..])
                    .map(|(a, b)| a * b)
                    .sum::<f64>()
                    / n as f64
            })
            .collect();

        let weighted = |lag: usize| {
            let bpm = 60.0 * rate / lag as f64;
            let octaves = (bpm / PRIOR_CENTER_BPM).log2();
            acf[lag] * (-0.5 * octaves * octaves).exp()
        };

        let best = (min_lag..=max_lag)
            .max_by(|a, b| weighted(*a).total_cmp(&weighted(*b)))
            .filter(|lag| acf[*lag] > 0.0)
            .ok_or_else(|| anyhow::anyhow!("no periodicity in onset envelope"))?;

        // parabolic refinement around the peak
        let (y0, y1, y2) = (acf[best - 1], acf[best], acf[best + 1]);
        let denom = y0 - 2.0 * y1 + y2;
        let offset = if denom.abs() > 1e-12 {
            (0.5 * (y0 - y2) / denom).clamp(-0.5, 0.5)
        } else {
            0.0
        };
        Ok(best as f64 + offset)
    }
}

/// Positive frame-to-frame change in RMS energy.
fn onset_envelope(samples: &[f32]) -> Vec<f64> {
    let frames = if samples.len() >= FRAME_SIZE {
        (samples.len() - FRAME_SIZE) / HOP_SIZE + 1
    } else {
        0
    };
    let rms: Vec<f64> = (0..frames)
        .map(|i| {
            let frame = &samples[i * HOP_SIZE..i * HOP_SIZE + FRAME_SIZE];
            (frame.iter().map(|s| (*s as f64).powi(2)).sum::<f64>() / FRAME_SIZE as f64).sqrt()
        })
        .collect();

    let mut envelope = vec![0.0; rms.len()];
    for i in 1..rms.len() {
        envelope[i] = (rms[i] - rms[i - 1]).max(0.0);
    }
    envelope
}

/// Spread each onset over neighbouring frames so fractional periods still
/// produce a single autocorrelation peak.
fn gaussian_smooth(values: &[f64], sigma: f64) -> Vec<f64> {
    let radius = (sigma * 3.0).ceil() as isize;
    let kernel: Vec<f64> = (-radius..=radius)
        .map(|i| (-(i * i) as f64 / (2.0 * sigma * sigma)).exp())
        .collect();
    let norm: f64 = kernel.iter().sum();
    (0..values.len() as isize)
        .map(|i| {
            (-radius..=radius)
                .filter_map(|k| {
                    let j = i + k;
                    (j >= 0 && (j as usize) < values.len())
                        .then(|| values[j as usize] * kernel[(k + radius) as usize])
                })
                .sum::<f64>()
                / norm
        })
        .collect()
}

/// Dynamic-programming beat tracker; returns beat frame indices in order.
fn track_beats(envelope: &[f64], period: f64) -> Vec<usize> {
    let n = envelope.len();
    if n == 0 || period < 1.0 {
        return Vec::new();
    }
    let max_env = envelope.iter().cloned().fold(0.0, f64::max).max(1e-12);
    let local: Vec<f64> = envelope.iter().map(|v| v / max_env).collect();

    let mut score = vec![0.0; n];
    let mut backlink: Vec<Option<usize>> = vec![None; n];
    let near = (period / 2.0).round() as usize;
    let far = (period * 2.0).round() as usize;

    for t in 0..n {
        let mut best: Option<(f64, usize)> = None;
        if t >= near.max(1) {
            let lo = t.saturating_sub(far);
            for prev in lo..=t - near.max(1) {
                let gap = (t - prev) as f64 / period;
                let candidate = score[prev] - TIGHTNESS * gap.ln().powi(2);
                if best.map_or(true, |(s, _)| candidate > s) {
                    best = Some((candidate, prev));
                }
            }
        }
        match best {
            Some((s, prev)) if s > 0.0 => {
                score[t] = local[t] + s;
                backlink[t] = Some(prev);
            }
            _ => score[t] = local[t],
        }
    }

    let tail_start = n.saturating_sub(period.ceil() as usize);
    let Some(mut cursor) = (tail_start..n).max_by(|a, b| score[*a].total_cmp(&score[*b])) else {
        return Vec::new();
    };

    let mut beats = vec![cursor];
    while let Some(prev) = backlink[cursor] {
        beats.push(prev);
        cursor = prev;
    }
    beats.reverse();
    beats
}
