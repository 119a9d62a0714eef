//! Mel-спектрограмма в dB.
//!
//! Центрированный STFT (reflect), окно Ханна, спектр мощности, mel-фильтры
//! по шкале Slaney (0..sr/2), затем
//! `20·log10(max(S, 1e-5) / max(ref, 1e-5))` с `ref = max(S)` и порогом −80 dB.

use candle_core::{Device, Tensor};
use las_core::{FeatureConfig, FeatureExtractor, LasError, LasResult};

use crate::stft::{Stft, WindowKind};

const AMIN: f32 = 1e-5;
const TOP_DB: f32 = 80.0;

/// Экстрактор mel-спектрограммы.
#[derive(Debug)]
pub struct MelSpectrogram {
    n_mels: usize,
    stft: Stft,
    mel_filters: Vec<Vec<f32>>,
}

impl MelSpectrogram {
    /// Параметры окна и шага берутся из `config` (мс → отсчёты).
    pub fn new(config: &FeatureConfig) -> LasResult<Self> {
        let n_fft = config.n_fft();
        let hop_length = config.sample_rate * config.stride_ms / 1000;
        if n_fft == 0 || hop_length == 0 || config.n_mels == 0 {
            return Err(LasError::Config(format!(
                "MelSpectrogram: n_fft={n_fft}, hop_length={hop_length}, n_mels={}",
                config.n_mels
            )));
        }

        let sample_rate = config.sample_rate as f32;
        let mel_filters = slaney_mel_filterbank(config.n_mels, n_fft, sample_rate, 0.0, sample_rate / 2.0);

        Ok(Self {
            n_mels: config.n_mels,
            stft: Stft::new(n_fft, hop_length, WindowKind::Hann, true),
            mel_filters,
        })
    }

    /// Mel-спектр мощности: [frames][n_mels].
    pub(crate) fn mel_power(&self, samples: &[f32]) -> Vec<Vec<f32>> {
        self.stft
            .power(samples)
            .iter()
            .map(|frame| {
                self.mel_filters
                    .iter()
                    .map(|filter| frame.iter().zip(filter).map(|(s, f)| s * f).sum::<f32>())
                    .collect()
            })
            .collect()
    }
}

impl FeatureExtractor for MelSpectrogram {
    fn feature_dim(&self) -> usize {
        self.n_mels
    }

    fn extract(&self, samples: &[f32], device: &Device) -> LasResult<Tensor> {
        let mel = self.mel_power(samples);
        let reference = mel
            .iter()
            .flatten()
            .copied()
            .fold(f32::NEG_INFINITY, f32::max)
            .max(AMIN);
        let ref_db = 20.0 * reference.log10();

        let mut db: Vec<Vec<f32>> = mel
            .iter()
            .map(|frame| frame.iter().map(|&s| 20.0 * s.max(AMIN).log10() - ref_db).collect())
            .collect();
        clip_top_db(&mut db);

        crate::frames_to_tensor(db, self.n_mels, device)
    }
}

/// Ограничить динамический диапазон: значения ниже `max − 80 dB` поднимаются.
pub(crate) fn clip_top_db(db: &mut [Vec<f32>]) {
    let max = db
        .iter()
        .flatten()
        .copied()
        .fold(f32::NEG_INFINITY, f32::max);
    let floor = max - TOP_DB;
    for value in db.iter_mut().flatten() {
        *value = value.max(floor);
    }
}

/// Hz → mel по шкале Slaney (линейная до 1 кГц, логарифмическая выше).
fn hz_to_mel(hz: f32) -> f32 {
    let f_sp = 200.0 / 3.0;
    let min_log_hz = 1000.0;
    let min_log_mel = min_log_hz / f_sp;
    let logstep = (6.4f32).ln() / 27.0;

    if hz >= min_log_hz {
        min_log_mel + (hz / min_log_hz).ln() / logstep
    } else {
        hz / f_sp
    }
}

/// mel → Hz по шкале Slaney.
fn mel_to_hz(mel: f32) -> f32 {
    let f_sp = 200.0 / 3.0;
    let min_log_hz = 1000.0;
    let min_log_mel = min_log_hz / f_sp;
    let logstep = (6.4f32).ln() / 27.0;

    if mel >= min_log_mel {
        min_log_hz * (logstep * (mel - min_log_mel)).exp()
    } else {
        f_sp * mel
    }
}

/// Треугольные mel-фильтры с нормировкой Slaney `2 / (f_right − f_left)`.
fn slaney_mel_filterbank(
    n_mels: usize,
    n_fft: usize,
    sample_rate: f32,
    f_min: f32,
    f_max: f32,
) -> Vec<Vec<f32>> {
    let n_freqs = n_fft / 2 + 1;
    let fft_freqs: Vec<f32> = (0..n_freqs)
        .map(|i| i as f32 * sample_rate / n_fft as f32)
        .collect();

    let mel_min = hz_to_mel(f_min);
    let mel_max = hz_to_mel(f_max);
    let hz_points: Vec<f32> = (0..=n_mels + 1)
        .map(|i| mel_to_hz(mel_min + i as f32 * (mel_max - mel_min) / (n_mels + 1) as f32))
        .collect();

    let mut filterbank = vec![vec![0.0_f32; n_freqs]; n_mels];
    for (m, filter) in filterbank.iter_mut().enumerate() {
        let f_left = hz_points[m];
        let f_center = hz_points[m + 1];
        let f_right = hz_points[m + 2];
        let enorm = 2.0 / (f_right - f_left);

        for (k, &freq) in fft_freqs.iter().enumerate() {
            if freq >= f_left && freq < f_center {
                filter[k] = enorm * (freq - f_left) / (f_center - f_left);
            } else if freq >= f_center && freq <= f_right {
                filter[k] = enorm * (f_right - freq) / (f_right - f_center);
            }
        }
    }

    filterbank
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slaney_mel_conversion() {
        for hz in [300.0, 1000.0, 4000.0] {
            let back = mel_to_hz(hz_to_mel(hz));
            assert!((hz - back).abs() < 0.1, "{hz} -> {back}");
        }
    }

    #[test]
    fn test_filterbank_shape() {
        let filters = slaney_mel_filterbank(80, 320, 16000.0, 0.0, 8000.0);
        assert_eq!(filters.len(), 80);
        assert_eq!(filters[0].len(), 161);
        assert!(filters.iter().all(|f| f.iter().all(|&v| v >= 0.0)));
    }

    #[test]
    fn test_db_range() {
        let config = FeatureConfig::mel_spectrogram();
        let extractor = MelSpectrogram::new(&config).unwrap();
        let samples: Vec<f32> = (0..8000).map(|i| ((i * 7919) % 200) as f32 / 100.0 - 1.0).collect();

        let features = extractor.extract(&samples, &Device::Cpu).unwrap();
        assert_eq!(features.dims(), &[51, 80]);

        let values: Vec<f32> = features.flatten_all().unwrap().to_vec1().unwrap();
        let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let min = values.iter().copied().fold(f32::INFINITY, f32::min);
        assert!(max.abs() < 1e-4, "max={max}");
        assert!(min >= -80.0 - 1e-4, "min={min}");
    }
}
