//! Линейная log-спектрограмма.

use candle_core::{Device, Tensor};
use las_core::{FeatureConfig, FeatureExtractor, LasError, LasResult};

use crate::stft::{Stft, WindowKind};

/// `log1p(|STFT|)` с окном Хэмминга, без центрирования.
///
/// Шаг между окнами равен `window_size_ms − stride_ms`.
#[derive(Debug)]
pub struct Spectrogram {
    stft: Stft,
}

impl Spectrogram {
    pub fn new(config: &FeatureConfig) -> LasResult<Self> {
        let n_fft = config.n_fft();
        let hop_length =
            config.sample_rate * config.window_size_ms.saturating_sub(config.stride_ms) / 1000;
        if n_fft == 0 || hop_length == 0 {
            return Err(LasError::Config(format!(
                "Spectrogram: n_fft={n_fft}, hop_length={hop_length} (window={} мс, stride={} мс)",
                config.window_size_ms, config.stride_ms
            )));
        }
        Ok(Self {
            stft: Stft::new(n_fft, hop_length, WindowKind::Hamming, false),
        })
    }
}

impl FeatureExtractor for Spectrogram {
    fn feature_dim(&self) -> usize {
        self.stft.n_freqs()
    }

    fn extract(&self, samples: &[f32], device: &Device) -> LasResult<Tensor> {
        let frames: Vec<Vec<f32>> = self
            .stft
            .magnitude(samples)
            .into_iter()
            .map(|frame| frame.into_iter().map(f32::ln_1p).collect())
            .collect();
        crate::frames_to_tensor(frames, self.feature_dim(), device)
    }
}
