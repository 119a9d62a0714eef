//! Mel-frequency cepstral coefficients.

use std::f32::consts::PI;

use candle_core::{Device, Tensor};
use las_core::{FeatureConfig, FeatureExtractor, LasError, LasResult};

use crate::mel::{clip_top_db, MelSpectrogram};

const AMIN: f32 = 1e-10;

/// MFCC: log-мощность mel (`10·log10`, порог 80 dB) → DCT-II (ortho).
///
/// Mel-стадия использует `n_mfcc_mels` бинов (по умолчанию 128), а не `n_mels`.
#[derive(Debug)]
pub struct Mfcc {
    mel: MelSpectrogram,
    n_mfcc: usize,
    /// Матрица DCT: [n_mfcc][n_mels].
    dct: Vec<Vec<f32>>,
}

impl Mfcc {
    pub fn new(config: &FeatureConfig) -> LasResult<Self> {
        let n_mels = config.n_mfcc_mels;
        if config.n_mfcc == 0 || config.n_mfcc > n_mels {
            return Err(LasError::Config(format!(
                "Mfcc: n_mfcc={} должен быть в 1..={} (n_mfcc_mels)",
                config.n_mfcc, n_mels
            )));
        }
        let mel_config = FeatureConfig {
            n_mels,
            ..config.clone()
        };
        Ok(Self {
            mel: MelSpectrogram::new(&mel_config)?,
            n_mfcc: config.n_mfcc,
            dct: dct_ortho(config.n_mfcc, n_mels),
        })
    }
}

impl FeatureExtractor for Mfcc {
    fn feature_dim(&self) -> usize {
        self.n_mfcc
    }

    fn extract(&self, samples: &[f32], device: &Device) -> LasResult<Tensor> {
        let mut log_mel: Vec<Vec<f32>> = self
            .mel
            .mel_power(samples)
            .iter()
            .map(|frame| frame.iter().map(|&s| 10.0 * s.max(AMIN).log10()).collect())
            .collect();
        clip_top_db(&mut log_mel);

        let coefficients: Vec<Vec<f32>> = log_mel
            .iter()
            .map(|frame| {
                self.dct
                    .iter()
                    .map(|basis| basis.iter().zip(frame).map(|(b, x)| b * x).sum())
                    .collect()
            })
            .collect();

        crate::frames_to_tensor(coefficients, self.n_mfcc, device)
    }
}

/// Ортонормированная матрица DCT-II.
fn dct_ortho(n_out: usize, n_in: usize) -> Vec<Vec<f32>> {
    let n = n_in as f32;
    (0..n_out)
        .map(|k| {
            let scale = if k == 0 { (1.0 / n).sqrt() } else { (2.0 / n).sqrt() };
            (0..n_in)
                .map(|i| scale * (PI * k as f32 * (2 * i + 1) as f32 / (2.0 * n)).cos())
                .collect()
        })
        .collect()
}
