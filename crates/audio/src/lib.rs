//! # audio
//!
//! Аудио-фронтенд для Listen-Attend-Spell.
//!
//! Этот крейт отвечает за:
//! - загрузку WAV-файлов и сведение в моно
//! - извлечение признаков: линейная спектрограмма, mel-спектрограмма, MFCC

pub mod loader;
pub mod mel;
pub mod mfcc;
pub mod spectrogram;
pub mod stft;

use std::path::Path;

use candle_core::{Device, Tensor};
use las_core::{FeatureConfig, FeatureExtractor, FeatureKind, LasError, LasResult};
use tracing::debug;

pub use loader::{load_wav, to_mono};
pub use mel::MelSpectrogram;
pub use mfcc::Mfcc;
pub use spectrogram::Spectrogram;

/// Создать экстрактор признаков по конфигурации.
///
/// Неизвестный `kind` даёт [`LasError::Config`].
pub fn build_extractor(config: &FeatureConfig) -> LasResult<Box<dyn FeatureExtractor>> {
    let extractor: Box<dyn FeatureExtractor> = match config.feature_kind()? {
        FeatureKind::Spectrogram => Box::new(Spectrogram::new(config)?),
        FeatureKind::MelSpectrogram => Box::new(MelSpectrogram::new(config)?),
        FeatureKind::Mfcc => Box::new(Mfcc::new(config)?),
    };
    debug!(
        "Экстрактор признаков: {} (dim={}, n_fft={})",
        config.kind,
        extractor.feature_dim(),
        config.n_fft()
    );
    Ok(extractor)
}

/// Загрузить WAV, свести в моно и извлечь признаки `[frames, feature_dim]`.
///
/// Ресемплинг не выполняется: частота файла должна совпадать с
/// `expected_sample_rate`.
pub fn features_from_wav(
    path: impl AsRef<Path>,
    extractor: &dyn FeatureExtractor,
    expected_sample_rate: usize,
    device: &Device,
) -> LasResult<Tensor> {
    let audio = to_mono(&load_wav(path)?);
    if audio.sample_rate != expected_sample_rate {
        return Err(LasError::Audio(format!(
            "частота дискретизации {} Гц, ожидалось {} Гц",
            audio.sample_rate, expected_sample_rate
        )));
    }
    extractor.extract(&audio.samples, device)
}

/// Фреймы `[frames][dim]` → тензор `[frames, dim]`.
pub(crate) fn frames_to_tensor(frames: Vec<Vec<f32>>, dim: usize, device: &Device) -> LasResult<Tensor> {
    let num_frames = frames.len();
    if num_frames == 0 {
        return Err(LasError::Audio("сигнал короче одного окна анализа".into()));
    }
    let flat: Vec<f32> = frames.into_iter().flatten().collect();
    Ok(Tensor::from_vec(flat, (num_frames, dim), device)?)
}
