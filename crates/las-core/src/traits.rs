//! Контракты внешних коллабораторов speller'а.
//!
//! Speller не знает, как устроены энкодер, языковая модель и аудио-фронтенд:
//! он потребляет их только через эти трейты.

use candle_core::{Device, Tensor};

use crate::error::LasResult;

/// Энкодер ("Listener").
pub trait Listener {
    /// Закодировать батч входных фреймов.
    ///
    /// # Аргументы
    /// * `inputs`: признаки формы `[batch, frames, feature_dim]`.
    /// * `input_lengths`: реальные длины последовательностей в батче.
    ///
    /// # Возвращает
    /// `encoder_outputs` формы `[batch, time, hidden_dim]`; первая ось: батч.
    fn encode(&self, inputs: &Tensor, input_lengths: &[usize]) -> LasResult<Tensor>;
}

/// Внешняя языковая модель для shallow fusion.
///
/// Speller никогда не обучает LM: перед декодированием он один раз вызывает
/// [`LanguageModel::prepare_for_inference`].
pub trait LanguageModel {
    /// Перевести модель в режим инференса (без обновления параметров,
    /// без dropout).
    fn prepare_for_inference(&mut self);

    /// Log-вероятности следующего токена для последней позиции истории.
    ///
    /// * `history`: токены `[batch, len]` (`u32`), начиная с SOS.
    ///
    /// Возвращает тензор `[batch, vocab_size]`.
    fn step_log_probs(&mut self, history: &Tensor) -> LasResult<Tensor>;
}

/// Аудио-фронтенд: сигнал → последовательность векторов признаков.
pub trait FeatureExtractor: Send + Sync {
    /// Размерность вектора признаков одного фрейма.
    fn feature_dim(&self) -> usize;

    /// Извлечь признаки из моно-сигнала.
    ///
    /// Возвращает тензор `[frames, feature_dim]`.
    fn extract(&self, samples: &[f32], device: &Device) -> LasResult<Tensor>;
}
