//! Shallow fusion с внешней языковой моделью.

use candle_core::{Result, Tensor};
use las_core::SpellerConfig;

/// Линейная комбинация распределений акустической модели и LM.
///
/// `fused = acoustic_weight * acoustic + language_weight * language`
///
/// Веса фиксируются при конструировании speller'а.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LanguageModelFuser {
    acoustic_weight: f64,
    language_weight: f64,
}

impl LanguageModelFuser {
    pub fn new(acoustic_weight: f64, language_weight: f64) -> Self {
        Self {
            acoustic_weight,
            language_weight,
        }
    }

    pub fn from_config(config: &SpellerConfig) -> Self {
        Self::new(config.acoustic_weight, config.language_weight)
    }

    pub fn acoustic_weight(&self) -> f64 {
        self.acoustic_weight
    }

    pub fn language_weight(&self) -> f64 {
        self.language_weight
    }

    /// Смешать распределения одного шага: оба `[batch, vocab]`.
    pub fn fuse(&self, acoustic: &Tensor, language: &Tensor) -> Result<Tensor> {
        let language = language.to_dtype(acoustic.dtype())?;
        acoustic.affine(self.acoustic_weight, 0.0)? + language.affine(self.language_weight, 0.0)?
    }
}
