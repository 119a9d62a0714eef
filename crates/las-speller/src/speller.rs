//! Speller: веса декодера и вычисление одного шага.
//!
//! Шаг декодера:
//! ```text
//! token → embedding → dropout → RNN → attention(rnn_out, encoder_outputs, prior)
//!       → concat[rnn_out, context] → linear1 → LayerNorm → linear2 → log_softmax
//! ```
//!
//! Весовые ключи:
//! - embedding.weight: [num_classes, hidden]
//! - rnn.*: см. [`crate::rnn`]
//! - attention.*: см. [`crate::attention`]
//! - linear1.weight: [hidden, 2*hidden], linear1.bias: [hidden]
//! - layer_norm.weight / layer_norm.bias: [hidden]
//! - linear2.weight: [num_classes, hidden], linear2.bias: [num_classes]

use std::path::Path;
use std::time::Instant;

use candle_core::{DType, Device, Module, Result, Tensor, D};
use candle_nn::{Dropout, Embedding, LayerNorm, Linear, ModuleT, VarBuilder, VarMap};
use tracing::{debug, info};

use las_core::{AttentionKind, LasError, LasResult, RnnKind, SpellerConfig};

use crate::attention::Attention;
use crate::fusion::LanguageModelFuser;
use crate::rnn::{RecurrentLayer, RecurrentState};

/// Результат одного шага (или батча шагов для content-based внимания).
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// Log-вероятности: [batch, n, num_classes].
    pub log_probs: Tensor,
    /// Новое скрытое состояние RNN (заменяет предыдущее целиком).
    pub hidden: RecurrentState,
    /// Выравнивание внимания: [batch, n, time].
    pub alignment: Tensor,
}

/// Attention-based декодер (Speller) из Listen-Attend-Spell.
#[derive(Debug, Clone)]
pub struct Speller {
    config: SpellerConfig,
    embedding: Embedding,
    input_dropout: Dropout,
    rnn: RecurrentLayer,
    attention: Attention,
    linear1: Linear,
    layer_norm: LayerNorm,
    linear2: Linear,
    pub(crate) fuser: LanguageModelFuser,
    dtype: DType,
    device: Device,
}

impl Speller {
    /// Создать speller из конфигурации и VarBuilder.
    ///
    /// Конфигурация проверяется до загрузки весов: неизвестный механизм
    /// внимания или тип RNN дают [`LasError::Config`].
    pub fn new(config: SpellerConfig, vb: VarBuilder) -> LasResult<Self> {
        config.validate()?;
        let attention_kind = config.attention_kind()?;
        let rnn_kind = config.rnn_kind()?;
        let hidden = config.hidden_dim;

        let embedding = candle_nn::embedding(config.num_classes, hidden, vb.pp("embedding"))?;
        let rnn = RecurrentLayer::load(
            rnn_kind,
            hidden,
            hidden,
            config.num_layers,
            config.dropout_p,
            vb.pp("rnn"),
        )?;
        let attention = Attention::load(
            attention_kind,
            hidden,
            config.num_heads,
            config.location_smoothing,
            vb.pp("attention"),
        )?;
        let linear1 = candle_nn::linear(hidden * 2, hidden, vb.pp("linear1"))?;
        let layer_norm = candle_nn::layer_norm(hidden, config.layer_norm_eps, vb.pp("layer_norm"))?;
        let linear2 = candle_nn::linear(hidden, config.num_classes, vb.pp("linear2"))?;

        debug!(
            "Speller: {} x{}, внимание {} ({}), hidden={}, vocab={}",
            rnn_kind,
            config.num_layers,
            attention_kind,
            attention_kind.as_str(),
            hidden,
            config.num_classes
        );

        Ok(Self {
            fuser: LanguageModelFuser::from_config(&config),
            input_dropout: Dropout::new(config.dropout_p),
            dtype: vb.dtype(),
            device: vb.device().clone(),
            config,
            embedding,
            rnn,
            attention,
            linear1,
            layer_norm,
            linear2,
        })
    }

    /// Speller со случайно инициализированными весами в `varmap`.
    pub fn fresh(config: SpellerConfig, varmap: &VarMap, device: &Device) -> LasResult<Self> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, device);
        Self::new(config, vb)
    }

    /// Загрузить веса из safetensors-файла.
    pub fn from_safetensors(
        config: SpellerConfig,
        path: impl AsRef<Path>,
        device: &Device,
    ) -> LasResult<Self> {
        let path = path.as_ref();
        info!("Speller: загрузка весов из {:?}", path);
        if !path.exists() {
            return Err(LasError::Model(format!("Файл весов не найден: {:?}", path)));
        }

        let start = Instant::now();
        let dtype = if device.is_cuda() { DType::BF16 } else { DType::F32 };
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[path], dtype, device)? };
        let speller = Self::new(config, vb)?;
        info!("Speller: загружен за {:.2}с", start.elapsed().as_secs_f64());
        Ok(speller)
    }

    /// Один шаг декодера.
    ///
    /// * `input`: токены [batch, n] (`u32`); `n > 1` допустимо только для
    ///   content-based внимания.
    /// * `hidden`: состояние RNN предыдущего шага; `None` означает нулевое.
    /// * `encoder_outputs`: [batch, time, hidden].
    /// * `prior_alignment`: [batch, time], только для location-aware.
    pub fn forward_step(
        &self,
        input: &Tensor,
        hidden: Option<&RecurrentState>,
        encoder_outputs: &Tensor,
        prior_alignment: Option<&Tensor>,
        train: bool,
    ) -> Result<StepOutput> {
        let embedded = self.embedding.forward(input)?;
        let embedded = self.input_dropout.forward_t(&embedded, train)?;

        let (rnn_out, hidden) = self.rnn.forward_t(&embedded, hidden, train)?;
        let attended = self.attention.attend(&rnn_out, encoder_outputs, prior_alignment)?;

        let combined = Tensor::cat(&[&rnn_out, &attended.context], D::Minus1)?;
        let projected = self.linear1.forward(&combined)?;
        let projected = self.layer_norm.forward(&projected)?;
        let logits = self.linear2.forward(&projected)?;
        let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;

        Ok(StepOutput {
            log_probs,
            hidden,
            alignment: attended.alignment,
        })
    }

    /// Конфигурация.
    pub fn config(&self) -> &SpellerConfig {
        &self.config
    }

    /// Вид механизма внимания.
    pub fn attention_kind(&self) -> AttentionKind {
        self.attention.kind()
    }

    pub fn rnn_kind(&self) -> RnnKind {
        self.rnn.kind()
    }

    /// Размер словаря.
    pub fn num_classes(&self) -> usize {
        self.config.num_classes
    }

    /// Веса shallow fusion.
    pub fn fuser(&self) -> &LanguageModelFuser {
        &self.fuser
    }

    /// Тип весов; к нему приводятся выходы энкодера в decode.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn speller(attention: &str, rnn: &str) -> Speller {
        let config = SpellerConfig::new(7)
            .with_hidden_dim(8, 2)
            .with_num_layers(2)
            .with_attention(attention)
            .with_rnn_type(rnn);
        Speller::fresh(config, &VarMap::new(), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_step_shapes() {
        let device = Device::Cpu;
        for rnn in ["lstm", "gru", "rnn"] {
            let speller = speller("dot", rnn);
            let encoder_outputs = Tensor::randn(0f32, 1.0, (2, 6, 8), &device).unwrap();
            let input = Tensor::new(&[[1u32, 3, 4], [1, 5, 6]], &device).unwrap();

            let step = speller
                .forward_step(&input, None, &encoder_outputs, None, false)
                .unwrap();
            assert_eq!(step.log_probs.dims(), &[2, 3, 7]);
            assert_eq!(step.alignment.dims(), &[2, 3, 6]);
            assert_eq!(step.hidden.num_layers(), 2);
        }
    }

    #[test]
    fn test_log_probs_normalized() {
        let device = Device::Cpu;
        let speller = speller("loc", "lstm");
        let encoder_outputs = Tensor::randn(0f32, 1.0, (3, 5, 8), &device).unwrap();
        let input = Tensor::new(&[[1u32], [1], [1]], &device).unwrap();

        let step = speller
            .forward_step(&input, None, &encoder_outputs, None, false)
            .unwrap();
        let sums: Vec<f32> = step
            .log_probs
            .exp()
            .unwrap()
            .sum(D::Minus1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        for s in sums {
            assert!((s - 1.0).abs() < 1e-4, "сумма вероятностей {s}");
        }
    }

    #[test]
    fn test_bogus_attention_rejected() {
        let config = SpellerConfig::new(7).with_attention("bogus");
        let err = Speller::fresh(config, &VarMap::new(), &Device::Cpu).unwrap_err();
        assert!(matches!(err, LasError::Config(_)), "{err}");
    }

    #[test]
    fn test_missing_weights_file() {
        let err = Speller::from_safetensors(
            SpellerConfig::new(7),
            "/nonexistent/speller.safetensors",
            &Device::Cpu,
        )
        .unwrap_err();
        assert!(matches!(err, LasError::Model(_)));
    }
}
