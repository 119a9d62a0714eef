//! Стратегии внимания speller'а.
//!
//! Обе стратегии вызываются через один контракт
//! `attend(query, encoder_outputs, prior_alignment) → (context, alignment)`:
//!
//! - **content-based** (multi-head, scaled dot-product): не зависит от
//!   предыдущих шагов, `prior_alignment` игнорируется, допускает запрос
//!   сразу по всей последовательности `[batch, q_len, hidden]`;
//! - **location-aware**: свёртка по выравниванию предыдущего шага,
//!   требует строго пошагового вызова (`q_len == 1`).
//!
//! Весовые ключи (content-based):
//! - attention.linear_q / linear_k / linear_v: [hidden, hidden] + bias
//!
//! Весовые ключи (location-aware):
//! - attention.conv1d.weight: [hidden, 1, 3], attention.conv1d.bias: [hidden]
//! - attention.query_proj.weight, attention.value_proj.weight: [hidden, hidden]
//! - attention.score_proj.weight: [1, hidden], attention.score_proj.bias: [1]
//! - attention.bias: [hidden]

use candle_core::{Module, Result, Tensor, D};
use candle_nn::{Conv1d, Conv1dConfig, Init, Linear, VarBuilder};
use las_core::AttentionKind;

/// Результат одного вызова внимания.
#[derive(Debug, Clone)]
pub struct Attended {
    /// Контекстный вектор: [batch, q_len, hidden].
    pub context: Tensor,
    /// Выравнивание по позициям энкодера: [batch, q_len, time].
    pub alignment: Tensor,
}

/// Content-based multi-head attention.
#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    linear_q: Linear,
    linear_k: Linear,
    linear_v: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl MultiHeadAttention {
    pub fn load(hidden_dim: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        if num_heads == 0 || hidden_dim % num_heads != 0 {
            candle_core::bail!("hidden_dim={hidden_dim} не делится на num_heads={num_heads}");
        }
        Ok(Self {
            linear_q: candle_nn::linear(hidden_dim, hidden_dim, vb.pp("linear_q"))?,
            linear_k: candle_nn::linear(hidden_dim, hidden_dim, vb.pp("linear_k"))?,
            linear_v: candle_nn::linear(hidden_dim, hidden_dim, vb.pp("linear_v"))?,
            num_heads,
            head_dim: hidden_dim / num_heads,
        })
    }

    /// [batch, len, hidden] → [batch, heads, len, head_dim]
    fn split_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, len, _) = x.dims3()?;
        x.reshape((batch, len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// query: [batch, q_len, hidden], key/value: [batch, time, hidden].
    pub fn forward(&self, query: &Tensor, key: &Tensor, value: &Tensor) -> Result<Attended> {
        let (batch, q_len, _) = query.dims3()?;

        let q = self.split_heads(&self.linear_q.forward(&query.contiguous()?)?)?;
        let k = self.split_heads(&self.linear_k.forward(&key.contiguous()?)?)?;
        let v = self.split_heads(&self.linear_v.forward(&value.contiguous()?)?)?;

        // [batch, heads, q_len, time]
        let scores = (q.matmul(&k.t()?.contiguous()?)? / (self.head_dim as f64).sqrt())?;
        let attn = candle_nn::ops::softmax_last_dim(&scores)?;

        // [batch, heads, q_len, head_dim] → [batch, q_len, hidden]
        let context = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, q_len, self.num_heads * self.head_dim))?;

        // Для диагностики: среднее по головам
        let alignment = attn.mean(1)?;

        Ok(Attended { context, alignment })
    }
}

/// Location-aware attention со сглаживанием.
///
/// score = w · tanh(W_q q + W_v v + conv(prev_align) + b)
/// align = sigmoid(score) / Σ sigmoid(score)   (smoothing)
/// align = softmax(score)                       (без сглаживания)
#[derive(Debug, Clone)]
pub struct LocationAwareAttention {
    conv1d: Conv1d,
    query_proj: Linear,
    value_proj: Linear,
    score_proj: Linear,
    bias: Tensor, // [hidden]
    smoothing: bool,
}

impl LocationAwareAttention {
    pub fn load(hidden_dim: usize, smoothing: bool, vb: VarBuilder) -> Result<Self> {
        let conv_cfg = Conv1dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv1d = candle_nn::conv1d(1, hidden_dim, 3, conv_cfg, vb.pp("conv1d"))?;
        let query_proj = candle_nn::linear_no_bias(hidden_dim, hidden_dim, vb.pp("query_proj"))?;
        let value_proj = candle_nn::linear_no_bias(hidden_dim, hidden_dim, vb.pp("value_proj"))?;
        let score_proj = candle_nn::linear(hidden_dim, 1, vb.pp("score_proj"))?;
        let bias = vb.get_with_hints(hidden_dim, "bias", Init::Uniform { lo: -0.1, up: 0.1 })?;
        Ok(Self {
            conv1d,
            query_proj,
            value_proj,
            score_proj,
            bias,
            smoothing,
        })
    }

    /// * `query`: [batch, 1, hidden]
    /// * `value`: [batch, time, hidden]
    /// * `last_alignment`: [batch, time]; `None` означает нулевое (нет предыдущего шага).
    pub fn forward(&self, query: &Tensor, value: &Tensor, last_alignment: Option<&Tensor>) -> Result<Attended> {
        let (batch, time, _) = value.dims3()?;
        let q_len = query.dim(1)?;
        if q_len != 1 {
            candle_core::bail!("location-aware attention вызывается пошагово, получено q_len={q_len}");
        }

        let last_alignment = match last_alignment {
            Some(a) => a.clone(),
            None => Tensor::zeros((batch, time), value.dtype(), value.device())?,
        };

        // [batch, 1, time] → [batch, hidden, time] → [batch, time, hidden]
        let conv_attn = self
            .conv1d
            .forward(&last_alignment.unsqueeze(1)?.contiguous()?)?
            .transpose(1, 2)?;

        let q = self.query_proj.forward(&query.contiguous()?)?; // [batch, 1, hidden]
        let v = self.value_proj.forward(&value.contiguous()?)?; // [batch, time, hidden]

        let energy = v
            .broadcast_add(&q)?
            .add(&conv_attn)?
            .broadcast_add(&self.bias)?
            .tanh()?;
        let score = self.score_proj.forward(&energy)?.squeeze(D::Minus1)?; // [batch, time]

        let alignment = if self.smoothing {
            let score = candle_nn::ops::sigmoid(&score)?;
            score.broadcast_div(&score.sum_keepdim(D::Minus1)?)?
        } else {
            candle_nn::ops::softmax_last_dim(&score)?
        };

        let alignment = alignment.unsqueeze(1)?; // [batch, 1, time]
        let context = alignment.matmul(&value.contiguous()?)?; // [batch, 1, hidden]

        Ok(Attended { context, alignment })
    }
}

/// Стратегия внимания: tagged variant с общим контрактом вызова.
///
/// Цикл декодирования смотрит на тег только для выбора гранулярности шагов
/// (батч по всей последовательности или строго по одному шагу).
#[derive(Debug, Clone)]
pub enum Attention {
    ContentBased(MultiHeadAttention),
    LocationAware(LocationAwareAttention),
}

impl Attention {
    /// Загрузка стратегии заданного вида.
    pub fn load(
        kind: AttentionKind,
        hidden_dim: usize,
        num_heads: usize,
        smoothing: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        match kind {
            AttentionKind::ContentBased => Ok(Attention::ContentBased(MultiHeadAttention::load(
                hidden_dim, num_heads, vb,
            )?)),
            AttentionKind::LocationAware => Ok(Attention::LocationAware(
                LocationAwareAttention::load(hidden_dim, smoothing, vb)?,
            )),
        }
    }

    pub fn kind(&self) -> AttentionKind {
        match self {
            Attention::ContentBased(_) => AttentionKind::ContentBased,
            Attention::LocationAware(_) => AttentionKind::LocationAware,
        }
    }

    /// Вызов стратегии.
    ///
    /// Content-based использует `encoder_outputs` и как ключи, и как значения;
    /// location-aware дополнительно получает выравнивание предыдущего шага.
    pub fn attend(
        &self,
        query: &Tensor,
        encoder_outputs: &Tensor,
        prior_alignment: Option<&Tensor>,
    ) -> Result<Attended> {
        match self {
            Attention::ContentBased(mha) => mha.forward(query, encoder_outputs, encoder_outputs),
            Attention::LocationAware(loc) => loc.forward(query, encoder_outputs, prior_alignment),
        }
    }
}
