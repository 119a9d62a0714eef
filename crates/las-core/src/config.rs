//! Конфигурационные структуры для speller'а и аудио-фронтенда.
//!
//! Селекторы (`attn_mechanism`, `rnn_type`, `kind`) хранятся строками, как в
//! `config.json`, и разбираются в перечисления при конструировании модели.
//! Неизвестное значение даёт [`LasError::Config`] ещё до первого вызова decode.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{LasError, LasResult};

// ---------------------------------------------------------------------------
// Селекторы
// ---------------------------------------------------------------------------

/// Вариант механизма внимания.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttentionKind {
    /// Content-based multi-head attention: без состояния между шагами.
    ContentBased,
    /// Location-aware attention: требует выравнивание предыдущего шага.
    LocationAware,
}

impl AttentionKind {
    /// Строковый идентификатор (каноническое имя в config.json).
    pub fn as_str(&self) -> &'static str {
        match self {
            AttentionKind::ContentBased => "dot",
            AttentionKind::LocationAware => "loc",
        }
    }

    /// Парсинг из строки.
    pub fn from_str_loose(s: &str) -> Option<AttentionKind> {
        match s.to_lowercase().as_str() {
            "dot" | "content-based" | "content" | "multi-head" | "multihead" => {
                Some(AttentionKind::ContentBased)
            }
            "loc" | "location-aware" | "location" => Some(AttentionKind::LocationAware),
            _ => None,
        }
    }

    /// `true`, если стратегия зависит от выравнивания предыдущего шага.
    ///
    /// Такие стратегии нельзя вызывать одним батчем по всей последовательности.
    pub fn is_sequential(&self) -> bool {
        matches!(self, AttentionKind::LocationAware)
    }
}

impl fmt::Display for AttentionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttentionKind::ContentBased => write!(f, "content-based"),
            AttentionKind::LocationAware => write!(f, "location-aware"),
        }
    }
}

/// Тип рекуррентной ячейки.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RnnKind {
    /// LSTM: состояние (h, c).
    Lstm,
    /// GRU: состояние h.
    Gru,
    /// Elman RNN с tanh.
    Rnn,
}

impl RnnKind {
    /// Строковый идентификатор.
    pub fn as_str(&self) -> &'static str {
        match self {
            RnnKind::Lstm => "lstm",
            RnnKind::Gru => "gru",
            RnnKind::Rnn => "rnn",
        }
    }

    /// Парсинг из строки.
    pub fn from_str_loose(s: &str) -> Option<RnnKind> {
        match s.to_lowercase().as_str() {
            "lstm" => Some(RnnKind::Lstm),
            "gru" => Some(RnnKind::Gru),
            "rnn" | "tanh" => Some(RnnKind::Rnn),
            _ => None,
        }
    }

    /// Количество гейтов (множитель для размера весов: 4 для LSTM, 3 для GRU).
    pub fn num_gates(&self) -> usize {
        match self {
            RnnKind::Lstm => 4,
            RnnKind::Gru => 3,
            RnnKind::Rnn => 1,
        }
    }
}

impl fmt::Display for RnnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Speller
// ---------------------------------------------------------------------------

fn default_max_length() -> usize {
    120
}
fn default_hidden_dim() -> usize {
    1024
}
fn default_sos_id() -> u32 {
    1
}
fn default_eos_id() -> u32 {
    2
}
fn default_attn_mechanism() -> String {
    "dot".to_string()
}
fn default_num_heads() -> usize {
    4
}
fn default_num_layers() -> usize {
    2
}
fn default_rnn_type() -> String {
    "lstm".to_string()
}
fn default_dropout_p() -> f32 {
    0.3
}
fn default_acoustic_weight() -> f64 {
    0.9
}
fn default_language_weight() -> f64 {
    0.1
}
fn default_layer_norm_eps() -> f64 {
    1e-5
}
fn default_location_smoothing() -> bool {
    true
}

fn default_n_mfcc_mels() -> usize {
    128
}

/// Конфигурация декодера (Speller).
///
/// Все параметры фиксируются при конструировании и не меняются между
/// вызовами decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpellerConfig {
    /// Размер словаря (количество классов на выходе).
    pub num_classes: usize,

    /// Максимальная длина free-running декодирования.
    #[serde(default = "default_max_length")]
    pub max_length: usize,

    /// Размерность скрытого состояния (эмбеддинг, RNN, внимание).
    #[serde(default = "default_hidden_dim")]
    pub hidden_dim: usize,

    /// Индекс start-of-sequence токена.
    #[serde(default = "default_sos_id")]
    pub sos_id: u32,

    /// Индекс end-of-sequence токена.
    #[serde(default = "default_eos_id")]
    pub eos_id: u32,

    /// Механизм внимания: "dot" (content-based) или "loc" (location-aware).
    #[serde(default = "default_attn_mechanism")]
    pub attn_mechanism: String,

    /// Количество голов content-based внимания.
    #[serde(default = "default_num_heads")]
    pub num_heads: usize,

    /// Количество рекуррентных слоёв.
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,

    /// Тип рекуррентной ячейки: "lstm", "gru" или "rnn".
    #[serde(default = "default_rnn_type")]
    pub rnn_type: String,

    /// Вероятность dropout (эмбеддинг и между слоями RNN).
    #[serde(default = "default_dropout_p")]
    pub dropout_p: f32,

    /// Вес акустической модели при fusion с LM.
    #[serde(default = "default_acoustic_weight", alias = "acoutsic_weight")]
    pub acoustic_weight: f64,

    /// Вес языковой модели при fusion.
    #[serde(default = "default_language_weight")]
    pub language_weight: f64,

    /// Epsilon для LayerNorm в выходной проекции.
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,

    /// Сглаживание location-aware внимания (sigmoid вместо softmax).
    #[serde(default = "default_location_smoothing")]
    pub location_smoothing: bool,
}

impl SpellerConfig {
    /// Конфигурация с параметрами по умолчанию для словаря `num_classes`.
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            max_length: default_max_length(),
            hidden_dim: default_hidden_dim(),
            sos_id: default_sos_id(),
            eos_id: default_eos_id(),
            attn_mechanism: default_attn_mechanism(),
            num_heads: default_num_heads(),
            num_layers: default_num_layers(),
            rnn_type: default_rnn_type(),
            dropout_p: default_dropout_p(),
            acoustic_weight: default_acoustic_weight(),
            language_weight: default_language_weight(),
            layer_norm_eps: default_layer_norm_eps(),
            location_smoothing: default_location_smoothing(),
        }
    }

    /// Загрузить конфигурацию из JSON-файла.
    pub fn from_json_file(path: impl AsRef<Path>) -> LasResult<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Задать механизм внимания.
    pub fn with_attention(mut self, attn_mechanism: impl Into<String>) -> Self {
        self.attn_mechanism = attn_mechanism.into();
        self
    }

    /// Задать тип рекуррентной ячейки.
    pub fn with_rnn_type(mut self, rnn_type: impl Into<String>) -> Self {
        self.rnn_type = rnn_type.into();
        self
    }

    /// Задать размерность скрытого состояния и количество голов.
    pub fn with_hidden_dim(mut self, hidden_dim: usize, num_heads: usize) -> Self {
        self.hidden_dim = hidden_dim;
        self.num_heads = num_heads;
        self
    }

    /// Задать количество рекуррентных слоёв.
    pub fn with_num_layers(mut self, num_layers: usize) -> Self {
        self.num_layers = num_layers;
        self
    }

    /// Задать максимальную длину free-running декодирования.
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    /// Задать вероятность dropout.
    pub fn with_dropout(mut self, dropout_p: f32) -> Self {
        self.dropout_p = dropout_p;
        self
    }

    /// Разобранный механизм внимания.
    pub fn attention_kind(&self) -> LasResult<AttentionKind> {
        AttentionKind::from_str_loose(&self.attn_mechanism).ok_or_else(|| {
            LasError::Config(format!(
                "Unsupported attention: {} (ожидается dot или loc)",
                self.attn_mechanism
            ))
        })
    }

    /// Разобранный тип рекуррентной ячейки.
    pub fn rnn_kind(&self) -> LasResult<RnnKind> {
        RnnKind::from_str_loose(&self.rnn_type).ok_or_else(|| {
            LasError::Config(format!(
                "Unsupported rnn_type: {} (ожидается lstm, gru или rnn)",
                self.rnn_type
            ))
        })
    }

    /// Проверить согласованность конфигурации.
    pub fn validate(&self) -> LasResult<()> {
        let attention = self.attention_kind()?;
        self.rnn_kind()?;

        if self.num_classes == 0 {
            return Err(LasError::Config("num_classes должен быть > 0".into()));
        }
        if self.hidden_dim == 0 {
            return Err(LasError::Config("hidden_dim должен быть > 0".into()));
        }
        if self.num_layers == 0 {
            return Err(LasError::Config("num_layers должен быть > 0".into()));
        }
        if attention == AttentionKind::ContentBased
            && (self.num_heads == 0 || self.hidden_dim % self.num_heads != 0)
        {
            return Err(LasError::Config(format!(
                "hidden_dim={} не делится на num_heads={}",
                self.hidden_dim, self.num_heads
            )));
        }
        if !(0.0..1.0).contains(&self.dropout_p) {
            return Err(LasError::Config(format!(
                "dropout_p={} вне диапазона [0, 1)",
                self.dropout_p
            )));
        }
        for (name, id) in [("sos_id", self.sos_id), ("eos_id", self.eos_id)] {
            if id as usize >= self.num_classes {
                return Err(LasError::Config(format!(
                    "{name}={id} вне словаря размера {}",
                    self.num_classes
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Аудио-фронтенд
// ---------------------------------------------------------------------------

/// Тип акустических признаков.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureKind {
    /// Линейная log1p-спектрограмма.
    Spectrogram,
    /// Mel-спектрограмма в dB.
    MelSpectrogram,
    /// Mel-frequency cepstral coefficients.
    Mfcc,
}

impl FeatureKind {
    /// Парсинг из строки.
    pub fn from_str_loose(s: &str) -> Option<FeatureKind> {
        match s.to_lowercase().as_str() {
            "spect" | "spectrogram" => Some(FeatureKind::Spectrogram),
            "mel" | "melspectrogram" | "mel-spectrogram" => Some(FeatureKind::MelSpectrogram),
            "mfcc" => Some(FeatureKind::Mfcc),
            _ => None,
        }
    }
}

/// Конфигурация извлечения признаков.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureConfig {
    /// Тип признаков: "spect", "mel" или "mfcc".
    pub kind: String,

    /// Частота дискретизации в Гц.
    pub sample_rate: usize,

    /// Размер окна в миллисекундах.
    pub window_size_ms: usize,

    /// Шаг между окнами в миллисекундах.
    pub stride_ms: usize,

    /// Количество mel-бинов.
    pub n_mels: usize,

    /// Количество MFCC-коэффициентов.
    pub n_mfcc: usize,

    /// Количество mel-бинов, из которых считаются MFCC.
    #[serde(default = "default_n_mfcc_mels")]
    pub n_mfcc_mels: usize,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self::mel_spectrogram()
    }
}

impl FeatureConfig {
    /// Mel-спектрограмма: 80 бинов, окно 20 мс, шаг 10 мс.
    pub fn mel_spectrogram() -> Self {
        Self {
            kind: "mel".to_string(),
            sample_rate: 16000,
            window_size_ms: 20,
            stride_ms: 10,
            n_mels: 80,
            n_mfcc: 40,
            n_mfcc_mels: default_n_mfcc_mels(),
        }
    }

    /// Линейная спектрограмма.
    pub fn spectrogram() -> Self {
        Self {
            kind: "spect".to_string(),
            ..Self::mel_spectrogram()
        }
    }

    /// MFCC: 40 коэффициентов из 128 mel-бинов.
    pub fn mfcc() -> Self {
        Self {
            kind: "mfcc".to_string(),
            ..Self::mel_spectrogram()
        }
    }

    /// Разобранный тип признаков.
    pub fn feature_kind(&self) -> LasResult<FeatureKind> {
        FeatureKind::from_str_loose(&self.kind)
            .ok_or_else(|| LasError::Config(format!("Unsupported feature kind: {}", self.kind)))
    }

    /// Размер окна FFT в отсчётах.
    pub fn n_fft(&self) -> usize {
        self.sample_rate * self.window_size_ms / 1000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_speller_config() {
        let config = SpellerConfig::new(2001);
        assert_eq!(config.max_length, 120);
        assert_eq!(config.hidden_dim, 1024);
        assert_eq!(config.attention_kind().unwrap(), AttentionKind::ContentBased);
        assert_eq!(config.rnn_kind().unwrap(), RnnKind::Lstm);
        assert!((config.acoustic_weight - 0.9).abs() < 1e-12);
        assert!((config.language_weight - 0.1).abs() < 1e-12);
        config.validate().unwrap();
    }

    #[test]
    fn test_unknown_attention_is_config_error() {
        let config = SpellerConfig::new(10).with_attention("bogus");
        assert!(matches!(config.validate(), Err(LasError::Config(_))));
    }

    #[test]
    fn test_heads_must_divide_hidden() {
        let config = SpellerConfig::new(10).with_hidden_dim(10, 4);
        assert!(matches!(config.validate(), Err(LasError::Config(_))));

        // Для location-aware количество голов не важно
        let config = config.with_attention("loc");
        config.validate().unwrap();
    }

    #[test]
    fn test_json_defaults_and_weight_alias() {
        let json = r#"{"num_classes": 32, "attn_mechanism": "loc", "acoutsic_weight": 0.7}"#;
        let config: SpellerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.num_classes, 32);
        assert_eq!(config.attention_kind().unwrap(), AttentionKind::LocationAware);
        assert!((config.acoustic_weight - 0.7).abs() < 1e-12);
        assert_eq!(config.sos_id, 1);
        assert_eq!(config.eos_id, 2);
    }

    #[test]
    fn test_feature_config() {
        let config = FeatureConfig::default();
        assert_eq!(config.n_fft(), 320);
        assert_eq!(config.feature_kind().unwrap(), FeatureKind::MelSpectrogram);

        let bogus = FeatureConfig {
            kind: "fbank-ish".into(),
            ..FeatureConfig::default()
        };
        assert!(matches!(bogus.feature_kind(), Err(LasError::Config(_))));
    }

    #[test]
    fn test_from_json_file() {
        let dir = std::env::temp_dir();
        let good = dir.join(format!("las-config-{}.json", std::process::id()));
        std::fs::write(&good, r#"{"num_classes": 64, "rnn_type": "gru", "max_length": 50}"#).unwrap();
        let config = SpellerConfig::from_json_file(&good).unwrap();
        assert_eq!(config.rnn_kind().unwrap(), RnnKind::Gru);
        assert_eq!(config.max_length, 50);
        std::fs::remove_file(&good).ok();

        let bad = dir.join(format!("las-config-bad-{}.json", std::process::id()));
        std::fs::write(&bad, r#"{"num_classes": 64, "attn_mechanism": "bogus"}"#).unwrap();
        assert!(matches!(SpellerConfig::from_json_file(&bad), Err(LasError::Config(_))));
        std::fs::remove_file(&bad).ok();

        assert!(matches!(
            SpellerConfig::from_json_file(dir.join("no-such-las-config.json")),
            Err(LasError::Io(_))
        ));
    }
}
