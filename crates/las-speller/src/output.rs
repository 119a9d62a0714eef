//! Параметры вызова decode и формы результата.
//!
//! Результат имеет две строго разные формы: обучение (только распределения)
//! и инференс (распределения + диагностика). Частично заполненной
//! диагностики не бывает.

use candle_core::{DType, Device, Result, Tensor, D};
use las_core::LanguageModel;

/// Параметры одного вызова [`Speller::decode`](crate::Speller::decode).
pub struct DecodeOptions<'a> {
    /// Целевые токены `[batch, len]` (`u32`/`i64`); `None` для чистого инференса.
    pub targets: Option<&'a Tensor>,
    /// Вероятность teacher forcing (одна монетка на весь вызов).
    pub teacher_forcing_ratio: f64,
    /// Внешняя LM для shallow fusion (только free-running инференс).
    pub language_model: Option<&'a mut dyn LanguageModel>,
    /// Режим обучения: dropout включён, диагностика не собирается.
    pub train: bool,
}

impl Default for DecodeOptions<'_> {
    fn default() -> Self {
        Self {
            targets: None,
            teacher_forcing_ratio: 1.0,
            language_model: None,
            train: false,
        }
    }
}

impl<'a> DecodeOptions<'a> {
    /// Greedy-инференс без целевых токенов (teacher forcing выключен).
    pub fn inference() -> Self {
        Self {
            teacher_forcing_ratio: 0.0,
            ..Self::default()
        }
    }

    /// Обучающий вызов с teacher forcing по `targets`.
    pub fn teacher_forced(targets: &'a Tensor) -> Self {
        Self {
            targets: Some(targets),
            teacher_forcing_ratio: 1.0,
            train: true,
            ..Self::default()
        }
    }

    /// Задать целевые токены.
    pub fn with_targets(mut self, targets: &'a Tensor) -> Self {
        self.targets = Some(targets);
        self
    }

    /// Задать вероятность teacher forcing.
    pub fn with_teacher_forcing_ratio(mut self, ratio: f64) -> Self {
        self.teacher_forcing_ratio = ratio;
        self
    }

    /// Подключить языковую модель.
    pub fn with_language_model(mut self, language_model: &'a mut dyn LanguageModel) -> Self {
        self.language_model = Some(language_model);
        self
    }

    /// Включить/выключить режим обучения.
    pub fn with_train(mut self, train: bool) -> Self {
        self.train = train;
        self
    }
}

/// Размеры одного шага декодирования.
///
/// Нужны, чтобы собрать тензоры правильной формы и для пустого результата
/// (`max_length = 0` или targets из одного токена).
#[derive(Debug, Clone)]
pub struct StepLayout {
    pub batch_size: usize,
    pub num_classes: usize,
    /// Длина выходов энкодера.
    pub time: usize,
    /// Тип распределений и выравниваний.
    pub dtype: DType,
    pub device: Device,
}

/// Диагностика free-running инференса (по одному элементу на шаг).
#[derive(Debug, Clone)]
pub struct DecodeDiagnostics {
    /// Выравнивание внимания на каждом шаге: `[batch, time]`.
    pub attention: Vec<Tensor>,
    /// Токен, поданный на вход шага: `[batch, 1]` (`u32`).
    pub sequence_symbols: Vec<Tensor>,
    pub layout: StepLayout,
}

impl DecodeDiagnostics {
    /// Количество записанных шагов.
    pub fn len(&self) -> usize {
        self.sequence_symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequence_symbols.is_empty()
    }

    /// Поданные на вход токены одной матрицей `[batch, steps]`.
    pub fn fed_tokens(&self) -> Result<Tensor> {
        if self.sequence_symbols.is_empty() {
            let layout = &self.layout;
            return Tensor::zeros((layout.batch_size, 0), DType::U32, &layout.device);
        }
        Tensor::cat(&self.sequence_symbols, 1)
    }

    /// Выравнивания одним тензором `[batch, steps, time]`.
    pub fn alignments(&self) -> Result<Tensor> {
        if self.attention.is_empty() {
            let layout = &self.layout;
            return Tensor::zeros((layout.batch_size, 0, layout.time), layout.dtype, &layout.device);
        }
        Tensor::stack(&self.attention, 1)
    }
}

/// Результат decode.
#[derive(Debug, Clone)]
pub enum SpellerOutput {
    /// Только распределения по шагам.
    ///
    /// Возвращается для обучающих вызовов и для любого teacher-forced вызова.
    Training {
        /// `[batch, vocab]` log-вероятности на каждом шаге.
        step_outputs: Vec<Tensor>,
        layout: StepLayout,
    },
    /// Free-running инференс: распределения и диагностика.
    Inference {
        /// `[batch, vocab]` log-вероятности на каждом шаге (после fusion с LM).
        step_outputs: Vec<Tensor>,
        diagnostics: DecodeDiagnostics,
    },
}

impl SpellerOutput {
    /// Распределения по шагам.
    pub fn step_outputs(&self) -> &[Tensor] {
        match self {
            SpellerOutput::Training { step_outputs, .. } => step_outputs,
            SpellerOutput::Inference { step_outputs, .. } => step_outputs,
        }
    }

    /// Размеры шага.
    pub fn layout(&self) -> &StepLayout {
        match self {
            SpellerOutput::Training { layout, .. } => layout,
            SpellerOutput::Inference { diagnostics, .. } => &diagnostics.layout,
        }
    }

    pub fn into_step_outputs(self) -> Vec<Tensor> {
        match self {
            SpellerOutput::Training { step_outputs, .. } => step_outputs,
            SpellerOutput::Inference { step_outputs, .. } => step_outputs,
        }
    }

    /// Диагностика (только для free-running инференса).
    pub fn diagnostics(&self) -> Option<&DecodeDiagnostics> {
        match self {
            SpellerOutput::Training { .. } => None,
            SpellerOutput::Inference { diagnostics, .. } => Some(diagnostics),
        }
    }

    /// Количество выполненных шагов.
    pub fn len(&self) -> usize {
        self.step_outputs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.step_outputs().is_empty()
    }

    /// Распределения одним тензором `[batch, steps, vocab]` (вход для loss).
    pub fn stacked(&self) -> Result<Tensor> {
        if self.is_empty() {
            let layout = self.layout();
            return Tensor::zeros(
                (layout.batch_size, 0, layout.num_classes),
                layout.dtype,
                &layout.device,
            );
        }
        Tensor::stack(self.step_outputs(), 1)
    }

    /// Arg-max токены каждого шага `[batch, steps]`.
    pub fn predicted_tokens(&self) -> Result<Tensor> {
        if self.is_empty() {
            let layout = self.layout();
            return Tensor::zeros((layout.batch_size, 0), DType::U32, &layout.device);
        }
        let tokens = self
            .step_outputs()
            .iter()
            .map(|step| step.argmax_keepdim(D::Minus1))
            .collect::<Result<Vec<_>>>()?;
        Tensor::cat(&tokens, 1)
    }
}
