//! Цикл авторегрессионного декодирования.
//!
//! Один вызов [`Speller::decode`]:
//! 1. разбор аргументов ([`validate_args`]);
//! 2. одна монетка на весь вызов: teacher forcing или free-running;
//! 3. шаги [`Speller::forward_step`] с передачей состояния RNN и
//!    выравнивания от шага к шагу;
//! 4. результат [`SpellerOutput`].
//!
//! Состояние живёт только внутри вызова: каждый decode начинается с нулевого
//! состояния RNN и без предыдущего выравнивания.

use candle_core::{IndexOp, Result, Tensor, D};
use rand::Rng;
use tracing::debug;

use las_core::{LanguageModel, LasError, LasResult};

use crate::output::{DecodeDiagnostics, DecodeOptions, SpellerOutput, StepLayout};
use crate::rnn::RecurrentState;
use crate::speller::Speller;
use crate::validate::validate_args;

/// Сессия декодирования одного вызова.
///
/// NotStarted (`new`) → Stepping (`step`) → Finished (`finish` поглощает цикл).
struct DecodingLoop<'s> {
    speller: &'s Speller,
    encoder_outputs: &'s Tensor,
    train: bool,
    hidden: Option<RecurrentState>,
    alignment: Option<Tensor>,
    step_outputs: Vec<Tensor>,
    layout: StepLayout,
    diagnostics: Option<DecodeDiagnostics>,
}

impl<'s> DecodingLoop<'s> {
    fn new(
        speller: &'s Speller,
        encoder_outputs: &'s Tensor,
        train: bool,
        collect_diagnostics: bool,
        capacity: usize,
    ) -> Result<Self> {
        let (batch_size, time, _) = encoder_outputs.dims3()?;
        let layout = StepLayout {
            batch_size,
            num_classes: speller.num_classes(),
            time,
            dtype: speller.dtype(),
            device: encoder_outputs.device().clone(),
        };
        let diagnostics = collect_diagnostics.then(|| DecodeDiagnostics {
            attention: Vec::with_capacity(capacity),
            sequence_symbols: Vec::with_capacity(capacity),
            layout: layout.clone(),
        });
        Ok(Self {
            speller,
            encoder_outputs,
            train,
            hidden: None,
            alignment: None,
            step_outputs: Vec::with_capacity(capacity),
            layout,
            diagnostics,
        })
    }

    /// Шаг декодера по входу `[batch, n]`.
    ///
    /// Заменяет живое состояние RNN и выравнивание; возвращает
    /// log-вероятности `[batch, n, vocab]`.
    fn step(&mut self, input: &Tensor) -> Result<Tensor> {
        let out = self.speller.forward_step(
            input,
            self.hidden.as_ref(),
            self.encoder_outputs,
            self.alignment.as_ref(),
            self.train,
        )?;

        let n = out.alignment.dim(1)?;
        let alignment = out.alignment.i((.., n - 1, ..))?; // [batch, time]

        if let Some(diagnostics) = self.diagnostics.as_mut() {
            diagnostics.attention.push(alignment.clone());
            diagnostics.sequence_symbols.push(input.clone());
        }

        self.hidden = Some(out.hidden);
        self.alignment = Some(alignment);
        Ok(out.log_probs)
    }

    /// Добавить распределение шага `[batch, vocab]` в результат.
    fn push_output(&mut self, log_probs: Tensor) {
        self.step_outputs.push(log_probs);
    }

    fn finish(self) -> SpellerOutput {
        match self.diagnostics {
            Some(diagnostics) => SpellerOutput::Inference {
                step_outputs: self.step_outputs,
                diagnostics,
            },
            None => SpellerOutput::Training {
                step_outputs: self.step_outputs,
                layout: self.layout,
            },
        }
    }
}

impl Speller {
    /// Декодировать батч выходов энкодера.
    ///
    /// * `encoder_outputs`: [batch, time, hidden], только чтение.
    /// * `options`: targets, вероятность teacher forcing, LM, режим.
    /// * `rng`: источник случайности для выбора режима (одна выборка на вызов).
    ///
    /// Ошибки: [`LasError::InvalidArgument`] при teacher forcing без targets
    /// или несовместимых формах.
    pub fn decode<R: Rng + ?Sized>(
        &self,
        encoder_outputs: &Tensor,
        options: DecodeOptions<'_>,
        rng: &mut R,
    ) -> LasResult<SpellerOutput> {
        let DecodeOptions {
            targets,
            teacher_forcing_ratio,
            mut language_model,
            train,
        } = options;

        let session = validate_args(
            self.config(),
            targets,
            encoder_outputs,
            teacher_forcing_ratio,
            language_model.as_deref_mut(),
        )?;

        let encoder_outputs = &encoder_outputs.to_dtype(self.dtype())?;

        let use_teacher_forcing = rng.gen::<f64>() < teacher_forcing_ratio;
        debug!(
            "Speller decode: {}, batch={}, шагов={}, train={}",
            if use_teacher_forcing { "teacher forcing" } else { "free-running" },
            session.batch_size,
            session.max_length,
            train
        );

        let output = if use_teacher_forcing {
            self.decode_teacher_forced(encoder_outputs, &session.inputs, session.max_length, train)?
        } else {
            let lm = if train { None } else { language_model.as_deref_mut() };
            self.decode_free_running(encoder_outputs, &session.inputs, session.max_length, train, lm)?
        };

        debug!("Speller decode: выполнено {} шагов", output.len());
        Ok(output)
    }

    /// Teacher forcing: на вход подаются целевые токены без EOS.
    fn decode_teacher_forced(
        &self,
        encoder_outputs: &Tensor,
        targets: &Tensor,
        max_length: usize,
        train: bool,
    ) -> LasResult<SpellerOutput> {
        let inputs = self.strip_eos(targets, max_length)?;
        let steps = inputs.dim(1)?;
        let mut lp = DecodingLoop::new(self, encoder_outputs, train, false, steps)?;
        if steps == 0 {
            return Ok(lp.finish());
        }

        if self.attention_kind().is_sequential() {
            // Location-aware: строго по одному шагу, выравнивание передаётся дальше.
            for t in 0..steps {
                let input = inputs.narrow(1, t, 1)?;
                let log_probs = lp.step(&input)?;
                lp.push_output(log_probs.squeeze(1)?);
            }
        } else {
            // Content-based: вся последовательность одним вызовом.
            let log_probs = lp.step(&inputs)?;
            for t in 0..steps {
                lp.push_output(log_probs.i((.., t, ..))?);
            }
        }

        Ok(lp.finish())
    }

    /// Greedy free-running: на вход подаётся arg-max предыдущего шага.
    ///
    /// Всегда выполняется ровно `max_length` шагов, EOS не останавливает цикл.
    fn decode_free_running(
        &self,
        encoder_outputs: &Tensor,
        inputs: &Tensor,
        max_length: usize,
        train: bool,
        mut language_model: Option<&mut (dyn LanguageModel + '_)>,
    ) -> LasResult<SpellerOutput> {
        let mut lp = DecodingLoop::new(self, encoder_outputs, train, !train, max_length)?;
        let mut input = inputs.narrow(1, 0, 1)?.contiguous()?;
        let mut history = input.clone();

        for step in 0..max_length {
            let mut log_probs = lp.step(&input)?.squeeze(1)?; // [batch, vocab]

            if let Some(lm) = language_model.as_deref_mut() {
                let lm_log_probs = lm.step_log_probs(&history)?;
                log_probs = self.fuser.fuse(&log_probs, &lm_log_probs)?;
            }

            input = log_probs.argmax_keepdim(D::Minus1)?; // [batch, 1]
            if language_model.is_some() {
                history = Tensor::cat(&[&history, &input], 1)?;
            }

            if las_core::debug::enabled() {
                let tokens: Vec<u32> = input.flatten_all()?.to_vec1()?;
                debug!("Speller step {}: tokens={:?}", step, tokens);
            }

            lp.push_output(log_probs);
        }

        Ok(lp.finish())
    }

    /// Убрать EOS из целевых токенов и ограничить ширину `max_length`.
    fn strip_eos(&self, targets: &Tensor, max_length: usize) -> LasResult<Tensor> {
        let eos_id = self.config().eos_id;
        let rows: Vec<Vec<u32>> = targets.to_vec2()?;

        let stripped: Vec<Vec<u32>> = rows
            .into_iter()
            .map(|row| row.into_iter().filter(|&t| t != eos_id).collect())
            .collect();

        let width = stripped.first().map_or(0, Vec::len);
        if stripped.iter().any(|row| row.len() != width) {
            return Err(LasError::InvalidArgument(format!(
                "после удаления EOS (id={eos_id}) строки targets имеют разную длину"
            )));
        }

        let width = width.min(max_length);
        let flat: Vec<u32> = stripped
            .iter()
            .flat_map(|row| row[..width].iter().copied())
            .collect();
        Ok(Tensor::from_vec(flat, (stripped.len(), width), targets.device())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;
    use las_core::SpellerConfig;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn speller() -> Speller {
        let config = SpellerConfig::new(6).with_hidden_dim(4, 2).with_num_layers(1);
        Speller::fresh(config, &VarMap::new(), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_strip_eos() {
        let speller = speller();
        let targets = Tensor::new(&[[1u32, 3, 4, 2], [1, 5, 2, 0]], &Device::Cpu).unwrap();
        let stripped: Vec<Vec<u32>> = speller.strip_eos(&targets, 3).unwrap().to_vec2().unwrap();
        assert_eq!(stripped, vec![vec![1, 3, 4], vec![1, 5, 0]]);
    }

    #[test]
    fn test_strip_eos_ragged() {
        let speller = speller();
        let targets = Tensor::new(&[[1u32, 3, 2, 2], [1, 5, 4, 2]], &Device::Cpu).unwrap();
        let err = speller.strip_eos(&targets, 3).unwrap_err();
        assert!(matches!(err, LasError::InvalidArgument(_)));
    }

    #[test]
    fn test_single_token_targets() {
        let speller = speller();
        let encoder_outputs = Tensor::zeros((1, 3, 4), candle_core::DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::new(&[[1u32]], &Device::Cpu).unwrap();
        let mut rng = StdRng::seed_from_u64(0);

        let output = speller
            .decode(&encoder_outputs, DecodeOptions::teacher_forced(&targets), &mut rng)
            .unwrap();
        assert!(output.is_empty());
    }
}
