//! Разбор аргументов вызова decode до запуска цикла.

use candle_core::{DType, Tensor};
use las_core::{LanguageModel, LasError, LasResult, SpellerConfig};

/// Параметры сессии декодирования.
#[derive(Debug, Clone)]
pub struct DecodeSession {
    /// Входные токены: SOS `[batch, 1]` либо целевые токены `[batch, len]` (`u32`).
    pub inputs: Tensor,
    pub batch_size: usize,
    /// Количество шагов: `max_length` без targets, `len - 1` с targets.
    pub max_length: usize,
}

/// Проверить аргументы decode и вычислить параметры сессии.
///
/// Если передана LM, она переводится в режим инференса (единственный
/// побочный эффект).
pub fn validate_args(
    config: &SpellerConfig,
    targets: Option<&Tensor>,
    encoder_outputs: &Tensor,
    teacher_forcing_ratio: f64,
    language_model: Option<&mut (dyn LanguageModel + '_)>,
) -> LasResult<DecodeSession> {
    let (batch_size, _, _) = encoder_outputs.dims3().map_err(|_| {
        LasError::InvalidArgument(format!(
            "encoder_outputs должен быть [batch, time, hidden], получено {:?}",
            encoder_outputs.dims()
        ))
    })?;

    let session = match targets {
        None => {
            if teacher_forcing_ratio > 0.0 {
                return Err(LasError::InvalidArgument(
                    "teacher forcing без targets невозможен: передайте targets \
                     или teacher_forcing_ratio = 0"
                        .into(),
                ));
            }
            let inputs = Tensor::full(config.sos_id, (batch_size, 1), encoder_outputs.device())?;
            DecodeSession {
                inputs,
                batch_size,
                max_length: config.max_length,
            }
        }
        Some(targets) => {
            let (target_batch, target_len) = targets.dims2().map_err(|_| {
                LasError::InvalidArgument(format!(
                    "targets должен быть [batch, len], получено {:?}",
                    targets.dims()
                ))
            })?;
            if target_batch != batch_size {
                return Err(LasError::InvalidArgument(format!(
                    "batch targets ({target_batch}) != batch encoder_outputs ({batch_size})"
                )));
            }
            if target_len == 0 {
                return Err(LasError::InvalidArgument("пустые targets".into()));
            }
            DecodeSession {
                inputs: targets.to_dtype(DType::U32)?,
                batch_size,
                max_length: target_len - 1,
            }
        }
    };

    if let Some(lm) = language_model {
        lm.prepare_for_inference();
    }

    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    struct CountingLm {
        prepared: usize,
    }

    impl LanguageModel for CountingLm {
        fn prepare_for_inference(&mut self) {
            self.prepared += 1;
        }

        fn step_log_probs(&mut self, history: &Tensor) -> LasResult<Tensor> {
            Ok(Tensor::zeros((history.dim(0)?, 4), DType::F32, history.device())?)
        }
    }

    fn encoder_outputs(batch: usize) -> Tensor {
        Tensor::zeros((batch, 5, 8), DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_inference_seeds_sos() {
        let config = SpellerConfig::new(10).with_max_length(7);
        let session = validate_args(&config, None, &encoder_outputs(3), 0.0, None).unwrap();

        assert_eq!(session.batch_size, 3);
        assert_eq!(session.max_length, 7);
        assert_eq!(session.inputs.dims(), &[3, 1]);
        let seed: Vec<u32> = session.inputs.flatten_all().unwrap().to_vec1().unwrap();
        assert!(seed.iter().all(|&t| t == config.sos_id));
    }

    #[test]
    fn test_teacher_forcing_without_targets() {
        let config = SpellerConfig::new(10);
        let err = validate_args(&config, None, &encoder_outputs(2), 0.5, None).unwrap_err();
        assert!(matches!(err, LasError::InvalidArgument(_)));
    }

    #[test]
    fn test_targets_cap_length() {
        let config = SpellerConfig::new(10);
        let targets = Tensor::new(&[[1i64, 4, 5, 2], [1, 6, 2, 0]], &Device::Cpu).unwrap();
        let session = validate_args(&config, Some(&targets), &encoder_outputs(2), 1.0, None).unwrap();

        assert_eq!(session.max_length, 3);
        assert_eq!(session.inputs.dtype(), DType::U32);
    }

    #[test]
    fn test_batch_mismatch() {
        let config = SpellerConfig::new(10);
        let targets = Tensor::new(&[[1u32, 4, 2]], &Device::Cpu).unwrap();
        let err = validate_args(&config, Some(&targets), &encoder_outputs(2), 1.0, None).unwrap_err();
        assert!(matches!(err, LasError::InvalidArgument(_)));
    }

    #[test]
    fn test_language_model_prepared() {
        let config = SpellerConfig::new(10);
        let mut lm = CountingLm { prepared: 0 };
        validate_args(&config, None, &encoder_outputs(1), 0.0, Some(&mut lm)).unwrap();
        assert_eq!(lm.prepared, 1);
    }
}
