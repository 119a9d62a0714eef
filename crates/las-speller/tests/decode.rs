//! Integration tests for the speller decoding loop.

use std::collections::HashMap;

use candle_core::{DType, Device, IndexOp, Tensor, D};
use candle_nn::{VarBuilder, VarMap};
use las_core::{LanguageModel, LasError, LasResult, SpellerConfig};
use las_speller::{DecodeOptions, Speller, SpellerOutput};
use rand::rngs::StdRng;
use rand::SeedableRng;

const VOCAB: usize = 10;
const HIDDEN: usize = 8;

fn config(attention: &str) -> SpellerConfig {
    SpellerConfig::new(VOCAB)
        .with_hidden_dim(HIDDEN, 2)
        .with_num_layers(2)
        .with_attention(attention)
        .with_max_length(5)
}

fn fresh_speller(config: SpellerConfig) -> Speller {
    Speller::fresh(config, &VarMap::new(), &Device::Cpu).expect("speller")
}

fn encoder_outputs(batch: usize, time: usize) -> Tensor {
    Tensor::randn(0f32, 1.0, (batch, time, HIDDEN), &Device::Cpu).unwrap()
}

fn targets() -> Tensor {
    Tensor::new(&[[1u32, 3, 4, 5, 6, 2], [1, 7, 8, 9, 3, 2]], &Device::Cpu).unwrap()
}

/// Maximum absolute difference between two tensors.
fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}

/// LM с фиксированным распределением, запоминающая каждую историю.
struct FixedLm {
    log_probs: Tensor,
    prepared: usize,
    histories: Vec<Vec<Vec<u32>>>,
}

impl FixedLm {
    fn new(batch: usize) -> Self {
        let logits: Vec<f32> = (0..batch * VOCAB).map(|i| (i % VOCAB) as f32 * 0.3).collect();
        let logits = Tensor::from_vec(logits, (batch, VOCAB), &Device::Cpu).unwrap();
        Self {
            log_probs: candle_nn::ops::log_softmax(&logits, D::Minus1).unwrap(),
            prepared: 0,
            histories: Vec::new(),
        }
    }
}

impl LanguageModel for FixedLm {
    fn prepare_for_inference(&mut self) {
        self.prepared += 1;
    }

    fn step_log_probs(&mut self, history: &Tensor) -> LasResult<Tensor> {
        self.histories.push(history.to_vec2()?);
        Ok(self.log_probs.clone())
    }
}

#[test]
fn test_teacher_forced_length_is_target_length_minus_one() {
    for attention in ["dot", "loc"] {
        let speller = fresh_speller(config(attention));
        let targets = targets();
        let mut rng = StdRng::seed_from_u64(7);

        let output = speller
            .decode(&encoder_outputs(2, 9), DecodeOptions::teacher_forced(&targets), &mut rng)
            .unwrap();

        assert!(matches!(output, SpellerOutput::Training { .. }), "{attention}");
        assert_eq!(output.len(), 5, "{attention}");
        for step in output.step_outputs() {
            assert_eq!(step.dims(), &[2, VOCAB]);
        }
        assert_eq!(output.stacked().unwrap().dims(), &[2, 5, VOCAB]);
    }
}

#[test]
fn test_free_running_length_is_max_length() {
    for attention in ["dot", "loc"] {
        let speller = fresh_speller(config(attention).with_max_length(7));
        let mut rng = StdRng::seed_from_u64(7);

        let output = speller
            .decode(&encoder_outputs(1, 4), DecodeOptions::inference(), &mut rng)
            .unwrap();

        assert_eq!(output.len(), 7, "{attention}");
        assert_eq!(output.diagnostics().map(|d| d.len()), Some(7), "{attention}");
    }
}

#[test]
fn test_teacher_forcing_without_targets_is_invalid() {
    let speller = fresh_speller(config("dot"));
    let mut rng = StdRng::seed_from_u64(0);

    for ratio in [0.1, 0.5, 1.0] {
        let options = DecodeOptions::inference().with_teacher_forcing_ratio(ratio);
        let err = speller.decode(&encoder_outputs(2, 4), options, &mut rng).unwrap_err();
        assert!(matches!(err, LasError::InvalidArgument(_)), "ratio={ratio}: {err}");
    }
}

#[test]
fn test_unknown_attention_fails_at_construction() {
    let err = Speller::fresh(config("bogus"), &VarMap::new(), &Device::Cpu).unwrap_err();
    assert!(matches!(err, LasError::Config(_)), "{err}");
}

#[test]
fn test_batch_of_two_free_running_scenario() {
    let speller = fresh_speller(config("dot"));
    let encoder_outputs = encoder_outputs(2, 6);
    let mut rng = StdRng::seed_from_u64(3);

    let output = speller
        .decode(&encoder_outputs, DecodeOptions::inference(), &mut rng)
        .unwrap();

    assert_eq!(output.len(), 5);
    for step in output.step_outputs() {
        assert_eq!(step.dims(), &[2, VOCAB]);
    }

    let diagnostics = output.diagnostics().expect("inference diagnostics");
    assert_eq!(diagnostics.sequence_symbols.len(), 5);
    assert_eq!(diagnostics.attention.len(), 5);
    for attention in &diagnostics.attention {
        assert_eq!(attention.dims(), &[2, 6]);
    }

    // Первый поданный токен SOS, дальше arg-max предыдущего шага
    let fed: Vec<Vec<u32>> = diagnostics.fed_tokens().unwrap().to_vec2().unwrap();
    let predicted: Vec<Vec<u32>> = output.predicted_tokens().unwrap().to_vec2().unwrap();
    for (fed_row, predicted_row) in fed.iter().zip(&predicted) {
        assert_eq!(fed_row[0], 1);
        assert_eq!(&fed_row[1..], &predicted_row[..4]);
    }
}

#[test]
fn test_content_based_batched_matches_stepwise() {
    let speller = fresh_speller(config("dot"));
    let encoder_outputs = encoder_outputs(2, 7);
    let targets = targets();
    let mut rng = StdRng::seed_from_u64(11);

    let options = DecodeOptions::teacher_forced(&targets).with_train(false);
    let batched = speller.decode(&encoder_outputs, options, &mut rng).unwrap();
    assert_eq!(batched.len(), 5);

    let mut hidden = None;
    for (t, expected) in batched.step_outputs().iter().enumerate() {
        let input = targets.i((.., t..t + 1)).unwrap();
        let step = speller
            .forward_step(&input, hidden.as_ref(), &encoder_outputs, None, false)
            .unwrap();
        let log_probs = step.log_probs.squeeze(1).unwrap();

        let diff = max_abs_diff(&log_probs, expected);
        eprintln!("step {t}: max |batched - stepwise| = {diff:.2e}");
        assert!(diff < 1e-4, "step {t}: diff {diff}");
        hidden = Some(step.hidden);
    }
}

#[test]
fn test_location_aware_alignment_changes_between_steps() {
    let speller = fresh_speller(config("loc").with_max_length(4));
    let mut rng = StdRng::seed_from_u64(5);

    let output = speller
        .decode(&encoder_outputs(1, 6), DecodeOptions::inference(), &mut rng)
        .unwrap();
    let attention = &output.diagnostics().expect("diagnostics").attention;

    for pair in attention.windows(2) {
        assert!(max_abs_diff(&pair[0], &pair[1]) > 1e-7);
    }
}

fn scalar(value: f32, shape: &[usize]) -> Tensor {
    let len = shape.iter().product();
    Tensor::from_vec(vec![value; len], shape, &Device::Cpu).unwrap()
}

/// Location-aware speller с hidden=1, у которого пик внимания сдвигается
/// на одну позицию за шаг независимо от состояния RNN.
fn shifting_speller() -> Speller {
    let device = Device::Cpu;
    let mut tensors = HashMap::new();
    tensors.insert("embedding.weight".to_string(), scalar(0.5, &[3, 1]));
    tensors.insert("rnn.weight_ih_l0".to_string(), scalar(0.1, &[1, 1]));
    tensors.insert("rnn.weight_hh_l0".to_string(), scalar(0.1, &[1, 1]));
    tensors.insert("rnn.bias_ih_l0".to_string(), scalar(0.0, &[1]));
    tensors.insert("rnn.bias_hh_l0".to_string(), scalar(0.0, &[1]));
    tensors.insert(
        "attention.conv1d.weight".to_string(),
        Tensor::from_slice(&[4f32, -4.0, 0.0], (1, 1, 3), &device).unwrap(),
    );
    tensors.insert("attention.conv1d.bias".to_string(), scalar(0.0, &[1]));
    tensors.insert("attention.query_proj.weight".to_string(), scalar(0.0, &[1, 1]));
    tensors.insert("attention.value_proj.weight".to_string(), scalar(1.0, &[1, 1]));
    tensors.insert("attention.score_proj.weight".to_string(), scalar(8.0, &[1, 1]));
    tensors.insert("attention.score_proj.bias".to_string(), scalar(-10.0, &[1]));
    tensors.insert("attention.bias".to_string(), scalar(0.0, &[1]));
    tensors.insert("linear1.weight".to_string(), scalar(0.2, &[1, 2]));
    tensors.insert("linear1.bias".to_string(), scalar(0.0, &[1]));
    tensors.insert("layer_norm.weight".to_string(), scalar(1.0, &[1]));
    tensors.insert("layer_norm.bias".to_string(), scalar(0.0, &[1]));
    tensors.insert("linear2.weight".to_string(), scalar(0.0, &[3, 1]));
    tensors.insert(
        "linear2.bias".to_string(),
        Tensor::from_slice(&[0f32, 0.0, 1.0], 3, &device).unwrap(),
    );
    let vb = VarBuilder::from_tensors(tensors, DType::F32, &device);

    let config = SpellerConfig::new(3)
        .with_hidden_dim(1, 1)
        .with_num_layers(1)
        .with_rnn_type("rnn")
        .with_attention("loc")
        .with_max_length(7);
    Speller::new(config, vb).expect("shifting speller")
}

#[test]
fn test_location_aware_alignment_moves_monotonically() {
    let speller = shifting_speller();
    let encoder_outputs = Tensor::from_slice(
        &[1f32, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        (1, 8, 1),
        &Device::Cpu,
    )
    .unwrap();
    let mut rng = StdRng::seed_from_u64(1);

    let output = speller
        .decode(&encoder_outputs, DecodeOptions::inference(), &mut rng)
        .unwrap();
    let diagnostics = output.diagnostics().expect("diagnostics");

    let positions: Vec<u32> = diagnostics
        .attention
        .iter()
        .map(|a| a.argmax(D::Minus1).unwrap().to_vec1::<u32>().unwrap()[0])
        .collect();
    eprintln!("alignment peaks: {positions:?}");

    assert_eq!(positions.len(), 7);
    assert!(positions.windows(2).all(|w| w[0] <= w[1]), "{positions:?}");
    assert_eq!(positions, vec![0, 1, 2, 3, 4, 5, 6]);
}

#[test]
fn test_language_model_fusion_weights() {
    let speller = fresh_speller(config("dot").with_max_length(4));
    let encoder_outputs = encoder_outputs(2, 5);
    let mut lm = FixedLm::new(2);
    let language = lm.log_probs.clone();
    let mut rng = StdRng::seed_from_u64(9);

    let output = speller
        .decode(
            &encoder_outputs,
            DecodeOptions::inference().with_language_model(&mut lm),
            &mut rng,
        )
        .unwrap();
    assert_eq!(output.len(), 4);

    // Повторить шаги вручную по записанным токенам и сверить 0.9·A + 0.1·B
    let diagnostics = output.diagnostics().expect("diagnostics");
    let mut hidden = None;
    let mut prior = None;
    for (t, fused) in output.step_outputs().iter().enumerate() {
        let input = &diagnostics.sequence_symbols[t];
        let step = speller
            .forward_step(input, hidden.as_ref(), &encoder_outputs, prior.as_ref(), false)
            .unwrap();
        let acoustic = step.log_probs.squeeze(1).unwrap();
        let expected = ((acoustic * 0.9).unwrap() + (&language * 0.1).unwrap()).unwrap();

        assert!(max_abs_diff(&expected, fused) < 1e-5, "step {t}");
        hidden = Some(step.hidden);
        prior = Some(step.alignment.squeeze(1).unwrap());
    }

    assert_eq!(lm.prepared, 1);
    let lengths: Vec<usize> = lm.histories.iter().map(|h| h[0].len()).collect();
    assert_eq!(lengths, vec![1, 2, 3, 4]);
}

#[test]
fn test_language_model_scores_fused_argmax_history() {
    let speller = fresh_speller(config("dot").with_max_length(4));
    let mut lm = FixedLm::new(2);
    let mut rng = StdRng::seed_from_u64(21);

    let output = speller
        .decode(
            &encoder_outputs(2, 5),
            DecodeOptions::inference().with_language_model(&mut lm),
            &mut rng,
        )
        .unwrap();
    let predicted: Vec<Vec<u32>> = output.predicted_tokens().unwrap().to_vec2().unwrap();
    let sos = speller.config().sos_id;

    // Шаг t видит SOS и arg-max fused распределений шагов 0..t
    assert_eq!(lm.histories.len(), 4);
    for (t, history) in lm.histories.iter().enumerate() {
        for (row, predicted_row) in history.iter().zip(&predicted) {
            assert_eq!(row[0], sos, "step {t}");
            assert_eq!(&row[1..], &predicted_row[..t], "step {t}");
        }
    }
    for pair in lm.histories.windows(2) {
        for (shorter, longer) in pair[0].iter().zip(&pair[1]) {
            assert!(longer.starts_with(shorter));
        }
    }
}

#[test]
fn test_language_model_ignored_in_training() {
    let speller = fresh_speller(config("dot"));
    let targets = targets();
    let mut lm = FixedLm::new(2);
    let mut rng = StdRng::seed_from_u64(9);

    let options = DecodeOptions::teacher_forced(&targets)
        .with_teacher_forcing_ratio(0.0)
        .with_language_model(&mut lm);
    let output = speller.decode(&encoder_outputs(2, 5), options, &mut rng).unwrap();

    assert!(matches!(output, SpellerOutput::Training { .. }));
    assert_eq!(output.len(), 5);
    assert_eq!(lm.prepared, 1);
    assert!(lm.histories.is_empty());
}

#[test]
fn test_seeded_rng_is_deterministic() {
    let speller = fresh_speller(config("loc"));
    let encoder_outputs = encoder_outputs(2, 6);
    let targets = targets();

    let run = |seed: u64| {
        let mut rng = StdRng::seed_from_u64(seed);
        let options = DecodeOptions::inference()
            .with_targets(&targets)
            .with_teacher_forcing_ratio(0.5);
        speller.decode(&encoder_outputs, options, &mut rng).unwrap()
    };

    let first = run(42);
    let second = run(42);
    assert_eq!(first.diagnostics().is_some(), second.diagnostics().is_some());
    assert_eq!(first.len(), second.len());
    for (a, b) in first.step_outputs().iter().zip(second.step_outputs()) {
        assert_eq!(max_abs_diff(a, b), 0.0);
    }

    // Монетка бросается один раз на вызов: каждый вызов целиком в одном режиме,
    // и на разных seed встречаются оба режима.
    let modes: Vec<bool> = (0..32).map(|seed| run(seed).diagnostics().is_some()).collect();
    assert!(modes.iter().any(|&m| m));
    assert!(modes.iter().any(|&m| !m));
}

#[test]
fn test_zero_max_length_gives_empty_shaped_trace() {
    let speller = fresh_speller(config("loc").with_max_length(0));
    let mut rng = StdRng::seed_from_u64(0);

    let output = speller
        .decode(&encoder_outputs(2, 6), DecodeOptions::inference(), &mut rng)
        .unwrap();
    assert!(output.is_empty());
    assert_eq!(output.stacked().unwrap().dims(), &[2, 0, VOCAB]);

    let predicted: Vec<Vec<u32>> = output.predicted_tokens().unwrap().to_vec2().unwrap();
    assert_eq!(predicted, vec![Vec::<u32>::new(); 2]);

    let diagnostics = output.diagnostics().expect("diagnostics");
    assert!(diagnostics.is_empty());
    assert_eq!(diagnostics.fed_tokens().unwrap().dims(), &[2, 0]);
    assert_eq!(diagnostics.alignments().unwrap().dims(), &[2, 0, 6]);
}

#[test]
fn test_single_token_targets_give_empty_loss_input() {
    let speller = fresh_speller(config("dot"));
    let targets = Tensor::new(&[[1u32], [1]], &Device::Cpu).unwrap();
    let mut rng = StdRng::seed_from_u64(0);

    let output = speller
        .decode(&encoder_outputs(2, 4), DecodeOptions::teacher_forced(&targets), &mut rng)
        .unwrap();
    assert!(matches!(output, SpellerOutput::Training { .. }));
    assert_eq!(output.stacked().unwrap().dims(), &[2, 0, VOCAB]);
    assert_eq!(output.predicted_tokens().unwrap().dims(), &[2, 0]);
}

#[test]
fn test_encoder_outputs_cast_to_weight_dtype() {
    let speller = fresh_speller(config("loc"));
    let encoder_outputs = encoder_outputs(2, 5).to_dtype(DType::F64).unwrap();
    let mut rng = StdRng::seed_from_u64(4);

    let output = speller
        .decode(&encoder_outputs, DecodeOptions::inference(), &mut rng)
        .unwrap();
    assert_eq!(output.len(), 5);
    assert_eq!(output.stacked().unwrap().dtype(), speller.dtype());
    for attention in &output.diagnostics().expect("diagnostics").attention {
        assert_eq!(attention.dtype(), speller.dtype());
    }
}
