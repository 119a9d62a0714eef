//! ListenAttendSpell: композиция энкодера и speller'а.

use std::path::Path;
use std::time::Instant;

use candle_core::{Device, Tensor};
use rand::Rng;
use tracing::{debug, info};

use las_core::{FeatureExtractor, LasError, LasResult, Listener};
use las_speller::{DecodeOptions, Speller, SpellerOutput};

/// Listen-Attend-Spell: `encoder_outputs = listener(inputs)`, затем decode.
pub struct ListenAttendSpell<L: Listener> {
    listener: L,
    speller: Speller,
}

impl<L: Listener> ListenAttendSpell<L> {
    pub fn new(listener: L, speller: Speller) -> Self {
        info!(
            "LAS: speller {} / {}, vocab={}",
            speller.rnn_kind(),
            speller.attention_kind(),
            speller.num_classes()
        );
        Self { listener, speller }
    }

    /// Полный проход: энкодер, затем decode с заданными параметрами.
    ///
    /// * `inputs`: признаки `[batch, frames, feature_dim]`.
    /// * `input_lengths`: реальные длины последовательностей.
    pub fn forward<R: Rng + ?Sized>(
        &self,
        inputs: &Tensor,
        input_lengths: &[usize],
        options: DecodeOptions<'_>,
        rng: &mut R,
    ) -> LasResult<SpellerOutput> {
        let batch_size = inputs.dim(0)?;
        if input_lengths.len() != batch_size {
            return Err(LasError::InvalidArgument(format!(
                "input_lengths: {} значений для батча {}",
                input_lengths.len(),
                batch_size
            )));
        }

        let encoder_outputs = self.listener.encode(inputs, input_lengths)?;
        debug!("LAS: encoder_outputs {:?}", encoder_outputs.dims());

        self.speller.decode(&encoder_outputs, options, rng)
    }

    /// Greedy-распознавание батча.
    ///
    /// Возвращает токены каждой строки до первого EOS (не включая его).
    /// Декодирование всегда идёт `max_length` шагов, EOS отрезается уже после.
    pub fn recognize<R: Rng + ?Sized>(
        &self,
        inputs: &Tensor,
        input_lengths: &[usize],
        rng: &mut R,
    ) -> LasResult<Vec<Vec<u32>>> {
        let start = Instant::now();
        let output = self.forward(inputs, input_lengths, DecodeOptions::inference(), rng)?;
        let eos_id = self.speller.config().eos_id;

        let rows: Vec<Vec<u32>> = output.predicted_tokens()?.to_vec2()?;
        let tokens: Vec<Vec<u32>> = rows
            .into_iter()
            .map(|row| row.into_iter().take_while(|&t| t != eos_id).collect())
            .collect();

        debug!(
            "LAS: распознано {} последовательностей за {:.3}с",
            tokens.len(),
            start.elapsed().as_secs_f64()
        );
        Ok(tokens)
    }

    /// Распознать один WAV-файл.
    ///
    /// Частота файла должна совпадать с `sample_rate` экстрактора.
    pub fn recognize_wav<R: Rng + ?Sized>(
        &self,
        path: impl AsRef<Path>,
        extractor: &dyn FeatureExtractor,
        sample_rate: usize,
        device: &Device,
        rng: &mut R,
    ) -> LasResult<Vec<u32>> {
        let path = path.as_ref();
        info!("LAS: распознавание {:?}", path);

        let features = audio::features_from_wav(path, extractor, sample_rate, device)?;
        let num_frames = features.dim(0)?;
        let inputs = features.unsqueeze(0)?;

        let mut tokens = self.recognize(&inputs, &[num_frames], rng)?;
        tokens
            .pop()
            .ok_or_else(|| LasError::Model("пустой результат декодирования".into()))
    }

    /// Заменить speller.
    pub fn set_speller(&mut self, speller: Speller) {
        debug!("LAS: замена speller ({})", speller.attention_kind());
        self.speller = speller;
    }

    pub fn speller(&self) -> &Speller {
        &self.speller
    }

    pub fn listener(&self) -> &L {
        &self.listener
    }
}
