//! Загрузка WAV-файлов.

use hound::WavReader;
use las_core::{AudioBuffer, LasError, LasResult};
use std::path::Path;
use tracing::debug;

/// Загрузить WAV-файл в [`AudioBuffer`] (сэмплы нормализованы к [-1, 1]).
pub fn load_wav(path: impl AsRef<Path>) -> LasResult<AudioBuffer> {
    let path = path.as_ref();
    let reader = WavReader::open(path)
        .map_err(|e| LasError::Audio(format!("Не удалось открыть WAV {:?}: {}", path, e)))?;

    let spec = reader.spec();
    let sample_rate = spec.sample_rate as usize;
    let channels = spec.channels as usize;

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| LasError::Audio(format!("Не удалось прочитать сэмплы: {}", e)))?,
        hound::SampleFormat::Int => {
            let bits = spec.bits_per_sample;
            let max_val = (1u32 << (bits - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_val))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| LasError::Audio(format!("Не удалось прочитать сэмплы: {}", e)))?
        }
    };

    let buffer = AudioBuffer::new(samples, sample_rate, channels);
    debug!(
        "WAV {:?}: {} Гц, {} канал(ов), {:.2}с",
        path,
        sample_rate,
        channels,
        buffer.duration()
    );
    Ok(buffer)
}

/// Свести многоканальное аудио в моно усреднением каналов.
pub fn to_mono(buffer: &AudioBuffer) -> AudioBuffer {
    if buffer.channels == 1 {
        return buffer.clone();
    }

    let mono_samples: Vec<f32> = buffer
        .samples
        .chunks(buffer.channels)
        .map(|chunk| chunk.iter().sum::<f32>() / chunk.len() as f32)
        .collect();

    AudioBuffer::new(mono_samples, buffer.sample_rate, 1)
}
