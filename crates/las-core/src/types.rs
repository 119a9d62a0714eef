//! Общие типы для аудио-фронтенда.

/// Буфер необработанного аудио.
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    /// Аудио-сэмплы (нормализованы к [-1.0, 1.0]).
    pub samples: Vec<f32>,

    /// Частота дискретизации в Гц.
    pub sample_rate: usize,

    /// Количество каналов.
    pub channels: usize,
}

impl AudioBuffer {
    /// Создать новый буфер аудио.
    pub fn new(samples: Vec<f32>, sample_rate: usize, channels: usize) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    /// Длительность в секундах.
    pub fn duration(&self) -> f32 {
        self.samples.len() as f32 / (self.sample_rate * self.channels) as f32
    }

    /// Количество сэмплов на канал.
    pub fn num_samples(&self) -> usize {
        self.samples.len() / self.channels
    }
}
