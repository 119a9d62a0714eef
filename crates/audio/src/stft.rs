//! Оконное кратковременное преобразование Фурье (rustfft).

use std::f32::consts::PI;
use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};

/// Оконная функция (периодическая, как `torch.*_window`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    Hann,
    Hamming,
}

impl WindowKind {
    /// Значения окна длины `length`.
    pub fn build(self, length: usize) -> Vec<f32> {
        let (a0, a1) = match self {
            WindowKind::Hann => (0.5, 0.5),
            WindowKind::Hamming => (0.54, 0.46),
        };
        (0..length)
            .map(|n| a0 - a1 * (2.0 * PI * n as f32 / length as f32).cos())
            .collect()
    }
}

/// STFT с фиксированным окном и шагом.
pub struct Stft {
    n_fft: usize,
    hop_length: usize,
    window: Vec<f32>,
    /// center=True: отражённый паддинг на n_fft/2 с каждой стороны.
    center: bool,
    fft: Arc<dyn Fft<f32>>,
}

impl std::fmt::Debug for Stft {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stft")
            .field("n_fft", &self.n_fft)
            .field("hop_length", &self.hop_length)
            .field("center", &self.center)
            .finish()
    }
}

impl Stft {
    pub fn new(n_fft: usize, hop_length: usize, window: WindowKind, center: bool) -> Self {
        let mut planner = FftPlanner::<f32>::new();
        Self {
            n_fft,
            hop_length,
            window: window.build(n_fft),
            center,
            fft: planner.plan_fft_forward(n_fft),
        }
    }

    /// Количество частотных бинов (только положительные частоты).
    pub fn n_freqs(&self) -> usize {
        self.n_fft / 2 + 1
    }

    /// Количество фреймов для сигнала длины `len`.
    pub fn num_frames(&self, len: usize) -> usize {
        if self.center {
            if len == 0 {
                0
            } else {
                len / self.hop_length + 1
            }
        } else if len < self.n_fft {
            0
        } else {
            (len - self.n_fft) / self.hop_length + 1
        }
    }

    /// Спектр мощности |X|^2: [frames][n_fft/2 + 1].
    pub fn power(&self, samples: &[f32]) -> Vec<Vec<f32>> {
        self.frames(samples, |c| c.re * c.re + c.im * c.im)
    }

    /// Амплитудный спектр |X|: [frames][n_fft/2 + 1].
    pub fn magnitude(&self, samples: &[f32]) -> Vec<Vec<f32>> {
        self.frames(samples, |c| (c.re * c.re + c.im * c.im).sqrt())
    }

    fn frames(&self, samples: &[f32], bin: impl Fn(&Complex<f32>) -> f32) -> Vec<Vec<f32>> {
        let num_frames = self.num_frames(samples.len());
        let n = samples.len() as isize;
        let pad = if self.center { (self.n_fft / 2) as isize } else { 0 };

        let mut spectrogram = Vec::with_capacity(num_frames);
        for frame_idx in 0..num_frames {
            let start = frame_idx as isize * self.hop_length as isize - pad;

            let mut buffer: Vec<Complex<f32>> = (0..self.n_fft)
                .map(|i| {
                    let mut idx = start + i as isize;
                    // pad_mode="reflect"
                    if idx < 0 {
                        idx = -idx;
                    }
                    if idx >= n {
                        idx = 2 * n - idx - 2;
                    }
                    let sample = if (0..n).contains(&idx) {
                        samples[idx as usize] * self.window[i]
                    } else {
                        0.0
                    };
                    Complex::new(sample, 0.0)
                })
                .collect();

            self.fft.process(&mut buffer);
            spectrogram.push(buffer.iter().take(self.n_freqs()).map(&bin).collect());
        }

        spectrogram
    }
}
