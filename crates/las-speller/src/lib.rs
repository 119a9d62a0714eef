//! Speller: attention-based авторегрессионный декодер Listen-Attend-Spell на Candle.
//!
//! По выходам энкодера `[batch, time, hidden]` шаг за шагом строит
//! распределения по словарю. Два режима: teacher forcing (обучение) и greedy
//! free-running (инференс, опционально с shallow fusion внешней LM).
//! Внимание: content-based multi-head или location-aware.

pub mod attention;
pub mod decode;
pub mod fusion;
pub mod output;
pub mod rnn;
pub mod speller;
pub mod validate;

pub use attention::{Attended, Attention, LocationAwareAttention, MultiHeadAttention};
pub use fusion::LanguageModelFuser;
pub use output::{DecodeDiagnostics, DecodeOptions, SpellerOutput, StepLayout};
pub use rnn::{RecurrentLayer, RecurrentState};
pub use speller::{Speller, StepOutput};
pub use validate::{validate_args, DecodeSession};
