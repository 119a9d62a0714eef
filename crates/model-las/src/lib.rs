//! Listen-Attend-Spell: связка энкодера ("Listener") и attention-декодера
//! ("Speller") на Candle.
//!
//! Энкодер подключается через трейт [`las_core::Listener`].

pub mod model;

pub use las_speller::{DecodeOptions, Speller, SpellerOutput};
pub use model::ListenAttendSpell;
