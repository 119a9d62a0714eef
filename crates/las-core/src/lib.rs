//! # las-core
//!
//! Базовые типы, трейты и определения ошибок для Listen-Attend-Spell.
//!
//! Этот крейт предоставляет фундаментальные абстракции для всех остальных
//! крейтов в workspace:
//!
//! - Конфигурация декодера [`SpellerConfig`] и аудио-фронтенда [`FeatureConfig`]
//! - Унифицированная обработка ошибок через [`LasError`]
//! - Контракты коллабораторов: [`Listener`], [`LanguageModel`], [`FeatureExtractor`]

pub mod config;
pub mod debug;
pub mod error;
pub mod traits;
pub mod types;

pub use config::{AttentionKind, FeatureConfig, FeatureKind, RnnKind, SpellerConfig};
pub use error::{LasError, LasResult};
pub use traits::{FeatureExtractor, LanguageModel, Listener};
pub use types::AudioBuffer;
