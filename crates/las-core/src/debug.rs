//! Вспомогательные функции для отладочного вывода.

use std::sync::OnceLock;

/// Возвращает `true`, если включен подробный отладочный вывод.
///
/// Управляется переменной окружения `LAS_DEBUG` (любое непустое значение).
/// Включает пошаговое логирование top-токенов в free-running декодировании.
pub fn enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| {
        std::env::var_os("LAS_DEBUG").is_some_and(|v| !v.is_empty())
    })
}
