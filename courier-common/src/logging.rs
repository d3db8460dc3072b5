use std::{str::FromStr, sync::OnceLock};

use tracing::metadata::LevelFilter;
use tracing_subscriber::{
    Layer, Registry, filter::FilterFn, prelude::__tracing_subscriber_SubscriberExt, reload,
    util::SubscriberInitExt,
};

#[macro_export]
macro_rules! log {
    ($level:expr, $span:expr, $($msg:expr),*) => {{
        let span = $crate::tracing::span!($level, $span);
        let _enter = span.enter();

        $crate::tracing::event!($level, $($msg),*)
    }};
}

/// Traffic leaving this process towards a remote endpoint.
#[macro_export]
macro_rules! outgoing {
    (level = $level:ident, $($msg:expr),*) => {
        $crate::log!($crate::tracing::Level::$level, "outgoing", $($msg),*)
    };

    ($($msg:expr),*) => {
        $crate::outgoing!(level = TRACE, $($msg),*)
    };
}

/// Traffic arriving from a remote endpoint.
#[macro_export]
macro_rules! incoming {
    (level = $level:ident, $($msg:expr),*) => {
        $crate::log!($crate::tracing::Level::$level, "incoming", $($msg),*)
    };

    ($($msg:expr),*) => {
        $crate::incoming!(level = TRACE, $($msg),*)
    };
}

/// Lifecycle events internal to the engine.
#[macro_export]
macro_rules! internal {
    (level = $level:ident, $($msg:expr),*) => {
        $crate::log!($crate::tracing::Level::$level, "internal", $($msg),*)
    };

    ($($msg:expr),*) => {
        $crate::internal!(level = TRACE, $($msg),*)
    };
}

static LEVEL_HANDLE: OnceLock<reload::Handle<LevelFilter, Registry>> = OnceLock::new();

const fn default_level() -> LevelFilter {
    if cfg!(debug_assertions) {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    }
}

/// Parse a textual level (`"warn"`, `"DEBUG"`, `"off"`, ...).
pub fn parse_level(level: &str) -> Option<LevelFilter> {
    LevelFilter::from_str(level.trim()).ok()
}

/// Install the global subscriber.
///
/// The level comes from `LOG_LEVEL` when set and valid, otherwise TRACE for
/// debug builds and INFO for release builds. Calling this more than once is a
/// no-op.
pub fn init() {
    if LEVEL_HANDLE.get().is_some() {
        return;
    }

    let default = default_level();
    let level = std::env::var("LOG_LEVEL").map_or(default, |level| {
        parse_level(&level).unwrap_or_else(|| {
            eprintln!("Invalid log level specified {level}, defaulting to {default}");
            default
        })
    });

    let (filter, handle) = reload::Layer::new(level);

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(false)
                .with_line_number(false)
                .compact()
                .with_ansi(true)
                .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                .with_filter(FilterFn::new(|metadata| {
                    metadata.target().starts_with("courier")
                })),
        )
        .try_init();

    match installed {
        Ok(()) => {
            let _ = LEVEL_HANDLE.set(handle);
        }
        Err(e) => eprintln!("Unable to install log subscriber: {e}"),
    }
}

/// Change the active log level at runtime.
///
/// Returns `false` when logging has not been initialised through [`init`].
pub fn set_level(level: LevelFilter) -> bool {
    LEVEL_HANDLE.get().is_some_and(|handle| {
        handle
            .modify(|current| *current = level)
            .map_err(|e| eprintln!("Unable to change log level: {e}"))
            .is_ok()
    })
}

/// The level currently in effect, if logging has been initialised.
pub fn current_level() -> Option<LevelFilter> {
    LEVEL_HANDLE.get().and_then(|handle| handle.clone_current())
}
