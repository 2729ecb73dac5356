//! Logging setup for the library and the `watchmux` binary.
//!
//! Every line carries the emitting component in brackets, so a whole
//! subsystem can be followed with one `grep`:
//!
//! | Tag           | Emitted by                  | Typical lines                                   |
//! |---------------|-----------------------------|-------------------------------------------------|
//! | `[watcher]`   | engine thread, service      | engine start/stop, watch installed, subtree joined, watch invalidated |
//! | `[registrar]` | notify-backed registrar     | handle registered, handle invalidated, native watcher errors |
//! | `[reaper]`    | dropped-token reaper thread | reaper started/exited, panicking cleanup job     |
//!
//! Lifecycle transitions go out at `info` through [`log_event!`], per-watch
//! detail at `debug` through [`debug_event!`]. Listener panics and native
//! watcher errors are `warn`/`error` and show up under the default `warn`.
//!
//! Filtering is by module path, e.g. `watchmux::registrar` for the
//! `[registrar]` lines:
//!
//! ```toml
//! [logging]
//! default = "warn"
//!
//! [logging.modules]
//! "watchmux::watcher" = "debug"
//! ```
//!
//! `RUST_LOG` replaces the configured filter entirely:
//! ```bash
//! RUST_LOG=watchmux::registrar=debug watchmux watch ~/src
//! ```

use std::sync::Once;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LoggingConfig;

static INIT: Once = Once::new();

/// HH:MM:SS.mmm in local time.
struct WallClock;

impl FormatTime for WallClock {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%H:%M:%S%.3f"))
    }
}

/// `EnvFilter` directives for `config`: the default level first, then one
/// `module=level` per override, sorted so the output is stable.
pub fn filter_directives(config: &LoggingConfig) -> String {
    let mut modules: Vec<_> = config.modules.iter().collect();
    modules.sort();
    let mut directives = config.default.clone();
    for (module, level) in modules {
        directives.push_str(&format!(",{module}={level}"));
    }
    directives
}

/// Install the global subscriber.
///
/// Only the first call in a process has an effect. Thread names are shown
/// so engine (`watchmux-watcher`), dispatch and reaper threads can be told
/// apart.
pub fn init_with_config(config: &LoggingConfig) {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else {
            EnvFilter::new(filter_directives(config))
        };

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_timer(WallClock)
            .with_level(true)
            .with_filter(filter);

        tracing_subscriber::registry().with(fmt_layer).init();
    });
}

/// Lifecycle event at `info`, tagged `[component]`.
///
/// ```ignore
/// log_event!("watcher", "watch invalidated", "{}", path.display());
/// log_event!("watcher", "started");
/// ```
#[macro_export]
macro_rules! log_event {
    ($component:expr, $event:expr) => {
        tracing::info!("[{}] {}", $component, $event)
    };
    ($component:expr, $event:expr, $($arg:tt)*) => {
        tracing::info!("[{}] {}: {}", $component, $event, format!($($arg)*))
    };
}

/// Per-watch detail at `debug`, tagged `[component]`.
///
/// ```ignore
/// debug_event!("registrar", "invalidated", "{}", root.display());
/// ```
#[macro_export]
macro_rules! debug_event {
    ($component:expr, $event:expr) => {
        tracing::debug!("[{}] {}", $component, $event)
    };
    ($component:expr, $event:expr, $($arg:tt)*) => {
        tracing::debug!("[{}] {}: {}", $component, $event, format!($($arg)*))
    };
}
