use sm_core::config::{GeneralConfig, LogFormat};
use tracing_subscriber::{fmt, EnvFilter};

/// Filter from `RUST_LOG` when set, otherwise from `default_level`
/// (e.g. "info", "debug", "sm_engine=debug,warn").
///
/// An unparseable `default_level` falls back to `info`.
pub fn build_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install a human-readable subscriber.
///
/// Returns `false` when a global subscriber was already installed; the call
/// is then a no-op, so tests may call it freely.
pub fn init_logging(service_name: &str, default_level: &str) -> bool {
    let installed = fmt()
        .with_env_filter(build_filter(default_level))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(service = service_name, "logging initialised (human-readable)");
    }
    installed
}

/// Install a JSON subscriber, one object per line. Span fields (`run_id`,
/// `record_id`, `node_path`) are flattened into each event.
pub fn init_logging_json(service_name: &str, default_level: &str) -> bool {
    let installed = fmt()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_env_filter(build_filter(default_level))
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(service = service_name, "logging initialised (json)");
    }
    installed
}

/// Install the subscriber described by `[general]`.
pub fn init_from_config(general: &GeneralConfig) -> bool {
    match general.log_format {
        LogFormat::Human => init_logging(&general.project_name, &general.log_level),
        LogFormat::Json => init_logging_json(&general.project_name, &general.log_level),
    }
}
