use sm_core::config::{GeneralConfig, LogFormat};
use sm_telemetry::logging;

// One global subscriber per test binary: whichever test runs first installs
// it, every later call must be a harmless no-op.

#[test]
fn test_repeated_init_is_a_noop() {
    logging::init_logging("test-service", "debug");
    assert!(!logging::init_logging("test-service", "info"));
    assert!(!logging::init_logging_json("test-service-json", "info"));

    tracing::info!(key = "value", "log line after init");
}

#[test]
fn test_init_from_config_json() {
    let general = GeneralConfig {
        log_format: LogFormat::Json,
        ..GeneralConfig::default()
    };
    logging::init_from_config(&general);
    assert!(!logging::init_from_config(&GeneralConfig::default()));
}

#[test]
fn test_filter_accepts_directives() {
    let filter = logging::build_filter("sm_engine=debug,warn");
    let rendered = filter.to_string();
    if std::env::var("RUST_LOG").is_err() {
        assert!(rendered.contains("sm_engine=debug"));
    }
}
