mod broker;
mod config;
mod events;
mod heartbeat;
mod logging;
mod shutdown;
mod transport;
mod utils;
mod wire;

use std::process;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use broker::Broker;
use config::AppConfig;
use events::{EventEmitter, EVENT_HEARTBEAT_TICK};
use heartbeat::{Heartbeat, HeartbeatConfig};
use logging::{LogLevel, Logger};
use shutdown::ShutdownSignal;
use utils::runtime::ensure_posix_or_exit;
use utils::startup_banner::print_startup_banner;

fn main() {
    ensure_posix_or_exit();
    print_startup_banner();

    let app_config = load_config_or_exit();
    let logger = Arc::new(Logger::from_app_config(&app_config).unwrap_or_else(|| {
        eprintln!(
            "invalid logging.level '{}'. Allowed values: error, warn, info, debug, trace",
            app_config.logging.level
        );
        process::exit(2);
    }));

    let mut broker = Broker::bind(&app_config).unwrap_or_else(|error| {
        eprintln!("broker startup error: {error}");
        process::exit(2);
    });
    let frontend_addr = broker.local_frontend_addr().unwrap_or_else(|error| {
        eprintln!("broker startup error: failed to read frontend address: {error}");
        process::exit(2);
    });
    let backend_addr = broker.local_backend_addr().unwrap_or_else(|error| {
        eprintln!("broker startup error: failed to read backend address: {error}");
        process::exit(2);
    });
    logger.log(
        LogLevel::Info,
        Some("main::broker"),
        &format!(
            "{} v{} bound broker endpoints",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ),
        Some(json!({
            "frontend": frontend_addr.to_string(),
            "backend": backend_addr.to_string(),
            "max_envelope_size_bytes": app_config.wire.max_envelope_size_bytes,
            "poll_interval_ms": app_config.broker.poll_interval_ms
        })),
    );

    let emitter = Arc::new(EventEmitter::new());
    let stats = broker.stats_handle();
    broker.set_emitter(Arc::clone(&emitter));

    {
        let tick_logger = Arc::clone(&logger);
        emitter.on_async(EVENT_HEARTBEAT_TICK, move |event| {
            tick_logger.log(
                LogLevel::Debug,
                Some("main::heartbeat"),
                "heartbeat",
                event.payload,
            );
            Ok(())
        });
    }

    let mut heartbeat = Heartbeat::new(
        Arc::clone(&emitter),
        HeartbeatConfig::from(&app_config.heartbeat),
    )
    .unwrap_or_else(|error| {
        eprintln!("heartbeat configuration error: {error}");
        process::exit(2);
    });
    {
        let stats = stats.clone();
        heartbeat.set_stats_provider(move || stats.as_payload());
    }
    logger.log(
        LogLevel::Info,
        Some("main::heartbeat"),
        "Heartbeat initialized",
        Some(heartbeat.initial_metadata_payload()),
    );
    heartbeat.start().unwrap_or_else(|error| {
        eprintln!("heartbeat startup error: {error}");
        process::exit(2);
    });

    let shutdown = ShutdownSignal::install().unwrap_or_else(|error| {
        eprintln!("failed to install shutdown signal handlers: {error}");
        process::exit(2);
    });
    logger.info(
        Some("main::shutdown"),
        "Shutdown signal handlers installed for SIGINT/SIGTERM",
    );

    broker.run(&logger, &shutdown);

    if let Err(error) = heartbeat.stop() {
        logger.warn(Some("main"), &format!("heartbeat stop failed: {error}"));
    }
    emitter.begin_shutdown();
    if !emitter.wait_for_idle(Duration::from_secs(3)) {
        logger.warn(
            Some("main"),
            "async event listeners did not drain before the deadline",
        );
    }
    logger.log(
        LogLevel::Info,
        Some("main"),
        "waitline stopped",
        Some(stats.as_payload()),
    );
}

fn load_config_or_exit() -> AppConfig {
    let args: Vec<String> = std::env::args().skip(1).collect();
    AppConfig::load_with_discovery(args).unwrap_or_else(|error| {
        eprintln!("configuration error: {error}");
        process::exit(2);
    })
}
