use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Used when `RUST_LOG` is unset. Websocket and hyper internals are noisy at info.
const DEFAULT_FILTER: &str = "info,tungstenite=warn,tokio_tungstenite=warn,hyper=warn";

/// Logfmt to stderr. Child process output is logged through here too, so
/// stdout stays free for anything piped from the launcher.
pub fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .with_target(true)
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}
