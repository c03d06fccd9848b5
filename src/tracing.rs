use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// - Create a formatting subscriber for outputting logs to stderr
/// - Filter using the `RUST_LOG` env variable when it is set
/// - Otherwise filter using the `verbose` argument:
///     - 0: warn
///     - 1: info
///     - 2: debug
///     - 3: trace
pub fn init(verbose: u8) {
    let env_filter = EnvFilter::try_from_default_env().ok();

    let env_filter = env_filter.unwrap_or(match verbose {
        0 => EnvFilter::new("warn"),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    });
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(env_filter);

    tracing_subscriber::registry().with(fmt_layer).init();
}
