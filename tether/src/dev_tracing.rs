/// Development helper: install a tracing subscriber when `RUST_LOG` is
/// set.
///
/// Tests, demo workers, and examples call
/// `tether::dev_tracing::init_tracing()` to get structured logs while
/// debugging. A no-op when `RUST_LOG` is unset or a global subscriber
/// is already installed. Worker processes log to stderr; stdout belongs
/// to the control channel.
pub fn init_tracing() {
    use std::env;

    if env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .try_init();
    }
}
