/// Development helper: initialize tracing subscriber when `RUST_LOG` is set.
///
/// Tests and benches can call `longeron::dev_tracing::init_tracing()` to see
/// the `[Session]`, `[Acceptor]` and `[HANDSHAKE]` logs. This is a no-op
/// when `RUST_LOG` is not set or a global subscriber is already installed.
pub fn init_tracing() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_target(false)
            .try_init();
    }
}
