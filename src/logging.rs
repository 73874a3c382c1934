use tracing_subscriber::{EnvFilter, FmtSubscriber};

pub(crate) const LOG_ENV: &str = "HIVEWATCH_LOG";

/// `HIVEWATCH_LOG` wins over `RUST_LOG`; both take `EnvFilter` directives.
pub(crate) fn filter_directives(hivewatch_log: Option<String>, rust_log: Option<String>) -> String {
    hivewatch_log
        .or(rust_log)
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| "info".to_string())
}

pub(crate) fn init() {
    let directives = filter_directives(std::env::var(LOG_ENV).ok(), std::env::var("RUST_LOG").ok());
    let filter = EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
}

#[cfg(test)]
mod tests {
    use super::filter_directives;

    #[test]
    fn hivewatch_log_takes_precedence() {
        assert_eq!(
            filter_directives(Some("debug".into()), Some("warn".into())),
            "debug"
        );
        assert_eq!(filter_directives(None, Some("warn".into())), "warn");
        assert_eq!(filter_directives(Some("  ".into()), None), "info");
        assert_eq!(filter_directives(None, None), "info");
    }
}
