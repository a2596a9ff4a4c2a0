//! Tracing subscriber setup for binaries and tool hosts embedding the client.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Filter directives for a given `RDP_LOG` value.
pub fn filter_directives(level: Option<&str>) -> String {
    let level = match level {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!("rdp_client={level}")
}

/// Install a global subscriber writing to stderr.
///
/// `RUST_LOG` wins if set; otherwise `RDP_LOG` picks the level.
/// `LOG_FORMAT=json` switches to JSON lines. Does nothing if a subscriber
/// is already installed.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(filter_directives(std::env::var("RDP_LOG").ok().as_deref()))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_mapping() {
        assert_eq!(filter_directives(None), "rdp_client=info");
        assert_eq!(filter_directives(Some("debug")), "rdp_client=debug");
        assert_eq!(filter_directives(Some("warning")), "rdp_client=warn");
        assert_eq!(filter_directives(Some("bogus")), "rdp_client=info");
    }

    #[test]
    fn codec_follows_base_level() {
        let directives = filter_directives(Some("trace"));
        assert!(!directives.contains("codec"), "codec pinned in {directives}");
        assert_eq!(directives, "rdp_client=trace");
    }

    #[test]
    fn directives_parse() {
        for level in [None, Some("trace"), Some("error")] {
            assert!(EnvFilter::try_new(filter_directives(level)).is_ok());
        }
    }

    #[test]
    fn init_is_idempotent() {
        init_tracing();
        init_tracing();
    }
}
