//! Logging setup
//!
//! One subscriber for the whole process. The configured level applies to
//! this workspace's crates only; everything else (notably libusb via rusb)
//! stays at `warn` so URB tracing at `trace` does not drown in foreign
//! chatter. Setting `RUST_LOG` replaces the whole filter.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Targets that follow the configured level: the workspace crates and the
/// `usbip-share` binary
const WORKSPACE_TARGETS: [&str; 4] = ["protocol", "common", "server", "usbip_share"];

fn default_filter(level: &str) -> String {
    let mut spec = String::from("warn");
    for target in WORKSPACE_TARGETS {
        spec.push_str(&format!(",{target}={level}"));
    }
    spec
}

/// Setup the tracing subscriber for the application
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter(default_level)))
        .map_err(|e| crate::Error::LogFilter {
            filter: default_filter(default_level),
            reason: e.to_string(),
        })?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_scopes_level_to_workspace() {
        let spec = default_filter("debug");
        assert!(spec.starts_with("warn,"));
        assert!(spec.contains("server=debug"));
        assert!(spec.contains("protocol=debug"));
        assert!(spec.contains("usbip_share=debug"));
        // rusb inherits the warn base, not the configured level
        assert!(!spec.contains("rusb="));
    }

    #[test]
    fn test_bad_level_surfaces_the_filter() {
        // EnvFilter rejects directives like "server=loud"; exercise the
        // error path without installing a subscriber.
        let spec = default_filter("loud");
        let err = EnvFilter::try_new(&spec).map(|_| ()).unwrap_err();
        let wrapped = crate::Error::LogFilter {
            filter: spec,
            reason: err.to_string(),
        };
        assert!(wrapped.to_string().contains("server=loud"));
    }
}
