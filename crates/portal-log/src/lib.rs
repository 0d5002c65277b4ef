// ABOUTME: Shared logging setup for portal binaries
// ABOUTME: init_for() logs the named crates at a chosen level and everything else at WARN

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Crate-focused logging to stderr: `level` for the named crates, WARN for
/// everything else. RUST_LOG directives still apply.
///
/// Used by the probe so `portal_rpc` retry and pool events show up without
/// the noise of TLS and runtime internals.
pub fn init_for(crates: &[&str], level: Level) {
    tracing_subscriber::fmt()
        .with_env_filter(crate_filter(crates, level))
        .with_target(false)
        .init();
}

fn crate_filter(crates: &[&str], level: Level) -> EnvFilter {
    let level = level.as_str().to_ascii_lowercase();
    let mut filter = EnvFilter::from_default_env().add_directive(Level::WARN.into());
    for name in crates {
        match format!("{name}={level}").parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(_) => eprintln!("Warning: ignoring invalid log target '{name}'"),
        }
    }
    filter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_filter_names_each_crate() {
        let filter = crate_filter(&["portal_rpc", "portal_probe"], Level::DEBUG)
            .to_string()
            .to_ascii_lowercase();
        assert!(filter.contains("portal_rpc=debug"));
        assert!(filter.contains("portal_probe=debug"));
        assert!(filter.contains("warn"));
    }
}
