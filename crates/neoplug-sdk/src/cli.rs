//! Command-line boundary: the flags every plugin binary recognizes, and the
//! tracing subscriber setup they control.

use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Flags recognized by every plugin binary.
#[derive(Parser, Debug, Clone, Default)]
#[command(about = "A NeoPlug device plugin", long_about = None)]
pub struct Options {
    /// Raise log verbosity to debug.
    #[arg(long)]
    pub debug: bool,

    /// Print the version block and exit.
    #[arg(long)]
    pub version: bool,

    /// Run configuration, registration, and setup actions, then exit.
    #[arg(long = "dry-run")]
    pub dry_run: bool,
}

impl Options {
    /// Parse flags from the process arguments.
    pub fn from_args() -> Self {
        Self::parse()
    }
}

/// Initialize the tracing subscriber. `RUST_LOG` wins when set; otherwise
/// `--debug` selects the debug level. Safe to call more than once.
pub fn init_tracing(debug: bool) {
    let fallback = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags() {
        let options = Options::parse_from(["plugin", "--debug", "--dry-run"]);
        assert!(options.debug);
        assert!(options.dry_run);
        assert!(!options.version);
    }

    #[test]
    fn test_defaults() {
        let options = Options::parse_from(["plugin"]);
        assert!(!options.debug);
        assert!(!options.dry_run);
        assert!(!options.version);
    }
}
