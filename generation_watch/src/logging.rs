use tracing_subscriber::EnvFilter;

/// Default filter directive when `RUST_LOG` is not set.
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "generation_watch=debug"
    } else {
        "generation_watch=info"
    }
}

/// Build the env filter: `RUST_LOG` directives plus the crate default.
pub fn build_filter(verbose: bool) -> EnvFilter {
    let filter = EnvFilter::from_default_env();
    match default_directive(verbose).parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    }
}

/// Install the global fmt subscriber. Safe to call more than once.
pub fn init_logging(verbose: bool) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(build_filter(verbose))
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives() {
        assert_eq!(default_directive(false), "generation_watch=info");
        assert_eq!(default_directive(true), "generation_watch=debug");
    }

    #[test]
    fn test_init_twice_does_not_panic() {
        init_logging(false);
        init_logging(true);
    }
}
