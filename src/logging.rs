use std::env;

use tracing_subscriber::EnvFilter;

/// Accept the level names operators already use in `LOGLEVEL`.
fn level_directive(raw: &str) -> String {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" => "info".to_string(),
        "warning" => "warn".to_string(),
        "critical" | "fatal" => "error".to_string(),
        other => other.to_string(),
    }
}

pub fn init(verbose: bool) {
    let configured = env::var("SNAPTA_LOG").or_else(|_| env::var("LOGLEVEL")).ok();
    let directive = match configured {
        Some(raw) => level_directive(&raw),
        None if verbose => "debug".to_string(),
        None => "info".to_string(),
    };
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_python_style_level_names() {
        assert_eq!(level_directive("WARNING"), "warn");
        assert_eq!(level_directive("Critical"), "error");
        assert_eq!(level_directive(""), "info");
        assert_eq!(level_directive("snapta=debug"), "snapta=debug");
    }
}
