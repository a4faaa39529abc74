use tracing_subscriber::EnvFilter;

use crate::display::OutputSize;

/// Install the fmt subscriber. `RUST_LOG` wins over `default_filter`.
pub fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();
}

/// Parse `WIDTHxHEIGHT`, e.g. `640x480`
pub fn parse_size(s: &str) -> Result<OutputSize, String> {
    let (width, height) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {s:?}"))?;
    let width = width
        .trim()
        .parse()
        .map_err(|e| format!("invalid width {width:?}: {e}"))?;
    let height = height
        .trim()
        .parse()
        .map_err(|e| format!("invalid height {height:?}: {e}"))?;
    Ok(OutputSize::new(width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sizes() {
        assert_eq!(parse_size("640x480"), Ok(OutputSize::new(640, 480)));
        assert_eq!(parse_size("0X0"), Ok(OutputSize::new(0, 0)));
        assert!(parse_size("640").is_err());
        assert!(parse_size("axb").is_err());
    }
}
