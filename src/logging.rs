//! Structured logging setup.
//!
//! Generalizes the teacher's fixed `LevelFilter::DEBUG` subscriber into one
//! driven by `RUST_LOG`, defaulting to `info` when unset — appropriate for a
//! long-running node rather than a framework demo.

use tracing_subscriber::{EnvFilter, fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt};

/// Initializes the global tracing subscriber. Call once, at process startup.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_span_events(FmtSpan::CLOSE)
                .with_file(true)
                .with_line_number(true)
                .with_level(true)
                .with_filter(filter),
        )
        .init();
}

/// Formats a byte count as a human-readable IEC size (`KiB`/`MiB`/`GiB`), the
/// way the original node's log lines described cache size and eviction progress.
pub fn format_bytes_iec(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_bytes() {
        assert_eq!(format_bytes_iec(512), "512 B");
        assert_eq!(format_bytes_iec(2048), "2.00 KiB");
        assert_eq!(format_bytes_iec(10 * 1024 * 1024), "10.00 MiB");
    }
}
