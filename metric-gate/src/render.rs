//! Rendering aggregated series back to text exposition format.

use std::io::Write;

use metric_gate_common::is_empty_key;

use crate::store::Series;

/// Content type of rendered metrics.
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Render a subset's series, one line per (metric name, label key) pair.
///
/// A series without an explicit timestamp gets `cycle_timestamp_ms` when
/// given, otherwise no timestamp at all. Lines are sorted by metric name and
/// label key for stable output; consumers must not rely on it.
pub fn render(series: &Series, cycle_timestamp_ms: Option<i64>) -> String {
    let mut output = Vec::with_capacity(series.len() * 64);
    render_to(series, cycle_timestamp_ms, &mut output).ok();
    String::from_utf8(output).unwrap_or_default()
}

/// Render into any writer.
pub fn render_to<W: Write>(
    series: &Series,
    cycle_timestamp_ms: Option<i64>,
    output: &mut W,
) -> std::io::Result<()> {
    let mut lines: Vec<_> = series.iter().collect();
    lines.sort_unstable_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

    for (name, key, sample) in lines {
        output.write_all(name.as_bytes())?;
        if !is_empty_key(key) {
            output.write_all(key.as_bytes())?;
        }
        write!(output, " {}", format_value(sample.value))?;
        if let Some(ts) = sample.timestamp_ms.or(cycle_timestamp_ms) {
            write!(output, " {}", ts)?;
        }
        output.write_all(b"\n")?;
    }

    Ok(())
}

/// Format a floating point value for Prometheus.
///
/// Finite values use the shortest representation that parses back to the
/// same `f64`.
fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value.is_sign_positive() {
            "+Inf".to_string()
        } else {
            "-Inf".to_string()
        }
    } else if value.fract() == 0.0 {
        format!("{:.0}", value)
    } else {
        format!("{}", value)
    }
}
