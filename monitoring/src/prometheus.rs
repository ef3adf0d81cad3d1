//! Prometheus text exposition format (text/plain; version=0.0.4).

use {
    crate::{MetricsSnapshot, SampleValue},
    std::fmt::Write,
};

pub fn encode(snap: &MetricsSnapshot) -> String {
    let mut out = String::with_capacity(2048);
    for sample in &snap.samples {
        let name = sample.name;
        let kind = match sample.value {
            SampleValue::Counter(_) => "counter",
            SampleValue::Gauge(_) => "gauge",
            SampleValue::Histogram { .. } => "histogram",
        };
        let _ = writeln!(out, "# HELP {name} {}", sample.help);
        let _ = writeln!(out, "# TYPE {name} {kind}");
        match &sample.value {
            SampleValue::Counter(v) => {
                let _ = writeln!(out, "{name} {v}");
            }
            SampleValue::Gauge(v) => {
                let _ = writeln!(out, "{name} {v}");
            }
            SampleValue::Histogram {
                buckets,
                sum,
                count,
            } => write_histogram(&mut out, name, buckets, *sum, *count),
        }
        out.push('\n');
    }
    out
}

fn write_histogram(out: &mut String, name: &str, buckets: &[(f64, u64)], sum: f64, count: u64) {
    for (bound, cumulative) in buckets.iter().filter(|(b, _)| b.is_finite()) {
        let _ = writeln!(out, "{name}_bucket{{le=\"{bound}\"}} {cumulative}");
    }
    let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
    let _ = writeln!(out, "{name}_sum {sum}");
    let _ = writeln!(out, "{name}_count {count}");
}
