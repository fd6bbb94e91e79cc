//! Text-format metrics derived from HAProxy's live stats.
//!
//! The catalogue is static: each component (frontend, backend, server)
//! declares the stat columns it exposes, with modifiers for the columns
//! HAProxy reports in its own units. Rendering is a point-in-time mapping
//! of whatever the stats socket reports; nothing is accumulated here.

use crate::stats::{StatRow, TYPE_BACKEND, TYPE_FRONTEND, TYPE_SERVER};
use std::fmt::Write as _;

pub enum MetricKind {
    Gauge,
    Counter,
}

impl MetricKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Gauge => "gauge",
            Self::Counter => "counter",
        }
    }
}

pub enum Modifier {
    /// HAProxy reports milliseconds; expose seconds.
    MillisToSeconds,
    /// Map a status cell onto 1 (UP) or 0 (anything else).
    StatusUp,
}

pub struct MetricDef {
    pub name: &'static str,
    pub help: &'static str,
    pub kind: MetricKind,
    pub column: &'static str,
    pub modifier: Option<Modifier>,
}

pub struct ComponentGroup {
    pub component: &'static str,
    pub type_code: &'static str,
    /// Stat columns copied through as labels.
    pub labels: &'static [&'static str],
    pub metrics: &'static [MetricDef],
}

macro_rules! metric {
    ($name:literal, $help:literal, $kind:ident, $column:literal) => {
        MetricDef { name: $name, help: $help, kind: MetricKind::$kind, column: $column, modifier: None }
    };
    ($name:literal, $help:literal, $kind:ident, $column:literal, $modifier:ident) => {
        MetricDef {
            name: $name,
            help: $help,
            kind: MetricKind::$kind,
            column: $column,
            modifier: Some(Modifier::$modifier),
        }
    };
}

pub const CATALOGUE: &[ComponentGroup] = &[
    ComponentGroup {
        component: "frontend",
        type_code: TYPE_FRONTEND,
        labels: &["pxname"],
        metrics: &[
            metric!("current_sessions", "Current number of sessions", Gauge, "scur"),
            metric!("total_sessions", "Cumulative number of sessions", Counter, "stot"),
            metric!("bytes_in", "Current total of incoming bytes", Counter, "bin"),
            metric!("bytes_out", "Current total of outgoing bytes", Counter, "bout"),
            metric!("denied_requests", "Requests denied because of security concerns", Counter, "dreq"),
            metric!("request_errors", "Cumulative number of request errors", Counter, "ereq"),
            metric!("session_rate", "Number of sessions per second over the last second", Gauge, "rate"),
        ],
    },
    ComponentGroup {
        component: "backend",
        type_code: TYPE_BACKEND,
        labels: &["pxname"],
        metrics: &[
            metric!("queued_requests", "Current number of queued requests", Gauge, "qcur"),
            metric!("current_sessions", "Current number of sessions", Gauge, "scur"),
            metric!("total_sessions", "Cumulative number of sessions", Counter, "stot"),
            metric!("bytes_in", "Current total of incoming bytes", Counter, "bin"),
            metric!("bytes_out", "Current total of outgoing bytes", Counter, "bout"),
            metric!("connection_errors", "Number of requests that encountered an error", Counter, "econ"),
            metric!("response_errors", "Number of response errors", Counter, "eresp"),
            metric!("retry_warnings", "Number of times a connection was retried", Counter, "wretr"),
            metric!("redispatch_warnings", "Number of times a request was redispatched", Counter, "wredis"),
            metric!("up", "Whether the backend is up", Gauge, "status", StatusUp),
        ],
    },
    ComponentGroup {
        component: "server",
        type_code: TYPE_SERVER,
        labels: &["pxname", "svname"],
        metrics: &[
            metric!("queued_requests", "Current number of queued requests", Gauge, "qcur"),
            metric!("current_sessions", "Current number of sessions", Gauge, "scur"),
            metric!("total_sessions", "Cumulative number of sessions", Counter, "stot"),
            metric!("connection_errors", "Number of requests that encountered an error", Counter, "econ"),
            metric!("response_errors", "Number of response errors", Counter, "eresp"),
            metric!("up", "Whether the server is up", Gauge, "status", StatusUp),
            metric!(
                "check_duration_seconds",
                "Time to finish the last health check",
                Gauge,
                "check_duration",
                MillisToSeconds
            ),
        ],
    },
];

/// Render the full exposition for one stats snapshot.
pub fn render(rows: &[StatRow], inst_id: &str) -> String {
    let mut out = String::new();
    for group in CATALOGUE {
        for metric in group.metrics {
            let name = format!("loadbalancer_{}_{}", group.component, metric.name);
            let _ = writeln!(out, "# HELP {name} {}", metric.help);
            let _ = writeln!(out, "# TYPE {name} {}", metric.kind.as_str());
            for row in rows.iter().filter(|row| row.type_code() == group.type_code) {
                let Some(raw) = row.get(metric.column) else { continue };
                if raw.is_empty() {
                    continue;
                }
                let Some(value) = apply_modifier(metric.modifier.as_ref(), raw) else { continue };
                let Some(labels) = build_labels(group, row, inst_id) else { continue };
                let _ = writeln!(out, "{name}{{{labels}}} {value}");
            }
        }
    }
    out
}

fn apply_modifier(modifier: Option<&Modifier>, raw: &str) -> Option<String> {
    match modifier {
        None => Some(raw.to_string()),
        Some(Modifier::MillisToSeconds) => {
            raw.parse::<f64>().ok().map(|millis| (millis / 1000.0).to_string())
        }
        Some(Modifier::StatusUp) => {
            Some(if raw.starts_with("UP") { "1" } else { "0" }.to_string())
        }
    }
}

/// Label values must not contain a double quote; a row carrying one is
/// dropped from the sample set.
fn build_labels(group: &ComponentGroup, row: &StatRow, inst_id: &str) -> Option<String> {
    let mut parts = Vec::with_capacity(group.labels.len() + 2);
    for column in group.labels {
        let value = row.get(column).unwrap_or("");
        if value.contains('"') {
            return None;
        }
        parts.push(format!("{column}=\"{value}\""));
    }
    if inst_id.contains('"') {
        return None;
    }
    parts.push(format!("component=\"{}\"", group.component));
    parts.push(format!("inst_id=\"{inst_id}\""));
    Some(parts.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::parse_stats;

    const REPLY: &str = "\
# pxname,svname,qcur,scur,stot,bin,bout,dreq,ereq,rate,econ,eresp,wretr,wredis,status,check_duration,type,\n\
https,FRONTEND,,4,100,5000,9000,1,2,7,,,,,OPEN,,0,\n\
secure_api,BACKEND,0,3,90,4000,8000,,,,1,2,3,4,UP,,1,\n\
secure_api,6f2c0a:80,0,2,50,,,,,,0,0,0,0,UP,12,2,\n\
secure_api,9b1d44:80,0,1,40,,,,,,0,0,0,0,MAINT,8,2,\n";

    #[test]
    fn renders_frontend_backend_and_server_samples() {
        let rows = parse_stats(REPLY.as_bytes()).expect("reply parses");
        let text = render(&rows, "lb01");

        assert!(text.contains("# HELP loadbalancer_frontend_current_sessions Current number of sessions\n"));
        assert!(text.contains("# TYPE loadbalancer_frontend_current_sessions gauge\n"));
        assert!(text.contains(
            "loadbalancer_frontend_current_sessions{pxname=\"https\",component=\"frontend\",inst_id=\"lb01\"} 4\n"
        ));
        assert!(text.contains(
            "loadbalancer_backend_up{pxname=\"secure_api\",component=\"backend\",inst_id=\"lb01\"} 1\n"
        ));
        assert!(text.contains(
            "loadbalancer_server_up{pxname=\"secure_api\",svname=\"6f2c0a:80\",component=\"server\",inst_id=\"lb01\"} 1\n"
        ));
        assert!(text.contains(
            "loadbalancer_server_up{pxname=\"secure_api\",svname=\"9b1d44:80\",component=\"server\",inst_id=\"lb01\"} 0\n"
        ));
    }

    #[test]
    fn milliseconds_convert_to_seconds() {
        let rows = parse_stats(REPLY.as_bytes()).expect("reply parses");
        let text = render(&rows, "lb01");
        assert!(text.contains(
            "loadbalancer_server_check_duration_seconds{pxname=\"secure_api\",svname=\"6f2c0a:80\",component=\"server\",inst_id=\"lb01\"} 0.012\n"
        ));
    }

    #[test]
    fn empty_cells_are_skipped() {
        let rows = parse_stats(REPLY.as_bytes()).expect("reply parses");
        let text = render(&rows, "lb01");
        // The frontend row has no qcur/econ cells and the server rows have
        // no bytes cells; neither may produce samples.
        assert!(!text.contains("loadbalancer_server_bytes_in"));
        for line in text.lines().filter(|l| !l.starts_with('#')) {
            assert!(!line.ends_with("} "), "sample with an empty value: {line}");
        }
    }

    #[test]
    fn quoted_label_values_drop_the_row() {
        let reply = "# pxname,svname,scur,status,type,\nweird\"pool,FRONTEND,4,OPEN,0,\n";
        let rows = parse_stats(reply.as_bytes()).expect("reply parses");
        let text = render(&rows, "lb01");
        assert!(!text.contains("weird"));
    }

    #[test]
    fn rows_of_other_components_are_filtered() {
        let rows = parse_stats(REPLY.as_bytes()).expect("reply parses");
        let text = render(&rows, "lb01");
        // The backend summary row must not leak into server metrics.
        assert!(!text.contains("svname=\"BACKEND\""));
    }
}
