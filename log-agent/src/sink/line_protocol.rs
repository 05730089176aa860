//! InfluxDB line protocol encoding for access log records.
//!
//! `nginx_log,method=GET,path=/foo,scheme=http,status=200 upstreamTime=1.005,requestTime=1.854,bytesSent=2133i 1614865792`

use super::Precision;
use crate::record::Record;
use std::fmt::Write;

pub const MEASUREMENT: &str = "nginx_log";

/// Encode `records` as newline-separated points.
pub fn encode_batch(records: &[Record], precision: Precision) -> String {
    let mut body = String::with_capacity(records.len() * 128);
    for record in records {
        encode_point(&mut body, record, precision);
        body.push('\n');
    }
    body
}

pub fn encode_point(out: &mut String, record: &Record, precision: Precision) {
    escape_into(out, MEASUREMENT, &[',', ' ']);

    // Tag keys in lexical order; empty tag values are not representable.
    for (key, value) in [
        ("method", record.method.as_str()),
        ("path", record.path.as_str()),
        ("scheme", record.scheme.as_str()),
        ("status", record.status.as_str()),
    ] {
        if value.is_empty() {
            continue;
        }
        out.push(',');
        out.push_str(key);
        out.push('=');
        escape_into(out, value, &[',', '=', ' ']);
    }

    out.push(' ');
    if let Some(upstream) = record.upstream_time {
        let _ = write!(out, "upstreamTime={upstream},");
    }
    let _ = write!(
        out,
        "requestTime={},bytesSent={}i {}",
        record.request_time,
        record.bytes_sent,
        timestamp(record, precision)
    );
}

fn timestamp(record: &Record, precision: Precision) -> i64 {
    let ts = &record.timestamp;
    match precision {
        Precision::Nanoseconds => ts
            .timestamp_nanos_opt()
            .unwrap_or_else(|| ts.timestamp_micros().saturating_mul(1_000)),
        Precision::Microseconds => ts.timestamp_micros(),
        Precision::Milliseconds => ts.timestamp_millis(),
        Precision::Seconds => ts.timestamp(),
        Precision::Minutes => ts.timestamp().div_euclid(60),
        Precision::Hours => ts.timestamp().div_euclid(3_600),
    }
}

/// Backslashes pass through untouched; InfluxDB 1.x only treats them as escapes before a
/// special character.
fn escape_into(out: &mut String, value: &str, special: &[char]) {
    for ch in value.chars() {
        if special.contains(&ch) {
            out.push('\\');
        }
        out.push(ch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::Tz;

    fn record() -> Record {
        Record {
            timestamp: Tz::UTC.with_ymd_and_hms(2021, 3, 4, 13, 49, 52).unwrap(),
            bytes_sent: 2133,
            path: "/foo".to_string(),
            method: "GET".to_string(),
            scheme: "http".to_string(),
            status: "200".to_string(),
            upstream_time: Some(1.005),
            request_time: 1.854,
        }
    }

    #[test]
    fn encodes_tags_fields_and_timestamp() {
        let mut line = String::new();
        encode_point(&mut line, &record(), Precision::Seconds);
        assert_eq!(
            line,
            "nginx_log,method=GET,path=/foo,scheme=http,status=200 \
             upstreamTime=1.005,requestTime=1.854,bytesSent=2133i 1614865792"
        );
    }

    #[test]
    fn omits_absent_upstream_time() {
        let mut record = record();
        record.upstream_time = None;
        let mut line = String::new();
        encode_point(&mut line, &record, Precision::Milliseconds);
        assert!(line.ends_with(" requestTime=1.854,bytesSent=2133i 1614865792000"));
        assert!(!line.contains("upstreamTime"));
    }

    #[test]
    fn escapes_tag_values() {
        let mut record = record();
        record.path = "/a b,c=d".to_string();
        let mut line = String::new();
        encode_point(&mut line, &record, Precision::Seconds);
        assert!(line.contains(r"path=/a\ b\,c\=d,"));
    }

    #[test]
    fn backslashes_are_written_verbatim() {
        let mut record = record();
        record.path = r"/dir\file".to_string();
        let mut line = String::new();
        encode_point(&mut line, &record, Precision::Seconds);
        assert!(line.contains(r"path=/dir\file,scheme="));
    }

    #[test]
    fn batch_is_newline_separated() {
        let body = encode_batch(&[record(), record()], Precision::Hours);
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" 448573"));
    }
}
