use crate::error::ParseError;
use crate::record::Record;
use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, TimeZone};
use chrono_tz::Tz;
use regex::Regex;
use serde::Deserialize;
use url::Url;

/// `192.168.1.1 - - [04/Mar/2021:13:49:52 +0000] http "GET /foo?query=t HTTP/1.0" 200 2133 "-" "KeepAliveClient" "-" 1.005 1.854`
const ACCESS_LOG_PATTERN: &str = concat!(
    r#"^([0-9A-Fa-f.:]+)\s+"#,  // client address
    r#"([^ \[]+)\s+"#,          // ident
    r#"([^ \[]+)\s+"#,          // auth user
    r#"\[([^\]]+)\]\s+"#,       // timestamp
    r#"([a-z]+)\s+"#,           // scheme
    r#""([^"]+)"\s+"#,          // request line
    r#"(\d{3})\s+"#,            // status
    r#"(\d+)\s+"#,              // bytes sent
    r#""([^"]+)"\s+"#,          // referrer
    r#""(.*?)"\s+"#,            // user agent
    r#""([\d.,\s-]+)"\s+"#,     // forwarded for
    r#"([\d.-]+)\s+"#,          // upstream time
    r#"([\d.-]+)\s*$"#,         // request time
);

const TIMESTAMP_FORMAT: &str = "%d/%b/%Y:%H:%M:%S %z";
const TARGET_BASE: &str = "http://localhost/";
const ABSENT: &str = "-";

/// Which clock reading wins when a line carries its own UTC offset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampPolicy {
    /// Trust the offset in the line; the configured zone only changes presentation.
    #[default]
    Embedded,
    /// Ignore the offset and read the wall-clock time in the configured zone.
    Configured,
}

/// Parser for the combined-plus-timings access log format.
///
/// Stateless after construction, so one instance is shared by all parser workers.
#[derive(Debug, Clone)]
pub struct AccessLogParser {
    pattern: Regex,
    target_base: Url,
    zone: Tz,
    policy: TimestampPolicy,
}

impl AccessLogParser {
    pub fn new(zone: Tz, policy: TimestampPolicy) -> Result<Self> {
        let pattern =
            Regex::new(ACCESS_LOG_PATTERN).context("failed to compile access log pattern")?;
        let target_base = Url::parse(TARGET_BASE).context("failed to parse target base url")?;
        Ok(Self {
            pattern,
            target_base,
            zone,
            policy,
        })
    }

    pub fn zone(&self) -> Tz {
        self.zone
    }

    pub fn parse(&self, line: &[u8]) -> Result<Record, ParseError> {
        let line = std::str::from_utf8(line).map_err(|_| ParseError::Encoding)?;
        let caps = self.pattern.captures(line).ok_or(ParseError::NoMatch)?;
        let group = |idx: usize| caps.get(idx).map(|m| m.as_str()).unwrap_or_default();

        let timestamp = self.parse_timestamp(group(4))?;
        let (method, path) = self.parse_request_line(group(6))?;

        Ok(Record {
            timestamp,
            bytes_sent: parse_number("bytes_sent", group(8))?,
            path,
            method,
            scheme: group(5).to_string(),
            status: group(7).to_string(),
            upstream_time: parse_optional_seconds("upstream_time", group(12))?,
            request_time: parse_seconds("request_time", group(13))?,
        })
    }

    fn parse_timestamp(&self, value: &str) -> Result<DateTime<Tz>, ParseError> {
        let invalid = |reason: String| ParseError::Timestamp {
            value: value.to_string(),
            reason,
        };

        let parsed = DateTime::<FixedOffset>::parse_from_str(value, TIMESTAMP_FORMAT)
            .map_err(|err| invalid(err.to_string()))?;

        match self.policy {
            TimestampPolicy::Embedded => Ok(parsed.with_timezone(&self.zone)),
            TimestampPolicy::Configured => self
                .zone
                .from_local_datetime(&parsed.naive_local())
                .single()
                .ok_or_else(|| invalid(format!("ambiguous or skipped local time in {}", self.zone))),
        }
    }

    /// Split `METHOD TARGET PROTOCOL` and reduce the target to its path.
    fn parse_request_line(&self, value: &str) -> Result<(String, String), ParseError> {
        let tokens: Vec<&str> = value.split_whitespace().collect();
        let [method, target, _protocol] = tokens.as_slice() else {
            return Err(ParseError::RequestLine {
                value: value.to_string(),
                tokens: tokens.len(),
            });
        };

        let url = self
            .target_base
            .join(target)
            .map_err(|_| ParseError::Target {
                value: target.to_string(),
            })?;

        Ok((method.to_string(), url.path().to_string()))
    }
}

fn parse_number<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, ParseError> {
    value.parse().map_err(|_| ParseError::InvalidNumber {
        field,
        value: value.to_string(),
    })
}

/// Durations must be finite; an over-long digit run would otherwise parse as `inf`.
fn parse_seconds(field: &'static str, value: &str) -> Result<f64, ParseError> {
    let seconds: f64 = parse_number(field, value)?;
    if !seconds.is_finite() {
        return Err(ParseError::InvalidNumber {
            field,
            value: value.to_string(),
        });
    }
    Ok(seconds)
}

fn parse_optional_seconds(field: &'static str, value: &str) -> Result<Option<f64>, ParseError> {
    if value == ABSENT {
        return Ok(None);
    }
    parse_seconds(field, value).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    const SAMPLE: &str = r#"192.168.1.1 - - [04/Mar/2021:13:49:52 +0000] http "GET /foo?query=t HTTP/1.0" 200 2133 "-" "KeepAliveClient" "-" 1.005 1.854"#;

    fn parser(zone: Tz, policy: TimestampPolicy) -> AccessLogParser {
        AccessLogParser::new(zone, policy).unwrap()
    }

    #[test]
    fn parses_sample_line() {
        let record = parser(Tz::UTC, TimestampPolicy::Embedded)
            .parse(SAMPLE.as_bytes())
            .unwrap();

        assert_eq!(record.method, "GET");
        assert_eq!(record.path, "/foo");
        assert_eq!(record.scheme, "http");
        assert_eq!(record.status, "200");
        assert_eq!(record.bytes_sent, 2133);
        assert_eq!(record.upstream_time, Some(1.005));
        assert_eq!(record.request_time, 1.854);

        let ts = record.timestamp;
        assert_eq!((ts.year(), ts.month(), ts.day()), (2021, 3, 4));
        assert_eq!((ts.hour(), ts.minute(), ts.second()), (13, 49, 52));
        assert_eq!(ts.timezone(), Tz::UTC);
    }

    #[test]
    fn strips_query_from_path() {
        let parser = parser(Tz::UTC, TimestampPolicy::Embedded);
        let cases = [
            ("GET /foo?query=t HTTP/1.0", "/foo"),
            ("POST /api/v1/items HTTP/1.1", "/api/v1/items"),
            ("GET /search?q=a&b=c#frag HTTP/2.0", "/search"),
            ("GET http://example.com/abs?x=1 HTTP/1.1", "/abs"),
        ];
        for (request, expected) in cases {
            let line = SAMPLE.replace("GET /foo?query=t HTTP/1.0", request);
            let record = parser.parse(line.as_bytes()).unwrap();
            assert_eq!(record.path, expected, "{request}");
        }
    }

    #[test]
    fn embedded_offset_is_authoritative_by_default() {
        let line = SAMPLE.replace("+0000", "+0200");
        let record = parser(chrono_tz::Asia::Shanghai, TimestampPolicy::Embedded)
            .parse(line.as_bytes())
            .unwrap();

        // 13:49:52+02:00 == 11:49:52Z == 19:49:52 in Shanghai
        assert_eq!(record.timestamp.hour(), 19);
        assert_eq!(record.timestamp.timestamp(), 1_614_858_592);
    }

    #[test]
    fn configured_zone_reads_wall_clock_time() {
        let record = parser(chrono_tz::Asia::Shanghai, TimestampPolicy::Configured)
            .parse(SAMPLE.as_bytes())
            .unwrap();

        assert_eq!(record.timestamp.hour(), 13);
        assert_eq!(record.timestamp.timezone(), chrono_tz::Asia::Shanghai);
        // 13:49:52 in UTC+8 == 05:49:52Z
        assert_eq!(record.timestamp.timestamp(), 1_614_836_992);
    }

    #[test]
    fn skipped_local_time_is_rejected() {
        // Clocks in New York jumped from 02:00 to 03:00 on 14 Mar 2021.
        let line = SAMPLE.replace("04/Mar/2021:13:49:52", "14/Mar/2021:02:30:00");
        let err = parser(chrono_tz::America::New_York, TimestampPolicy::Configured)
            .parse(line.as_bytes())
            .unwrap_err();
        assert!(matches!(err, ParseError::Timestamp { .. }));
    }

    #[test]
    fn upstream_dash_means_absent() {
        let line = SAMPLE.replace("1.005 1.854", "- 0.002");
        let record = parser(Tz::UTC, TimestampPolicy::Embedded)
            .parse(line.as_bytes())
            .unwrap();
        assert_eq!(record.upstream_time, None);
        assert_eq!(record.request_time, 0.002);
    }

    #[test]
    fn request_time_dash_is_an_error() {
        let line = SAMPLE.replace("1.005 1.854", "1.005 -");
        let err = parser(Tz::UTC, TimestampPolicy::Embedded)
            .parse(line.as_bytes())
            .unwrap_err();
        assert_eq!(
            err,
            ParseError::InvalidNumber {
                field: "request_time",
                value: "-".to_string()
            }
        );
    }

    #[test]
    fn malformed_numbers_are_classified() {
        let line = SAMPLE.replace("1.005 1.854", "1.0.5 1.854");
        let err = parser(Tz::UTC, TimestampPolicy::Embedded)
            .parse(line.as_bytes())
            .unwrap_err();
        assert!(matches!(
            err,
            ParseError::InvalidNumber {
                field: "upstream_time",
                ..
            }
        ));
    }

    #[test]
    fn overflowing_durations_are_rejected() {
        let parser = parser(Tz::UTC, TimestampPolicy::Embedded);
        let huge = "9".repeat(400);

        let line = SAMPLE.replace("1.005 1.854", &format!("1.005 {huge}"));
        assert_eq!(
            parser.parse(line.as_bytes()),
            Err(ParseError::InvalidNumber {
                field: "request_time",
                value: huge.clone()
            })
        );

        let line = SAMPLE.replace("1.005 1.854", &format!("{huge} 1.854"));
        assert!(matches!(
            parser.parse(line.as_bytes()),
            Err(ParseError::InvalidNumber {
                field: "upstream_time",
                ..
            })
        ));
    }

    #[test]
    fn rejects_lines_outside_the_grammar() {
        let parser = parser(Tz::UTC, TimestampPolicy::Embedded);
        assert_eq!(parser.parse(b"not an access log"), Err(ParseError::NoMatch));
        assert_eq!(parser.parse(b""), Err(ParseError::NoMatch));

        let non_numeric_bytes = SAMPLE.replace(" 2133 ", " lots ");
        assert_eq!(
            parser.parse(non_numeric_bytes.as_bytes()),
            Err(ParseError::NoMatch)
        );

        assert_eq!(parser.parse(&[0xff, 0xfe, 0x00]), Err(ParseError::Encoding));
    }

    #[test]
    fn request_line_needs_three_tokens() {
        let parser = parser(Tz::UTC, TimestampPolicy::Embedded);
        for (request, tokens) in [("GET /foo", 2), ("GET /foo HTTP/1.0 extra", 4)] {
            let line = SAMPLE.replace("GET /foo?query=t HTTP/1.0", request);
            assert_eq!(
                parser.parse(line.as_bytes()),
                Err(ParseError::RequestLine {
                    value: request.to_string(),
                    tokens
                })
            );
        }
    }

    #[test]
    fn invalid_timestamp_is_reported() {
        let line = SAMPLE.replace("04/Mar/2021", "31/Feb/2021");
        let err = parser(Tz::UTC, TimestampPolicy::Embedded)
            .parse(line.as_bytes())
            .unwrap_err();
        assert!(matches!(err, ParseError::Timestamp { .. }));
    }
}
