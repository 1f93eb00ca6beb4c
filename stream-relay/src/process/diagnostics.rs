//! Worker diagnostic-output parsing.
//!
//! The worker writes progress and errors to stderr. Progress lines are noise
//! for failure reporting; everything else is checked against the configured
//! failure signatures and kept in a short tail for exit descriptions.

use std::collections::VecDeque;

/// Case-insensitive substrings that mark a diagnostic line as a fatal failure.
#[derive(Debug, Clone)]
pub struct FailureSignatures {
    patterns: Vec<String>,
}

impl FailureSignatures {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| p.as_ref().trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        Self { patterns }
    }

    /// The signature `line` matches, if any.
    pub fn matches(&self, line: &str) -> Option<&str> {
        let lowered = line.to_lowercase();
        self.patterns
            .iter()
            .find(|p| lowered.contains(p.as_str()))
            .map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Whether a line is an ffmpeg progress report.
///
/// Progress lines look like
/// `frame=  100 fps=25 q=-1.0 size=    1024kB time=00:00:04.00 bitrate=2097.2kbits/s speed=1.00x`.
/// Some builds omit `size=` so `time=` plus one other marker is required.
pub fn is_progress_line(line: &str) -> bool {
    line.contains("time=") && (line.contains("frame=") || line.contains("size="))
}

/// Parse `HH:MM:SS.ms` to seconds.
pub fn parse_time(time_str: &str) -> Option<f64> {
    let mut parts = time_str.split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Relayed media time reported by a progress line, in seconds.
pub fn progress_time(line: &str) -> Option<f64> {
    let start = line.find("time=")? + "time=".len();
    let rest = &line[start..];
    let end = rest.find(' ').unwrap_or(rest.len());
    parse_time(&rest[..end])
}

/// Last few non-progress diagnostic lines.
#[derive(Debug, Clone)]
pub struct DiagnosticTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl DiagnosticTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Remember `line` unless it is a progress report.
    pub fn push(&mut self, line: &str) {
        if self.capacity == 0 || is_progress_line(line) {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());
    }

    pub fn last(&self) -> Option<&str> {
        self.lines.back().map(String::as_str)
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn defaults() -> FailureSignatures {
        FailureSignatures::new(["could not open", "no such file", "connection refused", "not found"])
    }

    #[rstest]
    #[case("rtmp://host/live: Connection refused", Some("connection refused"))]
    #[case("[in#0] Error opening input: No such file or directory", Some("no such file"))]
    #[case("Could not open input 'rtmp://host/a'", Some("could not open"))]
    #[case("[rtmp @ 0x5581] Server error: Stream not found", Some("not found"))]
    #[case("Stream #0:0: Video: h264 (High), yuv420p", None)]
    #[case("frame=  100 fps=25 q=-1.0 size=    1024kB time=00:00:04.00", None)]
    fn test_failure_signatures(#[case] line: &str, #[case] expected: Option<&str>) {
        assert_eq!(defaults().matches(line), expected);
    }

    #[test]
    fn test_blank_patterns_are_ignored() {
        let signatures = FailureSignatures::new(["", "  "]);
        assert!(signatures.is_empty());
        assert_eq!(signatures.matches("anything"), None);
    }

    #[test]
    fn test_progress_lines() {
        assert!(is_progress_line(
            "frame=  100 fps=25 q=-1.0 size=    1024kB time=00:00:04.00 bitrate=2097.2kbits/s speed=1.00x"
        ));
        assert!(is_progress_line("frame=100 fps=25 time=00:00:04.00 speed=1x"));
        assert!(!is_progress_line("time=00:00:10.00"));
        assert!(!is_progress_line("Press [q] to stop"));
    }

    #[test]
    fn test_parse_time() {
        assert_eq!(parse_time("00:00:10.50"), Some(10.5));
        assert_eq!(parse_time("01:30:00.00"), Some(5400.0));
        assert_eq!(parse_time("00:00"), None);
        assert_eq!(parse_time("00:00:00:00"), None);
        assert_eq!(parse_time("invalid"), None);
        assert_eq!(
            progress_time("frame=1 size=1kB time=00:01:30.50 bitrate=1kbits/s"),
            Some(90.5)
        );
    }

    #[test]
    fn test_tail_skips_progress_and_rolls_over() {
        let mut tail = DiagnosticTail::new(2);
        tail.push("Input #0, flv, from 'rtmp://host/a':");
        tail.push("frame=1 size=1kB time=00:00:01.00");
        tail.push("Output #0, rtsp");
        tail.push("Conversion failed!");

        assert_eq!(tail.lines().collect::<Vec<_>>(), vec!["Output #0, rtsp", "Conversion failed!"]);
        assert_eq!(tail.last(), Some("Conversion failed!"));
    }

    #[test]
    fn test_zero_capacity_tail() {
        let mut tail = DiagnosticTail::new(0);
        tail.push("anything");
        assert!(tail.is_empty());
    }
}
