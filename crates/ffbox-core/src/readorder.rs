//! Read-order trace records.
//!
//! A push records the sequence of file accesses made by the repository's
//! representative run and stores it at `.ffbox/read_order.log` next to the
//! pushed tree. At mount time the prefetcher replays the trace to warm the
//! cache. Format: LF-separated lines `<op> <relpath>`; directory relpaths
//! end with `/`.

use std::fmt;

/// Metadata directory name inside a pushed tree.
pub const META_DIR: &str = ".ffbox";

/// Object key of the read-order trace, relative to the mount prefix.
pub const READ_ORDER_KEY: &str = ".ffbox/read_order.log";

/// Syscalls captured by the recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceOp {
    Open,
    Openat,
    Stat,
    Lstat,
    Newfstatat,
}

impl TraceOp {
    pub fn parse(s: &str) -> Option<TraceOp> {
        match s {
            "open" => Some(TraceOp::Open),
            "openat" => Some(TraceOp::Openat),
            "stat" => Some(TraceOp::Stat),
            "lstat" => Some(TraceOp::Lstat),
            "newfstatat" => Some(TraceOp::Newfstatat),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TraceOp::Open => "open",
            TraceOp::Openat => "openat",
            TraceOp::Stat => "stat",
            TraceOp::Lstat => "lstat",
            TraceOp::Newfstatat => "newfstatat",
        }
    }

    /// Open-style ops are replayed as `open(2)`; the rest as `lstat(2)`.
    pub fn is_open(&self) -> bool {
        matches!(self, TraceOp::Open | TraceOp::Openat)
    }
}

impl fmt::Display for TraceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One trace line: operation plus mount-relative path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TraceRecord {
    pub op: TraceOp,
    pub rel_path: String,
}

impl TraceRecord {
    pub fn new(op: TraceOp, rel_path: impl Into<String>) -> Self {
        TraceRecord {
            op,
            rel_path: rel_path.into(),
        }
    }

    /// Parse a `<op> <relpath>` line. Lines with unknown ops or no path
    /// yield `None`.
    pub fn parse_line(line: &str) -> Option<TraceRecord> {
        let line = line.trim();
        let (op, path) = line.split_once(' ')?;
        let op = TraceOp::parse(op)?;
        let path = path.trim();
        if path.is_empty() {
            return None;
        }
        Some(TraceRecord::new(op, path))
    }

    pub fn to_line(&self) -> String {
        format!("{} {}", self.op, self.rel_path)
    }
}

/// Parse a whole trace file, skipping malformed lines.
pub fn parse_trace(text: &str) -> Vec<TraceRecord> {
    text.lines().filter_map(TraceRecord::parse_line).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ops() {
        assert_eq!(TraceOp::parse("openat"), Some(TraceOp::Openat));
        assert_eq!(TraceOp::parse("newfstatat"), Some(TraceOp::Newfstatat));
        assert_eq!(TraceOp::parse("close"), None);
    }

    #[test]
    fn parse_lines() {
        let trace = "openat foo/bar.bin\nstat foo/\nbogus x\nnope\n";
        let records = parse_trace(trace);
        assert_eq!(
            records,
            vec![
                TraceRecord::new(TraceOp::Openat, "foo/bar.bin"),
                TraceRecord::new(TraceOp::Stat, "foo/"),
            ]
        );
    }

    #[test]
    fn line_roundtrip() {
        let rec = TraceRecord::new(TraceOp::Lstat, "a/b/");
        assert_eq!(TraceRecord::parse_line(&rec.to_line()), Some(rec));
    }
}
