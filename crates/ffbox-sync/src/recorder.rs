//! Read-order recorder.
//!
//! Runs the repository's representative command under `strace` and distills
//! the file-access sequence into `.ffbox/read_order.log`. The trace ships
//! with the push and drives the mount-time prefetcher.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use tracing::{info, warn};

use ffbox_core::readorder::{TraceOp, TraceRecord, META_DIR};

const TRACE_FILTER: &str = "trace=open,openat,stat,lstat,newfstatat";

/// Execute `cmd` under strace in `push_dir` and write the distilled trace
/// to `<push_dir>/.ffbox/read_order.log`. Returns the log path.
pub fn record_read_order(push_dir: &Path, cmd: &str) -> Result<PathBuf> {
    let meta_dir = push_dir.join(META_DIR);
    std::fs::create_dir_all(&meta_dir)
        .with_context(|| format!("creating meta dir: {}", meta_dir.display()))?;

    let raw_path = std::env::temp_dir().join(format!("ffbox-trace-{}.log", std::process::id()));

    info!(cmd = %cmd, "recording read order");
    let status = Command::new("strace")
        .args(["-f", "-qq", "-e", TRACE_FILTER, "-o"])
        .arg(&raw_path)
        .args(["sh", "-c", cmd])
        .current_dir(push_dir)
        .status()
        .context("running strace (is it installed?)")?;
    if !status.success() {
        // The traced command failing is not fatal; whatever it read before
        // exiting is still a useful warm-up order.
        warn!(status = %status, "traced command exited non-zero");
    }

    let raw = std::fs::read_to_string(&raw_path)
        .with_context(|| format!("reading strace output: {}", raw_path.display()))?;
    let _ = std::fs::remove_file(&raw_path);

    let records = parse_strace_output(&raw, push_dir, |p| p.is_dir());

    let log_path = meta_dir.join("read_order.log");
    let mut out = String::new();
    for record in &records {
        out.push_str(&record.to_line());
        out.push('\n');
    }
    std::fs::write(&log_path, out)
        .with_context(|| format!("writing read-order log: {}", log_path.display()))?;

    info!(entries = records.len(), log = %log_path.display(), "read order recorded");
    Ok(log_path)
}

/// Distill raw strace output into trace records:
/// keep traced ops whose first quoted path resolves under `push_dir`,
/// relativize, dedupe on `(op, relpath)` preserving first occurrence, and
/// suffix `/` when the path is a directory. `is_dir` is injected so the
/// parser stays testable without a live tree.
pub fn parse_strace_output(
    raw: &str,
    push_dir: &Path,
    is_dir: impl Fn(&Path) -> bool,
) -> Vec<TraceRecord> {
    let mut seen: HashSet<(TraceOp, String)> = HashSet::new();
    let mut records = Vec::new();

    for line in raw.lines() {
        // strace -f prefixes each line with the pid
        let line = line
            .trim_start_matches(|c: char| c.is_ascii_digit())
            .trim_start();
        // interleaved syscalls appear as "<... openat resumed>" noise
        if line.contains("resumed") || line.contains("unfinished") {
            continue;
        }
        let Some((syscall, rest)) = line.split_once('(') else {
            continue;
        };
        let Some(op) = TraceOp::parse(syscall.trim()) else {
            continue;
        };
        // first quoted argument is the path (openat's AT_FDCWD is unquoted)
        let Some(path) = rest.split('"').nth(1) else {
            continue;
        };

        let abs = if path.starts_with('/') {
            PathBuf::from(path)
        } else {
            push_dir.join(path)
        };
        let Ok(rel) = abs.strip_prefix(push_dir) else {
            continue;
        };
        let mut rel = rel.to_string_lossy().to_string();
        if rel.is_empty() {
            continue;
        }
        if is_dir(&abs) && !rel.ends_with('/') {
            rel.push('/');
        }

        if seen.insert((op, rel.clone())) {
            records.push(TraceRecord::new(op, rel));
        }
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distills_trace_lines() {
        let push_dir = Path::new("/work/repo");
        let raw = concat!(
            "1234  openat(AT_FDCWD, \"/work/repo/model/weights.bin\", O_RDONLY) = 3\n",
            "1234  openat(AT_FDCWD, \"/etc/ld.so.cache\", O_RDONLY|O_CLOEXEC) = 3\n",
            "1235  stat(\"/work/repo/model\", {st_mode=S_IFDIR|0755, ...}) = 0\n",
            "1234  openat(AT_FDCWD, \"/work/repo/model/weights.bin\", O_RDONLY) = 4\n",
            "1234  openat(AT_FDCWD, \"config.json\", O_RDONLY) = 5\n",
            "1236  newfstatat(AT_FDCWD, \"/work/repo/missing\", 0x7ffd, 0) = -1 ENOENT\n",
            "1234  <... openat resumed>) = 6\n",
        );

        let records = parse_strace_output(raw, push_dir, |p| {
            p == Path::new("/work/repo/model")
        });

        assert_eq!(
            records,
            vec![
                TraceRecord::new(TraceOp::Openat, "model/weights.bin"),
                TraceRecord::new(TraceOp::Stat, "model/"),
                TraceRecord::new(TraceOp::Openat, "config.json"),
                TraceRecord::new(TraceOp::Newfstatat, "missing"),
            ]
        );
    }

    #[test]
    fn same_path_different_ops_both_kept() {
        let push_dir = Path::new("/r");
        let raw = concat!(
            "1  stat(\"/r/f\", ...) = 0\n",
            "1  openat(AT_FDCWD, \"/r/f\", O_RDONLY) = 3\n",
        );
        let records = parse_strace_output(raw, push_dir, |_| false);
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn paths_outside_push_dir_are_dropped() {
        let push_dir = Path::new("/r");
        let raw = "1  openat(AT_FDCWD, \"/elsewhere/f\", O_RDONLY) = 3\n";
        assert!(parse_strace_output(raw, push_dir, |_| false).is_empty());
    }
}
