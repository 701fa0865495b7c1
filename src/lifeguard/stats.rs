//! Human-readable restart/reset stats files
//!
//! `COMMAND : N *\n` lines, exactly one ending in ` *` (the most recent),
//! atomically updated via write-temp-then-rename and rotated by
//! dropping the first line once the file exceeds 1024 bytes — the same
//! durability pattern mandates for every file under
//! `/var/lib/dsme`.

use std::fs;
use std::io::Write;
use std::path::Path;

/// Append (or bump) a `COMMAND : N *` entry and persist atomically,
/// rotating by dropping the oldest line once over `max_bytes`.
pub fn record_event(path: &Path, command: &str, max_bytes: u64) -> std::io::Result<()> {
    let existing = fs::read_to_string(path).unwrap_or_default();
    let mut lines: Vec<String> = existing.lines().map(|l| strip_marker(l).to_string()).collect();

    let mut found = false;
    for line in lines.iter_mut() {
        if let Some((cmd, count)) = parse_line(line) {
            if cmd == command {
                *line = format!("{cmd} : {}", count + 1);
                found = true;
                break;
            }
        }
    }
    if !found {
        lines.push(format!("{command} : 1"));
    }

    // Mark the bumped/new line as most-recent; everything else loses the marker.
    let recent_idx = lines.iter().position(|l| parse_line(l).map(|(c, _)| c == command).unwrap_or(false));

    let mut rendered = String::new();
    for (idx, line) in lines.iter().enumerate() {
        if Some(idx) == recent_idx {
            rendered.push_str(&format!("{line} *\n"));
        } else {
            rendered.push_str(line);
            rendered.push('\n');
        }
    }

    while rendered.len() as u64 > max_bytes && rendered.contains('\n') {
        if let Some(pos) = rendered.find('\n') {
            rendered.drain(..=pos);
        } else {
            break;
        }
    }

    write_atomic(path, rendered.as_bytes())
}

fn strip_marker(line: &str) -> &str {
    line.strip_suffix(" *").unwrap_or(line)
}

fn parse_line(line: &str) -> Option<(String, u64)> {
    let line = strip_marker(line.trim());
    let mut parts = line.splitn(2, " : ");
    let cmd = parts.next()?.to_string();
    let count: u64 = parts.next()?.trim().parse().ok()?;
    Some((cmd, count))
}

fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut f = fs::File::create(&tmp_path)?;
        f.write_all(data)?;
        f.sync_all()?;
    }
    fs::rename(&tmp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn records_and_bumps_counts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("restarts");
        record_event(&path, "foo", 1024).unwrap();
        record_event(&path, "foo", 1024).unwrap();
        record_event(&path, "bar", 1024).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("foo : 2"));
        assert!(content.contains("bar : 1 *"));
        assert_eq!(content.matches(" *").count(), 1);
    }

    #[test]
    fn rotates_when_over_max_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("restarts");
        for i in 0..50 {
            record_event(&path, &format!("proc{i}"), 200).unwrap();
        }
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.len() as u64 <= 400); // rotation kicked in well before 50 lines
        assert!(content.contains("proc49"));
        assert!(!content.contains("proc0 :"));
    }
}
