use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::process::Command;
use tracing::debug;

use crate::core::hardware::HardwareAdapter;
use crate::core::models::MountEntry;

mod linux;
mod macos;
mod simulated;

pub use linux::{LinuxAdapter, parse_linux_mount_line};
pub use macos::{MacosAdapter, parse_macos_mount_line};
pub use simulated::SimulatedAdapter;

/// Mount table lines shorter than this are noise.
const MIN_MOUNT_LINE_LEN: usize = 3;

/// Pick the adapter for this host. Called once at startup.
pub fn get_adapter(simulation: bool, mount_root: &Path) -> Arc<dyn HardwareAdapter> {
    if simulation {
        return Arc::new(SimulatedAdapter::demo(mount_root));
    }

    if cfg!(target_os = "macos") {
        Arc::new(MacosAdapter)
    } else {
        Arc::new(LinuxAdapter)
    }
}

/// Run an external tool and return its stdout, failing on a non-zero exit.
pub(crate) async fn read_tool_output(program: &str, args: &[&str]) -> Result<String> {
    debug!(program, ?args, "Running external tool");
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("Failed to run {}", program))?;

    if !output.status.success() {
        bail!(
            "{} exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    String::from_utf8(output.stdout).with_context(|| format!("{} printed invalid UTF-8", program))
}

/// Split `line` on whitespace runs into at most `max` fields; the last field
/// keeps the remainder of the line.
pub(crate) fn split_fields(line: &str, max: usize) -> Vec<&str> {
    let mut fields = Vec::new();
    let mut rest = line.trim();
    while !rest.is_empty() {
        if fields.len() + 1 == max {
            fields.push(rest);
            break;
        }
        match rest.find(char::is_whitespace) {
            Some(end) => {
                fields.push(&rest[..end]);
                rest = rest[end..].trim_start();
            }
            None => {
                fields.push(rest);
                break;
            }
        }
    }
    fields
}

/// Split mount tool output into entries using a per-platform line parser.
pub(crate) fn parse_mount_output(
    output: &str,
    parse_line: fn(&str) -> Option<MountEntry>,
) -> Vec<MountEntry> {
    output
        .lines()
        .filter(|line| line.len() >= MIN_MOUNT_LINE_LEN)
        .filter_map(|line| {
            let entry = parse_line(line);
            if entry.is_none() {
                debug!(line, "Skipping unparsable mount line");
            }
            entry
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_lines_are_discarded() {
        let output = "\n \nab\n/dev/sda1 on / type ext4 (rw,relatime)\n";
        let entries = parse_mount_output(output, parse_linux_mount_line);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].mount_path, "/");
    }

    #[test]
    fn split_fields_collapses_whitespace_and_keeps_remainder() {
        assert_eq!(
            split_fields("  a   b\tc d e  ", 3),
            vec!["a", "b", "c d e"]
        );
        assert_eq!(split_fields("a b", 6), vec!["a", "b"]);
        assert!(split_fields("   ", 4).is_empty());
    }

    #[tokio::test]
    async fn read_tool_output_reports_failure() {
        let err = read_tool_output("sh", &["-c", "echo boom >&2; exit 3"])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn read_tool_output_returns_stdout() {
        let out = read_tool_output("sh", &["-c", "echo hello"]).await.unwrap();
        assert_eq!(out, "hello\n");
    }
}
