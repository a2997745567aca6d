//! Exec and terminal types shared by the runtime service and the streaming router.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exec timeout used when the caller passes zero.
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(120);

/// Maximum captured output size per stream (stdout/stderr): 16 MiB.
pub const MAX_OUTPUT_BYTES: usize = 16 * 1024 * 1024;

/// Output from a command run to completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecOutput {
    /// Captured stdout bytes.
    pub stdout: Vec<u8>,
    /// Captured stderr bytes.
    pub stderr: Vec<u8>,
    /// Process exit code.
    pub exit_code: i32,
}

impl ExecOutput {
    /// Append to a capture buffer, dropping anything past [`MAX_OUTPUT_BYTES`].
    pub fn capture(buf: &mut Vec<u8>, data: &[u8]) {
        let room = MAX_OUTPUT_BYTES.saturating_sub(buf.len());
        buf.extend_from_slice(&data[..data.len().min(room)]);
    }
}

/// Terminal size change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub width: u16,
    pub height: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_caps_output() {
        let mut buf = vec![0u8; MAX_OUTPUT_BYTES - 2];
        ExecOutput::capture(&mut buf, b"abcdef");
        assert_eq!(buf.len(), MAX_OUTPUT_BYTES);
        assert_eq!(&buf[buf.len() - 2..], b"ab");

        ExecOutput::capture(&mut buf, b"more");
        assert_eq!(buf.len(), MAX_OUTPUT_BYTES);
    }

    #[test]
    fn test_terminal_size_serialization() {
        let size = TerminalSize {
            width: 120,
            height: 40,
        };
        let json = serde_json::to_string(&size).unwrap();
        assert_eq!(json, r#"{"width":120,"height":40}"#);
    }
}
