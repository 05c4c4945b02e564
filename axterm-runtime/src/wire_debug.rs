//! Gate for verbose raw-byte KISS tracing: `AXTERM_WIRE_DEBUG` (1/true/yes),
//! falling back to a debug-build-on/release-build-off default the way
//! `m17app`'s own trace logging is only ever opt-in noisy in release builds.

use std::sync::OnceLock;

fn env_override() -> Option<bool> {
    let raw = std::env::var("AXTERM_WIRE_DEBUG").ok()?;
    Some(matches!(raw.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}

/// Whether raw KISS/AX.25 bytes should be hex-dumped at trace level. Read
/// once and cached: the env var is a startup-time switch, not something a
/// caller is expected to flip mid-run.
pub fn enabled() -> bool {
    static CACHED: OnceLock<bool> = OnceLock::new();
    *CACHED.get_or_init(|| env_override().unwrap_or(cfg!(debug_assertions)))
}

/// Render `bytes` as a compact hex string for a trace log line, truncating
/// long payloads so a multi-kilobyte file chunk doesn't flood the log.
pub fn hex_preview(bytes: &[u8]) -> String {
    const MAX_PREVIEW: usize = 64;
    if bytes.len() <= MAX_PREVIEW {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    } else {
        let head: String = bytes[..MAX_PREVIEW].iter().map(|b| format!("{b:02x}")).collect();
        format!("{head}... ({} bytes total)", bytes.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_preview_short() {
        assert_eq!(hex_preview(&[0xC0, 0x00, 0xAB]), "c000ab");
    }

    #[test]
    fn hex_preview_truncates_long_payloads() {
        let bytes = vec![0xAAu8; 100];
        let preview = hex_preview(&bytes);
        assert!(preview.ends_with("(100 bytes total)"));
        assert!(preview.len() < 100 * 2);
    }
}
