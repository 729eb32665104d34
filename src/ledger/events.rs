// Typed ledger events emitted by the block-poll loop (spec §4.1 "Event
// subscription").

use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "kind")]
pub enum LedgerEvent {
    AidRequested { request_id: u64, block: u64 },
    PayoutReleased { request_id: u64, amount: u64, block: u64 },
    RequestTimedOut { request_id: u64, block: u64 },
}

/// Reads the last-seen block number from the cursor file, defaulting to 0
/// (genesis) when the file doesn't exist yet — the only state this crate
/// persists across restarts (spec §6).
pub fn load_cursor(path: &str) -> u64 {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

pub fn save_cursor(path: &str, block: u64) -> std::io::Result<()> {
    std::fs::write(path, block.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_cursor_file_defaults_to_zero() {
        assert_eq!(load_cursor("/nonexistent/path/cursor.txt"), 0);
    }

    #[test]
    fn cursor_roundtrips_through_disk() {
        let path = std::env::temp_dir().join(format!("cursor_test_{}.txt", uuid::Uuid::new_v4()));
        let path = path.to_str().unwrap();
        save_cursor(path, 42).unwrap();
        assert_eq!(load_cursor(path), 42);
        let _ = std::fs::remove_file(path);
    }
}
