// pulse-test-utils: Mock hub server and raw WebSocket client for tests.

pub mod mock_hub;
pub mod test_client;

pub use mock_hub::MockHub;
pub use test_client::TestClient;

/// Wall-clock milliseconds, for frame timestamps in tests.
pub fn now_ms() -> i64 {
    i64::try_from(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock before epoch")
            .as_millis(),
    )
    .expect("timestamp overflow")
}
