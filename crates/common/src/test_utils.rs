//! Test utilities for ptylink
//!
//! Mock constructors and helpers shared by unit and integration tests
//! across crates.

use std::future::Future;
use std::time::Duration;

use crate::device::DeviceDescriptor;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a mock DeviceDescriptor for testing.
pub fn mock_descriptor(port_name: &str, vendor_id: u16, product_id: u16) -> DeviceDescriptor {
    DeviceDescriptor {
        port_name: port_name.to_string(),
        vendor_id,
        product_id,
        serial_number: None,
        manufacturer: Some("Test Manufacturer".to_string()),
        product: Some("Test Adapter".to_string()),
        driver: "mock",
        port_count: 1,
    }
}

/// Run a future with the default test timeout, panicking when it hangs.
pub async fn with_timeout<F, T>(future: F) -> T
where
    F: Future<Output = T>,
{
    tokio::time::timeout(DEFAULT_TEST_TIMEOUT, future)
        .await
        .expect("test timed out")
}
