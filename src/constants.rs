use std::time::Duration;

/// The adapter firmware runs its UART at 57600 baud, 8N2.
pub const DEFAULT_BAUD_RATE: u32 = 57600;

pub(crate) const SERIAL_TIMEOUT_MS: u64 = 10;
pub(crate) const MAX_RESPONSE_SIZE: usize = 1024;

pub(crate) const STARTUP_BANNER: &str = "HVPP Configurator started";
pub(crate) const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Timeouts are retried this many times per operation
pub(crate) const TIMEOUT_RETRIES: u8 = 1;
