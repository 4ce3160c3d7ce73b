use super::MuxError;
use std::time::Duration;

pub const DEFAULT_VERSION: u8 = 1;
pub const SUPPORTED_VERSIONS: [u8; 2] = [1, 2];
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_FRAME_SIZE: usize = 32 * 1024;
pub const DEFAULT_MAX_RECEIVE_BUFFER: usize = 4 * 1024 * 1024;
pub const DEFAULT_MAX_STREAM_BUFFER: usize = 64 * 1024;

/// Largest payload the 16-bit length field can carry
const MAX_PAYLOAD: usize = u16::MAX as usize;

/// Mux session parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxConfig {
    /// Protocol version both sides must agree on
    pub version: u8,
    /// Period between keepalive `NOP` frames
    pub keepalive_interval: Duration,
    /// Disable keepalive and inactivity close
    pub keepalive_disabled: bool,
    /// Close the session when nothing arrives for this long
    pub keepalive_timeout: Duration,
    /// Largest `PSH` payload; larger writes are fragmented
    pub max_frame_size: usize,
    /// Bound on unread bytes across all streams
    pub max_receive_buffer: usize,
    /// Per-stream flow control window
    pub max_stream_buffer: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            version: DEFAULT_VERSION,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            keepalive_disabled: false,
            keepalive_timeout: DEFAULT_KEEPALIVE_TIMEOUT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_receive_buffer: DEFAULT_MAX_RECEIVE_BUFFER,
            max_stream_buffer: DEFAULT_MAX_STREAM_BUFFER,
        }
    }
}

impl MuxConfig {
    /// Check protocol invariants
    pub fn verify(&self) -> Result<(), MuxError> {
        if !SUPPORTED_VERSIONS.contains(&self.version) {
            return Err(MuxError::VersionUnsupported {
                local: self.version,
                peer: None,
            });
        }

        if !self.keepalive_disabled {
            if self.keepalive_interval.is_zero() {
                return Err(MuxError::InvalidConfig(
                    "keepalive interval must be positive".to_string(),
                ));
            }
            if self.keepalive_interval >= self.keepalive_timeout {
                return Err(MuxError::InvalidConfig(
                    "keepalive interval must be smaller than keepalive timeout".to_string(),
                ));
            }
        }

        if self.max_frame_size == 0 {
            return Err(MuxError::InvalidConfig("max frame size must be positive".to_string()));
        }
        if self.max_receive_buffer == 0 {
            return Err(MuxError::InvalidConfig(
                "max receive buffer must be positive".to_string(),
            ));
        }
        if self.max_stream_buffer == 0 {
            return Err(MuxError::InvalidConfig(
                "max stream buffer must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Frame payload limit, saturated to the wire format
    pub fn frame_size(&self) -> usize {
        self.max_frame_size.min(MAX_PAYLOAD)
    }

    /// Per-stream window, never larger than the session buffer
    pub fn stream_window(&self) -> u32 {
        let window = self.max_stream_buffer.min(self.max_receive_buffer);
        u32::try_from(window).unwrap_or(u32::MAX)
    }
}
