use crate::error::{Result, SmuxError};
use std::time::Duration;

/// Largest payload the 16-bit length field of a frame header can describe.
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Configuration for a smux session.
///
/// `Config` contains all the tunable parameters for a smux session, including
/// keep-alive settings, buffer sizes, and protocol version.
///
/// Version 1 sessions bound memory with a connection-wide token bucket of
/// `max_receive_buffer` bytes. Version 2 sessions additionally run a
/// per-stream sliding window and advertise `max_stream_buffer` as the
/// window size to the peer.
///
/// # Examples
///
/// ## Using default configuration
///
/// ```rust
/// use smux::Config;
///
/// let config = Config::default();
/// assert_eq!(config.version, 1);
/// assert!(config.enable_keep_alive);
/// ```
///
/// ## Creating custom configuration
///
/// ```rust
/// use smux::ConfigBuilder;
/// use std::time::Duration;
///
/// let config = ConfigBuilder::new()
///     .version(2)
///     .keep_alive_interval(Duration::from_secs(30))
///     .keep_alive_timeout(Duration::from_secs(90))
///     .max_frame_size(16 * 1024)
///     .build()
///     .expect("Valid configuration");
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    pub version: u8,
    pub keep_alive_interval: Duration,
    pub keep_alive_timeout: Duration,
    pub max_frame_size: usize,
    pub max_receive_buffer: usize,
    pub max_stream_buffer: usize,
    /// Streams opened by the peer that may wait for `accept_stream`.
    pub accept_backlog: usize,
    pub enable_keep_alive: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            keep_alive_interval: Duration::from_secs(10),
            keep_alive_timeout: Duration::from_secs(30),
            max_frame_size: 32 * 1024,           // 32KB
            max_receive_buffer: 4 * 1024 * 1024, // 4MB
            max_stream_buffer: 64 * 1024,        // 64KB
            accept_backlog: 1024,
            enable_keep_alive: true,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.version != 1 && self.version != 2 {
            return Err(SmuxError::Config(format!(
                "Unsupported protocol version {}",
                self.version
            )));
        }

        if self.enable_keep_alive {
            if self.keep_alive_interval.is_zero() {
                return Err(SmuxError::Config(
                    "Keep-alive interval must be positive".to_string(),
                ));
            }

            if self.keep_alive_timeout < self.keep_alive_interval {
                return Err(SmuxError::Config(
                    "Keep-alive timeout must not be shorter than keep-alive interval".to_string(),
                ));
            }
        }

        if self.max_frame_size == 0 {
            return Err(SmuxError::Config("Max frame size cannot be 0".to_string()));
        }

        if self.max_frame_size > MAX_FRAME_PAYLOAD {
            return Err(SmuxError::Config(format!(
                "Max frame size cannot exceed {MAX_FRAME_PAYLOAD} bytes"
            )));
        }

        if self.max_receive_buffer == 0 {
            return Err(SmuxError::Config(
                "Max receive buffer cannot be 0".to_string(),
            ));
        }

        if self.max_stream_buffer == 0 {
            return Err(SmuxError::Config(
                "Max stream buffer cannot be 0".to_string(),
            ));
        }

        if self.max_stream_buffer > self.max_receive_buffer {
            return Err(SmuxError::Config(
                "Max stream buffer must not exceed max receive buffer".to_string(),
            ));
        }

        if self.max_stream_buffer > i32::MAX as usize {
            return Err(SmuxError::Config(
                "Max stream buffer cannot exceed 2GB".to_string(),
            ));
        }

        if self.accept_backlog == 0 {
            return Err(SmuxError::Config("Accept backlog cannot be 0".to_string()));
        }

        Ok(())
    }
}

/// Builder for creating custom `Config` instances.
///
/// `ConfigBuilder` provides a fluent interface for constructing `Config` objects
/// with custom parameters. It starts with default values and allows selective
/// overriding of specific settings.
///
/// # Examples
///
/// ```rust
/// use smux::ConfigBuilder;
/// use std::time::Duration;
///
/// let config = ConfigBuilder::new()
///     .version(2)
///     .max_stream_buffer(128 * 1024)
///     .enable_keep_alive(false)
///     .build()
///     .expect("Valid configuration");
/// ```
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn version(mut self, version: u8) -> Self {
        self.config.version = version;
        self
    }

    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.config.keep_alive_interval = interval;
        self
    }

    pub fn keep_alive_timeout(mut self, timeout: Duration) -> Self {
        self.config.keep_alive_timeout = timeout;
        self
    }

    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    pub fn max_receive_buffer(mut self, size: usize) -> Self {
        self.config.max_receive_buffer = size;
        self
    }

    pub fn max_stream_buffer(mut self, size: usize) -> Self {
        self.config.max_stream_buffer = size;
        self
    }

    pub fn accept_backlog(mut self, backlog: usize) -> Self {
        self.config.accept_backlog = backlog;
        self
    }

    pub fn enable_keep_alive(mut self, enable: bool) -> Self {
        self.config.enable_keep_alive = enable;
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
