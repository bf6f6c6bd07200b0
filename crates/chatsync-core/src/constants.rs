//! Application-wide constants
//!
//! Default tuning values shared by the config layer and the components
//! that fall back to them.

/// Environment variable that enables DEBUG file logging when set to a path
pub const LOG_FILE_ENV: &str = "CHATSYNC_LOG_FILE";

/// File name of the JSON config inside the platform config directory
pub const CONFIG_FILE_NAME: &str = "chatsync.json";

// Subscription defaults
/// Delay before the first resubscribe attempt
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 500;
/// Upper bound for any resubscribe delay (before jitter)
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;
/// Extra random delay as a fraction of the computed delay
pub const DEFAULT_BACKOFF_JITTER_RATIO: f64 = 0.2;
/// Consecutive failures before a subscription reports `failed`
pub const DEFAULT_MAX_ATTEMPTS: u32 = 6;
/// Attach attempts slower than this count as a transport failure
pub const DEFAULT_ATTACH_TIMEOUT_MS: u64 = 10_000;

// Reconciliation defaults
/// Sends not acknowledged within this window are marked failed
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 15_000;
/// Number of messages requested when a conversation is (re)fetched
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

// Window defaults
/// Maximum number of simultaneously maximized chat windows
pub const DEFAULT_MAX_OPEN_WINDOWS: usize = 3;
/// Maximum number of minimized chat windows before eviction to closed
pub const DEFAULT_MAX_MINIMIZED_WINDOWS: usize = 8;

// Presence defaults
/// Heartbeat age below which a participant is online (30 seconds)
pub const DEFAULT_ONLINE_WINDOW_SECS: u64 = 30;
/// Heartbeat age below which a participant is away (5 minutes)
pub const DEFAULT_AWAY_WINDOW_SECS: u64 = 5 * 60;

/// Capacity of the in-process event queue between tasks and the consumer
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 256;
