/// Maximum number of characters of a malformed payload kept in errors and logs
pub const DECODE_EXCERPT_LIMIT: usize = 300;

// =============================================================================
// THROTTLE DEFAULTS
// =============================================================================

/// Default upper bound on distinct throttle keys tracked at once
pub const DEFAULT_THROTTLE_MAX_KEYS: usize = 100_000;

/// Payload key strategy prefix, e.g. `payload:device_id`
pub const PAYLOAD_KEY_PREFIX: &str = "payload:";

// =============================================================================
// TRANSPORT DEFAULTS
// =============================================================================

pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_MQTTS_PORT: u16 = 8883;

/// Minimum keep-alive accepted by the MQTT client
pub const MIN_MQTT_KEEP_ALIVE_SECS: u64 = 5;

/// Client identifier prefix used when `MQTT_CLIENT_ID` is not set
pub const CLIENT_ID_PREFIX: &str = "telemetry-bridge";
