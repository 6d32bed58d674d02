// Device model: sensors, equipment, and concrete kinds
pub mod device;

// Per-device serialized workers
pub mod worker;

// Time-series schema derivation and registration
pub mod schema;

// SQLite-backed telemetry storage
pub mod store;

// Persistence coordinator
pub mod persist;

// TOML configuration
pub mod config;
