// Relay service wiring: config, TLS, and observability modules shared by
// the binary and its tests.
pub mod config;
pub mod observability;
pub mod tls;
