// Shared fixtures for exercising the feed stack in tests and manual runs.
pub mod feed;
pub mod tls;
