//! Endpoint configuration.
//!
//! Configuration is an immutable struct constructed once through a builder
//! and consumed by value. Transport-specific settings ride along as an
//! opaque attribute map the core never parses.

use std::collections::HashMap;
use std::time::Duration;

/// Immutable endpoint configuration.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Endpoint name, used for peer addressing and logging
    pub name: String,
    /// Heartbeat interval; zero disables the heartbeat task
    pub heartbeat_interval: Duration,
    /// Buffer size the marshalling pool hands out (bytes)
    pub buffer_size: usize,
    /// Number of buffers in the marshalling pool
    pub pool_capacity: usize,
    /// Opaque transport attributes (not parsed by the core)
    pub attributes: HashMap<String, String>,
}

impl EndpointConfig {
    /// Start building a configuration for a named endpoint.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> EndpointConfigBuilder {
        EndpointConfigBuilder {
            name: name.into(),
            heartbeat_interval: Duration::ZERO,
            buffer_size: tether_marshal::DEFAULT_BUFFER_SIZE,
            pool_capacity: tether_marshal::DEFAULT_POOL_CAPACITY,
            attributes: HashMap::new(),
        }
    }
}

/// Builder for [`EndpointConfig`].
#[derive(Debug)]
pub struct EndpointConfigBuilder {
    name: String,
    heartbeat_interval: Duration,
    buffer_size: usize,
    pool_capacity: usize,
    attributes: HashMap<String, String>,
}

impl EndpointConfigBuilder {
    /// Set the heartbeat interval; `Duration::ZERO` disables heartbeats.
    #[must_use]
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the marshalling pool buffer size.
    #[must_use]
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Set the marshalling pool capacity.
    #[must_use]
    pub fn pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    /// Add one opaque transport attribute.
    #[must_use]
    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Finish building.
    #[must_use]
    pub fn build(self) -> EndpointConfig {
        EndpointConfig {
            name: self.name,
            heartbeat_interval: self.heartbeat_interval,
            buffer_size: self.buffer_size,
            pool_capacity: self.pool_capacity,
            attributes: self.attributes,
        }
    }
}
