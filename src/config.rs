use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use crate::game::constants::{net, tick};
use crate::net::session::SessionConfig;

/// Server configuration
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Address to bind the UDP socket to
    pub bind_address: IpAddr,
    /// UDP port to listen on
    pub port: u16,
    /// Simulation ticks per second
    pub tick_rate: u32,
    /// Silence before a connection is torn down
    pub connection_timeout_ms: u64,
    /// Maximum concurrent clients
    pub max_connections: usize,
    /// Encoded snapshots buffered per connection before the oldest is dropped
    pub snapshot_queue_capacity: usize,
    /// Inbound messages buffered per connection before the oldest is dropped
    pub command_queue_capacity: usize,
    /// Ticks of removal history kept for delta baselines
    pub history_ticks: u32,
    /// Reliable message retransmission interval
    pub resend_interval_ms: u64,
    /// Heartbeat interval when there is nothing else to send
    pub heartbeat_interval_ms: u64,
    /// Port of the metrics HTTP endpoint
    pub metrics_port: u16,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            port: net::DEFAULT_PORT,
            tick_rate: tick::DEFAULT_RATE,
            connection_timeout_ms: net::DEFAULT_TIMEOUT_MS,
            max_connections: 64,
            snapshot_queue_capacity: 4,
            command_queue_capacity: 256,
            history_ticks: tick::DEFAULT_HISTORY,
            resend_interval_ms: 100,
            heartbeat_interval_ms: 250,
            metrics_port: 9090,
        }
    }
}

impl NetConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        Self::load_from(|key| std::env::var(key).ok())
    }

    /// Load config from an arbitrary key lookup; invalid values keep the default
    pub fn load_from(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("BIND_ADDRESS") {
            if let Ok(parsed) = addr.parse() {
                config.bind_address = parsed;
            } else {
                tracing::warn!("Invalid BIND_ADDRESS '{}', using default", addr);
            }
        }

        read_in_range(&lookup, "PORT", 1..=u16::MAX, &mut config.port);
        read_in_range(&lookup, "TICK_RATE", 1..=tick::MAX_RATE, &mut config.tick_rate);
        read_in_range(
            &lookup,
            "CONNECTION_TIMEOUT_MS",
            100..=3_600_000,
            &mut config.connection_timeout_ms,
        );
        read_in_range(&lookup, "MAX_CONNECTIONS", 1..=10_000, &mut config.max_connections);
        read_in_range(
            &lookup,
            "SNAPSHOT_QUEUE_CAPACITY",
            1..=1024,
            &mut config.snapshot_queue_capacity,
        );
        read_in_range(
            &lookup,
            "COMMAND_QUEUE_CAPACITY",
            1..=65_536,
            &mut config.command_queue_capacity,
        );
        read_in_range(&lookup, "HISTORY_TICKS", 1..=1_000_000, &mut config.history_ticks);
        read_in_range(
            &lookup,
            "RESEND_INTERVAL_MS",
            1..=60_000,
            &mut config.resend_interval_ms,
        );
        read_in_range(
            &lookup,
            "HEARTBEAT_INTERVAL_MS",
            1..=60_000,
            &mut config.heartbeat_interval_ms,
        );
        read_in_range(&lookup, "METRICS_PORT", 1..=u16::MAX, &mut config.metrics_port);

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        if self.port == 0 {
            return Err("Port cannot be 0".to_string());
        }
        if self.tick_rate == 0 || self.tick_rate > tick::MAX_RATE {
            return Err(format!("tick_rate must be 1-{}", tick::MAX_RATE));
        }
        if self.max_connections == 0 {
            return Err("max_connections must be at least 1".to_string());
        }
        if self.snapshot_queue_capacity == 0 || self.command_queue_capacity == 0 {
            return Err("queue capacities must be at least 1".to_string());
        }
        if self.heartbeat_interval_ms >= self.connection_timeout_ms {
            return Err("heartbeat_interval_ms must be shorter than connection_timeout_ms".to_string());
        }
        if self.metrics_port == self.port {
            return Err("metrics_port cannot equal port".to_string());
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate.max(1) as f64)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Transport session settings
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            timeout: self.connection_timeout(),
            resend_interval: Duration::from_millis(self.resend_interval_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            unreliable_capacity: self.snapshot_queue_capacity,
        }
    }
}

fn read_in_range<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    range: std::ops::RangeInclusive<T>,
    target: &mut T,
) where
    T: FromStr + PartialOrd + Display,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.parse::<T>() {
        Ok(parsed) if range.contains(&parsed) => *target = parsed,
        Ok(_) => tracing::warn!(
            "{} must be {}-{}, using default",
            key,
            range.start(),
            range.end()
        ),
        Err(_) => tracing::warn!("Invalid {} '{}', using default", key, raw),
    }
}
