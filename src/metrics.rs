//! Prometheus-compatible metrics endpoint
//!
//! Exposes tick loop and transport counters in Prometheus text format.
//! Default endpoint: http://localhost:9090/metrics

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

const TICK_HISTORY: usize = 1000;

/// Metrics registry shared by the tick loop and the transport
#[derive(Debug)]
pub struct Metrics {
    // Tick timing (microseconds)
    pub tick_time_us: AtomicU64,
    pub tick_time_p95_us: AtomicU64,
    pub tick_time_p99_us: AtomicU64,
    pub tick_time_max_us: AtomicU64,
    pub tick_count: AtomicU64,
    /// Ticks that started later than their deadline
    pub ticks_overrun: AtomicU64,

    // World
    pub entity_count: AtomicU64,

    // Connections
    pub connections_active: AtomicU64,
    pub connections_accepted: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub connections_timed_out: AtomicU64,

    // Snapshots
    pub snapshots_sent: AtomicU64,
    pub snapshot_bytes: AtomicU64,
    pub snapshots_dropped: AtomicU64,

    // Commands
    pub commands_applied: AtomicU64,
    pub commands_rejected: AtomicU64,
    pub commands_duplicate: AtomicU64,

    // Datagrams
    pub datagrams_sent: AtomicU64,
    pub datagrams_received: AtomicU64,
    pub datagrams_dropped: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,

    start_time: Instant,

    // Rolling tick times for percentile calculation
    tick_history: RwLock<VecDeque<u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            tick_time_us: AtomicU64::new(0),
            tick_time_p95_us: AtomicU64::new(0),
            tick_time_p99_us: AtomicU64::new(0),
            tick_time_max_us: AtomicU64::new(0),
            tick_count: AtomicU64::new(0),
            ticks_overrun: AtomicU64::new(0),
            entity_count: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            connections_accepted: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
            connections_timed_out: AtomicU64::new(0),
            snapshots_sent: AtomicU64::new(0),
            snapshot_bytes: AtomicU64::new(0),
            snapshots_dropped: AtomicU64::new(0),
            commands_applied: AtomicU64::new(0),
            commands_rejected: AtomicU64::new(0),
            commands_duplicate: AtomicU64::new(0),
            datagrams_sent: AtomicU64::new(0),
            datagrams_received: AtomicU64::new(0),
            datagrams_dropped: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            start_time: Instant::now(),
            tick_history: RwLock::new(VecDeque::with_capacity(TICK_HISTORY)),
        }
    }

    /// Record a tick time and update percentiles
    pub fn record_tick_time(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.tick_time_us.store(us, Ordering::Relaxed);
        self.tick_count.fetch_add(1, Ordering::Relaxed);

        let mut history = self.tick_history.write();
        history.push_back(us);
        while history.len() > TICK_HISTORY {
            history.pop_front();
        }

        if history.len() >= 10 {
            let mut sorted: Vec<u64> = history.iter().copied().collect();
            sorted.sort_unstable();

            let p95_idx = (sorted.len() as f32 * 0.95) as usize;
            let p99_idx = (sorted.len() as f32 * 0.99) as usize;

            self.tick_time_p95_us.store(sorted[p95_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_p99_us.store(sorted[p99_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_max_us.store(sorted.last().copied().unwrap_or(0), Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-format metrics output
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(4096);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        // Tick loop
        metric!("cinnamon_tick_time_microseconds", "Last tick time in microseconds", "gauge",
            self.tick_time_us.load(Ordering::Relaxed));
        metric!("cinnamon_tick_time_p95_microseconds", "95th percentile tick time", "gauge",
            self.tick_time_p95_us.load(Ordering::Relaxed));
        metric!("cinnamon_tick_time_p99_microseconds", "99th percentile tick time", "gauge",
            self.tick_time_p99_us.load(Ordering::Relaxed));
        metric!("cinnamon_tick_time_max_microseconds", "Maximum tick time", "gauge",
            self.tick_time_max_us.load(Ordering::Relaxed));
        metric!("cinnamon_tick_count", "Total ticks processed", "counter",
            self.tick_count.load(Ordering::Relaxed));
        metric!("cinnamon_ticks_overrun_total", "Ticks started after their deadline", "counter",
            self.ticks_overrun.load(Ordering::Relaxed));
        metric!("cinnamon_entities", "Live entities in the store", "gauge",
            self.entity_count.load(Ordering::Relaxed));

        // Connections
        metric!("cinnamon_connections_active", "Connections admitted by the tick loop", "gauge",
            self.connections_active.load(Ordering::Relaxed));
        metric!("cinnamon_connections_accepted_total", "Handshakes accepted", "counter",
            self.connections_accepted.load(Ordering::Relaxed));
        metric!("cinnamon_connections_rejected_total", "Handshakes rejected", "counter",
            self.connections_rejected.load(Ordering::Relaxed));
        metric!("cinnamon_connections_timed_out_total", "Connections torn down after silence", "counter",
            self.connections_timed_out.load(Ordering::Relaxed));

        // Snapshots and commands
        metric!("cinnamon_snapshots_sent_total", "Snapshot frames queued for clients", "counter",
            self.snapshots_sent.load(Ordering::Relaxed));
        metric!("cinnamon_snapshot_bytes_total", "Encoded snapshot bytes", "counter",
            self.snapshot_bytes.load(Ordering::Relaxed));
        metric!("cinnamon_snapshots_dropped_total", "Snapshots evicted from full queues", "counter",
            self.snapshots_dropped.load(Ordering::Relaxed));
        metric!("cinnamon_commands_applied_total", "Client commands applied", "counter",
            self.commands_applied.load(Ordering::Relaxed));
        metric!("cinnamon_commands_rejected_total", "Client commands failing validation", "counter",
            self.commands_rejected.load(Ordering::Relaxed));
        metric!("cinnamon_commands_duplicate_total", "Client commands dropped as already applied", "counter",
            self.commands_duplicate.load(Ordering::Relaxed));

        // Datagrams
        metric!("cinnamon_datagrams_sent_total", "Datagrams sent", "counter",
            self.datagrams_sent.load(Ordering::Relaxed));
        metric!("cinnamon_datagrams_received_total", "Datagrams received", "counter",
            self.datagrams_received.load(Ordering::Relaxed));
        metric!("cinnamon_datagrams_dropped_total", "Malformed or unroutable datagrams", "counter",
            self.datagrams_dropped.load(Ordering::Relaxed));
        metric!("cinnamon_bytes_sent_total", "Total bytes sent", "counter",
            self.bytes_sent.load(Ordering::Relaxed));
        metric!("cinnamon_bytes_received_total", "Total bytes received", "counter",
            self.bytes_received.load(Ordering::Relaxed));
        metric!("cinnamon_uptime_seconds", "Server uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }

    /// Generate JSON format metrics
    pub fn to_json(&self) -> String {
        format!(r#"{{
  "tick": {{
    "time_us": {},
    "p95_us": {},
    "p99_us": {},
    "max_us": {},
    "count": {},
    "overrun": {}
  }},
  "world": {{
    "entities": {}
  }},
  "connections": {{
    "active": {},
    "accepted": {},
    "rejected": {},
    "timed_out": {}
  }},
  "snapshots": {{
    "sent": {},
    "bytes": {},
    "dropped": {}
  }},
  "commands": {{
    "applied": {},
    "rejected": {},
    "duplicate": {}
  }},
  "network": {{
    "datagrams_sent": {},
    "datagrams_received": {},
    "datagrams_dropped": {},
    "bytes_sent": {},
    "bytes_received": {}
  }},
  "uptime_seconds": {}
}}"#,
            self.tick_time_us.load(Ordering::Relaxed),
            self.tick_time_p95_us.load(Ordering::Relaxed),
            self.tick_time_p99_us.load(Ordering::Relaxed),
            self.tick_time_max_us.load(Ordering::Relaxed),
            self.tick_count.load(Ordering::Relaxed),
            self.ticks_overrun.load(Ordering::Relaxed),
            self.entity_count.load(Ordering::Relaxed),
            self.connections_active.load(Ordering::Relaxed),
            self.connections_accepted.load(Ordering::Relaxed),
            self.connections_rejected.load(Ordering::Relaxed),
            self.connections_timed_out.load(Ordering::Relaxed),
            self.snapshots_sent.load(Ordering::Relaxed),
            self.snapshot_bytes.load(Ordering::Relaxed),
            self.snapshots_dropped.load(Ordering::Relaxed),
            self.commands_applied.load(Ordering::Relaxed),
            self.commands_rejected.load(Ordering::Relaxed),
            self.commands_duplicate.load(Ordering::Relaxed),
            self.datagrams_sent.load(Ordering::Relaxed),
            self.datagrams_received.load(Ordering::Relaxed),
            self.datagrams_dropped.load(Ordering::Relaxed),
            self.bytes_sent.load(Ordering::Relaxed),
            self.bytes_received.load(Ordering::Relaxed),
            self.uptime_seconds(),
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(metrics: Arc<Metrics>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];

            match socket.read(&mut buffer).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buffer[..n]);
                    let response = respond(&metrics, &request);
                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        debug!("Failed to write metrics response to {}: {}", peer, e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Failed to read from metrics socket {}: {}", peer, e);
                }
            }
        });
    }
}

fn respond(metrics: &Metrics, request: &str) -> String {
    let (content_type, body) = if request.starts_with("GET /metrics/json") {
        ("application/json", metrics.to_json())
    } else if request.starts_with("GET /metrics") {
        ("text/plain; version=0.0.4", metrics.to_prometheus())
    } else if request.starts_with("GET /health") {
        ("text/plain", "OK".to_string())
    } else {
        return "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string();
    };

    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        content_type,
        body.len(),
        body
    )
}
