//! Fixed-rate driver for the tick loop
//!
//! The loop lives on its own named thread. The control channel doubles as
//! the inter-tick timer: `recv_deadline` sleeps until the next tick is due
//! and wakes early for control messages.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use crate::game::tick_loop::{LoopState, ServerEvent, TickLoop};
use crate::metrics::Metrics;

/// Requests sent to the tick thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    /// Stop accepting connections, stop once reliable traffic is flushed
    Drain,
    /// Stop at once
    Stop,
}

pub struct TickRunner {
    control: Sender<LoopControl>,
    handle: JoinHandle<LoopState>,
}

impl TickRunner {
    /// Start ticking `tick_loop` every `interval` on a dedicated thread
    ///
    /// `on_events` runs on the tick thread after every tick that produced
    /// events; keep it short.
    pub fn spawn<F>(
        tick_loop: TickLoop,
        interval: Duration,
        metrics: Arc<Metrics>,
        on_events: F,
    ) -> std::io::Result<Self>
    where
        F: FnMut(Vec<ServerEvent>) + Send + 'static,
    {
        let (control, control_rx) = unbounded();
        let handle = thread::Builder::new()
            .name("tick-loop".to_string())
            .spawn(move || run(tick_loop, interval, control_rx, metrics, on_events))?;

        Ok(Self { control, handle })
    }

    pub fn drain(&self) {
        if self.control.send(LoopControl::Drain).is_err() {
            debug!("Tick loop already exited");
        }
    }

    pub fn stop(&self) {
        if self.control.send(LoopControl::Stop).is_err() {
            debug!("Tick loop already exited");
        }
    }

    /// The tick thread has returned
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the tick thread and return the loop's final state
    pub fn join(self) -> LoopState {
        match self.handle.join() {
            Ok(state) => state,
            Err(_) => {
                error!("Tick loop thread panicked");
                LoopState::Stopped
            }
        }
    }
}

fn run<F>(
    mut tick_loop: TickLoop,
    interval: Duration,
    control: Receiver<LoopControl>,
    metrics: Arc<Metrics>,
    mut on_events: F,
) -> LoopState
where
    F: FnMut(Vec<ServerEvent>),
{
    tick_loop.start();
    let mut deadline = Instant::now() + interval;

    loop {
        match control.recv_deadline(deadline) {
            Ok(LoopControl::Drain) => {
                tick_loop.drain();
                continue;
            }
            Ok(LoopControl::Stop) | Err(RecvTimeoutError::Disconnected) => {
                tick_loop.stop();
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }

        let now = Instant::now();
        let late = now.saturating_duration_since(deadline);
        if late > interval {
            // Fell behind by more than a whole tick: skip instead of bursting
            warn!("Tick loop {:?} behind schedule", late);
            Metrics::incr(&metrics.ticks_overrun);
            deadline = now;
        }

        let events = tick_loop.tick(now);
        if !events.is_empty() {
            on_events(events);
        }
        if tick_loop.state() == LoopState::Stopped {
            break;
        }

        deadline += interval;
    }

    info!("Tick thread exiting at tick {}", tick_loop.store().tick());
    tick_loop.state()
}
