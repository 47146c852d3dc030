use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};
use crate::connection::ConnectionHandle;
use crate::error::TransportResult;
use crate::registry::Registry;
use crate::send_pipeline::Delivery;
use crate::tick::{Clock, Tick};

/// A [Registry] behind the single critical section that serializes all registry mutation and
///  socket I/O, shared between a poll loop and application code.
///
/// Neither polling nor sending ever waits for the other: A poll that finds the registry busy is
///  skipped and recorded, and the next send that gets hold of the registry runs it. A send that
///  finds the registry busy still queues its record, but leaves transmission to the next poll.
#[derive(Clone)]
pub struct SharedRegistry {
    registry: Arc<Mutex<Registry>>,
    clock: Arc<dyn Clock>,
    missed_polls: Arc<AtomicU32>,
}

impl SharedRegistry {
    pub fn new(registry: Registry, clock: Arc<dyn Clock>) -> SharedRegistry {
        SharedRegistry {
            registry: Arc::new(Mutex::new(registry)),
            clock,
            missed_polls: Default::default(),
        }
    }

    pub fn now(&self) -> Tick {
        self.clock.now()
    }

    /// Exclusive access for everything except sending and polling. The registry is never held
    ///  for longer than a poll pass.
    pub async fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().await
    }

    pub fn missed_polls(&self) -> u32 {
        self.missed_polls.load(Ordering::Acquire)
    }

    pub async fn send(&self, handle: ConnectionHandle, data: &[u8], delivery: Delivery) -> TransportResult<usize> {
        if let Ok(mut registry) = self.registry.try_lock() {
            let now = self.clock.now();
            let result = registry.send(handle, data, delivery, now);
            if self.missed_polls.swap(0, Ordering::AcqRel) != 0 {
                debug!("running a poll that was skipped while the registry was busy");
                registry.poll_tick(now);
            }
            return result;
        }

        trace!("registry is busy, connection {} transmits with the next poll", handle);
        let mut registry = self.registry.lock().await;
        registry.enqueue(handle, data, delivery, self.clock.now())
    }

    /// A single poll pass, or `None` if the registry is busy
    pub fn try_poll(&self) -> Option<usize> {
        match self.registry.try_lock() {
            Ok(mut registry) => Some(registry.poll_tick(self.clock.now())),
            Err(_) => {
                trace!("registry is busy - skipping poll");
                self.missed_polls.fetch_add(1, Ordering::AcqRel);
                None
            }
        }
    }

    /// Polls at a fixed interval until the returned handle is aborted
    pub fn spawn_poll_loop(&self, interval: Duration) -> JoinHandle<()> {
        info!("starting poll loop with an interval of {:?}", interval);
        let shared = self.clone();
        tokio::spawn(async move {
            let mut ticks = time::interval(interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                shared.try_poll();
            }
        })
    }
}
