//! Periodic client-count reporting: a publisher task samples the roster and
//! sends the count over a byte channel, a logger task receives and logs it.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tether_core::{Handle, Runtime};

use crate::roster::Roster;

const STATS_CAPACITY: usize = 16;

pub struct Monitor {
    stats: Handle,
    publisher: Handle,
    logger: Handle,
    interval: Duration,
}

fn encode(count: u64) -> Vec<u8> {
    count.to_le_bytes().to_vec()
}

fn decode(message: &[u8]) -> Option<u64> {
    Some(u64::from_le_bytes(message.try_into().ok()?))
}

/// Sample the roster every `interval` until `stats` is closed.
pub fn spawn_publisher(rt: &Arc<Runtime>, roster: Arc<Roster>, stats: Handle, interval: Duration) -> Handle {
    let rt_task = rt.clone();
    rt.tasks().launch_detached(move || loop {
        thread::sleep(interval);
        let count = roster.len() as u64;
        if rt_task.byte_channels().send(stats, encode(count)).is_err() {
            tracing::debug!(channel = %stats, "stats channel closed, publisher exiting");
            break;
        }
    })
}

/// Log each change in the published count until `stats` is closed and drained.
pub fn spawn_logger(rt: &Arc<Runtime>, stats: Handle) -> Handle {
    let rt_task = rt.clone();
    rt.tasks().launch_detached(move || {
        let mut last = None;
        while let Ok(message) = rt_task.byte_channels().recv(stats) {
            match decode(&message) {
                Some(count) if last != Some(count) => {
                    tracing::info!(clients = count, "connected clients");
                    last = Some(count);
                }
                Some(_) => {}
                None => tracing::warn!(len = message.len(), "malformed stats message"),
            }
        }
    })
}

impl Monitor {
    pub fn start(rt: &Arc<Runtime>, roster: Arc<Roster>, interval: Duration) -> Monitor {
        let stats = rt.byte_channels().create(STATS_CAPACITY);
        Monitor {
            stats,
            publisher: spawn_publisher(rt, roster, stats, interval),
            logger: spawn_logger(rt, stats),
            interval,
        }
    }

    /// Close the stats channel and wait for both tasks. Returns false if the
    /// publisher did not notice within a couple of intervals.
    pub fn stop(self, rt: &Runtime) -> bool {
        rt.byte_channels().close(self.stats);
        let logger_done = rt.tasks().wait(self.logger).is_ok();
        let publisher_done = rt
            .tasks()
            .wait_timeout(self.publisher, self.interval * 2 + Duration::from_secs(1))
            .is_ok();
        rt.tasks().cleanup(self.logger);
        rt.tasks().cleanup(self.publisher);
        logger_done && publisher_done
    }
}
