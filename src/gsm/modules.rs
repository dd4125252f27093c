//! Passive coordinator modules.
//!
//! Snoopers see every parsed reply; they never own a command. The logger
//! exists purely for visibility, the ticker forges a periodic synthetic
//! reply so other snoopers observe time passing even on a silent wire.

use std::time::Duration;

use tracing::debug;

use super::{CoordinatorHandle, GsmModule, Reply};
use crate::timebase;

/// Logs every reply at debug level.
pub struct ReplyLogger;

impl GsmModule for ReplyLogger {
    fn incoming_reply(&self, reply: &Reply) {
        debug!("incoming \"{}\" reply", reply.name());
    }
}

/// Interval between forged [`Reply::PeriodicTick`]s.
const TICK_PERIOD: Duration = Duration::from_millis(500);

/// Spawn the ticker task. Runs until the coordinator goes away.
pub fn spawn_ticker(gsm: CoordinatorHandle) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(TICK_PERIOD);
        loop {
            interval.tick().await;
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let ms = timebase::ticks_ms() as u32;
            gsm.forge_reply(Reply::PeriodicTick { ms });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gsm::Coordinator;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct TickCounter(AtomicUsize);

    impl GsmModule for TickCounter {
        fn incoming_reply(&self, reply: &Reply) {
            if matches!(reply, Reply::PeriodicTick { .. }) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_forges_periodic_replies() {
        let (wire_tx, _wire_rx) = mpsc::channel(8);
        let (mut coordinator, handle) = Coordinator::new(wire_tx);
        let counter = Arc::new(TickCounter(AtomicUsize::new(0)));
        coordinator.register_module(counter.clone());
        coordinator.spawn();

        let ticker = spawn_ticker(handle.clone());
        tokio::time::sleep(Duration::from_millis(2600)).await;
        ticker.abort();

        // give the coordinator a chance to drain its queue
        tokio::task::yield_now().await;
        assert!(counter.0.load(Ordering::SeqCst) >= 4);
    }
}
