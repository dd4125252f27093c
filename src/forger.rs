//! Periodic packet production with queue-aware pacing.
//!
//! The forger assembles a full telemetry packet from the collector, runs it
//! through the sequencer, and enqueues it for upload. The enqueue never
//! blocks; instead the inter-packet delay grows with queue occupancy, from
//! 2/3 s when the uploader keeps up to 5 s when it has stalled. The curve
//! guarantees a known minimum wall-clock time before a dead consumer can
//! overflow the queue; if the queue still fills, the newest packet is
//! dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::collector::DataCollector;
use crate::packet::{FullPacket, Packet, PacketSequencer, Payload};
use crate::watchdog::Heartbeat;

/// Upload queue capacity.
pub const PACKET_QUEUE_CAPACITY: usize = 100;

/// Delay between packets while the queue stays comfortably empty.
const MIN_DELAY_SECS: f32 = 2.0 / 3.0;

/// Delay once the queue is half full or worse.
const MAX_DELAY_SECS: f32 = 5.0;

/// Fill ratio where the delay starts ramping.
const RAMP_START: f32 = 0.2;

/// Fill ratio where the delay saturates.
const RAMP_END: f32 = 0.5;

/// Poll period while waiting for the session handshake to arm the sequencer.
const NOT_READY_POLL: Duration = Duration::from_millis(100);

fn smoothstep(t: f32) -> f32 {
    if t <= 0.0 {
        0.0
    } else if t >= 1.0 {
        1.0
    } else {
        t * t * (3.0 - 2.0 * t)
    }
}

fn inv_lerp(v: f32, a: f32, b: f32) -> f32 {
    if (a - b).abs() < f32::EPSILON {
        0.0
    } else {
        (v - a) / (b - a)
    }
}

/// Delay before the next packet, as a monotone function of queue occupancy.
#[must_use]
pub fn backpressure_delay(fill_ratio: f32) -> Duration {
    let s = smoothstep(inv_lerp(fill_ratio, RAMP_START, RAMP_END));
    Duration::from_secs_f32((1.0 - s) * MIN_DELAY_SECS + s * MAX_DELAY_SECS)
}

struct SequencerInner {
    state: Mutex<PacketSequencer>,
    ready: AtomicBool,
}

/// Shared, mutex-guarded access to the packet sequencer.
///
/// The forger is the only producer, so the mutex is a safety net rather than
/// a contention point; the uploader only takes it to rebind the session.
#[derive(Clone)]
pub struct SequencerHandle {
    inner: Arc<SequencerInner>,
}

impl Default for SequencerHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl SequencerHandle {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SequencerInner {
                state: Mutex::new(PacketSequencer::new()),
                ready: AtomicBool::new(false),
            }),
        }
    }

    /// Rebind to a fresh session: sequence ids restart and the PRNG takes
    /// the backend-issued vector. Arms the forger.
    pub fn reset(&self, iv: [u32; 4]) {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.reset(iv);
        self.inner.ready.store(true, Ordering::SeqCst);
    }

    /// Whether a session handshake has armed the sequencer yet.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    /// Number, stamp and chain a payload.
    pub fn sequence(&self, payload: Payload) -> Packet {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.sequence(payload)
    }

    /// Current `(next_seq_id, prng_state)` snapshot.
    #[must_use]
    pub fn state(&self) -> (u32, [u32; 4]) {
        self.inner
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .state()
    }
}

/// Assemble the periodic full packet from the collector's current readings.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn produce_full_packet(collector: &DataCollector, queued: usize) -> FullPacket {
    let mut temps = [0.0f64; 5];
    collector.get_float_array("can_battery_temp", &mut temps);

    FullPacket {
        speed: collector.get_float("engine_speed", 0.0) as f32,
        battery_temps: temps.map(|t| t as f32),
        voltage: collector.get_float("can_voltage", 0.0) as f32,
        remaining_wh: collector.get_float("can_remaining_wh", 0.0) as f32,
        longitude: collector.get_float("gps_longitude", 0.0) as f32,
        latitude: collector.get_float("gps_latitude", 0.0) as f32,
        free_heap: collector.get_int("rtos_heap_free", 0) as u32,
        allocations: collector.get_int("rtos_heap_allocations", 0) as u32,
        deallocations: collector.get_int("rtos_heap_deallocations", 0) as u32,
        performance: [
            queued as u32,
            collector.get_int("hal_lf_ticks", 0) as u32,
            0,
        ],
    }
}

/// Spawn the forger task.
pub fn spawn_forger(
    collector: Arc<DataCollector>,
    sequencer: SequencerHandle,
    queue: mpsc::Sender<Packet>,
    heartbeat: Heartbeat,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            heartbeat.beat();

            if !sequencer.is_ready() {
                tokio::time::sleep(NOT_READY_POLL).await;
                continue;
            }

            #[allow(clippy::cast_precision_loss)]
            let queued = queue.max_capacity() - queue.capacity();
            let payload = Payload::Full(produce_full_packet(&collector, queued));
            let packet = sequencer.sequence(payload);

            if let Err(e) = queue.try_send(packet) {
                match e {
                    mpsc::error::TrySendError::Full(_) => {
                        warn!("packet queue full, dropping freshly forged packet");
                    }
                    mpsc::error::TrySendError::Closed(_) => {
                        debug!("packet queue closed, forger exiting");
                        return;
                    }
                }
            }

            #[allow(clippy::cast_precision_loss)]
            let fill_ratio = (queue.max_capacity() - queue.capacity()) as f32
                / queue.max_capacity() as f32;
            tokio::time::sleep(backpressure_delay(fill_ratio)).await;
        }
    })
}

/// Drain up to `max` packets without blocking. Used by the uploader to form
/// a batch.
pub fn drain_pending(queue: &mut mpsc::Receiver<Packet>, max: usize) -> Vec<Packet> {
    let mut out = Vec::with_capacity(max.min(PACKET_QUEUE_CAPACITY));
    while out.len() < max {
        match queue.try_recv() {
            Ok(packet) => out.push(packet),
            Err(_) => break,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{xoshiro_next, INITIAL_PRNG_STATE};

    const IV: [u32; 4] = [0xDEAD_BEEF, 0xCAFE_BABE, 0xDEAD_C0DE, 0x8BAD_F00D];

    #[test]
    fn test_delay_floor_and_ceiling() {
        assert!((backpressure_delay(0.0).as_secs_f32() - MIN_DELAY_SECS).abs() < 1e-3);
        assert!((backpressure_delay(0.2).as_secs_f32() - MIN_DELAY_SECS).abs() < 1e-3);
        assert!((backpressure_delay(0.5).as_secs_f32() - MAX_DELAY_SECS).abs() < 1e-3);
        assert!((backpressure_delay(1.0).as_secs_f32() - MAX_DELAY_SECS).abs() < 1e-3);
    }

    #[test]
    fn test_delay_is_monotone() {
        let mut last = backpressure_delay(0.0);
        for i in 1..=100 {
            #[allow(clippy::cast_precision_loss)]
            let next = backpressure_delay(i as f32 / 100.0);
            assert!(next >= last, "delay must not shrink as the queue fills");
            last = next;
        }
    }

    #[test]
    fn test_sequencer_handle_arms_on_reset() {
        let handle = SequencerHandle::new();
        assert!(!handle.is_ready());
        assert_eq!(handle.state(), (0, INITIAL_PRNG_STATE));
        handle.reset(IV);
        assert!(handle.is_ready());
        assert_eq!(handle.state(), (0, IV));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forger_chains_packets_from_iv() {
        let collector = Arc::new(DataCollector::new());
        let sequencer = SequencerHandle::new();
        sequencer.reset(IV);

        let (tx, mut rx) = mpsc::channel(PACKET_QUEUE_CAPACITY);
        let task = spawn_forger(collector, sequencer, tx, Heartbeat::standalone());

        let mut reference = IV;
        for expected_seq in 0..3u32 {
            let packet = rx.recv().await.expect("forger should produce packets");
            assert_eq!(packet.sequence_id, expected_seq);
            assert_eq!(packet.rng_state, xoshiro_next(&mut reference));
        }
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_forger_waits_for_handshake() {
        let collector = Arc::new(DataCollector::new());
        let sequencer = SequencerHandle::new();

        let (tx, mut rx) = mpsc::channel(PACKET_QUEUE_CAPACITY);
        let task = spawn_forger(collector, sequencer.clone(), tx, Heartbeat::standalone());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err(), "nothing may be forged pre-handshake");

        sequencer.reset(IV);
        let packet = rx.recv().await.expect("armed forger should produce");
        assert_eq!(packet.sequence_id, 0);
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_fill_time_matches_backpressure_curve() {
        let collector = Arc::new(DataCollector::new());
        let sequencer = SequencerHandle::new();
        sequencer.reset(IV);

        let (tx, _rx) = mpsc::channel(PACKET_QUEUE_CAPACITY);
        let probe = tx.clone();
        let task = spawn_forger(collector, sequencer, tx, Heartbeat::standalone());

        let start = tokio::time::Instant::now();
        while probe.capacity() > 0 {
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        let elapsed = start.elapsed().as_secs_f32();
        task.abort();

        // the forger measures occupancy after each push, so packet i sleeps
        // for delay((i + 1) / capacity)
        #[allow(clippy::cast_precision_loss)]
        let analytic: f32 = (0..PACKET_QUEUE_CAPACITY)
            .map(|i| {
                backpressure_delay((i + 1) as f32 / PACKET_QUEUE_CAPACITY as f32).as_secs_f32()
            })
            .sum();

        // the last packet's sleep has not elapsed when the queue fills
        let expected = analytic
            - backpressure_delay(1.0).as_secs_f32();
        assert!(
            (elapsed - expected).abs() <= expected * 0.1,
            "elapsed {elapsed}s vs analytic {expected}s"
        );
    }

    #[test]
    fn test_drain_pending_respects_limit() {
        let (tx, mut rx) = mpsc::channel(PACKET_QUEUE_CAPACITY);
        let sequencer = SequencerHandle::new();
        sequencer.reset(IV);
        for _ in 0..15 {
            let collector = DataCollector::new();
            tx.try_send(sequencer.sequence(Payload::Full(produce_full_packet(&collector, 0))))
                .unwrap();
        }
        assert_eq!(drain_pending(&mut rx, 10).len(), 10);
        assert_eq!(drain_pending(&mut rx, 10).len(), 5);
        assert!(drain_pending(&mut rx, 10).is_empty());
    }
}
