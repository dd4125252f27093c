//! The AT-protocol engine.
//!
//! One task owns the wire: it frames received bytes into lines, parses them,
//! pairs solicited replies with the single active command, and broadcasts
//! every reply to registered snooper modules. Callers talk to it through a
//! cloneable [`CoordinatorHandle`] — commands are serialized through a
//! channel and answered over a per-call `oneshot`, so exactly one command is
//! outstanding on the modem at any time and replies can never be
//! misattributed.
//!
//! A boot-class reply (`RDY`, `+CFUN`, `+CPIN`, `Call Ready`, `SMS Ready`)
//! arriving while its readiness flag is already set means the modem rebooted
//! behind our back. The coordinator then fails the active command with
//! whatever was buffered and every queued command with an empty vector;
//! callers treat an unterminated vector as a soft failure and the upload FSM
//! reinitializes the device.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use super::reply::{parse_reply, Solicitation};
use super::{Command, GsmModule, Reply};
use crate::framer::LineFramer;
use crate::watchdog::Heartbeat;

/// Queue depth for inbound bytes and pending commands.
const QUEUE_DEPTH: usize = 32;

/// Received bytes are sliced into chunks of at most this size before being
/// queued, bounding the work done on the receive path.
pub const DATA_CHUNK: usize = 32;

/// Line buffer handed to the framer. Longer modem lines are truncated.
const LINE_BUFFER: usize = 1024;

/// Device readiness flags published by the coordinator, one atomic per flag.
#[derive(Default)]
pub struct LinkState {
    ready: AtomicBool,
    functional: AtomicBool,
    have_sim: AtomicBool,
    call_ready: AtomicBool,
    sms_ready: AtomicBool,
    inconsistent: AtomicBool,
}

impl LinkState {
    pub fn ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn functional(&self) -> bool {
        self.functional.load(Ordering::SeqCst)
    }

    pub fn have_sim(&self) -> bool {
        self.have_sim.load(Ordering::SeqCst)
    }

    pub fn call_ready(&self) -> bool {
        self.call_ready.load(Ordering::SeqCst)
    }

    pub fn sms_ready(&self) -> bool {
        self.sms_ready.load(Ordering::SeqCst)
    }

    /// Latched when a modem reboot is observed mid-session. Stays set until
    /// [`LinkState::reset`] so the upload FSM cannot miss it.
    pub fn inconsistent(&self) -> bool {
        self.inconsistent.load(Ordering::SeqCst)
    }

    /// Clear everything, including the inconsistency latch. Called by the
    /// FSM at the start of each device initialization.
    pub fn reset(&self) {
        self.clear_boot_flags();
        self.inconsistent.store(false, Ordering::SeqCst);
    }

    fn clear_boot_flags(&self) {
        self.ready.store(false, Ordering::SeqCst);
        self.functional.store(false, Ordering::SeqCst);
        self.have_sim.store(false, Ordering::SeqCst);
        self.call_ready.store(false, Ordering::SeqCst);
        self.sms_ready.store(false, Ordering::SeqCst);
    }
}

/// A command waiting in (or at the head of) the coordinator queue.
struct PendingCommand {
    origin: &'static str,
    reply_tx: oneshot::Sender<Vec<Reply>>,
    command: Command,
}

enum QueueItem {
    /// A chunk of received bytes from the UART.
    Data(Vec<u8>),
    /// A newly enqueued command.
    Pending(PendingCommand),
    /// A synthetic reply for the snooper broadcast only.
    Forged(Reply),
}

/// Cloneable front door to the coordinator task.
#[derive(Clone)]
pub struct CoordinatorHandle {
    queue: mpsc::Sender<QueueItem>,
    link: Arc<LinkState>,
}

impl CoordinatorHandle {
    /// Enqueue a command and wait for its `OK`/`ERROR`-terminated reply
    /// vector. An empty vector means the command was failed without reaching
    /// the modem (coordinator gone, or the link was flagged inconsistent).
    pub async fn send(&self, origin: &'static str, command: Command) -> Vec<Reply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let pending = PendingCommand {
            origin,
            reply_tx,
            command,
        };
        if self.queue.send(QueueItem::Pending(pending)).await.is_err() {
            warn!("coordinator gone, {origin} command dropped");
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    /// Inject a synthetic reply into the snooper broadcast. It never touches
    /// the active command's buffer.
    pub fn forge_reply(&self, reply: Reply) {
        if self.queue.try_send(QueueItem::Forged(reply)).is_err() {
            debug!("coordinator queue full, forged reply dropped");
        }
    }

    /// Receive-path entry point: slice a burst of received bytes into
    /// bounded chunks and enqueue them without blocking. Called from the
    /// UART reader; drops (with a warning) if the queue is saturated.
    pub fn push_bytes(&self, bytes: &[u8]) {
        for chunk in bytes.chunks(DATA_CHUNK) {
            if self.queue.try_send(QueueItem::Data(chunk.to_vec())).is_err() {
                warn!("coordinator queue full, dropping {} received bytes", chunk.len());
            }
        }
    }

    /// The readiness flags the coordinator maintains.
    #[must_use]
    pub fn link(&self) -> Arc<LinkState> {
        Arc::clone(&self.link)
    }
}

/// The coordinator task state. Construct, register modules, then [`spawn`].
///
/// [`spawn`]: Coordinator::spawn
pub struct Coordinator {
    queue: mpsc::Receiver<QueueItem>,
    wire: mpsc::Sender<Vec<u8>>,
    link: Arc<LinkState>,
    modules: Vec<Arc<dyn GsmModule>>,
    framer: LineFramer,
    heartbeat: Heartbeat,
    active: Option<PendingCommand>,
    reply_buffer: Vec<Reply>,
    unsent: VecDeque<PendingCommand>,
}

impl Coordinator {
    /// Create a coordinator writing command bytes to `wire` (the UART
    /// transmit channel), plus its handle.
    #[must_use]
    pub fn new(wire: mpsc::Sender<Vec<u8>>) -> (Self, CoordinatorHandle) {
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_DEPTH);
        let link = Arc::new(LinkState::default());
        let coordinator = Self {
            queue: queue_rx,
            wire,
            link: Arc::clone(&link),
            modules: Vec::new(),
            framer: LineFramer::new(LINE_BUFFER, b"\r\n"),
            heartbeat: Heartbeat::standalone(),
            active: None,
            reply_buffer: Vec::new(),
            unsent: VecDeque::new(),
        };
        let handle = CoordinatorHandle {
            queue: queue_tx,
            link,
        };
        (coordinator, handle)
    }

    /// Add a passive listener that sees every parsed reply.
    pub fn register_module(&mut self, module: Arc<dyn GsmModule>) {
        self.modules.push(module);
    }

    /// Put the task under watchdog supervision. The gauge beats once per
    /// queue item; the periodic ticker guarantees items keep coming, so a
    /// coordinator wedged on a dead wire goes visibly stale.
    pub fn set_heartbeat(&mut self, heartbeat: Heartbeat) {
        self.heartbeat = heartbeat;
    }

    /// Run the coordinator until every handle is dropped.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        while let Some(item) = self.queue.recv().await {
            self.heartbeat.beat();
            match item {
                QueueItem::Data(bytes) => self.on_data(&bytes).await,
                QueueItem::Pending(cmd) => self.new_command(cmd).await,
                QueueItem::Forged(reply) => self.snoop(&reply),
            }
        }
        debug!("all coordinator handles dropped, task exiting");
    }

    async fn on_data(&mut self, bytes: &[u8]) {
        let mut lines: Vec<(Vec<u8>, bool)> = Vec::new();
        self.framer
            .feed(bytes, |line, overflowed| lines.push((line.to_vec(), overflowed)));

        for (raw, overflowed) in lines {
            if overflowed {
                warn!("modem line was cut short by a buffer overflow");
            }
            if raw.is_empty() {
                continue;
            }
            let line = String::from_utf8_lossy(&raw);
            match parse_reply(&line) {
                Ok(reply) => self.new_reply(reply).await,
                Err(reason) => {
                    warn!("failed to parse modem line: {reason}");
                    warn!("the errored line was {line:?}");
                }
            }
        }
    }

    async fn new_command(&mut self, cmd: PendingCommand) {
        if self.link.inconsistent() {
            warn!(
                "link inconsistent, failing \"{}\" from {} without sending",
                cmd.command.name(),
                cmd.origin
            );
            fulfill(cmd, Vec::new());
            return;
        }
        self.unsent.push_back(cmd);
        self.promote_next().await;
    }

    async fn new_reply(&mut self, reply: Reply) {
        self.update_link(&reply);

        if self.link.inconsistent() {
            self.drain_inconsistent();
            return;
        }

        self.snoop(&reply);

        // Two-phase HTTPDATA: the modem opened bulk-data mode, stream the
        // payload now, raw, with no trailing CRLF.
        if let (Some(active), Reply::HttpReadyForData) = (&self.active, &reply) {
            if let Command::HttpData { payload } = &active.command {
                debug!("modem ready for HTTPDATA, streaming {} payload bytes", payload.len());
                let payload = payload.clone();
                if self.wire.send(payload).await.is_err() {
                    warn!("uart writer gone, HTTPDATA payload not sent");
                }
            }
        }

        let solicited = match reply.solicitation() {
            Solicitation::Never => false,
            Solicitation::Always => true,
            Solicitation::For(kind) => self
                .active
                .as_ref()
                .is_some_and(|active| active.command.kind() == kind),
        };

        if !solicited {
            debug!("unsolicited \"{}\" reply not pushed to the buffer", reply.name());
            return;
        }

        if self.active.is_none() {
            warn!("\"{}\" reply arrived with no active command", reply.name());
            return;
        }

        let terminator = reply.is_terminator();
        self.reply_buffer.push(reply);

        if !terminator {
            return;
        }

        if let Some(cmd) = self.active.take() {
            fulfill(cmd, std::mem::take(&mut self.reply_buffer));
            self.promote_next().await;
        }
    }

    /// Latch readiness flags from boot-class replies. A flag that was
    /// already set means the modem restarted mid-session.
    fn update_link(&self, reply: &Reply) {
        let flag = match reply {
            Reply::Ready => Some(&self.link.ready),
            Reply::CFun { .. } => Some(&self.link.functional),
            Reply::CPin { .. } => Some(&self.link.have_sim),
            Reply::CallReady => Some(&self.link.call_ready),
            Reply::SmsReady => Some(&self.link.sms_ready),
            _ => None,
        };
        if let Some(flag) = flag {
            if flag.swap(true, Ordering::SeqCst) {
                error!(
                    "\"{}\" arrived with its readiness flag already set, assuming a modem reboot",
                    reply.name()
                );
                self.link.inconsistent.store(true, Ordering::SeqCst);
            }
        }
    }

    /// Fail everything in flight. The active command gets whatever was
    /// buffered so far; queued commands get empty vectors. The inconsistency
    /// latch itself is left for the FSM to clear.
    fn drain_inconsistent(&mut self) {
        if self.active.is_some() || !self.unsent.is_empty() {
            error!(
                "modem reboot with {} active and {} queued commands, draining",
                usize::from(self.active.is_some()),
                self.unsent.len()
            );
        }
        if let Some(cmd) = self.active.take() {
            fulfill(cmd, std::mem::take(&mut self.reply_buffer));
        }
        self.reply_buffer.clear();
        while let Some(cmd) = self.unsent.pop_front() {
            fulfill(cmd, Vec::new());
        }
        self.link.clear_boot_flags();
    }

    fn snoop(&self, reply: &Reply) {
        for module in &self.modules {
            module.incoming_reply(reply);
        }
    }

    /// If the wire is idle, send the next queued command.
    async fn promote_next(&mut self) {
        while self.active.is_none() {
            let Some(next) = self.unsent.pop_front() else {
                return;
            };
            debug!("sending a \"{}\" command for {}", next.command.name(), next.origin);
            let line = format!("{}\r\n", next.command);
            if self.wire.send(line.into_bytes()).await.is_ok() {
                self.active = Some(next);
            } else {
                warn!("uart writer gone, failing \"{}\"", next.command.name());
                fulfill(next, Vec::new());
            }
        }
    }
}

fn fulfill(cmd: PendingCommand, replies: Vec<Reply>) {
    // the caller may have given up waiting; that is not an error
    let _ = cmd.reply_tx.send(replies);
}
