#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]

//! racetel library — the on-vehicle telemetry uplink, split into the
//! building blocks the binary wires together:
//!
//! - `gsm` — AT command rendering, reply parsing, and the coordinator that
//!   serializes commands over the modem UART
//! - `uart` — serial transport threads and the receive-ring model
//! - `framer` — delimiter framing of the raw byte stream
//! - `collector` — the keyed telemetry store producers write into
//! - `packet` / `forger` — signed-record model, sequencing, paced production
//! - `uplink` — boot, session handshake, upload loop and retry policy
//! - `watchdog` — post-mortem record and task-health supervision
//! - `config` — TOML configuration loading

pub mod collector;
pub mod config;
pub mod forger;
pub mod framer;
pub mod gsm;
pub mod heap;
pub mod hexspan;
pub mod packet;
pub mod timebase;
pub mod uart;
pub mod uplink;
pub mod watchdog;

// Re-export key types at crate root for convenience.
pub use collector::DataCollector;
pub use config::Config;
pub use forger::SequencerHandle;
pub use gsm::{Command, Coordinator, CoordinatorHandle, Reply};
pub use packet::{Packet, PacketSequencer};
pub use uplink::Uplink;
