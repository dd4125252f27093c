//! The upload state machine.
//!
//! One task drives the whole modem lifecycle: boot the device, open the
//! bearer, attach GPRS, run the session-reset handshake that rebinds the
//! sequencer to an authenticated session, then drain the packet queue and
//! POST signed batches until something breaks. Failures are soft — the loop
//! resets internal state and starts over; the task never exits.
//!
//! All waiting is done by polling coordinator-maintained readiness flags
//! with bounded iteration counts; `send` itself has no timeout. Every poll
//! loop beats the task's watchdog heartbeat, so a modem exchange that never
//! terminates is caught by the watchdog rather than hanging forever.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::{Signature, SigningKey};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::forger::{self, SequencerHandle};
use crate::gsm::extract::{extract_replies, extract_single, Okay};
use crate::gsm::reply::{
    BearerParams, GprsStatus, HttpActionDone, HttpReadHeader, PositionTime, ResetChallenge,
    ResetFailure, ResetSuccess,
};
use crate::gsm::{
    BearerProfile, BearerStatus, CfunType, Command, CoordinatorHandle, ErrorVerbosity, GsmModule,
    HttpMethod, Reply,
};
use crate::packet::Packet;
use crate::timebase;
use crate::watchdog::Heartbeat;

const ORIGIN: &str = "uplink";

/// The bearer profile everything runs over.
const PROFILE: BearerProfile = BearerProfile::Profile0;

/// Settling time after power-on before talking to the modem.
const BOOT_SETTLE: Duration = Duration::from_secs(2);

/// Flag-poll period.
const POLL: Duration = Duration::from_millis(100);

/// Polls while waiting for the boot `RDY` (5 s).
const READY_POLLS: usize = 50;

/// Polls for readiness flags, bearer and GPRS states (15 s each).
const FLAG_POLLS: usize = 150;

/// Consecutive upload failures before the device is reinitialized.
const MAX_UPLOAD_FAILURES: usize = 5;

/// Delay between session restarts.
const RETRY_DELAY: Duration = Duration::from_millis(2500);

/// Idle sleep when the packet queue has nothing to drain.
const UPLOAD_IDLE: Duration = Duration::from_millis(667);

/// Uplink parameters lifted out of the main configuration.
#[derive(Debug, Clone)]
pub struct UplinkConfig {
    pub apn: String,
    pub user_agent: String,
    pub reset_endpoint: String,
    pub packet_endpoint: String,
    pub batch_size: usize,
    pub http_timeout_decis: usize,
}

/// Snooper capturing the unsolicited `+HTTPACTION` completion notice into a
/// slot the FSM polls.
#[derive(Default)]
pub struct HttpActionWatcher {
    slot: Mutex<Option<HttpActionDone>>,
}

impl HttpActionWatcher {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn take(&self) -> Option<HttpActionDone> {
        self.slot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }

    fn clear(&self) {
        let _ = self.take();
    }
}

impl GsmModule for HttpActionWatcher {
    fn incoming_reply(&self, reply: &Reply) {
        if let Reply::HttpActionDone(action) = reply {
            let mut slot = self
                .slot
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *slot = Some(*action);
        }
    }
}

/// The uploader task. Construct with [`Uplink::new`], then [`Uplink::spawn`].
pub struct Uplink {
    gsm: CoordinatorHandle,
    sequencer: SequencerHandle,
    queue: mpsc::Receiver<Packet>,
    watcher: Arc<HttpActionWatcher>,
    key: SigningKey,
    config: UplinkConfig,
    heartbeat: Heartbeat,
}

impl Uplink {
    #[must_use]
    pub fn new(
        gsm: CoordinatorHandle,
        sequencer: SequencerHandle,
        queue: mpsc::Receiver<Packet>,
        watcher: Arc<HttpActionWatcher>,
        key: SigningKey,
        config: UplinkConfig,
        heartbeat: Heartbeat,
    ) -> Self {
        Self {
            gsm,
            sequencer,
            queue,
            watcher,
            key,
            config,
            heartbeat,
        }
    }

    /// Run the retry loop forever.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        for attempt in 1u64.. {
            self.heartbeat.beat();
            self.gsm.link().reset();
            self.watcher.clear();

            if let Err(reason) = self.session().await {
                warn!("telemetry session ended: {reason}");
            }

            warn!(
                "waiting {}ms before restarting for retry #{attempt}",
                RETRY_DELAY.as_millis()
            );
            self.heartbeat.beat();
            tokio::time::sleep(RETRY_DELAY).await;
        }
    }

    async fn session(&mut self) -> Result<(), String> {
        self.initialize_device().await?;
        let iv = self.initialize_session().await?;
        self.sequencer.reset(iv);

        // Packets forged under a previous session would fail verification
        // against the fresh sequencing state; drop them.
        let stale = forger::drain_pending(&mut self.queue, forger::PACKET_QUEUE_CAPACITY);
        if !stale.is_empty() {
            debug!("discarded {} packets from a previous session", stale.len());
        }

        info!("session established, uploading telemetry");
        self.upload_loop().await
    }

    /// Bring the modem from power-on (or an unknown state) to an attached,
    /// bearer-connected baseline, and pull network time.
    async fn initialize_device(&self) -> Result<(), String> {
        tokio::time::sleep(BOOT_SETTLE).await;

        // A modem that was already powered never announces RDY again.
        let link = self.gsm.link();
        let mut was_open = true;
        for _ in 0..READY_POLLS {
            self.heartbeat.beat();
            if link.ready() {
                was_open = false;
                break;
            }
            tokio::time::sleep(POLL).await;
        }
        info!("the modem was{} already open", if was_open { "" } else { "n't" });

        let _ = self
            .gsm
            .send(ORIGIN, Command::SetErrorVerbosity(ErrorVerbosity::Verbose))
            .await;

        // Reboot into full functionality. The readiness flags re-latch as
        // the modem comes back, so clear them right after the OK.
        self.expect_ok(Command::Cfun {
            mode: CfunType::Full,
            reset: true,
        })
        .await?;
        link.reset();

        let mut phone_ready = false;
        for _ in 0..FLAG_POLLS {
            self.heartbeat.beat();
            if link.call_ready() && link.sms_ready() {
                phone_ready = true;
                break;
            }
            tokio::time::sleep(POLL).await;
        }
        if !phone_ready {
            return Err("timed out waiting for call/SMS readiness".into());
        }

        self.expect_ok(Command::SetBearerParam {
            profile: PROFILE,
            tag: "Contype".into(),
            value: "GPRS".into(),
        })
        .await?;
        self.expect_ok(Command::SetBearerParam {
            profile: PROFILE,
            tag: "APN".into(),
            value: self.config.apn.clone(),
        })
        .await?;
        // Opening an already-open bearer reports ERROR; the query below is
        // what decides.
        let _ = self.gsm.send(ORIGIN, Command::OpenBearer { profile: PROFILE }).await;

        let mut connected = false;
        for _ in 0..FLAG_POLLS {
            self.heartbeat.beat();
            tokio::time::sleep(POLL).await;
            let replies = self
                .gsm
                .send(ORIGIN, Command::QueryBearerParams { profile: PROFILE })
                .await;
            if let Some(params) = extract_single::<BearerParams>(replies) {
                if params.status == BearerStatus::Connected && params.profile == PROFILE {
                    connected = true;
                    break;
                }
            }
        }
        if !connected {
            return Err("bearer did not reach the connected state".into());
        }

        let _ = self.gsm.send(ORIGIN, Command::AttachGprs).await;

        let mut attached = false;
        for _ in 0..FLAG_POLLS {
            self.heartbeat.beat();
            tokio::time::sleep(POLL).await;
            let replies = self.gsm.send(ORIGIN, Command::QueryGprs).await;
            if let Some(status) = extract_single::<GprsStatus>(replies) {
                if status.attached {
                    attached = true;
                    break;
                }
            }
        }
        if !attached {
            return Err("GPRS attach did not complete".into());
        }

        // Pull network position/time; packets are stamped against it.
        let replies = self
            .gsm
            .send(ORIGIN, Command::QueryPositionTime { profile: PROFILE })
            .await;
        let pos = extract_single::<PositionTime>(replies).ok_or("position/time query failed")?;
        debug!("setting time to {}", pos.unix_time);
        timebase::set_time(i64::from(pos.unix_time));

        Ok(())
    }

    /// Run the challenge/response handshake; returns the PRNG vector the
    /// backend bound to this session.
    async fn initialize_session(&self) -> Result<[u32; 4], String> {
        let (_, replies) = self
            .http_request(&self.config.reset_endpoint, HttpMethod::Get, None)
            .await?;
        let (_, challenge, Okay) =
            extract_replies::<(HttpReadHeader, ResetChallenge, Okay)>(replies)
                .ok_or("unexpected session-reset challenge shape")?;

        let signature: Signature = self
            .key
            .sign_prehash(&challenge.challenge)
            .map_err(|e| format!("signing the challenge: {e}"))?;
        let body = signature_hex(&signature);

        let (_, replies) = self
            .http_request(
                &self.config.reset_endpoint,
                HttpMethod::Post,
                Some(("text/plain", body.into_bytes())),
            )
            .await?;

        if let Some((_, failure, Okay)) =
            extract_replies::<(HttpReadHeader, ResetFailure, Okay)>(replies.clone())
        {
            return Err(format!("session reset rejected with code {}", failure.code));
        }

        let (_, success, Okay) = extract_replies::<(HttpReadHeader, ResetSuccess, Okay)>(replies)
            .ok_or("unexpected session-reset response shape")?;

        debug!(
            "received prng vector: {:08x} {:08x} {:08x} {:08x}",
            success.prng_iv[0], success.prng_iv[1], success.prng_iv[2], success.prng_iv[3]
        );

        Ok(success.prng_iv)
    }

    /// Drain and upload until the failure budget runs out or the link goes
    /// inconsistent.
    async fn upload_loop(&mut self) -> Result<(), String> {
        let mut failures = 0usize;

        loop {
            self.heartbeat.beat();

            if self.gsm.link().inconsistent() {
                return Err("modem state inconsistent".into());
            }

            let batch = forger::drain_pending(&mut self.queue, self.config.batch_size);
            if batch.is_empty() {
                tokio::time::sleep(UPLOAD_IDLE).await;
                continue;
            }

            match self.upload_batch(&batch).await {
                Ok(()) => failures = 0,
                Err(reason) => {
                    failures += 1;
                    warn!("upload failed ({failures}/{MAX_UPLOAD_FAILURES}): {reason}");
                    if failures >= MAX_UPLOAD_FAILURES {
                        return Err("too many consecutive upload failures".into());
                    }
                }
            }
        }
    }

    async fn upload_batch(&self, batch: &[Packet]) -> Result<(), String> {
        let body = signed_batch_body(&self.key, batch)?;

        let (action, _) = self
            .http_request(
                &self.config.packet_endpoint,
                HttpMethod::Post,
                Some(("text/plain", body.into_bytes())),
            )
            .await?;

        if !(200..300).contains(&action.code) {
            return Err(format!("backend answered HTTP {}", action.code));
        }

        debug!("uploaded a batch of {} packets", batch.len());
        Ok(())
    }

    /// Make one HTTP request through the modem stack and read the body back.
    ///
    /// Returns the action notice (carrying the status code) and the
    /// `HTTPREAD` reply vector with the parsed body lines.
    async fn http_request(
        &self,
        url: &str,
        method: HttpMethod,
        body: Option<(&str, Vec<u8>)>,
    ) -> Result<(HttpActionDone, Vec<Reply>), String> {
        let result = self.http_request_inner(url, method, body).await;
        if result.is_err() {
            // leave the modem HTTP stack closed for the next attempt
            let _ = self.gsm.send(ORIGIN, Command::HttpTerm).await;
        }
        result
    }

    async fn http_request_inner(
        &self,
        url: &str,
        method: HttpMethod,
        body: Option<(&str, Vec<u8>)>,
    ) -> Result<(HttpActionDone, Vec<Reply>), String> {
        self.expect_ok(Command::HttpInit).await?;
        self.expect_ok(Command::HttpSetBearer { profile: PROFILE }).await?;
        self.expect_ok(Command::HttpSetUa {
            user_agent: self.config.user_agent.clone(),
        })
        .await?;
        self.expect_ok(Command::HttpSetUrl { url: url.to_string() }).await?;

        if let Some((content_type, payload)) = body {
            self.expect_ok(Command::HttpContentType {
                content_type: content_type.to_string(),
            })
            .await?;
            self.expect_ok(Command::HttpData { payload }).await?;
        }

        self.watcher.clear();
        self.expect_ok(Command::HttpMakeRequest { method }).await?;

        let action = self
            .wait_for_http_action()
            .await
            .ok_or("timed out waiting for HTTPACTION")?;

        let replies = self.gsm.send(ORIGIN, Command::HttpRead).await;
        if replies.last() != Some(&Reply::Ok) {
            return Err("HTTPREAD did not complete with OK".into());
        }

        self.expect_ok(Command::HttpTerm).await?;

        Ok((action, replies))
    }

    /// Poll the watcher slot for up to `http_timeout_decis` deciseconds.
    async fn wait_for_http_action(&self) -> Option<HttpActionDone> {
        for _ in 0..self.config.http_timeout_decis {
            self.heartbeat.beat();
            if let Some(action) = self.watcher.take() {
                return Some(action);
            }
            tokio::time::sleep(POLL).await;
        }
        None
    }

    /// Send a command and require an `OK`-terminated reply vector.
    async fn expect_ok(&self, command: Command) -> Result<(), String> {
        let name = command.name();
        let replies = self.gsm.send(ORIGIN, command).await;
        if replies.last() == Some(&Reply::Ok) {
            Ok(())
        } else {
            Err(format!("{name} did not complete with OK"))
        }
    }
}

/// `r ‖ s` as 128 big-endian hex characters.
fn signature_hex(signature: &Signature) -> String {
    let (r, s) = signature.split_bytes();
    let mut out = String::with_capacity(128);
    out.push_str(&hex::encode(r));
    out.push_str(&hex::encode(s));
    out
}

/// Serialize a batch and append the detached signature over its SHA-256.
fn signed_batch_body(key: &SigningKey, batch: &[Packet]) -> Result<String, String> {
    let mut body = serde_json::to_string(batch).map_err(|e| format!("serializing batch: {e}"))?;
    let digest: [u8; 32] = Sha256::digest(body.as_bytes()).into();
    let signature: Signature = key
        .sign_prehash(&digest)
        .map_err(|e| format!("signing the batch: {e}"))?;
    body.push_str(&signature_hex(&signature));
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{EssentialsPacket, Payload};
    use p256::ecdsa::signature::hazmat::PrehashVerifier;
    use p256::ecdsa::VerifyingKey;

    fn test_key() -> SigningKey {
        SigningKey::from_slice(&[0x17; 32]).expect("valid test scalar")
    }

    fn test_packet(seq: u32) -> Packet {
        Packet {
            sequence_id: seq,
            timestamp: 1_700_000_000,
            rng_state: 0x1234_5678,
            data: Payload::Essentials(EssentialsPacket {
                speed: 42.0,
                battery_temps: [20.0, 21.0, 22.0, 23.0, 24.0],
                voltage: 96.0,
                remaining_wh: 1500.0,
            }),
        }
    }

    #[test]
    fn test_signature_hex_is_128_chars() {
        let sig: Signature = test_key().sign_prehash(&[0u8; 32]).unwrap();
        let rendered = signature_hex(&sig);
        assert_eq!(rendered.len(), 128);
        assert!(rendered.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_signed_batch_verifies() {
        let key = test_key();
        let batch = vec![test_packet(0), test_packet(1)];
        let body = signed_batch_body(&key, &batch).unwrap();

        let (json, sig_hex) = body.split_at(body.len() - 128);
        // the signed body is valid JSON on its own; the signature sits outside
        let parsed: serde_json::Value = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 2);
        assert_eq!(parsed[0]["seq"], 0);

        let r = hex::decode(&sig_hex[..64]).unwrap();
        let s = hex::decode(&sig_hex[64..]).unwrap();
        let signature = Signature::from_scalars(
            *p256::FieldBytes::from_slice(&r),
            *p256::FieldBytes::from_slice(&s),
        )
        .unwrap();

        let digest: [u8; 32] = Sha256::digest(json.as_bytes()).into();
        VerifyingKey::from(&key)
            .verify_prehash(&digest, &signature)
            .expect("batch signature must verify");
    }

    #[test]
    fn test_challenge_signature_round_trip() {
        let key = test_key();
        let challenge = [0xA5u8; 32];
        let sig: Signature = key.sign_prehash(&challenge).unwrap();
        VerifyingKey::from(&key)
            .verify_prehash(&challenge, &sig)
            .expect("challenge signature must verify");
    }

    #[test]
    fn test_watcher_takes_once() {
        let watcher = HttpActionWatcher::new();
        let action = HttpActionDone {
            method: HttpMethod::Post,
            code: 200,
            body_len: 4,
        };
        watcher.incoming_reply(&Reply::HttpActionDone(action));
        // other replies leave the slot alone
        watcher.incoming_reply(&Reply::Ok);
        assert_eq!(watcher.take(), Some(action));
        assert_eq!(watcher.take(), None);
    }
}
