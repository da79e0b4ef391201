//! Authenticated link synchronisation.
//!
//! Runs once after every serial reconnect, before any other traffic:
//!
//! 1. Gateway sends `CMD_LINK_SYNC` with a 16-byte nonce — 8 random bytes
//!    followed by a strictly monotonic 64-bit counter (big-endian).
//! 2. MCU replies `CMD_LINK_SYNC_RESP` with the echoed nonce plus a 16-byte
//!    tag: the first 16 bytes of `HMAC-SHA256(shared_secret, nonce)`.
//! 3. Gateway recomputes the tag and compares in constant time.
//! 4. Gateway pushes `CMD_LINK_CONFIG` (ack timeout, retry limit, response
//!    timeout) and waits for the ACK.
//!
//! Replayed responses are rejected by the counter embedded in the nonce:
//! anything at or below the last accepted counter fails with `AntiReplay`
//! and does not advance the counter. After a configured number of
//! consecutive failures the handshake turns fatal — the daemon refuses to
//! run against a misconfigured secret.

use std::time::{Duration, Instant};

use log::warn;
use rand::RngCore;
use thiserror::Error;

use super::protocol::{HANDSHAKE_CONFIG_SIZE, HANDSHAKE_NONCE_LENGTH, HANDSHAKE_TAG_LENGTH};

/// Expected `CMD_LINK_SYNC_RESP` payload: echoed nonce || tag.
pub const SYNC_RESP_LEN: usize = HANDSHAKE_NONCE_LENGTH + HANDSHAKE_TAG_LENGTH;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("link sync got no response")]
    NoResponse,

    #[error("malformed link sync response: {got} bytes, expected {SYNC_RESP_LEN}")]
    BadResponse { got: usize },

    #[error("anti-replay: counter {got} <= last accepted {last}")]
    AntiReplay { got: u64, last: u64 },

    #[error("echoed nonce does not match the one sent")]
    NonceMismatch,

    #[error("authentication tag mismatch")]
    TagMismatch,

    #[error("MCU rejected link config")]
    ConfigRejected,

    #[error("handshake failed {failures} consecutive times (last: {last})")]
    Fatal { failures: u32, last: String },
}

impl HandshakeError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, HandshakeError::Fatal { .. })
    }
}

/// Handshake state: nonce counter, failure accounting, attempt throttle.
pub struct HandshakeManager {
    secret: Vec<u8>,
    /// Counter for the next nonce; strictly monotonic for the daemon's life.
    counter: u64,
    /// Highest counter an accepted response has echoed.
    last_accepted: u64,
    consecutive_failures: u32,
    fatal_threshold: u32,
    min_interval: Duration,
    last_attempt: Option<Instant>,
}

impl HandshakeManager {
    pub fn new(secret: &[u8], fatal_threshold: u32, min_interval: Duration) -> Self {
        Self {
            secret: secret.to_vec(),
            counter: 1,
            last_accepted: 0,
            consecutive_failures: 0,
            fatal_threshold,
            min_interval,
            last_attempt: None,
        }
    }

    /// First 16 bytes of HMAC-SHA256(secret, nonce).
    pub fn calculate_tag(secret: &[u8], nonce: &[u8]) -> [u8; HANDSHAKE_TAG_LENGTH] {
        let mac = hmac_sha256::HMAC::mac(nonce, secret);
        let mut tag = [0u8; HANDSHAKE_TAG_LENGTH];
        tag.copy_from_slice(&mac[..HANDSHAKE_TAG_LENGTH]);
        tag
    }

    /// Build the next nonce: 8 random bytes || 8-byte counter (BE).
    pub fn next_nonce(&mut self) -> [u8; HANDSHAKE_NONCE_LENGTH] {
        let mut nonce = [0u8; HANDSHAKE_NONCE_LENGTH];
        rand::thread_rng().fill_bytes(&mut nonce[..8]);
        nonce[8..].copy_from_slice(&self.counter.to_be_bytes());
        self.counter += 1;
        nonce
    }

    /// Verify a `CMD_LINK_SYNC_RESP` payload against the nonce we sent.
    /// On success the anti-replay counter advances to the echoed value.
    pub fn verify_response(
        &mut self,
        sent_nonce: &[u8; HANDSHAKE_NONCE_LENGTH],
        response: &[u8],
    ) -> Result<(), HandshakeError> {
        if response.len() != SYNC_RESP_LEN {
            return Err(HandshakeError::BadResponse {
                got: response.len(),
            });
        }

        let echoed = &response[..HANDSHAKE_NONCE_LENGTH];
        let tag = &response[HANDSHAKE_NONCE_LENGTH..];

        let mut counter_bytes = [0u8; 8];
        counter_bytes.copy_from_slice(&echoed[8..]);
        let echoed_counter = u64::from_be_bytes(counter_bytes);
        if echoed_counter <= self.last_accepted {
            return Err(HandshakeError::AntiReplay {
                got: echoed_counter,
                last: self.last_accepted,
            });
        }

        if echoed != sent_nonce {
            return Err(HandshakeError::NonceMismatch);
        }

        let expected = Self::calculate_tag(&self.secret, sent_nonce);
        if !constant_time_eq(&expected, tag) {
            return Err(HandshakeError::TagMismatch);
        }

        self.last_accepted = echoed_counter;
        Ok(())
    }

    /// Pack the `CMD_LINK_CONFIG` payload (u16, u8, u32 — all BE).
    pub fn build_link_config(
        ack_timeout_ms: u16,
        retry_limit: u8,
        response_timeout_ms: u32,
    ) -> [u8; HANDSHAKE_CONFIG_SIZE] {
        let mut out = [0u8; HANDSHAKE_CONFIG_SIZE];
        out[..2].copy_from_slice(&ack_timeout_ms.to_be_bytes());
        out[2] = retry_limit;
        out[3..].copy_from_slice(&response_timeout_ms.to_be_bytes());
        out
    }

    /// Remaining wait before the next attempt may start, if any.
    pub fn throttle(&self) -> Option<Duration> {
        let last = self.last_attempt?;
        let elapsed = last.elapsed();
        if elapsed < self.min_interval {
            Some(self.min_interval - elapsed)
        } else {
            None
        }
    }

    pub fn record_attempt(&mut self) {
        self.last_attempt = Some(Instant::now());
    }

    /// Count one failure; escalate to `Fatal` past the threshold.
    pub fn record_failure(&mut self, error: &HandshakeError) -> Option<HandshakeError> {
        self.consecutive_failures += 1;
        warn!(
            "handshake: attempt failed ({}), {}/{} consecutive",
            error, self.consecutive_failures, self.fatal_threshold
        );
        if self.consecutive_failures >= self.fatal_threshold {
            return Some(HandshakeError::Fatal {
                failures: self.consecutive_failures,
                last: error.to_string(),
            });
        }
        None
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Highest accepted anti-replay counter.
    pub fn last_accepted(&self) -> u64 {
        self.last_accepted
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

// ── Tests ────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"mcubridge-shared";

    fn mcu_reply(secret: &[u8], nonce: &[u8; 16]) -> Vec<u8> {
        let mut out = nonce.to_vec();
        out.extend_from_slice(&HandshakeManager::calculate_tag(secret, nonce));
        out
    }

    #[test]
    fn happy_path() {
        let mut hs = HandshakeManager::new(SECRET, 5, Duration::ZERO);
        let nonce = hs.next_nonce();
        let reply = mcu_reply(SECRET, &nonce);
        assert!(hs.verify_response(&nonce, &reply).is_ok());
        assert_eq!(hs.last_accepted(), 1);
    }

    #[test]
    fn counters_are_strictly_monotonic() {
        let mut hs = HandshakeManager::new(SECRET, 5, Duration::ZERO);
        let mut last = 0u64;
        for _ in 0..5 {
            let nonce = hs.next_nonce();
            let counter = u64::from_be_bytes(nonce[8..].try_into().unwrap());
            assert!(counter > last);
            last = counter;
            let reply = mcu_reply(SECRET, &nonce);
            hs.verify_response(&nonce, &reply).unwrap();
            assert_eq!(hs.last_accepted(), counter);
        }
    }

    #[test]
    fn replayed_response_is_rejected() {
        let mut hs = HandshakeManager::new(SECRET, 5, Duration::ZERO);
        let nonce1 = hs.next_nonce();
        let reply1 = mcu_reply(SECRET, &nonce1);
        hs.verify_response(&nonce1, &reply1).unwrap();
        let accepted = hs.last_accepted();

        // Replay the previously accepted response against a new attempt.
        let nonce2 = hs.next_nonce();
        let err = hs.verify_response(&nonce2, &reply1).unwrap_err();
        assert!(matches!(err, HandshakeError::AntiReplay { got: 1, .. }));
        // Counter must not advance on failure.
        assert_eq!(hs.last_accepted(), accepted);
    }

    #[test]
    fn wrong_secret_fails_tag_check() {
        let mut hs = HandshakeManager::new(SECRET, 5, Duration::ZERO);
        let nonce = hs.next_nonce();
        let reply = mcu_reply(b"not-the-secret", &nonce);
        assert_eq!(
            hs.verify_response(&nonce, &reply),
            Err(HandshakeError::TagMismatch)
        );
    }

    #[test]
    fn foreign_nonce_fails() {
        let mut hs = HandshakeManager::new(SECRET, 5, Duration::ZERO);
        let nonce = hs.next_nonce();
        let mut other = nonce;
        other[0] ^= 0xFF;
        // Counter is current, so the nonce-equality check fires.
        other[8..].copy_from_slice(&nonce[8..]);
        let reply = mcu_reply(SECRET, &other);
        assert_eq!(
            hs.verify_response(&nonce, &reply),
            Err(HandshakeError::NonceMismatch)
        );
    }

    #[test]
    fn short_response_rejected() {
        let mut hs = HandshakeManager::new(SECRET, 5, Duration::ZERO);
        let nonce = hs.next_nonce();
        assert_eq!(
            hs.verify_response(&nonce, &[0u8; 10]),
            Err(HandshakeError::BadResponse { got: 10 })
        );
    }

    #[test]
    fn fatal_after_threshold() {
        let mut hs = HandshakeManager::new(SECRET, 3, Duration::ZERO);
        let err = HandshakeError::TagMismatch;
        assert!(hs.record_failure(&err).is_none());
        assert!(hs.record_failure(&err).is_none());
        let fatal = hs.record_failure(&err).unwrap();
        assert!(fatal.is_fatal());
        assert!(matches!(fatal, HandshakeError::Fatal { failures: 3, .. }));
    }

    #[test]
    fn success_resets_failure_count() {
        let mut hs = HandshakeManager::new(SECRET, 3, Duration::ZERO);
        hs.record_failure(&HandshakeError::TagMismatch);
        hs.record_success();
        assert_eq!(hs.consecutive_failures(), 0);
    }

    #[test]
    fn throttle_enforces_min_interval() {
        let mut hs = HandshakeManager::new(SECRET, 3, Duration::from_secs(60));
        assert!(hs.throttle().is_none());
        hs.record_attempt();
        let wait = hs.throttle().expect("should be throttled");
        assert!(wait <= Duration::from_secs(60));
        assert!(wait > Duration::from_secs(50));
    }

    #[test]
    fn link_config_packs_seven_bytes() {
        let packed = HandshakeManager::build_link_config(750, 3, 120_000);
        assert_eq!(packed.len(), HANDSHAKE_CONFIG_SIZE);
        assert_eq!(packed[..2], 750u16.to_be_bytes());
        assert_eq!(packed[2], 3);
        assert_eq!(packed[3..], 120_000u32.to_be_bytes());
    }

    #[test]
    fn reference_tag_vector() {
        // secret = "mcubridge-shared", nonce = 00 01 02 .. 0F
        let nonce: [u8; 16] = core::array::from_fn(|i| i as u8);
        let tag = HandshakeManager::calculate_tag(SECRET, &nonce);
        let full = hmac_sha256::HMAC::mac(nonce, SECRET);
        assert_eq!(tag[..], full[..16]);
    }
}
