use std::{
    collections::HashSet,
    time::{Duration, Instant},
};

use crate::messages::ReliabilityParams;

/// Retransmissions of one message before giving up, the first send not counted.
pub const MAX_RETRANSMISSIONS: u32 = 4;

struct Unacked {
    counter: u32,
    datagram: Vec<u8>,
    next_at: Instant,
    retransmissions: u32,
}

struct LastReply {
    /// counter of the received message this reply acknowledged
    acked: Option<u32>,
    datagram: Vec<u8>,
}

pub enum RetransmitAction {
    Nothing,
    Resend(Vec<u8>),
    GiveUp,
}

/// Reliability state of one handshake exchange: duplicate detection for received
/// counters and the last sent message that still waits for its ack.
pub struct RetransmitContext {
    /// counters of already received messages to detect duplicates
    received: HashSet<u32>,
    pending: Option<Unacked>,
    /// last reliable message sent, kept after its ack so duplicates can be answered again
    last_sent: Option<LastReply>,
    interval: Duration,
}

impl RetransmitContext {
    pub fn new(peer: ReliabilityParams) -> Self {
        Self {
            received: HashSet::new(),
            pending: None,
            last_sent: None,
            interval: Duration::from_millis(peer.active_retrans_ms as u64),
        }
    }

    pub fn set_peer_params(&mut self, peer: ReliabilityParams) {
        self.interval = Duration::from_millis(peer.active_retrans_ms as u64);
    }

    /// Starts tracking a reliable message until it is acked. `acked` is the received
    /// counter piggybacked on it.
    pub fn sent_reliable(
        &mut self,
        counter: u32,
        acked: Option<u32>,
        datagram: &[u8],
        now: Instant,
    ) {
        log::trace!("tracking msg counter:{}", counter);
        self.pending = Some(Unacked {
            counter,
            datagram: datagram.to_vec(),
            next_at: now + self.interval,
            retransmissions: 0,
        });
        self.last_sent = Some(LastReply {
            acked,
            datagram: datagram.to_vec(),
        });
    }

    /// Drops the pending message without waiting for its ack.
    pub fn stop(&mut self) {
        self.pending = None;
    }

    pub fn received_ack(&mut self, counter: u32) {
        if let Some(p) = &self.pending {
            if p.counter == counter {
                log::trace!("received ack counter:{}", counter);
                self.pending = None;
            }
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Records a received counter. Returns false when it was seen before.
    pub fn received(&mut self, counter: u32) -> bool {
        self.received.insert(counter)
    }

    /// The datagram sent in answer to received `counter`, if it was the last one.
    pub fn reply_for(&self, counter: u32) -> Option<&[u8]> {
        self.last_sent
            .as_ref()
            .filter(|r| r.acked == Some(counter))
            .map(|r| r.datagram.as_slice())
    }

    pub fn poll(&mut self, now: Instant) -> RetransmitAction {
        let interval = self.interval;
        let pending = match &mut self.pending {
            Some(p) => p,
            None => return RetransmitAction::Nothing,
        };
        if now < pending.next_at {
            return RetransmitAction::Nothing;
        }
        if pending.retransmissions >= MAX_RETRANSMISSIONS {
            log::debug!("giving up on msg counter:{}", pending.counter);
            self.pending = None;
            return RetransmitAction::GiveUp;
        }
        pending.retransmissions += 1;
        // backoff by 1.6 per attempt
        let mut backoff = interval;
        for _ in 0..pending.retransmissions {
            backoff = backoff * 8 / 5;
        }
        pending.next_at = now + backoff;
        log::trace!(
            "retransmit counter = {} attempt {}",
            pending.counter,
            pending.retransmissions
        );
        RetransmitAction::Resend(pending.datagram.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retransmits_with_backoff_until_acked() {
        let t0 = Instant::now();
        let mut ctx = RetransmitContext::new(ReliabilityParams {
            idle_retrans_ms: 500,
            active_retrans_ms: 100,
        });
        ctx.sent_reliable(5, Some(9), b"msg", t0);
        assert!(matches!(
            ctx.poll(t0 + Duration::from_millis(50)),
            RetransmitAction::Nothing
        ));
        match ctx.poll(t0 + Duration::from_millis(100)) {
            RetransmitAction::Resend(d) => assert_eq!(d, b"msg"),
            _ => panic!("expected resend"),
        }
        // next one only after the backed off interval
        assert!(matches!(
            ctx.poll(t0 + Duration::from_millis(200)),
            RetransmitAction::Nothing
        ));
        ctx.received_ack(4);
        assert!(ctx.has_pending());
        ctx.received_ack(5);
        assert!(!ctx.has_pending());
        // still there to answer a duplicate of counter 9
        assert_eq!(ctx.reply_for(9), Some(&b"msg"[..]));
        assert_eq!(ctx.reply_for(8), None);
    }

    #[test]
    fn newer_reply_replaces_the_old_one() {
        let t0 = Instant::now();
        let mut ctx = RetransmitContext::new(ReliabilityParams::default());
        ctx.sent_reliable(1, None, b"request", t0);
        assert_eq!(ctx.reply_for(1), None);
        ctx.sent_reliable(2, Some(40), b"first", t0);
        ctx.sent_reliable(3, Some(41), b"second", t0);
        assert_eq!(ctx.reply_for(40), None);
        assert_eq!(ctx.reply_for(41), Some(&b"second"[..]));
        ctx.stop();
        assert!(!ctx.has_pending());
        assert!(matches!(
            ctx.poll(t0 + Duration::from_secs(10)),
            RetransmitAction::Nothing
        ));
    }

    #[test]
    fn gives_up_after_max_retransmissions() {
        let mut now = Instant::now();
        let mut ctx = RetransmitContext::new(ReliabilityParams::default());
        ctx.sent_reliable(1, None, b"x", now);
        let mut resent = 0;
        loop {
            now += Duration::from_secs(10);
            match ctx.poll(now) {
                RetransmitAction::Resend(_) => resent += 1,
                RetransmitAction::GiveUp => break,
                RetransmitAction::Nothing => panic!("interval elapsed"),
            }
        }
        assert_eq!(resent, MAX_RETRANSMISSIONS);
        assert!(matches!(ctx.poll(now), RetransmitAction::Nothing));
    }

    #[test]
    fn duplicate_counters_detected() {
        let mut ctx = RetransmitContext::new(ReliabilityParams::default());
        assert!(ctx.received(10));
        assert!(!ctx.received(10));
        assert!(ctx.received(11));
    }
}
