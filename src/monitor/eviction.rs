//! Idle-flow eviction.
//!
//! Each pump owns a [`tokio::time::Interval`] built by [`eviction_ticker`]
//! and calls [`Reassembler::flush_older_than`] on every tick. Flows idle
//! since before the cutoff are finalized whatever their parse outcome, which
//! closes their consumer and returns their held pages to the budget.

use crate::monitor::flow::{Reassembler, StreamFactory};
use crate::monitor::types::{FlowKey, SessionStats};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Ticker whose first tick fires one full `period` from now.
pub fn eviction_ticker(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Activity older than this instant counts as idle. Never earlier than
/// the Unix epoch, which is where capture timestamps start.
pub fn expiry_cutoff(now: SystemTime, expiry: Duration) -> SystemTime {
    let since_epoch = now.duration_since(UNIX_EPOCH).unwrap_or_default();
    UNIX_EPOCH + since_epoch.saturating_sub(expiry)
}

impl<F: StreamFactory> Reassembler<F> {
    /// Finalizes every flow whose last segment was captured before `cutoff`.
    ///
    /// Returns the number of flows removed. A later segment with the same
    /// key starts from an empty state with a fresh consumer.
    pub fn flush_older_than(&mut self, cutoff: SystemTime) -> usize {
        let idle: Vec<FlowKey> = self
            .flows
            .iter()
            .filter(|(_, flow)| flow.last_seen < cutoff)
            .map(|(key, _)| *key)
            .collect();

        for key in &idle {
            self.finalize(key);
        }
        SessionStats::add(&self.shared.stats.flows_evicted, idle.len() as u64);
        idle.len()
    }

    /// Finalizes every tracked flow.
    pub fn flush_all(&mut self) -> usize {
        let keys: Vec<FlowKey> = self.flows.keys().copied().collect();
        for key in &keys {
            self.finalize(key);
        }
        keys.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::flow::testing::*;
    use crate::monitor::flow::PageBudget;
    use crate::monitor::types::TcpSegment;

    const CLIENT: &str = "192.168.1.5:50000";
    const SERVER: &str = "93.184.216.34:443";

    fn stamped(seg: TcpSegment, secs: u64) -> TcpSegment {
        TcpSegment { captured_at: at(secs), ..seg }
    }

    #[test]
    fn idle_flow_is_evicted_and_key_restarts_fresh() {
        let rec = Recorder::default();
        let budget = PageBudget::new(10);
        let mut r = reassembler(rec.clone(), budget.clone(), 100);

        r.assemble(stamped(syn(CLIENT, SERVER, 0), 100));
        r.assemble(stamped(data(CLIENT, SERVER, 1, b"\x16\x03\x01"), 100));
        r.assemble(stamped(data(CLIENT, SERVER, 40, b"held"), 100));
        assert_eq!(budget.in_use(), 1);

        let evicted = r.flush_older_than(expiry_cutoff(at(161), Duration::from_secs(60)));
        assert_eq!(evicted, 1);
        assert_eq!(r.flow_count(), 0);
        assert_eq!(budget.in_use(), 0);

        r.assemble(stamped(data(CLIENT, SERVER, 5_000, b"new"), 200));

        let all = rec.delivered.lock().unwrap();
        assert_eq!(all.len(), 2);
        let fresh: Vec<u8> = all[1].1.concat();
        assert_eq!(fresh, b"new");
    }

    #[test]
    fn recent_flows_survive_the_sweep() {
        let mut r = reassembler(Recorder::default(), PageBudget::new(10), 100);

        r.assemble(stamped(syn(CLIENT, SERVER, 0), 100));
        r.assemble(stamped(syn("10.0.0.8:1000", SERVER, 0), 150));

        let evicted = r.flush_older_than(expiry_cutoff(at(170), Duration::from_secs(60)));
        assert_eq!(evicted, 1);
        assert_eq!(r.flow_count(), 1);
    }

    #[test]
    fn activity_refreshes_last_seen() {
        let mut r = reassembler(Recorder::default(), PageBudget::new(10), 100);

        r.assemble(stamped(syn(CLIENT, SERVER, 0), 100));
        r.assemble(stamped(data(CLIENT, SERVER, 1, b"x"), 150));

        assert_eq!(r.flush_older_than(at(120)), 0);
        assert_eq!(r.flush_older_than(at(151)), 1);
    }

    #[test]
    fn flush_all_empties_the_table() {
        let mut r = reassembler(Recorder::default(), PageBudget::new(10), 100);
        r.assemble(syn(CLIENT, SERVER, 0));
        r.assemble(syn("10.0.0.8:1000", SERVER, 0));

        assert_eq!(r.flush_all(), 2);
        assert_eq!(r.flow_count(), 0);
    }

    #[test]
    fn cutoff_saturates_at_epoch() {
        assert_eq!(expiry_cutoff(at(10), Duration::from_secs(60)), UNIX_EPOCH);
        assert_eq!(expiry_cutoff(UNIX_EPOCH, Duration::from_secs(60)), UNIX_EPOCH);
        assert_eq!(expiry_cutoff(at(70), Duration::from_secs(60)), at(10));
    }
}
