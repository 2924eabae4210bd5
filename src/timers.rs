use std::collections::HashMap;
use std::time::Duration;

use log::trace;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Ring,
    IncomingRing,
    KeyExchange,
    PeerLeftGrace,
    RejoinWindow,
    HealthCheck,
    GroupTokenRefresh,
    GroupSpeakingPoll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    pub epoch: u64,
}

struct ArmedTimer {
    epoch: u64,
    handle: JoinHandle<()>,
}

pub struct TimerSet {
    sink: mpsc::UnboundedSender<TimerFired>,
    armed: HashMap<TimerKind, ArmedTimer>,
}

impl TimerSet {
    pub fn new(sink: mpsc::UnboundedSender<TimerFired>) -> Self {
        Self {
            sink,
            armed: HashMap::new(),
        }
    }

    pub fn arm(&mut self, kind: TimerKind, delay: Duration, epoch: u64) {
        self.clear(kind);
        let sink = self.sink.clone();
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            let _ = sink.send(TimerFired { kind, epoch });
        });
        trace!(target: "Call/Timers", "Armed {kind:?} for {delay:?} (epoch {epoch})");
        self.armed.insert(kind, ArmedTimer { epoch, handle });
    }

    pub fn arm_periodic(&mut self, kind: TimerKind, period: Duration, epoch: u64) {
        self.clear(kind);
        let sink = self.sink.clone();
        let period = period.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            loop {
                ticks.tick().await;
                if sink.send(TimerFired { kind, epoch }).is_err() {
                    break;
                }
            }
        });
        trace!(target: "Call/Timers", "Armed periodic {kind:?} every {period:?} (epoch {epoch})");
        self.armed.insert(kind, ArmedTimer { epoch, handle });
    }

    pub fn ensure_periodic(&mut self, kind: TimerKind, period: Duration, epoch: u64) {
        if self.armed_epoch(kind) != Some(epoch) {
            self.arm_periodic(kind, period, epoch);
        }
    }

    pub fn clear(&mut self, kind: TimerKind) {
        if let Some(timer) = self.armed.remove(&kind) {
            timer.handle.abort();
            trace!(target: "Call/Timers", "Cleared {kind:?}");
        }
    }

    pub fn clear_all(&mut self) {
        for (_, timer) in self.armed.drain() {
            timer.handle.abort();
        }
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.armed.contains_key(&kind)
    }

    pub fn armed_epoch(&self, kind: TimerKind) -> Option<u64> {
        self.armed.get(&kind).map(|t| t.epoch)
    }

    pub fn armed_count(&self) -> usize {
        self.armed.len()
    }

    pub fn accepts(&self, fired: &TimerFired) -> bool {
        self.armed_epoch(fired.kind) == Some(fired.epoch)
    }

    pub fn consume(&mut self, kind: TimerKind) {
        self.armed.remove(&kind);
    }
}

impl Drop for TimerSet {
    fn drop(&mut self) {
        self.clear_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_fires_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = TimerSet::new(tx);
        timers.arm(TimerKind::Ring, Duration::from_secs(30), 7);

        sleep(Duration::from_secs(31)).await;
        assert_eq!(
            rx.try_recv().unwrap(),
            TimerFired {
                kind: TimerKind::Ring,
                epoch: 7
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_clears_previous() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = TimerSet::new(tx);
        timers.arm(TimerKind::KeyExchange, Duration::from_secs(10), 1);
        timers.arm(TimerKind::KeyExchange, Duration::from_secs(30), 2);

        sleep(Duration::from_secs(15)).await;
        assert!(rx.try_recv().is_err());

        sleep(Duration::from_secs(20)).await;
        assert_eq!(rx.try_recv().unwrap().epoch, 2);
        assert_eq!(timers.armed_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_all_disarms_everything() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = TimerSet::new(tx);
        timers.arm(TimerKind::Ring, Duration::from_secs(1), 1);
        timers.arm_periodic(TimerKind::HealthCheck, Duration::from_secs(1), 1);
        timers.clear_all();
        assert_eq!(timers.armed_count(), 0);

        sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_ticks_and_accepts() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = TimerSet::new(tx);
        timers.arm_periodic(TimerKind::GroupSpeakingPoll, Duration::from_millis(500), 3);

        sleep(Duration::from_millis(1600)).await;
        let mut count = 0;
        while let Ok(fired) = rx.try_recv() {
            assert!(timers.accepts(&fired));
            count += 1;
        }
        assert_eq!(count, 3);

        timers.ensure_periodic(TimerKind::GroupSpeakingPoll, Duration::from_millis(500), 3);
        assert_eq!(timers.armed_epoch(TimerKind::GroupSpeakingPoll), Some(3));
        assert!(!timers.accepts(&TimerFired {
            kind: TimerKind::GroupSpeakingPoll,
            epoch: 2
        }));
    }
}
