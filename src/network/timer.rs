//! Match Timers
//!
//! One outstanding timer per kind and match. Expiry is posted into the
//! match queue as [`SessionCommand::TimerFired`] carrying a generation;
//! anything that is no longer the current generation is stale.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::game::machine::{TimerCommand, TimerKind};
use crate::network::session::SessionCommand;

struct Slot {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Timers for one match.
pub struct TimerSet {
    tx: mpsc::WeakSender<SessionCommand>,
    slots: BTreeMap<TimerKind, Slot>,
    next_generation: u64,
}

impl TimerSet {
    /// Create a new timer set posting into `tx`. Holds only a weak
    /// sender, so pending timers do not keep the match queue open.
    pub fn new(tx: &mpsc::Sender<SessionCommand>) -> Self {
        Self {
            tx: tx.downgrade(),
            slots: BTreeMap::new(),
            next_generation: 0,
        }
    }

    /// Arm a timer, replacing any outstanding one of the same kind.
    pub fn schedule(&mut self, kind: TimerKind, after: Duration) -> u64 {
        self.cancel(kind);
        self.next_generation += 1;
        let generation = self.next_generation;
        let tx = self.tx.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(SessionCommand::TimerFired { kind, generation }).await;
            }
        });

        self.slots.insert(kind, Slot { generation, handle });
        generation
    }

    /// Disarm a timer.
    pub fn cancel(&mut self, kind: TimerKind) {
        if let Some(slot) = self.slots.remove(&kind) {
            slot.handle.abort();
        }
    }

    /// Consume an expiry. True only for the current generation.
    pub fn take_if_current(&mut self, kind: TimerKind, generation: u64) -> bool {
        match self.slots.get(&kind) {
            Some(slot) if slot.generation == generation => {
                self.slots.remove(&kind);
                true
            }
            _ => false,
        }
    }

    /// Run the machine's timer commands.
    pub fn apply(&mut self, commands: &[TimerCommand]) {
        for command in commands {
            match *command {
                TimerCommand::Schedule { kind, after_ms } => {
                    self.schedule(kind, Duration::from_millis(after_ms));
                }
                TimerCommand::Cancel(kind) => self.cancel(kind),
            }
        }
    }

    #[cfg(test)]
    fn is_armed(&self, kind: TimerKind) -> bool {
        self.slots.contains_key(&kind)
    }

    /// Disarm everything.
    pub fn cancel_all(&mut self) {
        for (_, slot) in std::mem::take(&mut self.slots) {
            slot.handle.abort();
        }
    }
}

impl Drop for TimerSet {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_fire(rx: &mut mpsc::Receiver<SessionCommand>) -> Option<(TimerKind, u64)> {
        match rx.recv().await {
            Some(SessionCommand::TimerFired { kind, generation }) => Some((kind, generation)),
            _ => None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timers = TimerSet::new(&tx);
        let generation = timers.schedule(TimerKind::Countdown, Duration::from_secs(3));

        tokio::time::sleep(Duration::from_millis(2_999)).await;
        assert!(rx.try_recv().is_err());

        let fired = next_fire(&mut rx).await;
        assert_eq!(fired, Some((TimerKind::Countdown, generation)));
        assert!(timers.take_if_current(TimerKind::Countdown, generation));
        assert!(!timers.is_armed(TimerKind::Countdown));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rescheduled_timer_makes_old_generation_stale() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timers = TimerSet::new(&tx);
        let first = timers.schedule(TimerKind::Choosing, Duration::from_secs(1));
        let second = timers.schedule(TimerKind::Choosing, Duration::from_secs(2));

        assert!(!timers.take_if_current(TimerKind::Choosing, first));
        let fired = next_fire(&mut rx).await;
        assert_eq!(fired, Some((TimerKind::Choosing, second)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timers = TimerSet::new(&tx);
        timers.apply(&[
            TimerCommand::Schedule { kind: TimerKind::Charging, after_ms: 500 },
            TimerCommand::Cancel(TimerKind::Charging),
        ]);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }
}
