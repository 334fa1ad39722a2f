//! Round & Score Tracking
//!
//! Append-only log of decided rounds and the best-of-N rule.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::game::state::{Seat, Seats, Side};

/// A decided round. Never mutated after it is recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundRecord {
    /// 1-based round index.
    pub index: u32,
    /// Both locked-in choices.
    pub choices: Seats<Side>,
    /// Drawn side.
    pub side: Side,
    /// Winning seat.
    pub winner: Seat,
    /// Combined power, presentation only.
    pub combined_power: u32,
    /// How long clients animate the flip.
    pub display_ms: u64,
}

/// Tracker errors. Both indicate a double or skipped resolution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScoreError {
    /// Round index already recorded.
    #[error("round {0} already recorded")]
    DuplicateRound(u32),
    /// Round index skips ahead of the log.
    #[error("round {got} recorded out of order, expected {expected}")]
    RoundOutOfOrder {
        /// Index that was offered.
        got: u32,
        /// Next index the log accepts.
        expected: u32,
    },
}

/// Score tracker for one match.
#[derive(Debug, Clone)]
pub struct ScoreTracker {
    round_target: u32,
    log: Vec<RoundRecord>,
}

impl ScoreTracker {
    /// New tracker for a best-of-`round_target` match.
    pub fn new(round_target: u32) -> Self {
        Self {
            round_target,
            log: Vec::new(),
        }
    }

    /// Append a record.
    pub fn record(&mut self, record: RoundRecord) -> Result<(), ScoreError> {
        if self.log.iter().any(|r| r.index == record.index) {
            return Err(ScoreError::DuplicateRound(record.index));
        }
        let expected = self.rounds_played() + 1;
        if record.index != expected {
            return Err(ScoreError::RoundOutOfOrder {
                got: record.index,
                expected,
            });
        }
        self.log.push(record);
        Ok(())
    }

    /// Rounds won by a seat.
    pub fn score_for(&self, seat: Seat) -> u32 {
        self.log.iter().filter(|r| r.winner == seat).count() as u32
    }

    /// Both scores.
    pub fn scores(&self) -> Seats<u32> {
        Seats::new(self.score_for(Seat::Creator), self.score_for(Seat::Opponent))
    }

    /// Decided rounds so far.
    pub fn rounds_played(&self) -> u32 {
        self.log.len() as u32
    }

    /// The log, oldest first.
    pub fn log(&self) -> &[RoundRecord] {
        &self.log
    }

    /// Wins needed to clinch outright.
    pub fn wins_needed(&self) -> u32 {
        self.round_target / 2 + 1
    }

    /// Someone has clinched, or the target is exhausted with a leader.
    /// A tie after the target (even targets only) keeps the match going
    /// in sudden death.
    pub fn is_match_over(&self) -> bool {
        let scores = self.scores();
        let leader = scores.creator.max(scores.opponent);
        if leader > self.round_target / 2 {
            return true;
        }
        self.rounds_played() >= self.round_target && scores.creator != scores.opponent
    }

    /// Winner once the match is over.
    pub fn match_winner(&self) -> Option<Seat> {
        if !self.is_match_over() {
            return None;
        }
        let scores = self.scores();
        if scores.creator > scores.opponent {
            Some(Seat::Creator)
        } else {
            Some(Seat::Opponent)
        }
    }

    /// Scores are level and the next decided round ends the match.
    pub fn next_round_decides_tied(&self) -> bool {
        let scores = self.scores();
        if scores.creator != scores.opponent {
            return false;
        }
        scores.creator + 1 > self.round_target / 2 || self.rounds_played() + 1 >= self.round_target
    }
}
