//! Power & Flip Resolution
//!
//! The acting player holds to build power and releases to flip. Power
//! only stretches the flip animation; the side is drawn from the coin
//! source without ever seeing a power value.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::rng::FlipRng;
use crate::game::state::{Seat, Seats, Side};

/// Uniform source of coin faces.
pub trait CoinSource: Send {
    /// Draw one face, each with probability one half.
    fn flip(&mut self) -> Side;
}

impl CoinSource for FlipRng {
    fn flip(&mut self) -> Side {
        if self.next_bit() {
            Side::Heads
        } else {
            Side::Tails
        }
    }
}

/// Power meter errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PowerError {
    /// Another seat holds the meter.
    #[error("{0:?} is already charging")]
    Busy(Seat),
}

// =============================================================================
// POWER METER
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Charge {
    seat: Seat,
    started_ms: u64,
    base: u32,
}

/// Accumulates power for the acting seat at a fixed rate, clamped to a cap.
#[derive(Debug, Clone)]
pub struct PowerMeter {
    max: u32,
    rate_per_sec: u32,
    levels: Seats<u32>,
    charging: Option<Charge>,
}

impl PowerMeter {
    /// New meter. `max` and `rate_per_sec` are in scaled units.
    pub fn new(max: u32, rate_per_sec: u32) -> Self {
        Self {
            max,
            rate_per_sec,
            levels: Seats::default(),
            charging: None,
        }
    }

    /// Cap in scaled units.
    pub fn max(&self) -> u32 {
        self.max
    }

    /// Start holding. Calling again for the seat already charging is a no-op.
    pub fn begin_charge(&mut self, seat: Seat, now_ms: u64) -> Result<(), PowerError> {
        match self.charging {
            Some(charge) if charge.seat == seat => Ok(()),
            Some(charge) => Err(PowerError::Busy(charge.seat)),
            None => {
                self.charging = Some(Charge {
                    seat,
                    started_ms: now_ms,
                    base: *self.levels.get(seat),
                });
                Ok(())
            }
        }
    }

    /// Current power for a seat, advancing it if the seat is charging.
    ///
    /// Never decreases within a round.
    pub fn tick(&mut self, seat: Seat, now_ms: u64) -> u32 {
        if let Some(charge) = self.charging.filter(|c| c.seat == seat) {
            let elapsed = now_ms.saturating_sub(charge.started_ms);
            let gained = (self.rate_per_sec as u64 * elapsed / 1_000).min(self.max as u64) as u32;
            let level = charge.base.saturating_add(gained).min(self.max);
            let current = self.levels.get_mut(seat);
            *current = (*current).max(level);
        }
        *self.levels.get(seat)
    }

    /// Stop holding and return the final level.
    pub fn release(&mut self, seat: Seat, now_ms: u64) -> u32 {
        let level = self.tick(seat, now_ms);
        if self.charging.map(|c| c.seat) == Some(seat) {
            self.charging = None;
        }
        level
    }

    /// Raise a seat's level to at least `floor` (clamped to the cap).
    pub fn raise_to(&mut self, seat: Seat, floor: u32) -> u32 {
        let current = self.levels.get_mut(seat);
        *current = (*current).max(floor.min(self.max));
        *current
    }

    /// Whether this seat is holding.
    pub fn is_charging(&self, seat: Seat) -> bool {
        self.charging.map(|c| c.seat) == Some(seat)
    }

    /// Level without advancing.
    pub fn level(&self, seat: Seat) -> u32 {
        *self.levels.get(seat)
    }

    /// Both levels.
    pub fn levels(&self) -> Seats<u32> {
        self.levels
    }

    /// Zero both seats for a new round.
    pub fn reset(&mut self) {
        self.levels = Seats::default();
        self.charging = None;
    }
}

// =============================================================================
// FLIP RESOLUTION
// =============================================================================

/// Result of a released flip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RoundOutcome {
    /// The seat whose choice matches the drawn side wins.
    Decided {
        /// Drawn side.
        side: Side,
        /// Winning seat.
        winner: Seat,
        /// Sum of both seats' power.
        combined_power: u32,
    },
    /// Both seats chose the same side; nobody wins, the round is replayed.
    Void {
        /// Drawn side.
        side: Side,
        /// The side both seats picked.
        shared_choice: Side,
        /// Sum of both seats' power.
        combined_power: u32,
    },
}

impl RoundOutcome {
    /// Drawn side.
    pub fn side(&self) -> Side {
        match *self {
            RoundOutcome::Decided { side, .. } | RoundOutcome::Void { side, .. } => side,
        }
    }

    /// Winner, if the round was contested.
    pub fn winner(&self) -> Option<Seat> {
        match *self {
            RoundOutcome::Decided { winner, .. } => Some(winner),
            RoundOutcome::Void { .. } => None,
        }
    }

    /// Combined power (presentation only).
    pub fn combined_power(&self) -> u32 {
        match *self {
            RoundOutcome::Decided { combined_power, .. }
            | RoundOutcome::Void { combined_power, .. } => combined_power,
        }
    }
}

/// Decide a round from the locked-in choices and a drawn side.
pub fn decide(choices: Seats<Side>, side: Side, combined_power: u32) -> RoundOutcome {
    if choices.creator == choices.opponent {
        return RoundOutcome::Void {
            side,
            shared_choice: choices.creator,
            combined_power,
        };
    }
    let winner = if choices.creator == side {
        Seat::Creator
    } else {
        Seat::Opponent
    };
    RoundOutcome::Decided {
        side,
        winner,
        combined_power,
    }
}

/// Power meter plus coin, one per match.
pub struct FlipResolver {
    coin: Box<dyn CoinSource>,
    meter: PowerMeter,
}

impl std::fmt::Debug for FlipResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlipResolver").field("meter", &self.meter).finish_non_exhaustive()
    }
}

impl FlipResolver {
    /// New resolver.
    pub fn new(coin: Box<dyn CoinSource>, meter: PowerMeter) -> Self {
        Self { coin, meter }
    }

    /// See [`PowerMeter::begin_charge`].
    pub fn begin_charge(&mut self, seat: Seat, now_ms: u64) -> Result<(), PowerError> {
        self.meter.begin_charge(seat, now_ms)
    }

    /// See [`PowerMeter::tick`].
    pub fn tick(&mut self, seat: Seat, now_ms: u64) -> u32 {
        self.meter.tick(seat, now_ms)
    }

    /// Stop the meter for `seat` and flip.
    pub fn release(&mut self, seat: Seat, choices: Seats<Side>, now_ms: u64) -> RoundOutcome {
        self.meter.release(seat, now_ms);
        let levels = self.meter.levels();
        let combined = levels.creator.saturating_add(levels.opponent);
        // the draw never sees the levels above
        let side = self.coin.flip();
        decide(choices, side, combined)
    }

    /// Uniform random side, for auto-choices.
    pub fn random_side(&mut self) -> Side {
        self.coin.flip()
    }

    /// Meter access.
    pub fn meter(&self) -> &PowerMeter {
        &self.meter
    }

    /// Mutable meter access.
    pub fn meter_mut(&mut self) -> &mut PowerMeter {
        &mut self.meter
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Coin that replays a script, then repeats the last face.
    pub(crate) struct ScriptedCoin {
        faces: VecDeque<Side>,
        last: Side,
    }

    impl ScriptedCoin {
        pub(crate) fn new(faces: &[Side]) -> Self {
            Self {
                faces: faces.iter().copied().collect(),
                last: faces.last().copied().unwrap_or(Side::Heads),
            }
        }

        pub(crate) fn always(side: Side) -> Self {
            Self::new(&[side])
        }
    }

    impl CoinSource for ScriptedCoin {
        fn flip(&mut self) -> Side {
            self.faces.pop_front().unwrap_or(self.last)
        }
    }

    fn meter() -> PowerMeter {
        // 10 units cap, 4 units/s
        PowerMeter::new(1_000, 400)
    }

    #[test]
    fn test_power_accumulates_and_clamps() {
        let mut m = meter();
        m.begin_charge(Seat::Creator, 0).unwrap();
        assert_eq!(m.tick(Seat::Creator, 500), 200);
        assert_eq!(m.tick(Seat::Creator, 1_000), 400);
        assert_eq!(m.tick(Seat::Creator, 60_000), 1_000);
        assert_eq!(m.release(Seat::Creator, 61_000), 1_000);
        assert!(!m.is_charging(Seat::Creator));
    }

    #[test]
    fn test_power_is_monotonic() {
        let mut m = meter();
        m.begin_charge(Seat::Opponent, 1_000).unwrap();
        assert_eq!(m.tick(Seat::Opponent, 2_000), 400);
        // clock going backwards must not lower the level
        assert_eq!(m.tick(Seat::Opponent, 1_500), 400);
    }

    #[test]
    fn test_only_charging_seat_gains_power() {
        let mut m = meter();
        m.begin_charge(Seat::Creator, 0).unwrap();
        assert_eq!(m.tick(Seat::Opponent, 5_000), 0);
        assert_eq!(m.begin_charge(Seat::Opponent, 10), Err(PowerError::Busy(Seat::Creator)));
        // begin again for the holder is idempotent
        assert!(m.begin_charge(Seat::Creator, 100).is_ok());
        assert_eq!(m.tick(Seat::Creator, 1_000), 400);
    }

    #[test]
    fn test_raise_to_respects_cap() {
        let mut m = meter();
        assert_eq!(m.raise_to(Seat::Creator, 5_000), 1_000);
        m.reset();
        assert_eq!(m.level(Seat::Creator), 0);
    }

    #[test]
    fn test_decide_matches_choice_to_side() {
        let choices = Seats::new(Side::Heads, Side::Tails);
        assert_eq!(decide(choices, Side::Heads, 0).winner(), Some(Seat::Creator));
        assert_eq!(decide(choices, Side::Tails, 0).winner(), Some(Seat::Opponent));
    }

    #[test]
    fn test_same_side_is_void() {
        let choices = Seats::new(Side::Tails, Side::Tails);
        let outcome = decide(choices, Side::Tails, 300);
        assert_eq!(
            outcome,
            RoundOutcome::Void {
                side: Side::Tails,
                shared_choice: Side::Tails,
                combined_power: 300
            }
        );
        assert_eq!(outcome.winner(), None);
    }

    #[test]
    fn test_release_uses_scripted_coin() {
        let mut resolver = FlipResolver::new(Box::new(ScriptedCoin::new(&[Side::Tails])), meter());
        resolver.begin_charge(Seat::Creator, 0).unwrap();
        let outcome = resolver.release(Seat::Creator, Seats::new(Side::Heads, Side::Tails), 1_000);
        assert_eq!(outcome.side(), Side::Tails);
        assert_eq!(outcome.winner(), Some(Seat::Opponent));
        assert_eq!(outcome.combined_power(), 400);
    }

    /// Win rate for the creator's choice of heads over `trials` flips,
    /// with the acting seat released at `charge_ms` of holding.
    fn creator_win_rate(seed: u64, charge_ms: u64, trials: u32) -> f64 {
        let mut resolver = FlipResolver::new(Box::new(FlipRng::new(seed)), meter());
        let choices = Seats::new(Side::Heads, Side::Tails);
        let mut wins = 0u32;
        for _ in 0..trials {
            resolver.meter_mut().reset();
            resolver.begin_charge(Seat::Creator, 0).unwrap();
            let outcome = resolver.release(Seat::Creator, choices, charge_ms);
            if outcome.winner() == Some(Seat::Creator) {
                wins += 1;
            }
        }
        wins as f64 / trials as f64
    }

    #[test]
    fn test_outcome_distribution_independent_of_power() {
        let trials = 20_000;
        let at_min = creator_win_rate(0xA11CE, 0, trials);
        let at_max = creator_win_rate(0xB0B, 60_000, trials);

        assert!((at_min - 0.5).abs() < 0.02, "min-power win rate {at_min}");
        assert!((at_max - 0.5).abs() < 0.02, "max-power win rate {at_max}");
        assert!((at_min - at_max).abs() < 0.03, "rates diverge: {at_min} vs {at_max}");
    }

    #[test]
    fn test_random_hold_times_do_not_bias_outcome() {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        let mut holds = StdRng::seed_from_u64(9);
        let mut resolver = FlipResolver::new(Box::new(FlipRng::new(0xFEED)), meter());
        let choices = Seats::new(Side::Heads, Side::Tails);
        let (mut high, mut high_wins, mut low, mut low_wins) = (0u32, 0u32, 0u32, 0u32);

        for _ in 0..20_000 {
            resolver.meter_mut().reset();
            resolver.begin_charge(Seat::Creator, 0).unwrap();
            let held_ms: u64 = holds.gen_range(0..=5_000);
            let outcome = resolver.release(Seat::Creator, choices, held_ms);
            let won = outcome.winner() == Some(Seat::Creator);
            if outcome.combined_power() >= 500 {
                high += 1;
                high_wins += won as u32;
            } else {
                low += 1;
                low_wins += won as u32;
            }
        }

        let high_rate = high_wins as f64 / high as f64;
        let low_rate = low_wins as f64 / low as f64;
        assert!((high_rate - low_rate).abs() < 0.05, "{high_rate} vs {low_rate}");
    }

    #[test]
    fn test_same_seed_same_sides_regardless_of_power() {
        let mut low = FlipResolver::new(Box::new(FlipRng::new(77)), meter());
        let mut high = FlipResolver::new(Box::new(FlipRng::new(77)), meter());
        let choices = Seats::new(Side::Heads, Side::Tails);
        for _ in 0..500 {
            low.meter_mut().reset();
            high.meter_mut().reset();
            high.begin_charge(Seat::Creator, 0).unwrap();
            let a = low.release(Seat::Creator, choices, 0);
            let b = high.release(Seat::Creator, choices, 10_000);
            assert_eq!(a.side(), b.side());
            assert!(b.combined_power() > a.combined_power());
        }
    }
}
