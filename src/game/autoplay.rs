//! A simple computer player for demos and simulations

use super::{GameEngine, GameError, GameState, TurnOutcome};
use crate::scoring::{ScoringOption, DICE_PER_ROLL};

/// Takes the best-scoring selection each roll and banks once the turn is
/// worth `bank_at`, or when fewer than `min_dice_to_continue` dice are left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoPlayer {
    pub bank_at: u32,
    pub min_dice_to_continue: usize,
}

impl Default for AutoPlayer {
    fn default() -> Self {
        Self {
            bank_at: 350,
            min_dice_to_continue: 3,
        }
    }
}

impl AutoPlayer {
    pub fn new(bank_at: u32, min_dice_to_continue: usize) -> Self {
        Self {
            bank_at,
            min_dice_to_continue,
        }
    }

    /// Pick the selection to keep from a roll
    pub fn choose(&self, engine: &GameEngine, roll: &[u8]) -> Option<ScoringOption> {
        engine.get_possible_scorings(roll).into_iter().next()
    }

    /// Whether to bank with `pending` points and `dice_left` dice to roll next
    pub fn should_bank(&self, pending: u32, dice_left: usize) -> bool {
        pending >= self.bank_at || dice_left < self.min_dice_to_continue
    }

    /// Play the current player's turn to completion
    pub fn play_turn(&self, engine: &mut GameEngine) -> Result<TurnOutcome, GameError> {
        if engine.current_roll().is_empty() {
            engine.roll_dice()?;
        }
        loop {
            if engine.is_pending_farkle() {
                return engine.acknowledge_farkle();
            }
            let roll = engine.current_roll().to_vec();
            let Some(best) = self.choose(engine, &roll) else {
                return engine.skip_turn();
            };
            engine.select_dice(&best.indices)?;

            let round = engine.current_player().map(|p| p.round_score).unwrap_or(0);
            let pending = round + engine.turn_score();
            let dice_left = if best.indices.len() == roll.len() {
                DICE_PER_ROLL
            } else {
                engine.remaining_dice() - best.indices.len()
            };
            if engine.can_player_bank() && self.should_bank(pending, dice_left) {
                return engine.bank_score();
            }
            engine.continue_rolling()?;
        }
    }

    /// Play turns until the game ends or `max_turns` is reached
    pub fn play_game(
        &self,
        engine: &mut GameEngine,
        max_turns: usize,
    ) -> Result<Vec<TurnOutcome>, GameError> {
        let mut outcomes = Vec::new();
        while engine.state() != GameState::GameOver && outcomes.len() < max_turns {
            outcomes.push(self.play_turn(engine)?);
        }
        Ok(outcomes)
    }
}
