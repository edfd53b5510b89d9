//! Round arbitration for multiplayer games
//!
//! The host runs the arbitrator. It owns the canonical engine, tracks one
//! status per player per round, and accepts at most one submitted turn per
//! player per round, applied in arrival order.

use crate::game::{GameEngine, GameError, GameState, Player, PlayerId, SubmittedTurnResult};
use crate::scoring::{ScoringEngine, DICE_PER_ROLL};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Where a player's turn stands in the current round.
///
/// Transitions only move forward: pending -> in progress -> submitted,
/// and pending or in progress -> skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Pending,
    InProgress,
    Submitted,
    Skipped,
}

impl TurnStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, TurnStatus::Submitted | TurnStatus::Skipped)
    }

    /// Whether moving to `next` keeps the status monotonic
    pub fn can_become(self, next: TurnStatus) -> bool {
        match (self, next) {
            (TurnStatus::Pending, TurnStatus::InProgress) => true,
            (TurnStatus::Pending | TurnStatus::InProgress, TurnStatus::Submitted) => true,
            (TurnStatus::Pending | TurnStatus::InProgress, TurnStatus::Skipped) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRoundStatus {
    pub player_id: PlayerId,
    pub player_name: String,
    pub status: TurnStatus,
    /// Set once the turn is finished; 0 for skipped turns
    pub score_earned: Option<u32>,
    /// Unset for skipped turns
    pub is_farkle: Option<bool>,
}

impl PlayerRoundStatus {
    fn pending(player: &Player) -> Self {
        Self {
            player_id: player.id,
            player_name: player.name.clone(),
            status: TurnStatus::Pending,
            score_earned: None,
            is_farkle: None,
        }
    }

    fn skip(&mut self) {
        self.status = TurnStatus::Skipped;
        self.score_earned = Some(0);
        self.is_farkle = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    RoundInProgress,
    GameOver,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoundError {
    #[error("player {player_id} is already {status:?} this round")]
    StaleSubmission {
        player_id: PlayerId,
        status: TurnStatus,
    },

    #[error("submission for round {submitted} arrived during round {current}")]
    WrongRound { submitted: u32, current: u32 },

    #[error("invalid submission: {0}")]
    InvalidSubmission(String),

    #[error("unknown player {0}")]
    UnknownPlayer(PlayerId),

    #[error("the game is over")]
    GameOver,

    #[error("round {0} is still in progress")]
    RoundInProgress(u32),
}

impl RoundError {
    /// Late or duplicate traffic that is dropped without telling the sender
    pub fn is_stale(&self) -> bool {
        match self {
            RoundError::StaleSubmission { .. } => true,
            RoundError::WrongRound { submitted, current } => submitted < current,
            _ => false,
        }
    }
}

/// A round whose statuses are all finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundCompletion {
    pub round: u32,
    pub game_over: bool,
}

/// What an accepted submission did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    pub player_id: PlayerId,
    /// Recomputed by the host
    pub new_total: u32,
    pub completion: Option<RoundCompletion>,
}

/// What starting the next round did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundAdvance {
    Started { round: u32, final_round: bool },
    GameOver,
}

pub struct RoundArbitrator {
    engine: GameEngine,
    round: u32,
    phase: RoundPhase,
    final_round: bool,
    statuses: Vec<PlayerRoundStatus>,
    /// Players in the order their submissions were accepted this round
    arrivals: Vec<PlayerId>,
}

impl RoundArbitrator {
    /// Start round 1 over a started canonical engine
    pub fn new(mut engine: GameEngine) -> Result<Self, RoundError> {
        if engine.state() == GameState::Setup {
            engine.start_game()?;
        }
        if engine.state() == GameState::GameOver {
            return Err(RoundError::GameOver);
        }
        let statuses = engine.players().iter().map(PlayerRoundStatus::pending).collect();
        Ok(Self {
            engine,
            round: 1,
            phase: RoundPhase::RoundInProgress,
            final_round: false,
            statuses,
            arrivals: Vec::new(),
        })
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn phase(&self) -> RoundPhase {
        self.phase
    }

    pub fn is_final_round(&self) -> bool {
        self.final_round
    }

    pub fn engine(&self) -> &GameEngine {
        &self.engine
    }

    pub fn players(&self) -> &[Player] {
        self.engine.players()
    }

    pub fn statuses(&self) -> &[PlayerRoundStatus] {
        &self.statuses
    }

    pub fn status(&self, player_id: PlayerId) -> Option<TurnStatus> {
        self.statuses
            .iter()
            .find(|s| s.player_id == player_id)
            .map(|s| s.status)
    }

    /// Players whose submissions were accepted this round, in arrival order
    pub fn arrivals(&self) -> &[PlayerId] {
        &self.arrivals
    }

    /// Number of finished statuses this round
    pub fn finished_count(&self) -> usize {
        self.statuses.iter().filter(|s| s.status.is_finished()).count()
    }

    pub fn is_round_complete(&self) -> bool {
        self.statuses.iter().all(|s| s.status.is_finished())
    }

    fn status_mut(&mut self, player_id: PlayerId) -> Result<&mut PlayerRoundStatus, RoundError> {
        self.statuses
            .iter_mut()
            .find(|s| s.player_id == player_id)
            .ok_or(RoundError::UnknownPlayer(player_id))
    }

    fn check_round(&self, round: u32) -> Result<(), RoundError> {
        if self.phase == RoundPhase::GameOver {
            return Err(RoundError::GameOver);
        }
        if round != self.round {
            return Err(RoundError::WrongRound {
                submitted: round,
                current: self.round,
            });
        }
        Ok(())
    }

    /// Record that a player's turn has begun. Returns false if it already had.
    pub fn mark_in_progress(&mut self, round: u32, player_id: PlayerId) -> Result<bool, RoundError> {
        self.check_round(round)?;
        let entry = self.status_mut(player_id)?;
        match entry.status {
            TurnStatus::Pending => {
                entry.status = TurnStatus::InProgress;
                Ok(true)
            }
            TurnStatus::InProgress => Ok(false),
            status => Err(RoundError::StaleSubmission { player_id, status }),
        }
    }

    /// Accept a player's finished turn and apply it to the canonical engine
    pub fn submit(
        &mut self,
        round: u32,
        result: &SubmittedTurnResult,
    ) -> Result<Accepted, RoundError> {
        self.check_round(round)?;
        let player_id = result.player_id;
        let status = self.status_mut(player_id)?.status;
        if status.is_finished() {
            warn!("Stale submission for player {} ({:?})", player_id, status);
            return Err(RoundError::StaleSubmission { player_id, status });
        }
        self.verify(result)?;

        let new_total = self.engine.apply_turn_result(result)?;
        if new_total != result.new_total_score {
            warn!(
                "Player {} claimed total {}, host computed {}",
                player_id, result.new_total_score, new_total
            );
        }

        let entry = self.status_mut(player_id)?;
        entry.status = TurnStatus::Submitted;
        entry.score_earned = Some(if result.is_farkle { 0 } else { result.score_earned });
        entry.is_farkle = Some(result.is_farkle);
        self.arrivals.push(player_id);
        info!(
            "Round {}: {} scored {} ({}/{})",
            self.round,
            result.player_name,
            result.score_earned,
            self.finished_count(),
            self.statuses.len()
        );

        Ok(Accepted {
            player_id,
            new_total,
            completion: self.complete_if_done(),
        })
    }

    /// Check a submission's roll records against the host's own rules
    fn verify(&self, result: &SubmittedTurnResult) -> Result<(), RoundError> {
        let invalid = |msg: String| Err(RoundError::InvalidSubmission(msg));
        let scoring = ScoringEngine::new(self.engine.rules());
        let mut kept = 0u32;

        for (i, roll) in result.rolls.iter().enumerate() {
            if roll.dice_rolled.is_empty()
                || roll.dice_rolled.len() > DICE_PER_ROLL
                || !roll.dice_rolled.iter().all(|d| (1..=6).contains(d))
            {
                return invalid(format!("roll {} is not a roll of dice", i + 1));
            }
            if roll.dice_selected.is_empty() {
                continue;
            }
            match scoring.score_values(&roll.dice_rolled, &roll.dice_selected) {
                Some(score) if score == roll.score_from_selection => kept += score,
                Some(score) => {
                    return invalid(format!(
                        "roll {} selection scores {}, not {}",
                        i + 1,
                        score,
                        roll.score_from_selection
                    ))
                }
                None => return invalid(format!("roll {} selection does not score", i + 1)),
            }
        }

        if result.is_farkle && result.score_earned != 0 {
            return invalid("a farkle earns nothing".to_string());
        }
        if !result.is_farkle && result.score_earned > 0 && result.score_earned != kept {
            return invalid(format!(
                "earned {} but rolls add up to {}",
                result.score_earned, kept
            ));
        }
        Ok(())
    }

    /// Skip every unfinished player. Returns the players skipped; empty if
    /// nothing was pending, in which case nothing changes.
    pub fn force_advance(
        &mut self,
        reason: &str,
    ) -> Result<(Vec<PlayerId>, Option<RoundCompletion>), RoundError> {
        if self.phase == RoundPhase::GameOver {
            return Err(RoundError::GameOver);
        }
        let skipped: Vec<PlayerId> = self
            .statuses
            .iter()
            .filter(|s| !s.status.is_finished())
            .map(|s| s.player_id)
            .collect();
        if skipped.is_empty() {
            return Ok((skipped, None));
        }

        info!("Round {} force-advanced: {}", self.round, reason);
        for &player_id in &skipped {
            if let Some(player) = self.engine.player(player_id).cloned() {
                if let Err(e) = self
                    .engine
                    .apply_turn_result(&SubmittedTurnResult::skipped(&player))
                {
                    warn!("Could not record skipped turn for {}: {}", player.name, e);
                }
            }
            self.status_mut(player_id)?.skip();
        }
        Ok((skipped, self.complete_if_done()))
    }

    fn complete_if_done(&mut self) -> Option<RoundCompletion> {
        if !self.is_round_complete() {
            return None;
        }
        let game_over = self.final_round || self.engine.state() == GameState::GameOver;
        if game_over {
            self.phase = RoundPhase::GameOver;
            self.engine.finish_game();
            info!("Game over after round {}", self.round);
        } else {
            info!("Round {} complete", self.round);
        }
        Some(RoundCompletion {
            round: self.round,
            game_over,
        })
    }

    /// Begin the round after a completed one.
    ///
    /// Once someone has reached the winning score, the next round is the
    /// final round and the player who reached it sits out.
    pub fn start_next_round(&mut self) -> Result<RoundAdvance, RoundError> {
        if self.phase == RoundPhase::GameOver {
            return Err(RoundError::GameOver);
        }
        if !self.is_round_complete() {
            return Err(RoundError::RoundInProgress(self.round));
        }

        self.round += 1;
        self.arrivals.clear();
        self.statuses = self
            .engine
            .players()
            .iter()
            .map(PlayerRoundStatus::pending)
            .collect();

        if let Some(trigger) = self.engine.final_round_trigger() {
            self.final_round = true;
            if let Ok(entry) = self.status_mut(trigger) {
                entry.skip();
            }
            info!("Round {} is the final round", self.round);
            if let Some(completion) = self.complete_if_done() {
                if completion.game_over {
                    return Ok(RoundAdvance::GameOver);
                }
            }
        }

        Ok(RoundAdvance::Started {
            round: self.round,
            final_round: self.final_round,
        })
    }

    /// Highest total wins; None until the game is over
    pub fn winner(&self) -> Option<&Player> {
        if self.phase == RoundPhase::GameOver {
            self.engine.get_player_ranking().first().copied()
        } else {
            None
        }
    }
}

impl From<GameError> for RoundError {
    fn from(e: GameError) -> Self {
        RoundError::InvalidSubmission(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::RollRecord;
    use crate::rules::{GameSettings, ScoringRulesStore};

    fn arbitrator(names: &[&str], settings: GameSettings) -> RoundArbitrator {
        let mut engine = GameEngine::new(ScoringRulesStore::default(), settings);
        for name in names {
            engine.add_player(name).unwrap();
        }
        RoundArbitrator::new(engine).unwrap()
    }

    fn banked(player_id: PlayerId, name: &str, score: u32, total: u32) -> SubmittedTurnResult {
        let (rolled, selected) = match score {
            500 => (vec![5, 5, 5, 2, 3, 4], vec![5, 5, 5]),
            600 => (vec![1, 5, 5, 5, 2, 3], vec![1, 5, 5, 5]),
            1000 => (vec![1, 1, 1, 2, 3, 4], vec![1, 1, 1]),
            _ => (vec![1, 2, 3, 4, 6, 6], vec![1]),
        };
        SubmittedTurnResult {
            player_id,
            player_name: name.to_string(),
            score_earned: score,
            is_farkle: false,
            rolls: vec![RollRecord {
                dice_rolled: rolled,
                dice_selected: selected,
                score_from_selection: score,
            }],
            new_total_score: total,
        }
    }

    #[test]
    fn test_duplicate_submission_rejected() {
        let mut arb = arbitrator(&["A", "B", "C"], GameSettings::default());
        arb.submit(1, &banked(2, "B", 600, 600)).unwrap();
        assert_eq!(arb.finished_count(), 1);

        let err = arb.submit(1, &banked(2, "B", 600, 1200)).unwrap_err();
        assert_eq!(
            err,
            RoundError::StaleSubmission {
                player_id: 2,
                status: TurnStatus::Submitted
            }
        );
        assert!(err.is_stale());
        assert_eq!(arb.finished_count(), 1);
        assert_eq!(arb.players()[1].total_score, 600);

        arb.submit(1, &banked(1, "A", 100, 100)).unwrap();
        let last = arb.submit(1, &banked(3, "C", 500, 500)).unwrap();
        assert_eq!(
            last.completion,
            Some(RoundCompletion {
                round: 1,
                game_over: false
            })
        );
        assert_eq!(arb.statuses().len(), 3);
        assert_eq!(arb.arrivals(), &[2, 1, 3]);
    }

    #[test]
    fn test_force_advance_skips_pending() {
        let mut arb = arbitrator(&["A", "B", "C"], GameSettings::default());
        arb.submit(1, &banked(1, "A", 100, 100)).unwrap();
        arb.mark_in_progress(1, 2).unwrap();
        arb.submit(1, &banked(2, "B", 600, 600)).unwrap();

        let (skipped, completion) = arb.force_advance("C left").unwrap();
        assert_eq!(skipped, vec![3]);
        assert!(completion.is_some());
        let c = &arb.statuses()[2];
        assert_eq!(c.status, TurnStatus::Skipped);
        assert_eq!(c.score_earned, Some(0));
        assert_eq!(c.is_farkle, None);
    }

    #[test]
    fn test_force_advance_is_noop_when_all_finished() {
        let mut arb = arbitrator(&["A", "B"], GameSettings::default());
        arb.submit(1, &banked(1, "A", 100, 100)).unwrap();
        arb.submit(1, &banked(2, "B", 600, 600)).unwrap();
        let before = arb.statuses().to_vec();

        let (skipped, completion) = arb.force_advance("impatient").unwrap();
        assert!(skipped.is_empty());
        assert!(completion.is_none());
        assert_eq!(arb.statuses(), &before[..]);
        assert_eq!(arb.players()[0].turns.len(), 1);
    }

    #[test]
    fn test_status_never_regresses() {
        let mut arb = arbitrator(&["A"], GameSettings::default());
        assert_eq!(arb.mark_in_progress(1, 1), Ok(true));
        assert_eq!(arb.mark_in_progress(1, 1), Ok(false));
        arb.submit(1, &banked(1, "A", 100, 100)).unwrap();
        assert!(matches!(
            arb.mark_in_progress(1, 1),
            Err(RoundError::StaleSubmission { .. })
        ));
        assert!(!TurnStatus::Submitted.can_become(TurnStatus::InProgress));
        assert!(!TurnStatus::Skipped.can_become(TurnStatus::Submitted));
        assert!(TurnStatus::InProgress.can_become(TurnStatus::Skipped));
    }

    #[test]
    fn test_next_round_needs_completion() {
        let mut arb = arbitrator(&["A", "B"], GameSettings::default());
        assert_eq!(arb.start_next_round(), Err(RoundError::RoundInProgress(1)));
        arb.force_advance("test").unwrap();
        assert_eq!(
            arb.start_next_round(),
            Ok(RoundAdvance::Started {
                round: 2,
                final_round: false
            })
        );
        assert!(arb.statuses().iter().all(|s| s.status == TurnStatus::Pending));
    }

    #[test]
    fn test_late_submission_for_old_round() {
        let mut arb = arbitrator(&["A", "B"], GameSettings::default());
        arb.force_advance("test").unwrap();
        arb.start_next_round().unwrap();
        let err = arb.submit(1, &banked(1, "A", 100, 100)).unwrap_err();
        assert!(err.is_stale());
        assert_eq!(arb.players()[0].total_score, 0);
    }

    #[test]
    fn test_inconsistent_submission_rejected() {
        let mut arb = arbitrator(&["A"], GameSettings::default());
        let mut result = banked(1, "A", 600, 600);
        result.rolls[0].score_from_selection = 900;
        assert!(matches!(
            arb.submit(1, &result),
            Err(RoundError::InvalidSubmission(_))
        ));

        let mut result = banked(1, "A", 600, 600);
        result.score_earned = 5000;
        assert!(matches!(
            arb.submit(1, &result),
            Err(RoundError::InvalidSubmission(_))
        ));

        let mut result = banked(1, "A", 600, 600);
        result.rolls[0].dice_selected = vec![5, 5];
        assert!(matches!(
            arb.submit(1, &result),
            Err(RoundError::InvalidSubmission(_))
        ));
        assert_eq!(arb.status(1), Some(TurnStatus::Pending));
    }

    #[test]
    fn test_final_round_then_game_over() {
        let settings = GameSettings {
            winning_score: 1000,
            ..GameSettings::default()
        };
        let mut arb = arbitrator(&["A", "B"], settings);
        arb.submit(1, &banked(1, "A", 1000, 1000)).unwrap();
        assert!(arb.submit(1, &banked(2, "B", 100, 100)).unwrap().completion.is_some());
        assert_eq!(arb.phase(), RoundPhase::RoundInProgress);

        assert_eq!(
            arb.start_next_round(),
            Ok(RoundAdvance::Started {
                round: 2,
                final_round: true
            })
        );
        assert_eq!(arb.status(1), Some(TurnStatus::Skipped));

        let done = arb.submit(2, &banked(2, "B", 600, 700)).unwrap();
        assert_eq!(
            done.completion,
            Some(RoundCompletion {
                round: 2,
                game_over: true
            })
        );
        assert_eq!(arb.phase(), RoundPhase::GameOver);
        assert_eq!(arb.winner().unwrap().name, "A");
        assert_eq!(arb.submit(2, &banked(2, "B", 100, 800)), Err(RoundError::GameOver));
        assert_eq!(arb.engine().state(), GameState::GameOver);
    }

    #[test]
    fn test_solo_final_round_ends_immediately() {
        let settings = GameSettings {
            winning_score: 500,
            ..GameSettings::default()
        };
        let mut arb = arbitrator(&["A"], settings);
        arb.submit(1, &banked(1, "A", 500, 500)).unwrap();
        assert_eq!(arb.start_next_round(), Ok(RoundAdvance::GameOver));
        assert_eq!(arb.phase(), RoundPhase::GameOver);
    }

    #[test]
    fn test_farkle_submission() {
        let mut arb = arbitrator(&["A"], GameSettings::default());
        let result = SubmittedTurnResult {
            player_id: 1,
            player_name: "A".to_string(),
            score_earned: 0,
            is_farkle: true,
            rolls: vec![RollRecord {
                dice_rolled: vec![2, 3, 4, 6, 2, 3],
                dice_selected: vec![],
                score_from_selection: 0,
            }],
            new_total_score: 0,
        };
        arb.submit(1, &result).unwrap();
        assert_eq!(arb.players()[0].consecutive_farkles, 1);
        assert_eq!(arb.statuses()[0].is_farkle, Some(true));
    }
}
