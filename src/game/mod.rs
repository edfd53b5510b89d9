//! Game logic: players, turns, the turn/game state machine

pub mod autoplay;
pub mod dice;

use crate::rules::{GameSettings, ScoringRulesStore};
use crate::scoring::{ScoringEngine, ScoringOption, SelectionValidation, DICE_PER_ROLL};
use dice::{DiceSource, RandomDice};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::debug;

pub use autoplay::AutoPlayer;

/// Consecutive farkles that trigger the penalty
pub const FARKLE_LIMIT: u8 = 3;

/// Stable player identifier
pub type PlayerId = u32;

/// Global phase of a game
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameState {
    Setup,
    Playing,
    FinalRound,
    GameOver,
}

impl GameState {
    pub fn is_active(self) -> bool {
        matches!(self, GameState::Playing | GameState::FinalRound)
    }
}

/// A finished turn. Never modified once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub id: u64,
    pub score: u32,
    pub is_farkle: bool,
    pub dice_rolled: Vec<u8>,
    pub selected_dice: Vec<u8>,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    pub id: PlayerId,
    pub name: String,
    pub total_score: u32,
    /// Points accumulated this turn, not yet banked
    pub round_score: u32,
    /// Sticky once the opening threshold is met
    pub is_on_board: bool,
    pub consecutive_farkles: u8,
    pub turns: Vec<Turn>,
}

impl Player {
    pub fn new(id: PlayerId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            total_score: 0,
            round_score: 0,
            is_on_board: false,
            consecutive_farkles: 0,
            turns: Vec::new(),
        }
    }

    pub fn farkle_count(&self) -> usize {
        self.turns.iter().filter(|t| t.is_farkle).count()
    }
}

/// One roll within a turn and what was kept from it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollRecord {
    pub dice_rolled: Vec<u8>,
    pub dice_selected: Vec<u8>,
    pub score_from_selection: u32,
}

/// What a turn-ending operation did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    pub player_id: PlayerId,
    pub player_name: String,
    pub score_earned: u32,
    pub is_farkle: bool,
    pub skipped: bool,
    pub rolls: Vec<RollRecord>,
    pub new_total_score: u32,
    /// Points removed by the triple-farkle penalty
    pub penalty_applied: u32,
}

impl TurnOutcome {
    pub fn to_submission(&self) -> SubmittedTurnResult {
        SubmittedTurnResult {
            player_id: self.player_id,
            player_name: self.player_name.clone(),
            score_earned: self.score_earned,
            is_farkle: self.is_farkle,
            rolls: self.rolls.clone(),
            new_total_score: self.new_total_score,
        }
    }
}

/// A finalized turn as sent to the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedTurnResult {
    pub player_id: PlayerId,
    pub player_name: String,
    pub score_earned: u32,
    pub is_farkle: bool,
    pub rolls: Vec<RollRecord>,
    pub new_total_score: u32,
}

impl SubmittedTurnResult {
    /// A zero-score result for a forfeited turn
    pub fn skipped(player: &Player) -> Self {
        Self {
            player_id: player.id,
            player_name: player.name.clone(),
            score_earned: 0,
            is_farkle: false,
            rolls: Vec::new(),
            new_total_score: player.total_score,
        }
    }
}

/// A selection that failed validation, kept for display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedSelection {
    pub indices: Vec<usize>,
    pub validation: SelectionValidation,
}

/// Immutable view of the engine at one point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameSnapshot {
    pub state: GameState,
    pub players: Vec<Player>,
    pub current_player: Option<PlayerId>,
    pub current_roll: Vec<u8>,
    pub selected_indices: Vec<usize>,
    pub turn_score: u32,
    pub round_score: u32,
    pub remaining_dice: usize,
    pub roll_count: u32,
    pub pending_farkle: bool,
    pub rejected: Option<RejectedSelection>,
    pub can_bank: bool,
    pub can_continue: bool,
    pub final_round_trigger: Option<PlayerId>,
}

impl GameSnapshot {
    pub fn player(&self, id: PlayerId) -> Option<&Player> {
        self.players.iter().find(|p| p.id == id)
    }

    /// Values of the currently accepted selection
    pub fn selected_dice(&self) -> Vec<u8> {
        self.selected_indices
            .iter()
            .filter_map(|&i| self.current_roll.get(i).copied())
            .collect()
    }
}

/// Result of a finished game, for the history store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameSummary {
    pub players: Vec<PlayerSummary>,
    pub winner: Option<String>,
    pub finished_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerSummary {
    pub name: String,
    pub total_score: u32,
    pub turns: usize,
    pub farkles: usize,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GameError {
    #[error("not allowed while the game is {0:?}")]
    WrongState(GameState),

    #[error("no dice have been rolled")]
    NoActiveRoll,

    #[error("dice already rolled; select, bank, or continue")]
    AlreadyRolled,

    #[error("farkle must be acknowledged first")]
    PendingFarkle,

    #[error("no farkle to acknowledge")]
    NoPendingFarkle,

    #[error("invalid selection: {reason}")]
    InvalidSelection {
        reason: String,
        invalid_indices: BTreeSet<usize>,
    },

    #[error("select scoring dice first")]
    NoSelection,

    #[error("the last selection was rejected; fix or undo it")]
    RejectedSelectionOutstanding,

    #[error("need {needed} points to get on the board, have {have}")]
    IneligibleBank { needed: u32, have: u32 },

    #[error("nothing to undo")]
    NothingToUndo,

    #[error("unknown player {0}")]
    UnknownPlayer(PlayerId),

    #[error("at least one player is required")]
    NoPlayers,

    #[error("player name cannot be empty")]
    EmptyName,
}

#[derive(Debug, Clone)]
struct TurnState {
    current_roll: Vec<u8>,
    selected: Vec<usize>,
    turn_score: u32,
    remaining_dice: usize,
    roll_count: u32,
    pending_farkle: bool,
    rejected: Option<RejectedSelection>,
    /// One level of undo: (selection, turn score)
    previous: Option<(Vec<usize>, u32)>,
    rolls: Vec<RollRecord>,
}

impl Default for TurnState {
    fn default() -> Self {
        Self {
            current_roll: Vec::new(),
            selected: Vec::new(),
            turn_score: 0,
            remaining_dice: DICE_PER_ROLL,
            roll_count: 0,
            pending_farkle: false,
            rejected: None,
            previous: None,
            rolls: Vec::new(),
        }
    }
}

impl TurnState {
    fn has_roll(&self) -> bool {
        !self.current_roll.is_empty()
    }

    fn selected_values(&self) -> Vec<u8> {
        self.selected.iter().map(|&i| self.current_roll[i]).collect()
    }

    fn record_current_roll(&mut self) {
        if self.has_roll() {
            self.rolls.push(RollRecord {
                dice_rolled: self.current_roll.clone(),
                dice_selected: self.selected_values(),
                score_from_selection: self.turn_score,
            });
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The turn/game state machine.
///
/// Operations invoked outside their legal state return an error and
/// change nothing. Every mutation publishes a fresh snapshot to subscribers.
pub struct GameEngine {
    rules: ScoringRulesStore,
    settings: GameSettings,
    players: Vec<Player>,
    current: usize,
    state: GameState,
    final_round_trigger: Option<PlayerId>,
    turn: TurnState,
    dice: Box<dyn DiceSource>,
    next_player_id: PlayerId,
    next_turn_id: u64,
    last_outcome: Option<TurnOutcome>,
    subscribers: Vec<Sender<GameSnapshot>>,
    /// Ends the game after the first finished turn
    single_turn: bool,
}

impl GameEngine {
    /// Create an engine in `Setup` with random dice
    pub fn new(rules: ScoringRulesStore, settings: GameSettings) -> Self {
        Self::with_dice(rules, settings, Box::new(RandomDice::new()))
    }

    pub fn with_dice(
        rules: ScoringRulesStore,
        settings: GameSettings,
        dice: Box<dyn DiceSource>,
    ) -> Self {
        Self {
            rules,
            settings,
            players: Vec::new(),
            current: 0,
            state: GameState::Setup,
            final_round_trigger: None,
            turn: TurnState::default(),
            dice,
            next_player_id: 1,
            next_turn_id: 1,
            last_outcome: None,
            subscribers: Vec::new(),
            single_turn: false,
        }
    }

    /// A one-player engine for playing a single turn of `player`.
    ///
    /// The copy keeps the player's total, on-board flag and farkle counter.
    /// Banking, farkling or skipping moves the engine to `GameOver`.
    pub fn for_single_turn(
        player: &Player,
        rules: ScoringRulesStore,
        settings: GameSettings,
        dice: Box<dyn DiceSource>,
    ) -> Self {
        let mut engine = Self::with_dice(rules, settings, dice);
        let mut copy = player.clone();
        copy.round_score = 0;
        copy.turns.clear();
        engine.next_player_id = copy.id.wrapping_add(1);
        engine.players.push(copy);
        engine.state = GameState::Playing;
        engine.single_turn = true;
        engine
    }

    // Setup

    pub fn add_player(&mut self, name: &str) -> Result<PlayerId, GameError> {
        self.require_state(GameState::Setup)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(GameError::EmptyName);
        }
        let id = self.next_player_id;
        self.next_player_id += 1;
        self.players.push(Player::new(id, name));
        self.publish();
        Ok(id)
    }

    /// Add a player with a known id, e.g. one assigned by a host
    pub fn add_player_with_id(&mut self, id: PlayerId, name: &str) -> Result<(), GameError> {
        self.require_state(GameState::Setup)?;
        if name.trim().is_empty() {
            return Err(GameError::EmptyName);
        }
        self.players.push(Player::new(id, name.trim()));
        self.next_player_id = self.next_player_id.max(id.wrapping_add(1));
        self.publish();
        Ok(())
    }

    pub fn remove_player(&mut self, id: PlayerId) -> Result<Player, GameError> {
        self.require_state(GameState::Setup)?;
        let index = self.index_of(id)?;
        let player = self.players.remove(index);
        self.publish();
        Ok(player)
    }

    pub fn start_game(&mut self) -> Result<(), GameError> {
        self.require_state(GameState::Setup)?;
        if self.players.is_empty() {
            return Err(GameError::NoPlayers);
        }
        self.state = GameState::Playing;
        self.current = 0;
        self.final_round_trigger = None;
        self.turn = TurnState::default();
        debug!("Game started with {} players", self.players.len());
        self.publish();
        Ok(())
    }

    /// Reset scores and history, keeping the roster, and return to `Setup`
    pub fn new_game(&mut self) {
        for player in &mut self.players {
            *player = Player::new(player.id, player.name.clone());
        }
        self.state = GameState::Setup;
        self.current = 0;
        self.final_round_trigger = None;
        self.turn = TurnState::default();
        self.last_outcome = None;
        self.publish();
    }

    // Turn operations

    /// Roll the remaining dice. A roll with no scoring dice leaves a pending farkle.
    pub fn roll_dice(&mut self) -> Result<Vec<u8>, GameError> {
        self.require_active()?;
        if self.turn.pending_farkle {
            return Err(GameError::PendingFarkle);
        }
        if self.turn.has_roll() {
            return Err(GameError::AlreadyRolled);
        }
        let roll = self.roll_internal();
        self.publish();
        Ok(roll)
    }

    fn roll_internal(&mut self) -> Vec<u8> {
        let count = self.turn.remaining_dice.clamp(1, DICE_PER_ROLL);
        let roll = self.dice.roll(count);
        self.turn.current_roll = roll.clone();
        self.turn.selected.clear();
        self.turn.turn_score = 0;
        self.turn.previous = None;
        self.turn.rejected = None;
        self.turn.roll_count += 1;

        if ScoringEngine::new(&self.rules).is_farkle(&roll) {
            self.turn.pending_farkle = true;
            let player = &mut self.players[self.current];
            player.consecutive_farkles = player.consecutive_farkles.saturating_add(1);
            debug!("{} farkled on {:?}", player.name, roll);
        }
        roll
    }

    /// Propose a selection of dice from the current roll.
    ///
    /// An invalid selection is kept as a rejected attempt; the last accepted
    /// selection and its score stay in place.
    pub fn select_dice(&mut self, indices: &[usize]) -> Result<SelectionValidation, GameError> {
        self.require_active()?;
        if self.turn.pending_farkle {
            return Err(GameError::PendingFarkle);
        }
        if !self.turn.has_roll() {
            return Err(GameError::NoActiveRoll);
        }

        let validation =
            ScoringEngine::new(&self.rules).validate_selection(indices, &self.turn.current_roll);
        if !validation.is_valid {
            let error = GameError::InvalidSelection {
                reason: validation
                    .reason
                    .as_ref()
                    .map(|r| r.message())
                    .unwrap_or_default(),
                invalid_indices: validation.invalid_indices.clone(),
            };
            self.turn.rejected = Some(RejectedSelection {
                indices: indices.to_vec(),
                validation,
            });
            self.publish();
            return Err(error);
        }

        let mut selected = indices.to_vec();
        selected.sort_unstable();
        self.turn.previous = Some((
            std::mem::replace(&mut self.turn.selected, selected),
            self.turn.turn_score,
        ));
        self.turn.turn_score = validation.score;
        self.turn.rejected = None;
        self.publish();
        Ok(validation)
    }

    /// Revert to the selection before the last accepted one, or clear a rejected attempt
    pub fn undo_last_selection(&mut self) -> Result<(), GameError> {
        self.require_active()?;
        if let Some((selected, score)) = self.turn.previous.take() {
            self.turn.selected = selected;
            self.turn.turn_score = score;
            self.turn.rejected = None;
        } else if self.turn.rejected.take().is_none() {
            return Err(GameError::NothingToUndo);
        }
        self.publish();
        Ok(())
    }

    /// Keep the selection and roll the rest, or all six on hot dice
    pub fn continue_rolling(&mut self) -> Result<Vec<u8>, GameError> {
        self.check_selection_ready()?;

        self.turn.record_current_roll();
        self.players[self.current].round_score += self.turn.turn_score;
        let hot_dice = self.turn.selected.len() == self.turn.current_roll.len();
        self.turn.remaining_dice = if hot_dice {
            debug!("Hot dice");
            DICE_PER_ROLL
        } else {
            self.turn.remaining_dice - self.turn.selected.len()
        };

        let roll = self.roll_internal();
        self.publish();
        Ok(roll)
    }

    /// Bank round and turn points into the player's total and end the turn
    pub fn bank_score(&mut self) -> Result<TurnOutcome, GameError> {
        self.check_selection_ready()?;
        self.check_opening()?;

        self.turn.record_current_roll();
        let index = self.current;
        let earned = self.players[index].round_score + self.turn.turn_score;
        let rolls = std::mem::take(&mut self.turn.rolls);
        let turn = self.make_turn(earned, false, &rolls);

        let player = &mut self.players[index];
        player.total_score += earned;
        player.round_score = 0;
        player.is_on_board = true;
        player.consecutive_farkles = 0;
        player.turns.push(turn);
        let outcome = TurnOutcome {
            player_id: player.id,
            player_name: player.name.clone(),
            score_earned: earned,
            is_farkle: false,
            skipped: false,
            rolls,
            new_total_score: player.total_score,
            penalty_applied: 0,
        };
        debug!("{} banked {} (total {})", player.name, earned, player.total_score);

        self.check_final_round(index);
        self.last_outcome = Some(outcome.clone());
        self.advance();
        self.publish();
        Ok(outcome)
    }

    /// Forfeit the round's points after a farkle and end the turn
    pub fn acknowledge_farkle(&mut self) -> Result<TurnOutcome, GameError> {
        self.require_active()?;
        if !self.turn.pending_farkle {
            return Err(GameError::NoPendingFarkle);
        }

        self.turn.record_current_roll();
        let rolls = std::mem::take(&mut self.turn.rolls);
        let turn = self.make_turn(0, true, &rolls);
        let (enabled, amount) = (
            self.settings.enable_triple_farkle_rule,
            self.settings.triple_farkle_penalty,
        );

        let player = &mut self.players[self.current];
        player.round_score = 0;
        player.turns.push(turn);
        let penalty_applied = apply_farkle_penalty(player, enabled, amount);
        let outcome = TurnOutcome {
            player_id: player.id,
            player_name: player.name.clone(),
            score_earned: 0,
            is_farkle: true,
            skipped: false,
            rolls,
            new_total_score: player.total_score,
            penalty_applied,
        };

        self.last_outcome = Some(outcome.clone());
        self.advance();
        self.publish();
        Ok(outcome)
    }

    /// End the turn without banking
    pub fn skip_turn(&mut self) -> Result<TurnOutcome, GameError> {
        self.require_active()?;
        if self.turn.pending_farkle {
            return Err(GameError::PendingFarkle);
        }

        let rolls = std::mem::take(&mut self.turn.rolls);
        let turn = self.make_turn(0, false, &rolls);
        let player = &mut self.players[self.current];
        player.round_score = 0;
        player.turns.push(turn);
        let outcome = TurnOutcome {
            player_id: player.id,
            player_name: player.name.clone(),
            score_earned: 0,
            is_farkle: false,
            skipped: true,
            rolls,
            new_total_score: player.total_score,
            penalty_applied: 0,
        };

        self.last_outcome = Some(outcome.clone());
        self.advance();
        self.publish();
        Ok(outcome)
    }

    // Host-side application of remote turns

    /// Apply a submitted turn to the canonical player record.
    ///
    /// The new total is recomputed with this engine's rules; the submitted
    /// total is not trusted. Returns the recomputed total.
    pub fn apply_turn_result(&mut self, result: &SubmittedTurnResult) -> Result<u32, GameError> {
        self.require_active()?;
        let index = self.index_of(result.player_id)?;
        let settings = &self.settings;
        let mut player = self.players[index].clone();

        if result.is_farkle {
            player.consecutive_farkles = player.consecutive_farkles.saturating_add(1);
            apply_farkle_penalty(
                &mut player,
                settings.enable_triple_farkle_rule,
                settings.triple_farkle_penalty,
            );
        } else if result.score_earned > 0 {
            if settings.require_opening_score
                && !player.is_on_board
                && result.score_earned < settings.opening_score_threshold
            {
                return Err(GameError::IneligibleBank {
                    needed: settings.opening_score_threshold,
                    have: result.score_earned,
                });
            }
            player.total_score += result.score_earned;
            player.is_on_board = true;
            player.consecutive_farkles = 0;
        }

        let dice_rolled = result.rolls.iter().flat_map(|r| r.dice_rolled.clone()).collect();
        let selected_dice = result.rolls.iter().flat_map(|r| r.dice_selected.clone()).collect();
        player.turns.push(Turn {
            id: self.next_turn_id,
            score: if result.is_farkle { 0 } else { result.score_earned },
            is_farkle: result.is_farkle,
            dice_rolled,
            selected_dice,
            timestamp_ms: now_ms(),
        });
        self.next_turn_id += 1;

        let total = player.total_score;
        self.players[index] = player;
        self.check_final_round(index);
        self.publish();
        Ok(total)
    }

    /// End the game regardless of turn order
    pub fn finish_game(&mut self) {
        if self.state != GameState::GameOver {
            self.state = GameState::GameOver;
            self.turn = TurnState::default();
            debug!("Game over");
            self.publish();
        }
    }

    // Queries

    /// Whether the current player may bank now
    pub fn can_player_bank(&self) -> bool {
        self.check_selection_ready().is_ok() && self.check_opening().is_ok()
    }

    pub fn can_player_continue_rolling(&self) -> bool {
        self.check_selection_ready().is_ok()
    }

    /// Players by total score, highest first; ties keep seating order
    pub fn get_player_ranking(&self) -> Vec<&Player> {
        let mut ranking: Vec<&Player> = self.players.iter().collect();
        ranking.sort_by(|a, b| b.total_score.cmp(&a.total_score));
        ranking
    }

    pub fn get_possible_scorings(&self, roll: &[u8]) -> Vec<ScoringOption> {
        ScoringEngine::new(&self.rules).suggest_selections(roll)
    }

    pub fn state(&self) -> GameState {
        self.state
    }

    pub fn players(&self) -> &[Player] {
        &self.players
    }

    pub fn player(&self, id: PlayerId) -> Option<&Player> {
        self.players.iter().find(|p| p.id == id)
    }

    pub fn current_player(&self) -> Option<&Player> {
        if self.state.is_active() {
            self.players.get(self.current)
        } else {
            None
        }
    }

    pub fn current_roll(&self) -> &[u8] {
        &self.turn.current_roll
    }

    pub fn turn_score(&self) -> u32 {
        self.turn.turn_score
    }

    pub fn remaining_dice(&self) -> usize {
        self.turn.remaining_dice
    }

    pub fn is_pending_farkle(&self) -> bool {
        self.turn.pending_farkle
    }

    /// How the most recently ended turn finished
    pub fn last_outcome(&self) -> Option<&TurnOutcome> {
        self.last_outcome.as_ref()
    }

    pub fn final_round_trigger(&self) -> Option<PlayerId> {
        self.final_round_trigger
    }

    pub fn rules(&self) -> &ScoringRulesStore {
        &self.rules
    }

    pub fn settings(&self) -> &GameSettings {
        &self.settings
    }

    pub fn winner(&self) -> Option<&Player> {
        if self.state == GameState::GameOver {
            self.get_player_ranking().first().copied()
        } else {
            None
        }
    }

    pub fn summary(&self) -> GameSummary {
        GameSummary {
            players: self
                .get_player_ranking()
                .into_iter()
                .map(|p| PlayerSummary {
                    name: p.name.clone(),
                    total_score: p.total_score,
                    turns: p.turns.len(),
                    farkles: p.farkle_count(),
                })
                .collect(),
            winner: self.winner().map(|p| p.name.clone()),
            finished_at_ms: now_ms(),
        }
    }

    // Observation

    pub fn snapshot(&self) -> GameSnapshot {
        let current = self.current_player();
        GameSnapshot {
            state: self.state,
            players: self.players.clone(),
            current_player: current.map(|p| p.id),
            current_roll: self.turn.current_roll.clone(),
            selected_indices: self.turn.selected.clone(),
            turn_score: self.turn.turn_score,
            round_score: current.map(|p| p.round_score).unwrap_or(0),
            remaining_dice: self.turn.remaining_dice,
            roll_count: self.turn.roll_count,
            pending_farkle: self.turn.pending_farkle,
            rejected: self.turn.rejected.clone(),
            can_bank: self.can_player_bank(),
            can_continue: self.can_player_continue_rolling(),
            final_round_trigger: self.final_round_trigger,
        }
    }

    /// Receive a snapshot now and after every mutation
    pub fn subscribe(&mut self) -> Receiver<GameSnapshot> {
        let (tx, rx) = mpsc::channel();
        let _ = tx.send(self.snapshot());
        self.subscribers.push(tx);
        rx
    }

    /// Close every subscription
    pub fn unsubscribe_all(&mut self) {
        self.subscribers.clear();
    }

    fn publish(&mut self) {
        if self.subscribers.is_empty() {
            return;
        }
        let snapshot = self.snapshot();
        self.subscribers.retain(|tx| tx.send(snapshot.clone()).is_ok());
    }

    // Guards and transitions

    fn require_state(&self, state: GameState) -> Result<(), GameError> {
        if self.state == state {
            Ok(())
        } else {
            Err(GameError::WrongState(self.state))
        }
    }

    fn require_active(&self) -> Result<(), GameError> {
        if self.state.is_active() && !self.players.is_empty() {
            Ok(())
        } else {
            Err(GameError::WrongState(self.state))
        }
    }

    fn check_selection_ready(&self) -> Result<(), GameError> {
        self.require_active()?;
        if self.turn.pending_farkle {
            return Err(GameError::PendingFarkle);
        }
        if !self.turn.has_roll() {
            return Err(GameError::NoActiveRoll);
        }
        if self.turn.rejected.is_some() {
            return Err(GameError::RejectedSelectionOutstanding);
        }
        if self.turn.selected.is_empty() || self.turn.turn_score == 0 {
            return Err(GameError::NoSelection);
        }
        Ok(())
    }

    fn check_opening(&self) -> Result<(), GameError> {
        let player = &self.players[self.current];
        let have = player.round_score + self.turn.turn_score;
        let needed = self.settings.opening_score_threshold;
        if self.settings.require_opening_score && !player.is_on_board && have < needed {
            return Err(GameError::IneligibleBank { needed, have });
        }
        Ok(())
    }

    fn check_final_round(&mut self, index: usize) {
        let player = &self.players[index];
        if self.state == GameState::Playing && player.total_score >= self.settings.winning_score {
            debug!("{} reached {}; final round", player.name, player.total_score);
            self.state = GameState::FinalRound;
            self.final_round_trigger = Some(player.id);
        }
    }

    fn advance(&mut self) {
        self.turn = TurnState::default();
        if self.single_turn {
            self.state = GameState::GameOver;
            return;
        }
        if self.players.is_empty() {
            return;
        }
        let next = (self.current + 1) % self.players.len();
        if self.state == GameState::FinalRound
            && Some(self.players[next].id) == self.final_round_trigger
        {
            self.state = GameState::GameOver;
            debug!("Final round complete");
            return;
        }
        self.current = next;
    }

    fn make_turn(&mut self, score: u32, is_farkle: bool, rolls: &[RollRecord]) -> Turn {
        let id = self.next_turn_id;
        self.next_turn_id += 1;
        Turn {
            id,
            score,
            is_farkle,
            dice_rolled: rolls.iter().flat_map(|r| r.dice_rolled.iter().copied()).collect(),
            selected_dice: rolls
                .iter()
                .flat_map(|r| r.dice_selected.iter().copied())
                .collect(),
            timestamp_ms: now_ms(),
        }
    }

    fn index_of(&self, id: PlayerId) -> Result<usize, GameError> {
        self.players
            .iter()
            .position(|p| p.id == id)
            .ok_or(GameError::UnknownPlayer(id))
    }
}

/// Apply the triple-farkle rule to a player whose counter was already
/// incremented for this farkle. Returns the points removed.
fn apply_farkle_penalty(player: &mut Player, enabled: bool, amount: u32) -> u32 {
    if player.consecutive_farkles < FARKLE_LIMIT {
        return 0;
    }
    player.consecutive_farkles = 0;
    if !enabled {
        return 0;
    }
    let penalty = amount.min(player.total_score);
    player.total_score -= penalty;
    debug!("{} loses {} for three farkles", player.name, penalty);
    penalty
}
