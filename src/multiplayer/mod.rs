//! Multiplayer coordination across devices
//!
//! The host holds the canonical game inside a `RoundArbitrator`. A device
//! plays its own players' turns on throwaway one-player engines, streams
//! progress while it plays, and submits the finished turn to the host.
//! Every device keeps a mirror of the canonical state built from the
//! host's broadcasts.

pub mod local_turn;
pub mod round;

pub use local_turn::{LocalTurn, ProgressTicker, PROGRESS_INTERVAL};
pub use round::{
    PlayerRoundStatus, RoundAdvance, RoundArbitrator, RoundCompletion, RoundError, RoundPhase,
    TurnStatus,
};

use crate::game::dice::{DiceSource, RandomDice};
use crate::game::{GameEngine, GameSnapshot, Player, PlayerId, SubmittedTurnResult};
use crate::network::{
    ConnectionState, DeviceId, DeviceInfo, Message, Session, SessionError, SessionEvent,
};
use crate::rules::{GameSettings, ScoringRulesStore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Live view of a turn in progress on some device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnProgressData {
    pub player_id: PlayerId,
    pub player_name: String,
    pub current_roll: Vec<u8>,
    pub selected_dice: Vec<u8>,
    /// Points accumulated this turn, including the current selection
    pub turn_score: u32,
    pub roll_count: u32,
    pub remaining_dice: usize,
    pub is_pending_farkle: bool,
}

impl TurnProgressData {
    pub fn from_engine(player_id: PlayerId, engine: &GameEngine) -> Self {
        Self::from_snapshot(player_id, &engine.snapshot())
    }

    pub fn from_snapshot(player_id: PlayerId, snapshot: &GameSnapshot) -> Self {
        Self {
            player_id,
            player_name: snapshot
                .player(player_id)
                .map(|p| p.name.clone())
                .unwrap_or_default(),
            selected_dice: snapshot.selected_dice(),
            turn_score: snapshot.round_score + snapshot.turn_score,
            current_roll: snapshot.current_roll.clone(),
            roll_count: snapshot.roll_count,
            remaining_dice: snapshot.remaining_dice,
            is_pending_farkle: snapshot.pending_farkle,
        }
    }
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("only the host can do that")]
    NotHost,

    #[error("player {0} is not controlled by this device")]
    NotOwner(PlayerId),

    #[error("no game has started")]
    GameNotStarted,

    #[error("unknown player {0}")]
    UnknownPlayer(PlayerId),

    #[error("no turn in progress for player {0}")]
    NoLocalTurn(PlayerId),

    #[error("player {0}'s turn has not ended")]
    TurnNotFinished(PlayerId),

    #[error("player {0} is in the middle of a turn")]
    TurnInProgress(PlayerId),

    #[error("player {0}'s turn is waiting for the host")]
    AwaitingHost(PlayerId),

    #[error("result does not match the turn played for player {0}")]
    ResultMismatch(PlayerId),

    #[error("lost connection to the host")]
    ConnectionLost,

    #[error(transparent)]
    Round(#[from] RoundError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Something the UI may want to react to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent {
    Connection(ConnectionState),
    DeviceJoined(DeviceInfo),
    /// A device dropped; `abandoned` lists its players with unfinished turns
    DeviceLeft {
        device_id: DeviceId,
        abandoned: Vec<PlayerId>,
    },
    ConnectionLost,
    GameStarted {
        game_id: String,
    },
    PlayerAssigned {
        player_id: PlayerId,
        device_id: Option<DeviceId>,
    },
    RoundStarted {
        round: u32,
        final_round: bool,
    },
    StatusChanged {
        round: u32,
        player_id: PlayerId,
        status: TurnStatus,
    },
    ProgressUpdated(TurnProgressData),
    TurnAccepted {
        player_id: PlayerId,
        new_total: u32,
    },
    SubmissionRejected {
        player_id: PlayerId,
        reason: String,
    },
    StateUpdated,
    RoundCompleted {
        round: u32,
    },
    GameOver {
        winner: Option<PlayerId>,
    },
    /// A local turn was thrown away without being submitted
    LocalTurnCancelled(PlayerId),
}

/// This device's mirror of the canonical game
#[derive(Debug, Clone)]
pub struct GameView {
    pub game_id: String,
    pub rules: ScoringRulesStore,
    pub settings: GameSettings,
    pub players: Vec<Player>,
    pub round: u32,
    pub final_round: bool,
    pub phase: RoundPhase,
    pub statuses: Vec<PlayerRoundStatus>,
    pub winner: Option<PlayerId>,
}

impl GameView {
    pub fn status(&self, player_id: PlayerId) -> Option<TurnStatus> {
        self.statuses
            .iter()
            .find(|s| s.player_id == player_id)
            .map(|s| s.status)
    }

    pub fn player(&self, player_id: PlayerId) -> Option<&Player> {
        self.players.iter().find(|p| p.id == player_id)
    }
}

type DiceFactory = Box<dyn FnMut() -> Box<dyn DiceSource>>;

pub struct MultiplayerCoordinator<S: Session> {
    session: S,
    /// Present on the host only
    arbitrator: Option<RoundArbitrator>,
    game: Option<GameView>,
    /// Players controlled by a remote device; absent means the host
    assignments: HashMap<PlayerId, DeviceId>,
    local_turns: HashMap<PlayerId, LocalTurn>,
    /// Last received progress per remote player
    remote_progress: HashMap<PlayerId, TurnProgressData>,
    progress_tx: Sender<TurnProgressData>,
    progress_rx: Receiver<TurnProgressData>,
    dice: DiceFactory,
    interval: Duration,
    events: Vec<CoordinatorEvent>,
}

impl<S: Session> MultiplayerCoordinator<S> {
    fn with_session(session: S) -> Self {
        let (progress_tx, progress_rx) = mpsc::channel();
        Self {
            session,
            arbitrator: None,
            game: None,
            assignments: HashMap::new(),
            local_turns: HashMap::new(),
            remote_progress: HashMap::new(),
            progress_tx,
            progress_rx,
            dice: Box::new(|| Box::new(RandomDice::new())),
            interval: PROGRESS_INTERVAL,
            events: Vec::new(),
        }
    }

    /// Host a game over a hosting session. The engine's roster is the
    /// game's roster; it is started if still in setup.
    pub fn host(
        session: S,
        engine: GameEngine,
        game_id: impl Into<String>,
    ) -> Result<Self, CoordinatorError> {
        if !session.is_host() {
            return Err(CoordinatorError::NotHost);
        }
        let arbitrator = RoundArbitrator::new(engine)?;
        let mut coordinator = Self::with_session(session);
        coordinator.game = Some(GameView {
            game_id: game_id.into(),
            rules: arbitrator.engine().rules().clone(),
            settings: arbitrator.engine().settings().clone(),
            players: Vec::new(),
            round: 0,
            final_round: false,
            phase: RoundPhase::RoundInProgress,
            statuses: Vec::new(),
            winner: None,
        });
        coordinator.arbitrator = Some(arbitrator);
        coordinator.sync_view();

        let player_count = coordinator.players().len();
        if let Err(e) = coordinator.session.advertise_player_count(player_count) {
            warn!("Could not update advertisement: {}", e);
        }

        for message in coordinator.catch_up_messages() {
            coordinator.broadcast(&message);
        }
        info!(
            "Hosting game with {} players",
            coordinator.players().len()
        );
        Ok(coordinator)
    }

    /// Follow a host's game over a connected session
    pub fn join(session: S) -> Self {
        Self::with_session(session)
    }

    /// Dice used for this device's local turns
    pub fn with_dice(mut self, factory: impl FnMut() -> Box<dyn DiceSource> + 'static) -> Self {
        self.dice = Box::new(factory);
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    // Queries

    pub fn is_host(&self) -> bool {
        self.arbitrator.is_some()
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }

    pub fn local_device(&self) -> &DeviceInfo {
        self.session.local_device()
    }

    /// The canonical game, host only
    pub fn arbitrator(&self) -> Option<&RoundArbitrator> {
        self.arbitrator.as_ref()
    }

    pub fn game(&self) -> Option<&GameView> {
        self.game.as_ref()
    }

    pub fn players(&self) -> &[Player] {
        self.game.as_ref().map(|g| g.players.as_slice()).unwrap_or(&[])
    }

    pub fn round(&self) -> u32 {
        self.game.as_ref().map(|g| g.round).unwrap_or(0)
    }

    pub fn phase(&self) -> Option<RoundPhase> {
        self.game.as_ref().map(|g| g.phase)
    }

    pub fn status(&self, player_id: PlayerId) -> Option<TurnStatus> {
        self.game.as_ref().and_then(|g| g.status(player_id))
    }

    /// The device controlling a player; None means the host
    pub fn owner_of(&self, player_id: PlayerId) -> Option<&str> {
        self.assignments.get(&player_id).map(String::as_str)
    }

    pub fn is_local_player(&self, player_id: PlayerId) -> bool {
        match self.assignments.get(&player_id) {
            Some(device) => *device == self.session.local_device().id,
            None => self.is_host(),
        }
    }

    /// Latest progress received for a player playing elsewhere
    pub fn remote_progress(&self, player_id: PlayerId) -> Option<&TurnProgressData> {
        self.remote_progress.get(&player_id)
    }

    pub fn local_turn(&self, player_id: PlayerId) -> Option<&LocalTurn> {
        self.local_turns.get(&player_id)
    }

    pub fn local_turn_mut(&mut self, player_id: PlayerId) -> Option<&mut LocalTurn> {
        self.local_turns.get_mut(&player_id)
    }

    // Operations

    /// Begin playing a player's turn on this device
    pub fn start_local_turn(&mut self, player_id: PlayerId) -> Result<&mut LocalTurn, CoordinatorError> {
        let view = self.game.as_ref().ok_or(CoordinatorError::GameNotStarted)?;
        if view.phase == RoundPhase::GameOver {
            return Err(RoundError::GameOver.into());
        }
        let player = view
            .player(player_id)
            .cloned()
            .ok_or(CoordinatorError::UnknownPlayer(player_id))?;
        if !self.is_local_player(player_id) {
            return Err(CoordinatorError::NotOwner(player_id));
        }
        if self.local_turns.contains_key(&player_id) {
            return self
                .local_turns
                .get_mut(&player_id)
                .ok_or(CoordinatorError::NoLocalTurn(player_id));
        }
        // An open turn with no local engine was rejected by the host and
        // may be played again
        let status = view.status(player_id).unwrap_or(TurnStatus::Pending);
        if status.is_finished() {
            return Err(RoundError::StaleSubmission { player_id, status }.into());
        }
        let round = view.round;
        let rules = view.rules.clone();
        let settings = view.settings.clone();

        let changed = if let Some(arbitrator) = self.arbitrator.as_mut() {
            let changed = arbitrator.mark_in_progress(round, player_id)?;
            if changed {
                self.sync_view();
                self.broadcast(&Message::RoundStatus {
                    round,
                    player_id,
                    status: TurnStatus::InProgress,
                });
            }
            changed
        } else {
            self.send_to_host(&Message::TurnStarted { round, player_id })?;
            self.set_mirror_status(round, player_id, TurnStatus::InProgress)
        };
        if changed {
            self.events.push(CoordinatorEvent::StatusChanged {
                round,
                player_id,
                status: TurnStatus::InProgress,
            });
        }

        let engine = GameEngine::for_single_turn(&player, rules, settings, (self.dice)());
        let turn = LocalTurn::new(
            player_id,
            round,
            engine,
            self.interval,
            self.progress_tx.clone(),
        );
        debug!("Local turn started for {}", player.name);
        Ok(self.local_turns.entry(player_id).or_insert(turn))
    }

    /// Send a local turn's current progress right away
    pub fn broadcast_turn_progress(&mut self, player_id: PlayerId) -> Result<(), CoordinatorError> {
        let progress = self
            .local_turns
            .get(&player_id)
            .ok_or(CoordinatorError::NoLocalTurn(player_id))?
            .progress();
        self.send_progress(progress)
    }

    /// Hand a finished local turn to the host.
    ///
    /// `result` must be the one the local engine produced. On a client the
    /// turn is kept until the host confirms it; a rejection discards it so
    /// the turn can be started again.
    pub fn submit_local_turn(
        &mut self,
        player_id: PlayerId,
        result: SubmittedTurnResult,
    ) -> Result<(), CoordinatorError> {
        let turn = self
            .local_turns
            .get(&player_id)
            .ok_or(CoordinatorError::NoLocalTurn(player_id))?;
        if !turn.is_finished() {
            return Err(CoordinatorError::TurnNotFinished(player_id));
        }
        if turn.is_submitted() {
            return Err(CoordinatorError::AwaitingHost(player_id));
        }
        if turn.result().as_ref() != Some(&result) {
            warn!("Submitted result for player {} differs from the turn played", player_id);
            return Err(CoordinatorError::ResultMismatch(player_id));
        }
        let round = turn.round();

        if self.arbitrator.is_some() {
            let accepted = self.accept_submission(round, &result);
            self.local_turns.remove(&player_id);
            accepted?;
        } else {
            self.send_to_host(&Message::TurnSubmission { round, result })?;
            if let Some(turn) = self.local_turns.get_mut(&player_id) {
                turn.mark_submitted();
            }
        }
        Ok(())
    }

    /// Host only: skip every unfinished turn and complete the round
    pub fn force_advance_round(&mut self, reason: &str) -> Result<Vec<PlayerId>, CoordinatorError> {
        let arbitrator = self.arbitrator.as_mut().ok_or(CoordinatorError::NotHost)?;
        let round = arbitrator.round();
        let (skipped, completion) = arbitrator.force_advance(reason)?;
        if skipped.is_empty() {
            return Ok(skipped);
        }

        self.sync_view();
        for &player_id in &skipped {
            self.cancel_local_turn(player_id);
            self.remote_progress.remove(&player_id);
            self.broadcast(&Message::RoundStatus {
                round,
                player_id,
                status: TurnStatus::Skipped,
            });
            self.events.push(CoordinatorEvent::StatusChanged {
                round,
                player_id,
                status: TurnStatus::Skipped,
            });
        }
        self.broadcast_state();
        if let Some(completion) = completion {
            self.finish_round(completion);
        }
        Ok(skipped)
    }

    /// Host only: give control of a player to a device, or back to the host
    pub fn assign_player_to_device(
        &mut self,
        player_id: PlayerId,
        device_id: Option<DeviceId>,
    ) -> Result<(), CoordinatorError> {
        if !self.is_host() {
            return Err(CoordinatorError::NotHost);
        }
        if !self.players().iter().any(|p| p.id == player_id) {
            return Err(CoordinatorError::UnknownPlayer(player_id));
        }
        if self.status(player_id) == Some(TurnStatus::InProgress) {
            return Err(CoordinatorError::TurnInProgress(player_id));
        }
        let local_id = self.session.local_device().id.clone();
        let device_id = device_id.filter(|d| *d != local_id);
        if let Some(device) = &device_id {
            if !self
                .session
                .connected_devices()
                .iter()
                .any(|d| d.id == *device)
            {
                return Err(SessionError::UnknownDevice(device.clone()).into());
            }
        }

        match &device_id {
            Some(device) => self.assignments.insert(player_id, device.clone()),
            None => self.assignments.remove(&player_id),
        };
        self.broadcast(&Message::AssignPlayer {
            player_id,
            device_id: device_id.clone(),
        });
        self.events.push(CoordinatorEvent::PlayerAssigned {
            player_id,
            device_id,
        });
        Ok(())
    }

    /// Process network traffic and queued progress; returns what happened
    pub fn poll(&mut self) -> Vec<CoordinatorEvent> {
        let mut latest: HashMap<PlayerId, TurnProgressData> = HashMap::new();
        while let Ok(progress) = self.progress_rx.try_recv() {
            if self.local_turns.contains_key(&progress.player_id) {
                latest.insert(progress.player_id, progress);
            }
        }
        for (_, progress) in latest {
            if let Err(e) = self.send_progress(progress) {
                debug!("Progress not sent: {}", e);
            }
        }

        for event in self.session.poll() {
            self.handle_session_event(event);
        }
        std::mem::take(&mut self.events)
    }

    /// Abandon local turns and leave the session
    pub fn leave(&mut self) {
        let players: Vec<PlayerId> = self.local_turns.keys().copied().collect();
        for player_id in players {
            self.cancel_local_turn(player_id);
        }
        self.session.disconnect();
    }

    // Host side

    fn sync_view(&mut self) {
        if let (Some(arbitrator), Some(view)) = (self.arbitrator.as_ref(), self.game.as_mut()) {
            view.players = arbitrator.players().to_vec();
            view.round = arbitrator.round();
            view.final_round = arbitrator.is_final_round();
            view.phase = arbitrator.phase();
            view.statuses = arbitrator.statuses().to_vec();
            view.winner = arbitrator.winner().map(|p| p.id);
        }
    }

    /// Everything a device needs to catch up with the game
    fn catch_up_messages(&self) -> Vec<Message> {
        let Some(view) = self.game.as_ref() else {
            return Vec::new();
        };
        let mut assignments: Vec<(PlayerId, String)> = self
            .assignments
            .iter()
            .map(|(p, d)| (*p, d.clone()))
            .collect();
        assignments.sort();

        let mut messages = vec![
            Message::GameStarted {
                game_id: view.game_id.clone(),
                rules: view.rules.clone(),
                settings: view.settings.clone(),
                players: view.players.clone(),
                assignments,
            },
            Message::RoundStarted {
                round: view.round,
                final_round: view.final_round,
                statuses: view.statuses.clone(),
            },
        ];
        if view.phase == RoundPhase::GameOver {
            messages.push(Message::GameOver {
                players: view.players.clone(),
                winner: view.winner,
            });
        }
        messages
    }

    fn broadcast(&mut self, message: &Message) {
        if let Err(e) = self.session.broadcast(message) {
            warn!("Broadcast failed: {}", e);
        }
    }

    fn broadcast_state(&mut self) {
        let Some(view) = self.game.as_ref() else {
            return;
        };
        let message = Message::StateUpdate {
            round: view.round,
            phase: view.phase,
            players: view.players.clone(),
        };
        self.broadcast(&message);
        self.events.push(CoordinatorEvent::StateUpdated);
    }

    fn accept_submission(
        &mut self,
        round: u32,
        result: &SubmittedTurnResult,
    ) -> Result<(), RoundError> {
        let arbitrator = self.arbitrator.as_mut().ok_or(RoundError::GameOver)?;
        let accepted = arbitrator.submit(round, result)?;
        let player_id = accepted.player_id;

        self.sync_view();
        self.remote_progress.remove(&player_id);
        self.broadcast(&Message::RoundStatus {
            round,
            player_id,
            status: TurnStatus::Submitted,
        });
        self.events.push(CoordinatorEvent::StatusChanged {
            round,
            player_id,
            status: TurnStatus::Submitted,
        });
        self.events.push(CoordinatorEvent::TurnAccepted {
            player_id,
            new_total: accepted.new_total,
        });
        self.broadcast_state();

        if let Some(completion) = accepted.completion {
            self.finish_round(completion);
        }
        Ok(())
    }

    fn finish_round(&mut self, completion: RoundCompletion) {
        self.events.push(CoordinatorEvent::RoundCompleted {
            round: completion.round,
        });
        if completion.game_over {
            self.end_game();
            return;
        }
        let Some(arbitrator) = self.arbitrator.as_mut() else {
            return;
        };
        match arbitrator.start_next_round() {
            Ok(RoundAdvance::Started { round, final_round }) => {
                self.sync_view();
                self.remote_progress.clear();
                let stale: Vec<PlayerId> = self
                    .local_turns
                    .values()
                    .filter(|t| t.round() != round)
                    .map(|t| t.player_id())
                    .collect();
                for player_id in stale {
                    self.cancel_local_turn(player_id);
                }
                let statuses = self.game.as_ref().map(|g| g.statuses.clone()).unwrap_or_default();
                self.broadcast(&Message::RoundStarted {
                    round,
                    final_round,
                    statuses,
                });
                self.events.push(CoordinatorEvent::RoundStarted { round, final_round });
            }
            Ok(RoundAdvance::GameOver) => self.end_game(),
            Err(e) => warn!("Could not start next round: {}", e),
        }
    }

    fn end_game(&mut self) {
        self.sync_view();
        let players: Vec<PlayerId> = self.local_turns.keys().copied().collect();
        for player_id in players {
            self.cancel_local_turn(player_id);
        }
        let (players, winner) = match self.game.as_ref() {
            Some(view) => (view.players.clone(), view.winner),
            None => (Vec::new(), None),
        };
        self.broadcast(&Message::GameOver { players, winner });
        self.events.push(CoordinatorEvent::GameOver { winner });
    }

    fn device_owns(&self, device_id: &str, player_id: PlayerId) -> bool {
        self.assignments
            .get(&player_id)
            .is_some_and(|d| d == device_id)
    }

    fn handle_host_message(&mut self, from: DeviceId, message: Message) {
        match message {
            Message::TurnStarted { round, player_id } => {
                if !self.device_owns(&from, player_id) {
                    warn!("{} tried to start player {}'s turn", from, player_id);
                    return;
                }
                let Some(arbitrator) = self.arbitrator.as_mut() else {
                    return;
                };
                match arbitrator.mark_in_progress(round, player_id) {
                    Ok(true) => {
                        self.sync_view();
                        self.broadcast(&Message::RoundStatus {
                            round,
                            player_id,
                            status: TurnStatus::InProgress,
                        });
                        self.events.push(CoordinatorEvent::StatusChanged {
                            round,
                            player_id,
                            status: TurnStatus::InProgress,
                        });
                    }
                    Ok(false) => {}
                    Err(e) => debug!("Ignoring turn start: {}", e),
                }
            }
            Message::TurnProgress(progress) => {
                if !self.device_owns(&from, progress.player_id) {
                    warn!("{} sent progress for player {}", from, progress.player_id);
                    return;
                }
                if self.status(progress.player_id) != Some(TurnStatus::InProgress) {
                    return;
                }
                let relay = Message::TurnProgress(progress.clone());
                if let Err(e) = self.session.broadcast_except(&relay, &from) {
                    warn!("Progress relay failed: {}", e);
                }
                self.remote_progress
                    .insert(progress.player_id, progress.clone());
                self.events.push(CoordinatorEvent::ProgressUpdated(progress));
            }
            Message::TurnSubmission { round, result } => {
                let player_id = result.player_id;
                let outcome = if self.device_owns(&from, player_id) {
                    self.accept_submission(round, &result)
                } else {
                    Err(RoundError::InvalidSubmission(format!(
                        "device does not control player {}",
                        player_id
                    )))
                };
                match outcome {
                    Ok(()) => {}
                    Err(e) if e.is_stale() => {
                        warn!("Dropping stale submission from {}: {}", from, e);
                    }
                    Err(e) => {
                        warn!("Rejected submission from {}: {}", from, e);
                        let reason = e.to_string();
                        let reply = Message::SubmissionRejected {
                            round,
                            player_id,
                            reason: reason.clone(),
                        };
                        if let Err(e) = self.session.send(&from, &reply) {
                            warn!("Could not tell {} about the rejection: {}", from, e);
                        }
                        self.events
                            .push(CoordinatorEvent::SubmissionRejected { player_id, reason });
                    }
                }
            }
            Message::Ping => {
                if let Err(e) = self.session.send(&from, &Message::Pong) {
                    debug!("Pong to {} failed: {}", from, e);
                }
            }
            other => debug!("Host ignoring {:?} from {}", other, from),
        }
    }

    // Client side

    fn set_mirror_status(&mut self, round: u32, player_id: PlayerId, status: TurnStatus) -> bool {
        let Some(view) = self.game.as_mut() else {
            return false;
        };
        if view.round != round {
            return false;
        }
        match view.statuses.iter_mut().find(|s| s.player_id == player_id) {
            Some(entry) if entry.status.can_become(status) => {
                entry.status = status;
                if status == TurnStatus::Skipped {
                    entry.score_earned = Some(0);
                }
                true
            }
            _ => false,
        }
    }

    fn send_to_host(&mut self, message: &Message) -> Result<(), CoordinatorError> {
        self.session.broadcast(message).map_err(|e| match e {
            SessionError::NotConnected => CoordinatorError::ConnectionLost,
            other => other.into(),
        })
    }

    fn send_progress(&mut self, progress: TurnProgressData) -> Result<(), CoordinatorError> {
        let message = Message::TurnProgress(progress);
        if self.is_host() {
            self.broadcast(&message);
            Ok(())
        } else {
            self.send_to_host(&message)
        }
    }

    fn cancel_local_turn(&mut self, player_id: PlayerId) {
        if self.local_turns.remove(&player_id).is_some() {
            debug!("Cancelled local turn for player {}", player_id);
            self.events
                .push(CoordinatorEvent::LocalTurnCancelled(player_id));
        }
    }

    fn handle_client_message(&mut self, message: Message) {
        match message {
            Message::GameStarted {
                game_id,
                rules,
                settings,
                players,
                assignments,
            } => {
                let keep_round = self.game.as_ref().filter(|g| g.game_id == game_id);
                let (round, final_round, phase, statuses) = match keep_round {
                    Some(g) => (g.round, g.final_round, g.phase, g.statuses.clone()),
                    None => (0, false, RoundPhase::RoundInProgress, Vec::new()),
                };
                self.game = Some(GameView {
                    game_id: game_id.clone(),
                    rules,
                    settings,
                    players,
                    round,
                    final_round,
                    phase,
                    statuses,
                    winner: None,
                });
                self.assignments = assignments.into_iter().collect();
                self.events.push(CoordinatorEvent::GameStarted { game_id });
            }
            Message::RoundStarted {
                round,
                final_round,
                statuses,
            } => {
                let Some(view) = self.game.as_mut() else {
                    return;
                };
                let is_new = view.round != round;
                view.round = round;
                view.final_round = final_round;
                view.statuses = statuses;
                if is_new {
                    self.remote_progress.clear();
                }
                let stale: Vec<PlayerId> = self
                    .local_turns
                    .values()
                    .filter(|t| t.round() != round)
                    .map(|t| t.player_id())
                    .collect();
                for player_id in stale {
                    self.cancel_local_turn(player_id);
                }
                self.events.push(CoordinatorEvent::RoundStarted { round, final_round });
            }
            Message::RoundStatus {
                round,
                player_id,
                status,
            } => {
                let confirms_ours = status == TurnStatus::Submitted
                    && self
                        .local_turns
                        .get(&player_id)
                        .is_some_and(|t| t.round() == round);
                if confirms_ours {
                    self.local_turns.remove(&player_id);
                    debug!("Host accepted player {}'s turn", player_id);
                }
                if !self.set_mirror_status(round, player_id, status) {
                    return;
                }
                if status.is_finished() {
                    self.remote_progress.remove(&player_id);
                }
                if status == TurnStatus::Skipped {
                    self.cancel_local_turn(player_id);
                }
                self.events.push(CoordinatorEvent::StatusChanged {
                    round,
                    player_id,
                    status,
                });
            }
            Message::StateUpdate {
                round,
                phase,
                players,
            } => {
                if let Some(view) = self.game.as_mut() {
                    if view.round == round {
                        view.phase = phase;
                    }
                    view.players = players;
                    self.events.push(CoordinatorEvent::StateUpdated);
                }
            }
            Message::TurnProgress(progress) => {
                if self.is_local_player(progress.player_id)
                    || self.status(progress.player_id) != Some(TurnStatus::InProgress)
                {
                    return;
                }
                self.remote_progress
                    .insert(progress.player_id, progress.clone());
                self.events.push(CoordinatorEvent::ProgressUpdated(progress));
            }
            Message::AssignPlayer {
                player_id,
                device_id,
            } => {
                match &device_id {
                    Some(device) => self.assignments.insert(player_id, device.clone()),
                    None => self.assignments.remove(&player_id),
                };
                if !self.is_local_player(player_id) {
                    self.cancel_local_turn(player_id);
                }
                self.events.push(CoordinatorEvent::PlayerAssigned {
                    player_id,
                    device_id,
                });
            }
            Message::SubmissionRejected {
                player_id, reason, ..
            } => {
                warn!("Host rejected player {}'s turn: {}", player_id, reason);
                if self
                    .local_turns
                    .get(&player_id)
                    .is_some_and(LocalTurn::is_submitted)
                {
                    self.cancel_local_turn(player_id);
                }
                self.events
                    .push(CoordinatorEvent::SubmissionRejected { player_id, reason });
            }
            Message::GameOver { players, winner } => {
                if let Some(view) = self.game.as_mut() {
                    view.players = players;
                    view.phase = RoundPhase::GameOver;
                    view.winner = winner;
                }
                let players: Vec<PlayerId> = self.local_turns.keys().copied().collect();
                for player_id in players {
                    self.cancel_local_turn(player_id);
                }
                self.events.push(CoordinatorEvent::GameOver { winner });
            }
            Message::Ping => {
                if let Err(e) = self.session.broadcast(&Message::Pong) {
                    debug!("Pong to host failed: {}", e);
                }
            }
            other => debug!("Client ignoring {:?}", other),
        }
    }

    fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::StateChanged(state) => {
                self.events.push(CoordinatorEvent::Connection(state));
            }
            SessionEvent::DeviceJoined(device) => {
                if self.is_host() {
                    for message in self.catch_up_messages() {
                        if let Err(e) = self.session.send(&device.id, &message) {
                            warn!("Catch-up for {} failed: {}", device.display_name, e);
                        }
                    }
                }
                self.events.push(CoordinatorEvent::DeviceJoined(device));
            }
            SessionEvent::DeviceLeft(device_id) => {
                let abandoned: Vec<PlayerId> = self
                    .assignments
                    .iter()
                    .filter(|(_, d)| **d == device_id)
                    .map(|(p, _)| *p)
                    .filter(|p| !self.status(*p).is_some_and(TurnStatus::is_finished))
                    .collect();
                for player_id in &abandoned {
                    self.remote_progress.remove(player_id);
                }
                if !abandoned.is_empty() {
                    info!(
                        "{} left with unfinished turns for {:?}",
                        device_id, abandoned
                    );
                }
                self.events.push(CoordinatorEvent::DeviceLeft {
                    device_id,
                    abandoned,
                });
            }
            SessionEvent::ConnectionLost => {
                let players: Vec<PlayerId> = self.local_turns.keys().copied().collect();
                for player_id in players {
                    self.cancel_local_turn(player_id);
                }
                self.events.push(CoordinatorEvent::ConnectionLost);
            }
            SessionEvent::Message { from, message } => {
                if self.is_host() {
                    self.handle_host_message(from, message);
                } else {
                    self.handle_client_message(message);
                }
            }
            SessionEvent::HostDiscovered(_)
            | SessionEvent::HostLost(_)
            | SessionEvent::ConnectFailed(_) => {}
        }
    }
}
