//! A turn being played on this device

use super::TurnProgressData;
use crate::game::{GameEngine, GameSnapshot, GameState, PlayerId, SubmittedTurnResult, Turn};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How often an in-progress turn is re-broadcast
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Background thread streaming a turn's progress.
///
/// Every snapshot from the engine is forwarded as it arrives and the latest
/// one is re-sent each `interval`. Snapshots taken after the turn ended are
/// not sent; the last live progress keeps repeating instead. Stops when
/// dropped or when the engine goes away.
pub struct ProgressTicker {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressTicker {
    pub fn spawn(
        player_id: PlayerId,
        snapshots: Receiver<GameSnapshot>,
        interval: Duration,
        out: Sender<TurnProgressData>,
    ) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let handle = thread::spawn(move || {
            let mut latest: Option<TurnProgressData> = None;
            loop {
                match snapshots.recv_timeout(interval) {
                    Ok(snapshot) => {
                        if snapshot.state == GameState::GameOver {
                            continue;
                        }
                        let progress = TurnProgressData::from_snapshot(player_id, &snapshot);
                        latest = Some(progress.clone());
                        if out.send(progress).is_err() {
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        if let Some(progress) = &latest {
                            if out.send(progress.clone()).is_err() {
                                break;
                            }
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
                if !matches!(stop_rx.try_recv(), Err(TryRecvError::Empty)) {
                    break;
                }
            }
        });

        Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn stop(&mut self) {
        // Dropping the sender ends the loop on its next wake-up
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ProgressTicker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// An ephemeral one-player engine plus its progress ticker
pub struct LocalTurn {
    player_id: PlayerId,
    round: u32,
    // Declared before the ticker so dropping the turn closes the
    // subscription and the ticker thread exits at once.
    engine: GameEngine,
    ticker: ProgressTicker,
    submitted: bool,
}

impl LocalTurn {
    pub fn new(
        player_id: PlayerId,
        round: u32,
        mut engine: GameEngine,
        interval: Duration,
        out: Sender<TurnProgressData>,
    ) -> Self {
        let snapshots = engine.subscribe();
        Self {
            player_id,
            round,
            engine,
            ticker: ProgressTicker::spawn(player_id, snapshots, interval, out),
            submitted: false,
        }
    }

    pub fn player_id(&self) -> PlayerId {
        self.player_id
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn engine(&self) -> &GameEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut GameEngine {
        &mut self.engine
    }

    /// Progress as it stands now
    pub fn progress(&self) -> TurnProgressData {
        TurnProgressData::from_engine(self.player_id, &self.engine)
    }

    /// Stop streaming progress; the turn now waits for the host
    pub fn mark_submitted(&mut self) {
        self.submitted = true;
        self.engine.unsubscribe_all();
        self.ticker.stop();
    }

    /// Sent to the host and not yet acknowledged
    pub fn is_submitted(&self) -> bool {
        self.submitted
    }

    pub fn is_streaming(&self) -> bool {
        self.ticker.is_running()
    }

    /// The recorded turn once bank, farkle or skip has ended it
    pub fn finished_turn(&self) -> Option<&Turn> {
        self.engine
            .player(self.player_id)
            .and_then(|p| p.turns.last())
    }

    pub fn is_finished(&self) -> bool {
        self.finished_turn().is_some()
    }

    /// The result to submit for a finished turn
    pub fn result(&self) -> Option<SubmittedTurnResult> {
        self.engine
            .last_outcome()
            .filter(|o| o.player_id == self.player_id)
            .map(|o| o.to_submission())
    }
}
