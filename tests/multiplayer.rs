use farkle::game::dice::ScriptedDice;
use farkle::game::{GameEngine, PlayerId, RollRecord, SubmittedTurnResult};
use farkle::game::{GameError, GameState};
use farkle::multiplayer::{
    CoordinatorEvent, CoordinatorError, MultiplayerCoordinator, RoundArbitrator, RoundError,
    TurnProgressData, TurnStatus,
};
use farkle::network::{MemoryHub, MemorySession, Message, Session};
use farkle::rules::{GameSettings, ScoringRulesStore};
use std::thread;
use std::time::{Duration, Instant};

type Coordinator = MultiplayerCoordinator<MemorySession>;

/// Host runs Alice, Bob and Cara; one tablet is connected
fn table(settings: GameSettings) -> (MemoryHub, Coordinator, Coordinator) {
    let hub = MemoryHub::new();
    let host_session = hub.host("Host").unwrap();
    let tablet_session = hub.join("Tablet").unwrap();

    let mut engine = GameEngine::new(ScoringRulesStore::default(), settings);
    for name in ["Alice", "Bob", "Cara"] {
        engine.add_player(name).unwrap();
    }
    let mut host = MultiplayerCoordinator::host(host_session, engine, "kitchen")
        .unwrap()
        .with_dice(|| Box::new(ScriptedDice::rolls([[1u8, 2, 3, 4, 6, 6]])));
    let tablet = MultiplayerCoordinator::join(tablet_session)
        .with_dice(|| Box::new(ScriptedDice::rolls([[1u8, 5, 5, 5, 2, 3]])));
    host.poll();
    (hub, host, tablet)
}

fn hand_to_tablet(host: &mut Coordinator, tablet: &mut Coordinator, player_id: PlayerId) {
    let tablet_id = tablet.local_device().id.clone();
    host.assign_player_to_device(player_id, Some(tablet_id)).unwrap();
    tablet.poll();
    assert!(tablet.is_local_player(player_id));
}

/// Roll once, keep `keep`, bank, and submit
fn play(device: &mut Coordinator, player_id: PlayerId, keep: &[usize]) -> SubmittedTurnResult {
    let turn = device.start_local_turn(player_id).unwrap();
    turn.engine_mut().roll_dice().unwrap();
    turn.engine_mut().select_dice(keep).unwrap();
    turn.engine_mut().bank_score().unwrap();
    let result = turn.result().unwrap();
    device.submit_local_turn(player_id, result.clone()).unwrap();
    result
}

fn progress_for(player_id: PlayerId, name: &str) -> TurnProgressData {
    TurnProgressData {
        player_id,
        player_name: name.to_string(),
        current_roll: vec![1, 1, 1, 1, 1, 1],
        selected_dice: Vec::new(),
        turn_score: 0,
        roll_count: 1,
        remaining_dice: 6,
        is_pending_farkle: false,
    }
}

fn finished_in_round(events: &[CoordinatorEvent], round: u32) -> usize {
    events
        .iter()
        .filter(|e| {
            matches!(e, CoordinatorEvent::StatusChanged { round: r, status, .. }
                if *r == round && status.is_finished())
        })
        .count()
}

#[test]
fn duplicate_submission_counts_once() {
    let (_hub, mut host, mut tablet) = table(GameSettings::default());
    hand_to_tablet(&mut host, &mut tablet, 2);

    let result = play(&mut tablet, 2, &[0, 1, 2, 3]);
    tablet
        .session_mut()
        .broadcast(&Message::TurnSubmission { round: 1, result })
        .unwrap();

    let mut events = host.poll();
    let accepted = events
        .iter()
        .filter(|e| matches!(e, CoordinatorEvent::TurnAccepted { player_id: 2, .. }))
        .count();
    assert_eq!(accepted, 1);
    assert!(!events
        .iter()
        .any(|e| matches!(e, CoordinatorEvent::SubmissionRejected { .. })));
    assert_eq!(host.arbitrator().unwrap().finished_count(), 1);
    assert_eq!(host.players()[1].total_score, 600);

    play(&mut host, 1, &[0]);
    play(&mut host, 3, &[0]);
    events.extend(host.poll());

    assert_eq!(finished_in_round(&events, 1), 3);
    assert!(events.contains(&CoordinatorEvent::RoundCompleted { round: 1 }));
    assert_eq!(host.round(), 2);
    assert_eq!(host.arbitrator().unwrap().statuses().len(), 3);
    assert_eq!(host.players()[1].total_score, 600);

    tablet.poll();
    assert_eq!(tablet.round(), 2);
    assert_eq!(tablet.players()[1].total_score, 600);
}

#[test]
fn force_advance_skips_pending_player() {
    let (_hub, mut host, mut tablet) = table(GameSettings::default());
    hand_to_tablet(&mut host, &mut tablet, 3);

    let turn = tablet.start_local_turn(3).unwrap();
    turn.engine_mut().roll_dice().unwrap();
    tablet.broadcast_turn_progress(3).unwrap();

    let events = host.poll();
    assert!(events
        .iter()
        .any(|e| matches!(e, CoordinatorEvent::ProgressUpdated(p) if p.player_id == 3)));
    assert_eq!(host.status(3), Some(TurnStatus::InProgress));
    assert_eq!(host.remote_progress(3).unwrap().current_roll, vec![1, 5, 5, 5, 2, 3]);

    play(&mut host, 1, &[0]);
    play(&mut host, 2, &[0]);
    assert_eq!(host.force_advance_round("Cara stepped away").unwrap(), vec![3]);

    let events = host.poll();
    assert!(events.contains(&CoordinatorEvent::StatusChanged {
        round: 1,
        player_id: 3,
        status: TurnStatus::Skipped
    }));
    assert!(events.contains(&CoordinatorEvent::RoundStarted {
        round: 2,
        final_round: false
    }));
    assert_eq!(host.players()[2].total_score, 0);
    assert!(host.remote_progress(3).is_none());

    let events = tablet.poll();
    assert!(events.contains(&CoordinatorEvent::LocalTurnCancelled(3)));
    assert!(tablet.local_turn(3).is_none());
    assert_eq!(tablet.round(), 2);
    assert_eq!(tablet.status(3), Some(TurnStatus::Pending));
}

#[test]
fn each_force_advance_closes_one_round() {
    let (_hub, mut host, _tablet) = table(GameSettings::default());
    play(&mut host, 1, &[0]);
    play(&mut host, 2, &[0]);
    assert_eq!(host.force_advance_round("first").unwrap(), vec![3]);
    assert_eq!(host.round(), 2);

    let skipped = host.force_advance_round("second").unwrap();
    assert_eq!(skipped, vec![1, 2, 3]);
    assert_eq!(host.round(), 3);
    assert!(host.players().iter().all(|p| p.turns.len() == 2));
}

#[test]
fn late_submission_after_force_advance_is_dropped() {
    let (_hub, mut host, mut tablet) = table(GameSettings::default());
    hand_to_tablet(&mut host, &mut tablet, 2);
    let turn = tablet.start_local_turn(2).unwrap();
    turn.engine_mut().roll_dice().unwrap();
    turn.engine_mut().select_dice(&[0, 1, 2, 3]).unwrap();
    turn.engine_mut().bank_score().unwrap();
    let result = turn.result().unwrap();
    host.poll();

    host.force_advance_round("too slow").unwrap();
    tablet.poll();
    assert!(matches!(
        tablet.submit_local_turn(2, result.clone()),
        Err(CoordinatorError::NoLocalTurn(2))
    ));

    tablet
        .session_mut()
        .broadcast(&Message::TurnSubmission { round: 1, result })
        .unwrap();
    let events = host.poll();
    assert!(!events
        .iter()
        .any(|e| matches!(e, CoordinatorEvent::TurnAccepted { .. })));
    assert_eq!(host.players()[1].total_score, 0);
}

#[test]
fn inconsistent_submission_is_rejected_to_sender() {
    let (_hub, mut host, mut tablet) = table(GameSettings::default());
    hand_to_tablet(&mut host, &mut tablet, 2);

    let forged = SubmittedTurnResult {
        player_id: 2,
        player_name: "Bob".to_string(),
        score_earned: 3000,
        is_farkle: false,
        rolls: vec![RollRecord {
            dice_rolled: vec![1, 2, 3, 4, 6, 6],
            dice_selected: vec![1],
            score_from_selection: 3000,
        }],
        new_total_score: 3000,
    };
    tablet
        .session_mut()
        .broadcast(&Message::TurnSubmission {
            round: 1,
            result: forged,
        })
        .unwrap();

    let events = host.poll();
    assert!(events
        .iter()
        .any(|e| matches!(e, CoordinatorEvent::SubmissionRejected { player_id: 2, .. })));
    assert_eq!(host.status(2), Some(TurnStatus::Pending));

    let events = tablet.poll();
    assert!(events
        .iter()
        .any(|e| matches!(e, CoordinatorEvent::SubmissionRejected { player_id: 2, .. })));
}

#[test]
fn only_the_owner_may_submit() {
    let (_hub, mut host, mut tablet) = table(GameSettings::default());
    tablet.poll();
    let alice = host.players()[0].clone();
    tablet
        .session_mut()
        .broadcast(&Message::TurnSubmission {
            round: 1,
            result: SubmittedTurnResult::skipped(&alice),
        })
        .unwrap();

    let events = host.poll();
    assert!(events
        .iter()
        .any(|e| matches!(e, CoordinatorEvent::SubmissionRejected { player_id: 1, .. })));
    assert_eq!(host.status(1), Some(TurnStatus::Pending));
}

#[test]
fn game_ends_after_final_round() {
    let settings = GameSettings {
        winning_score: 500,
        ..GameSettings::default()
    };
    let (_hub, mut host, mut tablet) = table(settings);
    hand_to_tablet(&mut host, &mut tablet, 2);

    // Bob reaches 600 in round 1, everyone else gets one more turn
    play(&mut tablet, 2, &[0, 1, 2, 3]);
    host.poll();
    play(&mut host, 1, &[0]);
    play(&mut host, 3, &[0]);
    let events = host.poll();
    assert!(events.contains(&CoordinatorEvent::RoundStarted {
        round: 2,
        final_round: true
    }));
    assert_eq!(host.status(2), Some(TurnStatus::Skipped));
    assert!(matches!(
        tablet.poll().last(),
        Some(CoordinatorEvent::RoundStarted { final_round: true, .. })
    ));
    assert!(tablet.start_local_turn(2).is_err());

    play(&mut host, 1, &[0]);
    play(&mut host, 3, &[0]);
    let events = host.poll();
    assert!(events.contains(&CoordinatorEvent::GameOver { winner: Some(2) }));

    let events = tablet.poll();
    assert!(events.contains(&CoordinatorEvent::GameOver { winner: Some(2) }));
    assert!(matches!(
        tablet.start_local_turn(2),
        Err(CoordinatorError::Round(RoundError::GameOver))
    ));
}

#[test]
fn late_joiner_catches_up() {
    let (hub, mut host, _tablet) = table(GameSettings::default());
    play(&mut host, 1, &[0]);

    let mut late = MultiplayerCoordinator::join(hub.join("Phone").unwrap());
    host.poll();
    let events = late.poll();
    assert!(events.contains(&CoordinatorEvent::GameStarted {
        game_id: "kitchen".to_string()
    }));
    assert_eq!(late.round(), 1);
    assert_eq!(late.status(1), Some(TurnStatus::Submitted));
    assert_eq!(late.players()[0].total_score, 100);
}

#[test]
fn client_drop_is_reported_to_host() {
    let (hub, mut host, mut tablet) = table(GameSettings::default());
    hand_to_tablet(&mut host, &mut tablet, 3);
    tablet.start_local_turn(3).unwrap();
    host.poll();

    let tablet_id = tablet.local_device().id.clone();
    hub.drop_connection(&tablet_id);
    let events = host.poll();
    assert!(events.contains(&CoordinatorEvent::DeviceLeft {
        device_id: tablet_id,
        abandoned: vec![3]
    }));

    let events = tablet.poll();
    assert!(events.contains(&CoordinatorEvent::ConnectionLost));
    assert!(tablet.local_turn(3).is_none());
}

#[test]
fn submission_survives_serialization_and_applies_once() {
    let mut engine = GameEngine::new(ScoringRulesStore::default(), GameSettings::default());
    engine.add_player("Alice").unwrap();
    let mut arbitrator = RoundArbitrator::new(engine).unwrap();

    let result = SubmittedTurnResult {
        player_id: 1,
        player_name: "Alice".to_string(),
        score_earned: 650,
        is_farkle: false,
        rolls: vec![
            RollRecord {
                dice_rolled: vec![5, 5, 5, 2, 3, 4],
                dice_selected: vec![5, 5, 5],
                score_from_selection: 500,
            },
            RollRecord {
                dice_rolled: vec![1, 5, 3],
                dice_selected: vec![1, 5],
                score_from_selection: 150,
            },
        ],
        new_total_score: 650,
    };
    let json = serde_json::to_string(&result).unwrap();
    let decoded: SubmittedTurnResult = serde_json::from_str(&json).unwrap();
    assert_eq!(decoded, result);

    let accepted = arbitrator.submit(1, &decoded).unwrap();
    assert_eq!(accepted.new_total, decoded.new_total_score);
    assert!(matches!(
        arbitrator.submit(1, &decoded),
        Err(RoundError::StaleSubmission { .. })
    ));
    assert_eq!(arbitrator.players()[0].total_score, 650);
}

#[test]
fn progress_streams_without_manual_broadcast() {
    let (_hub, mut host, tablet) = table(GameSettings::default());
    let mut tablet = tablet.with_progress_interval(Duration::from_millis(20));
    hand_to_tablet(&mut host, &mut tablet, 2);

    let turn = tablet.start_local_turn(2).unwrap();
    turn.engine_mut().roll_dice().unwrap();
    turn.engine_mut().select_dice(&[0, 1, 2, 3]).unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        tablet.poll();
        host.poll();
        let shown = host
            .remote_progress(2)
            .is_some_and(|p| p.selected_dice == vec![1, 5, 5, 5]);
        if shown || Instant::now() > deadline {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    let progress = host.remote_progress(2).unwrap();
    assert_eq!(progress.current_roll, vec![1, 5, 5, 5, 2, 3]);
    assert_eq!(progress.turn_score, 600);
    assert_eq!(progress.player_name, "Bob");
}

#[test]
fn local_turn_ends_after_one_bank() {
    let (_hub, mut host, mut tablet) = table(GameSettings::default());
    hand_to_tablet(&mut host, &mut tablet, 2);

    let turn = tablet.start_local_turn(2).unwrap();
    turn.engine_mut().roll_dice().unwrap();
    turn.engine_mut().select_dice(&[0, 1, 2, 3]).unwrap();
    turn.engine_mut().bank_score().unwrap();
    assert_eq!(turn.engine().state(), GameState::GameOver);
    assert_eq!(
        turn.engine_mut().roll_dice(),
        Err(GameError::WrongState(GameState::GameOver))
    );

    let result = turn.result().unwrap();
    assert_eq!(result.new_total_score, 600);
    tablet.submit_local_turn(2, result).unwrap();
    host.poll();
    assert_eq!(host.players()[1].total_score, 600);
    assert_eq!(host.players()[1].turns.len(), 1);
}

#[test]
fn submitted_result_must_match_the_turn_played() {
    let (_hub, mut host, mut tablet) = table(GameSettings::default());
    hand_to_tablet(&mut host, &mut tablet, 2);

    let turn = tablet.start_local_turn(2).unwrap();
    turn.engine_mut().roll_dice().unwrap();
    turn.engine_mut().select_dice(&[0]).unwrap();
    turn.engine_mut().bank_score().unwrap();
    let played = turn.result().unwrap();

    let mut inflated = played.clone();
    inflated.score_earned = 600;
    inflated.new_total_score = 600;
    assert!(matches!(
        tablet.submit_local_turn(2, inflated),
        Err(CoordinatorError::ResultMismatch(2))
    ));
    assert!(tablet.local_turn(2).is_some());

    tablet.submit_local_turn(2, played).unwrap();
    host.poll();
    assert_eq!(host.players()[1].total_score, 100);
}

#[test]
fn client_keeps_turn_until_host_confirms() {
    let (_hub, mut host, mut tablet) = table(GameSettings::default());
    hand_to_tablet(&mut host, &mut tablet, 2);

    let result = play(&mut tablet, 2, &[0, 1, 2, 3]);
    let turn = tablet.local_turn(2).unwrap();
    assert!(turn.is_submitted());
    assert!(!turn.is_streaming());
    assert!(matches!(
        tablet.submit_local_turn(2, result),
        Err(CoordinatorError::AwaitingHost(2))
    ));

    host.poll();
    let events = tablet.poll();
    assert!(tablet.local_turn(2).is_none());
    assert!(!events.contains(&CoordinatorEvent::LocalTurnCancelled(2)));
    assert_eq!(tablet.status(2), Some(TurnStatus::Submitted));
}

#[test]
fn rejected_turn_can_be_played_again() {
    let (_hub, mut host, mut tablet) = table(GameSettings::default());
    hand_to_tablet(&mut host, &mut tablet, 2);
    play(&mut tablet, 2, &[0, 1, 2, 3]);

    let tablet_id = tablet.local_device().id.clone();
    host.session_mut()
        .send(
            &tablet_id,
            &Message::SubmissionRejected {
                round: 1,
                player_id: 2,
                reason: "try again".to_string(),
            },
        )
        .unwrap();

    let events = tablet.poll();
    assert!(events.contains(&CoordinatorEvent::LocalTurnCancelled(2)));
    assert!(tablet.local_turn(2).is_none());
    assert_eq!(tablet.status(2), Some(TurnStatus::InProgress));

    let turn = tablet.start_local_turn(2).unwrap();
    assert!(!turn.is_finished());
    assert!(turn.is_streaming());
}

#[test]
fn progress_for_a_finished_player_is_ignored() {
    let (_hub, mut host, mut tablet) = table(GameSettings::default());
    hand_to_tablet(&mut host, &mut tablet, 2);
    hand_to_tablet(&mut host, &mut tablet, 3);

    play(&mut tablet, 2, &[0, 1, 2, 3]);
    tablet.start_local_turn(3).unwrap();
    host.poll();
    assert_eq!(host.status(2), Some(TurnStatus::Submitted));

    tablet
        .session_mut()
        .broadcast(&Message::TurnProgress(progress_for(2, "Bob")))
        .unwrap();
    let events = host.poll();
    assert!(!events
        .iter()
        .any(|e| matches!(e, CoordinatorEvent::ProgressUpdated(_))));
    assert!(host.remote_progress(2).is_none());
    assert_eq!(host.status(2), Some(TurnStatus::Submitted));
    assert_eq!(host.players()[1].total_score, 600);

    play(&mut host, 1, &[0]);
    assert_eq!(host.force_advance_round("Cara stepped away").unwrap(), vec![3]);

    // Cara's abandoned turn keeps reporting after she was skipped
    tablet
        .session_mut()
        .broadcast(&Message::TurnProgress(progress_for(3, "Cara")))
        .unwrap();
    let events = host.poll();
    assert!(!events
        .iter()
        .any(|e| matches!(e, CoordinatorEvent::ProgressUpdated(_))));
    assert!(host.remote_progress(3).is_none());
    assert_eq!(host.players()[2].total_score, 0);
    assert_eq!(host.status(3), Some(TurnStatus::Pending));
}

#[test]
fn host_advertises_roster_size() {
    let (_hub, host, tablet) = table(GameSettings::default());
    assert_eq!(host.session().advertised_player_count(), Some(3));
    assert_eq!(tablet.session().advertised_player_count(), None);
}
