use farkle::game::dice::ScriptedDice;
use farkle::game::{GameEngine, GameError};
use farkle::rules::{GameSettings, ScoringRulesStore};
use farkle::scoring::ScoringEngine;
use proptest::prelude::*;
use std::collections::BTreeSet;

fn roll() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(1u8..=6, 1..=6)
}

/// Six dice with nothing to keep: two pairs and two odd dice, no 1s or 5s
fn six_die_farkle() -> impl Strategy<Value = Vec<u8>> {
    Just(vec![2u8, 3, 4, 6])
        .prop_shuffle()
        .prop_map(|f| vec![f[0], f[0], f[1], f[1], f[2], f[3]])
        .prop_shuffle()
}

proptest! {
    #[test]
    fn scoring_dice_are_covered_by_some_option(dice in roll()) {
        let rules = ScoringRulesStore::default();
        let engine = ScoringEngine::new(&rules);
        let covered: BTreeSet<usize> = engine
            .evaluate_combinations(&dice)
            .iter()
            .flat_map(|o| o.indices.iter().copied())
            .collect();
        let scoring = engine.scoring_dice_indices(&dice);
        prop_assert!(scoring.is_subset(&covered));
        prop_assert_eq!(scoring.is_empty(), engine.is_farkle(&dice));
    }

    #[test]
    fn accepted_selections_stay_accepted(dice in roll()) {
        let rules = ScoringRulesStore::default();
        let engine = ScoringEngine::new(&rules);
        for option in engine.suggest_selections(&dice) {
            let first = engine.validate_selection(&option.indices, &dice);
            prop_assert!(first.is_valid, "{:?} rejected for {:?}", option.indices, dice);
            let again = engine.validate_selection(&option.indices, &dice);
            prop_assert!(again.is_valid);
            prop_assert!(again.invalid_indices.is_empty());
            prop_assert_eq!(again.score, first.score);
        }
    }

    #[test]
    fn option_scores_match_their_dice(dice in roll()) {
        let rules = ScoringRulesStore::default();
        let engine = ScoringEngine::new(&rules);
        for option in engine.evaluate_combinations(&dice) {
            let values: Vec<u8> = option.indices.iter().map(|&i| dice[i]).collect();
            prop_assert!(engine.score_values(&dice, &values).is_some());
            prop_assert!(option.score > 0);
        }
    }

    #[test]
    fn a_farkle_roll_can_never_be_banked(dice in six_die_farkle()) {
        let mut game = GameEngine::with_dice(
            ScoringRulesStore::default(),
            GameSettings::default(),
            Box::new(ScriptedDice::new(dice.clone())),
        );
        prop_assert!(ScoringEngine::new(game.rules()).is_farkle(&dice));
        game.add_player("Solo").unwrap();
        game.start_game().unwrap();
        prop_assert_eq!(game.roll_dice().unwrap(), dice);
        prop_assert!(game.is_pending_farkle());
        prop_assert!(!game.can_player_bank());
        prop_assert_eq!(game.bank_score().unwrap_err(), GameError::PendingFarkle);
        let outcome = game.acknowledge_farkle().unwrap();
        prop_assert!(outcome.is_farkle);
        prop_assert_eq!(outcome.score_earned, 0);
    }
}
