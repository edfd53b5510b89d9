//! Scoring rules and game settings
//!
//! This module provides:
//! - `ScoringRulesStore`: point values per scoring combination, each with a
//!   default, a valid range and a step for UI steppers
//! - `GameSettings`: winning score and the optional house rules
//! - Closed option enums for the selectable settings (winning score,
//!   opening threshold, triple-farkle penalty)
//!
//! Combination shapes are fixed; only their point values are configurable.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::RangeInclusive;

/// Score multiplier applied to the base three-of-a-kind value for 4, 5 and 6 of a kind
pub const KIND_MULTIPLIERS: [(usize, u32); 4] = [(3, 1), (4, 2), (5, 3), (6, 4)];

/// Number of configurable point values
pub const RULE_COUNT: usize = 11;

/// Identifies one configurable point value
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKey {
    SingleOne,
    SingleFive,
    ThreeOnes,
    ThreeTwos,
    ThreeThrees,
    ThreeFours,
    ThreeFives,
    ThreeSixes,
    Straight,
    ThreePairs,
    TwoTriplets,
}

impl RuleKey {
    /// Every rule key, in display order
    pub const ALL: [RuleKey; RULE_COUNT] = [
        RuleKey::SingleOne,
        RuleKey::SingleFive,
        RuleKey::ThreeOnes,
        RuleKey::ThreeTwos,
        RuleKey::ThreeThrees,
        RuleKey::ThreeFours,
        RuleKey::ThreeFives,
        RuleKey::ThreeSixes,
        RuleKey::Straight,
        RuleKey::ThreePairs,
        RuleKey::TwoTriplets,
    ];

    fn index(self) -> usize {
        self as usize
    }

    /// Default point value
    pub fn default_value(self) -> u32 {
        match self {
            RuleKey::SingleOne => 100,
            RuleKey::SingleFive => 50,
            RuleKey::ThreeOnes => 1000,
            RuleKey::ThreeTwos => 200,
            RuleKey::ThreeThrees => 300,
            RuleKey::ThreeFours => 400,
            RuleKey::ThreeFives => 500,
            RuleKey::ThreeSixes => 600,
            RuleKey::Straight => 1500,
            RuleKey::ThreePairs => 1500,
            RuleKey::TwoTriplets => 2500,
        }
    }

    /// Inclusive range of allowed values
    pub fn range(self) -> RangeInclusive<u32> {
        match self {
            RuleKey::SingleOne => 50..=300,
            RuleKey::SingleFive => 25..=200,
            RuleKey::ThreeOnes => 300..=3000,
            RuleKey::ThreeTwos
            | RuleKey::ThreeThrees
            | RuleKey::ThreeFours
            | RuleKey::ThreeFives
            | RuleKey::ThreeSixes => 100..=1500,
            RuleKey::Straight | RuleKey::ThreePairs => 500..=3000,
            RuleKey::TwoTriplets => 1000..=5000,
        }
    }

    /// Increment used by steppers
    pub fn step(self) -> u32 {
        match self {
            RuleKey::SingleOne | RuleKey::SingleFive => 25,
            RuleKey::ThreeOnes
            | RuleKey::ThreeTwos
            | RuleKey::ThreeThrees
            | RuleKey::ThreeFours
            | RuleKey::ThreeFives
            | RuleKey::ThreeSixes => 100,
            RuleKey::Straight | RuleKey::ThreePairs | RuleKey::TwoTriplets => 250,
        }
    }

    /// Human-readable label
    pub fn label(self) -> &'static str {
        match self {
            RuleKey::SingleOne => "Single 1",
            RuleKey::SingleFive => "Single 5",
            RuleKey::ThreeOnes => "Three 1s",
            RuleKey::ThreeTwos => "Three 2s",
            RuleKey::ThreeThrees => "Three 3s",
            RuleKey::ThreeFours => "Three 4s",
            RuleKey::ThreeFives => "Three 5s",
            RuleKey::ThreeSixes => "Three 6s",
            RuleKey::Straight => "Straight",
            RuleKey::ThreePairs => "Three Pairs",
            RuleKey::TwoTriplets => "Two Triplets",
        }
    }

    /// Rule key holding the three-of-a-kind value for a face
    pub fn three_of_a_kind(face: u8) -> Option<RuleKey> {
        match face {
            1 => Some(RuleKey::ThreeOnes),
            2 => Some(RuleKey::ThreeTwos),
            3 => Some(RuleKey::ThreeThrees),
            4 => Some(RuleKey::ThreeFours),
            5 => Some(RuleKey::ThreeFives),
            6 => Some(RuleKey::ThreeSixes),
            _ => None,
        }
    }
}

/// A read-only view of one configurable value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleField {
    pub key: RuleKey,
    pub value: u32,
    pub default: u32,
    pub range: RangeInclusive<u32>,
    pub step: u32,
}

impl RuleField {
    pub fn is_default(&self) -> bool {
        self.value == self.default
    }
}

/// Point values for every scoring combination.
///
/// Values are always within their key's range: setters clamp, and
/// deserialization goes through the same setters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<RuleKey, u32>", into = "BTreeMap<RuleKey, u32>")]
pub struct ScoringRulesStore {
    values: [u32; RULE_COUNT],
}

impl Default for ScoringRulesStore {
    fn default() -> Self {
        let mut values = [0; RULE_COUNT];
        for key in RuleKey::ALL {
            values[key.index()] = key.default_value();
        }
        Self { values }
    }
}

impl ScoringRulesStore {
    /// Create a store holding the default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value for a key
    pub fn get(&self, key: RuleKey) -> u32 {
        self.values[key.index()]
    }

    /// Set a value, clamped into the key's range. Returns the stored value.
    pub fn set(&mut self, key: RuleKey, value: u32) -> u32 {
        let range = key.range();
        let clamped = value.clamp(*range.start(), *range.end());
        self.values[key.index()] = clamped;
        clamped
    }

    /// Raise a value by one step
    pub fn increment(&mut self, key: RuleKey) -> u32 {
        self.set(key, self.get(key).saturating_add(key.step()))
    }

    /// Lower a value by one step
    pub fn decrement(&mut self, key: RuleKey) -> u32 {
        self.set(key, self.get(key).saturating_sub(key.step()))
    }

    /// Restore one value to its default
    pub fn reset(&mut self, key: RuleKey) {
        self.values[key.index()] = key.default_value();
    }

    /// Restore every value to its default
    pub fn reset_all(&mut self) {
        *self = Self::default();
    }

    /// True if any value differs from its default
    pub fn is_customized(&self) -> bool {
        RuleKey::ALL
            .iter()
            .any(|key| self.get(*key) != key.default_value())
    }

    /// All fields in display order
    pub fn fields(&self) -> Vec<RuleField> {
        RuleKey::ALL
            .iter()
            .map(|&key| RuleField {
                key,
                value: self.get(key),
                default: key.default_value(),
                range: key.range(),
                step: key.step(),
            })
            .collect()
    }

    /// Base three-of-a-kind value for a face (0 for faces outside 1..=6)
    pub fn three_of_a_kind(&self, face: u8) -> u32 {
        RuleKey::three_of_a_kind(face)
            .map(|key| self.get(key))
            .unwrap_or(0)
    }

    /// Value of `count` dice of the same face scored as one grouping (count >= 3)
    pub fn n_of_a_kind(&self, face: u8, count: usize) -> u32 {
        let multiplier = KIND_MULTIPLIERS
            .iter()
            .find(|(n, _)| *n == count)
            .map(|(_, m)| *m)
            .unwrap_or(0);
        self.three_of_a_kind(face) * multiplier
    }

    /// Value of a single die, for the faces that score alone
    pub fn single(&self, face: u8) -> Option<u32> {
        match face {
            1 => Some(self.get(RuleKey::SingleOne)),
            5 => Some(self.get(RuleKey::SingleFive)),
            _ => None,
        }
    }

    /// Serialize for the settings collaborator
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Load from the settings collaborator. Missing keys keep their default,
    /// out-of-range values are clamped.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl From<BTreeMap<RuleKey, u32>> for ScoringRulesStore {
    fn from(map: BTreeMap<RuleKey, u32>) -> Self {
        let mut store = Self::default();
        for (key, value) in map {
            store.set(key, value);
        }
        store
    }
}

impl From<ScoringRulesStore> for BTreeMap<RuleKey, u32> {
    fn from(store: ScoringRulesStore) -> Self {
        RuleKey::ALL.iter().map(|&key| (key, store.get(key))).collect()
    }
}

/// Selectable winning scores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WinningScoreOption {
    FiveThousand,
    TenThousand,
    FifteenThousand,
    TwentyThousand,
}

impl WinningScoreOption {
    pub const ALL: [WinningScoreOption; 4] = [
        WinningScoreOption::FiveThousand,
        WinningScoreOption::TenThousand,
        WinningScoreOption::FifteenThousand,
        WinningScoreOption::TwentyThousand,
    ];

    pub fn points(self) -> u32 {
        match self {
            WinningScoreOption::FiveThousand => 5_000,
            WinningScoreOption::TenThousand => 10_000,
            WinningScoreOption::FifteenThousand => 15_000,
            WinningScoreOption::TwentyThousand => 20_000,
        }
    }
}

/// Selectable opening-score thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpeningThresholdOption {
    ThreeHundred,
    FiveHundred,
    SevenFifty,
    OneThousand,
}

impl OpeningThresholdOption {
    pub const ALL: [OpeningThresholdOption; 4] = [
        OpeningThresholdOption::ThreeHundred,
        OpeningThresholdOption::FiveHundred,
        OpeningThresholdOption::SevenFifty,
        OpeningThresholdOption::OneThousand,
    ];

    pub fn points(self) -> u32 {
        match self {
            OpeningThresholdOption::ThreeHundred => 300,
            OpeningThresholdOption::FiveHundred => 500,
            OpeningThresholdOption::SevenFifty => 750,
            OpeningThresholdOption::OneThousand => 1000,
        }
    }
}

/// Selectable triple-farkle penalties
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PenaltyOption {
    FiveHundred,
    OneThousand,
    FifteenHundred,
}

impl PenaltyOption {
    pub const ALL: [PenaltyOption; 3] = [
        PenaltyOption::FiveHundred,
        PenaltyOption::OneThousand,
        PenaltyOption::FifteenHundred,
    ];

    pub fn points(self) -> u32 {
        match self {
            PenaltyOption::FiveHundred => 500,
            PenaltyOption::OneThousand => 1000,
            PenaltyOption::FifteenHundred => 1500,
        }
    }
}

/// One selectable choice in the settings screen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingChoice {
    WinningScore(WinningScoreOption),
    OpeningThreshold(OpeningThresholdOption),
    Penalty(PenaltyOption),
}

impl fmt::Display for SettingChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingChoice::WinningScore(o) => write!(f, "{} to win", o.points()),
            SettingChoice::OpeningThreshold(o) => write!(f, "{} to open", o.points()),
            SettingChoice::Penalty(o) => write!(f, "-{} penalty", o.points()),
        }
    }
}

/// Game-level rule flags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameSettings {
    /// Score that triggers the final round
    pub winning_score: u32,
    /// Whether a player must bank `opening_score_threshold` before getting on the board
    pub require_opening_score: bool,
    pub opening_score_threshold: u32,
    /// Whether three consecutive farkles cost `triple_farkle_penalty` points
    pub enable_triple_farkle_rule: bool,
    pub triple_farkle_penalty: u32,
}

impl Default for GameSettings {
    fn default() -> Self {
        Self {
            winning_score: WinningScoreOption::TenThousand.points(),
            require_opening_score: false,
            opening_score_threshold: OpeningThresholdOption::FiveHundred.points(),
            enable_triple_farkle_rule: false,
            triple_farkle_penalty: PenaltyOption::FiveHundred.points(),
        }
    }
}

impl GameSettings {
    /// Apply a selected option
    pub fn apply(&mut self, choice: SettingChoice) {
        match choice {
            SettingChoice::WinningScore(o) => self.winning_score = o.points(),
            SettingChoice::OpeningThreshold(o) => self.opening_score_threshold = o.points(),
            SettingChoice::Penalty(o) => self.triple_farkle_penalty = o.points(),
        }
    }

    /// Whether a choice matches the current settings
    pub fn is_selected(&self, choice: SettingChoice) -> bool {
        match choice {
            SettingChoice::WinningScore(o) => self.winning_score == o.points(),
            SettingChoice::OpeningThreshold(o) => self.opening_score_threshold == o.points(),
            SettingChoice::Penalty(o) => self.triple_farkle_penalty == o.points(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_within_range() {
        for key in RuleKey::ALL {
            assert!(
                key.range().contains(&key.default_value()),
                "{:?} default outside range",
                key
            );
        }
    }

    #[test]
    fn test_fresh_store_not_customized() {
        let store = ScoringRulesStore::new();
        assert!(!store.is_customized());
        assert_eq!(store.get(RuleKey::Straight), 1500);
    }

    #[test]
    fn test_set_clamps_to_range() {
        let mut store = ScoringRulesStore::new();
        assert_eq!(store.set(RuleKey::SingleOne, 10_000), 300);
        assert_eq!(store.set(RuleKey::SingleOne, 0), 50);
        assert!(store.is_customized());
        store.reset(RuleKey::SingleOne);
        assert!(!store.is_customized());
    }

    #[test]
    fn test_step_increment_and_decrement() {
        let mut store = ScoringRulesStore::new();
        assert_eq!(store.increment(RuleKey::Straight), 1750);
        assert_eq!(store.decrement(RuleKey::Straight), 1500);
        store.set(RuleKey::SingleFive, 25);
        assert_eq!(store.decrement(RuleKey::SingleFive), 25);
    }

    #[test]
    fn test_n_of_a_kind_multipliers() {
        let store = ScoringRulesStore::new();
        assert_eq!(store.n_of_a_kind(5, 3), 500);
        assert_eq!(store.n_of_a_kind(5, 4), 1000);
        assert_eq!(store.n_of_a_kind(1, 5), 3000);
        assert_eq!(store.n_of_a_kind(2, 6), 800);
        assert_eq!(store.n_of_a_kind(2, 2), 0);
    }

    #[test]
    fn test_json_fills_missing_and_clamps() {
        let store = ScoringRulesStore::from_json(r#"{"straight":99999,"single_five":75}"#).unwrap();
        assert_eq!(store.get(RuleKey::Straight), 3000);
        assert_eq!(store.get(RuleKey::SingleFive), 75);
        assert_eq!(store.get(RuleKey::ThreeOnes), 1000);

        let json = store.to_json().unwrap();
        assert_eq!(ScoringRulesStore::from_json(&json).unwrap(), store);
    }

    #[test]
    fn test_settings_options() {
        let mut settings = GameSettings::default();
        assert_eq!(settings.winning_score, 10_000);
        let choice = SettingChoice::WinningScore(WinningScoreOption::FiveThousand);
        assert!(!settings.is_selected(choice));
        settings.apply(choice);
        assert!(settings.is_selected(choice));
        assert_eq!(settings.winning_score, 5_000);
        assert_eq!(choice.to_string(), "5000 to win");
    }

    #[test]
    fn test_fields_listing() {
        let fields = ScoringRulesStore::new().fields();
        assert_eq!(fields.len(), RuleKey::ALL.len());
        assert!(fields.iter().all(|f| f.is_default()));
    }
}
