//! Scoring engine: evaluates a roll of dice against the scoring rules
//!
//! Groupings are recognized in a fixed precedence so no die is counted twice:
//! 1. Six-die shapes (straight, three pairs, two triplets)
//! 2. N of a kind (n >= 3), always one grouping of the face's full count
//! 3. Single 1s and 5s for faces rolled fewer than three times
//!
//! The engine is stateless and never panics: faces outside 1..=6 are simply
//! non-scoring, and an unscoreable roll produces no options.

use crate::rules::{RuleKey, ScoringRulesStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Number of dice in a full roll
pub const DICE_PER_ROLL: usize = 6;

/// Maximum number of suggestions returned for display
pub const MAX_SUGGESTIONS: usize = 5;

/// The shape of a scoring grouping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Combination {
    Straight,
    ThreePairs,
    TwoTriplets,
    OfAKind { face: u8, count: u8 },
    Singles { face: u8, count: u8 },
    /// Several groupings taken together
    Mixed,
}

impl Combination {
    fn slug(&self) -> String {
        match self {
            Combination::Straight => "straight".to_string(),
            Combination::ThreePairs => "three_pairs".to_string(),
            Combination::TwoTriplets => "two_triplets".to_string(),
            Combination::OfAKind { face, count } => format!("kind{}x{}", count, face),
            Combination::Singles { face, count } => format!("single{}x{}", count, face),
            Combination::Mixed => "mixed".to_string(),
        }
    }

    /// Human-readable name, e.g. "Three 5s" or "Straight"
    pub fn describe(&self) -> String {
        match self {
            Combination::Straight => "Straight".to_string(),
            Combination::ThreePairs => "Three Pairs".to_string(),
            Combination::TwoTriplets => "Two Triplets".to_string(),
            Combination::OfAKind { face, count } => format!("{} {}s", count_word(*count), face),
            Combination::Singles { face, count: 1 } => format!("Single {}", face),
            Combination::Singles { face, count } => format!("{} {}s", count_word(*count), face),
            Combination::Mixed => "Mixed".to_string(),
        }
    }
}

fn count_word(count: u8) -> &'static str {
    match count {
        1 => "One",
        2 => "Two",
        3 => "Three",
        4 => "Four",
        5 => "Five",
        6 => "Six",
        _ => "Many",
    }
}

/// A candidate selection within a roll
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoringOption {
    /// Stable identity derived from the combination and dice values, not positions
    pub id: String,
    pub combination: Combination,
    /// Selected dice values, sorted ascending
    pub dice: Vec<u8>,
    /// Indices into the roll
    pub indices: Vec<usize>,
    pub score: u32,
    pub description: String,
}

impl ScoringOption {
    fn new(
        combination: Combination,
        roll: &[u8],
        mut indices: Vec<usize>,
        score: u32,
        description: String,
    ) -> Self {
        indices.sort_unstable();
        let mut dice: Vec<u8> = indices.iter().map(|&i| roll[i]).collect();
        dice.sort_unstable();
        let values: Vec<String> = dice.iter().map(|d| d.to_string()).collect();
        let id = format!("{}:{}", combination.slug(), values.join("-"));
        Self {
            id,
            combination,
            dice,
            indices,
            score,
            description,
        }
    }
}

/// Why a selection is invalid, or a tip for a valid one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SelectionReason {
    /// No dice were selected
    NothingSelected,
    /// Some indices are out of range or repeated
    InvalidIndices,
    /// Dice that score in no grouping were selected
    NonScoringDice { faces: Vec<u8> },
    /// Only part of an n-of-a-kind was selected
    IncompleteGrouping {
        face: u8,
        selected: usize,
        required: usize,
    },
    /// Valid, but an unselected grouping scores more
    BetterOptionAvailable { description: String, score: u32 },
}

impl SelectionReason {
    /// Tips never block a selection
    pub fn is_tip(&self) -> bool {
        matches!(self, SelectionReason::BetterOptionAvailable { .. })
    }

    /// Get a user-friendly message
    pub fn message(&self) -> String {
        match self {
            SelectionReason::NothingSelected => "Select at least one scoring die".to_string(),
            SelectionReason::InvalidIndices => "Invalid dice selection".to_string(),
            SelectionReason::NonScoringDice { faces } => {
                let faces: Vec<String> = faces.iter().map(|f| f.to_string()).collect();
                format!("{} don't score on their own", faces.join(", "))
            }
            SelectionReason::IncompleteGrouping {
                face,
                selected,
                required,
            } => format!(
                "Select all {} of the {}s (only {} selected)",
                required, face, selected
            ),
            SelectionReason::BetterOptionAvailable { description, score } => {
                format!("Tip: {} is worth {}", description, score)
            }
        }
    }
}

/// Result of validating a selection against a roll
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SelectionValidation {
    pub is_valid: bool,
    pub reason: Option<SelectionReason>,
    pub invalid_indices: BTreeSet<usize>,
    /// Score of the selection (0 when invalid)
    pub score: u32,
}

impl SelectionValidation {
    fn invalid(reason: SelectionReason, invalid_indices: BTreeSet<usize>) -> Self {
        Self {
            is_valid: false,
            reason: Some(reason),
            invalid_indices,
            score: 0,
        }
    }
}

/// Per-face counts, index 0 unused
type FaceCounts = [usize; 7];

fn face_counts(dice: &[u8]) -> FaceCounts {
    let mut counts = [0; 7];
    for &d in dice {
        if (1..=6).contains(&d) {
            counts[d as usize] += 1;
        }
    }
    counts
}

fn is_face(d: u8) -> bool {
    (1..=6).contains(&d)
}

/// Stateless evaluator bound to a set of point values
#[derive(Debug, Clone, Copy)]
pub struct ScoringEngine<'a> {
    rules: &'a ScoringRulesStore,
}

impl<'a> ScoringEngine<'a> {
    pub fn new(rules: &'a ScoringRulesStore) -> Self {
        Self { rules }
    }

    /// Six-die shape formed by exactly these dice, if any
    fn six_die_shape(&self, dice: &[u8]) -> Option<(Combination, u32)> {
        if dice.len() != DICE_PER_ROLL || !dice.iter().all(|&d| is_face(d)) {
            return None;
        }
        let counts = face_counts(dice);
        let present: Vec<usize> = counts[1..].iter().copied().filter(|&c| c > 0).collect();
        if present.len() == 6 {
            Some((Combination::Straight, self.rules.get(RuleKey::Straight)))
        } else if present.len() == 3 && present.iter().all(|&c| c == 2) {
            Some((Combination::ThreePairs, self.rules.get(RuleKey::ThreePairs)))
        } else if present.len() == 2 && present.iter().all(|&c| c == 3) {
            Some((Combination::TwoTriplets, self.rules.get(RuleKey::TwoTriplets)))
        } else {
            None
        }
    }

    /// Score of dice taken as n-of-a-kind groupings and singles.
    /// Err holds the faces that cannot score.
    fn grouped_score(&self, counts: &FaceCounts) -> Result<u32, Vec<u8>> {
        let mut score = 0;
        let mut non_scoring = Vec::new();
        for face in 1..=6u8 {
            let count = counts[face as usize];
            if count == 0 {
                continue;
            }
            if count >= 3 {
                score += self.rules.n_of_a_kind(face, count);
            } else if let Some(single) = self.rules.single(face) {
                score += single * count as u32;
            } else {
                non_scoring.push(face);
            }
        }
        if non_scoring.is_empty() {
            Ok(score)
        } else {
            Err(non_scoring)
        }
    }

    /// Best score for a set of dice that all belong to groupings.
    fn best_score(&self, dice: &[u8]) -> Option<u32> {
        if dice.is_empty() || !dice.iter().all(|&d| is_face(d)) {
            return None;
        }
        let shape = self.six_die_shape(dice).map(|(_, s)| s);
        let grouped = self.grouped_score(&face_counts(dice)).ok();
        match (shape, grouped) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    /// All candidate selections in a roll
    pub fn evaluate_combinations(&self, roll: &[u8]) -> Vec<ScoringOption> {
        let mut positions: [Vec<usize>; 7] = Default::default();
        for (i, &d) in roll.iter().enumerate() {
            if is_face(d) {
                positions[d as usize].push(i);
            }
        }

        let mut options = Vec::new();
        let mut groupings = 0;
        let mut scoring_indices = Vec::new();

        for face in 1..=6u8 {
            let at = &positions[face as usize];
            let count = at.len();
            if count >= 3 {
                let combination = Combination::OfAKind {
                    face,
                    count: count as u8,
                };
                let score = self.rules.n_of_a_kind(face, count);
                options.push(ScoringOption::new(
                    combination,
                    roll,
                    at.clone(),
                    score,
                    combination.describe(),
                ));
                groupings += 1;
                scoring_indices.extend_from_slice(at);
            } else if count > 0 {
                if let Some(single) = self.rules.single(face) {
                    for k in 1..=count {
                        let combination = Combination::Singles {
                            face,
                            count: k as u8,
                        };
                        options.push(ScoringOption::new(
                            combination,
                            roll,
                            at[..k].to_vec(),
                            single * k as u32,
                            combination.describe(),
                        ));
                    }
                    groupings += 1;
                    scoring_indices.extend_from_slice(at);
                }
            }
        }

        // Everything that scores, taken together
        let mut mixed = None;
        if groupings > 1 {
            let dice: Vec<u8> = scoring_indices.iter().map(|&i| roll[i]).collect();
            if let Ok(score) = self.grouped_score(&face_counts(&dice)) {
                let description = options
                    .iter()
                    .filter(|o| {
                        matches!(o.combination, Combination::OfAKind { .. })
                            || matches!(o.combination, Combination::Singles { face, count }
                                if positions[face as usize].len() == count as usize)
                    })
                    .map(|o| o.description.clone())
                    .collect::<Vec<_>>()
                    .join(" + ");
                mixed = Some(ScoringOption::new(
                    Combination::Mixed,
                    roll,
                    scoring_indices.clone(),
                    score,
                    description,
                ));
            }
        }

        let shape = self.six_die_shape(roll).map(|(combination, score)| {
            ScoringOption::new(
                combination,
                roll,
                (0..roll.len()).collect(),
                score,
                combination.describe(),
            )
        });

        // An all-six selection scores its best interpretation, so only list the better one
        match (shape, mixed) {
            (Some(shape), Some(mixed)) if mixed.indices.len() == roll.len() => {
                if mixed.score > shape.score {
                    options.push(mixed);
                } else {
                    options.insert(0, shape);
                }
            }
            (shape, mixed) => {
                if let Some(shape) = shape {
                    options.insert(0, shape);
                }
                if let Some(mixed) = mixed {
                    options.push(mixed);
                }
            }
        }

        options
    }

    /// Indices of dice that take part in at least one grouping
    pub fn scoring_dice_indices(&self, roll: &[u8]) -> BTreeSet<usize> {
        if self.six_die_shape(roll).is_some() {
            return (0..roll.len()).collect();
        }
        let counts = face_counts(roll);
        roll.iter()
            .enumerate()
            .filter(|&(_, &d)| is_face(d) && (counts[d as usize] >= 3 || self.rules.single(d).is_some()))
            .map(|(i, _)| i)
            .collect()
    }

    /// Candidate selections, best first, truncated for display
    pub fn suggest_selections(&self, roll: &[u8]) -> Vec<ScoringOption> {
        let mut options = self.evaluate_combinations(roll);
        options.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then(a.dice.len().cmp(&b.dice.len()))
                .then(a.id.cmp(&b.id))
        });
        options.truncate(MAX_SUGGESTIONS);
        options
    }

    /// Check a proposed selection of roll indices.
    ///
    /// Valid iff every selected die belongs to a complete grouping. A valid
    /// selection may still carry a tip when a better grouping is left unselected.
    pub fn validate_selection(&self, selected: &[usize], roll: &[u8]) -> SelectionValidation {
        if selected.is_empty() {
            return SelectionValidation::invalid(SelectionReason::NothingSelected, BTreeSet::new());
        }

        let mut seen = BTreeSet::new();
        let mut bad = BTreeSet::new();
        for &i in selected {
            if i >= roll.len() || !seen.insert(i) {
                bad.insert(i);
            }
        }
        if !bad.is_empty() {
            return SelectionValidation::invalid(SelectionReason::InvalidIndices, bad);
        }

        let values: Vec<u8> = seen.iter().map(|&i| roll[i]).collect();

        // The whole roll can always be scored as its best interpretation
        if seen.len() == roll.len() {
            if let Some(shape_score) = self.six_die_shape(roll).map(|(_, s)| s) {
                let score = self
                    .grouped_score(&face_counts(roll))
                    .map(|g| g.max(shape_score))
                    .unwrap_or(shape_score);
                return SelectionValidation {
                    is_valid: true,
                    reason: None,
                    invalid_indices: BTreeSet::new(),
                    score,
                };
            }
        }

        let roll_counts = face_counts(roll);
        let selected_counts = face_counts(&values);
        let mut reason = None;
        let mut non_scoring_faces = Vec::new();

        for face in 1..=6u8 {
            let have = selected_counts[face as usize];
            let rolled = roll_counts[face as usize];
            if have == 0 {
                continue;
            }
            let offending = || {
                seen.iter()
                    .copied()
                    .filter(|&i| roll[i] == face)
                    .collect::<Vec<_>>()
            };
            if rolled >= 3 && have != rolled {
                bad.extend(offending());
                if reason.is_none() {
                    reason = Some(SelectionReason::IncompleteGrouping {
                        face,
                        selected: have,
                        required: rolled,
                    });
                }
            } else if have < 3 && self.rules.single(face).is_none() {
                bad.extend(offending());
                non_scoring_faces.push(face);
            }
        }
        // Faces outside 1..=6 never score
        for &i in &seen {
            if !is_face(roll[i]) {
                bad.insert(i);
            }
        }

        if !bad.is_empty() {
            let reason = reason.unwrap_or(SelectionReason::NonScoringDice {
                faces: non_scoring_faces,
            });
            return SelectionValidation::invalid(reason, bad);
        }

        let score = match self.grouped_score(&selected_counts) {
            Ok(score) => score,
            Err(faces) => {
                return SelectionValidation::invalid(
                    SelectionReason::NonScoringDice { faces },
                    seen,
                )
            }
        };

        SelectionValidation {
            is_valid: true,
            reason: self.better_unselected(roll, &seen, score),
            invalid_indices: BTreeSet::new(),
            score,
        }
    }

    /// Tip for a valid selection that leaves a more valuable grouping behind
    fn better_unselected(
        &self,
        roll: &[u8],
        selected: &BTreeSet<usize>,
        score: u32,
    ) -> Option<SelectionReason> {
        self.evaluate_combinations(roll)
            .into_iter()
            .filter(|o| {
                matches!(
                    o.combination,
                    Combination::Straight
                        | Combination::ThreePairs
                        | Combination::TwoTriplets
                        | Combination::OfAKind { .. }
                )
            })
            .filter(|o| o.score > score && o.indices.iter().any(|i| !selected.contains(i)))
            .max_by_key(|o| o.score)
            .map(|o| SelectionReason::BetterOptionAvailable {
                description: o.description,
                score: o.score,
            })
    }

    /// Score a selection given by face values against the dice it was taken from.
    ///
    /// Applies the same completeness rules as `validate_selection`. Returns None
    /// when the selection is not a sub-multiset of the roll or does not score.
    pub fn score_values(&self, rolled: &[u8], selected: &[u8]) -> Option<u32> {
        if selected.is_empty() || selected.len() > rolled.len() {
            return None;
        }
        let mut indices: Vec<usize> = Vec::with_capacity(selected.len());
        for &value in selected {
            let pos = (0..rolled.len()).find(|i| rolled[*i] == value && !indices.contains(i))?;
            indices.push(pos);
        }
        let validation = self.validate_selection(&indices, rolled);
        validation.is_valid.then_some(validation.score)
    }

    /// Whether a roll has no scoring dice at all
    pub fn is_farkle(&self, roll: &[u8]) -> bool {
        self.scoring_dice_indices(roll).is_empty()
    }

    /// Best possible score of a set of dice, ignoring completeness against a roll
    pub fn max_score(&self, dice: &[u8]) -> Option<u32> {
        self.best_score(dice)
    }
}
