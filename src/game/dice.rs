//! Sources of die faces

use rand::prelude::*;
use rand::rngs::StdRng;
use std::collections::VecDeque;

/// Produces die faces for a roll
pub trait DiceSource: Send {
    /// Roll `count` dice, each a face in 1..=6
    fn roll(&mut self, count: usize) -> Vec<u8>;
}

/// Uniformly random dice
pub struct RandomDice {
    rng: StdRng,
}

impl RandomDice {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_rng(&mut rand::rng()),
        }
    }

    /// Deterministic dice for simulations and replays
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for RandomDice {
    fn default() -> Self {
        Self::new()
    }
}

impl DiceSource for RandomDice {
    fn roll(&mut self, count: usize) -> Vec<u8> {
        (0..count).map(|_| self.rng.random_range(1..=6)).collect()
    }
}

/// Dice that replay queued faces in order.
///
/// Once the queue runs dry, faces come from a fixed-seed random source.
pub struct ScriptedDice {
    queue: VecDeque<u8>,
    fallback: RandomDice,
}

impl ScriptedDice {
    pub fn new(faces: impl IntoIterator<Item = u8>) -> Self {
        Self {
            queue: faces.into_iter().collect(),
            fallback: RandomDice::seeded(0),
        }
    }

    /// Queue whole rolls, one after another
    pub fn rolls<R: AsRef<[u8]>>(rolls: impl IntoIterator<Item = R>) -> Self {
        let mut faces = Vec::new();
        for roll in rolls {
            faces.extend_from_slice(roll.as_ref());
        }
        Self::new(faces)
    }

    pub fn remaining(&self) -> usize {
        self.queue.len()
    }
}

impl DiceSource for ScriptedDice {
    fn roll(&mut self, count: usize) -> Vec<u8> {
        (0..count)
            .map(|_| match self.queue.pop_front() {
                Some(face) => face,
                None => self.fallback.roll(1)[0],
            })
            .collect()
    }
}
