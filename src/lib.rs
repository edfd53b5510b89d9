//! Farkle: scoring, turn flow and host-authoritative LAN multiplayer

pub mod game;
pub mod multiplayer;
pub mod network;
pub mod rules;
pub mod scoring;
pub mod storage;
