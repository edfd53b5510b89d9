//! Farkle - push your luck with six dice
//!
//! `farkle simulate [players] [seed]` plays a bot game and records it,
//! `farkle history` lists recent games, `farkle browse` looks for LAN hosts.

use farkle::game::dice::RandomDice;
use farkle::game::{AutoPlayer, GameEngine};
use farkle::network::{DeviceInfo, LanSession, Session, SessionEvent};
use farkle::rules::{GameSettings, ScoringRulesStore};
use farkle::storage::HistoryStore;
use std::env;
use std::error::Error;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Turn cap for simulated games
const MAX_SIMULATED_TURNS: usize = 2_000;

const BROWSE_FOR: Duration = Duration::from_secs(3);

/// Display name when no handle has been stored
const DEFAULT_HANDLE: &str = "Farkle";

fn usage() -> String {
    "usage: farkle simulate [players] [seed] | farkle history | farkle browse".to_string()
}

fn simulate(players: usize, seed: Option<u64>) -> Result<(), Box<dyn Error>> {
    let dice = match seed {
        Some(seed) => RandomDice::seeded(seed),
        None => RandomDice::new(),
    };
    let mut engine = GameEngine::with_dice(
        ScoringRulesStore::default(),
        GameSettings::default(),
        Box::new(dice),
    );
    for n in 1..=players {
        engine.add_player(&format!("Bot {}", n))?;
    }
    engine.start_game()?;

    let outcomes = AutoPlayer::default().play_game(&mut engine, MAX_SIMULATED_TURNS)?;
    if engine.winner().is_none() {
        engine.finish_game();
    }
    info!("Simulated {} turns", outcomes.len());

    let summary = engine.summary();
    for (place, player) in summary.players.iter().enumerate() {
        println!(
            "{}. {:<8} {:>6}  ({} turns, {} farkles)",
            place + 1,
            player.name,
            player.total_score,
            player.turns,
            player.farkles
        );
    }

    let mut store = HistoryStore::open()?;
    let id = store.record_game(&summary)?;
    println!("Recorded as game #{}", id);
    Ok(())
}

fn history() -> Result<(), Box<dyn Error>> {
    let store = HistoryStore::open()?;
    let games = store.recent_games(10)?;
    if games.is_empty() {
        println!("No games recorded yet");
    }
    for game in games {
        let standings: Vec<String> = game
            .players
            .iter()
            .map(|p| format!("{} {}", p.name, p.total_score))
            .collect();
        println!(
            "#{:<4} winner: {:<10} {}",
            game.id,
            game.winner.as_deref().unwrap_or("-"),
            standings.join(", ")
        );
    }
    Ok(())
}

fn browse() -> Result<(), Box<dyn Error>> {
    let device = match HistoryStore::open() {
        Ok(store) => store.local_device(DEFAULT_HANDLE)?,
        Err(e) => {
            warn!("History unavailable, using a temporary identity: {}", e);
            DeviceInfo::new(DEFAULT_HANDLE)
        }
    };
    let mut session = LanSession::with_device(device);
    session.browse()?;

    let deadline = Instant::now() + BROWSE_FOR;
    while Instant::now() < deadline {
        for event in session.poll() {
            if let SessionEvent::HostDiscovered(host) = event {
                info!("Found {} at {}:{}", host.display_name, host.hostname, host.port);
            }
        }
        thread::sleep(Duration::from_millis(100));
    }

    let hosts = session.discovered_hosts();
    if hosts.is_empty() {
        println!("No games found on the local network");
    }
    for host in hosts {
        println!(
            "{:<16} {} players  {}:{}{}",
            host.display_name,
            host.player_count,
            host.hostname,
            host.port,
            if host.is_compatible() { "" } else { "  (incompatible)" }
        );
    }
    Ok(())
}

fn run(args: &[String]) -> Result<(), Box<dyn Error>> {
    match args.get(1).map(String::as_str) {
        Some("simulate") => {
            let players = match args.get(2) {
                Some(n) => n.parse().map_err(|_| format!("invalid player count: {}", n))?,
                None => 2,
            };
            if players == 0 {
                return Err("need at least one player".into());
            }
            let seed = match args.get(3) {
                Some(s) => Some(s.parse().map_err(|_| format!("invalid seed: {}", s))?),
                None => None,
            };
            simulate(players, seed)
        }
        Some("history") => history(),
        Some("browse") => browse(),
        _ => Err(usage().into()),
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();
    if let Err(e) = run(&args) {
        eprintln!("farkle: {}", e);
        std::process::exit(1);
    }
}
