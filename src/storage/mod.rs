//! Persistent game history using SQLite (rusqlite)
//!
//! - OS-standard data directory location (via `directories`)
//! - Schema versioning in a `meta` row that also holds the device identity
//! - Finished games with their final standings

use crate::game::{GameSummary, PlayerSummary};
use crate::network::{new_device_id, DeviceId, DeviceInfo};
use directories::ProjectDirs;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info};

/// Current schema version. Bump this when making schema changes.
/// Version history:
/// - v1: meta, games and game_players tables
const SCHEMA_VERSION: u32 = 1;

const DB_FILE: &str = "farkle.db";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("could not determine data directory")]
    NoDataDirectory,

    #[error("database schema version {found} is newer than supported version {supported}")]
    FutureSchemaVersion { found: u32, supported: u32 },

    #[error("failed to create data directory: {0}")]
    CreateDirFailed(std::io::Error),
}

/// A finished game as stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameRecord {
    pub id: i64,
    pub finished_at_ms: u64,
    pub winner: Option<String>,
    /// Final standings, highest total first
    pub players: Vec<PlayerSummary>,
}

/// Lifetime totals for one player name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerRecord {
    pub name: String,
    pub games_played: u32,
    pub wins: u32,
    pub best_score: u32,
    pub total_points: u64,
    pub farkles: u64,
}

pub struct HistoryStore {
    conn: Connection,
    device_id: DeviceId,
}

impl HistoryStore {
    /// Open or create the history database.
    ///
    /// Uses OS-standard directories:
    /// - Linux: `$XDG_DATA_HOME/farkle/` or `~/.local/share/farkle/`
    /// - macOS: `~/Library/Application Support/farkle/`
    pub fn open() -> Result<Self, StorageError> {
        let data_dir = Self::data_dir()?;
        std::fs::create_dir_all(&data_dir).map_err(StorageError::CreateDirFailed)?;
        Self::open_at(&data_dir.join(DB_FILE))
    }

    pub fn open_at(path: &Path) -> Result<Self, StorageError> {
        debug!("Opening history at {}", path.display());
        Self::init(Connection::open(path)?)
    }

    /// Open a throwaway database
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        let mut store = HistoryStore {
            conn,
            device_id: DeviceId::new(),
        };
        store.initialize_schema()?;
        store.device_id = store.load_device_id()?;
        Ok(store)
    }

    pub fn data_dir() -> Result<PathBuf, StorageError> {
        ProjectDirs::from("", "", "farkle")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .ok_or(StorageError::NoDataDirectory)
    }

    /// This device's persistent identity
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// This device as it appears to others: the stored id and handle,
    /// or `fallback_name` when no handle is set
    pub fn local_device(&self, fallback_name: &str) -> Result<DeviceInfo, StorageError> {
        let name = self.handle()?.unwrap_or_else(|| fallback_name.to_string());
        Ok(DeviceInfo::with_id(self.device_id.clone(), name))
    }

    /// Display name used when hosting or joining
    pub fn handle(&self) -> Result<Option<String>, StorageError> {
        let handle = self
            .conn
            .query_row("SELECT handle FROM meta LIMIT 1", [], |row| {
                row.get::<_, Option<String>>(0)
            })
            .optional()?;
        Ok(handle.flatten())
    }

    pub fn set_handle(&self, handle: &str) -> Result<(), StorageError> {
        self.conn
            .execute("UPDATE meta SET handle = ?1", params![handle])?;
        Ok(())
    }

    /// Store a finished game. Returns its id.
    pub fn record_game(&mut self, summary: &GameSummary) -> Result<i64, StorageError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO games (finished_at, winner, player_count) VALUES (?1, ?2, ?3)",
            params![
                summary.finished_at_ms as i64,
                summary.winner,
                summary.players.len() as i64
            ],
        )?;
        let game_id = tx.last_insert_rowid();
        {
            let mut insert = tx.prepare(
                "INSERT INTO game_players (game_id, seat, name, total_score, turns, farkles)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for (seat, player) in summary.players.iter().enumerate() {
                insert.execute(params![
                    game_id,
                    seat as i64,
                    player.name,
                    player.total_score as i64,
                    player.turns as i64,
                    player.farkles as i64
                ])?;
            }
        }
        tx.commit()?;
        info!(
            "Recorded game {} ({} players, winner {:?})",
            game_id,
            summary.players.len(),
            summary.winner
        );
        Ok(game_id)
    }

    /// Most recent games first
    pub fn recent_games(&self, limit: usize) -> Result<Vec<GameRecord>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, finished_at, winner FROM games
             ORDER BY finished_at DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(GameRecord {
                id: row.get(0)?,
                finished_at_ms: row.get::<_, i64>(1)? as u64,
                winner: row.get(2)?,
                players: Vec::new(),
            })
        })?;
        let mut games = rows.collect::<Result<Vec<_>, _>>()?;
        for game in &mut games {
            game.players = self.standings(game.id)?;
        }
        Ok(games)
    }

    fn standings(&self, game_id: i64) -> Result<Vec<PlayerSummary>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT name, total_score, turns, farkles FROM game_players
             WHERE game_id = ?1 ORDER BY seat",
        )?;
        let rows = stmt.query_map(params![game_id], |row| {
            Ok(PlayerSummary {
                name: row.get(0)?,
                total_score: row.get::<_, i64>(1)? as u32,
                turns: row.get::<_, i64>(2)? as usize,
                farkles: row.get::<_, i64>(3)? as usize,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Lifetime totals for a player name; None if they never played
    pub fn player_record(&self, name: &str) -> Result<Option<PlayerRecord>, StorageError> {
        let (games_played, best, total, farkles): (i64, i64, i64, i64) = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(MAX(total_score), 0),
                    COALESCE(SUM(total_score), 0), COALESCE(SUM(farkles), 0)
             FROM game_players WHERE name = ?1",
            params![name],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;
        if games_played == 0 {
            return Ok(None);
        }
        let wins: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM games WHERE winner = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(Some(PlayerRecord {
            name: name.to_string(),
            games_played: games_played as u32,
            wins: wins as u32,
            best_score: best as u32,
            total_points: total as u64,
            farkles: farkles as u64,
        }))
    }

    pub fn game_count(&self) -> Result<u64, StorageError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM games", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    // === Schema ===

    fn initialize_schema(&self) -> Result<(), StorageError> {
        let current_version = self.get_schema_version()?;
        if current_version == 0 {
            self.create_schema_v1()?;
        } else if current_version > SCHEMA_VERSION {
            return Err(StorageError::FutureSchemaVersion {
                found: current_version,
                supported: SCHEMA_VERSION,
            });
        }
        Ok(())
    }

    fn get_schema_version(&self) -> Result<u32, StorageError> {
        let table_exists: bool = self.conn.query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='meta'",
            [],
            |row| row.get(0),
        )?;
        if !table_exists {
            return Ok(0);
        }
        let version = self
            .conn
            .query_row("SELECT schema_version FROM meta LIMIT 1", [], |row| {
                row.get::<_, u32>(0)
            })
            .optional()?;
        Ok(version.unwrap_or(0))
    }

    fn create_schema_v1(&self) -> Result<(), StorageError> {
        self.conn.execute_batch(
            r#"
            -- Meta table: schema version and device identity
            CREATE TABLE meta (
                schema_version INTEGER NOT NULL,
                device_id TEXT NOT NULL,
                handle TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE games (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                finished_at INTEGER NOT NULL,
                winner TEXT,
                player_count INTEGER NOT NULL
            );

            -- One row per seat in a finished game, in final standing order
            CREATE TABLE game_players (
                game_id INTEGER NOT NULL REFERENCES games (id),
                seat INTEGER NOT NULL,
                name TEXT NOT NULL,
                total_score INTEGER NOT NULL,
                turns INTEGER NOT NULL,
                farkles INTEGER NOT NULL,
                PRIMARY KEY (game_id, seat)
            );

            CREATE INDEX idx_game_players_name ON game_players (name);
            CREATE INDEX idx_games_finished ON games (finished_at);
            "#,
        )?;
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        self.conn.execute(
            "INSERT INTO meta (schema_version, device_id, handle, created_at) VALUES (?1, ?2, NULL, ?3)",
            params![SCHEMA_VERSION, new_device_id(), created_at],
        )?;
        Ok(())
    }

    fn load_device_id(&self) -> Result<DeviceId, StorageError> {
        Ok(self
            .conn
            .query_row("SELECT device_id FROM meta LIMIT 1", [], |row| row.get(0))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(players: &[(&str, u32, usize)], winner: Option<&str>, at: u64) -> GameSummary {
        GameSummary {
            players: players
                .iter()
                .map(|(name, score, farkles)| PlayerSummary {
                    name: name.to_string(),
                    total_score: *score,
                    turns: 12,
                    farkles: *farkles,
                })
                .collect(),
            winner: winner.map(str::to_string),
            finished_at_ms: at,
        }
    }

    #[test]
    fn test_storage_creation() {
        let store = HistoryStore::open_in_memory().unwrap();
        assert!(store.device_id().starts_with("farkle-"));
        assert_eq!(store.game_count().unwrap(), 0);
    }

    #[test]
    fn test_handle_storage() {
        let store = HistoryStore::open_in_memory().unwrap();
        assert!(store.handle().unwrap().is_none());
        store.set_handle("Kitchen Table").unwrap();
        assert_eq!(store.handle().unwrap(), Some("Kitchen Table".to_string()));
    }

    #[test]
    fn test_local_device_uses_stored_identity() {
        let store = HistoryStore::open_in_memory().unwrap();
        let device = store.local_device("Farkle").unwrap();
        assert_eq!(device.id, store.device_id());
        assert_eq!(device.display_name, "Farkle");
        assert!(!device.is_host);

        store.set_handle("Porch").unwrap();
        let device = store.local_device("Farkle").unwrap();
        assert_eq!(device.id, store.device_id());
        assert_eq!(device.display_name, "Porch");
    }

    #[test]
    fn test_recent_games_newest_first() {
        let mut store = HistoryStore::open_in_memory().unwrap();
        store
            .record_game(&summary(&[("Ann", 10_200, 2), ("Ben", 7_450, 4)], Some("Ann"), 1_000))
            .unwrap();
        store
            .record_game(&summary(&[("Ben", 10_050, 1), ("Ann", 9_900, 3)], Some("Ben"), 2_000))
            .unwrap();

        let games = store.recent_games(10).unwrap();
        assert_eq!(games.len(), 2);
        assert_eq!(games[0].winner.as_deref(), Some("Ben"));
        assert_eq!(games[0].players[0].name, "Ben");
        assert_eq!(games[1].players[1].total_score, 7_450);
        assert_eq!(store.recent_games(1).unwrap().len(), 1);
    }

    #[test]
    fn test_player_record() {
        let mut store = HistoryStore::open_in_memory().unwrap();
        store
            .record_game(&summary(&[("Ann", 10_200, 2), ("Ben", 7_450, 4)], Some("Ann"), 1_000))
            .unwrap();
        store
            .record_game(&summary(&[("Ben", 10_050, 1), ("Ann", 9_900, 3)], Some("Ben"), 2_000))
            .unwrap();

        let ann = store.player_record("Ann").unwrap().unwrap();
        assert_eq!(ann.games_played, 2);
        assert_eq!(ann.wins, 1);
        assert_eq!(ann.best_score, 10_200);
        assert_eq!(ann.total_points, 20_100);
        assert_eq!(ann.farkles, 5);
        assert!(store.player_record("Cal").unwrap().is_none());
    }

    #[test]
    fn test_reopen_keeps_identity() {
        let dir = std::env::temp_dir().join(format!("farkle-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(DB_FILE);
        let _ = std::fs::remove_file(&path);

        let first = HistoryStore::open_at(&path).unwrap();
        let id = first.device_id().to_string();
        drop(first);
        let second = HistoryStore::open_at(&path).unwrap();
        assert_eq!(second.device_id(), id);

        drop(second);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_future_schema_rejected() {
        let store = HistoryStore::open_in_memory().unwrap();
        store
            .conn
            .execute("UPDATE meta SET schema_version = 99", [])
            .unwrap();
        assert!(matches!(
            store.initialize_schema(),
            Err(StorageError::FutureSchemaVersion { found: 99, .. })
        ));
    }
}
