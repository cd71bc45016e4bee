// Position Store
// SQLite-based persistence for users, positions, the trade ledger and
// configuration history.
//
// Decimals are stored as normalized text and timestamps as RFC 3339 text so
// no precision is lost between cycles.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::types::{
    Balance, ConfigSnapshot, Direction, ExchangeCredentials, PositionRecord, PositionStatus,
    SignalRecord, Symbol, TradeMode, TradeRecord, UserAccount, UserId, UserMode,
};

/// Result of writing a position through [`SqliteStore::upsert_position`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Stored row already matched; nothing was written
    Unchanged,
}

/// Count and capital tied up in a user's OPEN positions
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OpenExposure {
    pub count: usize,
    pub used_capital: Decimal,
}

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl Clone for SqliteStore {
    fn clone(&self) -> Self {
        Self {
            conn: Arc::clone(&self.conn),
        }
    }
}

pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn decimal_text(value: Decimal) -> String {
    value.normalize().to_string()
}

fn conversion_error(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn decimal_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(idx)?;
    Decimal::from_str(raw.trim()).map_err(|e| conversion_error(idx, e))
}

fn opt_decimal_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) if !raw.trim().is_empty() => Decimal::from_str(raw.trim())
            .map(Some)
            .map_err(|e| conversion_error(idx, e)),
        _ => Ok(None),
    }
}

fn enum_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| conversion_error(idx, e))
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

const POSITION_COLUMNS: &str =
    "id, user_id, symbol, direction, entry_price, quantity, status, entry_time, trade_mode";

fn position_from_row(row: &Row<'_>) -> rusqlite::Result<PositionRecord> {
    Ok(PositionRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        symbol: Symbol::new(row.get::<_, String>(2)?),
        direction: enum_col(row, 3)?,
        entry_price: decimal_col(row, 4)?,
        quantity: decimal_col(row, 5)?,
        status: enum_col(row, 6)?,
        entry_time: row.get(7)?,
        trade_mode: enum_col(row, 8)?,
    })
}

const TRADE_COLUMNS: &str = "id, user_id, symbol, direction, quantity, entry_price, exit_price, \
     fees, net_pnl, pnl_pct, exit_reason, trade_mode, exit_time";

fn trade_from_row(row: &Row<'_>) -> rusqlite::Result<TradeRecord> {
    Ok(TradeRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        symbol: Symbol::new(row.get::<_, String>(2)?),
        direction: enum_col(row, 3)?,
        quantity: decimal_col(row, 4)?,
        entry_price: decimal_col(row, 5)?,
        exit_price: decimal_col(row, 6)?,
        fees: decimal_col(row, 7)?,
        net_pnl: decimal_col(row, 8)?,
        pnl_pct: decimal_col(row, 9)?,
        exit_reason: row.get(10)?,
        trade_mode: enum_col(row, 11)?,
        exit_time: ts_col(row, 12)?,
    })
}

fn snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<ConfigSnapshot> {
    let config_json: String = row.get(1)?;
    let config: HashMap<String, String> =
        serde_json::from_str(&config_json).map_err(|e| conversion_error(1, e))?;
    Ok(ConfigSnapshot {
        id: row.get(0)?,
        config,
        win_rate: row.get(2)?,
        pnl_pct: row.get(3)?,
        is_stable: row.get::<_, i64>(4)? != 0,
        created_at: ts_col(row, 5)?,
    })
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;

        let store = Self::from_connection(conn)?;
        info!("Position store opened at {}", db_path.display());
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.create_tables()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("position store mutex poisoned"))
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                user_id INTEGER PRIMARY KEY,
                mode TEXT NOT NULL DEFAULT 'auto',
                trade_mode TEXT NOT NULL DEFAULT 'futures',
                deposit TEXT NOT NULL DEFAULT '0',
                balance TEXT NOT NULL DEFAULT '0',
                free_deposit TEXT NOT NULL DEFAULT '0',
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS user_exchange_keys (
                user_id INTEGER PRIMARY KEY,
                api_key TEXT NOT NULL,
                api_secret TEXT NOT NULL,
                passphrase TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS signals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                direction TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                tp1_price TEXT,
                tp2_price TEXT,
                sl_price TEXT,
                signal_token TEXT NOT NULL DEFAULT '',
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                direction TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                quantity TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'OPEN',
                entry_time TEXT,
                trade_mode TEXT NOT NULL DEFAULT 'futures',
                closed_at TEXT,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                direction TEXT NOT NULL,
                quantity TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                exit_price TEXT NOT NULL,
                fees TEXT NOT NULL DEFAULT '0',
                net_pnl TEXT NOT NULL DEFAULT '0',
                pnl_pct TEXT NOT NULL DEFAULT '0',
                exit_reason TEXT NOT NULL DEFAULT '',
                trade_mode TEXT NOT NULL DEFAULT 'futures',
                exit_time TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS system_settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS runtime_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS config_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                config_json TEXT NOT NULL,
                win_rate REAL NOT NULL DEFAULT 0,
                pnl_pct REAL NOT NULL DEFAULT 0,
                is_stable INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS rollback_audit (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                snapshot_id INTEGER,
                reason TEXT NOT NULL,
                restored_keys INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS notifications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                message TEXT NOT NULL,
                delivered INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_positions_open
                ON positions(user_id, symbol) WHERE status = 'OPEN';
            CREATE INDEX IF NOT EXISTS idx_signals_user_symbol ON signals(user_id, symbol);
            CREATE INDEX IF NOT EXISTS idx_trades_exit_time ON trades(exit_time);
            CREATE INDEX IF NOT EXISTS idx_snapshots_stable ON config_snapshots(is_stable, created_at);",
        )?;

        debug!("Database schema created/verified");
        Ok(())
    }

    // =========================================================================
    // Users
    // =========================================================================

    pub fn upsert_user(&self, user: &UserAccount) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO users (user_id, mode, trade_mode, deposit, balance, free_deposit)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(user_id) DO UPDATE SET
                mode = excluded.mode,
                trade_mode = excluded.trade_mode,
                deposit = excluded.deposit,
                balance = excluded.balance,
                free_deposit = excluded.free_deposit,
                updated_at = CURRENT_TIMESTAMP",
            params![
                user.user_id,
                user.mode.as_str(),
                user.trade_mode.as_str(),
                decimal_text(user.deposit),
                decimal_text(user.balance),
                decimal_text(user.free_deposit),
            ],
        )?;
        Ok(())
    }

    pub fn get_user(&self, user_id: UserId) -> Result<Option<UserAccount>> {
        let conn = self.conn()?;
        let user = conn
            .query_row(
                "SELECT user_id, mode, trade_mode, deposit, balance, free_deposit
                 FROM users WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok(UserAccount {
                        user_id: row.get(0)?,
                        mode: enum_col(row, 1)?,
                        trade_mode: enum_col(row, 2)?,
                        deposit: decimal_col(row, 3)?,
                        balance: decimal_col(row, 4)?,
                        free_deposit: decimal_col(row, 5)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    /// Unknown users are treated as auto
    pub fn get_user_mode(&self, user_id: UserId) -> Result<UserMode> {
        Ok(self
            .get_user(user_id)?
            .map(|u| u.mode)
            .unwrap_or_default())
    }

    pub fn get_users_by_mode(&self, mode: UserMode) -> Result<Vec<UserId>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT user_id FROM users WHERE mode = ?1 ORDER BY user_id")?;
        let users = stmt
            .query_map(params![mode.as_str()], |row| row.get(0))?
            .collect::<Result<Vec<UserId>, _>>()?;
        Ok(users)
    }

    pub fn all_users(&self) -> Result<Vec<UserId>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT user_id FROM users ORDER BY user_id")?;
        let users = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<UserId>, _>>()?;
        Ok(users)
    }

    /// Mirrors an exchange balance onto the user row
    pub fn update_user_balance(&self, user_id: UserId, balance: &Balance) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE users SET deposit = ?2, balance = ?2, free_deposit = ?3,
                updated_at = CURRENT_TIMESTAMP
             WHERE user_id = ?1",
            params![
                user_id,
                decimal_text(balance.total),
                decimal_text(balance.free)
            ],
        )?;
        Ok(())
    }

    pub fn set_credentials(&self, user_id: UserId, creds: &ExchangeCredentials) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO user_exchange_keys (user_id, api_key, api_secret, passphrase)
             VALUES (?1, ?2, ?3, ?4)",
            params![user_id, creds.api_key, creds.api_secret, creds.passphrase],
        )?;
        Ok(())
    }

    pub fn get_credentials(&self, user_id: UserId) -> Result<Option<ExchangeCredentials>> {
        let conn = self.conn()?;
        let creds = conn
            .query_row(
                "SELECT api_key, api_secret, passphrase FROM user_exchange_keys WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok(ExchangeCredentials {
                        api_key: row.get(0)?,
                        api_secret: row.get(1)?,
                        passphrase: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(creds)
    }

    pub fn users_with_credentials(&self) -> Result<Vec<UserId>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT user_id FROM user_exchange_keys ORDER BY user_id")?;
        let users = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<UserId>, _>>()?;
        Ok(users)
    }

    // =========================================================================
    // Signals
    // =========================================================================

    pub fn insert_signal(&self, signal: &SignalRecord) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO signals
             (user_id, symbol, direction, entry_price, tp1_price, tp2_price, sl_price, signal_token)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                signal.user_id,
                signal.symbol.as_str(),
                signal.direction.as_str(),
                decimal_text(signal.entry_price),
                signal.tp1_price.map(decimal_text),
                signal.tp2_price.map(decimal_text),
                signal.sl_price.map(decimal_text),
                signal.signal_token,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent signal for `(user, symbol)`
    pub fn get_signal(&self, user_id: UserId, symbol: &Symbol) -> Result<Option<SignalRecord>> {
        let conn = self.conn()?;
        let signal = conn
            .query_row(
                "SELECT user_id, symbol, direction, entry_price, tp1_price, tp2_price, sl_price,
                        signal_token
                 FROM signals WHERE user_id = ?1 AND symbol = ?2
                 ORDER BY id DESC LIMIT 1",
                params![user_id, symbol.as_str()],
                |row| {
                    Ok(SignalRecord {
                        user_id: row.get(0)?,
                        symbol: Symbol::new(row.get::<_, String>(1)?),
                        direction: enum_col(row, 2)?,
                        entry_price: decimal_col(row, 3)?,
                        tp1_price: opt_decimal_col(row, 4)?,
                        tp2_price: opt_decimal_col(row, 5)?,
                        sl_price: opt_decimal_col(row, 6)?,
                        signal_token: row.get(7)?,
                    })
                },
            )
            .optional()?;
        Ok(signal)
    }

    // =========================================================================
    // Positions
    // =========================================================================

    /// The OPEN position for `(user, symbol)`, if any
    pub fn get_position(&self, user_id: UserId, symbol: &Symbol) -> Result<Option<PositionRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {POSITION_COLUMNS} FROM positions
             WHERE user_id = ?1 AND symbol = ?2 AND status = 'OPEN'"
        );
        let pos = conn
            .query_row(&sql, params![user_id, symbol.as_str()], position_from_row)
            .optional()?;
        Ok(pos)
    }

    /// Inserts a new OPEN row or updates the existing one in place
    ///
    /// A row whose direction, entry price and quantity already match is left
    /// untouched so repeated passes over an unchanged exchange do not write.
    /// The stored entry time of an existing row is never overwritten.
    pub fn upsert_position(&self, pos: &PositionRecord, now: DateTime<Utc>) -> Result<UpsertOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let sql = format!(
            "SELECT {POSITION_COLUMNS} FROM positions
             WHERE user_id = ?1 AND symbol = ?2 AND status = 'OPEN'"
        );
        let existing = tx
            .query_row(&sql, params![pos.user_id, pos.symbol.as_str()], position_from_row)
            .optional()?;

        let outcome = match existing {
            Some(current)
                if current.direction == pos.direction
                    && current.entry_price == pos.entry_price
                    && current.quantity == pos.quantity =>
            {
                UpsertOutcome::Unchanged
            }
            Some(current) => {
                tx.execute(
                    "UPDATE positions SET direction = ?2, entry_price = ?3, quantity = ?4,
                        updated_at = CURRENT_TIMESTAMP
                     WHERE id = ?1",
                    params![
                        current.id,
                        pos.direction.as_str(),
                        decimal_text(pos.entry_price),
                        decimal_text(pos.quantity),
                    ],
                )?;
                UpsertOutcome::Updated
            }
            None => {
                let entry_time = pos.entry_time.clone().unwrap_or_else(|| format_ts(now));
                tx.execute(
                    "INSERT INTO positions
                     (user_id, symbol, direction, entry_price, quantity, status, entry_time, trade_mode)
                     VALUES (?1, ?2, ?3, ?4, ?5, 'OPEN', ?6, ?7)",
                    params![
                        pos.user_id,
                        pos.symbol.as_str(),
                        pos.direction.as_str(),
                        decimal_text(pos.entry_price),
                        decimal_text(pos.quantity),
                        entry_time,
                        pos.trade_mode.as_str(),
                    ],
                )?;
                UpsertOutcome::Inserted
            }
        };

        tx.commit()?;

        if outcome != UpsertOutcome::Unchanged {
            debug!(
                user = pos.user_id,
                symbol = %pos.symbol,
                "Position {:?}: {} qty={} @ {}",
                outcome, pos.direction, pos.quantity, pos.entry_price
            );
        }
        Ok(outcome)
    }

    /// Marks the OPEN row CLOSED; returns false when nothing was open
    pub fn close_position(&self, user_id: UserId, symbol: &Symbol, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE positions SET status = ?3, closed_at = ?4, updated_at = CURRENT_TIMESTAMP
             WHERE user_id = ?1 AND symbol = ?2 AND status = 'OPEN'",
            params![
                user_id,
                symbol.as_str(),
                PositionStatus::Closed.as_str(),
                format_ts(now)
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn open_positions(&self, user_id: UserId) -> Result<Vec<PositionRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {POSITION_COLUMNS} FROM positions
             WHERE user_id = ?1 AND status = 'OPEN' ORDER BY symbol"
        );
        let mut stmt = conn.prepare(&sql)?;
        let positions = stmt
            .query_map(params![user_id], position_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(positions)
    }

    pub fn get_open_symbols(&self, user_id: UserId) -> Result<HashSet<Symbol>> {
        Ok(self
            .open_positions(user_id)?
            .into_iter()
            .map(|p| p.symbol)
            .collect())
    }

    pub fn open_exposure(&self, user_id: UserId) -> Result<OpenExposure> {
        let positions = self.open_positions(user_id)?;
        let used_capital = positions
            .iter()
            .map(|p| p.entry_price * p.quantity)
            .sum::<Decimal>();
        Ok(OpenExposure {
            count: positions.len(),
            used_capital,
        })
    }

    // =========================================================================
    // Trade ledger
    // =========================================================================

    pub fn record_trade(&self, trade: &TradeRecord) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO trades
             (user_id, symbol, direction, quantity, entry_price, exit_price, fees, net_pnl,
              pnl_pct, exit_reason, trade_mode, exit_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                trade.user_id,
                trade.symbol.as_str(),
                trade.direction.as_str(),
                decimal_text(trade.quantity),
                decimal_text(trade.entry_price),
                decimal_text(trade.exit_price),
                decimal_text(trade.fees),
                decimal_text(trade.net_pnl),
                decimal_text(trade.pnl_pct),
                trade.exit_reason,
                trade.trade_mode.as_str(),
                format_ts(trade.exit_time),
            ],
        )?;
        let id = conn.last_insert_rowid();

        let result = if trade.net_pnl > Decimal::ZERO { "WIN" } else { "LOSS" };
        info!(
            user = trade.user_id,
            symbol = %trade.symbol,
            "Trade recorded: {} {} @ {} -> {} | Net: {} ({}%) | {} | {}",
            trade.direction,
            trade.quantity,
            trade.entry_price,
            trade.exit_price,
            trade.net_pnl.round_dp(4),
            trade.pnl_pct.round_dp(2),
            trade.exit_reason,
            result
        );
        Ok(id)
    }

    /// Sum of realized net PnL, optionally limited to trades exited at or after `since`
    pub fn get_realized_pnl(&self, user_id: UserId, since: Option<DateTime<Utc>>) -> Result<Decimal> {
        let conn = self.conn()?;
        let since = since.map(format_ts).unwrap_or_default();
        let mut stmt = conn.prepare(
            "SELECT net_pnl FROM trades WHERE user_id = ?1 AND exit_time >= ?2",
        )?;
        let total = stmt
            .query_map(params![user_id, since], |row| decimal_col(row, 0))?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .sum();
        Ok(total)
    }

    /// Ledger rows of all users exited at or after `since`, oldest first
    pub fn trades_since(&self, since: DateTime<Utc>) -> Result<Vec<TradeRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {TRADE_COLUMNS} FROM trades WHERE exit_time >= ?1 ORDER BY exit_time, id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let trades = stmt
            .query_map(params![format_ts(since)], trade_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(trades)
    }

    // =========================================================================
    // Configuration and runtime state
    // =========================================================================

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM system_settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO system_settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn all_settings(&self) -> Result<HashMap<String, String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT key, value FROM system_settings")?;
        let settings = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<HashMap<String, String>, _>>()?;
        Ok(settings)
    }

    /// Writes every key of `settings` in one transaction
    pub fn apply_settings(&self, settings: &HashMap<String, String>) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for (key, value) in settings {
            tx.execute(
                "INSERT INTO system_settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                    updated_at = CURRENT_TIMESTAMP",
                params![key, value],
            )?;
        }
        tx.commit()?;
        Ok(settings.len())
    }

    pub fn get_state(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM runtime_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_state(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO runtime_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete_state(&self, key: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM runtime_state WHERE key = ?1", params![key])?;
        Ok(())
    }

    pub fn append_config_snapshot(&self, snapshot: &ConfigSnapshot) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO config_snapshots (config_json, win_rate, pnl_pct, is_stable, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                serde_json::to_string(&snapshot.config)?,
                snapshot.win_rate,
                snapshot.pnl_pct,
                snapshot.is_stable as i64,
                format_ts(snapshot.created_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_latest_stable_snapshot(&self) -> Result<Option<ConfigSnapshot>> {
        let conn = self.conn()?;
        let snapshot = conn
            .query_row(
                "SELECT id, config_json, win_rate, pnl_pct, is_stable, created_at
                 FROM config_snapshots WHERE is_stable = 1
                 ORDER BY created_at DESC, id DESC LIMIT 1",
                [],
                snapshot_from_row,
            )
            .optional()?;
        Ok(snapshot)
    }

    pub fn record_rollback_audit(
        &self,
        snapshot_id: Option<i64>,
        reason: &str,
        restored_keys: usize,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO rollback_audit (snapshot_id, reason, restored_keys, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![snapshot_id, reason, restored_keys as i64, format_ts(at)],
        )?;
        Ok(())
    }

    pub fn rollback_audit_count(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM rollback_audit", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    // =========================================================================
    // Notification outbox
    // =========================================================================

    pub fn enqueue_notification(&self, user_id: UserId, message: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO notifications (user_id, message, created_at) VALUES (?1, ?2, ?3)",
            params![user_id, message, format_ts(at)],
        )?;
        Ok(())
    }

    pub fn pending_notifications(&self, user_id: UserId) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT message FROM notifications WHERE user_id = ?1 AND delivered = 0 ORDER BY id",
        )?;
        let messages = stmt
            .query_map(params![user_id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(messages)
    }

    /// Dumps open positions, settings and the latest stable snapshot as JSON
    pub fn export_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut positions = Vec::new();
        for user_id in self.all_users()? {
            positions.extend(self.open_positions(user_id)?);
        }
        let state = serde_json::json!({
            "exported_at": format_ts(Utc::now()),
            "open_positions": positions,
            "settings": self.all_settings()?,
            "latest_stable_snapshot": self.get_latest_stable_snapshot()?,
        });
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path.as_ref(), serde_json::to_string_pretty(&state)?)?;
        debug!("State exported to: {}", path.as_ref().display());
        Ok(())
    }
}

/// Convenience for tests and seeding: a position that is open now
pub fn open_position(
    user_id: UserId,
    symbol: &str,
    direction: Direction,
    entry_price: Decimal,
    quantity: Decimal,
    entry_time: Option<DateTime<Utc>>,
    trade_mode: TradeMode,
) -> PositionRecord {
    PositionRecord {
        id: None,
        user_id,
        symbol: Symbol::new(symbol),
        direction,
        entry_price,
        quantity,
        status: PositionStatus::Open,
        entry_time: entry_time.map(format_ts),
        trade_mode,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let store = store();
        let now = Utc::now();
        let pos = open_position(1, "BTCUSDT", Direction::Long, dec!(100), dec!(2), None, TradeMode::Futures);

        assert_eq!(store.upsert_position(&pos, now).unwrap(), UpsertOutcome::Inserted);
        assert_eq!(store.upsert_position(&pos, now).unwrap(), UpsertOutcome::Unchanged);

        let mut shrunk = pos.clone();
        shrunk.quantity = dec!(1);
        assert_eq!(store.upsert_position(&shrunk, now).unwrap(), UpsertOutcome::Updated);

        let stored = store.get_position(1, &Symbol::new("BTCUSDT")).unwrap().unwrap();
        assert_eq!(stored.quantity, dec!(1));
        assert!(stored.entry_time_utc().is_some());
    }

    #[test]
    fn test_closed_row_is_kept_and_new_open_row_allowed() {
        let store = store();
        let now = Utc::now();
        let symbol = Symbol::new("ETHUSDT");
        let pos = open_position(7, "ETHUSDT", Direction::Short, dec!(2000), dec!(1), None, TradeMode::Futures);

        store.upsert_position(&pos, now).unwrap();
        assert!(store.close_position(7, &symbol, now).unwrap());
        assert!(!store.close_position(7, &symbol, now).unwrap());
        assert!(store.get_position(7, &symbol).unwrap().is_none());

        assert_eq!(store.upsert_position(&pos, now).unwrap(), UpsertOutcome::Inserted);
        assert_eq!(store.get_open_symbols(7).unwrap().len(), 1);
    }

    #[test]
    fn test_realized_pnl_respects_since() {
        let store = store();
        let now = Utc::now();
        for (offset_h, pnl) in [(30, dec!(-5)), (2, dec!(3)), (1, dec!(-1.5))] {
            store
                .record_trade(&TradeRecord {
                    id: None,
                    user_id: 3,
                    symbol: Symbol::new("SOLUSDT"),
                    direction: Direction::Long,
                    quantity: dec!(1),
                    entry_price: dec!(10),
                    exit_price: dec!(10),
                    fees: Decimal::ZERO,
                    net_pnl: pnl,
                    pnl_pct: pnl,
                    exit_reason: "test".into(),
                    trade_mode: TradeMode::Futures,
                    exit_time: now - Duration::hours(offset_h),
                })
                .unwrap();
        }
        assert_eq!(store.get_realized_pnl(3, None).unwrap(), dec!(-3.5));
        assert_eq!(
            store.get_realized_pnl(3, Some(now - Duration::hours(24))).unwrap(),
            dec!(1.5)
        );
        assert_eq!(store.trades_since(now - Duration::hours(24)).unwrap().len(), 2);
    }

    #[test]
    fn test_latest_stable_snapshot_ignores_unstable_rows() {
        let store = store();
        let now = Utc::now();
        let mut config = HashMap::new();
        config.insert("min_score".to_string(), "70".to_string());

        assert!(store.get_latest_stable_snapshot().unwrap().is_none());

        store
            .append_config_snapshot(&ConfigSnapshot {
                id: None,
                config: config.clone(),
                win_rate: 65.0,
                pnl_pct: 4.0,
                is_stable: true,
                created_at: now - Duration::days(2),
            })
            .unwrap();
        config.insert("min_score".to_string(), "50".to_string());
        store
            .append_config_snapshot(&ConfigSnapshot {
                id: None,
                config,
                win_rate: 20.0,
                pnl_pct: -8.0,
                is_stable: false,
                created_at: now,
            })
            .unwrap();

        let latest = store.get_latest_stable_snapshot().unwrap().unwrap();
        assert_eq!(latest.config.get("min_score").map(String::as_str), Some("70"));
    }

    #[test]
    fn test_user_mode_defaults_to_auto() {
        let store = store();
        assert_eq!(store.get_user_mode(42).unwrap(), UserMode::Auto);
        store
            .upsert_user(&UserAccount {
                user_id: 42,
                mode: UserMode::Manual,
                trade_mode: TradeMode::Futures,
                deposit: dec!(500),
                balance: dec!(500),
                free_deposit: dec!(500),
            })
            .unwrap();
        assert_eq!(store.get_user_mode(42).unwrap(), UserMode::Manual);
        assert_eq!(store.get_users_by_mode(UserMode::Manual).unwrap(), vec![42]);
        assert!(store.get_users_by_mode(UserMode::Auto).unwrap().is_empty());
    }
}
