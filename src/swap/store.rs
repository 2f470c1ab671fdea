use std::path::{Path, PathBuf};
use std::str::FromStr as _;
use std::time::Duration;

use anyhow::{Context as _, Result};
use bitcoin::secp256k1::SecretKey;
use rusqlite::{Connection, OptionalExtension as _, Row, Transaction, params};

use super::{LegSide, Pair, SwapLeg, SwapRecord, SwapState, SwapType};
use crate::network::Currency;

/// Schema steps, applied in order from the stored `user_version` up to the latest.
const MIGRATIONS: &[&str] = &[
    r#"
CREATE TABLE swaps (
  id TEXT PRIMARY KEY,
  swap_type TEXT NOT NULL,
  from_currency TEXT NOT NULL,
  to_currency TEXT NOT NULL,
  state TEXT NOT NULL,
  error TEXT,
  status TEXT NOT NULL,
  private_key TEXT NOT NULL,
  preimage TEXT,
  preimage_hash TEXT NOT NULL,
  invoice TEXT,
  accept_zero_conf INTEGER NOT NULL,
  service_fee_percent REAL NOT NULL,
  service_fee INTEGER,
  onchain_fee INTEGER,
  created_at INTEGER NOT NULL
);
CREATE INDEX swaps_state_idx ON swaps(state);
"#,
    r#"
CREATE TABLE swap_legs (
  swap_id TEXT NOT NULL REFERENCES swaps(id) ON DELETE CASCADE,
  side TEXT NOT NULL,
  currency TEXT NOT NULL,
  lockup_address TEXT NOT NULL,
  blinding_key TEXT,
  tree TEXT NOT NULL,
  timeout_block_height INTEGER NOT NULL,
  expected_amount INTEGER NOT NULL,
  lockup_txid TEXT,
  settlement_txid TEXT,
  destination TEXT,
  PRIMARY KEY (swap_id, side)
);
CREATE INDEX swap_legs_timeout_idx ON swap_legs(currency, timeout_block_height);
"#,
    "ALTER TABLE swaps ADD COLUMN external_pay INTEGER NOT NULL DEFAULT 0;",
];

const SWAP_COLUMNS: &str = "id, swap_type, from_currency, to_currency, state, error, status, \
     private_key, preimage, preimage_hash, invoice, accept_zero_conf, service_fee_percent, \
     service_fee, onchain_fee, created_at, external_pay";

const NON_FINAL_STATES: &str = "('pending', 'server_error', 'error')";

#[derive(Debug)]
pub struct SqliteSwapStore {
    conn: Connection,
    path: PathBuf,
}

impl SqliteSwapStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create swap store dir {}", dir.display()))?;
        }

        let mut conn =
            Connection::open(&path).with_context(|| format!("open sqlite {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("set sqlite busy_timeout")?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
            .context("configure sqlite pragmas")?;

        migrate(&mut conn).context("migrate sqlite schema")?;

        Ok(Self { conn, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema_version(&self) -> Result<usize> {
        schema_version(&self.conn)
    }

    pub fn insert_swap(&mut self, record: &SwapRecord) -> Result<()> {
        let tx = self.conn.transaction().context("begin insert swap")?;
        tx.execute(
            &format!(
                "INSERT INTO swaps ({SWAP_COLUMNS}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
            ),
            params![
                &record.id,
                swap_type_to_str(record.swap_type),
                record.pair.from.to_string(),
                record.pair.to.to_string(),
                record.state.as_str(),
                &record.error,
                &record.status,
                hex::encode(record.private_key.secret_bytes()),
                record.preimage.map(hex::encode),
                hex::encode(record.preimage_hash),
                &record.invoice,
                record.accept_zero_conf,
                record.service_fee_percent,
                record.service_fee.map(to_sql_u64).transpose()?,
                record.onchain_fee.map(to_sql_u64).transpose()?,
                record.created_at,
                record.external_pay,
            ],
        )
        .with_context(|| format!("insert swap {}", record.id))?;

        for (side, leg) in [(LegSide::From, &record.from), (LegSide::To, &record.to)] {
            if let Some(leg) = leg {
                insert_leg(&tx, &record.id, side, leg)?;
            }
        }

        tx.commit().context("commit insert swap")
    }

    pub fn get_swap(&self, swap_id: &str) -> Result<Option<SwapRecord>> {
        let record = self
            .conn
            .query_row(
                &format!("SELECT {SWAP_COLUMNS} FROM swaps WHERE id = ?1"),
                params![swap_id],
                swap_from_row,
            )
            .optional()
            .with_context(|| format!("get swap {swap_id}"))?;

        match record {
            Some(record) => Ok(Some(self.with_legs(record)?)),
            None => Ok(None),
        }
    }

    pub fn list_swaps(&self) -> Result<Vec<SwapRecord>> {
        self.query_swaps(&format!("SELECT {SWAP_COLUMNS} FROM swaps ORDER BY created_at, id"), params![])
    }

    pub fn query_by_states(&self, states: &[SwapState]) -> Result<Vec<SwapRecord>> {
        Ok(self
            .list_swaps()?
            .into_iter()
            .filter(|swap| states.contains(&swap.state))
            .collect())
    }

    pub fn query_pending(&self) -> Result<Vec<SwapRecord>> {
        self.query_by_states(&[SwapState::Pending])
    }

    /// Swaps whose own lockup on `currency` has timed out at `height` and is not settled.
    pub fn query_refundable(&self, currency: Currency, height: u32) -> Result<Vec<SwapRecord>> {
        self.query_swaps(
            &format!(
                "SELECT s.{} FROM swaps s JOIN swap_legs l ON l.swap_id = s.id \
                 WHERE l.side = 'from' AND l.currency = ?1 AND l.timeout_block_height <= ?2 \
                 AND l.lockup_txid IS NOT NULL AND l.settlement_txid IS NULL \
                 AND s.state IN {NON_FINAL_STATES} ORDER BY s.created_at, s.id",
                SWAP_COLUMNS.replace(", ", ", s.")
            ),
            params![currency.to_string(), height],
        )
    }

    /// Swaps whose server lockup on `currency` is known and not yet claimed.
    ///
    /// A reverse swap turns successful once its invoice settles, which can happen before the
    /// claim is broadcast, so the swap state only excludes chain swaps we refunded instead.
    pub fn query_claimable(&self, currency: Currency) -> Result<Vec<SwapRecord>> {
        self.query_swaps(
            &format!(
                "SELECT s.{} FROM swaps s JOIN swap_legs l ON l.swap_id = s.id \
                 WHERE l.side = 'to' AND l.currency = ?1 \
                 AND l.lockup_txid IS NOT NULL AND l.settlement_txid IS NULL \
                 AND (s.swap_type != 'chain' OR s.state != 'refunded') \
                 ORDER BY s.created_at, s.id",
                SWAP_COLUMNS.replace(", ", ", s.")
            ),
            params![currency.to_string()],
        )
    }

    /// Applies `state` if the transition table allows it. Returns whether anything changed.
    pub fn update_state(
        &mut self,
        swap_id: &str,
        state: SwapState,
        error: Option<&str>,
    ) -> Result<bool> {
        let tx = self.conn.transaction().context("begin update state")?;
        let current: String = tx
            .query_row(
                "SELECT state FROM swaps WHERE id = ?1",
                params![swap_id],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("read swap state {swap_id}"))?
            .with_context(|| format!("swap not found: {swap_id}"))?;
        let current = SwapState::parse(&current)
            .with_context(|| format!("unknown stored swap state: {current}"))?;

        if !current.can_transition_to(state) {
            return Ok(false);
        }

        tx.execute(
            "UPDATE swaps SET state = ?2, error = ?3 WHERE id = ?1",
            params![swap_id, state.as_str(), error],
        )
        .with_context(|| format!("update swap state {swap_id}"))?;
        tx.commit().context("commit update state")?;
        Ok(true)
    }

    pub fn update_status(&mut self, swap_id: &str, status: &str) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE swaps SET status = ?2 WHERE id = ?1",
                params![swap_id, status],
            )
            .with_context(|| format!("update swap status {swap_id}"))?;
        anyhow::ensure!(rows == 1, "swap not found: {swap_id}");
        Ok(())
    }

    pub fn set_invoice(&mut self, swap_id: &str, invoice: &str) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE swaps SET invoice = ?2 WHERE id = ?1",
                params![swap_id, invoice],
            )
            .with_context(|| format!("set invoice {swap_id}"))?;
        anyhow::ensure!(rows == 1, "swap not found: {swap_id}");
        Ok(())
    }

    /// Replaces the amount a leg is expected to carry, after a renegotiated quote.
    pub fn set_expected_amount(&mut self, swap_id: &str, side: LegSide, amount: u64) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE swap_legs SET expected_amount = ?3 WHERE swap_id = ?1 AND side = ?2",
                params![swap_id, side.as_str(), to_sql_u64(amount)?],
            )
            .with_context(|| format!("set expected amount {swap_id}"))?;
        anyhow::ensure!(rows == 1, "{} leg of swap {swap_id} not found", side.as_str());
        Ok(())
    }

    /// Records the lockup transaction of a leg. A lockup id that is already set is kept.
    pub fn set_lockup_txid(&mut self, swap_id: &str, side: LegSide, txid: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "UPDATE swap_legs SET lockup_txid = ?3 \
                 WHERE swap_id = ?1 AND side = ?2 AND lockup_txid IS NULL",
                params![swap_id, side.as_str(), txid],
            )
            .with_context(|| format!("set lockup txid {swap_id}"))?;
        Ok(rows == 1)
    }

    /// Records the settlement of a leg and adds its fee to the swap's onchain fee.
    ///
    /// The settlement id is written at most once; later calls change nothing and return
    /// `false`, so replays never account a fee twice.
    pub fn set_settlement(
        &mut self,
        swap_id: &str,
        side: LegSide,
        txid: &str,
        fee: u64,
    ) -> Result<bool> {
        let tx = self.conn.transaction().context("begin set settlement")?;
        let rows = tx
            .execute(
                "UPDATE swap_legs SET settlement_txid = ?3 \
                 WHERE swap_id = ?1 AND side = ?2 AND settlement_txid IS NULL",
                params![swap_id, side.as_str(), txid],
            )
            .with_context(|| format!("set settlement txid {swap_id}"))?;
        if rows == 0 {
            return Ok(false);
        }

        tx.execute(
            "UPDATE swaps SET onchain_fee = COALESCE(onchain_fee, 0) + ?2 WHERE id = ?1",
            params![swap_id, to_sql_u64(fee)?],
        )
        .with_context(|| format!("add settlement fee {swap_id}"))?;
        tx.commit().context("commit set settlement")?;
        Ok(true)
    }

    /// Sets the service fee and adds the server's onchain fee share, once per swap.
    pub fn set_completion_fees(
        &mut self,
        swap_id: &str,
        service_fee: u64,
        onchain_fee: u64,
    ) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "UPDATE swaps SET service_fee = ?2, onchain_fee = COALESCE(onchain_fee, 0) + ?3 \
                 WHERE id = ?1 AND service_fee IS NULL",
                params![swap_id, to_sql_u64(service_fee)?, to_sql_u64(onchain_fee)?],
            )
            .with_context(|| format!("set completion fees {swap_id}"))?;
        Ok(rows == 1)
    }

    fn query_swaps<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<SwapRecord>> {
        let mut stmt = self.conn.prepare(sql).context("prepare query swaps")?;
        let rows = stmt
            .query_map(params, swap_from_row)
            .context("query swaps")?;

        let mut out = Vec::new();
        for row in rows {
            let record = row.context("read swap row")?;
            out.push(self.with_legs(record)?);
        }
        Ok(out)
    }

    fn with_legs(&self, mut record: SwapRecord) -> Result<SwapRecord> {
        let mut stmt = self
            .conn
            .prepare(
                r#"
SELECT
  side,
  currency,
  lockup_address,
  blinding_key,
  tree,
  timeout_block_height,
  expected_amount,
  lockup_txid,
  settlement_txid,
  destination
FROM swap_legs
WHERE swap_id = ?1
"#,
            )
            .context("prepare load legs")?;
        let rows = stmt
            .query_map(params![&record.id], leg_from_row)
            .with_context(|| format!("load legs of {}", record.id))?;

        for row in rows {
            let (side, leg) = row.context("read leg row")?;
            match side {
                LegSide::From => record.from = Some(leg),
                LegSide::To => record.to = Some(leg),
            }
        }
        Ok(record)
    }
}

fn migrate(conn: &mut Connection) -> Result<()> {
    let current = schema_version(conn)?;
    anyhow::ensure!(
        current <= MIGRATIONS.len(),
        "database schema version {current} is newer than supported {}",
        MIGRATIONS.len()
    );

    for (index, step) in MIGRATIONS.iter().enumerate().skip(current) {
        let version = index + 1;
        let tx = conn.transaction().context("begin migration")?;
        tx.execute_batch(step)
            .with_context(|| format!("apply migration {version}"))?;
        tx.pragma_update(None, "user_version", version as i64)
            .with_context(|| format!("record schema version {version}"))?;
        tx.commit()
            .with_context(|| format!("commit migration {version}"))?;
        tracing::info!(version, "applied swap store migration");
    }
    Ok(())
}

fn schema_version(conn: &Connection) -> Result<usize> {
    let version: i64 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .context("read schema version")?;
    usize::try_from(version).with_context(|| format!("invalid schema version {version}"))
}

fn insert_leg(tx: &Transaction<'_>, swap_id: &str, side: LegSide, leg: &SwapLeg) -> Result<()> {
    let tree = serde_json::to_string(&leg.tree).context("encode swap tree")?;
    tx.execute(
        r#"
INSERT INTO swap_legs (
  swap_id,
  side,
  currency,
  lockup_address,
  blinding_key,
  tree,
  timeout_block_height,
  expected_amount,
  lockup_txid,
  settlement_txid,
  destination
) VALUES (
  ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11
)
"#,
        params![
            swap_id,
            side.as_str(),
            leg.currency.to_string(),
            &leg.lockup_address,
            leg.blinding_key.map(|key| hex::encode(key.secret_bytes())),
            tree,
            leg.timeout_block_height,
            to_sql_u64(leg.expected_amount)?,
            &leg.lockup_txid,
            &leg.settlement_txid,
            &leg.destination,
        ],
    )
    .with_context(|| format!("insert {} leg of {swap_id}", side.as_str()))?;
    Ok(())
}

fn swap_from_row(row: &Row<'_>) -> rusqlite::Result<SwapRecord> {
    let swap_type: String = row.get(1)?;
    let from: String = row.get(2)?;
    let to: String = row.get(3)?;
    let state: String = row.get(4)?;
    let private_key: String = row.get(7)?;
    let preimage: Option<String> = row.get(8)?;
    let preimage_hash: String = row.get(9)?;
    let service_fee: Option<i64> = row.get(13)?;
    let onchain_fee: Option<i64> = row.get(14)?;

    Ok(SwapRecord {
        id: row.get(0)?,
        swap_type: swap_type_from_str(&swap_type, 1)?,
        pair: Pair {
            from: currency_from_str(&from, 2)?,
            to: currency_from_str(&to, 3)?,
        },
        state: SwapState::parse(&state)
            .ok_or_else(|| conversion_error(4, format!("unknown swap state: {state}")))?,
        error: row.get(5)?,
        status: row.get(6)?,
        private_key: secret_key_from_hex(&private_key, 7)?,
        preimage: preimage
            .map(|preimage| bytes32_from_hex(&preimage, 8))
            .transpose()?,
        preimage_hash: bytes32_from_hex(&preimage_hash, 9)?,
        invoice: row.get(10)?,
        accept_zero_conf: row.get(11)?,
        external_pay: row.get(16)?,
        service_fee_percent: row.get(12)?,
        from: None,
        to: None,
        service_fee: service_fee.map(|v| from_sql_u64(v, 13)).transpose()?,
        onchain_fee: onchain_fee.map(|v| from_sql_u64(v, 14)).transpose()?,
        created_at: row.get(15)?,
    })
}

fn leg_from_row(row: &Row<'_>) -> rusqlite::Result<(LegSide, SwapLeg)> {
    let side: String = row.get(0)?;
    let side = match side.as_str() {
        "from" => LegSide::From,
        "to" => LegSide::To,
        other => return Err(conversion_error(0, format!("unknown leg side: {other}"))),
    };
    let currency: String = row.get(1)?;
    let blinding_key: Option<String> = row.get(3)?;
    let tree: String = row.get(4)?;
    let expected_amount: i64 = row.get(6)?;

    Ok((
        side,
        SwapLeg {
            currency: currency_from_str(&currency, 1)?,
            lockup_address: row.get(2)?,
            blinding_key: blinding_key
                .map(|key| secret_key_from_hex(&key, 3))
                .transpose()?,
            tree: serde_json::from_str(&tree)
                .map_err(|e| conversion_error(4, format!("invalid swap tree: {e}")))?,
            timeout_block_height: row.get(5)?,
            expected_amount: from_sql_u64(expected_amount, 6)?,
            lockup_txid: row.get(7)?,
            settlement_txid: row.get(8)?,
            destination: row.get(9)?,
        },
    ))
}

fn to_sql_u64(value: u64) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("amount {value} does not fit sqlite integer"))
}

fn from_sql_u64(value: i64, col: usize) -> rusqlite::Result<u64> {
    u64::try_from(value).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            col,
            rusqlite::types::Type::Integer,
            format!("invalid amount {value}").into(),
        )
    })
}

fn conversion_error(col: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, message.into())
}

fn secret_key_from_hex(s: &str, col: usize) -> rusqlite::Result<SecretKey> {
    SecretKey::from_str(s).map_err(|e| conversion_error(col, format!("invalid secret key: {e}")))
}

fn bytes32_from_hex(s: &str, col: usize) -> rusqlite::Result<[u8; 32]> {
    hex::decode(s)
        .ok()
        .and_then(|bytes| <[u8; 32]>::try_from(bytes).ok())
        .ok_or_else(|| conversion_error(col, format!("expected 32 hex bytes, got {s}")))
}

fn currency_from_str(s: &str, col: usize) -> rusqlite::Result<Currency> {
    Currency::from_str(s).map_err(|e| conversion_error(col, format!("{e}")))
}

fn swap_type_to_str(swap_type: SwapType) -> &'static str {
    match swap_type {
        SwapType::Submarine => "submarine",
        SwapType::Reverse => "reverse",
        SwapType::Chain => "chain",
    }
}

fn swap_type_from_str(s: &str, col: usize) -> rusqlite::Result<SwapType> {
    match s {
        "submarine" => Ok(SwapType::Submarine),
        "reverse" => Ok(SwapType::Reverse),
        "chain" => Ok(SwapType::Chain),
        other => Err(conversion_error(col, format!("unknown swap type: {other}"))),
    }
}
