use endless_types::{Amount, Challenge, ChallengeId, ChallengeStatus, PlayerId, PrizePool, PRIZE_POOL_ID};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::{
    attempts_from, clamp_to_i64, to_i64, to_i64_usize, Admission, ChallengeRow, JoinReceipt,
    LastChallenge, LedgerStore, ListQuery, NewChallenge, PendingResolution, Resolution,
    Settlement, StoreError, CHALLENGE_COLUMNS,
};
use crate::cooldown::Cooldown;
use crate::resolver::Outcome;

/// SQLite-backed ledger.
///
/// Writes use `BEGIN IMMEDIATE`, so the database write lock is held from the
/// cooldown re-check until commit.
pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl SqliteLedger {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        init_schema_sqlite(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        init_schema_sqlite(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<usize, StoreError> {
        Ok(self.lock()?.execute(sql, [])?)
    }
}

fn init_schema_sqlite(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         CREATE TABLE IF NOT EXISTS challenges (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             player_id INTEGER NOT NULL,
             amount_cents INTEGER NOT NULL,
             status INTEGER NOT NULL,
             won INTEGER NOT NULL DEFAULT 0,
             created_at_ms INTEGER NOT NULL,
             probability REAL NOT NULL DEFAULT 0,
             resolved_at_ms INTEGER,
             prize_cents INTEGER
         );
         CREATE INDEX IF NOT EXISTS challenges_player_created
             ON challenges(player_id, created_at_ms);
         CREATE TABLE IF NOT EXISTS prize_pool (
             id INTEGER PRIMARY KEY CHECK (id = 1),
             amount_cents INTEGER NOT NULL CHECK (amount_cents >= 0)
         );
         INSERT OR IGNORE INTO prize_pool (id, amount_cents) VALUES (1, 0);
         CREATE TABLE IF NOT EXISTS pending_resolutions (
             challenge_id INTEGER PRIMARY KEY REFERENCES challenges(id),
             player_id INTEGER NOT NULL,
             probability REAL NOT NULL,
             due_at_ms INTEGER NOT NULL,
             attempts INTEGER NOT NULL DEFAULT 0
         );
         CREATE INDEX IF NOT EXISTS pending_resolutions_due
             ON pending_resolutions(due_at_ms);",
    )?;
    Ok(())
}

fn map_challenge(row: &Row<'_>) -> rusqlite::Result<ChallengeRow> {
    Ok(ChallengeRow {
        id: row.get(0)?,
        player_id: row.get(1)?,
        amount_cents: row.get(2)?,
        status: row.get(3)?,
        won: row.get(4)?,
        created_at_ms: row.get(5)?,
        probability: row.get(6)?,
        resolved_at_ms: row.get(7)?,
        prize_cents: row.get(8)?,
    })
}

fn last_challenge_sqlite(
    conn: &Connection,
    player_id: PlayerId,
) -> Result<Option<LastChallenge>, StoreError> {
    let row = conn
        .query_row(
            "SELECT id, created_at_ms, probability, status FROM challenges
             WHERE player_id = ?1
             ORDER BY created_at_ms DESC, id DESC
             LIMIT 1",
            params![player_id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, i16>(3)?,
                ))
            },
        )
        .optional()?;
    row.map(|(id, created_at_ms, probability, status)| {
        Ok(LastChallenge {
            challenge_id: id,
            created_at: super::to_u64(created_at_ms, "created_at_ms", id)?,
            probability,
            status: super::status_from_code(status, id)?,
        })
    })
    .transpose()
}

impl LedgerStore for SqliteLedger {
    fn last_challenge(&self, player_id: PlayerId) -> Result<Option<LastChallenge>, StoreError> {
        let conn = self.lock()?;
        last_challenge_sqlite(&conn, player_id)
    }

    fn join(&self, entry: &NewChallenge, cooldown: &Cooldown) -> Result<Admission, StoreError> {
        let created_at = to_i64(entry.created_at, "created_at")?;
        let due_at = to_i64(entry.due_at, "due_at")?;
        let status = ChallengeStatus::Joined;

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let last = last_challenge_sqlite(&tx, entry.player_id)?;
        let retry_after_ms = cooldown.remaining(last.as_ref(), entry.created_at);
        if retry_after_ms > 0 {
            return Ok(Admission::TooEarly { retry_after_ms });
        }
        let probability = last
            .as_ref()
            .map(LastChallenge::carried_probability)
            .unwrap_or(0.0);

        tx.execute(
            "INSERT INTO challenges (player_id, amount_cents, status, won, created_at_ms, probability)
             VALUES (?1, ?2, ?3, 0, ?4, ?5)",
            params![
                entry.player_id,
                entry.amount.cents(),
                status.code(),
                created_at,
                probability
            ],
        )?;
        let challenge_id = tx.last_insert_rowid();

        let current: i64 = tx
            .query_row(
                "SELECT amount_cents FROM prize_pool WHERE id = ?1",
                params![PRIZE_POOL_ID],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(StoreError::PoolMissing)?;
        let pool = Amount::from_cents(current)
            .checked_add(entry.amount)
            .ok_or(StoreError::PoolOverflow)?;
        let updated = tx.execute(
            "UPDATE prize_pool SET amount_cents = ?1 WHERE id = ?2",
            params![pool.cents(), PRIZE_POOL_ID],
        )?;
        if updated != 1 {
            return Err(StoreError::PoolMissing);
        }

        tx.execute(
            "INSERT INTO pending_resolutions (challenge_id, player_id, probability, due_at_ms, attempts)
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![challenge_id, entry.player_id, probability, due_at],
        )?;
        tx.commit()?;

        Ok(Admission::Admitted(JoinReceipt {
            challenge_id,
            player_id: entry.player_id,
            status,
            probability,
            created_at: entry.created_at,
            due_at: entry.due_at,
            pool,
        }))
    }

    fn resolve(&self, resolution: &Resolution) -> Result<Settlement, StoreError> {
        let resolved_at = to_i64(resolution.resolved_at, "resolved_at")?;
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let settlement = match resolution.outcome {
            Outcome::Won => {
                let prize: i64 = tx
                    .query_row(
                        "SELECT amount_cents FROM prize_pool WHERE id = ?1",
                        params![PRIZE_POOL_ID],
                        |row| row.get(0),
                    )
                    .optional()?
                    .ok_or(StoreError::PoolMissing)?;
                let updated = tx.execute(
                    "UPDATE challenges
                     SET status = ?1, won = 1, probability = 0, prize_cents = ?2, resolved_at_ms = ?3
                     WHERE id = ?4 AND player_id = ?5 AND resolved_at_ms IS NULL",
                    params![
                        ChallengeStatus::Won.code(),
                        prize,
                        resolved_at,
                        resolution.challenge_id,
                        resolution.player_id
                    ],
                )?;
                if updated == 1 {
                    tx.execute(
                        "UPDATE prize_pool SET amount_cents = 0 WHERE id = ?1",
                        params![PRIZE_POOL_ID],
                    )?;
                    Some(Settlement::Won {
                        prize: Amount::from_cents(prize),
                    })
                } else {
                    None
                }
            }
            Outcome::Lost { probability } => {
                let updated = tx.execute(
                    "UPDATE challenges
                     SET status = ?1, won = 0, probability = ?2, resolved_at_ms = ?3
                     WHERE id = ?4 AND player_id = ?5 AND resolved_at_ms IS NULL",
                    params![
                        ChallengeStatus::Lost.code(),
                        probability,
                        resolved_at,
                        resolution.challenge_id,
                        resolution.player_id
                    ],
                )?;
                (updated == 1).then_some(Settlement::Lost { probability })
            }
        };

        let settlement = match settlement {
            Some(settlement) => settlement,
            None => {
                let exists = tx
                    .query_row(
                        "SELECT 1 FROM challenges WHERE id = ?1 AND player_id = ?2",
                        params![resolution.challenge_id, resolution.player_id],
                        |_| Ok(()),
                    )
                    .optional()?;
                if exists.is_some() {
                    Settlement::AlreadyResolved
                } else {
                    Settlement::Missing
                }
            }
        };

        tx.execute(
            "DELETE FROM pending_resolutions WHERE challenge_id = ?1",
            params![resolution.challenge_id],
        )?;
        tx.commit()?;
        Ok(settlement)
    }

    fn due_resolutions(
        &self,
        due_before: u64,
        max_attempts: u32,
        limit: Option<usize>,
    ) -> Result<Vec<PendingResolution>, StoreError> {
        let due_before = clamp_to_i64(due_before);
        let limit = match limit {
            Some(limit) => to_i64_usize(limit, "limit")?,
            None => -1,
        };
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT challenge_id, player_id, probability, due_at_ms, attempts
             FROM pending_resolutions
             WHERE due_at_ms <= ?1 AND attempts < ?2
             ORDER BY due_at_ms ASC, challenge_id ASC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![due_before, max_attempts, limit], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;

        let mut jobs = Vec::new();
        for row in rows {
            let (challenge_id, player_id, probability, due_at_ms, attempts) = row?;
            jobs.push(PendingResolution {
                challenge_id,
                player_id,
                probability,
                due_at: super::to_u64(due_at_ms, "due_at_ms", challenge_id)?,
                attempts: attempts_from(attempts, challenge_id)?,
            });
        }
        Ok(jobs)
    }

    fn defer_resolution(
        &self,
        challenge_id: ChallengeId,
        due_at: u64,
        attempts: u32,
    ) -> Result<(), StoreError> {
        let due_at = to_i64(due_at, "due_at")?;
        let conn = self.lock()?;
        conn.execute(
            "UPDATE pending_resolutions SET due_at_ms = ?1, attempts = ?2 WHERE challenge_id = ?3",
            params![due_at, attempts, challenge_id],
        )?;
        Ok(())
    }

    fn challenge(&self, id: ChallengeId) -> Result<Option<Challenge>, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {CHALLENGE_COLUMNS} FROM challenges WHERE id = ?1"),
                params![id],
                map_challenge,
            )
            .optional()?;
        row.map(ChallengeRow::into_challenge).transpose()
    }

    fn list_challenges(&self, query: &ListQuery) -> Result<Vec<Challenge>, StoreError> {
        let limit = to_i64_usize(query.limit, "limit")?;
        let conn = self.lock()?;
        let rows = match query.player_id {
            Some(player_id) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {CHALLENGE_COLUMNS} FROM challenges
                     WHERE player_id = ?1 ORDER BY id DESC LIMIT ?2"
                ))?;
                let rows = stmt
                    .query_map(params![player_id, limit], map_challenge)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {CHALLENGE_COLUMNS} FROM challenges ORDER BY id DESC LIMIT ?1"
                ))?;
                let rows = stmt
                    .query_map(params![limit], map_challenge)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };
        rows.into_iter().map(ChallengeRow::into_challenge).collect()
    }

    fn prize_pool(&self) -> Result<PrizePool, StoreError> {
        let conn = self.lock()?;
        let cents: i64 = conn
            .query_row(
                "SELECT amount_cents FROM prize_pool WHERE id = ?1",
                params![PRIZE_POOL_ID],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(StoreError::PoolMissing)?;
        Ok(PrizePool::new(Amount::from_cents(cents)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use endless_types::STAKE;
    use proptest::prelude::*;

    const T0: u64 = 1_700_000_000_000;
    const DELAY: u64 = 30_000;

    fn cooldown() -> Cooldown {
        Cooldown::new(60_000)
    }

    fn entry(player_id: PlayerId, created_at: u64) -> NewChallenge {
        NewChallenge {
            player_id,
            amount: STAKE,
            created_at,
            due_at: created_at + DELAY,
        }
    }

    fn admit(ledger: &SqliteLedger, player_id: PlayerId, created_at: u64) -> JoinReceipt {
        match ledger.join(&entry(player_id, created_at), &cooldown()).unwrap() {
            Admission::Admitted(receipt) => receipt,
            other => panic!("expected admission, got {other:?}"),
        }
    }

    fn count(ledger: &SqliteLedger, table: &str) -> i64 {
        let conn = ledger.lock().unwrap();
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn schema_seeds_empty_pool() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        assert_eq!(ledger.prize_pool().unwrap(), PrizePool::new(Amount::ZERO));
        assert_eq!(ledger.last_challenge(1001).unwrap(), None);
    }

    #[test]
    fn join_records_challenge_pool_and_job() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let receipt = admit(&ledger, 1001, T0);

        assert_eq!(receipt.status, ChallengeStatus::Joined);
        assert_eq!(receipt.probability, 0.0);
        assert_eq!(receipt.pool, STAKE);
        assert_eq!(ledger.prize_pool().unwrap().amount, STAKE);

        let challenge = ledger.challenge(receipt.challenge_id).unwrap().unwrap();
        assert_eq!(challenge.player_id, 1001);
        assert_eq!(challenge.amount, STAKE);
        assert_eq!(challenge.status, ChallengeStatus::Joined);
        assert!(!challenge.won);
        assert_eq!(challenge.created_at, T0);
        assert_eq!(challenge.resolved_at, None);

        let jobs = ledger.due_resolutions(T0 + DELAY, 5, None).unwrap();
        assert_eq!(jobs, vec![receipt.pending()]);
        assert!(ledger.due_resolutions(T0 + DELAY - 1, 5, None).unwrap().is_empty());
    }

    #[test]
    fn join_inside_cooldown_changes_nothing() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        admit(&ledger, 1001, T0);

        let admission = ledger.join(&entry(1001, T0 + 10_000), &cooldown()).unwrap();
        assert_eq!(admission, Admission::TooEarly { retry_after_ms: 50_000 });
        assert_eq!(ledger.prize_pool().unwrap().amount, STAKE);
        assert_eq!(count(&ledger, "challenges"), 1);
        assert_eq!(count(&ledger, "pending_resolutions"), 1);
    }

    #[test]
    fn failed_pool_update_leaves_no_orphan_challenge() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        ledger.execute_raw("DELETE FROM prize_pool").unwrap();

        let err = ledger.join(&entry(1001, T0), &cooldown()).unwrap_err();
        assert!(matches!(err, StoreError::PoolMissing), "unexpected error: {err}");
        assert_eq!(count(&ledger, "challenges"), 0);
        assert_eq!(count(&ledger, "pending_resolutions"), 0);
    }

    #[test]
    fn win_pays_out_and_resets_pool() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let first = admit(&ledger, 1001, T0);
        admit(&ledger, 1002, T0 + 1);

        let settlement = ledger
            .resolve(&Resolution {
                challenge_id: first.challenge_id,
                player_id: 1001,
                outcome: Outcome::Won,
                resolved_at: T0 + DELAY,
            })
            .unwrap();
        assert_eq!(
            settlement,
            Settlement::Won {
                prize: Amount::from_cents(2 * STAKE.cents())
            }
        );
        assert_eq!(ledger.prize_pool().unwrap().amount, Amount::ZERO);

        let challenge = ledger.challenge(first.challenge_id).unwrap().unwrap();
        assert!(challenge.won);
        assert_eq!(challenge.status, ChallengeStatus::Won);
        assert_eq!(challenge.probability, 0.0);
        assert_eq!(challenge.prize, Some(Amount::from_cents(4_002)));
        assert_eq!(challenge.resolved_at, Some(T0 + DELAY));

        let jobs = ledger.due_resolutions(u64::MAX, 5, None).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].player_id, 1002);
    }

    #[test]
    fn second_resolution_is_a_no_op() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let receipt = admit(&ledger, 1001, T0);
        let lost = Resolution {
            challenge_id: receipt.challenge_id,
            player_id: 1001,
            outcome: Outcome::Lost { probability: 0.01 },
            resolved_at: T0 + DELAY,
        };
        assert_eq!(
            ledger.resolve(&lost).unwrap(),
            Settlement::Lost { probability: 0.01 }
        );

        let won = Resolution {
            outcome: Outcome::Won,
            ..lost
        };
        assert_eq!(ledger.resolve(&won).unwrap(), Settlement::AlreadyResolved);
        assert_eq!(ledger.prize_pool().unwrap().amount, STAKE);
        let challenge = ledger.challenge(receipt.challenge_id).unwrap().unwrap();
        assert_eq!(challenge.status, ChallengeStatus::Lost);
        assert!(!challenge.won);
    }

    #[test]
    fn resolving_unknown_challenge_reports_missing() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let receipt = admit(&ledger, 1001, T0);
        let settlement = ledger
            .resolve(&Resolution {
                challenge_id: receipt.challenge_id,
                player_id: 9999,
                outcome: Outcome::Won,
                resolved_at: T0 + DELAY,
            })
            .unwrap();
        assert_eq!(settlement, Settlement::Missing);
        assert_eq!(ledger.prize_pool().unwrap().amount, STAKE);
    }

    #[test]
    fn lost_probability_carries_into_next_join() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let first = admit(&ledger, 1001, T0);
        ledger
            .resolve(&Resolution {
                challenge_id: first.challenge_id,
                player_id: 1001,
                outcome: Outcome::Lost { probability: 0.01 },
                resolved_at: T0 + DELAY,
            })
            .unwrap();

        let second = admit(&ledger, 1001, T0 + 61_000);
        assert_eq!(second.probability, 0.01);
        let last = ledger.last_challenge(1001).unwrap().unwrap();
        assert_eq!(last.challenge_id, second.challenge_id);
        assert_eq!(last.status, ChallengeStatus::Joined);
    }

    #[test]
    fn deferred_jobs_respect_due_time_and_attempts() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let receipt = admit(&ledger, 1001, T0);

        ledger
            .defer_resolution(receipt.challenge_id, T0 + 90_000, 2)
            .unwrap();
        assert!(ledger.due_resolutions(T0 + 89_999, 5, None).unwrap().is_empty());
        let jobs = ledger.due_resolutions(T0 + 90_000, 5, None).unwrap();
        assert_eq!(jobs[0].attempts, 2);
        assert!(ledger.due_resolutions(T0 + 90_000, 2, None).unwrap().is_empty());
    }

    #[test]
    fn list_is_newest_first_and_filters_by_player() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let a = admit(&ledger, 1, T0);
        let b = admit(&ledger, 2, T0 + 1);
        let c = admit(&ledger, 1, T0 + 70_000);

        let all = ledger
            .list_challenges(&ListQuery {
                limit: 10,
                player_id: None,
            })
            .unwrap();
        let ids: Vec<_> = all.iter().map(|challenge| challenge.id).collect();
        assert_eq!(ids, vec![c.challenge_id, b.challenge_id, a.challenge_id]);

        let mine = ledger
            .list_challenges(&ListQuery {
                limit: 1,
                player_id: Some(1),
            })
            .unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id, c.challenge_id);
    }

    #[test]
    fn pending_jobs_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let receipt = {
            let ledger = SqliteLedger::open(&path).unwrap();
            admit(&ledger, 1001, T0)
        };

        let ledger = SqliteLedger::open(&path).unwrap();
        assert_eq!(
            ledger.due_resolutions(u64::MAX, 5, None).unwrap(),
            vec![receipt.pending()]
        );
        assert_eq!(ledger.prize_pool().unwrap().amount, STAKE);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn pool_grows_by_every_stake(players in 1usize..40) {
            let ledger = SqliteLedger::open_in_memory().unwrap();
            let before = ledger.prize_pool().unwrap().amount;
            for player in 0..players {
                admit(&ledger, player as PlayerId + 1, T0);
            }
            let after = ledger.prize_pool().unwrap().amount;
            prop_assert_eq!(after.cents() - before.cents(), players as i64 * STAKE.cents());
        }
    }
}
