use endless_types::{Amount, Challenge, ChallengeId, ChallengeStatus, PlayerId, PrizePool, PRIZE_POOL_ID};
use postgres::{Client, GenericClient, NoTls, Row};
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};
use url::Url;

use super::{
    attempts_from, clamp_to_i64, to_i64, to_i64_usize, Admission, ChallengeRow, JoinReceipt,
    LastChallenge, LedgerStore, ListQuery, NewChallenge, PendingResolution, Resolution,
    Settlement, StoreError, CHALLENGE_COLUMNS,
};
use crate::cooldown::Cooldown;
use crate::resolver::Outcome;

/// Postgres-backed ledger.
///
/// Joins and wins both take `FOR UPDATE` on the singleton pool row first, so
/// they serialize on it.
///
/// The client drives its own runtime; only call this from blocking threads.
pub struct PostgresLedger {
    client: Mutex<Option<Client>>,
}

impl PostgresLedger {
    pub fn connect(url: &str) -> Result<Self, StoreError> {
        validate_postgres_url(url)?;
        let mut client = Client::connect(url, NoTls)?;
        init_schema_postgres(&mut client)?;
        Ok(Self {
            client: Mutex::new(Some(client)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<Client>>, StoreError> {
        self.client.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl Drop for PostgresLedger {
    fn drop(&mut self) {
        let client = match self.client.get_mut() {
            Ok(client) => client.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        // The client owns a runtime, which cannot be dropped on an async worker.
        if let Some(client) = client {
            if tokio::runtime::Handle::try_current().is_ok() {
                std::thread::spawn(move || drop(client));
            }
        }
    }
}

fn validate_postgres_url(url: &str) -> Result<(), StoreError> {
    if env_flag("LEDGER_ALLOW_PUBLIC_POSTGRES") {
        return Ok(());
    }

    let parsed = Url::parse(url).map_err(|err| StoreError::InvalidUrl(err.to_string()))?;
    let scheme = parsed.scheme();
    if scheme != "postgres" && scheme != "postgresql" {
        return Err(StoreError::InvalidUrl(
            "postgres url must start with postgres:// or postgresql://".to_string(),
        ));
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| StoreError::InvalidUrl("postgres url missing host".to_string()))?;
    if host.eq_ignore_ascii_case("localhost") {
        return Ok(());
    }

    let host = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_private_ip(ip) {
            return Ok(());
        }
        return Err(StoreError::InvalidUrl(
            "postgres host is public; set LEDGER_ALLOW_PUBLIC_POSTGRES=1 to override".to_string(),
        ));
    }

    if env_flag("LEDGER_ALLOW_POSTGRES_HOSTNAME") {
        return Ok(());
    }

    Err(StoreError::InvalidUrl(
        "postgres host must be a private IP; set LEDGER_ALLOW_POSTGRES_HOSTNAME=1 to allow hostnames"
            .to_string(),
    ))
}

fn env_flag(var: &str) -> bool {
    matches!(
        std::env::var(var).as_deref(),
        Ok("1") | Ok("true") | Ok("TRUE") | Ok("yes") | Ok("YES")
    )
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unique_local() || v6.is_unicast_link_local(),
    }
}

fn init_schema_postgres(client: &mut Client) -> Result<(), StoreError> {
    client.batch_execute(
        "CREATE TABLE IF NOT EXISTS challenges (
             id BIGSERIAL PRIMARY KEY,
             player_id BIGINT NOT NULL,
             amount_cents BIGINT NOT NULL,
             status SMALLINT NOT NULL,
             won BOOLEAN NOT NULL DEFAULT FALSE,
             created_at_ms BIGINT NOT NULL,
             probability DOUBLE PRECISION NOT NULL DEFAULT 0,
             resolved_at_ms BIGINT,
             prize_cents BIGINT
         );
         CREATE INDEX IF NOT EXISTS challenges_player_created
             ON challenges(player_id, created_at_ms);
         CREATE TABLE IF NOT EXISTS prize_pool (
             id BIGINT PRIMARY KEY CHECK (id = 1),
             amount_cents BIGINT NOT NULL CHECK (amount_cents >= 0)
         );
         INSERT INTO prize_pool (id, amount_cents) VALUES (1, 0) ON CONFLICT (id) DO NOTHING;
         CREATE TABLE IF NOT EXISTS pending_resolutions (
             challenge_id BIGINT PRIMARY KEY REFERENCES challenges(id),
             player_id BIGINT NOT NULL,
             probability DOUBLE PRECISION NOT NULL,
             due_at_ms BIGINT NOT NULL,
             attempts INTEGER NOT NULL DEFAULT 0
         );
         CREATE INDEX IF NOT EXISTS pending_resolutions_due
             ON pending_resolutions(due_at_ms);",
    )?;
    Ok(())
}

fn map_challenge(row: &Row) -> ChallengeRow {
    ChallengeRow {
        id: row.get(0),
        player_id: row.get(1),
        amount_cents: row.get(2),
        status: row.get(3),
        won: row.get(4),
        created_at_ms: row.get(5),
        probability: row.get(6),
        resolved_at_ms: row.get(7),
        prize_cents: row.get(8),
    }
}

fn last_challenge_postgres<C: GenericClient>(
    client: &mut C,
    player_id: PlayerId,
) -> Result<Option<LastChallenge>, StoreError> {
    let row = client.query_opt(
        "SELECT id, created_at_ms, probability, status FROM challenges
         WHERE player_id = $1
         ORDER BY created_at_ms DESC, id DESC
         LIMIT 1",
        &[&player_id],
    )?;
    row.map(|row| {
        let id: i64 = row.get(0);
        Ok(LastChallenge {
            challenge_id: id,
            created_at: super::to_u64(row.get(1), "created_at_ms", id)?,
            probability: row.get(2),
            status: super::status_from_code(row.get(3), id)?,
        })
    })
    .transpose()
}

/// Takes the row lock every pool mutation queues behind.
fn lock_pool<C: GenericClient>(client: &mut C) -> Result<i64, StoreError> {
    let row = client
        .query_opt(
            "SELECT amount_cents FROM prize_pool WHERE id = $1 FOR UPDATE",
            &[&PRIZE_POOL_ID],
        )?
        .ok_or(StoreError::PoolMissing)?;
    Ok(row.get(0))
}

impl LedgerStore for PostgresLedger {
    fn last_challenge(&self, player_id: PlayerId) -> Result<Option<LastChallenge>, StoreError> {
        let mut guard = self.lock()?;
        let client = guard.as_mut().ok_or(StoreError::Closed)?;
        last_challenge_postgres(client, player_id)
    }

    fn join(&self, entry: &NewChallenge, cooldown: &Cooldown) -> Result<Admission, StoreError> {
        let created_at = to_i64(entry.created_at, "created_at")?;
        let due_at = to_i64(entry.due_at, "due_at")?;
        let status = ChallengeStatus::Joined;

        let mut guard = self.lock()?;
        let client = guard.as_mut().ok_or(StoreError::Closed)?;
        let mut tx = client.transaction()?;
        let current = lock_pool(&mut tx)?;

        let last = last_challenge_postgres(&mut tx, entry.player_id)?;
        let retry_after_ms = cooldown.remaining(last.as_ref(), entry.created_at);
        if retry_after_ms > 0 {
            return Ok(Admission::TooEarly { retry_after_ms });
        }
        let probability = last
            .as_ref()
            .map(LastChallenge::carried_probability)
            .unwrap_or(0.0);

        let row = tx.query_one(
            "INSERT INTO challenges (player_id, amount_cents, status, won, created_at_ms, probability)
             VALUES ($1, $2, $3, FALSE, $4, $5)
             RETURNING id",
            &[
                &entry.player_id,
                &entry.amount.cents(),
                &status.code(),
                &created_at,
                &probability,
            ],
        )?;
        let challenge_id: i64 = row.get(0);

        let pool = Amount::from_cents(current)
            .checked_add(entry.amount)
            .ok_or(StoreError::PoolOverflow)?;
        let updated = tx.execute(
            "UPDATE prize_pool SET amount_cents = $1 WHERE id = $2",
            &[&pool.cents(), &PRIZE_POOL_ID],
        )?;
        if updated != 1 {
            return Err(StoreError::PoolMissing);
        }

        tx.execute(
            "INSERT INTO pending_resolutions (challenge_id, player_id, probability, due_at_ms, attempts)
             VALUES ($1, $2, $3, $4, 0)",
            &[&challenge_id, &entry.player_id, &probability, &due_at],
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
        let mut guard = self.lock()?;
        let client = guard.as_mut().ok_or(StoreError::Closed)?;
        let mut tx = client.transaction()?;

        let settlement = match resolution.outcome {
            Outcome::Won => {
                let prize = lock_pool(&mut tx)?;
                let updated = tx.execute(
                    "UPDATE challenges
                     SET status = $1, won = TRUE, probability = 0, prize_cents = $2, resolved_at_ms = $3
                     WHERE id = $4 AND player_id = $5 AND resolved_at_ms IS NULL",
                    &[
                        &ChallengeStatus::Won.code(),
                        &prize,
                        &resolved_at,
                        &resolution.challenge_id,
                        &resolution.player_id,
                    ],
                )?;
                if updated == 1 {
                    tx.execute(
                        "UPDATE prize_pool SET amount_cents = 0 WHERE id = $1",
                        &[&PRIZE_POOL_ID],
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
                     SET status = $1, won = FALSE, probability = $2, resolved_at_ms = $3
                     WHERE id = $4 AND player_id = $5 AND resolved_at_ms IS NULL",
                    &[
                        &ChallengeStatus::Lost.code(),
                        &probability,
                        &resolved_at,
                        &resolution.challenge_id,
                        &resolution.player_id,
                    ],
                )?;
                (updated == 1).then_some(Settlement::Lost { probability })
            }
        };

        let settlement = match settlement {
            Some(settlement) => settlement,
            None => {
                let exists = tx.query_opt(
                    "SELECT 1 FROM challenges WHERE id = $1 AND player_id = $2",
                    &[&resolution.challenge_id, &resolution.player_id],
                )?;
                if exists.is_some() {
                    Settlement::AlreadyResolved
                } else {
                    Settlement::Missing
                }
            }
        };

        tx.execute(
            "DELETE FROM pending_resolutions WHERE challenge_id = $1",
            &[&resolution.challenge_id],
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
        let max_attempts = i32::try_from(max_attempts).unwrap_or(i32::MAX);
        let limit = limit
            .map(|limit| to_i64_usize(limit, "limit"))
            .transpose()?;
        let mut guard = self.lock()?;
        let client = guard.as_mut().ok_or(StoreError::Closed)?;
        let rows = client.query(
            "SELECT challenge_id, player_id, probability, due_at_ms, attempts
             FROM pending_resolutions
             WHERE due_at_ms <= $1 AND attempts < $2
             ORDER BY due_at_ms ASC, challenge_id ASC
             LIMIT $3",
            &[&due_before, &max_attempts, &limit],
        )?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let challenge_id: i64 = row.get(0);
            let attempts: i32 = row.get(4);
            jobs.push(PendingResolution {
                challenge_id,
                player_id: row.get(1),
                probability: row.get(2),
                due_at: super::to_u64(row.get(3), "due_at_ms", challenge_id)?,
                attempts: attempts_from(attempts.into(), challenge_id)?,
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
        let attempts = i32::try_from(attempts).unwrap_or(i32::MAX);
        let mut guard = self.lock()?;
        let client = guard.as_mut().ok_or(StoreError::Closed)?;
        client.execute(
            "UPDATE pending_resolutions SET due_at_ms = $1, attempts = $2 WHERE challenge_id = $3",
            &[&due_at, &attempts, &challenge_id],
        )?;
        Ok(())
    }

    fn challenge(&self, id: ChallengeId) -> Result<Option<Challenge>, StoreError> {
        let mut guard = self.lock()?;
        let client = guard.as_mut().ok_or(StoreError::Closed)?;
        let row = client.query_opt(
            &format!("SELECT {CHALLENGE_COLUMNS} FROM challenges WHERE id = $1"),
            &[&id],
        )?;
        row.map(|row| map_challenge(&row).into_challenge())
            .transpose()
    }

    fn list_challenges(&self, query: &ListQuery) -> Result<Vec<Challenge>, StoreError> {
        let limit = to_i64_usize(query.limit, "limit")?;
        let mut guard = self.lock()?;
        let client = guard.as_mut().ok_or(StoreError::Closed)?;
        let rows = match query.player_id {
            Some(player_id) => client.query(
                &format!(
                    "SELECT {CHALLENGE_COLUMNS} FROM challenges
                     WHERE player_id = $1 ORDER BY id DESC LIMIT $2"
                ),
                &[&player_id, &limit],
            )?,
            None => client.query(
                &format!("SELECT {CHALLENGE_COLUMNS} FROM challenges ORDER BY id DESC LIMIT $1"),
                &[&limit],
            )?,
        };
        rows.iter()
            .map(|row| map_challenge(row).into_challenge())
            .collect()
    }

    fn prize_pool(&self) -> Result<PrizePool, StoreError> {
        let mut guard = self.lock()?;
        let client = guard.as_mut().ok_or(StoreError::Closed)?;
        let row = client
            .query_opt(
                "SELECT amount_cents FROM prize_pool WHERE id = $1",
                &[&PRIZE_POOL_ID],
            )?
            .ok_or(StoreError::PoolMissing)?;
        Ok(PrizePool::new(Amount::from_cents(row.get(0))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_private_and_loopback_hosts() {
        assert!(validate_postgres_url("postgres://user:pw@localhost/endless").is_ok());
        assert!(validate_postgres_url("postgres://user:pw@127.0.0.1:5432/endless").is_ok());
        assert!(validate_postgres_url("postgresql://10.0.0.5/endless").is_ok());
    }

    #[test]
    fn rejects_other_schemes_and_public_hosts() {
        assert!(matches!(
            validate_postgres_url("mysql://localhost/endless"),
            Err(StoreError::InvalidUrl(_))
        ));
        assert!(matches!(
            validate_postgres_url("postgres://8.8.8.8/endless"),
            Err(StoreError::InvalidUrl(_))
        ));
    }
}
