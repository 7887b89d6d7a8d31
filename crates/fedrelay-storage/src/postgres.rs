// Postgres-backed implementation of the federation store.
//
// Reads go against the homeserver's own tables (`events` + `event_json`,
// `room_memberships`); the sender's writable surface is limited to the
// stream-position row, the device outbox, and the poke table. Connection
// pooling and timeouts are explicit because hanging on a dead database
// would stall every pump in the worker.
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{FromRow, PgPool, Row};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::{EventRow, FederationStore, OutboxRow, PokeRow, StoreError, StoreResult};

pub struct PostgresStore {
    pool: PgPool,
}

/// Row shape of the events view. Kept separate from the domain `EventRow`
/// so the JSON column's text-to-value parse has one obvious home.
#[derive(Debug, FromRow)]
struct DbEventRow {
    stream_ordering: i64,
    event_id: String,
    room_id: String,
    sender: String,
    format_version: i64,
    json: String,
}

#[derive(Debug, FromRow)]
struct DbOutboxRow {
    destination: String,
    stream_id: i64,
    messages_json: String,
}

#[derive(Debug, FromRow)]
struct DbPokeRow {
    destination: String,
    stream_id: i64,
    user_id: String,
    sent: bool,
}

impl PostgresStore {
    pub async fn connect(connection_string: &str) -> StoreResult<Self> {
        let options = PgConnectOptions::from_str(connection_string)
            .map_err(|err| StoreError::Unexpected(anyhow!("parse connection string: {err}")))?;
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await
            .context("connect to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn db_error(err: sqlx::Error, what: &str) -> StoreError {
    StoreError::Unexpected(anyhow!("{what}: {err}"))
}

#[async_trait]
impl FederationStore for PostgresStore {
    async fn stream_position(&self, kind: &str) -> StoreResult<i64> {
        let position: Option<i64> = sqlx::query_scalar(
            "SELECT stream_id FROM federation_stream_position WHERE type = $1",
        )
        .bind(kind)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| db_error(err, "read stream position"))?;
        Ok(position.unwrap_or(0))
    }

    async fn update_stream_position(&self, kind: &str, position: i64) -> StoreResult<()> {
        let updated = sqlx::query(
            "UPDATE federation_stream_position SET stream_id = $2 WHERE type = $1",
        )
        .bind(kind)
        .bind(position)
        .execute(&self.pool)
        .await
        .map_err(|err| db_error(err, "update stream position"))?;
        if updated.rows_affected() == 0 {
            sqlx::query("INSERT INTO federation_stream_position (type, stream_id) VALUES ($1, $2)")
                .bind(kind)
                .bind(position)
                .execute(&self.pool)
                .await
                .map_err(|err| db_error(err, "insert stream position"))?;
        }
        Ok(())
    }

    async fn events_between(
        &self,
        after: i64,
        upto: i64,
        limit: i64,
    ) -> StoreResult<Vec<EventRow>> {
        let rows: Vec<DbEventRow> = sqlx::query_as(
            "SELECT e.stream_ordering, e.event_id, e.room_id, e.sender, \
                    ej.format_version, ej.json \
             FROM events AS e \
             JOIN event_json AS ej ON ej.event_id = e.event_id \
             WHERE e.stream_ordering > $1 AND e.stream_ordering <= $2 \
             ORDER BY e.stream_ordering ASC \
             LIMIT $3",
        )
        .bind(after)
        .bind(upto)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| db_error(err, "fetch events"))?;

        rows.into_iter()
            .map(|row| {
                let json = serde_json::from_str(&row.json).map_err(|err| {
                    StoreError::Unexpected(anyhow!(
                        "stored event {} is not valid json: {err}",
                        row.event_id
                    ))
                })?;
                Ok(EventRow {
                    stream_id: row.stream_ordering,
                    event_id: row.event_id,
                    room_id: row.room_id,
                    sender: row.sender,
                    format_version: row.format_version,
                    json,
                })
            })
            .collect()
    }

    async fn joined_hosts(&self, room_id: &str) -> StoreResult<Vec<String>> {
        let hosts: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT split_part(user_id, ':', 2) \
             FROM room_memberships \
             WHERE room_id = $1 AND membership = 'join' \
             ORDER BY 1",
        )
        .bind(room_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| db_error(err, "fetch joined hosts"))?;
        Ok(hosts)
    }

    async fn hosts_sharing_rooms_with(
        &self,
        user_ids: &[String],
    ) -> StoreResult<HashMap<String, Vec<String>>> {
        // One grouped self-join instead of a query per user per room.
        let rows = sqlx::query(
            "SELECT DISTINCT mine.user_id AS user_id, \
                             split_part(peer.user_id, ':', 2) AS host \
             FROM room_memberships AS mine \
             JOIN room_memberships AS peer \
               ON peer.room_id = mine.room_id AND peer.membership = 'join' \
             WHERE mine.membership = 'join' AND mine.user_id = ANY($1)",
        )
        .bind(user_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| db_error(err, "fetch shared-room hosts"))?;

        let mut result: HashMap<String, Vec<String>> = user_ids
            .iter()
            .map(|user_id| (user_id.clone(), Vec::new()))
            .collect();
        for row in rows {
            let user_id: String = row.try_get("user_id").map_err(|err| db_error(err, "user_id"))?;
            let host: String = row.try_get("host").map_err(|err| db_error(err, "host"))?;
            result.entry(user_id).or_default().push(host);
        }
        for hosts in result.values_mut() {
            hosts.sort();
            hosts.dedup();
        }
        Ok(result)
    }

    async fn pending_device_messages(
        &self,
        destination: &str,
        after: i64,
        limit: i64,
    ) -> StoreResult<Vec<OutboxRow>> {
        let rows: Vec<DbOutboxRow> = sqlx::query_as(
            "SELECT destination, stream_id, messages_json \
             FROM device_federation_outbox \
             WHERE destination = $1 AND stream_id > $2 \
             ORDER BY stream_id ASC \
             LIMIT $3",
        )
        .bind(destination)
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| db_error(err, "fetch device outbox"))?;

        rows.into_iter()
            .map(|row| {
                let messages_json = serde_json::from_str(&row.messages_json).map_err(|err| {
                    StoreError::Unexpected(anyhow!(
                        "outbox row {} for {} is not valid json: {err}",
                        row.stream_id,
                        row.destination
                    ))
                })?;
                Ok(OutboxRow {
                    destination: row.destination,
                    stream_id: row.stream_id,
                    messages_json,
                })
            })
            .collect()
    }

    async fn delete_device_messages(
        &self,
        destination: &str,
        stream_ids: &[i64],
    ) -> StoreResult<()> {
        if stream_ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            "DELETE FROM device_federation_outbox \
             WHERE destination = $1 AND stream_id = ANY($2)",
        )
        .bind(destination)
        .bind(stream_ids)
        .execute(&self.pool)
        .await
        .map_err(|err| db_error(err, "delete device outbox rows"))?;
        Ok(())
    }

    async fn pending_device_list_pokes(
        &self,
        destination: &str,
        after: i64,
        limit: i64,
    ) -> StoreResult<Vec<PokeRow>> {
        let rows: Vec<DbPokeRow> = sqlx::query_as(
            "SELECT destination, stream_id, user_id, sent \
             FROM device_lists_outbound_pokes \
             WHERE destination = $1 AND NOT sent AND stream_id > $2 \
             ORDER BY stream_id ASC \
             LIMIT $3",
        )
        .bind(destination)
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| db_error(err, "fetch device-list pokes"))?;

        Ok(rows
            .into_iter()
            .map(|row| PokeRow {
                destination: row.destination,
                stream_id: row.stream_id,
                user_id: row.user_id,
                sent: row.sent,
            })
            .collect())
    }

    async fn mark_device_list_pokes_sent(
        &self,
        destination: &str,
        pokes: &[(i64, String)],
    ) -> StoreResult<()> {
        if pokes.is_empty() {
            return Ok(());
        }
        let stream_ids: Vec<i64> = pokes.iter().map(|(stream_id, _)| *stream_id).collect();
        let user_ids: Vec<String> = pokes.iter().map(|(_, user_id)| user_id.clone()).collect();
        sqlx::query(
            "UPDATE device_lists_outbound_pokes SET sent = TRUE \
             WHERE destination = $1 \
               AND (stream_id, user_id) IN \
                   (SELECT * FROM UNNEST($2::bigint[], $3::text[]))",
        )
        .bind(destination)
        .bind(stream_ids)
        .bind(user_ids)
        .execute(&self.pool)
        .await
        .map_err(|err| db_error(err, "mark device-list pokes sent"))?;
        Ok(())
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|err| db_error(err, "health check"))?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}
