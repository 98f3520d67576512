//! SQLite implementation of the relay repository contracts.
//!
//! Each record is stored as a JSON document next to the columns the queries
//! filter and sort on. Updates load, mutate and rewrite the document while
//! holding the connection, so status transitions never interleave.

use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use relay_core::{
    ActionRepository, ActionStatus, ConnectionStatus, Group, GroupMember, GroupRepository,
    Instance, InstanceRepository, Message, MessageRepository, MessageStatus, RelayError,
    RelayResult, ScheduledAction,
};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Params, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use time::OffsetDateTime;
use tokio::task::spawn_blocking;
use tracing::debug;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS instances (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    channel TEXT NOT NULL,
    external_id TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    doc TEXT NOT NULL,
    UNIQUE (channel, external_id)
);
CREATE INDEX IF NOT EXISTS instances_owner ON instances (owner_id);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    instance_id TEXT NOT NULL,
    provider_message_id TEXT,
    created_at INTEGER NOT NULL,
    doc TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS messages_provider ON messages (instance_id, provider_message_id);

CREATE TABLE IF NOT EXISTS chat_groups (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    instance_id TEXT NOT NULL,
    name TEXT NOT NULL,
    doc TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS groups_owner ON chat_groups (owner_id, instance_id);

CREATE TABLE IF NOT EXISTS group_members (
    id TEXT PRIMARY KEY,
    group_id TEXT NOT NULL,
    identifier TEXT NOT NULL,
    active INTEGER NOT NULL,
    doc TEXT NOT NULL,
    UNIQUE (group_id, identifier)
);

CREATE TABLE IF NOT EXISTS actions (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    scheduled_for INTEGER NOT NULL,
    doc TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS actions_due ON actions (status, scheduled_for);
"#;

#[derive(Clone)]
pub struct SqliteRepository {
    conn: Arc<StdMutex<Connection>>,
}

impl SqliteRepository {
    pub fn open(path: impl AsRef<Path>) -> RelayResult<Self> {
        let conn = Connection::open(path.as_ref()).map_err(db_error)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(db_error)?;
        debug!(path = %path.as_ref().display(), "sqlite store opened");
        Self::with_schema(conn)
    }

    pub fn open_in_memory() -> RelayResult<Self> {
        Self::with_schema(Connection::open_in_memory().map_err(db_error)?)
    }

    fn with_schema(conn: Connection) -> RelayResult<Self> {
        conn.execute_batch(SCHEMA_SQL).map_err(db_error)?;
        Ok(Self {
            conn: Arc::new(StdMutex::new(conn)),
        })
    }

    async fn with_conn<F, T>(&self, func: F) -> RelayResult<T>
    where
        F: FnOnce(&Connection) -> RelayResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            func(&guard)
        })
        .await
        .map_err(RelayError::storage)?
    }
}

/// Unique-constraint violations are conflicts; everything else is storage.
fn db_error(err: rusqlite::Error) -> RelayError {
    if let rusqlite::Error::SqliteFailure(code, message) = &err {
        if code.code == ErrorCode::ConstraintViolation {
            return RelayError::Conflict(
                message
                    .clone()
                    .unwrap_or_else(|| "constraint violation".to_string()),
            );
        }
    }
    RelayError::storage(err)
}

fn to_doc<T: Serialize>(value: &T) -> RelayResult<String> {
    serde_json::to_string(value).map_err(RelayError::storage)
}

fn from_doc<T: DeserializeOwned>(doc: &str) -> RelayResult<T> {
    serde_json::from_str(doc).map_err(RelayError::storage)
}

fn nanos(at: OffsetDateTime) -> i64 {
    i64::try_from(at.unix_timestamp_nanos()).unwrap_or(i64::MAX)
}

fn load_one<T: DeserializeOwned, P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> RelayResult<Option<T>> {
    let doc: Option<String> = conn
        .query_row(sql, params, |row| row.get(0))
        .optional()
        .map_err(db_error)?;
    doc.as_deref().map(from_doc).transpose()
}

fn load_all<T: DeserializeOwned, P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> RelayResult<Vec<T>> {
    let mut stmt = conn.prepare(sql).map_err(db_error)?;
    let docs = stmt
        .query_map(params, |row| row.get::<_, String>(0))
        .map_err(db_error)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(db_error)?;
    docs.iter().map(|doc| from_doc(doc)).collect()
}

fn put_instance(conn: &Connection, instance: &Instance) -> RelayResult<()> {
    conn.execute(
        "INSERT INTO instances (id, owner_id, channel, external_id, created_at, doc)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET owner_id=excluded.owner_id,
         channel=excluded.channel, external_id=excluded.external_id, doc=excluded.doc",
        params![
            instance.id,
            instance.owner_id,
            instance.channel,
            instance.external_id,
            nanos(instance.created_at),
            to_doc(instance)?
        ],
    )
    .map_err(db_error)?;
    Ok(())
}

fn get_instance(conn: &Connection, id: &str) -> RelayResult<Option<Instance>> {
    load_one(conn, "SELECT doc FROM instances WHERE id = ?1", params![id])
}

fn put_message(conn: &Connection, message: &Message) -> RelayResult<()> {
    conn.execute(
        "INSERT INTO messages (id, instance_id, provider_message_id, created_at, doc)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET provider_message_id=excluded.provider_message_id,
         doc=excluded.doc",
        params![
            message.id,
            message.instance_id,
            message.provider_message_id,
            nanos(message.created_at),
            to_doc(message)?
        ],
    )
    .map_err(db_error)?;
    Ok(())
}

fn get_message(conn: &Connection, id: &str) -> RelayResult<Option<Message>> {
    load_one(conn, "SELECT doc FROM messages WHERE id = ?1", params![id])
}

fn put_group(conn: &Connection, group: &Group) -> RelayResult<()> {
    conn.execute(
        "INSERT INTO chat_groups (id, owner_id, instance_id, name, doc)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET name=excluded.name, doc=excluded.doc",
        params![
            group.id,
            group.owner_id,
            group.instance_id,
            group.name,
            to_doc(group)?
        ],
    )
    .map_err(db_error)?;
    Ok(())
}

fn get_group(conn: &Connection, id: &str) -> RelayResult<Option<Group>> {
    load_one(conn, "SELECT doc FROM chat_groups WHERE id = ?1", params![id])
}

fn put_member(conn: &Connection, member: &GroupMember) -> RelayResult<()> {
    conn.execute(
        "INSERT INTO group_members (id, group_id, identifier, active, doc)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET active=excluded.active, doc=excluded.doc",
        params![
            member.id,
            member.group_id,
            member.identifier,
            member.active,
            to_doc(member)?
        ],
    )
    .map_err(db_error)?;
    Ok(())
}

fn put_action(conn: &Connection, action: &ScheduledAction) -> RelayResult<()> {
    conn.execute(
        "INSERT INTO actions (id, status, scheduled_for, doc)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(id) DO UPDATE SET status=excluded.status,
         scheduled_for=excluded.scheduled_for, doc=excluded.doc",
        params![
            action.id,
            action.status.as_str(),
            nanos(action.scheduled_for),
            to_doc(action)?
        ],
    )
    .map_err(db_error)?;
    Ok(())
}

fn get_action(conn: &Connection, id: &str) -> RelayResult<Option<ScheduledAction>> {
    load_one(conn, "SELECT doc FROM actions WHERE id = ?1", params![id])
}

/// Loads an action that must exist, applies `change` and writes it back.
fn change_action<F>(conn: &Connection, id: &str, change: F) -> RelayResult<()>
where
    F: FnOnce(&mut ScheduledAction),
{
    let mut action = get_action(conn, id)?.ok_or_else(|| RelayError::not_found("action", id))?;
    change(&mut action);
    put_action(conn, &action)
}

fn change_message<F>(conn: &Connection, id: &str, change: F) -> RelayResult<Option<Message>>
where
    F: FnOnce(&mut Message),
{
    let Some(mut message) = get_message(conn, id)? else {
        return Ok(None);
    };
    change(&mut message);
    put_message(conn, &message)?;
    Ok(Some(message))
}

fn change_instance<F>(conn: &Connection, id: &str, change: F) -> RelayResult<Option<Instance>>
where
    F: FnOnce(&mut Instance),
{
    let Some(mut instance) = get_instance(conn, id)? else {
        return Ok(None);
    };
    change(&mut instance);
    put_instance(conn, &instance)?;
    Ok(Some(instance))
}

#[async_trait]
impl InstanceRepository for SqliteRepository {
    async fn save_instance(&self, instance: &Instance) -> RelayResult<()> {
        let instance = instance.clone();
        self.with_conn(move |conn| put_instance(conn, &instance))
            .await
    }

    async fn get_instance_by_id(&self, id: &str) -> RelayResult<Option<Instance>> {
        let id = id.to_string();
        self.with_conn(move |conn| get_instance(conn, &id)).await
    }

    async fn get_instances_by_owner(&self, owner_id: &str) -> RelayResult<Vec<Instance>> {
        let owner_id = owner_id.to_string();
        self.with_conn(move |conn| {
            load_all(
                conn,
                "SELECT doc FROM instances WHERE owner_id = ?1 ORDER BY created_at",
                params![owner_id],
            )
        })
        .await
    }

    async fn get_instance_by_channel_id(
        &self,
        channel: &str,
        external_id: &str,
    ) -> RelayResult<Option<Instance>> {
        let (channel, external_id) = (channel.to_string(), external_id.to_string());
        self.with_conn(move |conn| {
            load_one(
                conn,
                "SELECT doc FROM instances WHERE channel = ?1 AND external_id = ?2",
                params![channel, external_id],
            )
        })
        .await
    }

    async fn update_instance_status(
        &self,
        id: &str,
        status: ConnectionStatus,
        at: OffsetDateTime,
    ) -> RelayResult<Option<Instance>> {
        let id = id.to_string();
        self.with_conn(move |conn| change_instance(conn, &id, |i| i.apply_status(status, at)))
            .await
    }

    async fn update_instance_metadata(
        &self,
        id: &str,
        patch: BTreeMap<String, Value>,
    ) -> RelayResult<Option<Instance>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            change_instance(conn, &id, |instance| {
                instance.metadata.extend(patch);
                instance.updated_at = OffsetDateTime::now_utc();
            })
        })
        .await
    }

    async fn delete_instance(&self, id: &str) -> RelayResult<bool> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let removed = conn
                .execute("DELETE FROM instances WHERE id = ?1", params![id])
                .map_err(db_error)?;
            Ok(removed > 0)
        })
        .await
    }
}

#[async_trait]
impl MessageRepository for SqliteRepository {
    async fn log_message(&self, message: &Message) -> RelayResult<()> {
        let message = message.clone();
        self.with_conn(move |conn| put_message(conn, &message)).await
    }

    async fn get_message_by_id(&self, id: &str) -> RelayResult<Option<Message>> {
        let id = id.to_string();
        self.with_conn(move |conn| get_message(conn, &id)).await
    }

    async fn get_message_by_provider_id(
        &self,
        instance_id: &str,
        provider_message_id: &str,
    ) -> RelayResult<Option<Message>> {
        let (instance_id, provider_id) = (instance_id.to_string(), provider_message_id.to_string());
        self.with_conn(move |conn| {
            load_one(
                conn,
                "SELECT doc FROM messages WHERE instance_id = ?1 AND provider_message_id = ?2
                 ORDER BY created_at LIMIT 1",
                params![instance_id, provider_id],
            )
        })
        .await
    }

    async fn update_message_status(
        &self,
        id: &str,
        status: MessageStatus,
        at: OffsetDateTime,
    ) -> RelayResult<Option<Message>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let Some(mut message) = get_message(conn, &id)? else {
                return Ok(None);
            };
            if message.advance_status(status, at) {
                put_message(conn, &message)?;
            }
            Ok(Some(message))
        })
        .await
    }

    async fn update_message_provider_id(
        &self,
        id: &str,
        provider_message_id: &str,
    ) -> RelayResult<()> {
        let (id, provider_id) = (id.to_string(), provider_message_id.to_string());
        self.with_conn(move |conn| {
            change_message(conn, &id, |m| {
                m.provider_message_id = Some(provider_id);
                m.updated_at = OffsetDateTime::now_utc();
            })?
            .map(|_| ())
            .ok_or_else(|| RelayError::not_found("message", id.clone()))
        })
        .await
    }

    async fn update_message_error(
        &self,
        id: &str,
        error: &str,
        retry_count: u32,
    ) -> RelayResult<()> {
        let (id, error) = (id.to_string(), error.to_string());
        self.with_conn(move |conn| {
            change_message(conn, &id, |m| {
                m.error = Some(error);
                m.retry_count = retry_count;
                m.updated_at = OffsetDateTime::now_utc();
            })?
            .map(|_| ())
            .ok_or_else(|| RelayError::not_found("message", id.clone()))
        })
        .await
    }
}

#[async_trait]
impl GroupRepository for SqliteRepository {
    async fn create_group(&self, group: &Group) -> RelayResult<()> {
        let group = group.clone();
        self.with_conn(move |conn| {
            if get_group(conn, &group.id)?.is_some() {
                return Err(RelayError::Conflict(format!(
                    "group {} already exists",
                    group.id
                )));
            }
            put_group(conn, &group)
        })
        .await
    }

    async fn get_group(&self, id: &str) -> RelayResult<Option<Group>> {
        let id = id.to_string();
        self.with_conn(move |conn| get_group(conn, &id)).await
    }

    async fn list_groups(
        &self,
        owner_id: &str,
        instance_id: Option<&str>,
    ) -> RelayResult<Vec<Group>> {
        let owner_id = owner_id.to_string();
        let instance_id = instance_id.map(str::to_string);
        self.with_conn(move |conn| {
            load_all(
                conn,
                "SELECT doc FROM chat_groups WHERE owner_id = ?1
                 AND (?2 IS NULL OR instance_id = ?2) ORDER BY name",
                params![owner_id, instance_id],
            )
        })
        .await
    }

    async fn add_group_member(&self, member: &GroupMember) -> RelayResult<GroupMember> {
        let member = member.clone();
        self.with_conn(move |conn| {
            if get_group(conn, &member.group_id)?.is_none() {
                return Err(RelayError::not_found("group", member.group_id.clone()));
            }
            let existing: Option<GroupMember> = load_one(
                conn,
                "SELECT doc FROM group_members WHERE group_id = ?1 AND identifier = ?2",
                params![member.group_id, member.identifier],
            )?;
            let stored = match existing {
                Some(mut existing) => {
                    existing.active = true;
                    existing.identifier_kind = member.identifier_kind;
                    if member.display_name.is_some() {
                        existing.display_name = member.display_name;
                    }
                    existing
                }
                None => member,
            };
            put_member(conn, &stored)?;
            Ok(stored)
        })
        .await
    }

    async fn remove_group_member(&self, group_id: &str, identifier: &str) -> RelayResult<bool> {
        let (group_id, identifier) = (group_id.to_string(), identifier.to_string());
        self.with_conn(move |conn| {
            let removed = conn
                .execute(
                    "DELETE FROM group_members WHERE group_id = ?1 AND identifier = ?2",
                    params![group_id, identifier],
                )
                .map_err(db_error)?;
            Ok(removed > 0)
        })
        .await
    }

    async fn list_group_members(
        &self,
        group_id: &str,
        active_only: bool,
    ) -> RelayResult<Vec<GroupMember>> {
        let group_id = group_id.to_string();
        self.with_conn(move |conn| {
            load_all(
                conn,
                "SELECT doc FROM group_members WHERE group_id = ?1
                 AND (?2 = 0 OR active = 1) ORDER BY rowid",
                params![group_id, active_only],
            )
        })
        .await
    }

    async fn replace_group_members(
        &self,
        group_id: &str,
        members: &[GroupMember],
        synced_at: OffsetDateTime,
    ) -> RelayResult<()> {
        let group_id = group_id.to_string();
        let members = members.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction().map_err(db_error)?;
            let mut group = get_group(&tx, &group_id)?
                .ok_or_else(|| RelayError::not_found("group", &group_id))?;
            tx.execute(
                "DELETE FROM group_members WHERE group_id = ?1",
                params![group_id],
            )
            .map_err(db_error)?;
            for member in &members {
                put_member(&tx, member)?;
            }
            group.last_sync_at = Some(synced_at);
            group.updated_at = synced_at;
            put_group(&tx, &group)?;
            tx.commit().map_err(db_error)
        })
        .await
    }
}

#[async_trait]
impl ActionRepository for SqliteRepository {
    async fn insert_action(&self, action: &ScheduledAction) -> RelayResult<()> {
        let action = action.clone();
        self.with_conn(move |conn| put_action(conn, &action)).await
    }

    async fn get_action(&self, id: &str) -> RelayResult<Option<ScheduledAction>> {
        let id = id.to_string();
        self.with_conn(move |conn| get_action(conn, &id)).await
    }

    async fn due_actions(
        &self,
        now: OffsetDateTime,
        limit: usize,
    ) -> RelayResult<Vec<ScheduledAction>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            load_all(
                conn,
                "SELECT doc FROM actions WHERE status = ?1 AND scheduled_for <= ?2
                 ORDER BY scheduled_for ASC LIMIT ?3",
                params![ActionStatus::Pending.as_str(), nanos(now), limit],
            )
        })
        .await
    }

    async fn claim_action(&self, id: &str, at: OffsetDateTime) -> RelayResult<bool> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let Some(mut action) = get_action(conn, &id)? else {
                return Ok(false);
            };
            if action.status != ActionStatus::Pending {
                return Ok(false);
            }
            action.status = ActionStatus::Processing;
            action.updated_at = at;
            let claimed = conn
                .execute(
                    "UPDATE actions SET status = ?1, doc = ?2 WHERE id = ?3 AND status = ?4",
                    params![
                        ActionStatus::Processing.as_str(),
                        to_doc(&action)?,
                        id,
                        ActionStatus::Pending.as_str()
                    ],
                )
                .map_err(db_error)?;
            Ok(claimed == 1)
        })
        .await
    }

    async fn release_stale_actions(
        &self,
        stale_before: OffsetDateTime,
        at: OffsetDateTime,
    ) -> RelayResult<Vec<ScheduledAction>> {
        self.with_conn(move |conn| {
            let processing: Vec<ScheduledAction> = load_all(
                conn,
                "SELECT doc FROM actions WHERE status = ?1 ORDER BY scheduled_for ASC",
                params![ActionStatus::Processing.as_str()],
            )?;
            let mut released = Vec::new();
            for mut action in processing {
                if action.updated_at >= stale_before {
                    continue;
                }
                action.expire_claim(at);
                put_action(conn, &action)?;
                released.push(action);
            }
            Ok(released)
        })
        .await
    }

    async fn complete_action(
        &self,
        id: &str,
        result: &Value,
        executed_at: OffsetDateTime,
    ) -> RelayResult<()> {
        let (id, result) = (id.to_string(), result.clone());
        self.with_conn(move |conn| {
            change_action(conn, &id, |action| {
                action.status = ActionStatus::Completed;
                action.result = Some(result);
                action.executed_at = Some(executed_at);
                action.updated_at = executed_at;
            })
        })
        .await
    }

    async fn reschedule_action(
        &self,
        id: &str,
        attempts: u32,
        error: &str,
        next_run: OffsetDateTime,
    ) -> RelayResult<()> {
        let (id, error) = (id.to_string(), error.to_string());
        self.with_conn(move |conn| {
            change_action(conn, &id, |action| {
                action.status = ActionStatus::Pending;
                action.attempts = attempts;
                action.last_error = Some(error);
                action.scheduled_for = next_run;
                action.updated_at = OffsetDateTime::now_utc();
            })
        })
        .await
    }

    async fn fail_action(
        &self,
        id: &str,
        attempts: u32,
        error: &str,
        executed_at: OffsetDateTime,
    ) -> RelayResult<()> {
        let (id, error) = (id.to_string(), error.to_string());
        self.with_conn(move |conn| {
            change_action(conn, &id, |action| {
                action.status = ActionStatus::Failed;
                action.attempts = attempts;
                action.last_error = Some(error);
                action.executed_at = Some(executed_at);
                action.updated_at = executed_at;
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{GroupKind, IdentifierKind, new_id};

    #[tokio::test]
    async fn duplicate_channel_external_id_is_a_conflict() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        let first = Instance::new("owner-1", "chatA", "store-1");
        repo.save_instance(&first).await.unwrap();
        // re-saving the same record is an update
        repo.save_instance(&first).await.unwrap();

        let clash = Instance::new("owner-2", "chatA", "store-1");
        let err = repo.save_instance(&clash).await.unwrap_err();
        assert!(matches!(err, RelayError::Conflict(_)));
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        let now = OffsetDateTime::now_utc();
        let action = ScheduledAction {
            id: new_id(),
            owner_id: "owner-1".into(),
            action_type: "api_call".into(),
            payload: serde_json::json!({}),
            scheduled_for: now,
            status: ActionStatus::Pending,
            attempts: 0,
            max_attempts: 3,
            last_error: None,
            result: None,
            executed_at: None,
            created_at: now,
            updated_at: now,
        };
        repo.insert_action(&action).await.unwrap();
        assert!(repo.claim_action(&action.id, now).await.unwrap());
        assert!(!repo.claim_action(&action.id, now).await.unwrap());
        assert!(repo.due_actions(now, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn re_adding_a_member_reactivates_it() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        let now = OffsetDateTime::now_utc();
        let group = Group {
            id: new_id(),
            owner_id: "owner-1".into(),
            instance_id: "inst-1".into(),
            name: "vip".into(),
            kind: GroupKind::Custom,
            external_group_id: None,
            is_synced: false,
            last_sync_at: None,
            created_at: now,
            updated_at: now,
        };
        repo.create_group(&group).await.unwrap();
        let member = GroupMember {
            id: new_id(),
            group_id: group.id.clone(),
            identifier: "111".into(),
            identifier_kind: IdentifierKind::Phone,
            display_name: None,
            active: true,
        };
        let first = repo.add_group_member(&member).await.unwrap();
        let again = repo
            .add_group_member(&GroupMember {
                id: new_id(),
                display_name: Some("Ana".into()),
                ..member
            })
            .await
            .unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.display_name.as_deref(), Some("Ana"));
        assert_eq!(repo.list_group_members(&group.id, true).await.unwrap().len(), 1);
    }
}
