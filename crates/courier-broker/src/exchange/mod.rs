//! Exchange: process-wide destination registry and dispatch
//! coordinator.
//!
//! The exchange owns every destination exclusively. Lookups, facade
//! operations, and worker sweeps share the registry under a read lock;
//! only create, delete, and drop take the write lock. Any mutation
//! that makes new work available posts a new-message event to the
//! worker pool.

pub mod dispatch;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use courier_common::{BrokerConfig, BrokerError, BrokerResult};
use sqlx::Row;
use tokio::sync::RwLock;

use crate::destination::{
    Destination, DestinationInfo, DestinationOwner, SenderRequest, SubscribeRequest,
};
use crate::message::Message;
use crate::session::ClientSession;
use crate::storage::{storage_err, StoragePool};
use crate::uri::{main_destination_path, parse_reference, DestinationKind};

use dispatch::{DispatchPool, Registry};

/// Whether a lookup may create the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationMode {
    Create,
    NoCreate,
}

/// Registry and dispatch engine; the single entry point for front-end
/// sessions.
pub struct Exchange {
    config: Arc<BrokerConfig>,
    store: Arc<StoragePool>,
    destinations_table: String,
    journal_table: String,
    registry: Registry,
    pool: DispatchPool,
}

impl Exchange {
    /// Bootstrap the exchange: create the registry and journal tables
    /// and size the worker pool from `threads.subscribers`.
    pub async fn new(
        config: Arc<BrokerConfig>,
        store: Arc<StoragePool>,
    ) -> BrokerResult<Arc<Exchange>> {
        let destinations_table = format!("\"{}_destinations\"", config.broker.id);
        let journal_table = config.storage.message_journal.clone();

        let sql = format!(
            "create table if not exists {destinations_table} (\
             id text not null primary key\
             ,name text not null\
             ,type int not null\
             ,create_time timestamp not null default current_timestamp\
             ,subscriptions_count int not null default 0\
             ,constraint \"{}_destinations_index\" unique (name, type)\
             )",
            config.broker.id
        );
        store
            .do_now(&sql)
            .await
            .map_err(|e| BrokerError::storage(format!("can't init exchange: {e}"), &sql))?;

        let sql = format!(
            "create table if not exists {journal_table} (\
             message_id text not null primary key\
             ,uri text not null\
             ,body_type int\
             ,subscribers_count int not null default 0\
             )"
        );
        store
            .do_now(&sql)
            .await
            .map_err(|e| BrokerError::storage(format!("can't init exchange: {e}"), &sql))?;

        Ok(Arc::new(Exchange {
            pool: DispatchPool::new(config.threads.subscribers),
            config,
            store,
            destinations_table,
            journal_table,
            registry: Arc::new(RwLock::new(HashMap::new())),
        }))
    }

    /// Name of the persistent destinations table.
    pub fn destinations_table(&self) -> &str {
        &self.destinations_table
    }

    /// Resolve a destination by URI or key.
    pub async fn destination(
        &self,
        uri: &str,
        mode: CreationMode,
    ) -> BrokerResult<Arc<Destination>> {
        self.destination_with_owner(uri, mode, None).await
    }

    /// Resolve a destination, passing lifetime ownership for temporary
    /// destinations created by this call.
    pub async fn destination_with_owner(
        &self,
        uri: &str,
        mode: CreationMode,
        owner: Option<DestinationOwner>,
    ) -> BrokerResult<Arc<Destination>> {
        let key = main_destination_path(uri)?;
        match mode {
            CreationMode::NoCreate => {
                let registry = self.registry.read().await;
                registry
                    .get(&key)
                    .cloned()
                    .ok_or_else(|| BrokerError::not_found("destination not found", &key))
            }
            CreationMode::Create => {
                {
                    let registry = self.registry.read().await;
                    if let Some(dest) = registry.get(&key) {
                        return Ok(dest.clone());
                    }
                }

                // a reader never upgrades: re-check under the write lock
                let mut registry = self.registry.write().await;
                if let Some(dest) = registry.get(&key) {
                    return Ok(dest.clone());
                }
                let parsed = parse_reference(uri)?;
                let dest = Destination::open(
                    &parsed,
                    owner,
                    self.store.clone(),
                    self.config.clone(),
                )
                .await?;
                registry.insert(key, dest.clone());
                Ok(dest)
            }
        }
    }

    /// Remove a destination from the registry by URI or key.
    pub async fn delete_destination(&self, uri: &str) -> BrokerResult<()> {
        let key = main_destination_path(uri)?;
        let removed = {
            let mut registry = self.registry.write().await;
            registry.remove(&key)
        };
        if let Some(dest) = removed {
            if dest.is_temporary() {
                dest.purge().await?;
            }
            tracing::info!(key = %key, "destination deleted");
        }
        Ok(())
    }

    /// Remove a destination iff no owner is supplied, or the supplied
    /// owner matches the destination's owner.
    pub async fn drop_destination(
        &self,
        id: &str,
        owner: Option<&DestinationOwner>,
    ) -> BrokerResult<()> {
        let removed = {
            let mut registry = self.registry.write().await;
            let allowed = match registry.get(id) {
                Some(dest) => match owner {
                    None => true,
                    Some(owner) => dest.has_owner() && dest.owner() == Some(owner),
                },
                None => false,
            };
            if allowed {
                registry.remove(id)
            } else {
                None
            }
        };
        if let Some(dest) = removed {
            if dest.is_temporary() {
                dest.purge().await?;
            }
            tracing::info!(key = %id, "destination dropped");
        }
        Ok(())
    }

    /// Whether the destination behind `id` is temporary.
    pub async fn is_destination_temporary(&self, id: &str) -> BrokerResult<bool> {
        let dest = self.destination(id, CreationMode::NoCreate).await?;
        Ok(dest.is_temporary())
    }

    // ─────────────────────────────────────────────────────────────────
    // Facade verbs
    // ─────────────────────────────────────────────────────────────────

    /// Persist a message: journal row plus destination log row in one
    /// transaction named by the message id. Transacted sessions stage
    /// instead, and nothing is observable until their commit.
    pub async fn save_message(
        &self,
        session: &ClientSession,
        message: &Message,
    ) -> BrokerResult<()> {
        let dest = self
            .destination(&message.destination_uri, CreationMode::NoCreate)
            .await?;

        if dest.stage_if_transacted(session, message).await {
            return Ok(());
        }

        let subscribers = dest.eligible_subscribers(message).await;
        let mut cached = session.db.lock().await;
        if cached.is_none() {
            *cached = Some(self.store.session().await?);
        }
        let Some(db) = cached.as_mut() else {
            return Err(BrokerError::invalid_state(
                "session storage handle unavailable".to_string(),
            ));
        };

        let outcome: BrokerResult<()> = async {
            db.begin_tx(message.message_id.clone()).await?;
            let sql = format!(
                "insert into {} (message_id, uri, body_type, subscribers_count) \
                 values ($1, $2, $3, $4)",
                self.journal_table
            );
            sqlx::query(&sql)
                .bind(&message.message_id)
                .bind(&message.destination_uri)
                .bind(message.body_type)
                .bind(subscribers)
                .execute(db.conn())
                .await
                .map_err(|e| storage_err(e, &sql))?;
            dest.save(db, message).await?;
            db.commit_tx().await
        }
        .await;

        match outcome {
            Ok(()) => {
                drop(cached);
                self.post_new_message_event(&message.destination_uri);
                Ok(())
            }
            Err(err) => {
                if db.in_tx() {
                    db.rollback_tx().await.ok();
                }
                // a failed save invalidates the session's storage handle
                *cached = None;
                Err(BrokerError::on_save_message(
                    err.to_string(),
                    &message.message_id,
                ))
            }
        }
    }

    /// Register a subscription and mirror the new consumer count into
    /// the destinations table. The count update is best-effort: the
    /// in-memory subscription is already installed, so a failure is
    /// logged rather than unwinding it.
    pub async fn add_subscription(&self, request: SubscribeRequest) -> BrokerResult<()> {
        let dest = self
            .destination(&request.destination_uri, CreationMode::NoCreate)
            .await?;
        dest.subscription(request).await?;

        let count = dest.subscriptions_true_count().await;
        let sql = format!(
            "update {} set subscriptions_count = $1 where id = $2",
            self.destinations_table
        );
        if let Err(err) = sqlx::query(&sql)
            .bind(count)
            .bind(dest.id())
            .execute(self.store.pool())
            .await
        {
            tracing::warn!(error = %err, sql = %sql, "can't update subscriptions count");
        }
        Ok(())
    }

    /// Register a producer.
    pub async fn add_sender(&self, request: SenderRequest) -> BrokerResult<()> {
        let dest = self
            .destination(&request.destination_uri, CreationMode::NoCreate)
            .await?;
        dest.add_sender(&request).await
    }

    /// Remove a producer. An empty destination URI searches every
    /// destination; a vanished destination is not an error.
    pub async fn remove_sender(
        &self,
        session: &ClientSession,
        request: &SenderRequest,
    ) -> BrokerResult<()> {
        if request.destination_uri.is_empty() {
            self.remove_sender_from_any_dest(&request.sender_id).await;
            return Ok(());
        }
        match self
            .destination(&request.destination_uri, CreationMode::NoCreate)
            .await
        {
            Ok(dest) => dest.remove_sender(session, &request.sender_id).await,
            Err(_) => {}
        }
        Ok(())
    }

    /// Remove every producer `session` registered, on all destinations.
    pub async fn remove_senders(&self, session: &ClientSession) {
        let registry = self.registry.read().await;
        for dest in registry.values() {
            dest.remove_senders(session).await;
        }
    }

    async fn remove_sender_from_any_dest(&self, sender_id: &str) {
        let registry = self.registry.read().await;
        for dest in registry.values() {
            dest.remove_sender_by_id(sender_id).await;
        }
    }

    /// Detach a consumer from a destination.
    pub async fn remove_consumer(
        &self,
        session_id: &str,
        destination_id: &str,
        subscription_name: &str,
    ) -> BrokerResult<()> {
        let dest = self
            .destination(destination_id, CreationMode::NoCreate)
            .await?;
        dest.remove_consumer(session_id, subscription_name).await;
        Ok(())
    }

    /// Acknowledge one delivery on a destination.
    pub async fn acknowledge(
        &self,
        session: &ClientSession,
        destination_id: &str,
        subscription_name: &str,
        message_id: &str,
    ) -> BrokerResult<()> {
        let dest = self
            .destination(destination_id, CreationMode::NoCreate)
            .await?;
        dest.acknowledge(session, subscription_name, message_id).await
    }

    /// Open a transaction scope for `session` on one destination.
    pub async fn begin(&self, session: &ClientSession, destination_id: &str) -> BrokerResult<()> {
        let dest = self
            .destination(destination_id, CreationMode::NoCreate)
            .await?;
        dest.begin(session).await;
        Ok(())
    }

    /// Commit the session's staged work; committed messages become
    /// dispatchable before this returns.
    pub async fn commit(&self, session: &ClientSession, destination_id: &str) -> BrokerResult<()> {
        let dest = self
            .destination(destination_id, CreationMode::NoCreate)
            .await?;
        dest.commit(session).await?;
        self.post_new_message_event(dest.uri());
        Ok(())
    }

    /// Discard the session's staged work.
    pub async fn abort(&self, session: &ClientSession, destination_id: &str) -> BrokerResult<()> {
        let dest = self
            .destination(destination_id, CreationMode::NoCreate)
            .await?;
        dest.abort(session).await;
        self.post_new_message_event(dest.uri());
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────
    // Dispatch lifecycle
    // ─────────────────────────────────────────────────────────────────

    /// Start the dispatch workers.
    pub async fn start(&self) {
        self.pool.start(self.registry.clone()).await;
    }

    /// Stop the dispatch workers and wait for them to exit.
    pub async fn stop(&self) {
        self.pool.stop().await;
    }

    /// Whether the worker pool is running.
    pub fn is_running(&self) -> bool {
        self.pool.is_running()
    }

    /// Announce new dispatchable work on `uri` (empty = wake only).
    pub fn post_new_message_event(&self, uri: &str) {
        let key = if uri.is_empty() {
            None
        } else {
            main_destination_path(uri).ok()
        };
        self.pool.post(key);
    }

    // ─────────────────────────────────────────────────────────────────
    // Admin surface
    // ─────────────────────────────────────────────────────────────────

    /// Enumerate destinations: the in-memory registry UNION the
    /// persisted table (cold destinations not yet faulted in),
    /// de-duplicated by name.
    pub async fn info(&self) -> Vec<DestinationInfo> {
        // compatibility contract with the legacy admin surface: entries
        // group by name length when the name contains a digit
        // (otherwise group 0), each group sorts by name, groups
        // concatenate in key order
        let mut groups: BTreeMap<usize, Vec<DestinationInfo>> = BTreeMap::new();

        {
            let registry = self.registry.read().await;
            for dest in registry.values() {
                let info = dest.info().await;
                groups.entry(digit_group(&info.name)).or_default().push(info);
            }
        }

        // fetch all rows and de-dup in memory
        let sql = format!(
            "select id, name, type, cast(create_time as text) as create_time, \
             subscriptions_count from {}",
            self.destinations_table
        );
        match sqlx::query(&sql).fetch_all(self.store.pool()).await {
            Ok(rows) => {
                for row in rows {
                    let id: String = row.get("id");
                    let name: String = row.get("name");
                    if id.is_empty() || name.is_empty() {
                        continue;
                    }
                    let Some(kind) = DestinationKind::from_code(row.get::<i32, _>("type")) else {
                        continue;
                    };
                    let uri = format!("{}://{}", kind.scheme(), name);
                    let key = format!("{}/{}", kind.prefix(), name);
                    let group = groups.entry(digit_group(&name)).or_default();
                    if group.iter().any(|info| info.name == name) {
                        continue;
                    }
                    group.push(DestinationInfo {
                        id,
                        name,
                        kind,
                        created: row.get("create_time"),
                        uri,
                        data_path: self
                            .config
                            .storage
                            .data
                            .join(&key)
                            .display()
                            .to_string(),
                        subscriptions_count: i64::from(row.get::<i32, _>("subscriptions_count")),
                        messages_count: 0,
                    });
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, sql = %sql, "can't get destinations info");
            }
        }

        let mut infos = Vec::new();
        for (_, mut group) in groups {
            group.sort_by(|l, r| l.name.cmp(&r.name));
            infos.extend(group);
        }
        infos
    }
}

fn digit_group(name: &str) -> usize {
    if name.chars().any(|c| c.is_ascii_digit()) {
        name.len()
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digit_group() {
        assert_eq!(digit_group("orders"), 0);
        assert_eq!(digit_group("q1"), 2);
        assert_eq!(digit_group("queue12"), 7);
    }
}
