//! Destinations: per-endpoint message buffer, subscription set,
//! transactional staging, and dispatch.
//!
//! Each destination owns one durable log table supporting ordered
//! append (explicit `seq`), positional cursor reads, and row-level
//! delete by `message_id`. Queue destinations additionally track which
//! subscription a row is assigned to, so a message reaches exactly one
//! competing consumer.

pub mod sender;
pub mod subscription;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use courier_common::{BrokerConfig, BrokerError, BrokerResult};
use sqlx::any::AnyRow;
use sqlx::Row;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::message::{Delivery, Message, Properties};
use crate::selector::Selector;
use crate::session::ClientSession;
use crate::storage::{storage_err, StoragePool, StorageSession};
use crate::uri::{DestinationKind, DestinationUri};

pub use sender::{Sender, SenderRequest};
pub use subscription::{SubscribeRequest, Subscription, SubscriptionMode};

/// How many log rows a dispatch pass scans per subscription.
const DISPATCH_SCAN_LIMIT: i64 = 32;

/// Client that controls a temporary destination's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationOwner {
    pub client_id: String,
}

/// Snapshot of a destination for the admin surface.
#[derive(Debug, Clone)]
pub struct DestinationInfo {
    pub id: String,
    pub name: String,
    pub kind: DestinationKind,
    pub created: String,
    pub uri: String,
    pub data_path: String,
    pub subscriptions_count: i64,
    pub messages_count: i64,
}

/// A message staged inside a client transaction, together with the
/// eligible-subscriber snapshot taken at save time.
#[derive(Debug)]
struct StagedMessage {
    message: Message,
    subscribers_snapshot: i64,
}

#[derive(Debug)]
struct StagedAck {
    message_id: String,
}

/// Per-(session, destination) transaction staging.
#[derive(Debug, Default)]
struct SessionStage {
    messages: Vec<StagedMessage>,
    acks: Vec<StagedAck>,
}

/// Mutable interior of a destination, serialized by one lock.
#[derive(Debug, Default)]
struct DestinationState {
    subscriptions: HashMap<String, Subscription>,
    senders: HashMap<String, Sender>,
    staging: HashMap<String, SessionStage>,
    rr_cursor: usize,
}

/// A queue or topic endpoint.
#[derive(Debug)]
pub struct Destination {
    id: String,
    key: String,
    name: String,
    kind: DestinationKind,
    uri: String,
    created: String,
    owner: Option<DestinationOwner>,
    table: String,
    destinations_table: String,
    journal_table: String,
    store: Arc<StoragePool>,
    config: Arc<BrokerConfig>,
    next_seq: AtomicI64,
    state: Mutex<DestinationState>,
}

impl Destination {
    /// Create or fault in the destination for `uri`.
    ///
    /// The durable log table is created if missing; an existing
    /// destinations row (a cold destination) is adopted, otherwise a
    /// new row is inserted.
    pub(crate) async fn open(
        parsed: &DestinationUri,
        owner: Option<DestinationOwner>,
        store: Arc<StoragePool>,
        config: Arc<BrokerConfig>,
    ) -> BrokerResult<Arc<Destination>> {
        let key = parsed.key();
        let table = log_table_name(&config.broker.id, &key);
        let destinations_table = format!("\"{}_destinations\"", config.broker.id);
        let journal_table = config.storage.message_journal.clone();

        let create_log = format!(
            "create table if not exists \"{table}\" (\
             seq bigint not null primary key\
             ,message_id text not null unique\
             ,priority int not null\
             ,expiration bigint not null\
             ,body_type int not null\
             ,properties text not null\
             ,body text not null\
             ,assigned text\
             )"
        );
        store.do_now(&create_log).await?;

        let select_row = format!(
            "select id, cast(create_time as text) as create_time \
             from {destinations_table} where name = $1 and type = $2"
        );
        let existing = sqlx::query(&select_row)
            .bind(&parsed.name)
            .bind(parsed.kind.code())
            .fetch_optional(store.pool())
            .await
            .map_err(|e| storage_err(e, &select_row))?;

        let (id, created) = match existing {
            Some(row) => (row.get::<String, _>("id"), row.get::<String, _>("create_time")),
            None => {
                let id = Uuid::new_v4().to_string();
                let insert = format!(
                    "insert into {destinations_table} (id, name, type) values ($1, $2, $3)"
                );
                sqlx::query(&insert)
                    .bind(&id)
                    .bind(&parsed.name)
                    .bind(parsed.kind.code())
                    .execute(store.pool())
                    .await
                    .map_err(|e| storage_err(e, &insert))?;
                let row = sqlx::query(&select_row)
                    .bind(&parsed.name)
                    .bind(parsed.kind.code())
                    .fetch_one(store.pool())
                    .await
                    .map_err(|e| storage_err(e, &select_row))?;
                (id, row.get::<String, _>("create_time"))
            }
        };

        let max_seq_sql = format!("select coalesce(max(seq), 0) as seq from \"{table}\"");
        let row = sqlx::query(&max_seq_sql)
            .fetch_one(store.pool())
            .await
            .map_err(|e| storage_err(e, &max_seq_sql))?;
        let max_seq: i64 = row.get("seq");

        let owner = if parsed.kind.is_temporary() { owner } else { None };

        tracing::info!(key = %key, kind = ?parsed.kind, "destination opened");

        Ok(Arc::new(Destination {
            id,
            key,
            name: parsed.name.clone(),
            kind: parsed.kind,
            uri: parsed.uri(),
            created,
            owner,
            table,
            destinations_table,
            journal_table,
            store,
            config,
            next_seq: AtomicI64::new(max_seq),
            state: Mutex::new(DestinationState::default()),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DestinationKind {
        self.kind
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn is_temporary(&self) -> bool {
        self.kind.is_temporary()
    }

    pub fn has_owner(&self) -> bool {
        self.owner.is_some()
    }

    pub fn owner(&self) -> Option<&DestinationOwner> {
        self.owner.as_ref()
    }

    // ─────────────────────────────────────────────────────────────────
    // Save path
    // ─────────────────────────────────────────────────────────────────

    /// Count of subscribers eligible for `message` right now: attached
    /// non-browser subscriptions whose selector matches. Queues cap the
    /// snapshot at one, since a queue message reaches one consumer.
    pub async fn eligible_subscribers(&self, message: &Message) -> i64 {
        let state = self.state.lock().await;
        eligible_count(&state, self.kind, message)
    }

    /// Stage `message` when the session has an open transaction on this
    /// destination. Returns false when the session is not transacted
    /// and the caller should take the durable path.
    pub async fn stage_if_transacted(&self, session: &ClientSession, message: &Message) -> bool {
        let mut state = self.state.lock().await;
        let snapshot = eligible_count(&state, self.kind, message);
        match state.staging.get_mut(&session.id) {
            Some(stage) => {
                stage.messages.push(StagedMessage {
                    message: message.clone(),
                    subscribers_snapshot: snapshot,
                });
                tracing::debug!(key = %self.key, message_id = %message.message_id, "message staged");
                true
            }
            None => false,
        }
    }

    /// Append `message` to the durable log as part of the caller's open
    /// transaction.
    pub async fn save(&self, db: &mut StorageSession, message: &Message) -> BrokerResult<i64> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.insert_log_row(db, seq, message).await?;
        Ok(seq)
    }

    async fn insert_log_row(
        &self,
        db: &mut StorageSession,
        seq: i64,
        message: &Message,
    ) -> BrokerResult<()> {
        let properties = serde_json::to_string(&message.properties)
            .map_err(|e| BrokerError::unknown(e.to_string(), &message.message_id))?;
        let sql = format!(
            "insert into \"{}\" (seq, message_id, priority, expiration, body_type, properties, body) \
             values ($1, $2, $3, $4, $5, $6, $7)",
            self.table
        );
        sqlx::query(&sql)
            .bind(seq)
            .bind(&message.message_id)
            .bind(message.priority)
            .bind(message.expiration_ms)
            .bind(message.body_type)
            .bind(&properties)
            .bind(BASE64.encode(&message.body))
            .execute(db.conn())
            .await
            .map_err(|e| storage_err(e, &sql))?;
        Ok(())
    }

    async fn insert_journal_row(
        &self,
        db: &mut StorageSession,
        message: &Message,
        subscribers: i64,
    ) -> BrokerResult<()> {
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
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────
    // Client transactions
    // ─────────────────────────────────────────────────────────────────

    /// Open a transaction scope for `session` on this destination.
    pub async fn begin(&self, session: &ClientSession) {
        let mut state = self.state.lock().await;
        state.staging.entry(session.id.clone()).or_default();
        tracing::debug!(key = %self.key, session = %session.id, "transaction scope opened");
    }

    /// Commit the session's staged sends and acks.
    ///
    /// Staged messages hit the journal and the durable log atomically,
    /// in send order; nothing staged is observable before this returns.
    pub async fn commit(&self, session: &ClientSession) -> BrokerResult<()> {
        let stage = {
            let mut state = self.state.lock().await;
            state.staging.remove(&session.id)
        };
        let Some(stage) = stage else {
            return Ok(());
        };
        if stage.messages.is_empty() && stage.acks.is_empty() {
            return Ok(());
        }

        let mut db = self.store.session().await?;
        db.begin_tx(format!("commit-{}", session.id)).await?;
        let result = self.commit_stage(&mut db, &stage).await;
        match result {
            Ok(()) => {
                db.commit_tx().await?;
                tracing::debug!(
                    key = %self.key,
                    session = %session.id,
                    messages = stage.messages.len(),
                    acks = stage.acks.len(),
                    "transaction committed"
                );
                Ok(())
            }
            Err(err) => {
                db.rollback_tx().await.ok();
                // put the stage back so the client can retry or abort
                let mut state = self.state.lock().await;
                state.staging.insert(session.id.clone(), stage);
                Err(err)
            }
        }
    }

    async fn commit_stage(&self, db: &mut StorageSession, stage: &SessionStage) -> BrokerResult<()> {
        for staged in &stage.messages {
            self.insert_journal_row(db, &staged.message, staged.subscribers_snapshot)
                .await?;
            let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
            self.insert_log_row(db, seq, &staged.message).await?;
        }
        for ack in &stage.acks {
            self.apply_ack(db, &ack.message_id).await?;
        }
        Ok(())
    }

    /// Discard the session's staged sends and acks without side effects.
    pub async fn abort(&self, session: &ClientSession) {
        let mut state = self.state.lock().await;
        if let Some(stage) = state.staging.remove(&session.id) {
            tracing::debug!(
                key = %self.key,
                session = %session.id,
                messages = stage.messages.len(),
                "transaction aborted"
            );
        }
    }

    // ─────────────────────────────────────────────────────────────────
    // Subscriptions and senders
    // ─────────────────────────────────────────────────────────────────

    /// Register a new subscription or re-attach a durable one.
    pub async fn subscription(&self, request: SubscribeRequest) -> BrokerResult<()> {
        if let Some(owner) = &self.owner {
            if owner.client_id != request.client_id {
                return Err(BrokerError::on_subscription(
                    "this destination was bound to another subscriber",
                    format!("{} : {}", self.name, request.client_id),
                ));
            }
        }

        let selector = match &request.selector {
            Some(text) => Some(Selector::parse(text).map_err(|e| {
                BrokerError::on_subscription(e.to_string(), text.clone())
            })?),
            None => None,
        };

        let mut state = self.state.lock().await;

        if request.mode != SubscriptionMode::Browser {
            let exclusive_held = state.subscriptions.values().any(|s| {
                s.attached && s.mode == SubscriptionMode::Exclusive && s.name != request.name
            });
            if exclusive_held {
                return Err(BrokerError::on_subscription(
                    "destination is held by an exclusive consumer",
                    self.key.clone(),
                ));
            }
            if request.mode == SubscriptionMode::Exclusive {
                let other_consumers = state.subscriptions.values().any(|s| {
                    s.is_active_consumer() && s.name != request.name
                });
                if other_consumers {
                    return Err(BrokerError::on_subscription(
                        "destination already has consumers, exclusive access denied",
                        self.key.clone(),
                    ));
                }
            }
        }

        match state.subscriptions.get_mut(&request.name) {
            Some(existing) if existing.attached => Err(BrokerError::on_subscription(
                "subscription name already in use",
                request.name.clone(),
            )),
            Some(existing) => {
                // durable re-attach: keep the cursor, refresh the rest
                existing.session_id = request.session_id;
                existing.client_id = request.client_id;
                existing.selector = selector;
                existing.mode = request.mode;
                existing.sink = request.sink;
                existing.attached = true;
                tracing::info!(key = %self.key, subscription = %existing.name, "subscription re-attached");
                Ok(())
            }
            None => {
                let cursor = if self.kind.is_queue() || request.mode == SubscriptionMode::Browser {
                    0
                } else {
                    // topics deliver only messages saved after the
                    // subscription existed
                    self.next_seq.load(Ordering::SeqCst)
                };
                let name = request.name.clone();
                state.subscriptions.insert(
                    name.clone(),
                    Subscription {
                        name: name.clone(),
                        session_id: request.session_id,
                        client_id: request.client_id,
                        selector,
                        mode: request.mode,
                        durable: request.durable,
                        cursor,
                        attached: true,
                        sink: request.sink,
                    },
                );
                tracing::info!(key = %self.key, subscription = %name, "subscription created");
                Ok(())
            }
        }
    }

    /// Count of active non-browsing subscriptions, mirrored into the
    /// destinations table by the facade.
    pub async fn subscriptions_true_count(&self) -> i64 {
        let state = self.state.lock().await;
        state
            .subscriptions
            .values()
            .filter(|s| s.is_active_consumer())
            .count() as i64
    }

    /// Detach or remove a consumer; its unacknowledged queue
    /// assignments return to the pool.
    pub async fn remove_consumer(&self, session_id: &str, subscription_name: &str) {
        let removed = {
            let mut state = self.state.lock().await;
            let durable = match state.subscriptions.get(subscription_name) {
                Some(sub) if sub.session_id == session_id || !sub.attached => Some(sub.durable),
                _ => None,
            };
            match durable {
                Some(true) => {
                    if let Some(sub) = state.subscriptions.get_mut(subscription_name) {
                        sub.attached = false;
                    }
                    true
                }
                Some(false) => {
                    state.subscriptions.remove(subscription_name);
                    true
                }
                None => false,
            }
        };
        if removed {
            self.unassign(subscription_name).await;
            tracing::info!(key = %self.key, subscription = %subscription_name, "consumer removed");
        }
    }

    async fn unassign(&self, subscription_name: &str) {
        if !self.kind.is_queue() {
            return;
        }
        let sql = format!(
            "update \"{}\" set assigned = null where assigned = $1",
            self.table
        );
        if let Err(err) = sqlx::query(&sql)
            .bind(subscription_name)
            .execute(self.store.pool())
            .await
        {
            tracing::warn!(key = %self.key, error = %err, "failed to release assignments");
        }
    }

    /// Register a producer.
    pub async fn add_sender(&self, request: &SenderRequest) -> BrokerResult<()> {
        if let Some(owner) = &self.owner {
            if owner.client_id != request.client_id {
                return Err(BrokerError::on_subscription(
                    "this destination was bound to another publisher",
                    format!("{} : {}", self.name, request.client_id),
                ));
            }
        }
        let mut state = self.state.lock().await;
        state
            .senders
            .insert(request.sender_id.clone(), Sender::from_request(request));
        Ok(())
    }

    /// Remove one producer registered by `session`.
    pub async fn remove_sender(&self, session: &ClientSession, sender_id: &str) {
        let mut state = self.state.lock().await;
        let owned = state
            .senders
            .get(sender_id)
            .map(|s| s.session_id == session.id)
            .unwrap_or(false);
        if owned {
            state.senders.remove(sender_id);
        }
    }

    /// Remove a producer by id regardless of destination binding.
    pub async fn remove_sender_by_id(&self, sender_id: &str) {
        let mut state = self.state.lock().await;
        state.senders.remove(sender_id);
    }

    /// Remove every producer registered by `session`.
    pub async fn remove_senders(&self, session: &ClientSession) {
        let mut state = self.state.lock().await;
        state.senders.retain(|_, s| s.session_id != session.id);
    }

    pub async fn senders_count(&self) -> usize {
        self.state.lock().await.senders.len()
    }

    // ─────────────────────────────────────────────────────────────────
    // Acknowledgement
    // ─────────────────────────────────────────────────────────────────

    /// Acknowledge one delivery. Transacted sessions stage the ack
    /// until commit. Browsers never acknowledge.
    pub async fn acknowledge(
        &self,
        session: &ClientSession,
        subscription_name: &str,
        message_id: &str,
    ) -> BrokerResult<()> {
        {
            let mut state = self.state.lock().await;
            match state.subscriptions.get(subscription_name) {
                Some(sub) if sub.mode == SubscriptionMode::Browser => {
                    return Err(BrokerError::invalid_state(format!(
                        "browser subscription '{subscription_name}' can't acknowledge"
                    )));
                }
                Some(_) => {}
                None => {
                    return Err(BrokerError::not_found(
                        "subscription not found",
                        subscription_name,
                    ));
                }
            }
            if let Some(stage) = state.staging.get_mut(&session.id) {
                stage.acks.push(StagedAck {
                    message_id: message_id.to_string(),
                });
                return Ok(());
            }
        }

        let mut db = self.store.session().await?;
        db.begin_tx(format!("ack-{message_id}")).await?;
        match self.apply_ack(&mut db, message_id).await {
            Ok(()) => db.commit_tx().await,
            Err(err) => {
                db.rollback_tx().await.ok();
                Err(err)
            }
        }
    }

    /// Decrement the journal and reap fully-delivered rows.
    async fn apply_ack(&self, db: &mut StorageSession, message_id: &str) -> BrokerResult<()> {
        if self.kind.is_queue() {
            let sql = format!("delete from \"{}\" where message_id = $1", self.table);
            sqlx::query(&sql)
                .bind(message_id)
                .execute(db.conn())
                .await
                .map_err(|e| storage_err(e, &sql))?;
        }

        let update = format!(
            "update {} set subscribers_count = subscribers_count - 1 where message_id = $1",
            self.journal_table
        );
        sqlx::query(&update)
            .bind(message_id)
            .execute(db.conn())
            .await
            .map_err(|e| storage_err(e, &update))?;

        let select = format!(
            "select subscribers_count from {} where message_id = $1",
            self.journal_table
        );
        let remaining: Option<i64> = sqlx::query(&select)
            .bind(message_id)
            .fetch_optional(db.conn())
            .await
            .map_err(|e| storage_err(e, &select))?
            .map(|row| row.get("subscribers_count"));

        if matches!(remaining, Some(n) if n <= 0) {
            let delete = format!("delete from {} where message_id = $1", self.journal_table);
            sqlx::query(&delete)
                .bind(message_id)
                .execute(db.conn())
                .await
                .map_err(|e| storage_err(e, &delete))?;
            if !self.kind.is_queue() {
                let delete_log =
                    format!("delete from \"{}\" where message_id = $1", self.table);
                sqlx::query(&delete_log)
                    .bind(message_id)
                    .execute(db.conn())
                    .await
                    .map_err(|e| storage_err(e, &delete_log))?;
            }
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────
    // Dispatch
    // ─────────────────────────────────────────────────────────────────

    /// Attempt to advance every subscription by at most one message.
    /// Returns true when any dispatch occurred, so the worker knows to
    /// loop. Storage errors are logged and reported as no progress.
    pub async fn get_next_message_for_all_subscriptions(&self) -> bool {
        let mut state = self.state.lock().await;
        let now_ms = Utc::now().timestamp_millis();
        match self.dispatch_pass(&mut state, now_ms).await {
            Ok(progressed) => progressed,
            Err(err) => {
                tracing::warn!(key = %self.key, error = %err, "dispatch pass failed");
                false
            }
        }
    }

    async fn dispatch_pass(
        &self,
        state: &mut DestinationState,
        now_ms: i64,
    ) -> BrokerResult<bool> {
        let mut progressed = false;
        if self.kind.is_queue() {
            progressed |= self.dispatch_queue(state, now_ms).await?;
        } else {
            progressed |= self.dispatch_topic(state, now_ms).await?;
        }
        progressed |= self.dispatch_browsers(state, now_ms).await?;
        Ok(progressed)
    }

    /// Queue dispatch: exclusive consumers preempt, shared consumers
    /// compete round-robin, each row reaches exactly one of them.
    async fn dispatch_queue(
        &self,
        state: &mut DestinationState,
        now_ms: i64,
    ) -> BrokerResult<bool> {
        let mut shared = Vec::new();
        let mut exclusive = Vec::new();
        for sub in state.subscriptions.values() {
            if !sub.is_active_consumer() {
                continue;
            }
            match sub.mode {
                SubscriptionMode::Exclusive => exclusive.push(sub.name.clone()),
                _ => shared.push(sub.name.clone()),
            }
        }
        exclusive.sort();
        shared.sort();
        let order = if exclusive.is_empty() { shared } else { exclusive };
        if order.is_empty() {
            return Ok(false);
        }

        let mut progressed = false;
        let len = order.len();
        let start = state.rr_cursor;
        for i in 0..len {
            let idx = (start + i) % len;
            if self.dispatch_queue_one(state, &order[idx], now_ms).await? {
                progressed = true;
                state.rr_cursor = idx + 1;
            }
        }
        Ok(progressed)
    }

    async fn dispatch_queue_one(
        &self,
        state: &mut DestinationState,
        name: &str,
        now_ms: i64,
    ) -> BrokerResult<bool> {
        let sql = format!(
            "select seq, message_id, priority, expiration, body_type, properties, body \
             from \"{}\" where assigned is null order by seq limit {DISPATCH_SCAN_LIMIT}",
            self.table
        );
        let rows = sqlx::query(&sql)
            .fetch_all(self.store.pool())
            .await
            .map_err(|e| storage_err(e, &sql))?;

        for row in rows {
            let (seq, message) = self.message_from_row(&row)?;
            if message.is_expired_at(now_ms) {
                self.discard_expired(&message.message_id).await?;
                continue;
            }
            let Some(sub) = state.subscriptions.get(name) else {
                return Ok(false);
            };
            if !sub.selects(&message.properties) {
                continue;
            }

            let assign = format!(
                "update \"{}\" set assigned = $1 where seq = $2 and assigned is null",
                self.table
            );
            let claimed = sqlx::query(&assign)
                .bind(name)
                .bind(seq)
                .execute(self.store.pool())
                .await
                .map_err(|e| storage_err(e, &assign))?;
            if claimed.rows_affected() == 0 {
                // another worker claimed the row between scan and update
                continue;
            }

            let message_id = message.message_id.clone();
            let delivery = Delivery {
                destination_key: self.key.clone(),
                subscription: name.to_string(),
                seq,
                message,
            };
            if sub.push(delivery) {
                tracing::debug!(key = %self.key, subscription = %name, message_id = %message_id, "queue dispatch");
                return Ok(true);
            }
            // consumer went away: release the row and detach
            let release = format!(
                "update \"{}\" set assigned = null where seq = $1",
                self.table
            );
            sqlx::query(&release)
                .bind(seq)
                .execute(self.store.pool())
                .await
                .map_err(|e| storage_err(e, &release))?;
            detach_consumer(state, name);
            return Ok(false);
        }
        Ok(false)
    }

    /// Topic dispatch: every subscription has its own cursor and sees
    /// each matching message once.
    async fn dispatch_topic(
        &self,
        state: &mut DestinationState,
        now_ms: i64,
    ) -> BrokerResult<bool> {
        let names: Vec<String> = state
            .subscriptions
            .values()
            .filter(|s| s.is_active_consumer())
            .map(|s| s.name.clone())
            .collect();

        let mut progressed = false;
        for name in names {
            let cursor = match state.subscriptions.get(&name) {
                Some(sub) => sub.cursor,
                None => continue,
            };
            let sql = format!(
                "select seq, message_id, priority, expiration, body_type, properties, body \
                 from \"{}\" where seq > $1 order by seq limit {DISPATCH_SCAN_LIMIT}",
                self.table
            );
            let rows = sqlx::query(&sql)
                .bind(cursor)
                .fetch_all(self.store.pool())
                .await
                .map_err(|e| storage_err(e, &sql))?;

            for row in rows {
                let (seq, message) = self.message_from_row(&row)?;
                if message.is_expired_at(now_ms) {
                    self.discard_expired(&message.message_id).await?;
                    advance_cursor(state, &name, seq);
                    continue;
                }
                let Some(sub) = state.subscriptions.get_mut(&name) else {
                    break;
                };
                if !sub.selects(&message.properties) {
                    sub.cursor = seq;
                    continue;
                }
                let message_id = message.message_id.clone();
                let delivery = Delivery {
                    destination_key: self.key.clone(),
                    subscription: name.clone(),
                    seq,
                    message,
                };
                if sub.push(delivery) {
                    sub.cursor = seq;
                    progressed = true;
                    tracing::debug!(key = %self.key, subscription = %name, message_id = %message_id, "topic dispatch");
                } else {
                    detach_consumer(state, &name);
                }
                break;
            }
        }
        Ok(progressed)
    }

    /// Browsers iterate the durable log read-only, one row per pass.
    async fn dispatch_browsers(
        &self,
        state: &mut DestinationState,
        now_ms: i64,
    ) -> BrokerResult<bool> {
        let names: Vec<String> = state
            .subscriptions
            .values()
            .filter(|s| s.attached && s.mode == SubscriptionMode::Browser)
            .map(|s| s.name.clone())
            .collect();

        let mut progressed = false;
        for name in names {
            let cursor = match state.subscriptions.get(&name) {
                Some(sub) => sub.cursor,
                None => continue,
            };
            let sql = format!(
                "select seq, message_id, priority, expiration, body_type, properties, body \
                 from \"{}\" where seq > $1 order by seq limit {DISPATCH_SCAN_LIMIT}",
                self.table
            );
            let rows = sqlx::query(&sql)
                .bind(cursor)
                .fetch_all(self.store.pool())
                .await
                .map_err(|e| storage_err(e, &sql))?;

            for row in rows {
                let (seq, message) = self.message_from_row(&row)?;
                let Some(sub) = state.subscriptions.get_mut(&name) else {
                    break;
                };
                if message.is_expired_at(now_ms) || !sub.selects(&message.properties) {
                    sub.cursor = seq;
                    continue;
                }
                let delivery = Delivery {
                    destination_key: self.key.clone(),
                    subscription: name.clone(),
                    seq,
                    message,
                };
                if sub.push(delivery) {
                    sub.cursor = seq;
                    progressed = true;
                } else {
                    detach_consumer(state, &name);
                }
                break;
            }
        }
        Ok(progressed)
    }

    /// Remove an expired message from the log and the journal.
    async fn discard_expired(&self, message_id: &str) -> BrokerResult<()> {
        let delete_log = format!("delete from \"{}\" where message_id = $1", self.table);
        sqlx::query(&delete_log)
            .bind(message_id)
            .execute(self.store.pool())
            .await
            .map_err(|e| storage_err(e, &delete_log))?;
        let delete_journal = format!(
            "delete from {} where message_id = $1",
            self.journal_table
        );
        sqlx::query(&delete_journal)
            .bind(message_id)
            .execute(self.store.pool())
            .await
            .map_err(|e| storage_err(e, &delete_journal))?;
        tracing::debug!(key = %self.key, message_id = %message_id, "expired message discarded");
        Ok(())
    }

    fn message_from_row(&self, row: &AnyRow) -> BrokerResult<(i64, Message)> {
        let seq: i64 = row.get("seq");
        let message_id: String = row.get("message_id");
        let properties_json: String = row.get("properties");
        let properties: Properties = serde_json::from_str(&properties_json)
            .map_err(|e| BrokerError::unknown(e.to_string(), &message_id))?;
        let body_text: String = row.get("body");
        let body = BASE64
            .decode(body_text.as_bytes())
            .map_err(|e| BrokerError::unknown(e.to_string(), &message_id))?;
        Ok((
            seq,
            Message {
                message_id,
                destination_uri: self.uri.clone(),
                body_type: row.get("body_type"),
                priority: row.get("priority"),
                expiration_ms: row.get("expiration"),
                properties,
                body,
            },
        ))
    }

    // ─────────────────────────────────────────────────────────────────
    // Introspection and teardown
    // ─────────────────────────────────────────────────────────────────

    /// Snapshot of the destination for the admin surface.
    pub async fn info(&self) -> DestinationInfo {
        let subscriptions_count = self.subscriptions_true_count().await;
        let count_sql = format!("select count(*) as n from \"{}\"", self.table);
        let messages_count = match sqlx::query(&count_sql).fetch_one(self.store.pool()).await {
            Ok(row) => row.get::<i64, _>("n"),
            Err(err) => {
                tracing::warn!(key = %self.key, error = %err, "can't count messages");
                0
            }
        };
        DestinationInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            kind: self.kind,
            created: self.created.clone(),
            uri: self.uri.clone(),
            data_path: self
                .config
                .storage
                .data
                .join(&self.key)
                .display()
                .to_string(),
            subscriptions_count,
            messages_count,
        }
    }

    /// Remove this destination's durable footprint: log table,
    /// registry row, and outstanding journal rows.
    pub(crate) async fn purge(&self) -> BrokerResult<()> {
        let drop_log = format!("drop table if exists \"{}\"", self.table);
        self.store.do_now(&drop_log).await?;
        let delete_row = format!("delete from {} where id = $1", self.destinations_table);
        sqlx::query(&delete_row)
            .bind(&self.id)
            .execute(self.store.pool())
            .await
            .map_err(|e| storage_err(e, &delete_row))?;
        let delete_journal = format!("delete from {} where uri = $1", self.journal_table);
        sqlx::query(&delete_journal)
            .bind(&self.uri)
            .execute(self.store.pool())
            .await
            .map_err(|e| storage_err(e, &delete_journal))?;
        tracing::info!(key = %self.key, "destination purged");
        Ok(())
    }
}

/// Eligible-subscriber snapshot for a message: attached non-browser
/// subscriptions whose selector matches; queues cap at one.
fn eligible_count(state: &DestinationState, kind: DestinationKind, message: &Message) -> i64 {
    let matching = state
        .subscriptions
        .values()
        .filter(|s| s.is_active_consumer() && s.selects(&message.properties))
        .count() as i64;
    if kind.is_queue() {
        matching.min(1)
    } else {
        matching
    }
}

fn advance_cursor(state: &mut DestinationState, name: &str, seq: i64) {
    if let Some(sub) = state.subscriptions.get_mut(name) {
        sub.cursor = seq;
    }
}

/// Drop a consumer whose receiving half disappeared.
fn detach_consumer(state: &mut DestinationState, name: &str) {
    let durable = match state.subscriptions.get(name) {
        Some(sub) => sub.durable,
        None => return,
    };
    if durable {
        if let Some(sub) = state.subscriptions.get_mut(name) {
            sub.attached = false;
        }
    } else {
        state.subscriptions.remove(name);
    }
    tracing::debug!(subscription = %name, "consumer channel closed, detached");
}

/// Log table name scoped by broker id; key separators and any exotic
/// characters collapse to underscores.
fn log_table_name(broker_id: &str, key: &str) -> String {
    let sanitized: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{broker_id}_{sanitized}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_common::{ConnectionConfig, DbmsType};
    use tokio::sync::mpsc;

    async fn test_destination(
        dir: &tempfile::TempDir,
        uri: &str,
        owner: Option<DestinationOwner>,
    ) -> (Arc<Destination>, Arc<StoragePool>, Arc<BrokerConfig>) {
        let path = dir.path().join("dest.db");
        let mut config = BrokerConfig::default();
        config.broker.id = "t".to_string();
        config.storage.message_journal = "t_journal".to_string();
        config.storage.connection = ConnectionConfig {
            dbms_type: DbmsType::SqliteNative,
            url: format!("sqlite://{}?mode=rwc", path.display()),
            max_connections: 4,
            acquire_timeout_secs: 5,
        };
        let config = Arc::new(config);
        let store = Arc::new(StoragePool::connect(&config.storage).await.unwrap());
        store
            .do_now(
                "create table if not exists \"t_destinations\" (\
                 id text not null primary key\
                 ,name text not null\
                 ,type int not null\
                 ,create_time timestamp not null default current_timestamp\
                 ,subscriptions_count int not null default 0\
                 ,constraint \"t_destinations_index\" unique (name, type))",
            )
            .await
            .unwrap();
        store
            .do_now(
                "create table if not exists t_journal (\
                 message_id text not null primary key\
                 ,uri text not null\
                 ,body_type int\
                 ,subscribers_count int not null default 0)",
            )
            .await
            .unwrap();
        let parsed = DestinationUri::parse(uri).unwrap();
        let dest = Destination::open(&parsed, owner, store.clone(), config.clone())
            .await
            .unwrap();
        (dest, store, config)
    }

    fn subscribe_request(name: &str, mode: SubscriptionMode) -> (SubscribeRequest, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            SubscribeRequest {
                destination_uri: String::new(),
                name: name.to_string(),
                session_id: "s1".to_string(),
                client_id: "c1".to_string(),
                selector: None,
                mode,
                durable: false,
                sink: tx,
            },
            rx,
        )
    }

    async fn save_direct(dest: &Destination, store: &StoragePool, message: &Message) {
        let subscribers = dest.eligible_subscribers(message).await;
        let mut db = store.session().await.unwrap();
        db.begin_tx(message.message_id.clone()).await.unwrap();
        dest.insert_journal_row(&mut db, message, subscribers)
            .await
            .unwrap();
        dest.save(&mut db, message).await.unwrap();
        db.commit_tx().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_adopts_existing_row() {
        let dir = tempfile::tempdir().unwrap();
        let (dest, store, config) = test_destination(&dir, "queue://orders", None).await;
        let parsed = DestinationUri::parse("queue://orders").unwrap();
        let again = Destination::open(&parsed, None, store.clone(), config.clone())
            .await
            .unwrap();
        assert_eq!(dest.id(), again.id());
    }

    #[tokio::test]
    async fn test_queue_delivers_to_single_consumer() {
        let dir = tempfile::tempdir().unwrap();
        let (dest, store, _config) = test_destination(&dir, "queue://q", None).await;
        let (req_a, mut rx_a) = subscribe_request("a", SubscriptionMode::Shared);
        let (req_b, mut rx_b) = subscribe_request("b", SubscriptionMode::Shared);
        dest.subscription(req_a).await.unwrap();
        dest.subscription(req_b).await.unwrap();

        let message = Message::new("m1", "queue://q");
        save_direct(&dest, &store, &message).await;

        assert!(dest.get_next_message_for_all_subscriptions().await);
        let got_a = rx_a.try_recv().is_ok();
        let got_b = rx_b.try_recv().is_ok();
        assert!(got_a ^ got_b, "exactly one consumer receives a queue message");

        // second pass: nothing left to dispatch
        assert!(!dest.get_next_message_for_all_subscriptions().await);
    }

    #[tokio::test]
    async fn test_topic_fans_out_and_selector_filters() {
        let dir = tempfile::tempdir().unwrap();
        let (dest, store, _config) = test_destination(&dir, "topic://t", None).await;
        let (mut req_a, mut rx_a) = subscribe_request("a", SubscriptionMode::Shared);
        req_a.selector = Some("price > 10".to_string());
        let (req_b, mut rx_b) = subscribe_request("b", SubscriptionMode::Shared);
        dest.subscription(req_a).await.unwrap();
        dest.subscription(req_b).await.unwrap();

        // no price property: selector is UNKNOWN, sub a excluded
        let message = Message::new("m1", "topic://t");
        assert_eq!(dest.eligible_subscribers(&message).await, 1);
        save_direct(&dest, &store, &message).await;

        assert!(dest.get_next_message_for_all_subscriptions().await);
        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap().message.message_id, "m1");
    }

    #[tokio::test]
    async fn test_staging_is_invisible_until_commit() {
        let dir = tempfile::tempdir().unwrap();
        let (dest, _store, _config) = test_destination(&dir, "queue://q", None).await;
        let session = ClientSession::new("s1", "c1");
        let (req, mut rx) = subscribe_request("a", SubscriptionMode::Shared);
        dest.subscription(req).await.unwrap();

        dest.begin(&session).await;
        let m1 = Message::new("m1", "queue://q");
        let m2 = Message::new("m2", "queue://q");
        assert!(dest.stage_if_transacted(&session, &m1).await);
        assert!(dest.stage_if_transacted(&session, &m2).await);

        assert!(!dest.get_next_message_for_all_subscriptions().await);
        assert!(rx.try_recv().is_err());

        dest.commit(&session).await.unwrap();
        assert!(dest.get_next_message_for_all_subscriptions().await);
        assert_eq!(rx.try_recv().unwrap().message.message_id, "m1");
        assert!(dest.get_next_message_for_all_subscriptions().await);
        assert_eq!(rx.try_recv().unwrap().message.message_id, "m2");
    }

    #[tokio::test]
    async fn test_abort_discards_staged_messages() {
        let dir = tempfile::tempdir().unwrap();
        let (dest, store, _config) = test_destination(&dir, "queue://q", None).await;
        let session = ClientSession::new("s1", "c1");
        dest.begin(&session).await;
        let m1 = Message::new("m1", "queue://q");
        assert!(dest.stage_if_transacted(&session, &m1).await);
        dest.abort(&session).await;

        let row = sqlx::query("select count(*) as n from t_journal")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(row.get::<i64, _>("n"), 0);
        assert!(!dest.stage_if_transacted(&session, &m1).await);
    }

    #[tokio::test]
    async fn test_owner_binding_rejects_other_clients() {
        let dir = tempfile::tempdir().unwrap();
        let owner = DestinationOwner {
            client_id: "c1".to_string(),
        };
        let (dest, _store, _config) =
            test_destination(&dir, "temp-queue://x", Some(owner)).await;

        let (mut req, _rx) = subscribe_request("a", SubscriptionMode::Shared);
        req.client_id = "c2".to_string();
        let err = dest.subscription(req).await.unwrap_err();
        assert_eq!(err.kind(), courier_common::ErrorKind::OnSubscription);

        let (req, _rx) = subscribe_request("a", SubscriptionMode::Shared);
        dest.subscription(req).await.unwrap();
    }

    #[tokio::test]
    async fn test_exclusive_consumer_blocks_others() {
        let dir = tempfile::tempdir().unwrap();
        let (dest, _store, _config) = test_destination(&dir, "queue://q", None).await;
        let (req, _rx) = subscribe_request("boss", SubscriptionMode::Exclusive);
        dest.subscription(req).await.unwrap();

        let (req2, _rx2) = subscribe_request("worker", SubscriptionMode::Shared);
        let err = dest.subscription(req2).await.unwrap_err();
        assert_eq!(err.kind(), courier_common::ErrorKind::OnSubscription);
    }

    #[tokio::test]
    async fn test_browser_does_not_consume() {
        let dir = tempfile::tempdir().unwrap();
        let (dest, store, _config) = test_destination(&dir, "queue://q", None).await;
        let (req, mut rx_browser) = subscribe_request("peek", SubscriptionMode::Browser);
        dest.subscription(req).await.unwrap();

        let message = Message::new("m1", "queue://q");
        save_direct(&dest, &store, &message).await;

        assert!(dest.get_next_message_for_all_subscriptions().await);
        assert_eq!(rx_browser.try_recv().unwrap().message.message_id, "m1");

        // the row is still unassigned and a real consumer still gets it
        let (req, mut rx) = subscribe_request("real", SubscriptionMode::Shared);
        dest.subscription(req).await.unwrap();
        assert!(dest.get_next_message_for_all_subscriptions().await);
        assert_eq!(rx.try_recv().unwrap().message.message_id, "m1");
    }

    #[tokio::test]
    async fn test_ack_deletes_journal_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let (dest, store, _config) = test_destination(&dir, "queue://q", None).await;
        let session = ClientSession::new("s1", "c1");
        let (req, mut rx) = subscribe_request("a", SubscriptionMode::Shared);
        dest.subscription(req).await.unwrap();

        let message = Message::new("m1", "queue://q");
        save_direct(&dest, &store, &message).await;
        assert!(dest.get_next_message_for_all_subscriptions().await);
        let delivery = rx.try_recv().unwrap();

        dest.acknowledge(&session, "a", &delivery.message.message_id)
            .await
            .unwrap();
        let row = sqlx::query("select count(*) as n from t_journal")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(row.get::<i64, _>("n"), 0);
    }

    #[tokio::test]
    async fn test_info_counts() {
        let dir = tempfile::tempdir().unwrap();
        let (dest, store, _config) = test_destination(&dir, "queue://orders", None).await;
        let (req, _rx) = subscribe_request("a", SubscriptionMode::Shared);
        dest.subscription(req).await.unwrap();
        save_direct(&dest, &store, &Message::new("m1", "queue://orders")).await;

        let info = dest.info().await;
        assert_eq!(info.name, "orders");
        assert_eq!(info.kind, DestinationKind::Queue);
        assert_eq!(info.uri, "queue://orders");
        assert_eq!(info.subscriptions_count, 1);
        assert_eq!(info.messages_count, 1);
    }
}
