//! Common test fixtures: a broker over a throwaway SQLite database.

use std::sync::Arc;

use courier_broker::{
    ClientSession, Delivery, Exchange, StoragePool, SubscribeRequest, SubscriptionMode,
};
use courier_common::{BrokerConfig, ConnectionConfig, DbmsType};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Route broker logs to the test output, honoring `RUST_LOG`.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A running broker bound to a temporary database file.
pub struct TestBroker {
    pub exchange: Arc<Exchange>,
    pub store: Arc<StoragePool>,
    pub config: Arc<BrokerConfig>,
    _dir: tempfile::TempDir,
}

/// Build a broker over a fresh SQLite file with a small worker pool.
pub async fn test_broker() -> TestBroker {
    init_test_logging();
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("broker.db");

    let mut config = BrokerConfig::default();
    config.broker.id = "t".to_string();
    config.threads.subscribers = 2;
    config.storage.message_journal = "t_journal".to_string();
    config.storage.connection = ConnectionConfig {
        dbms_type: DbmsType::SqliteNative,
        url: format!("sqlite://{}?mode=rwc", path.display()),
        max_connections: 8,
        acquire_timeout_secs: 5,
    };
    let config = Arc::new(config);

    let store = Arc::new(
        StoragePool::connect(&config.storage)
            .await
            .expect("storage pool"),
    );
    let exchange = Exchange::new(config.clone(), store.clone())
        .await
        .expect("exchange");

    TestBroker {
        exchange,
        store,
        config,
        _dir: dir,
    }
}

/// A session with a random id for a given client.
pub fn test_session(client_id: &str) -> ClientSession {
    ClientSession::new(Uuid::new_v4().to_string(), client_id)
}

/// A subscribe request wired to a fresh delivery channel.
pub fn subscribe_request(
    destination_uri: &str,
    name: &str,
    session: &ClientSession,
    mode: SubscriptionMode,
) -> (SubscribeRequest, mpsc::UnboundedReceiver<Delivery>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        SubscribeRequest {
            destination_uri: destination_uri.to_string(),
            name: name.to_string(),
            session_id: session.id.clone(),
            client_id: session.client_id.clone(),
            selector: None,
            mode,
            durable: false,
            sink: tx,
        },
        rx,
    )
}

/// Count journal rows for one message id.
pub async fn journal_count(store: &StoragePool, message_id: &str) -> i64 {
    use sqlx::Row;
    let row = sqlx::query("select count(*) as n from t_journal where message_id = $1")
        .bind(message_id)
        .fetch_one(store.pool())
        .await
        .expect("journal count");
    row.get("n")
}

/// Read the journal's outstanding subscriber count for one message.
pub async fn journal_subscribers(store: &StoragePool, message_id: &str) -> Option<i64> {
    use sqlx::Row;
    sqlx::query("select subscribers_count from t_journal where message_id = $1")
        .bind(message_id)
        .fetch_optional(store.pool())
        .await
        .expect("journal subscribers")
        .map(|row| row.get("subscribers_count"))
}
