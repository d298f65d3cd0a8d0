//! Registration retry and manager directives.

mod common;

use common::*;
use delegate_core::message_store::keys;
use delegate_core::{DelegateParams, DelegateRegisterResponse, ManagerError, MessageStore, MessengerType, RegisterAction};
use delegate_daemon::registration::Registrar;
use delegate_daemon::AgentState;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const RETRY_DELAY: Duration = Duration::from_secs(60);
const CALL_TIMEOUT: Duration = Duration::from_secs(15);

struct Setup {
    fake: Arc<FakeManager>,
    state: Arc<AgentState>,
    store: Arc<MessageStore>,
    registrar: Registrar,
    _dir: TempDir,
}

fn setup() -> Setup {
    let dir = TempDir::new().unwrap();
    let fake = FakeManager::new();
    let state = Arc::new(AgentState::new());
    let store = Arc::new(MessageStore::open(dir.path(), MessengerType::Delegate, PROCESS_ID).unwrap());
    let registrar = Registrar::new(
        fake.clone(),
        state.clone(),
        store.clone(),
        RECORD,
        RETRY_DELAY,
        CALL_TIMEOUT,
    );
    Setup {
        fake,
        state,
        store,
        registrar,
        _dir: dir,
    }
}

fn params() -> DelegateParams {
    DelegateParams {
        account_id: ACCOUNT_ID.to_string(),
        host_name: "test-host".to_string(),
        delegate_name: "delegate".to_string(),
        version: "1.0.0".to_string(),
        ..DelegateParams::default()
    }
}

fn refused() -> Result<DelegateRegisterResponse, ManagerError> {
    Err(ManagerError::ConnectionError("connection refused".to_string()))
}

#[tokio::test(start_paused = true)]
async fn test_registration_retries_every_minute_until_success() {
    let s = setup();
    s.fake
        .register_responses
        .lock()
        .extend([refused(), refused(), refused()]);

    let id = s.registrar.register(&params()).await.unwrap();
    assert_eq!(id, DELEGATE_ID);

    let calls = s.fake.register_calls.lock().clone();
    assert_eq!(calls.len(), 4);
    for pair in calls.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(gap >= RETRY_DELAY);
        assert!(gap < RETRY_DELAY + Duration::from_secs(1));
    }
}

#[tokio::test(start_paused = true)]
async fn test_response_without_id_is_retried() {
    let s = setup();
    s.fake
        .register_responses
        .lock()
        .push_back(Ok(DelegateRegisterResponse::default()));

    assert_eq!(s.registrar.register(&params()).await.unwrap(), DELEGATE_ID);
    assert_eq!(s.fake.register_calls.lock().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_self_destruct_action_ends_registration() {
    let s = setup();
    s.fake.register_responses.lock().push_back(Ok(DelegateRegisterResponse {
        action: Some(RegisterAction::SelfDestruct),
        ..DelegateRegisterResponse::default()
    }));

    assert!(s.registrar.register(&params()).await.is_err());
    assert!(s.state.is_self_destructed());
    assert_eq!(s.fake.register_calls.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_token_triggers_self_destruct() {
    let s = setup();
    s.fake
        .register_responses
        .lock()
        .push_back(Err(ManagerError::InvalidToken));

    assert!(s.registrar.register(&params()).await.is_err());
    assert!(s.state.is_self_destructed());
}

#[tokio::test(start_paused = true)]
async fn test_migrate_action_is_recorded() {
    let s = setup();
    s.fake.register_responses.lock().push_back(Ok(DelegateRegisterResponse {
        action: Some(RegisterAction::Migrate),
        migrate_url: Some("https://other-manager/api".to_string()),
        ..DelegateRegisterResponse::default()
    }));

    assert_eq!(s.registrar.register(&params()).await.unwrap(), DELEGATE_ID);
    assert_eq!(
        s.store.get_value(RECORD, keys::MIGRATE).unwrap(),
        Some(Value::from("https://other-manager/api/"))
    );
}

#[tokio::test(start_paused = true)]
async fn test_stop_ends_registration() {
    let s = setup();
    s.fake
        .register_responses
        .lock()
        .extend((0..100).map(|_| refused()));

    let state = s.state.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(90)).await;
        state.stop();
    });

    assert!(s.registrar.register(&params()).await.is_err());
    assert_eq!(s.fake.register_calls.lock().len(), 2);
}
