//! Connection state machine: retry budget, recovery, terminal errors and
//! stall detection, driven by the shared timer on a paused clock.
#![allow(clippy::expect_used, clippy::unwrap_used)]

mod support;

use std::sync::Arc;

use courier_dispatch::{
    Connection, ConnectionState, DispatchError, PermanentError, Priority, TemporaryError,
};
use support::{MockConnectorFactory, address, advance, entry, logical, settle};

fn connection_lost() -> TemporaryError {
    TemporaryError::ConnectionLost("reset by peer".into())
}

fn first(logical: &courier_dispatch::LogicalConnection) -> Arc<Connection> {
    Arc::clone(&logical.connections()[0])
}

#[tokio::test(start_paused = true)]
async fn test_initialize_reaches_alive() {
    let factory = MockConnectorFactory::new();
    let logical = logical(&factory);

    logical
        .initialize(&[address("primary")])
        .await
        .expect("initialise");

    let connection = first(&logical);
    assert_eq!(connection.state(), ConnectionState::Alive);
    assert_eq!(connection.retry_counter(), 0);
    assert!(connection.server_accepts_requests());
    assert!(connection.physical_connection_ok());

    let endpoint = factory.endpoint("primary");
    assert_eq!(endpoint.connects(), 1);
    assert_eq!(endpoint.pings(), 1);
    assert_eq!(connection.statistics().snapshot().messages_received, 1);
}

#[tokio::test(start_paused = true)]
async fn test_alive_connection_pings_on_interval() {
    let factory = MockConnectorFactory::new();
    let logical = logical(&factory);
    logical
        .initialize(&[address("primary")])
        .await
        .expect("initialise");

    let endpoint = factory.endpoint("primary");
    advance(1_050).await;
    assert_eq!(endpoint.pings(), 2);
    advance(1_000).await;
    assert_eq!(endpoint.pings(), 3);
    assert!(first(&logical).is_alive());
    assert_eq!(first(&logical).statistics().snapshot().messages_received, 3);
}

#[tokio::test(start_paused = true)]
async fn test_retry_budget_exhausted_goes_dead() {
    let factory = MockConnectorFactory::new();
    let endpoint = factory.endpoint("primary");
    endpoint.fail_connect(TemporaryError::ConnectionFailed("refused".into()));

    let mut primary = address("primary");
    primary.retries = 2;
    primary.delay_ms = 100;

    let logical = logical(&factory);
    logical
        .initialize(&[primary])
        .await
        .expect("first failure only starts polling");

    let connection = first(&logical);
    assert_eq!(connection.state(), ConnectionState::Polling);
    assert_eq!(connection.retry_counter(), 1);

    advance(50).await;
    assert_eq!(endpoint.connects(), 1, "next attempt is 100ms out");

    advance(100).await;
    assert_eq!(endpoint.connects(), 2);
    assert_eq!(connection.retry_counter(), 2);
    assert!(connection.is_polling());

    advance(100).await;
    assert_eq!(endpoint.connects(), 3);
    assert!(connection.is_dead());
    assert!(logical.is_dead());

    let error = logical
        .send(&[entry(Priority::NORM, "late")])
        .await
        .expect_err("dead connection");
    assert!(error.is_dead(), "{error}");

    // Dead is terminal, no further attempts
    advance(1_000).await;
    assert_eq!(endpoint.connects(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_recovery_resets_retry_counter() {
    let factory = MockConnectorFactory::new();
    let endpoint = factory.endpoint("primary");
    endpoint.fail_connect(connection_lost());

    let logical = logical(&factory);
    logical
        .initialize(&[address("primary")])
        .await
        .expect("initialise");

    let connection = first(&logical);
    advance(150).await;
    assert_eq!(connection.retry_counter(), 2);

    endpoint.heal();
    advance(100).await;
    assert!(connection.is_alive());
    assert_eq!(connection.retry_counter(), 0);
    assert!(connection.snapshot().last_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_authentication_failure_is_terminal() {
    let factory = MockConnectorFactory::new();
    let endpoint = factory.endpoint("primary");
    endpoint.fail_connect(PermanentError::AuthenticationFailed("bad credentials".into()));

    let logical = logical(&factory);
    let error = logical
        .initialize(&[address("primary")])
        .await
        .expect_err("every member is dead");
    assert!(error.is_dead());
    assert!(error.to_string().contains("bad credentials"));

    let connection = first(&logical);
    assert!(connection.is_dead());
    assert_eq!(connection.retry_counter(), 0);

    advance(5_000).await;
    assert_eq!(endpoint.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_send_failure_on_alive_connection_retries_immediately() {
    let factory = MockConnectorFactory::new();
    let endpoint = factory.endpoint("primary");

    let logical = logical(&factory);
    logical
        .initialize(&[address("primary")])
        .await
        .expect("initialise");
    let connection = first(&logical);

    endpoint.push_send(Err(connection_lost().into()));
    let batch = [entry(Priority::NORM, "a"), entry(Priority::NORM, "b")];
    let error = connection.send(&batch).await.expect_err("scripted failure");
    assert!(error.is_temporary());
    assert!(!error.is_dead());
    assert!(batch.iter().all(|e| e.redelivered() == 1));
    assert_eq!(connection.state(), ConnectionState::Polling);
    assert_eq!(connection.retry_counter(), 1);
    assert_eq!(connection.statistics().send_failures(), 1);

    // No delay on the first retry after losing an alive connection
    settle().await;
    advance(1).await;
    assert!(connection.is_alive());
    assert_eq!(endpoint.connects(), 2);

    let receipts = connection.send(&batch).await.expect("send");
    assert_eq!(receipts.len(), 2);
    assert_eq!(batch[0].outcome(), Some(receipts[0].clone()));
    assert_eq!(connection.statistics().messages_sent(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_ping_failure_starts_polling() {
    let factory = MockConnectorFactory::new();
    let endpoint = factory.endpoint("primary");

    let logical = logical(&factory);
    logical
        .initialize(&[address("primary")])
        .await
        .expect("initialise");
    let connection = first(&logical);

    endpoint.fail_ping(TemporaryError::ResponseTimeout("no pong".into()));
    advance(1_050).await;
    assert!(connection.is_polling());
    assert!(logical.is_polling());

    let error = logical
        .send(&[entry(Priority::NORM, "x")])
        .await
        .expect_err("nothing alive");
    assert!(error.is_polling(), "{error}");

    endpoint.heal();
    advance(200).await;
    assert!(connection.is_alive());
    assert!(logical.is_alive());
}

#[tokio::test(start_paused = true)]
async fn test_server_deny_is_retried() {
    let factory = MockConnectorFactory::new();
    let endpoint = factory.endpoint("primary");
    endpoint.push_connect(Err(TemporaryError::ServerStandby("standby".into()).into()));

    let logical = logical(&factory);
    logical
        .initialize(&[address("primary")])
        .await
        .expect("initialise");
    let connection = first(&logical);
    assert!(connection.is_polling());
    assert!(!connection.server_accepts_requests());

    advance(150).await;
    assert!(connection.is_alive());
    assert!(connection.server_accepts_requests());
}

#[tokio::test(start_paused = true)]
async fn test_persistence_recovery_polls_before_connecting() {
    let factory = MockConnectorFactory::new();
    let endpoint = factory.endpoint("primary");

    let mut recovered = address("primary");
    recovered.from_persistence_recovery = true;

    let logical = logical(&factory);
    logical.initialize(&[recovered]).await.expect("initialise");

    let connection = first(&logical);
    assert!(connection.is_polling());
    assert_eq!(endpoint.connects(), 0);

    advance(150).await;
    assert!(connection.is_alive());
    assert_eq!(endpoint.connects(), 1);
    assert_eq!(connection.retry_counter(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_transfer_is_flagged() {
    let factory = MockConnectorFactory::new();
    let endpoint = factory.endpoint("primary");

    let logical = logical(&factory);
    logical
        .initialize(&[address("primary")])
        .await
        .expect("initialise");
    let connection = first(&logical);

    endpoint.hold_sends();
    let sender = {
        let connection = Arc::clone(&connection);
        tokio::spawn(async move { connection.send(&[entry(Priority::NORM, "slow")]).await })
    };
    settle().await;
    assert!(connection.statistics().is_in_progress());

    // No bytes moved since the previous check
    advance(1_050).await;
    assert!(connection.is_stalled());
    assert!(connection.is_alive(), "a stall alone is not a failure");
    let pings = endpoint.pings();

    endpoint.report_progress(512);
    advance(1_000).await;
    assert!(!connection.is_stalled());
    assert_eq!(endpoint.pings(), pings, "progress replaces the ping");

    endpoint.release_sends();
    sender.await.unwrap().expect("send completes");
    assert!(connection.is_alive());
}

#[tokio::test(start_paused = true)]
async fn test_stall_counts_as_failure_when_configured() {
    let factory = MockConnectorFactory::new();
    let endpoint = factory.endpoint("primary");

    let mut strict = address("primary");
    strict.stall_is_failure = true;

    let logical = logical(&factory);
    logical.initialize(&[strict]).await.expect("initialise");
    let connection = first(&logical);

    endpoint.hold_sends();
    let sender = {
        let connection = Arc::clone(&connection);
        tokio::spawn(async move { connection.send(&[entry(Priority::NORM, "slow")]).await })
    };
    settle().await;

    advance(1_050).await;
    assert!(connection.is_polling());
    assert!(connection.retry_counter() >= 1);

    endpoint.release_sends();
    sender.await.unwrap().expect("send completes");
    assert!(connection.is_alive());
}

#[tokio::test(start_paused = true)]
async fn test_dead_connection_rejects_send_without_io() {
    let factory = MockConnectorFactory::new();
    let endpoint = factory.endpoint("primary");

    let logical = logical(&factory);
    logical
        .initialize(&[address("primary")])
        .await
        .expect("initialise");
    let connection = first(&logical);

    endpoint.push_send(Err(PermanentError::Rejected("unknown destination".into()).into()));
    let error: DispatchError = connection
        .send(&[entry(Priority::NORM, "x")])
        .await
        .expect_err("terminal failure");
    assert!(error.is_dead());
    assert!(connection.is_dead());

    let error = connection
        .send(&[entry(Priority::NORM, "y")])
        .await
        .expect_err("dead");
    assert!(error.is_dead());
    assert_eq!(endpoint.sent_batches().len(), 0);
    assert!(connection.ping("").await.is_err());
}
