
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use setup::{DEFAULT_TIMEOUT, TestTablet, serve, serving_tablet, serving_tablet_with, wait_for};
use tabletserver::backend::StreamChunk;
use tabletserver::memory::{MemoryEngine, Response};
use tabletserver::types::{Field, FieldType, Query, QueryResult, SessionParams, Value};
use tabletserver::{
    BackendError,
    ErrorKind,
    Interrupt,
    QueryService,
    ServingState,
    TabletConfig,
    TabletError,
};

fn fields() -> Vec<Field> {
    vec![
        Field::new("id", FieldType::Int),
        Field::new("name", FieldType::Text),
    ]
}

#[tokio::test]
async fn test_requests_rejected_when_not_serving() {
    logutil::init_test();
    let engine = MemoryEngine::new();
    let service = QueryService::new(TabletConfig::default(), Arc::new(engine.clone()));
    assert_eq!(ServingState::NotServing, service.state());

    let err = service.execute(&Query::new(1, "select 1")).await.unwrap_err();
    assert_eq!(ErrorKind::Retry, err.kind());
    assert!(err.message().contains("NOT_SERVING"), "{err}");

    let err = service.begin(1).await.unwrap_err();
    assert_eq!(ErrorKind::Retry, err.kind());

    let err = service.get_session_id(&setup::session_params()).unwrap_err();
    assert_eq!(ErrorKind::Retry, err.kind());

    assert_eq!(0, service.in_flight());
    assert!(engine.executed().is_empty());
}

#[tokio::test]
async fn test_session_changes_between_activations() {
    let TestTablet {
        service,
        engine,
        session_id,
    } = serving_tablet().await;

    service
        .execute(&Query::new(session_id, "select 1"))
        .await
        .unwrap();

    let err = service
        .execute(&Query::new(session_id + 1, "select 1"))
        .await
        .unwrap_err();
    assert_eq!(ErrorKind::Retry, err.kind());
    assert!(err.message().starts_with("Invalid session Id"), "{err}");

    service.disallow_queries().await;
    assert_eq!(ServingState::NotServing, service.state());
    assert_eq!(0, service.in_flight());

    let TestTablet {
        service,
        session_id: next_session_id,
        ..
    } = serve(service, engine.clone()).await;
    assert_ne!(session_id, next_session_id);

    // Clients of the previous activation must re-resolve.
    let err = service
        .execute(&Query::new(session_id, "select 1"))
        .await
        .unwrap_err();
    assert_eq!(ErrorKind::Retry, err.kind());
    assert_eq!(2, engine.opened());
    assert_eq!(1, engine.closed());
}

#[tokio::test]
async fn test_get_session_id_checks_target() {
    let TestTablet {
        service,
        session_id,
        ..
    } = serving_tablet().await;

    let params = |keyspace: &str, shard: &str| SessionParams {
        keyspace: keyspace.to_string(),
        shard: shard.to_string(),
    };

    assert_eq!(
        session_id,
        service.get_session_id(&params("test_keyspace", "80-C0")).unwrap()
    );

    let err = service
        .get_session_id(&params("test_keyspace", "c0-"))
        .unwrap_err();
    assert_eq!(ErrorKind::Fatal, err.kind());
    assert!(err.message().starts_with("Shard mismatch"), "{err}");

    let err = service
        .get_session_id(&params("other_keyspace", "80-c0"))
        .unwrap_err();
    assert_eq!(ErrorKind::Fatal, err.kind());
    assert!(err.message().starts_with("Keyspace mismatch"), "{err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_starts_activate_once() {
    logutil::init_test();
    let engine = MemoryEngine::new();
    let service = Arc::new(QueryService::new(
        TabletConfig::default(),
        Arc::new(engine.clone()),
    ));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let service = service.clone();
            tokio::spawn(async move { service.allow_queries(&setup::db_config(), &[]).await })
        })
        .collect();

    let mut started = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(()) => started += 1,
            Err(e) => assert_eq!(ErrorKind::Fatal, e.kind(), "{e}"),
        }
    }

    assert!(started >= 1);
    assert_eq!(1, engine.opened());
    assert_eq!(ServingState::Serving, service.state());

    let session_id = service.get_session_id(&setup::session_params()).unwrap();
    assert_ne!(0, session_id);
}

#[tokio::test]
async fn test_start_failure_is_not_serving() {
    logutil::init_test();
    let engine = MemoryEngine::new();
    let service = QueryService::new(TabletConfig::default(), Arc::new(engine.clone()));

    engine.panic_on_open(true);
    let err = service
        .allow_queries(&setup::db_config(), &[])
        .await
        .unwrap_err();
    assert_eq!(ErrorKind::Fatal, err.kind());
    assert_eq!(ServingState::NotServing, service.state());
    assert_eq!(1, engine.closed());

    engine.panic_on_open(false);
    engine.fail_probe(Some(BackendError::Connection("refused".to_string())));
    let err = service
        .allow_queries(&setup::db_config(), &[])
        .await
        .unwrap_err();
    assert_eq!(ErrorKind::Fatal, err.kind());
    assert_eq!(ServingState::NotServing, service.state());
    assert_eq!(0, engine.opened());
}

#[tokio::test]
async fn test_cancelled_start_completes() {
    logutil::init_test();
    let engine = MemoryEngine::new();
    engine.delay_probe(Duration::from_millis(50));
    let service = Arc::new(QueryService::new(
        TabletConfig::default(),
        Arc::new(engine.clone()),
    ));

    let cancelled = tokio::time::timeout(
        Duration::from_millis(5),
        service.allow_queries(&setup::db_config(), &[]),
    )
    .await;
    assert!(cancelled.is_err());
    assert_eq!(ServingState::Initializing, service.state());

    wait_for(|| service.state() == ServingState::Serving).await;
    service
        .allow_queries(&setup::db_config(), &[])
        .await
        .unwrap();
    assert_eq!(1, engine.opened());

    let session_id = service.get_session_id(&setup::session_params()).unwrap();
    service
        .execute(&Query::new(session_id, "select 1"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_cancelled_drain_completes() {
    let TestTablet {
        service,
        engine,
        session_id,
    } = serving_tablet().await;
    let tx_id = service.begin(session_id).await.unwrap();

    let cancelled =
        tokio::time::timeout(Duration::from_millis(5), service.disallow_queries()).await;
    assert!(cancelled.is_err());
    assert_eq!(ServingState::ShuttingDownTx, service.state());

    service.commit(session_id, tx_id).await.unwrap();
    wait_for(|| service.state() == ServingState::NotServing).await;
    assert_eq!(1, engine.closed());
    assert_eq!(0, service.in_flight());

    let TestTablet {
        service,
        session_id: next_session_id,
        ..
    } = serve(service, engine.clone()).await;
    assert_ne!(session_id, next_session_id);
    assert_eq!(ServingState::Serving, service.state());
    assert_eq!(2, engine.opened());
}

#[tokio::test]
async fn test_begin_commit_rollback() {
    let TestTablet {
        service,
        engine,
        session_id,
    } = serving_tablet().await;

    let tx_id = service.begin(session_id).await.unwrap();
    assert_ne!(0, tx_id);

    service
        .execute(&Query::new(session_id, "insert into t values (1)").in_transaction(tx_id))
        .await
        .unwrap();
    service.commit(session_id, tx_id).await.unwrap();
    assert_eq!(1, engine.commits());
    assert_eq!(
        vec![format!("[{tx_id}] insert into t values (1)")],
        engine.executed()
    );

    // The transaction is gone once committed.
    let err = service.commit(session_id, tx_id).await.unwrap_err();
    assert_eq!(ErrorKind::Fail, err.kind());
    let err = service
        .execute(&Query::new(session_id, "select 1").in_transaction(tx_id))
        .await
        .unwrap_err();
    assert_eq!(ErrorKind::Fail, err.kind());

    let tx_id = service.begin(session_id).await.unwrap();
    service.rollback(session_id, tx_id).await.unwrap();
    assert_eq!(1, engine.rollbacks());
    assert_eq!(0, engine.open_transactions());

    let stats = service.stats();
    assert_eq!(2, stats.timings["BEGIN"].count);
    assert_eq!(1, stats.timings["COMMIT"].count);
    assert_eq!(1, stats.timings["ROLLBACK"].count);
}

#[tokio::test]
async fn test_begin_tx_pool_full() {
    let config = TabletConfig::default().with_tx_pool_timeout(Duration::from_millis(20));
    let TestTablet {
        service,
        session_id,
        ..
    } = serving_tablet_with(config, MemoryEngine::with_tx_capacity(1)).await;

    let tx_id = service.begin(session_id).await.unwrap();
    let err = service.begin(session_id).await.unwrap_err();
    assert_eq!(ErrorKind::TxPoolFull, err.kind());
    assert!(err.kind().is_retryable());

    service.rollback(session_id, tx_id).await.unwrap();
    service.begin(session_id).await.unwrap();
    assert_eq!(1, service.stats().errors["TxPoolFull"]);
}

#[tokio::test]
async fn test_execute_normalizes_query() {
    let TestTablet {
        service,
        engine,
        session_id,
    } = serving_tablet().await;

    let expected = QueryResult {
        fields: fields(),
        rows_affected: 1,
        insert_id: 0,
        rows: vec![vec![Value::Int(1), Value::from("a")]],
    };
    engine.on_query("select id, name from t", Response::Result(expected.clone()));

    let result = service
        .execute(&Query::new(session_id, "select id, name from t ;\n"))
        .await
        .unwrap();
    assert_eq!(expected, result);
    assert_eq!(vec!["select id, name from t"], engine.executed());
    assert_eq!(1, service.stats().timings["SELECT"].count);
}

#[tokio::test]
async fn test_execute_errors_carry_context() {
    let TestTablet {
        service,
        engine,
        session_id,
    } = serving_tablet().await;

    engine.on_query(
        "insert into t values (1)",
        Response::Error(BackendError::Sql {
            code: 1062,
            message: "Duplicate entry '1' for key 'PRIMARY'".to_string(),
        }),
    );

    let err = service
        .execute(&Query::new(session_id, "insert into t values (1)"))
        .await
        .unwrap_err();
    assert_eq!(ErrorKind::Fail, err.kind());
    assert!(err.is_dup_entry());
    assert!(
        err.message().contains("insert into t values (1)"),
        "{err}"
    );
}

#[tokio::test]
async fn test_execute_panic_is_contained() {
    let TestTablet {
        service,
        engine,
        session_id,
    } = serving_tablet().await;
    engine.on_query("select boom", Response::Panic("boom".to_string()));

    let err = service
        .execute(&Query::new(session_id, "select boom"))
        .await
        .unwrap_err();
    assert_eq!(ErrorKind::Fail, err.kind());
    assert!(err.message().starts_with("boom: uncaught panic"), "{err}");

    assert_eq!(0, service.in_flight());
    assert_eq!(0, engine.conns_in_use());
    assert_eq!(ServingState::Serving, service.state());
    assert_eq!(1, service.stats().panics);

    // Still serving.
    service
        .execute(&Query::new(session_id, "select 1"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_execute_timeout_releases_connection() {
    let config = TabletConfig::default().with_query_timeout(Duration::from_millis(20));
    let TestTablet {
        service,
        engine,
        session_id,
    } = serving_tablet_with(config, MemoryEngine::new()).await;
    engine.on_query("select sleep(100)", Response::Hang);

    let err = service
        .execute(&Query::new(session_id, "select sleep(100)"))
        .await
        .unwrap_err();
    assert_eq!(ErrorKind::Fail, err.kind());
    assert!(err.message().contains("timed out"), "{err}");
    assert_eq!(0, engine.conns_in_use());
    assert_eq!(0, service.in_flight());
}

#[tokio::test]
async fn test_interrupt_cancels_blocked_requests() {
    logutil::init_test();
    let engine = MemoryEngine::new();
    engine.on_query("select sleep(100)", Response::Hang);
    let interrupt = Interrupt::new();
    let service = Arc::new(QueryService::with_interrupt(
        TabletConfig::default().with_query_timeout(Duration::ZERO),
        Arc::new(engine.clone()),
        interrupt.clone(),
    ));
    let TestTablet {
        service,
        session_id,
        ..
    } = serve(service, engine.clone()).await;

    let request = {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .execute(&Query::new(session_id, "select sleep(100)"))
                .await
        })
    };
    wait_for(|| service.in_flight() == 1).await;

    interrupt.trigger();
    let err = tokio::time::timeout(DEFAULT_TIMEOUT, request)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert_eq!(ErrorKind::Retry, err.kind());
    assert_eq!(0, service.in_flight());
    assert_eq!(0, engine.conns_in_use());
}

#[tokio::test]
async fn test_stream_execute_sends_fields_first() {
    let TestTablet {
        service,
        engine,
        session_id,
    } = serving_tablet().await;
    engine.on_query(
        "select id, name from t",
        Response::Stream(vec![
            StreamChunk::Fields(fields()),
            StreamChunk::Rows(vec![vec![Value::Int(1), Value::from("a")]]),
            StreamChunk::Rows(vec![
                vec![Value::Int(2), Value::from("b")],
                vec![Value::Int(3), Value::from("c")],
            ]),
        ]),
    );

    let mut received = Vec::new();
    service
        .stream_execute(&Query::new(session_id, "select id, name from t;"), |result| {
            received.push(result);
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(3, received.len());
    assert_eq!(fields(), received[0].fields);
    assert!(received[0].rows.is_empty());
    assert!(received[1].fields.is_empty());
    assert_eq!(1, received[1].rows.len());
    assert!(received[2].fields.is_empty());
    assert_eq!(2, received[2].rows.len());

    assert_eq!(0, service.in_flight());
    assert_eq!(0, engine.conns_in_use());
    assert_eq!(1, service.stats().timings["SELECT_STREAM"].count);
}

#[tokio::test]
async fn test_stream_execute_rejects_transactions() {
    let TestTablet {
        service,
        engine,
        session_id,
    } = serving_tablet().await;
    let before = service.in_flight();

    let err = service
        .stream_execute(
            &Query::new(session_id, "select * from t").in_transaction(5),
            |_| Ok(()),
        )
        .await
        .unwrap_err();
    assert_eq!(ErrorKind::Fail, err.kind());
    assert!(
        err.message()
            .starts_with("Transactions not supported with streaming"),
        "{err}"
    );
    assert_eq!(before, service.in_flight());
    assert!(engine.executed().is_empty());
}

#[tokio::test]
async fn test_stream_execute_protocol_violations() {
    let TestTablet {
        service,
        engine,
        session_id,
    } = serving_tablet().await;
    engine.on_query(
        "select * from rows_first",
        Response::Stream(vec![StreamChunk::Rows(vec![vec![Value::Int(1)]])]),
    );
    engine.on_query(
        "select * from fields_twice",
        Response::Stream(vec![
            StreamChunk::Fields(fields()),
            StreamChunk::Fields(fields()),
        ]),
    );

    for sql in ["select * from rows_first", "select * from fields_twice"] {
        let err = service
            .stream_execute(&Query::new(session_id, sql), |_| Ok(()))
            .await
            .unwrap_err();
        assert_eq!(ErrorKind::Fail, err.kind(), "{sql}");
    }

    // Sink errors abort the stream.
    engine.on_query(
        "select * from t",
        Response::StreamForever(vec![Field::new("id", FieldType::Int)]),
    );
    let mut received = 0;
    let err = service
        .stream_execute(&Query::new(session_id, "select * from t"), |_| {
            received += 1;
            if received == 3 {
                return Err(TabletError::new(ErrorKind::Fail, "client went away"));
            }
            Ok(())
        })
        .await
        .unwrap_err();
    assert!(err.message().starts_with("client went away"), "{err}");
    assert_eq!(3, received);
    assert_eq!(0, engine.conns_in_use());
    assert_eq!(0, service.in_flight());
}

#[tokio::test]
async fn test_drain_terminates_streams() {
    let TestTablet {
        service,
        engine,
        session_id,
    } = serving_tablet().await;
    engine.on_query(
        "select * from t",
        Response::StreamForever(vec![Field::new("id", FieldType::Int)]),
    );

    let received = Arc::new(AtomicUsize::new(0));
    let stream = {
        let service = service.clone();
        let received = received.clone();
        tokio::spawn(async move {
            service
                .stream_execute(&Query::new(session_id, "select * from t"), move |_| {
                    received.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
        })
    };
    wait_for(|| received.load(Ordering::SeqCst) > 2).await;

    tokio::time::timeout(DEFAULT_TIMEOUT, service.disallow_queries())
        .await
        .unwrap();

    let err = stream.await.unwrap().unwrap_err();
    assert_eq!(ErrorKind::Retry, err.kind());
    assert!(err.message().starts_with("stream terminated"), "{err}");

    assert_eq!(ServingState::NotServing, service.state());
    assert_eq!(0, service.in_flight());
    assert_eq!(0, engine.conns_in_use());
    assert!(service.context().streams.is_empty());
}

#[tokio::test]
async fn test_drain_lets_transactions_finish() {
    let TestTablet {
        service,
        engine,
        session_id,
    } = serving_tablet().await;
    let tx_id = service.begin(session_id).await.unwrap();

    let drain = {
        let service = service.clone();
        tokio::spawn(async move { service.disallow_queries().await })
    };
    wait_for(|| service.state() == ServingState::ShuttingDownTx).await;

    // No new transactions or autonomous statements.
    let err = service.begin(session_id).await.unwrap_err();
    assert_eq!(ErrorKind::Retry, err.kind());
    let err = service
        .execute(&Query::new(session_id, "select 1"))
        .await
        .unwrap_err();
    assert_eq!(ErrorKind::Retry, err.kind());

    // The open transaction may finish.
    service
        .execute(&Query::new(session_id, "update t set a = 1").in_transaction(tx_id))
        .await
        .unwrap();
    assert!(!drain.is_finished());
    service.commit(session_id, tx_id).await.unwrap();

    tokio::time::timeout(DEFAULT_TIMEOUT, drain)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ServingState::NotServing, service.state());
    assert_eq!(1, engine.commits());
    assert_eq!(1, engine.closed());

    let err = service.get_session_id(&setup::session_params()).unwrap_err();
    assert_eq!(ErrorKind::Retry, err.kind());
}

#[tokio::test]
async fn test_drain_waits_for_in_flight_requests() {
    let config = TabletConfig::default().with_query_timeout(Duration::from_millis(200));
    let TestTablet {
        service,
        engine,
        session_id,
    } = serving_tablet_with(config, MemoryEngine::new()).await;
    engine.on_query("select sleep(1)", Response::Hang);

    let request = {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .execute(&Query::new(session_id, "select sleep(1)"))
                .await
        })
    };
    wait_for(|| service.in_flight() == 1).await;

    let drain = {
        let service = service.clone();
        tokio::spawn(async move { service.disallow_queries().await })
    };
    wait_for(|| service.state() == ServingState::ShuttingDownQueries).await;
    assert!(!drain.is_finished());
    assert_eq!(0, engine.closed());

    // The request times out, letting the drain complete.
    let err = request.await.unwrap().unwrap_err();
    assert_eq!(ErrorKind::Fail, err.kind());
    tokio::time::timeout(DEFAULT_TIMEOUT, drain)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(ServingState::NotServing, service.state());
    assert_eq!(0, service.in_flight());
    assert_eq!(1, engine.closed());
}

#[tokio::test]
async fn test_status_reports_backend() {
    logutil::init_test();
    let engine = MemoryEngine::new();
    let service = Arc::new(QueryService::new(
        TabletConfig::default(),
        Arc::new(engine.clone()),
    ));

    // Not serving is always reachable.
    engine.fail_ping(Some(BackendError::Connection("gone".to_string())));
    let status = service.status().await;
    assert_eq!("NOT_SERVING", status.state_name);
    assert!(status.backend_reachable);

    let TestTablet {
        service,
        session_id,
        ..
    } = serve(service, engine.clone()).await;
    let status = service.status().await;
    assert_eq!(ServingState::Serving, status.state);
    assert!(!status.backend_reachable);

    engine.fail_ping(None);
    service.begin(session_id).await.unwrap();
    let status = service.status().await;
    assert!(status.backend_reachable);
    assert_eq!(1, status.open_transactions);
    assert_eq!(0, status.in_flight);
    assert_eq!(0, engine.conns_in_use());
}

#[tokio::test]
async fn test_stats_count_error_kinds() {
    let TestTablet {
        service,
        session_id,
        ..
    } = serving_tablet().await;

    let _ = service.execute(&Query::new(0, "select 1")).await;
    let _ = service
        .stream_execute(&Query::new(session_id, "select 1").in_transaction(1), |_| Ok(()))
        .await;

    let stats = service.stats();
    assert_eq!("SERVING", stats.state_name);
    assert_eq!(1, stats.errors["Retry"]);
    assert_eq!(1, stats.errors["Fail"]);
    assert_eq!(0, stats.errors["Fatal"]);
    assert_eq!(0, stats.panics);
}
