//! Exercises the universal properties listed in §8 against the fake
//! driver/connect pair in `support`, with no live PostgreSQL server.

mod support;

use pg_session::error::Error;
use pg_session::manager::Manager;
use pg_session::reactor::NullReactor;
use support::{deliver_notification, test_config, FakeConnect};

fn manager() -> (Manager<FakeConnect, NullReactor>, FakeConnect) {
    let connect = FakeConnect::default();
    let manager = Manager::new(test_config(), connect.clone(), NullReactor);
    (manager, connect)
}

#[tokio::test]
async fn cache_identity_lifo_reuse() {
    let (mgr, _connect) = manager();
    mgr.max_connections(4).await;

    let a = mgr.session().await.unwrap();
    let b = mgr.session().await.unwrap();
    let c = mgr.session().await.unwrap();
    let (pid_a, pid_b, pid_c) = (a.pid(), b.pid(), c.pid());
    drop(a);
    drop(b);
    drop(c);

    // Most-recently-dropped is reused first.
    let s1 = mgr.session().await.unwrap();
    let s2 = mgr.session().await.unwrap();
    let s3 = mgr.session().await.unwrap();
    assert_eq!(s1.pid(), pid_c);
    assert_eq!(s2.pid(), pid_b);
    assert_eq!(s3.pid(), pid_a);
}

#[tokio::test]
async fn capacity_bound_evicts_oldest_idle() {
    let (mgr, connect) = manager();
    mgr.max_connections(1).await;

    let a = mgr.session().await.unwrap();
    let b = mgr.session().await.unwrap();
    // Two concurrently held sessions draw distinct backends even though
    // capacity is 1 (capacity bounds the *idle* cache, not concurrency).
    assert_ne!(a.pid(), b.pid());
    let pid_b = b.pid();
    drop(b);

    let reused = mgr.session().await.unwrap();
    assert_eq!(reused.pid(), pid_b);
    assert_eq!(connect.opened.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn async_query_exclusivity() {
    let (mgr, _connect) = manager();
    let mut session = mgr.session().await.unwrap();

    let results = session.query("SELECT 1", &[]).await.unwrap();
    let stmt = results.sth().clone();
    session
        .query_async(stmt, &[], |_session, _err, _results| {})
        .unwrap();

    let err = session.query("SELECT 1", &[]).await.unwrap_err();
    assert!(matches!(err, Error::Usage(msg) if msg == pg_session::error::messages::BUSY));
}

#[tokio::test]
async fn notifications_delivered_before_async_completion() {
    let (mgr, connect) = manager();
    let mut session = mgr.session().await.unwrap();
    let pid = session.pid();

    let order = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let order_for_notify = order.clone();
    session.on_notification(move |channel, _pid, _payload| {
        order_for_notify.lock().unwrap().push(format!("notify:{channel}"));
    });

    deliver_notification(&connect.inbox, pid, "dbtest", "foo");

    session
        .query_async_prepared("SELECT 1", &[], {
            let order = order.clone();
            move |_session, _err, _results| {
                order.lock().unwrap().push("complete".to_string());
            }
        })
        .await
        .unwrap();

    session.on_readable();

    let log = order.lock().unwrap();
    assert_eq!(log.as_slice(), ["notify:dbtest", "complete"]);
}

#[tokio::test]
async fn premature_close_delivers_to_waiting_callback() {
    let (mgr, _connect) = manager();
    let mut session = mgr.session().await.unwrap();
    let fired = std::sync::Arc::new(std::sync::Mutex::new(None));
    let fired_for_cb = fired.clone();

    session
        .query_async_prepared("SELECT 1", &[], move |_session, err, _results| {
            *fired_for_cb.lock().unwrap() = err.map(|e| e.to_string());
        })
        .await
        .unwrap();

    drop(session);

    let err = fired.lock().unwrap().clone().expect("callback should have fired");
    assert!(err.contains(pg_session::error::messages::PREMATURE_CLOSE));
}

#[tokio::test]
async fn statement_handle_identity_across_queries() {
    let (mgr, _connect) = manager();
    let mut session = mgr.session().await.unwrap();

    let r1 = session.query("SELECT 1", &[]).await.unwrap();
    let h1 = r1.sth().clone();
    drop(r1);
    let r2 = session.query("SELECT 1", &[]).await.unwrap();
    assert_eq!(&h1, r2.sth());

    let r3 = session.query("SELECT 2", &[]).await.unwrap();
    assert_ne!(&h1, r3.sth());
}
