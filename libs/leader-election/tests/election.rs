use std::{sync::Arc, time::Duration};

use leader_election::{
    BroadcastDispatcher, Election, ElectionState, MemoryBackend, MemoryDriver, Namespace,
    NoopDispatcher, SessionOptions, SyncDispatcher, Topic, listen,
};
use tokio_util::sync::CancellationToken;

fn options() -> SessionOptions {
    SessionOptions {
        ttl: Duration::from_millis(300),
        renew_interval: Duration::from_millis(50),
        retry_interval: Duration::from_millis(20),
        ..Default::default()
    }
}

fn process(backend: &MemoryBackend, ns: &Namespace) -> Election {
    let driver = Arc::new(MemoryDriver::new(backend.clone(), ns, options()));
    Election::new(ns.key(), driver, Arc::new(NoopDispatcher))
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition reached");
}

#[tokio::test]
async fn test_two_processes_one_namespace() {
    let backend = MemoryBackend::new();
    let ns = Namespace::new("test", "").unwrap();
    let a = process(&backend, &ns);
    let b = process(&backend, &ns);
    let cancel = CancellationToken::new();

    a.campaign(cancel.clone()).await.unwrap();
    assert!(a.status().is_leader());

    let pending = {
        let b = b.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { b.campaign(cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(a.status().is_leader());
    assert!(!b.status().is_leader());

    a.resign(&cancel).await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), pending)
        .await
        .expect("successor elected")
        .unwrap()
        .unwrap();
    assert!(!a.status().is_leader());
    assert!(b.status().is_leader());

    cancel.cancel();
    eventually(|| b.state() == ElectionState::Stopped).await;
    assert!(!b.status().is_leader());
}

#[tokio::test]
async fn test_succession_after_forced_session_loss() {
    let backend = MemoryBackend::new();
    let ns = Namespace::new("billing", "prod").unwrap();
    let a = process(&backend, &ns);
    let b = process(&backend, &ns);

    a.campaign(CancellationToken::new()).await.unwrap();
    let pending = {
        let b = b.clone();
        tokio::spawn(async move { b.campaign(CancellationToken::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    backend.revoke(&ns.key());
    tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .expect("successor elected within session timeout")
        .unwrap()
        .unwrap();
    eventually(|| !a.is_leader()).await;
    assert!(b.is_leader());
}

#[tokio::test]
async fn test_mutual_exclusion_under_churn() {
    let backend = MemoryBackend::new();
    let ns = Namespace::new("churn", "test").unwrap();
    let elections = (0..3).map(|_| process(&backend, &ns)).collect::<Vec<_>>();
    let shutdown = CancellationToken::new();

    // every contender campaigns and resigns shortly after winning
    let contenders = elections
        .iter()
        .cloned()
        .map(|election| {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                while !shutdown.is_cancelled() {
                    if election.campaign(shutdown.clone()).await.is_err() {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(15)).await;
                    let _ = election.resign(&CancellationToken::new()).await;
                }
            })
        })
        .collect::<Vec<_>>();

    for _ in 0..200 {
        let leaders = elections.iter().filter(|e| e.is_leader()).count();
        assert!(leaders <= 1, "{leaders} elections report leadership");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    shutdown.cancel();
    for contender in contenders {
        contender.await.unwrap();
    }
    eventually(|| elections.iter().all(|e| !e.is_leader())).await;
}

#[tokio::test]
async fn test_different_namespaces_do_not_contend() {
    let backend = MemoryBackend::new();
    let prod = process(&backend, &Namespace::new("billing", "prod").unwrap());
    let staging = process(&backend, &Namespace::new("billing", "staging").unwrap());

    prod.campaign(CancellationToken::new()).await.unwrap();
    tokio::time::timeout(
        Duration::from_secs(1),
        staging.campaign(CancellationToken::new()),
    )
    .await
    .expect("separate namespaces elect independently")
    .unwrap();
    assert!(prod.is_leader());
    assert!(staging.is_leader());
}

#[tokio::test]
async fn test_events_reach_listeners_in_order() {
    let backend = MemoryBackend::new();
    let ns = Namespace::new("events", "test").unwrap();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let dispatcher = SyncDispatcher::new();
    for topic in [Topic::BecameLeader, Topic::LostLeadership] {
        let tx = tx.clone();
        dispatcher.subscribe(listen(topic, move |event| {
            tx.send(event.topic())?;
            Ok(())
        }));
    }
    let driver = Arc::new(MemoryDriver::new(backend.clone(), &ns, options()));
    let election = Election::new(ns.key(), driver, Arc::new(dispatcher));

    election.campaign(CancellationToken::new()).await.unwrap();
    election.resign(&CancellationToken::new()).await.unwrap();
    election.campaign(CancellationToken::new()).await.unwrap();
    backend.revoke(&ns.key());
    election.wait_for_loss().await;

    let mut topics = Vec::new();
    for _ in 0..4 {
        topics.push(rx.recv().await.unwrap());
    }
    assert_eq!(
        topics,
        vec![
            Topic::BecameLeader,
            Topic::LostLeadership,
            Topic::BecameLeader,
            Topic::LostLeadership,
        ]
    );
}

#[tokio::test]
async fn test_broadcast_subscriber_sees_status_already_flipped() {
    let backend = MemoryBackend::new();
    let ns = Namespace::new("flip", "test").unwrap();
    let dispatcher = BroadcastDispatcher::default();
    let mut events = dispatcher.subscribe();
    let driver = Arc::new(MemoryDriver::new(backend, &ns, options()));
    let election = Election::new(ns.key(), driver, Arc::new(dispatcher));
    let status = election.status();

    let observer = tokio::spawn(async move {
        let event = events.recv().await.unwrap();
        (event.is_leader, status.is_leader())
    });
    election.campaign(CancellationToken::new()).await.unwrap();
    let (event_state, status_state) = observer.await.unwrap();
    assert!(event_state);
    assert!(status_state);
}
