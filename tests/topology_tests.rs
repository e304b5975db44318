//! Routing tables pushed to desks, rerouting between desks, and child jobs
//! submitted by workers.


use std::time::Duration;

use buckdesk::routing::{Client, DeskSpec};
use buckdesk::scheduler::Job;
use buckdesk::transport::{Envelope, Socket, SocketOptions};
use serde_json::json;
use test_harness::{registry, TestDesk};

const WAIT: Duration = Duration::from_secs(5);

fn unused_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// First job, among a few candidates, that `client` routes to `port`.
fn job_routed_to(client: &Client, port: u16) -> Job {
    (0..256)
        .map(|i| Job::call("strlen").arg(format!("candidate-{}", i)).build(&registry()).unwrap())
        .find(|job| client.route(job).unwrap().port == port)
        .expect("some job should route to the port")
}

fn signature_timestamp(desk: &TestDesk) -> Option<i64> {
    desk.desk
        .client()
        .and_then(Client::current_signature)
        .map(|s| s.timestamp())
}

#[tokio::test]
async fn test_newest_topology_wins() {
    let mut desk = TestDesk::bind(1).await;
    let mut older = Client::new([desk.spec()]);
    let mut newer = Client::new([desk.spec()]);
    let newer_ts = newer.timestamp();

    newer.notify_desks().await.unwrap();
    assert!(desk.tick_until(|d| d.client().is_some(), WAIT).await);
    assert_eq!(desk.desk.signature(), Some(newer.signature()));

    // An older table is refused
    older.notify_desks().await.unwrap();
    let events = desk.events.clone();
    assert!(desk.tick_until(|_| events.count("topology_stale") == 1, WAIT).await);
    assert_eq!(signature_timestamp(&desk), Some(newer_ts));

    // Unless it is stamped later
    older.force_timestamp(newer_ts + 1);
    older.notify_desks().await.unwrap();
    let expected = older.signature();
    assert!(desk.tick_until(|d| d.signature().as_ref() == Some(&expected), WAIT).await);
    assert_eq!(desk.events.count("topology"), 2);

    desk.shutdown().await;
}

#[tokio::test]
async fn test_notify_fails_when_no_desk_listens() {
    let mut client = Client::new([DeskSpec::local(unused_port())]);
    let err = client.notify_desks().await.unwrap_err();
    assert!(matches!(err, buckdesk::BuckError::UnreachableSupervisor(1)));
}

#[tokio::test]
async fn test_foreign_job_is_rerouted_to_owner() {
    let mut first = TestDesk::bind(1).await;
    let mut second = TestDesk::bind(1).await;
    let client = Client::connect([first.spec(), second.spec()]).await.unwrap();
    assert!(first.tick_until(|d| d.client().is_some(), WAIT).await);
    assert!(second.tick_until(|d| d.client().is_some(), WAIT).await);

    let job = job_routed_to(&client, second.port());
    let mut socket = Socket::connect("127.0.0.1", first.port(), SocketOptions::client())
        .await
        .unwrap();
    socket
        .send(&Envelope::Job(job.clone()), Duration::from_secs(1))
        .await
        .unwrap();

    let events = first.events.clone();
    assert!(first.tick_until(|_| events.count("rerouted") == 1, WAIT).await);
    assert!(!first.desk.queue().is_tracked(job.id()));

    let results = second.results(1).await;
    assert_eq!(results[0].job.id(), job.id());
    assert_eq!(results[0].job.routed_by(), Some(first.desk.id()));
    assert!(results[0].success);
    assert!(first.tick_for(Duration::from_millis(100)).await.is_empty());

    first.shutdown().await;
    second.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_owner_keeps_job_queued() {
    let mut desk = TestDesk::bind(1).await;
    let dead = DeskSpec::local(unused_port());
    let client = Client::new([desk.spec(), dead.clone()]);
    let job = job_routed_to(&client, dead.port);
    desk.desk.set_client(client).await;

    desk.desk.enqueue(job.clone());
    desk.desk.tick(Duration::from_millis(20)).await;

    assert_eq!(desk.events.count("requeued"), 1);
    assert!(desk.desk.queue().is_tracked(job.id()));
    assert_eq!(desk.desk.queue().len(), 1);

    desk.shutdown().await;
}

#[tokio::test]
async fn test_worker_children_come_back_through_the_desk() {
    let mut desk = TestDesk::bind(1).await;
    let own = desk.spec();
    desk.desk.set_client(Client::new([own])).await;

    let parent = Job::call("spawn")
        .arg("strlen")
        .arg("a")
        .arg("bb")
        .context("batch-7")
        .build(&registry())
        .unwrap();
    desk.desk.enqueue(parent.clone());

    let results = desk.results(3).await;
    let parent_result = results
        .iter()
        .find(|r| r.job.id() == parent.id())
        .expect("parent result");
    assert_eq!(parent_result.value, json!(2));
    assert_eq!(parent_result.spawned.len(), 2);

    let mut values: Vec<_> = results
        .iter()
        .filter(|r| r.job.id() != parent.id())
        .map(|r| {
            assert!(parent_result.spawned.contains(r.job.id()));
            assert_eq!(r.job.context(), "batch-7");
            r.value.clone()
        })
        .collect();
    values.sort_by_key(|v| v.as_i64());
    assert_eq!(values, vec![json!(1), json!(2)]);

    desk.shutdown().await;
}
