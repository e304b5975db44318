
use std::sync::Arc;
use std::time::Duration;

use buckdesk::routing::{Client, DeskSpec};
use buckdesk::scheduler::{Job, JobResult, Notice};
use buckdesk::transport::{Envelope, EnvelopeCodec, Socket, SocketOptions};
use buckdesk::worker::drawer::INTERRUPTED_EXIT;
use buckdesk::worker::{JobExecutor, WorkerLoop};
use serde_json::{json, Value};
use test_harness::registry;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;

/// Create a test executor without process-wide limits
fn test_executor() -> JobExecutor {
    JobExecutor::new(Arc::new(registry()))
}

fn job(target: &str, args: Vec<Value>) -> Job {
    let mut builder = Job::call(target);
    for arg in args {
        builder = builder.arg(arg);
    }
    builder.build(&registry()).unwrap()
}

#[tokio::test]
async fn test_execute_returns_value() {
    let mut executor = test_executor();
    let job = job("strlen", vec![json!("test")]);

    let outcome = executor.execute(job.clone()).await;

    assert!(outcome.result.success);
    assert_eq!(outcome.result.value, json!(4));
    assert_eq!(outcome.result.job, job);
    assert_eq!(outcome.result.pid, std::process::id());
    assert!(outcome.result.error.is_none());
    assert!(outcome.result.exception.is_none());
    assert!(outcome.children.is_empty());
}

#[tokio::test]
async fn test_execute_captures_output() {
    let mut executor = test_executor();
    let outcome = executor.execute(job("echo", vec![json!("hi"), json!(2)])).await;

    assert!(outcome.result.success);
    assert_eq!(outcome.result.output, r#"["hi",2]"#);
}

#[tokio::test]
async fn test_target_error_becomes_exception() {
    let mut executor = test_executor();
    let outcome = executor.execute(job("fail", vec![json!("boom")])).await;

    assert!(!outcome.result.success);
    assert!(outcome.result.error.is_none());
    let exception = outcome.result.exception.unwrap();
    assert!(exception.contains("boom"), "unexpected exception: {}", exception);
}

#[tokio::test]
async fn test_bad_arguments_become_exception() {
    let mut executor = test_executor();
    let outcome = executor.execute(job("strlen", vec![json!(12)])).await;

    assert!(!outcome.result.success);
    assert!(outcome.result.exception.is_some());
}

#[tokio::test]
async fn test_panic_is_captured() {
    let mut executor = test_executor();
    let outcome = executor.execute(job("panic", vec![json!("kaboom")])).await;

    assert!(!outcome.result.success);
    let exception = outcome.result.exception.unwrap();
    assert!(exception.contains("kaboom"), "unexpected exception: {}", exception);

    // The executor stays usable
    let outcome = executor.execute(job("strlen", vec![json!("ok")])).await;
    assert_eq!(outcome.result.value, json!(2));
}

#[tokio::test]
async fn test_falsy_value_is_failure() {
    let mut executor = test_executor();
    let outcome = executor.execute(job("strlen", vec![json!("")])).await;

    assert_eq!(outcome.result.value, json!(0));
    assert!(!outcome.result.success);
    assert!(outcome.result.exception.is_none());
}

#[tokio::test]
async fn test_time_limit_reports_error() {
    let mut executor = test_executor();
    let job = Job::call("sleep")
        .arg(1.5)
        .time_limit(Duration::from_secs(1))
        .build(&registry())
        .unwrap();

    let started = tokio::time::Instant::now();
    let outcome = executor.execute(job).await;

    assert!(started.elapsed() < Duration::from_millis(1400));
    assert!(!outcome.result.success);
    assert_eq!(
        outcome.result.error.as_deref(),
        Some("time limit of 1s exceeded")
    );

    // The next job waits for the timed out target to return
    executor.settle().await;
    assert!(started.elapsed() >= Duration::from_millis(1500));
}

#[tokio::test]
async fn test_spawned_children_inherit_context() {
    let mut executor = test_executor();
    let parent = Job::call("spawn")
        .arg("strlen")
        .arg("a")
        .arg("bb")
        .context("batch-1")
        .build(&registry())
        .unwrap();

    let outcome = executor.execute(parent).await;

    assert_eq!(outcome.result.value, json!(2));
    assert_eq!(outcome.children.len(), 2);
    for child in &outcome.children {
        assert_eq!(child.target(), "strlen");
        assert_eq!(child.context(), "batch-1");
    }
}

#[tokio::test]
async fn test_invalid_children_are_dropped() {
    let mut executor = test_executor();
    let outcome = executor
        .execute(job("spawn", vec![json!("no_such_target"), json!(1)]))
        .await;

    assert_eq!(outcome.result.value, json!(1));
    assert!(outcome.children.is_empty());
}

#[tokio::test]
async fn test_control_job_is_not_executed() {
    let mut executor = test_executor();
    let outcome = executor.execute(Job::notice(Notice::DrawerRefresh)).await;

    assert!(outcome.result.success);
    assert_eq!(outcome.result.value, Value::Null);
}

// =============================================================================
// Worker loop over in-memory pipes
// =============================================================================

struct Pipes {
    input: DuplexStream,
    output: FramedRead<DuplexStream, EnvelopeCodec>,
    codec: EnvelopeCodec,
}

impl Pipes {
    async fn send(&mut self, job: &Job) {
        let frame = self.codec.frame(&Envelope::Job(job.clone())).unwrap();
        self.input.write_all(&frame).await.unwrap();
    }

    async fn close(&mut self) {
        self.input.shutdown().await.unwrap();
    }

    async fn result(&mut self) -> JobResult {
        match self.output.next().await {
            Some(Ok(Envelope::Result(result))) => *result,
            other => panic!("expected a result frame, got {:?}", other),
        }
    }
}

fn worker_loop() -> (WorkerLoop<DuplexStream, DuplexStream>, Pipes) {
    let codec = EnvelopeCodec::default();
    let (input, worker_in) = tokio::io::duplex(64 * 1024);
    let (worker_out, output) = tokio::io::duplex(64 * 1024);
    let worker = WorkerLoop::new(worker_in, worker_out, test_executor(), codec.clone());
    let pipes = Pipes {
        input,
        output: FramedRead::new(output, codec.clone()),
        codec,
    };
    (worker, pipes)
}

#[tokio::test]
async fn test_worker_answers_each_job_in_order() {
    let (worker, mut pipes) = worker_loop();
    let jobs = vec![
        job("strlen", vec![json!("test")]),
        job("sum", vec![json!(1), json!(2)]),
        job("fail", vec![]),
    ];

    let driver = async {
        for job in &jobs {
            pipes.send(job).await;
        }
        let mut results = Vec::new();
        for _ in &jobs {
            results.push(pipes.result().await);
        }
        pipes.close().await;
        results
    };

    let (code, results) = tokio::join!(worker.serve(), driver);

    assert_eq!(code, 0);
    let ids: Vec<_> = results.iter().map(|r| r.job.id().clone()).collect();
    let expected: Vec<_> = jobs.iter().map(|j| j.id().clone()).collect();
    assert_eq!(ids, expected);
    assert_eq!(results[0].value, json!(4));
    assert_eq!(results[1].value, json!(3));
    assert!(!results[2].success);
}

#[tokio::test]
async fn test_shutdown_notice_sets_exit_code() {
    let (worker, mut pipes) = worker_loop();

    let driver = async move {
        pipes.send(&Job::notice(Notice::DrawerRefresh)).await;
        pipes.send(&Job::notice(Notice::WorkerShutdown { exit_code: 3 })).await;
        pipes
    };

    let (code, mut pipes) = tokio::join!(worker.serve(), driver);
    assert_eq!(code, 3);

    // Notices are never answered
    pipes.close().await;
    assert!(pipes.output.next().await.is_none());
}

#[tokio::test]
async fn test_interrupted_job_ends_worker() {
    let (worker, mut pipes) = worker_loop();
    let stuck = Job::call("sleep")
        .arg(2)
        .time_limit(Duration::from_secs(1))
        .build(&registry())
        .unwrap();
    let next = job("strlen", vec![json!("x")]);

    let driver = async move {
        pipes.send(&stuck).await;
        pipes.send(&next).await;
        let result = pipes.result().await;
        (pipes, result)
    };

    let started = tokio::time::Instant::now();
    let (code, (mut pipes, result)) = tokio::join!(worker.serve(), driver);

    assert_eq!(code, INTERRUPTED_EXIT);
    assert!(started.elapsed() < Duration::from_millis(1900));
    assert_eq!(result.error.as_deref(), Some("time limit of 1s exceeded"));
    assert!(result.interrupted());

    // The queued job is left for a fresh worker
    assert!(pipes.output.next().await.is_none());
}

#[tokio::test]
async fn test_malformed_input_ends_worker() {
    let (worker, mut pipes) = worker_loop();

    let driver = async move {
        pipes.input.write_all(b"%%% not a frame %%%\n").await.unwrap();
        pipes
    };

    let (code, _pipes) = tokio::join!(worker.serve(), driver);
    assert_eq!(code, 65);
}

#[tokio::test]
async fn test_worker_submits_children_through_routing_table() {
    let mut desk = Socket::listen("127.0.0.1", 0, SocketOptions::default())
        .await
        .unwrap();
    let client = Client::new([DeskSpec::local(desk.port())]);
    let (worker, mut pipes) = worker_loop();
    let worker = worker.with_client(client);

    let parent = job("spawn", vec![json!("strlen"), json!("x"), json!("yy")]);
    let driver = async {
        pipes.send(&parent).await;
        let result = pipes.result().await;
        pipes.close().await;
        result
    };

    let (code, result) = tokio::join!(worker.serve(), driver);
    assert_eq!(code, 0);
    assert_eq!(result.spawned.len(), 2);

    let mut received = Vec::new();
    for _ in 0..2 {
        match desk.receive(Duration::from_secs(2)).await.unwrap() {
            Some(Envelope::Job(child)) => received.push(child.id().clone()),
            other => panic!("expected a child job, got {:?}", other),
        }
    }
    assert_eq!(received, result.spawned);
}
