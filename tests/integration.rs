//! Integration tests for queuewire.
//!
//! Each test runs a real broker on a loopback port and talks to it through
//! the public client API.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use queuewire::error::QueueWireError;
use queuewire::protocol::{PopError, PushError};
use queuewire::{AsyncClient, Broker, BrokerConfig, Client};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const USER: &str = "tester";
const PASS: &str = "hunter2";

struct TestBroker {
    addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<queuewire::Result<()>>>,
}

impl TestBroker {
    async fn start(max_queue_bytes: usize) -> Self {
        let config = BrokerConfig::default()
            .with_host("127.0.0.1")
            .with_port(0)
            .with_credentials(USER, PASS)
            .with_max_queue_bytes(max_queue_bytes)
            .with_sweep_interval(Duration::from_millis(20));
        let broker = Broker::bind(config).await.unwrap();
        let addr = broker.local_addr().unwrap();

        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(broker.run_until(async {
            let _ = stopped.await;
        }));

        Self {
            addr,
            stop: Some(stop),
            task: Some(task),
        }
    }

    async fn client(&self) -> AsyncClient {
        AsyncClient::connect(self.addr, USER, PASS).await.unwrap()
    }

    async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            task.await.unwrap().unwrap();
        }
    }
}

/// Run `f` with a deadline so a hung broker fails the test instead of CI.
async fn within<F: std::future::Future>(f: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), f)
        .await
        .expect("test timed out")
}

#[tokio::test]
async fn test_push_completes_when_consumed() {
    let broker = TestBroker::start(1 << 20).await;
    let producer = broker.client().await;
    let consumer = broker.client().await;

    within(async {
        let push = producer.push("jobs", "first", Some(Duration::from_secs(2)));
        let pop = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            consumer.pop("jobs", None).await
        };
        let (pushed, popped) = tokio::join!(push, pop);

        pushed.unwrap();
        assert_eq!(popped.unwrap(), Bytes::from_static(b"first"));
    })
    .await;

    producer.shutdown().await;
    consumer.shutdown().await;
    broker.stop().await;
}

#[tokio::test]
async fn test_try_pop_on_empty_queue() {
    let broker = TestBroker::start(1 << 20).await;
    let client = broker.client().await;

    let result = within(client.try_pop("nothing-here")).await;
    assert!(matches!(
        result,
        Err(QueueWireError::Pop(PopError::QueueEmpty))
    ));

    client.shutdown().await;
    broker.stop().await;
}

#[tokio::test]
async fn test_waiting_pop_served_by_later_push() {
    let broker = TestBroker::start(1 << 20).await;
    let consumer = broker.client().await;
    let producer = broker.client().await;

    within(async {
        let pop = consumer.pop("jobs", Some(Duration::from_secs(2)));
        let push = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            producer.push("jobs", "late", None).await
        };
        let (popped, pushed) = tokio::join!(pop, push);

        pushed.unwrap();
        assert_eq!(popped.unwrap(), Bytes::from_static(b"late"));

        // The payload went straight to the waiting popper.
        assert!(matches!(
            consumer.try_pop("jobs").await,
            Err(QueueWireError::Pop(PopError::QueueEmpty))
        ));
    })
    .await;

    consumer.shutdown().await;
    producer.shutdown().await;
    broker.stop().await;
}

#[tokio::test]
async fn test_pop_times_out() {
    let broker = TestBroker::start(1 << 20).await;
    let client = broker.client().await;

    let result = within(client.pop("idle", Some(Duration::from_millis(50)))).await;
    assert!(matches!(result, Err(QueueWireError::Pop(PopError::Timeout))));

    // The expired popper must not swallow the next payload.
    within(async {
        client.try_push("idle", "kept").await.unwrap();
        assert_eq!(
            client.try_pop("idle").await.unwrap(),
            Bytes::from_static(b"kept")
        );
    })
    .await;

    client.shutdown().await;
    broker.stop().await;
}

#[tokio::test]
async fn test_wrong_credentials_are_refused() {
    let broker = TestBroker::start(1 << 20).await;

    let result = within(Client::connect(broker.addr, USER, "wrong")).await;
    assert!(matches!(result, Err(QueueWireError::ConnectionClosed)));

    broker.stop().await;
}

#[tokio::test]
async fn test_capacity_scenario() {
    let broker = TestBroker::start(1024).await;
    let client = broker.client().await;

    within(async {
        client.try_push("q", vec![1u8; 600]).await.unwrap();
        assert!(matches!(
            client.try_push("q", vec![2u8; 500]).await,
            Err(QueueWireError::Push(PushError::QueueFull))
        ));
        assert_eq!(client.try_pop("q").await.unwrap().len(), 600);
        client.try_push("q", vec![3u8; 500]).await.unwrap();
    })
    .await;

    client.shutdown().await;
    broker.stop().await;
}

#[tokio::test]
async fn test_blocking_push_over_capacity_is_rejected() {
    let broker = TestBroker::start(1024).await;
    let client = broker.client().await;

    within(async {
        client.try_push("q", vec![0u8; 1000]).await.unwrap();
        assert!(matches!(
            client.push("q", vec![1u8; 100], None).await,
            Err(QueueWireError::Push(PushError::QueueFull))
        ));
        assert_eq!(client.try_pop("q").await.unwrap().len(), 1000);
    })
    .await;

    client.shutdown().await;
    broker.stop().await;
}

#[tokio::test]
async fn test_blocking_push_times_out() {
    let broker = TestBroker::start(1 << 20).await;
    let client = broker.client().await;

    within(async {
        assert!(matches!(
            client.push("q", vec![0u8; 16], Some(Duration::from_millis(50))).await,
            Err(QueueWireError::Push(PushError::Timeout))
        ));
        // The expired entry left the queue with its pusher.
        assert!(matches!(
            client.try_pop("q").await,
            Err(QueueWireError::Pop(PopError::QueueEmpty))
        ));
    })
    .await;

    client.shutdown().await;
    broker.stop().await;
}

#[tokio::test]
async fn test_fifo_order_across_clients() {
    let broker = TestBroker::start(1 << 20).await;
    let producer = broker.client().await;
    let consumer = broker.client().await;

    within(async {
        for i in 0..50u32 {
            producer.try_push("ordered", i.to_le_bytes().to_vec()).await.unwrap();
        }
        for i in 0..50u32 {
            let payload = consumer.try_pop("ordered").await.unwrap();
            assert_eq!(&payload[..], &i.to_le_bytes()[..]);
        }
    })
    .await;

    producer.shutdown().await;
    consumer.shutdown().await;
    broker.stop().await;
}

#[tokio::test]
async fn test_typed_values() {
    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Resize {
        image: String,
        width: u32,
        height: u32,
    }

    let broker = TestBroker::start(1 << 20).await;
    let client = broker.client().await;

    let job = Resize {
        image: "cat.png".into(),
        width: 640,
        height: 480,
    };
    let (pushed, popped) = within(async {
        tokio::join!(
            client.push_value("resize", &job, Some(Duration::from_secs(2))),
            client.pop_value::<Resize>("resize", None)
        )
    })
    .await;
    pushed.unwrap();
    assert_eq!(popped.unwrap(), job);

    client.shutdown().await;
    broker.stop().await;
}

#[tokio::test]
async fn test_queues_are_independent() {
    let broker = TestBroker::start(1 << 20).await;
    let client = broker.client().await;

    within(async {
        client.try_push("a", "for-a").await.unwrap();
        client.try_push("b", "for-b").await.unwrap();
        assert_eq!(client.try_pop("b").await.unwrap(), Bytes::from_static(b"for-b"));
        assert_eq!(client.try_pop("a").await.unwrap(), Bytes::from_static(b"for-a"));
    })
    .await;

    client.shutdown().await;
    broker.stop().await;
}

#[tokio::test]
async fn test_disconnect_cancels_waiting_pop() {
    let broker = TestBroker::start(1 << 20).await;
    let stayer = broker.client().await;

    within(async {
        // Register a pop that never completes, then leave.
        let mut client = Client::connect(broker.addr, USER, PASS).await.unwrap();
        client.pop("jobs", None, |_| {});
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.disconnect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The cancelled popper must not swallow this payload.
        stayer.try_push("jobs", "survivor").await.unwrap();
        assert_eq!(
            stayer.try_pop("jobs").await.unwrap(),
            Bytes::from_static(b"survivor")
        );
    })
    .await;

    stayer.shutdown().await;
    broker.stop().await;
}

#[tokio::test]
async fn test_callback_client_round_trip() {
    let broker = TestBroker::start(1 << 20).await;
    let mut client = within(Client::connect(broker.addr, USER, PASS)).await.unwrap();
    assert!(client.is_authorized());

    let (tx, rx) = oneshot::channel();
    client.try_push("cb", "payload", |result| assert!(result.is_ok()));
    client.pop("cb", Some(Duration::from_secs(1)), move |result| {
        let _ = tx.send(result);
    });

    within(async {
        while client.pending_requests() > 0 {
            client.update().await.unwrap();
        }
    })
    .await;
    assert_eq!(rx.await.unwrap().unwrap(), Bytes::from_static(b"payload"));

    client.disconnect().await.unwrap();
    broker.stop().await;
}

#[tokio::test]
async fn test_garbage_closes_connection() {
    let broker = TestBroker::start(1 << 20).await;

    let mut stream = TcpStream::connect(broker.addr).await.unwrap();
    stream.write_all(&[0xff, 0, 0, 0, 0]).await.unwrap();

    let mut buf = [0u8; 16];
    let n = within(stream.read(&mut buf)).await.unwrap_or(0);
    assert_eq!(n, 0);

    // Other clients are unaffected.
    let client = broker.client().await;
    within(client.try_push("still-up", "yes")).await.unwrap();
    client.shutdown().await;
    broker.stop().await;
}
