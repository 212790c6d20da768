mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{assert_quiet, eventually, recv, setup, Recorder, Stall};
use hospital_messaging_core::bus::{self, Binding, Connector};
use hospital_messaging_core::roles::{Administrator, HospitalWorker, EVENT_BUFFER};
use hospital_messaging_core::{
    AckHandle, Delivery, DeliveryHandler, MemoryExchange, MessageProperties, MessagingError,
};
use tokio::sync::mpsc;

#[tokio::test]
async fn routing_key_reaches_only_matching_bindings() -> Result<(), MessagingError> {
    setup();
    let exchange = MemoryExchange::default();

    let mut tasks = Vec::new();
    let mut receivers = Vec::new();
    for pattern in ["specialist.knee", "#", "specialist.hip", "hosp.info"] {
        let (handler, rx) = Recorder::new();
        let mut consumer = exchange.consumer().await?;
        consumer.bind(Binding::topic(pattern), handler).await?;
        tasks.push(bus::spawn(pattern, consumer));
        receivers.push(rx);
    }

    let producer = exchange.producer().await?;
    producer
        .send("specialist.knee", "anna knee", MessageProperties::default())
        .await?;

    let [knee, all, hip, info] = receivers.as_mut_slice() else {
        unreachable!()
    };
    assert_eq!(recv(knee).await.body, "anna knee");
    let seen = recv(all).await;
    assert_eq!(seen.routing_key, "specialist.knee");
    assert_eq!(seen.body, "anna knee");
    assert_quiet(hip).await;
    assert_quiet(info).await;
    assert_quiet(knee).await;
    Ok(())
}

#[tokio::test]
async fn overlapping_patterns_on_one_queue_deliver_once() -> Result<(), MessagingError> {
    setup();
    let exchange = MemoryExchange::default();
    let (handler, mut rx) = Recorder::new();
    let mut consumer = exchange.consumer().await?;
    let queue = consumer
        .bind(Binding::shared("specialist.#", "triage"), handler.clone())
        .await?;
    consumer
        .bind(Binding::shared("specialist.knee", "triage"), handler)
        .await?;
    assert_eq!(queue, "triage");
    assert_eq!(exchange.bindings_of("triage").len(), 2);
    let _task = bus::spawn("triage", consumer);

    exchange
        .producer()
        .await?
        .send("specialist.knee", "bob knee", MessageProperties::default())
        .await?;

    assert_eq!(recv(&mut rx).await.body, "bob knee");
    assert_quiet(&mut rx).await;
    Ok(())
}

#[tokio::test]
async fn broadcast_reaches_every_worker_once() -> Result<(), MessagingError> {
    setup();
    let exchange = MemoryExchange::default();
    let admin = Administrator::connect(&exchange).await?;

    let mut workers = Vec::new();
    for i in 0..3 {
        workers.push(HospitalWorker::connect(&exchange, format!("worker-{i}")).await?);
    }
    let mut infos: Vec<_> = workers
        .iter_mut()
        .map(|w| w.take_info_events().expect("info events"))
        .collect();

    admin.broadcast("X").await?;

    for rx in infos.iter_mut() {
        assert_eq!(recv(rx).await, "X");
    }
    for rx in infos.iter_mut() {
        assert_quiet(rx).await;
    }
    Ok(())
}

#[tokio::test]
async fn sniffing_takes_a_copy_not_the_message() -> Result<(), MessagingError> {
    setup();
    let exchange = MemoryExchange::default();
    let mut admin = Administrator::connect(&exchange).await?;
    let mut observed = admin.take_observed().unwrap();

    let (handler, mut rx) = Recorder::new();
    let mut consumer = exchange.consumer().await?;
    consumer
        .bind(Binding::shared("specialist.hip", "hip"), handler)
        .await?;
    let _task = bus::spawn("hip", consumer);

    let mut worker = HospitalWorker::connect(&exchange, "worker").await?;
    let mut info = worker.take_info_events().unwrap();
    worker.notify("bob hip done").await?;
    exchange
        .producer()
        .await?
        .send("specialist.hip", "carl hip", MessageProperties::default())
        .await?;

    let log = recv(&mut observed).await;
    assert_eq!((log.routing_key.as_str(), log.body.as_str()), ("hosp.log", "bob hip done"));
    let req = recv(&mut observed).await;
    assert_eq!(req.routing_key, "specialist.hip");
    assert_eq!(recv(&mut rx).await.body, "carl hip");
    // log notifications are not broadcasts
    assert_quiet(&mut info).await;
    Ok(())
}

#[tokio::test]
async fn unacked_delivery_stalls_its_consumer() -> Result<(), MessagingError> {
    setup();
    let exchange = MemoryExchange::default();
    let producer = exchange.producer().await?;

    let (stall, mut stalled) = Stall::new();
    let mut first = exchange.consumer().await?;
    first
        .bind(Binding::shared("specialist.knee", "knee"), stall)
        .await?;
    let first_task = bus::spawn("knee-1", first);

    producer
        .send("specialist.knee", "one", MessageProperties::default())
        .await?;
    producer
        .send("specialist.knee", "two", MessageProperties::default())
        .await?;

    assert_eq!(recv(&mut stalled).await.body, "one");
    assert_quiet(&mut stalled).await;
    assert_eq!(exchange.queue_depth("knee"), Some(1));

    // a competing consumer gets the waiting message, never the unacked one
    let (handler, mut rx) = Recorder::new();
    let mut second = exchange.consumer().await?;
    second
        .bind(Binding::shared("specialist.knee", "knee"), handler)
        .await?;
    let _second_task = bus::spawn("knee-2", second);
    let got = recv(&mut rx).await;
    assert_eq!(got.body, "two");
    assert!(!got.redelivered);
    assert_quiet(&mut rx).await;

    // closing the stalled session hands the message back to the queue
    drop(first_task);
    let again = recv(&mut rx).await;
    assert_eq!(again.body, "one");
    assert!(again.redelivered);
    assert_quiet(&mut stalled).await;
    Ok(())
}

struct NackOnce {
    nacked: AtomicBool,
    tx: mpsc::Sender<Delivery>,
}

#[async_trait]
impl DeliveryHandler for NackOnce {
    async fn handle(&self, delivery: Delivery, ack: AckHandle) -> Result<(), MessagingError> {
        let _ = self.tx.send(delivery).await;
        if self.nacked.swap(true, Ordering::SeqCst) {
            ack.ack().await
        } else {
            ack.nack(true).await
        }
    }
}

#[tokio::test]
async fn nack_with_requeue_redelivers() -> Result<(), MessagingError> {
    setup();
    let exchange = MemoryExchange::default();
    let (tx, mut rx) = mpsc::channel(8);
    let mut consumer = exchange.consumer().await?;
    consumer
        .bind(
            Binding::shared("specialist.elbow", "elbow"),
            Arc::new(NackOnce {
                nacked: AtomicBool::new(false),
                tx,
            }),
        )
        .await?;
    let _task = bus::spawn("elbow", consumer);

    exchange
        .producer()
        .await?
        .send("specialist.elbow", "dana elbow", MessageProperties::default())
        .await?;

    let first = recv(&mut rx).await;
    let second = recv(&mut rx).await;
    assert!(!first.redelivered);
    assert!(second.redelivered);
    assert_eq!(second.body, "dana elbow");
    assert_quiet(&mut rx).await;
    assert_eq!(exchange.queue_depth("elbow"), Some(0));
    Ok(())
}

#[tokio::test]
async fn anonymous_queues_go_away_with_their_session() -> Result<(), MessagingError> {
    setup();
    let exchange = MemoryExchange::default();
    let worker = HospitalWorker::connect(&exchange, "temp").await?;
    let queue = worker.info_queue().to_string();
    assert!(queue.starts_with("amq.gen-"));
    assert!(exchange.has_queue(&queue));
    assert_eq!(exchange.bindings_of(&queue), ["hosp.info"]);

    drop(worker);
    assert!(eventually(|| !exchange.has_queue(&queue)).await);
    assert!(exchange.bindings_of(&queue).is_empty());
    Ok(())
}

#[tokio::test]
async fn broker_loss_is_fatal_for_every_session() -> Result<(), MessagingError> {
    setup();
    let exchange = MemoryExchange::default();
    let (handler, _rx) = Recorder::new();
    let mut consumer = exchange.consumer().await?;
    consumer.bind(Binding::topic("#"), handler).await?;
    let task = bus::spawn("doomed", consumer);
    let producer = exchange.producer().await?;

    exchange.close();

    let err = task.join().await.unwrap_err();
    assert!(err.is_fatal());
    let err = producer
        .send("hosp.log", "lost", MessageProperties::default())
        .await
        .unwrap_err();
    assert!(err.is_fatal());
    assert!(exchange.consumer().await.is_err());
    assert!(HospitalWorker::connect(&exchange, "late").await.is_err());
    Ok(())
}

#[tokio::test]
async fn broker_loss_ends_a_stalled_consumer() -> Result<(), MessagingError> {
    setup();
    let exchange = MemoryExchange::default();
    let (stall, mut stalled) = Stall::new();
    let mut consumer = exchange.consumer().await?;
    consumer
        .bind(Binding::shared("specialist.knee", "knee"), stall)
        .await?;
    let task = bus::spawn("knee", consumer);

    exchange
        .producer()
        .await?
        .send("specialist.knee", "lia knee", MessageProperties::default())
        .await?;
    recv(&mut stalled).await;

    exchange.close();
    let err = tokio::time::timeout(common::WAIT, task.join())
        .await
        .expect("stalled consumer never noticed the broker going away")
        .unwrap_err();
    assert!(err.is_fatal());
    Ok(())
}

#[tokio::test]
async fn an_unsettled_queue_does_not_stall_its_siblings() -> Result<(), MessagingError> {
    setup();
    let exchange = MemoryExchange::default();
    let (stall, mut stalled) = Stall::new();
    let (handler, mut rx) = Recorder::new();
    let mut consumer = exchange.consumer().await?;
    consumer
        .bind(Binding::shared("specialist.knee", "knee"), stall)
        .await?;
    consumer
        .bind(Binding::shared("specialist.hip", "hip"), handler)
        .await?;
    let _task = bus::spawn("knee+hip", consumer);

    let producer = exchange.producer().await?;
    for (key, body) in [
        ("specialist.knee", "one"),
        ("specialist.knee", "two"),
        ("specialist.hip", "a"),
    ] {
        producer.send(key, body, MessageProperties::default()).await?;
    }

    assert_eq!(recv(&mut stalled).await.body, "one");
    assert_eq!(recv(&mut rx).await.body, "a");
    producer
        .send("specialist.hip", "b", MessageProperties::default())
        .await?;
    assert_eq!(recv(&mut rx).await.body, "b");

    assert_quiet(&mut stalled).await;
    assert_eq!(exchange.queue_depth("knee"), Some(1));
    Ok(())
}

#[tokio::test]
async fn unread_role_events_are_capped() -> Result<(), MessagingError> {
    setup();
    let exchange = MemoryExchange::default();
    let mut admin = Administrator::connect(&exchange).await?;
    let producer = exchange.producer().await?;

    let total = EVENT_BUFFER * 2;
    for i in 0..total {
        producer
            .send("hosp.log", &format!("note {i}"), MessageProperties::default())
            .await?;
    }
    let queue = admin.sniff_queue().to_string();
    assert!(eventually(|| exchange.queue_depth(&queue) == Some(0)).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut observed = admin.take_observed().unwrap();
    let mut kept = 0;
    while observed.try_recv().is_ok() {
        kept += 1;
    }
    assert_eq!(kept, EVENT_BUFFER);

    // the sniffer keeps going once someone reads
    producer
        .send("hosp.log", "after", MessageProperties::default())
        .await?;
    assert_eq!(recv(&mut observed).await.body, "after");
    Ok(())
}

#[tokio::test]
async fn invalid_patterns_are_rejected_at_bind() -> Result<(), MessagingError> {
    setup();
    let exchange = MemoryExchange::default();
    let (handler, _rx) = Recorder::new();
    let mut consumer = exchange.consumer().await?;
    let err = consumer
        .bind(Binding::topic("specialist..knee"), handler)
        .await
        .unwrap_err();
    assert_eq!(err.as_label(), "invalid_routing_key");
    assert!(consumer.run().await.is_err());
    Ok(())
}
