#![allow(dead_code)]

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hospital_messaging_core::{AckHandle, Delivery, DeliveryHandler, MessagingError};
use tokio::sync::mpsc;

pub const WAIT: Duration = Duration::from_secs(5);
pub const QUIET: Duration = Duration::from_millis(200);
const CAPACITY: usize = 1024;

pub fn setup() {
    hospital_messaging_core::logging::init_tracing();
}

pub async fn recv<T>(rx: &mut mpsc::Receiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("channel closed")
}

pub async fn assert_quiet<T: Debug>(rx: &mut mpsc::Receiver<T>) {
    if let Ok(Some(unexpected)) = tokio::time::timeout(QUIET, rx.recv()).await {
        panic!("unexpected message: {unexpected:?}");
    }
}

/// Polls `cond` until it holds or `WAIT` elapses.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Forwards every delivery and acks it.
pub struct Recorder(mpsc::Sender<Delivery>);

impl Recorder {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<Delivery>) {
        let (tx, rx) = mpsc::channel(CAPACITY);
        (Arc::new(Self(tx)), rx)
    }
}

#[async_trait]
impl DeliveryHandler for Recorder {
    async fn handle(&self, delivery: Delivery, ack: AckHandle) -> Result<(), MessagingError> {
        let _ = self.0.send(delivery).await;
        ack.ack().await
    }
}

/// Forwards every delivery and fails without settling it.
pub struct Stall(mpsc::Sender<Delivery>);

impl Stall {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<Delivery>) {
        let (tx, rx) = mpsc::channel(CAPACITY);
        (Arc::new(Self(tx)), rx)
    }
}

#[async_trait]
impl DeliveryHandler for Stall {
    async fn handle(&self, delivery: Delivery, _ack: AckHandle) -> Result<(), MessagingError> {
        let _ = self.0.send(delivery).await;
        Err(MessagingError::Handler("examination crashed".into()))
    }
}
