//! Tests for the consumption loop.

use super::*;
use crate::envelope::TopicEnvelope;
use crate::error::TransportError;
use crate::message::{Attributes, MessageId, ReceiptHandle, TopicArn};
use crate::metrics::InMemorySink;
use crate::providers::InMemoryBroker;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

// ============================================================================
// Test Helper Functions
// ============================================================================

fn queue() -> QueueUrl {
    QueueUrl::new("https://sqs.us-east-1.amazonaws.com/123456789012/results".to_string()).unwrap()
}

fn topic() -> TopicArn {
    TopicArn::new("arn:aws:sns:us-east-1:123456789012:monitoring".to_string()).unwrap()
}

fn pipe_attributes(pipe: &str) -> Attributes {
    let mut attributes = Attributes::new();
    attributes.insert("pipe".to_string(), pipe.to_string());
    attributes
}

fn raw(body: &str, pipe: &str) -> ReceivedMessage {
    ReceivedMessage::new(
        MessageId::new(),
        body,
        pipe_attributes(pipe),
        ReceiptHandle::new(format!("receipt-{}", body)),
    )
}

fn encapsulated_body(body: &str, pipe: &str) -> String {
    TopicEnvelope::new(&MessageId::new(), &topic(), body, &pipe_attributes(pipe))
        .to_json()
        .unwrap()
}

fn quick_settings() -> ConsumerSettings {
    ConsumerSettings {
        wait_time: Duration::ZERO,
        ..ConsumerSettings::default()
    }
}

/// Handler forwarding every message it receives to a channel
fn forwarding_handler() -> (Arc<dyn MessageHandler>, mpsc::UnboundedReceiver<ReceivedMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |message: ReceivedMessage| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(message);
        }
    };
    (Arc::new(handler), rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<ReceivedMessage>) -> Vec<ReceivedMessage> {
    let mut messages = Vec::new();
    while let Ok(message) = rx.try_recv() {
        messages.push(message);
    }
    messages
}

/// Queue client replaying scripted receive results, then empty batches
#[derive(Default)]
struct ScriptedQueue {
    script: Mutex<VecDeque<Result<Vec<ReceivedMessage>, TransportError>>>,
    receives: AtomicUsize,
}

impl ScriptedQueue {
    fn new(script: Vec<Result<Vec<ReceivedMessage>, TransportError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            receives: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl QueueClient for ScriptedQueue {
    async fn receive_messages(
        &self,
        _queue: &QueueUrl,
        request: &ReceiveRequest,
    ) -> Result<Vec<ReceivedMessage>, TransportError> {
        self.receives.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            None => {
                tokio::time::sleep(request.wait_time.max(Duration::from_millis(10))).await;
                Ok(Vec::new())
            }
        }
    }

    async fn delete_message(
        &self,
        _queue: &QueueUrl,
        _receipt: &ReceiptHandle,
    ) -> Result<(), TransportError> {
        Ok(())
    }
}

// ============================================================================
// Routing Tests
// ============================================================================

mod routing {
    use super::*;

    #[test]
    fn test_channel_for_pipe() {
        assert_eq!(Channel::for_pipe("keepalives"), Channel::Keepalives);
        assert_eq!(Channel::for_pipe("results"), Channel::Default);
        assert_eq!(Channel::for_pipe("Keepalives"), Channel::Default);
    }

    #[tokio::test]
    async fn test_resubscribing_replaces_handler() {
        let subscriptions = Arc::new(Subscriptions::new());
        let (first, mut first_rx) = forwarding_handler();
        let (second, mut second_rx) = forwarding_handler();
        subscriptions.register("results", first);
        subscriptions.register("events", second);

        let client = ScriptedQueue::new(vec![Ok(vec![raw("body", "results")])]);
        let consumer = Consumer::new(
            client,
            queue(),
            quick_settings(),
            subscriptions,
            Metrics::disabled(),
        );

        consumer.poll_once().await;

        assert!(drain(&mut first_rx).is_empty());
        assert_eq!(drain(&mut second_rx).len(), 1);
    }

    #[tokio::test]
    async fn test_messages_without_pipe_or_body_are_discarded() {
        let subscriptions = Arc::new(Subscriptions::new());
        let (handler, mut rx) = forwarding_handler();
        subscriptions.register("results", handler);

        let mut other_attribute = Attributes::new();
        other_attribute.insert("type".to_string(), "direct".to_string());
        let batch = vec![
            ReceivedMessage::new(
                MessageId::new(),
                "body",
                other_attribute,
                ReceiptHandle::new("r1".to_string()),
            ),
            raw("", "results"),
            raw("kept", "results"),
        ];
        let consumer = Consumer::new(
            ScriptedQueue::new(vec![Ok(batch)]),
            queue(),
            quick_settings(),
            subscriptions,
            Metrics::disabled(),
        );

        let report = consumer.poll_once().await;

        assert_eq!(report.received, 3);
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.discarded, 2);
        let delivered = drain(&mut rx);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].body, "kept");
    }

    #[tokio::test]
    async fn test_message_for_empty_slot_is_discarded() {
        let subscriptions = Arc::new(Subscriptions::new());
        let (handler, mut rx) = forwarding_handler();
        subscriptions.register("results", handler);

        let consumer = Consumer::new(
            ScriptedQueue::new(vec![Ok(vec![raw("ping", "keepalives")])]),
            queue(),
            quick_settings(),
            subscriptions,
            Metrics::disabled(),
        );

        let report = consumer.poll_once().await;

        assert_eq!(report.dispatched, 0);
        assert_eq!(report.discarded, 1);
        assert!(drain(&mut rx).is_empty());
    }
}

// ============================================================================
// Poll Cycle Tests
// ============================================================================

mod poll_cycle {
    use super::*;

    #[tokio::test]
    async fn test_mixed_batch_dispatches_two_and_discards_one() {
        let broker = InMemoryBroker::default();
        broker.create_queue(&queue()).unwrap();
        broker
            .enqueue_raw(&queue(), "raw result", pipe_attributes("results"))
            .unwrap();
        broker
            .enqueue_raw(&queue(), encapsulated_body("ping", "keepalives"), Attributes::new())
            .unwrap();
        broker
            .enqueue_raw(
                &queue(),
                r#"{"Type":"Notification","MessageAttributes":{"pipe":{"Type":"String","Value":"results"}}}"#,
                Attributes::new(),
            )
            .unwrap();

        let subscriptions = Arc::new(Subscriptions::new());
        let (default_handler, mut default_rx) = forwarding_handler();
        let (keepalive_handler, mut keepalive_rx) = forwarding_handler();
        subscriptions.register("results", default_handler);
        subscriptions.register("keepalives", keepalive_handler);

        let sink = Arc::new(InMemorySink::new());
        let consumer = Consumer::new(
            Arc::new(broker.clone()),
            queue(),
            quick_settings(),
            subscriptions,
            Metrics::new(sink.clone(), 1.0),
        );

        let report = consumer.poll_once().await;

        assert_eq!(report.received, 3);
        assert_eq!(report.dispatched, 2);
        assert_eq!(report.discarded, 1);
        assert!(!report.receive_failed);

        let defaults = drain(&mut default_rx);
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].body, "raw result");

        let keepalives = drain(&mut keepalive_rx);
        assert_eq!(keepalives.len(), 1);
        assert_eq!(keepalives[0].body, "ping");
        assert_eq!(keepalives[0].pipe(), Some("keepalives"));

        assert_eq!(sink.count("sqs.results.message.received"), 3);
        assert_eq!(sink.count("sqs.results.message.discarded"), 1);
        assert_eq!(sink.timings("sqs.results.message.processed"), 2);

        // The next cycle runs against the now empty queue
        let next = consumer.poll_once().await;
        assert_eq!(next, CycleReport::default());
    }

    #[tokio::test]
    async fn test_receive_failure_is_reported_not_raised() {
        let sink = Arc::new(InMemorySink::new());
        let consumer = Consumer::new(
            ScriptedQueue::new(vec![Err(TransportError::ConnectionFailed {
                message: "timeout".to_string(),
            })]),
            queue(),
            quick_settings(),
            Arc::new(Subscriptions::new()),
            Metrics::new(sink.clone(), 1.0),
        );

        let report = consumer.poll_once().await;

        assert!(report.receive_failed);
        assert_eq!(report.received, 0);
        assert_eq!(sink.count("sqs.results.receive.failed"), 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_stop_the_cycle() {
        let subscriptions = Arc::new(Subscriptions::new());
        let handled = Arc::new(AtomicUsize::new(0));
        let counter = handled.clone();
        let handler = move |message: ReceivedMessage| {
            let counter = counter.clone();
            async move {
                if message.body == "boom" {
                    panic!("handler failure");
                }
                counter.fetch_add(1, Ordering::SeqCst);
            }
        };
        subscriptions.register("results", Arc::new(handler));

        let consumer = Consumer::new(
            ScriptedQueue::new(vec![Ok(vec![
                raw("one", "results"),
                raw("boom", "results"),
                raw("two", "results"),
            ])]),
            queue(),
            quick_settings(),
            subscriptions,
            Metrics::disabled(),
        );

        let report = consumer.poll_once().await;

        assert_eq!(report.dispatched, 3);
        assert_eq!(report.handler_panics, 1);
        assert_eq!(handled.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_concurrency_is_bounded() {
        const MAX_IN_FLIGHT: usize = 10;

        let batch: Vec<_> = (0..25).map(|i| raw(&format!("m{}", i), "results")).collect();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (current, highest) = (in_flight.clone(), peak.clone());
        let handler = move |_message: ReceivedMessage| {
            let current = current.clone();
            let highest = highest.clone();
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                highest.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            }
        };
        let subscriptions = Arc::new(Subscriptions::new());
        subscriptions.register("results", Arc::new(handler));

        let consumer = Consumer::new(
            ScriptedQueue::new(vec![Ok(batch)]),
            queue(),
            ConsumerSettings {
                max_in_flight: MAX_IN_FLIGHT,
                ..quick_settings()
            },
            subscriptions,
            Metrics::disabled(),
        );

        let report = consumer.poll_once().await;

        assert_eq!(report.dispatched, 25);
        assert!(peak.load(Ordering::SeqCst) <= MAX_IN_FLIGHT);
        assert!(peak.load(Ordering::SeqCst) > 1);
        assert_eq!(in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_waits_for_all_dispatches() {
        let finished = Arc::new(AtomicUsize::new(0));
        let counter = finished.clone();
        let handler = move |_message: ReceivedMessage| {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(3)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        };
        let subscriptions = Arc::new(Subscriptions::new());
        subscriptions.register("results", Arc::new(handler));

        let consumer = Consumer::new(
            ScriptedQueue::new(vec![Ok(vec![raw("a", "results"), raw("b", "results")])]),
            queue(),
            quick_settings(),
            subscriptions,
            Metrics::disabled(),
        );

        consumer.poll_once().await;

        assert_eq!(finished.load(Ordering::SeqCst), 2);
    }
}

// ============================================================================
// Perpetual Loop Tests
// ============================================================================

mod perpetual_loop {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_loop_keeps_polling_after_receive_failure() {
        let client = ScriptedQueue::new(vec![
            Err(TransportError::ConnectionFailed {
                message: "down".to_string(),
            }),
            Ok(vec![raw("after outage", "results")]),
        ]);
        let subscriptions = Arc::new(Subscriptions::new());
        let (handler, mut rx) = forwarding_handler();
        subscriptions.register("results", handler);

        let started = tokio::time::Instant::now();
        let consumer = Consumer::new(
            client.clone(),
            queue(),
            quick_settings(),
            subscriptions,
            Metrics::disabled(),
        );
        let task = consumer.spawn(&tokio::runtime::Handle::current());

        let message = tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(message.body, "after outage");
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(client.receives.load(Ordering::SeqCst) >= 2);
        assert!(!task.is_finished());
        task.abort();
    }

    #[tokio::test]
    async fn test_loop_picks_up_later_publishes() {
        let broker = InMemoryBroker::default();
        broker.connect_topic(&topic(), &queue()).unwrap();

        let subscriptions = Arc::new(Subscriptions::new());
        let (handler, mut rx) = forwarding_handler();
        subscriptions.register("results", handler);

        let consumer = Consumer::new(
            Arc::new(broker.clone()),
            queue(),
            ConsumerSettings {
                wait_time: Duration::from_secs(1),
                ..ConsumerSettings::default()
            },
            subscriptions,
            Metrics::disabled(),
        );
        let task = consumer.spawn(&tokio::runtime::Handle::current());

        for body in ["first", "second"] {
            crate::client::TopicClient::publish(&broker, &topic(), body, &pipe_attributes("results"))
                .await
                .unwrap();
            let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(message.body, body);
        }

        task.abort();
    }
}
