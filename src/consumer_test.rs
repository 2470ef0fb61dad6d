use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};

use crate::assignment::AssignmentView;
use crate::config::ConsumerConfig;
use crate::consumer::{PushConsumer, ServiceState};
use crate::error::ConsumerError;
use crate::fixtures::{self, MemoryBroker, RecordingHandler};
use crate::handler::MessageListener;
use crate::message::{ConsumeOutcome, QueueHandle};
use crate::offset::{MemoryOffsetStore, OffsetStore, SledOffsetStore, StartingPoint};

const WAIT: Duration = Duration::from_secs(5);

struct Setup {
    broker: Arc<MemoryBroker>,
    store: Arc<MemoryOffsetStore>,
    assignment: AssignmentView,
    consumer: PushConsumer,
}

fn setup(config: ConsumerConfig, queues: &[QueueHandle]) -> Result<Setup> {
    let broker = Arc::new(MemoryBroker::default());
    let store = Arc::new(MemoryOffsetStore::new());
    let assignment = AssignmentView::new(queues.iter().cloned().collect());
    let consumer = PushConsumer::new(config, broker.clone(), assignment.clone(), store.clone())?;
    Ok(Setup {
        broker,
        store,
        assignment,
        consumer,
    })
}

fn from_beginning() -> ConsumerConfig {
    ConsumerConfig {
        starting_point: StartingPoint::Beginning,
        ..fixtures::test_config()
    }
}

fn delivered_on(handler: &RecordingHandler, queue: &QueueHandle) -> Vec<u64> {
    let mut offsets: Vec<_> = handler.deliveries().iter().filter(|msg| &msg.queue == queue).map(|msg| msg.offset).collect();
    offsets.sort_unstable();
    offsets
}

#[tokio::test]
async fn tag_filtered_consumption_commits_every_offset() -> Result<()> {
    fixtures::setup_tracing();
    let queue = fixtures::queue(0);
    let setup = setup(from_beginning(), &[queue.clone()])?;
    let handler = Arc::new(RecordingHandler::new());
    setup.consumer.register_message_listener(MessageListener::Concurrent(handler.clone()))?;
    setup.consumer.subscribe("orders", "vip || urgent")?;
    setup.broker.publish(fixtures::message(&queue, 0).with_tag("vip"));
    setup.broker.publish(fixtures::message(&queue, 1).with_tag("normal"));
    setup.broker.publish(fixtures::message(&queue, 2).with_tag("urgent"));

    setup.consumer.start().await?;
    fixtures::wait_for_commit(&setup.store, &queue, 2, WAIT).await?;
    setup.consumer.shutdown().await;

    assert_eq!(delivered_on(&handler, &queue), vec![0, 2], "expected only vip and urgent messages to be delivered");
    assert_eq!(setup.consumer.state(), ServiceState::ShutdownAlready, "unexpected state after shutdown");

    Ok(())
}

#[tokio::test]
async fn ordered_consumption_suspends_and_redelivers() -> Result<()> {
    fixtures::setup_tracing();
    let queue = fixtures::queue(0);
    let config = ConsumerConfig {
        starting_point: StartingPoint::Offset(10),
        suspend_queue_ms: 200,
        ..fixtures::test_config()
    };
    let setup = setup(config, &[queue.clone()])?;
    let handler = Arc::new(RecordingHandler::with_script(|msgs, _ctx| {
        if msgs[0].offset == 11 && msgs[0].reconsume_count == 0 {
            return Ok(ConsumeOutcome::SuspendQueueAndRetry);
        }
        Ok(ConsumeOutcome::Success)
    }));
    setup.consumer.register_message_listener(MessageListener::Orderly(handler.clone()))?;
    setup.consumer.subscribe("orders", "*")?;
    for offset in 10..13 {
        setup.broker.publish(fixtures::message(&queue, offset));
    }

    setup.consumer.start().await?;
    fixtures::eventually(WAIT, "offsets 10 and 11 to be delivered", || handler.delivery_count() == 2).await?;
    let committable = setup.consumer.committable(&queue).await;
    assert_eq!(committable, Some(10), "expected commit to stop below the suspended offset, got {:?}", committable);

    fixtures::wait_for_commit(&setup.store, &queue, 12, WAIT).await?;
    assert_eq!(handler.delivered_offsets(), vec![10, 11, 11, 12], "expected strict offset order with redelivery of 11");
    setup.consumer.shutdown().await;

    Ok(())
}

#[tokio::test]
async fn suspended_consumer_delivers_nothing_until_resumed() -> Result<()> {
    fixtures::setup_tracing();
    let queue = fixtures::queue(0);
    let setup = setup(from_beginning(), &[queue.clone()])?;
    let handler = Arc::new(RecordingHandler::new());
    setup.consumer.register_message_listener(MessageListener::Concurrent(handler.clone()))?;
    setup.consumer.subscribe("orders", "*")?;
    for offset in 0..3 {
        setup.broker.publish(fixtures::message(&queue, offset));
    }

    setup.consumer.suspend();
    setup.consumer.start().await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(setup.consumer.is_suspended(), "expected consumer to report suspension");
    assert_eq!(handler.delivery_count(), 0, "expected no deliveries while suspended");

    setup.consumer.resume();
    fixtures::wait_for_commit(&setup.store, &queue, 2, WAIT).await?;
    assert_eq!(delivered_on(&handler, &queue), vec![0, 1, 2], "expected all messages after resume");
    setup.consumer.shutdown().await;

    Ok(())
}

#[tokio::test]
async fn stuck_message_holds_the_committed_offset() -> Result<()> {
    fixtures::setup_tracing();
    let queue = fixtures::queue(0);
    let config = ConsumerConfig {
        retry_delay_initial_ms: 60_000,
        retry_delay_max_ms: 60_000,
        shutdown_grace_ms: 100,
        ..from_beginning()
    };
    let setup = setup(config, &[queue.clone()])?;
    let handler = Arc::new(RecordingHandler::with_script(|msgs, _ctx| match msgs[0].offset {
        2 => Ok(ConsumeOutcome::RetryLater),
        _ => Ok(ConsumeOutcome::Success),
    }));
    setup.consumer.register_message_listener(MessageListener::Concurrent(handler.clone()))?;
    setup.consumer.subscribe("orders", "*")?;
    for offset in 0..5 {
        setup.broker.publish(fixtures::message(&queue, offset));
    }

    setup.consumer.start().await?;
    fixtures::eventually(WAIT, "all offsets to be delivered", || handler.delivery_count() == 5).await?;
    fixtures::wait_for_commit(&setup.store, &queue, 1, WAIT).await?;
    setup.consumer.shutdown().await;

    let stored = setup.store.stored(&queue).await;
    assert_eq!(stored, Some(1), "expected the commit to stop below the stuck offset 2, got {:?}", stored);

    Ok(())
}

#[tokio::test]
async fn invocation_finishing_within_the_grace_period_is_committed() -> Result<()> {
    fixtures::setup_tracing();
    let queue = fixtures::queue(0);
    let config = ConsumerConfig {
        shutdown_grace_ms: 2_000,
        ..from_beginning()
    };
    let setup = setup(config, &[queue.clone()])?;
    let handler = Arc::new(RecordingHandler::new().gated());
    setup.consumer.register_message_listener(MessageListener::Concurrent(handler.clone()))?;
    setup.consumer.subscribe("orders", "*")?;
    setup.broker.publish(fixtures::message(&queue, 0));

    setup.consumer.start().await?;
    fixtures::eventually(WAIT, "offset 0 to be delivered", || handler.delivery_count() == 1).await?;
    tokio::join!(setup.consumer.shutdown(), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handler.release(1);
    });

    let stored = setup.store.stored(&queue).await;
    assert_eq!(stored, Some(0), "expected the final commit to include the offset released during shutdown, got {:?}", stored);

    Ok(())
}

#[tokio::test]
async fn lifecycle_violations_are_rejected() -> Result<()> {
    fixtures::setup_tracing();
    let setup = setup(from_beginning(), &[fixtures::queue(0)])?;
    let handler = Arc::new(RecordingHandler::new());

    match setup.consumer.start().await {
        Err(ConsumerError::IllegalState(_)) => (),
        other => bail!("expected start without a listener to fail with IllegalState, got {:?}", other),
    }
    assert_eq!(setup.consumer.state(), ServiceState::StartFailed, "unexpected state after a failed start");
    match setup.consumer.register_message_listener(MessageListener::Concurrent(handler)) {
        Err(ConsumerError::IllegalState(_)) => (),
        other => bail!("expected listener registration after a failed start to be rejected, got {:?}", other),
    }

    setup.consumer.shutdown().await;
    setup.consumer.shutdown().await;
    assert_eq!(setup.consumer.state(), ServiceState::ShutdownAlready, "unexpected state after shutdown");
    match setup.consumer.subscribe("orders", "*") {
        Err(ConsumerError::IllegalState(_)) => (),
        other => bail!("expected subscribe after shutdown to fail with IllegalState, got {:?}", other),
    }
    match setup.consumer.unsubscribe("orders") {
        Err(ConsumerError::IllegalState(_)) => (),
        other => bail!("expected unsubscribe after shutdown to fail with IllegalState, got {:?}", other),
    }

    Ok(())
}

#[tokio::test]
async fn double_start_is_rejected() -> Result<()> {
    fixtures::setup_tracing();
    let setup = setup(from_beginning(), &[fixtures::queue(0)])?;
    setup.consumer.register_message_listener(MessageListener::Concurrent(Arc::new(RecordingHandler::new())))?;

    setup.consumer.start().await?;
    match setup.consumer.start().await {
        Err(ConsumerError::IllegalState(_)) => (),
        other => bail!("expected a second start to fail with IllegalState, got {:?}", other),
    }
    assert_eq!(setup.consumer.state(), ServiceState::Running, "expected the consumer to keep running");
    setup.consumer.shutdown().await;

    Ok(())
}

#[tokio::test]
async fn invalid_expressions_and_pool_sizes_are_rejected() -> Result<()> {
    fixtures::setup_tracing();
    let setup = setup(from_beginning(), &[fixtures::queue(0)])?;

    match setup.consumer.subscribe("orders", "vip ||") {
        Err(err @ ConsumerError::InvalidFilterExpression { .. }) => assert!(err.is_configuration_error(), "expected a configuration error"),
        other => bail!("expected an invalid filter expression error, got {:?}", other),
    }
    assert!(!setup.consumer.subscriptions().is_subscribed("orders"), "expected a failed subscribe to install nothing");
    match setup.consumer.update_core_pool_size(0) {
        Err(ConsumerError::InvalidArgument(_)) => (),
        other => bail!("expected a zero pool size to be rejected, got {:?}", other),
    }
    setup.consumer.update_core_pool_size(2)?;

    Ok(())
}

#[tokio::test]
async fn resubscribing_with_the_same_expression_is_a_noop() -> Result<()> {
    fixtures::setup_tracing();
    let setup = setup(from_beginning(), &[fixtures::queue(0)])?;

    setup.consumer.subscribe("orders", "vip || urgent")?;
    let first = setup.consumer.subscriptions().get("orders");
    setup.consumer.subscribe("orders", "vip || urgent")?;
    let second = setup.consumer.subscriptions().get("orders");

    match (first, second) {
        (Some(first), Some(second)) => assert!(Arc::ptr_eq(&first, &second), "expected the original subscription to be kept"),
        other => bail!("expected subscriptions to be installed, got {:?}", other),
    }

    Ok(())
}

#[tokio::test]
async fn revoked_queue_is_committed_and_released() -> Result<()> {
    fixtures::setup_tracing();
    let (q0, q1) = (fixtures::queue(0), fixtures::queue(1));
    let setup = setup(from_beginning(), &[q0.clone(), q1.clone()])?;
    let handler = Arc::new(RecordingHandler::new());
    setup.consumer.register_message_listener(MessageListener::Concurrent(handler.clone()))?;
    setup.consumer.subscribe("orders", "*")?;
    for offset in 0..2 {
        setup.broker.publish(fixtures::message(&q0, offset));
        setup.broker.publish(fixtures::message(&q1, offset));
    }

    setup.consumer.start().await?;
    fixtures::wait_for_commit(&setup.store, &q1, 1, WAIT).await?;
    setup.assignment.update(BTreeSet::from([q0.clone()]));
    let released = async {
        while setup.consumer.committable(&q1).await.is_some() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(WAIT, released).await?;

    setup.broker.publish(fixtures::message(&q0, 2));
    setup.broker.publish(fixtures::message(&q1, 2));
    fixtures::wait_for_commit(&setup.store, &q0, 2, WAIT).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(delivered_on(&handler, &q1), vec![0, 1], "expected no delivery from a revoked queue");
    assert_eq!(setup.store.stored(&q1).await, Some(1), "expected the revoked queue's progress to be kept");
    setup.consumer.shutdown().await;

    Ok(())
}

#[tokio::test]
async fn unsubscribed_topic_stops_consumption() -> Result<()> {
    fixtures::setup_tracing();
    let orders = fixtures::queue(0);
    let payments = QueueHandle::new("payments", 0, "broker-a");
    let setup = setup(from_beginning(), &[orders.clone(), payments.clone()])?;
    let handler = Arc::new(RecordingHandler::new());
    setup.consumer.register_message_listener(MessageListener::Concurrent(handler.clone()))?;
    setup.consumer.subscribe("orders", "*")?;
    setup.consumer.subscribe("payments", "*")?;
    setup.broker.publish(fixtures::message(&payments, 0));

    setup.consumer.start().await?;
    fixtures::wait_for_commit(&setup.store, &payments, 0, WAIT).await?;
    setup.consumer.unsubscribe("payments")?;
    let released = async {
        while setup.consumer.committable(&payments).await.is_some() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(WAIT, released).await?;

    setup.broker.publish(fixtures::message(&payments, 1));
    setup.broker.publish(fixtures::message(&orders, 0));
    fixtures::wait_for_commit(&setup.store, &orders, 0, WAIT).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(delivered_on(&handler, &payments), vec![0], "expected no delivery after unsubscribe");
    setup.consumer.shutdown().await;

    Ok(())
}

#[tokio::test]
async fn latest_starting_point_skips_existing_messages() -> Result<()> {
    fixtures::setup_tracing();
    let queue = fixtures::queue(0);
    let setup = setup(fixtures::test_config(), &[queue.clone()])?;
    let handler = Arc::new(RecordingHandler::new());
    setup.consumer.register_message_listener(MessageListener::Concurrent(handler.clone()))?;
    setup.consumer.subscribe("orders", "*")?;
    for offset in 0..3 {
        setup.broker.publish(fixtures::message(&queue, offset));
    }

    setup.consumer.start().await?;
    fixtures::eventually(WAIT, "the first pull to be issued", || setup.broker.pull_count() >= 1).await?;
    setup.broker.publish(fixtures::message(&queue, 3));
    fixtures::wait_for_commit(&setup.store, &queue, 3, WAIT).await?;
    setup.consumer.shutdown().await;

    assert_eq!(delivered_on(&handler, &queue), vec![3], "expected only messages written after start");

    Ok(())
}

#[tokio::test]
async fn restarted_consumer_resumes_from_stored_offset() -> Result<()> {
    fixtures::setup_tracing();
    let tmpdir = tempfile::tempdir()?;
    let store: Arc<dyn OffsetStore> = Arc::new(SledOffsetStore::open(tmpdir.path()).await?);
    let broker = Arc::new(MemoryBroker::default());
    let queue = fixtures::queue(0);
    let assignment = AssignmentView::new(BTreeSet::from([queue.clone()]));
    for offset in 0..3 {
        broker.publish(fixtures::message(&queue, offset));
    }

    let first_handler = Arc::new(RecordingHandler::new());
    let first = PushConsumer::new(from_beginning(), broker.clone(), assignment.clone(), store.clone())?;
    first.register_message_listener(MessageListener::Concurrent(first_handler.clone()))?;
    first.subscribe("orders", "*")?;
    first.start().await?;
    fixtures::eventually(WAIT, "the first consumer to finish", || first_handler.delivery_count() == 3).await?;
    first.shutdown().await;
    assert_eq!(store.load_offset(&queue).await?, Some(2), "expected the final commit at shutdown");

    for offset in 3..5 {
        broker.publish(fixtures::message(&queue, offset));
    }
    let second_handler = Arc::new(RecordingHandler::new());
    let second = PushConsumer::new(from_beginning(), broker.clone(), assignment, store.clone())?;
    second.register_message_listener(MessageListener::Concurrent(second_handler.clone()))?;
    second.subscribe("orders", "*")?;
    second.start().await?;
    fixtures::eventually(WAIT, "the second consumer to consume new messages", || second_handler.delivery_count() == 2).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    second.shutdown().await;

    assert_eq!(delivered_on(&second_handler, &queue), vec![3, 4], "expected consumption to resume after the stored offset");
    assert_eq!(store.load_offset(&queue).await?, Some(4), "unexpected stored offset after restart");

    Ok(())
}
