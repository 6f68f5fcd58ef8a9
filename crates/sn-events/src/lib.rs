//! In-process domain event bus.
//!
//! A type-indexed registry: handlers subscribe to a concrete event type and
//! receive each published event by value. Dispatch is sequential per
//! publish call, so `publish_many` preserves order for any single handler.
//! Handler failures are logged and swallowed; one broken subscriber never
//! stops the others or the publisher. The bus is not durable — durable work
//! goes through the integration engine's repository.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use tracing::{debug, error};

use sn_domain::DomainEvent;

/// Marker for anything publishable on the bus.
pub trait Event: Any + Clone + Send + Sync + fmt::Debug + 'static {}

impl<T: Any + Clone + Send + Sync + fmt::Debug + 'static> Event for T {}

type DynHandler = dyn Fn(&dyn Any) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

struct Registration {
    name: &'static str,
    handler: Arc<DynHandler>,
}

#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<TypeId, Vec<Registration>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for events of type `E`. The handler gets its own
    /// clone of every published event.
    pub fn subscribe<E, F, Fut>(&self, name: &'static str, handler: F)
    where
        E: Event,
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: Arc<DynHandler> = Arc::new(move |any: &dyn Any| {
            // The registry guarantees the TypeId matches; a miss here is a
            // bus bug, not a caller error.
            let event = any
                .downcast_ref::<E>()
                .expect("event type mismatch in bus registry")
                .clone();
            let handler = Arc::clone(&handler);
            Box::pin(async move { handler(event).await })
        });

        self.handlers
            .write()
            .entry(TypeId::of::<E>())
            .or_default()
            .push(Registration { name, handler: erased });
    }

    /// Fans `event` out to every handler registered for its concrete type.
    pub async fn publish<E: Event>(&self, event: &E) {
        let registrations: Vec<(&'static str, Arc<DynHandler>)> = {
            let map = self.handlers.read();
            match map.get(&TypeId::of::<E>()) {
                Some(regs) => regs
                    .iter()
                    .map(|r| (r.name, Arc::clone(&r.handler)))
                    .collect(),
                None => return,
            }
        };

        for (name, handler) in registrations {
            metrics::counter!("events.dispatched_total").increment(1);
            if let Err(e) = handler(event).await {
                metrics::counter!("events.handler_errors_total").increment(1);
                error!(handler = name, error = %e, event = ?event, "Event handler failed");
            }
        }
    }

    /// Publishes one event from the closed domain catalogue.
    pub async fn publish_domain(&self, event: &DomainEvent) {
        debug!(event = event.name(), "Publishing domain event");
        match event {
            DomainEvent::TicketCreated(e) => self.publish(e).await,
            DomainEvent::TicketAssigned(e) => self.publish(e).await,
            DomainEvent::TicketStatusChanged(e) => self.publish(e).await,
            DomainEvent::HubSoftTicketSynced(e) => self.publish(e).await,
            DomainEvent::VerificationStarted(e) => self.publish(e).await,
            DomainEvent::VerificationAttemptMade(e) => self.publish(e).await,
            DomainEvent::VerificationCompleted(e) => self.publish(e).await,
            DomainEvent::VerificationFailed(e) => self.publish(e).await,
            DomainEvent::VerificationExpired(e) => self.publish(e).await,
            DomainEvent::VerificationCancelled(e) => self.publish(e).await,
            DomainEvent::CpfValidated(e) => self.publish(e).await,
            DomainEvent::CpfDuplicateDetected(e) => self.publish(e).await,
            DomainEvent::CpfRemapped(e) => self.publish(e).await,
            DomainEvent::IntegrationScheduled(e) => self.publish(e).await,
            DomainEvent::IntegrationStarted(e) => self.publish(e).await,
            DomainEvent::IntegrationAttemptMade(e) => self.publish(e).await,
            DomainEvent::IntegrationCompleted(e) => self.publish(e).await,
            DomainEvent::IntegrationFailed(e) => self.publish(e).await,
            DomainEvent::IntegrationRetryScheduled(e) => self.publish(e).await,
            DomainEvent::IntegrationCancelled(e) => self.publish(e).await,
            DomainEvent::IntegrationPriorityChanged(e) => self.publish(e).await,
            DomainEvent::HubSoftRateLimitHit(e) => self.publish(e).await,
            DomainEvent::HubSoftConnectionRestored(e) => self.publish(e).await,
            DomainEvent::HubSoftConnectionLost(e) => self.publish(e).await,
            DomainEvent::HubSoftBulkSyncCompleted(e) => self.publish(e).await,
        }
    }

    /// Publishes a batch in order. Per-type ordering towards any single
    /// handler follows from sequential dispatch.
    pub async fn publish_many(&self, events: Vec<DomainEvent>) {
        for event in &events {
            self.publish_domain(event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use sn_domain::events::{TicketCreated, VerificationAttemptMade};
    use sn_domain::{ChatUserId, TicketId, VerificationId};

    fn attempt_event(n: u32) -> VerificationAttemptMade {
        VerificationAttemptMade {
            verification_id: VerificationId("v-1".into()),
            user_id: ChatUserId(1),
            attempt_number: n,
            success: false,
            failure_reason: None,
        }
    }

    #[tokio::test]
    async fn fan_out_reaches_all_handlers() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(0u32));

        for _ in 0..3 {
            let hits = Arc::clone(&hits);
            bus.subscribe("count", move |_: VerificationAttemptMade| {
                let hits = Arc::clone(&hits);
                async move {
                    *hits.lock() += 1;
                    Ok(())
                }
            });
        }

        bus.publish(&attempt_event(1)).await;
        assert_eq!(*hits.lock(), 3);
    }

    #[tokio::test]
    async fn handler_failure_does_not_block_others() {
        let bus = EventBus::new();
        let reached = Arc::new(Mutex::new(false));

        bus.subscribe("broken", |_: VerificationAttemptMade| async {
            anyhow::bail!("subscriber exploded")
        });
        {
            let reached = Arc::clone(&reached);
            bus.subscribe("after", move |_: VerificationAttemptMade| {
                let reached = Arc::clone(&reached);
                async move {
                    *reached.lock() = true;
                    Ok(())
                }
            });
        }

        bus.publish(&attempt_event(1)).await;
        assert!(*reached.lock());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_noop() {
        let bus = EventBus::new();
        bus.publish(&attempt_event(1)).await;
    }

    #[tokio::test]
    async fn publish_many_preserves_per_type_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            bus.subscribe("order", move |e: VerificationAttemptMade| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().push(e.attempt_number);
                    Ok(())
                }
            });
        }

        let events = (1..=5)
            .map(|n| DomainEvent::VerificationAttemptMade(attempt_event(n)))
            .collect();
        bus.publish_many(events).await;
        assert_eq!(*seen.lock(), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn dispatch_is_keyed_by_concrete_type() {
        let bus = EventBus::new();
        let wrong = Arc::new(Mutex::new(false));
        {
            let wrong = Arc::clone(&wrong);
            bus.subscribe("other-type", move |_: TicketCreated| {
                let wrong = Arc::clone(&wrong);
                async move {
                    *wrong.lock() = true;
                    Ok(())
                }
            });
        }

        bus.publish(&attempt_event(1)).await;
        assert!(!*wrong.lock());

        bus.publish(&TicketCreated {
            ticket_id: TicketId(1),
            user_id: ChatUserId(1),
            category: sn_domain::TicketCategory::Others,
            urgency: sn_domain::Urgency::Normal,
            local_protocol: "LOC000001".into(),
        })
        .await;
        assert!(*wrong.lock());
    }
}
