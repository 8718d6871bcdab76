//! Dispatch Loop: decodes bus messages and fans them out through the
//! Subscription Registry.
//!
//! One task per user subscription — spawned by
//! [`crate::registry::SubscriptionRegistry::subscribe`] when a user's first
//! handle attaches, aborted when their last handle detaches. A message whose
//! subject doesn't decode, or decodes to someone else, is logged and
//! dropped rather than delivered.

use crate::bus::Subscription;
use crate::model::UserId;
use crate::registry::SubscriptionRegistry;

/// Spawn the loop draining `subscription` and forwarding every message to
/// `registry.deliver(user, ..)`. The subject on each `BusMessage` is
/// expected to decode back to `user` — anything else indicates either a
/// broker bug or a subject collision, and is logged and dropped rather than
/// delivered to the wrong mailbox.
pub fn spawn(
    mut subscription: Subscription,
    user: UserId,
    registry: SubscriptionRegistry,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = subscription.receiver.recv().await {
            let Some(decoded_user) = crate::subject::decode(&message.subject) else {
                tracing::warn!(subject = %message.subject, "dropping bus message with undecodable subject");
                continue;
            };
            if decoded_user != user {
                tracing::warn!(
                    subject = %message.subject,
                    expected_user = %user,
                    decoded_user = %decoded_user,
                    "dropping bus message routed to the wrong subscription"
                );
                continue;
            }
            registry.deliver(user, &message.payload).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{LocalBus, MessageBus};
    use crate::registry::{Handle, HandleKind};
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;

    #[tokio::test]
    async fn forwards_decodable_message_to_registry_handles() {
        let bus = Arc::new(LocalBus::new());
        let registry = SubscriptionRegistry::new(bus.clone(), Duration::from_secs(900));
        let user = UserId(Uuid::from_u128(1));

        let (handle, mut rx, _close) = Handle::new(HandleKind::Sse);
        registry.subscribe(user, handle).await;

        let subject = crate::subject::encode(user);
        bus.publish(&subject, "hello".into()).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("message delivered before timeout")
            .unwrap();
        assert_eq!(received, "hello");
    }

    #[tokio::test]
    async fn drops_message_with_subject_for_a_different_user() {
        let bus = Arc::new(LocalBus::new());
        let registry = SubscriptionRegistry::new(bus.clone(), Duration::from_secs(900));
        let user = UserId(Uuid::from_u128(1));
        let other = UserId(Uuid::from_u128(2));

        let (handle, mut rx, _close) = Handle::new(HandleKind::Sse);
        registry.subscribe(user, handle).await;

        // Directly exercise the loop's guard by publishing under the
        // subscribed subject but constructing the scenario so the decoded
        // user would differ is not reachable through the public subject
        // codec (it is a bijection); instead verify the happy path is the
        // only path taken by confirming an unrelated subject never reaches
        // this user's registry entry.
        let unrelated_subject = crate::subject::encode(other);
        bus.publish(&unrelated_subject, "misrouted".into())
            .await
            .unwrap();

        let result = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(result.is_err(), "no message should have been delivered");
    }
}
