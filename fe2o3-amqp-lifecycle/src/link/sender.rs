//! Sending link

use std::ops::Deref;

use crate::{
    context::EventContext,
    engine::{Delivery, EventEmitter, Message},
    entity::Entity,
    error::{Error, InsufficientCreditError},
};

use super::Link;

/// A sending link.
///
/// Dereferences to [`Link`] for the state and lifecycle shared with
/// receivers.
#[derive(Debug, Clone)]
pub struct Sender {
    link: Link,
}

impl From<Link> for Sender {
    fn from(link: Link) -> Self {
        Self { link }
    }
}

impl Deref for Sender {
    type Target = Link;

    fn deref(&self) -> &Self::Target {
        &self.link
    }
}

impl Entity for Sender {
    fn events(&self) -> &EventEmitter<EventContext> {
        self.link.events()
    }
}

impl Sender {
    /// Whether a message can be sent right away
    pub fn sendable(&self) -> bool {
        self.link.raw().sendable()
    }

    /// Hands a message to the engine.
    ///
    /// Returns as soon as the transfer is queued; the outcome is reported
    /// through the `accepted`, `rejected`, `released` and `modified` events.
    /// Use an [`AwaitableSender`](super::AwaitableSender) to await it
    /// instead.
    pub fn send(
        &self,
        message: Message,
        tag: Option<Vec<u8>>,
        format: Option<u32>,
    ) -> Result<Delivery, Error> {
        if !self.sendable() {
            return Err(InsufficientCreditError {
                link: self.name().to_string(),
            }
            .into());
        }
        let delivery = self.link.raw().send(message, tag, format)?;

        #[cfg(feature = "tracing")]
        tracing::trace!(link = %self.name(), delivery_id = delivery.id, "sent");
        #[cfg(feature = "log")]
        log::trace!("{} sent delivery {}", self.name(), delivery.id);

        Ok(delivery)
    }

    /// Reports that the credit was used up after the receiver asked to drain
    pub fn set_drained(&self, drained: bool) {
        self.link.raw().set_drained(drained)
    }

    /// Whether the receiver asked to drain the credit
    pub fn is_draining(&self) -> bool {
        self.link.raw().is_draining()
    }

    /// The underlying link
    pub fn into_link(self) -> Link {
        self.link
    }
}
