//! The future returned by [`AwaitableSender::send`](super::AwaitableSender::send)

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use pin_project_lite::pin_project;
use tokio::sync::oneshot;

use crate::{engine::Delivery, error::Error};

pub(crate) type Outcome = Result<Delivery, Error>;

pin_project! {
    /// A future for a delivery that can be `await`ed for the disposition
    /// from the receiver
    #[derive(Debug)]
    pub struct DeliveryFut {
        delivery_id: Option<u32>,
        #[pin]
        outcome: oneshot::Receiver<Outcome>,
    }
}

impl DeliveryFut {
    pub(crate) fn new(delivery_id: u32, outcome: oneshot::Receiver<Outcome>) -> Self {
        Self {
            delivery_id: Some(delivery_id),
            outcome,
        }
    }

    /// A future that resolves to `outcome` right away
    pub(crate) fn ready(outcome: Outcome) -> Self {
        let (tx, rx) = oneshot::channel();
        let delivery_id = outcome.as_ref().ok().map(|delivery| delivery.id);
        let _ = tx.send(outcome);
        Self {
            delivery_id,
            outcome: rx,
        }
    }

    /// Id of the delivery, if the message was handed to the engine
    pub fn delivery_id(&self) -> Option<u32> {
        self.delivery_id
    }
}

impl Future for DeliveryFut {
    type Output = Outcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match this.outcome.poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            // The sender was dropped along with every pending delivery
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Closed(format!(
                "The outcome of delivery {:?} was dropped",
                this.delivery_id
            )))),
        }
    }
}
