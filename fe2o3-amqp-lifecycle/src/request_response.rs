//! A sender and a receiver on one session, for request-response exchanges

use futures_util::future::join;

use crate::{
    connection::Connection,
    error::Error,
    link::{LinkCloseOptions, Receiver, ReceiverOptions, Sender, SenderOptions},
    session::Session,
    util::AbortSignal,
};

/// A sender and a receiver attached concurrently on a dedicated session
#[derive(Debug, Clone)]
pub struct RequestResponseLink {
    /// The session both links are on
    pub session: Session,

    /// Sends the requests
    pub sender: Sender,

    /// Receives the responses
    pub receiver: Receiver,
}

impl RequestResponseLink {
    pub(crate) async fn create(
        connection: &Connection,
        sender_options: SenderOptions,
        receiver_options: ReceiverOptions,
        abort: Option<&AbortSignal>,
    ) -> Result<Self, Error> {
        let session = connection.create_session(abort).await?;
        let (sender, receiver) = join(
            session.create_sender(sender_options, abort),
            session.create_receiver(receiver_options, abort),
        )
        .await;

        match (sender, receiver) {
            (Ok(sender), Ok(receiver)) => Ok(Self {
                session,
                sender,
                receiver,
            }),
            (Err(err), _) | (_, Err(err)) => {
                if let Err(_close_err) = session.close(None).await {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(session = %session.id(), error = ?_close_err, "failed to end session after failed attach");
                    #[cfg(feature = "log")]
                    log::warn!(
                        "failed to end session {} after failed attach: {:?}",
                        session.id(),
                        _close_err
                    );
                }
                Err(err)
            }
        }
    }

    /// The session and both links are open
    pub fn is_open(&self) -> bool {
        self.session.is_open() && self.sender.is_open() && self.receiver.is_open()
    }

    /// Detaches both links, then ends the session. Every step is attempted;
    /// the first error is returned.
    pub async fn close(&self, abort: Option<AbortSignal>) -> Result<(), Error> {
        let mut options = LinkCloseOptions::default().close_session(false);
        options.abort_signal = abort.clone();

        let sender = self.sender.close(options.clone()).await;
        let receiver = self.receiver.close(options).await;
        let session = self.session.close(abort.as_ref()).await;
        sender.and(receiver).and(session)
    }

    /// Forgets both links and the session without any handshake
    pub fn remove(&self) {
        self.sender.remove();
        self.receiver.remove();
        self.session.remove();
    }
}

#[cfg(test)]
mod tests {
    use fe2o3_amqp_types::definitions::{self, AmqpError};
    use tokio_test::{assert_err, assert_ok};

    use crate::{
        connection::{Connection, ConnectionOptions},
        engine::{
            loopback::{LoopbackEngine, Performative},
            Engine,
        },
        link::{ReceiverOptions, SenderOptions},
    };

    async fn open_connection(engine: &LoopbackEngine) -> Connection {
        let options = ConnectionOptions::default();
        let raw = engine.create_connection("container", &options);
        let connection = Connection::new(raw, options).unwrap();
        connection.open(None).await.unwrap();
        connection
    }

    #[tokio::test]
    async fn both_links_share_one_session() {
        let engine = LoopbackEngine::new();
        let connection = open_connection(&engine).await;
        let link = connection
            .create_request_response_link(
                SenderOptions::default().address("$management"),
                ReceiverOptions::default().address("$management"),
                None,
            )
            .await
            .unwrap();
        assert!(link.is_open());
        assert_eq!(link.sender.session().id(), link.session.id());
        assert_eq!(link.receiver.session().id(), link.session.id());

        assert_ok!(link.close(None).await);
        assert!(!link.is_open());
        assert_eq!(engine.peer().received(Performative::Detach), 2);
        assert_eq!(engine.peer().received(Performative::End), 1);
    }

    #[tokio::test]
    async fn failed_attach_ends_the_session() {
        let engine = LoopbackEngine::new();
        engine.peer().refuse_attach(
            "responses",
            definitions::Error {
                condition: AmqpError::UnauthorizedAccess.into(),
                description: None,
                info: None,
            },
        );
        let connection = open_connection(&engine).await;

        let err = assert_err!(
            connection
                .create_request_response_link(
                    SenderOptions::default().address("requests"),
                    ReceiverOptions::default().address("responses"),
                    None,
                )
                .await
        );
        assert!(err.condition().is_some());
        assert_eq!(engine.peer().received(Performative::End), 1);
    }
}
