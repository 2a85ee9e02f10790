//! Transactional receiver middleware.
//!
//! [`Outbox`] opens a transaction per inbound message and hands it to a
//! [`TransactionalReceiver`], so that state changes and the messages they
//! produce commit or roll back together.

use std::error::Error as StdError;
use std::panic::{AssertUnwindSafe, resume_unwind};
use std::sync::Arc;

use async_trait::async_trait;
use common::RequestContext;
use futures_util::FutureExt;

use crate::receiver::{MessageReceiver, TransactionalReceiver};
use crate::{Message, MsgError, Result};

/// Source of transactions for [`Outbox`].
#[async_trait]
pub trait Transactor: Send + Sync {
    type Tx: Send;
    type Error: StdError + Send + Sync + 'static;

    async fn begin(&self) -> std::result::Result<Self::Tx, Self::Error>;

    async fn commit(&self, tx: Self::Tx) -> std::result::Result<(), Self::Error>;

    async fn rollback(&self, tx: Self::Tx) -> std::result::Result<(), Self::Error>;
}

/// Wraps a [`TransactionalReceiver`] into a plain [`MessageReceiver`].
///
/// Per message: begin, run the receiver with `&mut tx`, then commit on
/// success. An error rolls back and is returned; a panic rolls back and is
/// resumed. A failed commit is returned so the message is redelivered.
pub struct Outbox<T, R> {
    transactor: Arc<T>,
    receiver: Arc<R>,
}

impl<T, R> Outbox<T, R> {
    pub fn new(transactor: Arc<T>, receiver: Arc<R>) -> Self {
        Self {
            transactor,
            receiver,
        }
    }
}

impl<T, R> Outbox<T, R>
where
    T: Transactor,
{
    async fn rollback(&self, tx: T::Tx) {
        if let Err(e) = self.transactor.rollback(tx).await {
            tracing::error!(error = %e, "Failed to roll back transaction");
        }
    }
}

#[async_trait]
impl<T, R> MessageReceiver for Outbox<T, R>
where
    T: Transactor + 'static,
    R: TransactionalReceiver<T::Tx> + 'static,
{
    async fn receive_message(&self, ctx: &RequestContext, message: &Message) -> Result<()> {
        let mut tx = self.transactor.begin().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to begin transaction");
            MsgError::Transaction(Box::new(e))
        })?;

        let work = self.receiver.receive_in_transaction(&mut tx, ctx, message);
        let outcome = AssertUnwindSafe(work).catch_unwind().await;

        match outcome {
            Ok(Ok(())) => self.transactor.commit(tx).await.map_err(|e| {
                tracing::error!(message_id = message.id(), error = %e, "Failed to commit transaction");
                MsgError::Transaction(Box::new(e))
            }),
            Ok(Err(e)) => {
                self.rollback(tx).await;
                Err(e)
            }
            Err(panic) => {
                tracing::error!(message_id = message.id(), "Receiver panicked, rolling back");
                self.rollback(tx).await;
                resume_unwind(panic)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, thiserror::Error)]
    #[error("commit refused")]
    struct CommitRefused;

    #[derive(Default)]
    struct RecordingTransactor {
        log: Mutex<Vec<String>>,
        refuse_commit: bool,
    }

    impl RecordingTransactor {
        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transactor for RecordingTransactor {
        type Tx = Vec<String>;
        type Error = CommitRefused;

        async fn begin(&self) -> std::result::Result<Self::Tx, Self::Error> {
            self.log.lock().unwrap().push("begin".into());
            Ok(Vec::new())
        }

        async fn commit(&self, tx: Self::Tx) -> std::result::Result<(), Self::Error> {
            if self.refuse_commit {
                return Err(CommitRefused);
            }
            let mut log = self.log.lock().unwrap();
            log.extend(tx);
            log.push("commit".into());
            Ok(())
        }

        async fn rollback(&self, _tx: Self::Tx) -> std::result::Result<(), Self::Error> {
            self.log.lock().unwrap().push("rollback".into());
            Ok(())
        }
    }

    enum Behavior {
        Succeed,
        Fail,
        Panic,
    }

    struct Writer(Behavior);

    #[async_trait]
    impl TransactionalReceiver<Vec<String>> for Writer {
        async fn receive_in_transaction(
            &self,
            tx: &mut Vec<String>,
            _ctx: &RequestContext,
            message: &Message,
        ) -> Result<()> {
            tx.push(format!("write:{}", message.id()));
            match self.0 {
                Behavior::Succeed => Ok(()),
                Behavior::Fail => Err(MsgError::Handler("rejected".into())),
                Behavior::Panic => panic!("receiver blew up"),
            }
        }
    }

    fn outbox(
        transactor: &Arc<RecordingTransactor>,
        behavior: Behavior,
    ) -> Outbox<RecordingTransactor, Writer> {
        Outbox::new(transactor.clone(), Arc::new(Writer(behavior)))
    }

    #[tokio::test]
    async fn test_commits_on_success() {
        let transactor = Arc::new(RecordingTransactor::default());
        let message = Message::from_parts("m-1", Default::default(), vec![]);

        outbox(&transactor, Behavior::Succeed)
            .receive_message(&RequestContext::new(), &message)
            .await
            .unwrap();

        assert_eq!(transactor.log(), vec!["begin", "write:m-1", "commit"]);
    }

    #[tokio::test]
    async fn test_rolls_back_on_error() {
        let transactor = Arc::new(RecordingTransactor::default());
        let message = Message::from_parts("m-1", Default::default(), vec![]);

        let result = outbox(&transactor, Behavior::Fail)
            .receive_message(&RequestContext::new(), &message)
            .await;

        assert!(matches!(result, Err(MsgError::Handler(_))));
        assert_eq!(transactor.log(), vec!["begin", "rollback"]);
    }

    #[tokio::test]
    async fn test_rolls_back_and_resumes_panic() {
        let transactor = Arc::new(RecordingTransactor::default());
        let message = Message::from_parts("m-1", Default::default(), vec![]);
        let outbox = outbox(&transactor, Behavior::Panic);

        let result = AssertUnwindSafe(outbox.receive_message(&RequestContext::new(), &message))
            .catch_unwind()
            .await;

        assert!(result.is_err());
        assert_eq!(transactor.log(), vec!["begin", "rollback"]);
    }

    #[tokio::test]
    async fn test_commit_failure_is_returned() {
        let transactor = Arc::new(RecordingTransactor {
            refuse_commit: true,
            ..Default::default()
        });
        let message = Message::new(vec![]);

        let result = outbox(&transactor, Behavior::Succeed)
            .receive_message(&RequestContext::new(), &message)
            .await;

        assert!(matches!(result, Err(MsgError::Transaction(_))));
    }
}
