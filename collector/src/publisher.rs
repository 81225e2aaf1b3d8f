use crate::{
    error::CollectError,
    metrics::Sample,
};
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

/// Hands samples from scrape workers to the single consumer of a scrape.
///
/// The consumer only lives as long as the scrape, so every write is preceded
/// by a check of the scrape's cancellation token. Once the token fires no
/// further sample reaches the channel.
#[derive(Debug, Clone)]
pub struct Publisher {
    sender: Sender<Sample>,
    token: CancellationToken,
}

impl Publisher {
    pub fn new(sender: Sender<Sample>, token: CancellationToken) -> Self {
        Self { sender, token }
    }

    pub async fn publish(&self, sample: Sample) -> Result<(), CollectError> {
        if self.token.is_cancelled() {
            return Err(CollectError::Cancelled);
        }

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(CollectError::Cancelled),
            sent = self.sender.send(sample) => sent.map_err(|_| CollectError::OutputClosed),
        }
    }

    /// Publishes samples in order, stopping at the first failure.
    pub async fn publish_all(&self, samples: Vec<Sample>) -> Result<(), CollectError> {
        for sample in samples {
            self.publish(sample).await?;
        }
        Ok(())
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn cancelled_token_never_writes() {
        let (tx, mut rx) = mpsc::channel(8);
        let token = CancellationToken::new();
        token.cancel();
        let publisher = Publisher::new(tx, token);

        let err = publisher.publish(Sample::up("eu-west-1", true)).await.unwrap_err();
        assert!(err.is_cancellation());

        drop(publisher);
        assert!(rx.recv().await.is_none(), "nothing must have been written");
    }

    #[tokio::test]
    async fn closed_channel_is_an_error() {
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        let publisher = Publisher::new(tx, CancellationToken::new());

        let err = publisher.publish(Sample::clusters("eu-west-1", 3)).await.unwrap_err();
        assert!(matches!(err, CollectError::OutputClosed));
    }

    #[tokio::test]
    async fn cancellation_unblocks_a_full_channel() {
        let (tx, mut rx) = mpsc::channel(1);
        let token = CancellationToken::new();
        let publisher = Publisher::new(tx, token.clone());

        publisher.publish(Sample::clusters("eu-west-1", 1)).await.unwrap();

        let blocked = tokio::spawn({
            let publisher = publisher.clone();
            async move { publisher.publish(Sample::clusters("eu-west-1", 2)).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        token.cancel();

        let err = blocked.await.unwrap().unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(rx.recv().await.unwrap().value, 1.0);
    }

    #[tokio::test]
    async fn publish_all_keeps_order() {
        let (tx, mut rx) = mpsc::channel(8);
        let publisher = Publisher::new(tx, CancellationToken::new());
        publisher
            .publish_all((1..=3).map(|n| Sample::clusters("eu-west-1", n)).collect())
            .await
            .unwrap();
        drop(publisher);

        let mut values = Vec::new();
        while let Some(sample) = rx.recv().await {
            values.push(sample.value);
        }
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
    }
}
