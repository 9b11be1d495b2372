use std::fmt;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{ConfigError, Node};

/// Create a node-event channel buffered for `capacity` events.
///
/// Size it to the expected number of nodes so producers do not block while
/// the consumer keeps up.
pub fn node_events(capacity: usize) -> (NodeEvents, mpsc::Receiver<Node>) {
  let (sender, receiver) = mpsc::channel(capacity.max(1));
  (
    NodeEvents {
      sender: Some(sender),
    },
    receiver,
  )
}

/// Producer side of the node lifecycle channel.
///
/// A disconnected sink (the default) drops events, which is what a resumed
/// task gets when nobody is listening.
#[derive(Clone, Default)]
pub struct NodeEvents {
  sender: Option<mpsc::Sender<Node>>,
}

impl NodeEvents {
  pub fn disconnected() -> Self {
    Self::default()
  }

  pub fn is_connected(&self) -> bool {
    self.sender.as_ref().is_some_and(|s| !s.is_closed())
  }

  /// Publish a node record by value.
  ///
  /// A full buffer means the consumer fell behind the expected node count;
  /// that is logged and the send then waits, honoring `cancel`. A closed
  /// channel drops the event.
  pub async fn publish(&self, node: Node, cancel: &CancellationToken) -> Result<(), ConfigError> {
    let Some(sender) = &self.sender else {
      return Ok(());
    };

    match sender.try_send(node) {
      Ok(()) => Ok(()),
      Err(TrySendError::Closed(node)) => {
        debug!(node_id = %node.id, "node event dropped, consumer gone");
        Ok(())
      }
      Err(TrySendError::Full(node)) => {
        warn!(
          node_id = %node.id,
          capacity = sender.max_capacity(),
          "node event channel full, waiting for consumer"
        );
        tokio::select! {
          _ = cancel.cancelled() => Err(ConfigError::Cancelled),
          _ = sender.send(node) => Ok(()),
        }
      }
    }
  }
}

impl fmt::Debug for NodeEvents {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("NodeEvents")
      .field("connected", &self.is_connected())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::*;
  use crate::{NodeRole, Provider};

  fn node(id: &str) -> Node {
    Node::new(id, id, NodeRole::Master, "c-1", Provider::Aws)
  }

  #[tokio::test]
  async fn test_publish_and_receive() {
    let (events, mut rx) = node_events(2);
    let cancel = CancellationToken::new();

    events.publish(node("a"), &cancel).await.unwrap();
    events.publish(node("b"), &cancel).await.unwrap();

    assert_eq!(rx.recv().await.unwrap().id, "a");
    assert_eq!(rx.recv().await.unwrap().id, "b");
  }

  #[tokio::test]
  async fn test_disconnected_drops() {
    let events = NodeEvents::disconnected();
    assert!(!events.is_connected());
    events
      .publish(node("a"), &CancellationToken::new())
      .await
      .unwrap();
  }

  #[tokio::test]
  async fn test_full_channel_honors_cancel() {
    let (events, _rx) = node_events(1);
    let cancel = CancellationToken::new();
    events.publish(node("a"), &cancel).await.unwrap();

    let trigger = cancel.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(20)).await;
      trigger.cancel();
    });

    let result = events.publish(node("b"), &cancel).await;
    assert_eq!(result, Err(ConfigError::Cancelled));
  }

  #[tokio::test]
  async fn test_closed_channel_is_not_an_error() {
    let (events, rx) = node_events(1);
    drop(rx);
    events
      .publish(node("a"), &CancellationToken::new())
      .await
      .unwrap();
  }
}
