use tokio::sync::broadcast;

use crate::types::RunEvent;

const DEFAULT_CAPACITY: usize = 256;

/// Fan-out of run lifecycle events (run started, node started/retrying/
/// completed, run finished) to any number of listeners.
///
/// Publishing never blocks the engine. A listener that falls more than
/// `capacity` events behind sees `RecvError::Lagged` and skips ahead.
pub struct EventBus {
    tx: broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: RunEvent) {
        // No listeners is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RunId;

    #[tokio::test]
    async fn test_every_listener_sees_run_events() {
        let bus = EventBus::default();
        bus.publish(RunEvent::RunStarted {
            run_id: RunId::from_string("dropped"),
        });

        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        let run_id = RunId::from_string("r1");
        bus.publish(RunEvent::RunCompleted {
            run_id: run_id.clone(),
            steps: 2,
        });

        for rx in [&mut first, &mut second] {
            match rx.recv().await.unwrap() {
                RunEvent::RunCompleted { run_id: id, steps } => {
                    assert_eq!(id, run_id);
                    assert_eq!(steps, 2);
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }
}
