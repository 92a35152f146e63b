//! Consumer of "VM created" notifications

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use vmexpire_api::{Task, VmCreatedEvent};

use crate::TaskDispatcher;

/// Turns "VM created" messages into `RegisterCreated` tasks
pub struct CreationListener {
    rx: mpsc::Receiver<VmCreatedEvent>,
    dispatcher: Arc<dyn TaskDispatcher>,
}

impl CreationListener {
    /// Create a listener and the sender that feeds it
    pub fn new(
        capacity: usize,
        dispatcher: Arc<dyn TaskDispatcher>,
    ) -> (mpsc::Sender<VmCreatedEvent>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx, dispatcher })
    }

    /// Consume events until every sender is gone or shutdown is signalled
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Creation listener started");

        loop {
            tokio::select! {
                event = self.rx.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Creation listener stopped");
    }

    async fn handle(&self, event: VmCreatedEvent) {
        debug!(vm_id = %event.vm_id, project_id = %event.project_id, "VM created");
        let vm_id = event.vm_id.clone();

        if let Err(e) = self.dispatcher.submit(Task::from(event)).await {
            warn!(vm_id = %vm_id, error = %e, "Failed to register created VM");
        }
    }
}
