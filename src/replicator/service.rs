//! Background reporter forwarding last-committed positions to the group.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};

use crate::core::Position;
use crate::gcs::GroupComm;

/// Owns the service thread; dropping the reporter drains and joins it.
pub(crate) struct ServiceReporter {
    tx: Option<Sender<Position>>,
    join: Option<JoinHandle<()>>,
}

impl ServiceReporter {
    pub fn spawn(gcs: Arc<dyn GroupComm>) -> Self {
        let (tx, rx) = channel::unbounded::<Position>();
        let join = thread::Builder::new()
            .name("repl-service".to_string())
            .spawn(move || {
                for position in rx {
                    gcs.set_last_applied(position);
                }
            })
            .expect("spawn service thread");
        Self {
            tx: Some(tx),
            join: Some(join),
        }
    }

    /// Queues a report; never blocks the caller.
    pub fn report(&self, position: Position) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(position);
        }
    }
}

impl Drop for ServiceReporter {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}
