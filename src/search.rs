//! Standing peer searches.

use std::thread;
use std::time::Duration;

use crate::common::Id;
use crate::rpc::Command;

/// A standing search request.
///
/// The peer request is re-issued every retry period until [Search::stop] is
/// called, the handle is dropped, or the node shuts down. Results keep
/// arriving on the node's result stream.
#[derive(Debug)]
pub struct Search {
    stop_tx: flume::Sender<()>,
}

impl Search {
    pub(crate) fn start(
        command_tx: flume::Sender<Command>,
        info_hash: Id,
        announce: bool,
        retry_period: Duration,
    ) -> Search {
        let (stop_tx, stop_rx) = flume::bounded(1);

        thread::spawn(move || loop {
            let request = Command::RequestPeers {
                info_hash,
                announce,
            };
            if command_tx.send(request).is_err() {
                // The control loop is gone.
                return;
            }

            match stop_rx.recv_timeout(retry_period) {
                Err(flume::RecvTimeoutError::Timeout) => continue,
                _ => return,
            }
        });

        Search { stop_tx }
    }

    /// Stop the search. Results already under way may still be returned.
    /// May be called multiple times without consequence.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
    }
}
