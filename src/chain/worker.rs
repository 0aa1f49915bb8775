use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::chain::state::{State, StateError};
use crate::chain::EventHandler;

/// Drives mining in the background. Start and cancel requests arrive
/// through capacity-1 channels: sending never blocks and redundant signals
/// coalesce into at most one queued cycle.
pub struct Worker {
    state: Arc<State>,
    shut: watch::Sender<bool>,
    start_mining: mpsc::Sender<()>,
    cancel_mining: mpsc::Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
    ev: EventHandler,
}

impl Worker {
    /// Creates the worker, registers it with the state and starts the
    /// mining operations task.
    pub fn run(state: Arc<State>, ev: EventHandler) -> Arc<Self> {
        let (shut_tx, shut_rx) = watch::channel(false);
        let (start_tx, start_rx) = mpsc::channel(1);
        let (cancel_tx, cancel_rx) = mpsc::channel(1);

        let task = tokio::spawn(pow_operations(
            Arc::clone(&state),
            Arc::clone(&ev),
            shut_rx,
            start_rx,
            cancel_rx,
        ));

        let worker = Arc::new(Self {
            state: Arc::clone(&state),
            shut: shut_tx,
            start_mining: start_tx,
            cancel_mining: cancel_tx,
            handle: Mutex::new(Some(task)),
            ev,
        });

        state.attach_worker(Arc::clone(&worker));

        worker
    }

    /// Non-blocking request to start a mining cycle. Dropped when mining is
    /// disabled or a signal is already pending.
    pub fn signal_start_mining(&self) {
        if !self.state.is_mining_allowed() {
            self.ev("worker: signal_start_mining: mining is turned off");
            return;
        }

        let _ = self.start_mining.try_send(());
        self.ev("worker: signal_start_mining: mining signaled");
    }

    /// Non-blocking request to cancel the in-flight mining cycle.
    pub fn signal_cancel_mining(&self) {
        let _ = self.cancel_mining.try_send(());
        self.ev("worker: signal_cancel_mining: cancel signaled");
    }

    /// Cancels any in-flight mining and waits for the operations task to
    /// return.
    pub async fn shutdown(&self) {
        self.ev("worker: shutdown: started");

        self.signal_cancel_mining();
        let _ = self.shut.send(true);

        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        self.ev("worker: shutdown: completed");
    }

    fn ev(&self, msg: &str) {
        (self.ev)(msg)
    }
}

/// Loops until shutdown, running one mining cycle per start signal.
async fn pow_operations(
    state: Arc<State>,
    ev: EventHandler,
    mut shut: watch::Receiver<bool>,
    mut start_mining: mpsc::Receiver<()>,
    mut cancel_mining: mpsc::Receiver<()>,
) {
    ev("worker: pow_operations: running");

    loop {
        tokio::select! {
            _ = shut.changed() => break,
            Some(_) = start_mining.recv() => {
                // The cycle works on its own clone of the shutdown watch so
                // observing it in-cycle does not swallow the signal here.
                run_mining_operation(&state, &ev, shut.clone(), &mut cancel_mining).await;
            }
        }
    }

    ev("worker: pow_operations: stopped");
}

async fn run_mining_operation(
    state: &Arc<State>,
    ev: &EventHandler,
    mut shut: watch::Receiver<bool>,
    cancel_mining: &mut mpsc::Receiver<()>,
) {
    ev("worker: run_mining_operation: mining started");

    // A cancel that arrived outside a mining cycle is stale; drop it so it
    // cannot kill this cycle on arrival.
    while cancel_mining.try_recv().is_ok() {}

    let cancel = Arc::new(AtomicBool::new(false));

    let mine = state.mine_new_block(Arc::clone(&cancel));
    tokio::pin!(mine);

    let result = loop {
        tokio::select! {
            result = &mut mine => break result,
            Some(_) = cancel_mining.recv() => {
                ev("worker: run_mining_operation: cancel requested");
                cancel.store(true, std::sync::atomic::Ordering::Relaxed);
            }
            _ = shut.changed() => {
                cancel.store(true, std::sync::atomic::Ordering::Relaxed);
            }
        }
    };

    match result {
        Ok(block) => {
            ev(&format!(
                "worker: run_mining_operation: mined block[{}] hash[{}]",
                block.header.number,
                block.hash()
            ));
        }
        Err(StateError::NoTransactions) => {
            ev("worker: run_mining_operation: no transactions in mempool");
        }
        Err(err) if err.is_cancelled() => {
            ev("worker: run_mining_operation: mining cancelled");
        }
        Err(err) if err.is_chain_forked() => {
            // Another node is ahead of us. Stop producing blocks until a
            // resync puts this node back on the right side of the fork.
            state.set_mining_allowed(false);
            ev("worker: run_mining_operation: chain forked, mining paused");
        }
        Err(err) => {
            ev(&format!("worker: run_mining_operation: ERROR: {err}"));
        }
    }

    ev("worker: run_mining_operation: mining completed");
}
