//! Keystone replication pump module implementation.
//!
//! On every push tick the pump atomically swaps the engine's trans-log
//! buffer with an empty one and broadcasts the drained records to all
//! configured replicas, fire-and-forget. Ordering holds within one push
//! from one origin; across origins replicas apply last-writer-wins per key,
//! so duplicates and interleavings are harmless.

use crate::server::{ClusterConfig, EngineInput, NodeId, PeerCaller};
use crate::utils::KeystoneError;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};

/// The replication pump module.
pub(crate) struct LogShipper {
    /// Join handle of the pump ticker task.
    _pump_handle: JoinHandle<()>,
}

impl LogShipper {
    /// Spawns the pump ticker task.
    pub(crate) fn new_and_setup(
        me: NodeId,
        push_interval: Duration,
        tx_engine: mpsc::UnboundedSender<EngineInput>,
        caller: PeerCaller,
        config: watch::Receiver<ClusterConfig>,
    ) -> Result<Self, KeystoneError> {
        if push_interval.is_zero() {
            return logged_err!(me; "invalid push_interval {:?}", push_interval);
        }

        let pump_handle = tokio::spawn(Self::pump_task(
            me,
            push_interval,
            tx_engine,
            caller,
            config,
        ));

        Ok(LogShipper {
            _pump_handle: pump_handle,
        })
    }

    /// Pump ticker task function.
    async fn pump_task(
        me: NodeId,
        push_interval: Duration,
        tx_engine: mpsc::UnboundedSender<EngineInput>,
        caller: PeerCaller,
        config: watch::Receiver<ClusterConfig>,
    ) {
        pf_debug!(me; "log pump task spawned every {:?}", push_interval);

        let mut ticker = time::interval(push_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // first tick completes immediately

        loop {
            ticker.tick().await;

            let (tx_drain, mut rx_drain) = mpsc::unbounded_channel();
            if tx_engine.send(EngineInput::DrainLog { tx_drain }).is_err() {
                break; // engine has been torn down
            }
            let records = match rx_drain.recv().await {
                Some(records) => records,
                None => break,
            };
            if records.is_empty() {
                continue;
            }

            let replicas = config.borrow().replicas.clone();
            if replicas.is_empty() {
                continue;
            }
            pf_trace!(me;
                      "pushing {} records -> {} replicas",
                      records.len(), replicas.len());
            if let Err(e) = caller.cast_apply(&replicas, records) {
                pf_error!(me; "error pushing trans-log: {}", e);
            }
        }

        pf_debug!(me; "log pump task exitted");
    }
}
