//! Keystone expiration services module implementation.
//!
//! Two independent periodic tickers per node: the lease sweep removes data
//! entries whose lease elapsed without renewal, and the lock sweep removes
//! stale promise reservations so a crashed coordinator cannot block a key
//! forever. The tickers only emit sweep inputs into the engine channel; the
//! scans themselves run inside the engine's serialization, which is what
//! makes expiration race-free against in-flight commits.

use crate::server::{EngineInput, NodeId};
use crate::utils::KeystoneError;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};

/// Which sweep a ticker drives.
#[derive(Debug, Clone, Copy)]
enum SweepKind {
    Leases,
    Locks,
}

/// The expiration services module.
pub(crate) struct Sweeper {
    /// Join handle of the lease sweep ticker task.
    _lease_ticker_handle: JoinHandle<()>,

    /// Join handle of the lock sweep ticker task.
    _lock_ticker_handle: JoinHandle<()>,
}

impl Sweeper {
    /// Spawns the two sweep ticker tasks.
    pub(crate) fn new_and_setup(
        me: NodeId,
        lease_interval: Duration,
        lock_interval: Duration,
        tx_engine: mpsc::UnboundedSender<EngineInput>,
    ) -> Result<Self, KeystoneError> {
        if lease_interval.is_zero() {
            return logged_err!(me; "invalid lease_interval {:?}", lease_interval);
        }
        if lock_interval.is_zero() {
            return logged_err!(me; "invalid lock_interval {:?}", lock_interval);
        }

        let lease_ticker_handle = tokio::spawn(Self::ticker_task(
            me,
            SweepKind::Leases,
            lease_interval,
            tx_engine.clone(),
        ));
        let lock_ticker_handle = tokio::spawn(Self::ticker_task(
            me,
            SweepKind::Locks,
            lock_interval,
            tx_engine,
        ));

        Ok(Sweeper {
            _lease_ticker_handle: lease_ticker_handle,
            _lock_ticker_handle: lock_ticker_handle,
        })
    }

    /// Ticker task function. Missed ticks are coalesced rather than burst.
    async fn ticker_task(
        me: NodeId,
        kind: SweepKind,
        interval: Duration,
        tx_engine: mpsc::UnboundedSender<EngineInput>,
    ) {
        pf_debug!(me; "{:?} sweep ticker spawned every {:?}", kind, interval);

        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // first tick completes immediately

        loop {
            ticker.tick().await;
            let input = match kind {
                SweepKind::Leases => EngineInput::SweepLeases,
                SweepKind::Locks => EngineInput::SweepLocks,
            };
            if tx_engine.send(input).is_err() {
                break; // engine has been torn down
            }
        }

        pf_debug!(me; "{:?} sweep ticker exitted", kind);
    }
}
