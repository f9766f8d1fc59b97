//! Publish acknowledgement bookkeeping.
//!
//! Serials are assigned on the serialized write path, so the tracker is
//! owned by the connection task and needs no interior locking. Each
//! pending publish holds a oneshot receiver that resolves exactly once
//! when the covering ack or nack arrives.

use std::collections::BTreeMap;

use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::Error;
use crate::protocol::{ErrorInfo, ProtocolMessage};
use crate::Result;

/// One publish awaiting its covering ack or nack. The frame is retained
/// so it can be written again on a new transport.
#[derive(Debug)]
struct Pending {
    frame: ProtocolMessage,
    tx: oneshot::Sender<Result<()>>,
}

#[derive(Debug, Default)]
pub(crate) struct AckTracker {
    next_serial: i64,
    pending: BTreeMap<i64, Pending>,
}

impl AckTracker {
    /// Assign the next publish serial, retain the frame and register its
    /// completion sender. Returns the stamped frame to write.
    pub(crate) fn register(
        &mut self,
        mut frame: ProtocolMessage,
        tx: oneshot::Sender<Result<()>>,
    ) -> ProtocolMessage {
        let serial = self.next_serial;
        self.next_serial += 1;
        frame.msg_serial = Some(serial);
        self.pending.insert(
            serial,
            Pending {
                frame: frame.clone(),
                tx,
            },
        );
        frame
    }

    /// Frames still awaiting confirmation, in serial order.
    ///
    /// A publish written to a transport that then died may never have
    /// reached the server; when the next session preserves continuity the
    /// serials stay valid, so these frames are written again.
    pub(crate) fn pending_frames(&self) -> Vec<ProtocolMessage> {
        self.pending
            .values()
            .map(|pending| pending.frame.clone())
            .collect()
    }

    /// Confirm `count` publishes starting at `serial`.
    pub(crate) fn ack(&mut self, serial: i64, count: u32) {
        trace!(serial, count, "publish acknowledged");
        for s in Self::covered(serial, count) {
            if let Some(pending) = self.pending.remove(&s) {
                let _ = pending.tx.send(Ok(()));
            }
        }
    }

    /// Reject `count` publishes starting at `serial` with the server error.
    pub(crate) fn nack(&mut self, serial: i64, count: u32, error: ErrorInfo) {
        debug!(serial, count, code = error.code, "publish rejected");
        for s in Self::covered(serial, count) {
            if let Some(pending) = self.pending.remove(&s) {
                let _ = pending.tx.send(Err(error.clone().into()));
            }
        }
    }

    /// Reject every pending publish. Used when the session ends in a way
    /// that makes confirmation impossible (close, fatal error, failed
    /// resume).
    pub(crate) fn fail_all(&mut self, error: impl Fn() -> Error) {
        if !self.pending.is_empty() {
            debug!(count = self.pending.len(), "failing all pending publishes");
        }
        for (_, pending) in std::mem::take(&mut self.pending) {
            let _ = pending.tx.send(Err(error()));
        }
    }

    /// Restart serial numbering for a connection with no continuity to the
    /// previous one.
    pub(crate) fn reset_serials(&mut self) {
        self.next_serial = 0;
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn covered(serial: i64, count: u32) -> impl Iterator<Item = i64> {
        let count = i64::from(count.max(1));
        serial..serial.saturating_add(count)
    }
}
