//! Asynchronous execution of delivery callbacks.
//!
//! The thread detecting a delivery or a timeout never runs caller code: it
//! pushes the callback and its report onto a [`CallbackQueue`], and a
//! [`CallbackDispatcher`] task runs them one at a time. A panicking callback
//! is logged and does not stop the dispatcher.

use log::{debug, error, warn};
use tokio::sync::mpsc;

use crate::{id::NodeId, panic::catch_panic};

/// Final state of a tracked message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Undelivered,
}

/// What a delivery callback learns about its message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryReport {
    pub serial: u32,
    pub recipient: NodeId,
    pub outcome: DeliveryOutcome,
    /// Resends performed before the outcome was known.
    pub resend_count: u32,
}

/// Caller-supplied code run once the outcome of a message is known.
pub type DeliveryCallback = Box<dyn FnOnce(DeliveryReport) + Send + 'static>;

type Job = (DeliveryCallback, DeliveryReport);

/// Producer side of the callback queue.
#[derive(Clone, Debug)]
pub struct CallbackQueue {
    tx: mpsc::UnboundedSender<Job>,
}

/// Consumer side of the callback queue.
#[derive(Debug)]
pub struct CallbackDispatcher {
    rx: mpsc::UnboundedReceiver<Job>,
}

/// Create a connected queue and dispatcher.
#[must_use]
pub fn callback_queue() -> (CallbackQueue, CallbackDispatcher) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CallbackQueue { tx }, CallbackDispatcher { rx })
}

impl CallbackQueue {
    /// Schedule `callback` to run with `report`.
    ///
    /// When the dispatcher has already stopped the callback is dropped
    /// without running.
    pub fn enqueue(&self, callback: DeliveryCallback, report: DeliveryReport) {
        if self.tx.send((callback, report)).is_err() {
            warn!("delivery callback dropped: dispatcher stopped");
        }
    }
}

impl CallbackDispatcher {
    /// Run callbacks until every [`CallbackQueue`] is dropped.
    pub async fn run(mut self) {
        while let Some(job) = self.rx.recv().await {
            run_job(job);
        }
    }

    /// Run every callback queued so far, without waiting for more.
    pub fn drain(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.rx.try_recv() {
            run_job(job);
            ran += 1;
        }
        ran
    }
}

fn run_job((callback, report): Job) {
    let serial = report.serial;
    match catch_panic(move || callback(report)) {
        Ok(()) => debug!("delivery callback ran: serial={serial}"),
        Err(panic) => {
            // Emit via both `log` and `tracing` for tests that capture either.
            error!("delivery callback panicked: serial={serial}, panic={panic}");
            tracing::error!(serial, panic = %panic, "delivery callback panicked");
        }
    }
}
