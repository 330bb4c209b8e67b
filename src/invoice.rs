//! Invoice ledger for refund correlation.
//!
//! Remembers which paid invoices funded the running cycle so a later refund
//! event can be matched back to it. Purely advisory: the relay is gated by
//! the activation controller alone, and a refund always cancels the whole
//! cycle rather than the invoice's share of it.

use crate::controller::{ActivationController, CycleEvent};
use crate::error::Rejected;
use chrono::{DateTime, Utc};
use log::{info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvoiceRecord {
    pub start_time: DateTime<Utc>,
    pub duration: u32,
    /// Cycle the invoice paid for. `None` for records added through
    /// [`InvoiceTracker::track`], which belong to whichever cycle runs.
    pub cycle: Option<u64>,
}

pub struct InvoiceTracker {
    controller: ActivationController,
    invoices: Mutex<HashMap<String, InvoiceRecord>>,
}

impl InvoiceTracker {
    pub fn new(controller: ActivationController) -> Self {
        Self {
            controller,
            invoices: Mutex::new(HashMap::new()),
        }
    }

    /// Record `invoice_id` as funding `duration` seconds, replacing any
    /// earlier record under the same id.
    pub fn track(&self, invoice_id: &str, duration: u32) {
        self.insert(invoice_id, duration, None);
    }

    fn insert(&self, invoice_id: &str, duration: u32, cycle: Option<u64>) {
        let record = InvoiceRecord {
            start_time: Utc::now(),
            duration,
            cycle,
        };
        self.invoices.lock().insert(invoice_id.to_string(), record);
    }

    /// Forget `invoice_id`. No-op if it was never tracked.
    pub fn remove(&self, invoice_id: &str) {
        self.invoices.lock().remove(invoice_id);
    }

    pub fn get(&self, invoice_id: &str) -> Option<InvoiceRecord> {
        self.invoices.lock().get(invoice_id).cloned()
    }

    pub fn contains(&self, invoice_id: &str) -> bool {
        self.invoices.lock().contains_key(invoice_id)
    }

    pub fn len(&self) -> usize {
        self.invoices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.invoices.lock().is_empty()
    }

    /// A paid invoice: start (or top up) the machine and remember which
    /// cycle the payment went to. Returns that cycle's id.
    ///
    /// Nothing is tracked when the controller refuses, so a later refund for
    /// the invoice is not mistaken for a running cycle.
    pub fn settle(&self, invoice_id: &str, duration: u32) -> Result<u64, Rejected> {
        let cycle = match self.controller.start_cycle(duration) {
            Ok(cycle) => cycle,
            Err(e) => {
                warn!("[Invoice] {} could not start the machine: {}", invoice_id, e);
                return Err(e);
            }
        };
        self.insert(invoice_id, duration, Some(cycle));

        // A cycle stopped before the record landed had its cleanup run
        // already.
        if !self.controller.is_cycle_live(cycle) {
            self.remove(invoice_id);
        }
        info!(
            "[Invoice] {} started the machine for {}s (cycle {})",
            invoice_id, duration, cycle
        );
        Ok(cycle)
    }

    /// A refunded invoice: stop the cycle it funded, if it is still known.
    ///
    /// Unknown invoices are rejected as `NothingRunning` without touching
    /// the controller. A record whose cycle has already ended is dropped
    /// and also answered with `NothingRunning`.
    pub fn refund(&self, invoice_id: &str) -> Result<(), Rejected> {
        let Some(record) = self.get(invoice_id) else {
            info!("[Invoice] {} not found in active invoices", invoice_id);
            return Err(Rejected::NothingRunning);
        };

        let stopped = match record.cycle {
            Some(cycle) => self.controller.stop_cycle(cycle),
            None => self.controller.stop(),
        };
        self.remove(invoice_id);
        stopped?;
        info!("[Invoice] Machine stopped for refunded invoice {}", invoice_id);
        Ok(())
    }

    /// Drop the records of a finished cycle, along with untied ones.
    fn release_cycle(&self, cycle: u64) -> usize {
        let mut invoices = self.invoices.lock();
        let before = invoices.len();
        invoices.retain(|_, record| matches!(record.cycle, Some(c) if c != cycle));
        before - invoices.len()
    }

    /// Drop a cycle's records when it finishes. Records for a cycle that
    /// started in the meantime are kept.
    pub fn spawn_cleanup(self: &Arc<Self>) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        let mut events = tracker.controller.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(CycleEvent::Finished { cycle, .. }) => {
                        let cleared = tracker.release_cycle(cycle);
                        if cleared > 0 {
                            info!("[Invoice] Cycle {} ended, cleared {} invoice(s)", cycle, cleared);
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        warn!("[Invoice] Missed {} cycle event(s)", missed);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}
