//! Garbage collection.
//!
//! A pass compares the on-disk inventory with the reference tracker.
//! Unreferenced content is first marked with the time it was seen; it is
//! deleted by a later pass once it has stayed unreferenced for longer than
//! the grace period.

use crate::error::Result;
use crate::hash::Hash;
use crate::repository::Repository;
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Outcome of one collection pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    /// Unreferenced content kept for now.
    pub marked: BTreeSet<Hash>,
    /// Content physically removed.
    pub deleted: BTreeSet<Hash>,
}

impl GcReport {
    pub fn is_empty(&self) -> bool {
        self.marked.is_empty() && self.deleted.is_empty()
    }
}

impl Repository {
    /// Run one collection pass.
    ///
    /// Passes do not overlap: the obsolescence records stay locked for the
    /// whole pass. Problems with single items are logged and skipped; only an
    /// unreadable root fails the pass.
    pub fn clean_obsolete_content(&self) -> Result<GcReport> {
        let mut records = self.obsolete.lock();
        let now = self.clock.now_millis();
        let grace = self.config.obsolescence_grace_period_ms;

        let inventory = self.layout.inventory()?;
        let mut report = GcReport::default();

        for hash in &inventory {
            if report.deleted.contains(hash) {
                continue;
            }

            if self.tracker.is_referenced(hash) {
                if records.remove(hash).is_some() {
                    debug!(hash = %hash, "content referenced again");
                }
                continue;
            }

            if !self.item(*hash).exists() {
                records.remove(hash);
                continue;
            }

            let Some(&first_seen) = records.get(hash) else {
                records.insert(*hash, now);
                report.marked.insert(*hash);
                continue;
            };

            if now.saturating_sub(first_seen) <= grace {
                report.marked.insert(*hash);
                continue;
            }

            records.remove(hash);
            match self.tracker.remove_if_unreferenced(hash) {
                Some(removed) => {
                    if !removed.contains(hash) {
                        warn!(hash = %hash, "obsolete content could not be deleted");
                    }
                    for gone in removed {
                        records.remove(&gone);
                        report.marked.remove(&gone);
                        report.deleted.insert(gone);
                    }
                }
                None => debug!(hash = %hash, "content referenced during collection"),
            }
        }

        records.retain(|hash, _| inventory.contains(hash) && !report.deleted.contains(hash));

        info!(
            marked = report.marked.len(),
            deleted = report.deleted.len(),
            tracked = records.len(),
            "collection pass finished"
        );
        Ok(report)
    }
}
