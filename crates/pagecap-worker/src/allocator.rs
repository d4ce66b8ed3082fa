//! Display number and audio sink allocation.
//!
//! Shared by every job of a recorder process. Reservation happens under one
//! lock, so two jobs of this process can never be handed the same display
//! number or sink name. The filesystem probe for displays owned by other
//! programs runs outside the lock; another program may still grab a display
//! between the probe and the display server binding it, and the job
//! lifecycle retries on the next number in that case.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use pagecap_media::{monitor_name, AudioSink, DisplayProbe};
use pagecap_models::JobId;

use crate::error::{RecorderError, RecorderResult};

/// A sink name handed to one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkAllocation {
    pub sink_name: String,
    pub monitor_name: String,
    /// Whether the job should also make this sink the system default. Only
    /// safe when no sibling job can race for the default sink.
    pub claim_default: bool,
}

#[derive(Default)]
struct AllocationTable {
    displays: BTreeSet<u32>,
    /// Reserved sink names and, once created, the sink itself
    sinks: HashMap<String, Option<AudioSink>>,
}

/// Hands out collision-free display numbers and sink names.
pub struct ResourceAllocator {
    probe: Arc<dyn DisplayProbe>,
    table: Mutex<AllocationTable>,
}

impl ResourceAllocator {
    pub fn new(probe: Arc<dyn DisplayProbe>) -> Self {
        Self {
            probe,
            table: Mutex::new(AllocationTable::default()),
        }
    }

    fn table(&self) -> MutexGuard<'_, AllocationTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve the first free display number in
    /// `preferred..preferred + max_probe`.
    pub fn allocate_display(&self, preferred: u32, max_probe: u32) -> RecorderResult<u32> {
        let last = preferred.saturating_add(max_probe.saturating_sub(1));

        for number in preferred..=last {
            if self.table().displays.contains(&number) {
                continue;
            }
            // Blocking fs checks, kept out of the lock
            if self.probe.in_use(number) {
                debug!(display = number, "Display number taken outside this process");
                continue;
            }
            // A sibling job may have reserved it while we probed
            if self.table().displays.insert(number) {
                debug!(display = number, "Display number reserved");
                return Ok(number);
            }
        }

        Err(RecorderError::resource_unavailable(format!(
            "no free display number in :{}..:{} ({} probed)",
            preferred, last, max_probe
        )))
    }

    /// Mark `number` free again. Returns false if it was not reserved.
    pub fn release_display(&self, number: u32) -> bool {
        let released = self.table().displays.remove(&number);
        if released {
            debug!(display = number, "Display number released");
        }
        released
    }

    /// Reserve a sink name for `job_id`.
    ///
    /// In parallel mode the name is suffixed with the job id so sibling jobs
    /// get private sinks; only a lone job claims the default sink.
    pub fn allocate_sink(
        &self,
        base_name: &str,
        job_id: &JobId,
        parallel: bool,
    ) -> RecorderResult<SinkAllocation> {
        let sink_name = if parallel {
            format!("{}_{}", base_name, job_id)
        } else {
            base_name.to_string()
        };

        let mut table = self.table();
        if table.sinks.contains_key(&sink_name) {
            return Err(RecorderError::resource_unavailable(format!(
                "audio sink '{}' is already assigned",
                sink_name
            )));
        }
        table.sinks.insert(sink_name.clone(), None);
        debug!(sink = %sink_name, job_id = %job_id, "Audio sink reserved");

        Ok(SinkAllocation {
            monitor_name: monitor_name(&sink_name),
            claim_default: !parallel,
            sink_name,
        })
    }

    /// Remember the sink created for a reserved name, so it can still be
    /// removed if the process shuts down mid-job.
    pub fn attach_sink(&self, sink: AudioSink) {
        if let Some(slot) = self.table().sinks.get_mut(&sink.sink_name) {
            *slot = Some(sink);
        }
    }

    /// Take the sink created for `sink_name`, unless a shutdown already took it.
    pub fn detach_sink(&self, sink_name: &str) -> Option<AudioSink> {
        self.table().sinks.get_mut(sink_name).and_then(Option::take)
    }

    /// Take every created sink still reserved. Their names stay reserved.
    pub fn take_attached_sinks(&self) -> Vec<AudioSink> {
        self.table()
            .sinks
            .values_mut()
            .filter_map(Option::take)
            .collect()
    }

    pub fn release_sink(&self, sink_name: &str) -> bool {
        let released = self.table().sinks.remove(sink_name).is_some();
        if released {
            debug!(sink = sink_name, "Audio sink released");
        }
        released
    }

    /// Currently reserved display numbers, ascending.
    pub fn reserved_displays(&self) -> Vec<u32> {
        self.table().displays.iter().copied().collect()
    }

    /// Currently reserved sink names, sorted.
    pub fn reserved_sinks(&self) -> Vec<String> {
        let mut sinks: Vec<String> = self.table().sinks.keys().cloned().collect();
        sinks.sort();
        sinks
    }
}
