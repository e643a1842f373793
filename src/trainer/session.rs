use std::sync::Arc;

use comms::ProcessGroup;
use log::{debug, warn};
use rayon::ThreadPool;

/// Where the work of a session runs.
pub(crate) enum Mode<M> {
    Single,
    /// Batches are split among the master model and `replicas`, on `pool`.
    DataParallel {
        pool: ThreadPool,
        replicas: Vec<(M, Vec<f32>)>,
    },
    /// Every process trains on its own data and gradients are averaged.
    Distributed { group: Arc<dyn ProcessGroup> },
}

/// The resources a session holds.
///
/// Leaving without `release` means the session failed, in which case the
/// group is aborted so peers stop waiting on this process.
pub(crate) struct Session<M> {
    mode: Mode<M>,
    released: bool,
}

impl<M> Session<M> {
    pub fn new(mode: Mode<M>) -> Self {
        Self {
            mode,
            released: false,
        }
    }

    pub fn mode_mut(&mut self) -> &mut Mode<M> {
        &mut self.mode
    }

    pub fn group(&self) -> Option<&Arc<dyn ProcessGroup>> {
        match &self.mode {
            Mode::Distributed { group } => Some(group),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self.mode {
            Mode::Single => "single",
            Mode::DataParallel { .. } => "data_parallel",
            Mode::Distributed { .. } => "distributed",
        }
    }

    /// Leaves cleanly, waiting for every peer to finish too.
    ///
    /// # Errors
    /// `CommsErr` if the exit barrier fails; the session then aborts on drop.
    pub fn release(&mut self) -> comms::Result<()> {
        if let Some(group) = self.group() {
            group.barrier()?;
        }

        self.released = true;
        Ok(())
    }
}

impl<M> Drop for Session<M> {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        match &self.mode {
            Mode::Distributed { group } => {
                warn!(rank = group.rank(); "session left on error, aborting group");
                group.abort();
            }
            _ => debug!(mode = self.name(); "session left on error"),
        }
    }
}
