use std::{
    mem,
    sync::Arc,
    time::{Duration, Instant},
};

use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::{CommsErr, ProcessGroup, Result};

/// How long a member waits on its peers before giving up on a collective.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// The state of the collective currently in flight.
///
/// The last member to arrive finishes the round: it publishes the reduced buffer
/// and bumps the generation, which releases everyone waiting on it. A round's
/// result can only be replaced once the next round completes, and that needs
/// every member to have read it first.
#[derive(Debug)]
struct Round {
    arrived: usize,
    generation: u64,
    acc: Vec<f32>,
    result: Vec<f32>,
    aborted: bool,
}

#[derive(Debug)]
struct Shared {
    world_size: usize,
    timeout: Duration,
    round: Mutex<Round>,
    cvar: Condvar,
}

/// An in-process transport: every member is a thread of the same process.
#[derive(Debug, Clone)]
pub struct LocalGroup {
    rank: usize,
    shared: Arc<Shared>,
}

impl LocalGroup {
    /// Creates every member of a new group.
    ///
    /// # Arguments
    /// * `world_size` - The amount of members.
    /// * `timeout` - How long a collective may wait on its peers.
    ///
    /// # Returns
    /// One `LocalGroup` per rank, in rank order.
    pub fn new_group(world_size: usize, timeout: Duration) -> Vec<LocalGroup> {
        let shared = Arc::new(Shared {
            world_size,
            timeout,
            round: Mutex::new(Round {
                arrived: 0,
                generation: 0,
                acc: Vec::new(),
                result: Vec::new(),
                aborted: false,
            }),
            cvar: Condvar::new(),
        });

        (0..world_size)
            .map(|rank| LocalGroup {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    /// The timeout applied to every collective of this group.
    pub fn timeout(&self) -> Duration {
        self.shared.timeout
    }

    fn collective(&self, op: &'static str, buf: &mut [f32]) -> Result<()> {
        let shared = &*self.shared;
        let mut guard = shared.round.lock();

        if guard.aborted {
            return Err(CommsErr::PeerLost { op });
        }

        let round = &mut *guard;
        if round.arrived == 0 {
            round.acc.clear();
            round.acc.resize(buf.len(), 0.0);
        } else if round.acc.len() != buf.len() {
            let expected = round.acc.len();
            round.aborted = true;
            shared.cvar.notify_all();
            return Err(CommsErr::SizeMismatch {
                got: buf.len(),
                expected,
            });
        }

        for (a, x) in round.acc.iter_mut().zip(buf.iter()) {
            *a += x;
        }
        round.arrived += 1;

        if round.arrived == shared.world_size {
            mem::swap(&mut round.acc, &mut round.result);
            round.arrived = 0;
            round.generation = round.generation.wrapping_add(1);
            buf.copy_from_slice(&round.result);
            shared.cvar.notify_all();
            return Ok(());
        }

        let generation = round.generation;
        let deadline = Instant::now() + shared.timeout;

        while guard.generation == generation {
            if guard.aborted {
                return Err(CommsErr::PeerLost { op });
            }

            if shared.cvar.wait_until(&mut guard, deadline).timed_out()
                && guard.generation == generation
            {
                debug!(rank = self.rank, op = op; "collective timed out, aborting group");
                guard.aborted = true;
                shared.cvar.notify_all();
                return Err(CommsErr::Timeout {
                    op,
                    after: shared.timeout,
                });
            }
        }

        buf.copy_from_slice(&guard.result);
        Ok(())
    }
}

impl ProcessGroup for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn all_reduce_sum(&self, buf: &mut [f32]) -> Result<()> {
        self.collective("all_reduce", buf)
    }

    fn barrier(&self) -> Result<()> {
        self.collective("barrier", &mut [])
    }

    fn abort(&self) {
        let mut round = self.shared.round.lock();
        if !round.aborted {
            debug!(rank = self.rank; "leaving group");
            round.aborted = true;
            self.shared.cvar.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn run_ranks<F, T>(world_size: usize, timeout: Duration, f: F) -> Vec<T>
    where
        F: Fn(LocalGroup) -> T + Send + Sync,
        T: Send,
    {
        let groups = LocalGroup::new_group(world_size, timeout);
        thread::scope(|s| {
            let handles: Vec<_> = groups
                .into_iter()
                .map(|group| s.spawn(|| f(group)))
                .collect();

            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn all_reduce_sums_every_contribution() {
        let results = run_ranks(3, DEFAULT_TIMEOUT, |group| {
            let r = group.rank() as f32;
            let mut buf = [r, 10.0 * r];
            group.all_reduce_sum(&mut buf).unwrap();
            buf
        });

        for buf in results {
            assert_eq!(buf, [3.0, 30.0]);
        }
    }

    #[test]
    fn consecutive_rounds_do_not_mix() {
        let results = run_ranks(4, DEFAULT_TIMEOUT, |group| {
            let mut out = Vec::new();
            for step in 0..50 {
                let mut buf = [step as f32 + group.rank() as f32];
                group.all_reduce_mean(&mut buf).unwrap();
                out.push(buf[0]);
            }
            out
        });

        let expected: Vec<f32> = (0..50).map(|step| step as f32 + 1.5).collect();
        for out in results {
            assert_eq!(out, expected);
        }
    }

    #[test]
    fn single_member_group_is_identity() {
        let group = LocalGroup::new_group(1, DEFAULT_TIMEOUT).remove(0);
        let mut buf = [1.0, 2.0];
        group.all_reduce_mean(&mut buf).unwrap();
        group.barrier().unwrap();
        assert_eq!(buf, [1.0, 2.0]);
    }

    #[test]
    fn missing_peer_times_out() {
        let mut groups = LocalGroup::new_group(2, Duration::from_millis(50));
        let _absent = groups.pop();
        let group = groups.pop().unwrap();

        let err = group.barrier().unwrap_err();
        assert!(matches!(err, CommsErr::Timeout { op: "barrier", .. }));
    }

    #[test]
    fn abort_wakes_blocked_peers() {
        let results = run_ranks(2, DEFAULT_TIMEOUT, |group| {
            if group.rank() == 1 {
                thread::sleep(Duration::from_millis(20));
                group.abort();
                return Ok(());
            }

            group.barrier()
        });

        assert_eq!(results[0], Err(CommsErr::PeerLost { op: "barrier" }));
    }

    #[test]
    fn mismatched_buffers_abort_the_round() {
        let results = run_ranks(2, DEFAULT_TIMEOUT, |group| {
            let mut buf = vec![1.0; group.rank() + 1];
            group.all_reduce_sum(&mut buf)
        });

        assert!(results.iter().all(|r| r.is_err()));
        assert!(
            results
                .iter()
                .any(|r| matches!(r, Err(CommsErr::SizeMismatch { .. })))
        );
    }
}
