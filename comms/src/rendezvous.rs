use std::{
    collections::HashMap,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use log::{debug, info};
use parking_lot::{Condvar, Mutex};

use crate::{Backend, CommsErr, LocalGroup, Result};

const LOCAL_SCHEME: &str = "local://";

/// Where members meet to form a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitMethod {
    /// A named group of threads in this process, `local://<name>`.
    Local(String),
}

impl InitMethod {
    /// Parses an init method url.
    ///
    /// # Errors
    /// `CommsErr::UnsupportedInitMethod` for any scheme other than `local://`,
    /// or for an empty group name.
    pub fn parse(url: &str) -> Result<Self> {
        match url.strip_prefix(LOCAL_SCHEME) {
            Some(name) if !name.is_empty() => Ok(InitMethod::Local(name.to_string())),
            _ => Err(CommsErr::UnsupportedInitMethod(url.to_string())),
        }
    }
}

struct PendingState {
    slots: Vec<Option<LocalGroup>>,
    joined: usize,
    complete: bool,
}

/// A group that is still waiting for some of its members.
struct Pending {
    world_size: usize,
    state: Mutex<PendingState>,
    cvar: Condvar,
}

type Registry = Mutex<HashMap<String, Arc<Pending>>>;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Default::default)
}

fn forget(name: &str, pending: &Arc<Pending>) {
    let mut registry = registry().lock();
    if registry.get(name).is_some_and(|p| Arc::ptr_eq(p, pending)) {
        registry.remove(name);
    }
}

/// Joins a process group and blocks until every member has joined.
///
/// # Arguments
/// * `backend` - The collective backend to run on.
/// * `init_method` - Where the members meet, e.g. `local://job-0`.
/// * `rank` - This member's rank.
/// * `world_size` - The amount of members.
/// * `timeout` - How long to wait for the rest of the members, also used as the
///   group's collective timeout.
///
/// # Returns
/// This member's handle to the group.
///
/// # Errors
/// Returns `CommsErr` if the backend or init method are unsupported, the rank is
/// invalid or taken, the members disagree on the world size, or the group is
/// not complete before the timeout.
pub fn connect(
    backend: Backend,
    init_method: &str,
    rank: usize,
    world_size: usize,
    timeout: Duration,
) -> Result<LocalGroup> {
    if !backend.is_available() {
        return Err(CommsErr::BackendUnavailable(backend));
    }

    let InitMethod::Local(name) = InitMethod::parse(init_method)?;

    if rank >= world_size {
        return Err(CommsErr::InvalidRank { rank, world_size });
    }

    let pending = {
        let mut registry = registry().lock();
        let pending = registry.entry(name.clone()).or_insert_with(|| {
            let slots = LocalGroup::new_group(world_size, timeout)
                .into_iter()
                .map(Some)
                .collect();

            Arc::new(Pending {
                world_size,
                state: Mutex::new(PendingState {
                    slots,
                    joined: 0,
                    complete: false,
                }),
                cvar: Condvar::new(),
            })
        });

        Arc::clone(pending)
    };

    if pending.world_size != world_size {
        return Err(CommsErr::WorldSizeMismatch {
            name,
            got: world_size,
            expected: pending.world_size,
        });
    }

    let mut state = pending.state.lock();
    let Some(group) = state.slots[rank].take() else {
        return Err(CommsErr::AlreadyJoined { name, rank });
    };

    state.joined += 1;
    debug!(group = name.as_str(), rank = rank, joined = state.joined; "joined rendezvous");

    if state.joined == world_size {
        state.complete = true;
        pending.cvar.notify_all();
        drop(state);
        forget(&name, &pending);
        info!(group = name.as_str(), world_size = world_size; "process group complete");
        return Ok(group);
    }

    let deadline = Instant::now() + timeout;
    while !state.complete {
        if pending.cvar.wait_until(&mut state, deadline).timed_out() && !state.complete {
            state.slots[rank] = Some(group);
            state.joined -= 1;
            let empty = state.joined == 0;
            drop(state);

            if empty {
                forget(&name, &pending);
            }

            return Err(CommsErr::Timeout {
                op: "rendezvous",
                after: timeout,
            });
        }
    }

    Ok(group)
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::ProcessGroup;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn parses_local_urls_only() {
        assert_eq!(
            InitMethod::parse("local://job").unwrap(),
            InitMethod::Local("job".into())
        );
        assert!(InitMethod::parse("tcp://127.0.0.1:23456").is_err());
        assert!(InitMethod::parse("local://").is_err());
    }

    #[test]
    fn members_meet_and_reduce() {
        let sums: Vec<f32> = thread::scope(|s| {
            let handles: Vec<_> = (0..3)
                .map(|rank| {
                    s.spawn(move || {
                        let group =
                            connect(Backend::Gloo, "local://meet", rank, 3, TIMEOUT).unwrap();
                        assert_eq!(group.rank(), rank);
                        let mut buf = [1.0];
                        group.all_reduce_sum(&mut buf).unwrap();
                        buf[0]
                    })
                })
                .collect();

            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(sums, vec![3.0; 3]);
    }

    #[test]
    fn lonely_member_times_out_and_can_retry() {
        let short = Duration::from_millis(30);
        let err = connect(Backend::Gloo, "local://lonely", 0, 2, short).unwrap_err();
        assert!(matches!(err, CommsErr::Timeout { op: "rendezvous", .. }));

        let err = connect(Backend::Gloo, "local://lonely", 0, 2, short).unwrap_err();
        assert!(matches!(err, CommsErr::Timeout { .. }));
    }

    #[test]
    fn rejects_invalid_requests() {
        let err = connect(Backend::Nccl, "local://x", 0, 1, TIMEOUT).unwrap_err();
        assert_eq!(err, CommsErr::BackendUnavailable(Backend::Nccl));

        let err = connect(Backend::Gloo, "local://x", 2, 2, TIMEOUT).unwrap_err();
        assert!(matches!(err, CommsErr::InvalidRank { rank: 2, .. }));

        let err = connect(Backend::Gloo, "env://", 0, 1, TIMEOUT).unwrap_err();
        assert!(matches!(err, CommsErr::UnsupportedInitMethod(_)));
    }
}
