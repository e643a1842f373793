use std::{
    env, fmt, panic,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    thread,
    time::Duration,
};

use comms::{Backend, CommsErr, DEFAULT_TIMEOUT, LocalGroup, ProcessGroup};
use log::{info, warn};

use crate::{OrchestraErr, Result, config::DistributedConfig, error::InitErr};

const IDLE: u8 = 0;
const JOINING: u8 = 1;
const JOINED: u8 = 2;

/// Process wide guard: a process joins at most one group. Only successful joins count.
static STATE: AtomicU8 = AtomicU8::new(IDLE);

/// How to join a group.
#[derive(Debug, Clone, PartialEq)]
pub struct InitOptions {
    pub backend: Backend,
    pub init_method: String,
    /// Selects the horovod backend regardless of `backend`.
    pub use_alternate_backend: bool,
    pub rank: usize,
    pub world_size: usize,
    pub timeout: Duration,
}

impl InitOptions {
    pub fn new(rank: usize, world_size: usize) -> Self {
        Self {
            backend: Backend::Gloo,
            init_method: DistributedConfig::default().init_method,
            use_alternate_backend: false,
            rank,
            world_size,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Takes everything but the rank and world size from the session configuration.
    pub fn with_config(mut self, config: &DistributedConfig) -> Self {
        self.backend = config.backend;
        self.init_method = config.init_method.clone();
        self.use_alternate_backend = config.use_alternate_backend;
        self.timeout = config.timeout();
        self
    }

    /// Reads the rank and world size the launcher exported.
    ///
    /// `RANK` takes precedence over `LOCAL_RANK`; both default to 0 and
    /// `WORLD_SIZE` defaults to 1.
    ///
    /// # Errors
    /// `InitErr::InvalidEnv` if a variable is not a number.
    pub fn from_env() -> std::result::Result<Self, InitErr> {
        Self::from_vars(|var| env::var(var).ok())
    }

    pub(crate) fn from_vars<F>(lookup: F) -> std::result::Result<Self, InitErr>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |var: &'static str| -> std::result::Result<Option<usize>, InitErr> {
            lookup(var)
                .map(|value| {
                    value
                        .trim()
                        .parse()
                        .map_err(|_| InitErr::InvalidEnv { var, value })
                })
                .transpose()
        };

        let rank = match read("RANK")? {
            Some(rank) => rank,
            None => read("LOCAL_RANK")?.unwrap_or(0),
        };
        let world_size = read("WORLD_SIZE")?.unwrap_or(1);

        Ok(Self::new(rank, world_size))
    }

    fn effective_backend(&self) -> Backend {
        if self.use_alternate_backend {
            Backend::Horovod
        } else {
            self.backend
        }
    }
}

/// Marks this process as joining, unless it already joined or is joining.
fn claim() -> Result<()> {
    STATE
        .compare_exchange(IDLE, JOINING, Ordering::AcqRel, Ordering::Acquire)
        .map(|_| ())
        .map_err(|_| InitErr::AlreadyInitialized.into())
}

/// Gives the join back after a failed rendezvous.
fn release(options: &InitOptions, e: CommsErr) -> OrchestraErr {
    STATE.store(IDLE, Ordering::Release);
    warn!(init_method = options.init_method.as_str(); "could not join group: {e}");
    InitErr::Rendezvous(e).into()
}

/// This process' place in a distributed job.
///
/// Immutable once built; the group is left when the last clone is dropped.
#[derive(Clone)]
pub struct DistributedContext {
    backend: Backend,
    init_method: String,
    group: Option<Arc<dyn ProcessGroup>>,
}

impl DistributedContext {
    /// The context of a process that trains on its own.
    pub fn single() -> Self {
        Self {
            backend: Backend::Gloo,
            init_method: String::new(),
            group: None,
        }
    }

    /// Joins the group described by `options`, blocking until every member joined.
    ///
    /// # Errors
    /// `OrchestraErr::Initialization` if this process already joined a group or the
    /// rendezvous fails (unsupported init method or backend, inconsistent rank or
    /// world size, peers unreachable within the timeout).
    pub fn init(options: InitOptions) -> Result<Self> {
        claim()?;

        let backend = options.effective_backend();
        let joined = comms::connect(
            backend,
            &options.init_method,
            options.rank,
            options.world_size,
            options.timeout,
        );

        match joined {
            Ok(group) => {
                STATE.store(JOINED, Ordering::Release);
                info!(
                    backend = backend.to_string().as_str(),
                    init_method = options.init_method.as_str(),
                    rank = options.rank,
                    world_size = options.world_size;
                    "joined distributed group"
                );

                Ok(Self {
                    backend,
                    init_method: options.init_method,
                    group: Some(Arc::new(group)),
                })
            }
            Err(e) => Err(release(&options, e)),
        }
    }

    /// Joins every member of the group described by `options` from this process.
    ///
    /// `local://` groups only reach members of the same process, so a job of
    /// `world_size > 1` on one machine is hosted entirely here, one context per
    /// rank. `options.rank` is ignored. Counts as this process' single join.
    ///
    /// # Returns
    /// The contexts of ranks `0..world_size`, in rank order.
    ///
    /// # Errors
    /// Like `init`. If any member fails to join, the members that did are aborted.
    pub fn init_local(options: InitOptions) -> Result<Vec<Self>> {
        claim()?;

        let backend = options.effective_backend();
        let world_size = options.world_size;
        if world_size == 0 {
            let e = CommsErr::InvalidRank {
                rank: 0,
                world_size,
            };
            return Err(release(&options, e));
        }

        let joined: Vec<comms::Result<LocalGroup>> = thread::scope(|s| {
            let handles: Vec<_> = (0..world_size)
                .map(|rank| {
                    let options = &options;
                    s.spawn(move || {
                        comms::connect(
                            backend,
                            &options.init_method,
                            rank,
                            world_size,
                            options.timeout,
                        )
                    })
                })
                .collect();

            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|p| panic::resume_unwind(p)))
                .collect()
        });

        if let Some(e) = joined.iter().find_map(|j| j.as_ref().err()).cloned() {
            joined.iter().flatten().for_each(|group| group.abort());
            return Err(release(&options, e));
        }

        STATE.store(JOINED, Ordering::Release);
        info!(
            backend = backend.to_string().as_str(),
            init_method = options.init_method.as_str(),
            world_size = world_size;
            "hosting every rank of the distributed group"
        );

        Ok(joined
            .into_iter()
            .flatten()
            .map(|group| Self {
                backend,
                init_method: options.init_method.clone(),
                group: Some(Arc::new(group)),
            })
            .collect())
    }

    /// Wraps an already formed group, bypassing the once per process guard.
    pub fn from_group(backend: Backend, group: Arc<dyn ProcessGroup>) -> Self {
        Self {
            backend,
            init_method: String::new(),
            group: Some(group),
        }
    }

    pub fn is_distributed(&self) -> bool {
        self.group.is_some()
    }

    pub fn node_count(&self) -> usize {
        self.group.as_ref().map_or(1, |g| g.world_size())
    }

    pub fn local_rank(&self) -> usize {
        self.group.as_ref().map_or(0, |g| g.rank())
    }

    pub fn is_primary(&self) -> bool {
        self.local_rank() == 0
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn init_method(&self) -> &str {
        &self.init_method
    }

    pub(crate) fn group(&self) -> Option<&Arc<dyn ProcessGroup>> {
        self.group.as_ref()
    }
}

impl fmt::Debug for DistributedContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedContext")
            .field("backend", &self.backend)
            .field("init_method", &self.init_method)
            .field("node_count", &self.node_count())
            .field("local_rank", &self.local_rank())
            .finish()
    }
}
