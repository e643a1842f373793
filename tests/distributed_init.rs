//! Joining a group is once per process, so this binary holds a single test.

use std::time::Duration;

use comms::{Backend, CommsErr};
use orchestra::{DistributedContext, InitOptions, OrchestraErr, error::InitErr};

fn rendezvous_err(result: orchestra::Result<DistributedContext>) -> CommsErr {
    match result {
        Err(OrchestraErr::Initialization(InitErr::Rendezvous(e))) => e,
        other => panic!("expected a rendezvous error, got {other:?}"),
    }
}

#[test]
fn init_fails_cleanly_then_joins_once() {
    let unreachable = InitOptions {
        init_method: "local://unreachable".into(),
        timeout: Duration::from_millis(50),
        ..InitOptions::new(0, 2)
    };
    let err = rendezvous_err(DistributedContext::init(unreachable));
    assert!(matches!(err, CommsErr::Timeout { op: "rendezvous", .. }));

    let tcp = InitOptions {
        init_method: "tcp://10.0.0.1:23456".into(),
        ..InitOptions::new(0, 1)
    };
    let err = rendezvous_err(DistributedContext::init(tcp));
    assert!(matches!(err, CommsErr::UnsupportedInitMethod(_)));

    let nccl = InitOptions {
        backend: Backend::Nccl,
        ..InitOptions::new(0, 1)
    };
    let err = rendezvous_err(DistributedContext::init(nccl));
    assert_eq!(err, CommsErr::BackendUnavailable(Backend::Nccl));

    let solo = InitOptions {
        init_method: "local://solo".into(),
        use_alternate_backend: true,
        ..InitOptions::new(0, 1)
    };
    let ctx = DistributedContext::init(solo.clone()).unwrap();
    assert!(ctx.is_distributed());
    assert!(ctx.is_primary());
    assert_eq!(ctx.node_count(), 1);
    assert_eq!(ctx.local_rank(), 0);
    assert_eq!(ctx.backend(), Backend::Horovod);
    assert_eq!(ctx.init_method(), "local://solo");

    assert!(matches!(
        DistributedContext::init(solo),
        Err(OrchestraErr::Initialization(InitErr::AlreadyInitialized))
    ));
}
