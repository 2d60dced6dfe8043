use alloyscreen::resources::{ClusterType, ResourceLedger, Sandbox};

#[test]
fn test_one_claim_per_device() {
    let mut ledger = ResourceLedger::with_inventory(ClusterType::Local, "node".into(), 8, 2);
    assert_eq!(ledger.cores_per_device(), 4);

    let a = ledger.claim_device().expect("first device");
    let b = ledger.claim_device().expect("second device");
    assert_eq!(a.gpus, vec![0]);
    assert_eq!(b.gpus, vec![1]);
    assert_eq!(a.cores, vec![0, 1, 2, 3]);
    assert_eq!(b.cores, vec![4, 5, 6, 7]);
    assert!(ledger.claim_device().is_none());

    ledger.release(&a);
    assert_eq!(ledger.free_devices(), 1);
    let c = ledger.claim_device().expect("released device");
    assert_eq!(c.gpus, vec![0]);
}

#[test]
fn test_cpu_only_host_has_no_devices() {
    let mut ledger = ResourceLedger::with_inventory(ClusterType::Local, "node".into(), 4, 0);
    assert_eq!(ledger.device_count(), 0);
    assert_eq!(ledger.cores_per_device(), 4);
    assert!(ledger.claim_device().is_none());
}

#[test]
fn test_sandbox_env_vars() {
    let sandbox = Sandbox {
        cores: vec![2, 3],
        gpus: vec![1],
    };
    let vars = sandbox.env_vars();
    assert!(vars.contains(&("OMP_NUM_THREADS", "2".to_string())));
    assert!(vars.contains(&("ALLOYSCREEN_PINNED_CORES", "2,3".to_string())));
    assert!(vars.contains(&("CUDA_VISIBLE_DEVICES", "1".to_string())));

    assert!(Sandbox::default().env_vars().is_empty());
    assert_eq!(Sandbox::for_device(None).signature(), "cpu");
    assert_eq!(Sandbox::for_device(Some(0)).signature(), "gpu[0]");
}
