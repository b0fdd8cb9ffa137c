use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{PersistentBitSet, PersistentCounters};

#[test]
fn counters_dec_returns_previous_value() {
    let mut counters = PersistentCounters::new();
    let root = counters.init(&[3, 0, 2, 1]);

    let (root, v) = counters.dec(root, 0);
    assert_eq!(v, 3);
    let (root, v) = counters.dec(root, 0);
    assert_eq!(v, 2);

    // Entry 1 is already exhausted; the root must not change.
    let (same, v) = counters.dec(root, 1);
    assert_eq!(v, 0);
    assert_eq!(same, root);
}

#[test]
fn counters_saturate_on_init() {
    let mut counters = PersistentCounters::new();
    let root = counters.init(&[7]);
    let (root, v) = counters.dec(root, 0);
    assert_eq!(v, 3);
    let (root, v) = counters.dec(root, 0);
    assert_eq!(v, 2);
    let (root, v) = counters.dec(root, 0);
    assert_eq!(v, 1);
    let (_, v) = counters.dec(root, 0);
    assert_eq!(v, 0);
}

#[test]
fn bitset_set_and_get() {
    let mut bits = PersistentBitSet::new();
    let root = bits.init(300);
    assert!(!bits.get(root, 299));

    let (root, was) = bits.set(root, 299);
    assert!(!was);
    assert!(bits.get(root, 299));

    let (same, was) = bits.set(root, 299);
    assert!(was);
    assert_eq!(same, root);
    assert!(!bits.get(root, 0));
}

#[test]
fn bitset_old_versions_survive_writes() {
    let mut bits = PersistentBitSet::new();
    let empty = bits.init(1000);

    bits.new_version();
    let (half, _) = (0..500).fold((empty, false), |(r, _), i| bits.set(r, i));

    bits.new_version();
    let (full, _) = (500..1000).fold((half, false), |(r, _), i| bits.set(r, i));

    for i in 0..1000 {
        assert!(!bits.get(empty, i));
        assert_eq!(bits.get(half, i), i < 500);
        assert!(bits.get(full, i));
    }
}

#[test]
fn counters_current_version_mutates_in_place() {
    let mut counters = PersistentCounters::new();
    let root = counters.init(&[2, 2]);
    // Still in version 0: the decrement may write through `root` itself.
    let (next, _) = counters.dec(root, 0);
    assert_eq!(next, root);
}

// Differential check against a plain Vec model. Snapshots are taken at
// version boundaries only, since handles within one version alias.
#[test]
fn bitset_matches_model_across_versions() {
    let mut rng = StdRng::seed_from_u64(0xb17_5e7);
    for round in 0..20 {
        let size = rng.gen_range(1..2000);
        let mut bits = PersistentBitSet::new();
        let mut root = bits.init(size);
        let mut model = vec![false; size];
        let mut snapshots = vec![(root, model.clone())];

        for _ in 0..rng.gen_range(1..30) {
            bits.new_version();
            for _ in 0..rng.gen_range(0..100) {
                let i = rng.gen_range(0..size);
                let (next, was) = bits.set(root, i);
                assert_eq!(was, model[i], "round {round}");
                root = next;
                model[i] = true;
            }
            snapshots.push((root, model.clone()));
        }

        for (snap_root, snap_model) in &snapshots {
            for (i, &expected) in snap_model.iter().enumerate() {
                assert_eq!(bits.get(*snap_root, i), expected, "round {round}");
            }
        }
    }
}

#[test]
fn counters_match_model_across_versions() {
    let mut rng = StdRng::seed_from_u64(0xdec_dec);
    for round in 0..20 {
        let size = rng.gen_range(1..2000);
        let init: Vec<u32> = (0..size).map(|_| rng.gen_range(0..4)).collect();
        let mut counters = PersistentCounters::new();
        let mut root = counters.init(&init);
        let mut model = init.clone();
        let mut snapshots = vec![(root, model.clone())];

        for _ in 0..rng.gen_range(1..20) {
            counters.new_version();
            for _ in 0..rng.gen_range(0..100) {
                let i = rng.gen_range(0..size);
                let (next, old) = counters.dec(root, i);
                assert_eq!(old, model[i], "round {round}");
                root = next;
                model[i] = model[i].saturating_sub(1);
            }
            snapshots.push((root, model.clone()));
        }

        // Drain every snapshot and check the counts it preserved. Draining
        // happens in a fresh version so it cannot disturb other snapshots.
        counters.new_version();
        for (snap_root, snap_model) in &snapshots {
            let mut cur = *snap_root;
            for (i, &expected) in snap_model.iter().enumerate() {
                let mut seen = 0;
                loop {
                    let (next, old) = counters.dec(cur, i);
                    cur = next;
                    if old == 0 {
                        break;
                    }
                    seen += 1;
                }
                assert_eq!(seen, expected, "round {round}");
            }
        }
    }
}
