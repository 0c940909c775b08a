use std::sync::mpsc;

use serial_test::serial;

use tessera::pattern::{fill, parallel_reduce, serial_for_each, serial_for_each_mut, ParallelPolicy};
use tessera::{GlobalSpan, LocalFabric, MapperKind, Mode, TesseraWorldBuilder};

const BS: usize = 4096;

fn builder(fabric: &LocalFabric, pe: usize) -> TesseraWorldBuilder {
    TesseraWorldBuilder::new()
        .with_fabric(fabric, pe)
        .with_block_size(BS)
        .with_heap_size(16 * 1024 * 1024)
}

/// Run the same rank program on every rank of a fresh fabric and collect the
/// per-rank results.
fn spawn_ranks<F, R>(n: usize, f: F) -> Vec<R>
where
    F: Fn(LocalFabric, usize) -> R + Clone + Send + 'static,
    R: Send + 'static,
{
    let fabric = LocalFabric::new(n);
    let handles: Vec<_> = (0..n)
        .map(|pe| {
            let fabric = fabric.clone();
            let f = f.clone();
            std::thread::spawn(move || f(fabric, pe))
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

fn pattern_byte(i: usize) -> u8 {
    (i * 31 + 7) as u8
}

#[test]
#[serial]
fn coherent_write_release_acquire_read() {
    // scenario: rank 0 publishes a block it owns; rank 1 reads it through the
    // cache, twice, with an epoch-driven refetch in between
    let results = spawn_ranks(2, |fabric, pe| {
        let world = builder(&fabric, pe)
            .with_shared_memory(false)
            .build()
            .unwrap();
        let p = world.malloc_coll::<u8>(1024 * 1024);

        if pe == 0 {
            let mut cs = world.checkout(p, BS, Mode::Write);
            for (i, x) in cs.iter_mut().enumerate() {
                *x = pattern_byte(i);
            }
            cs.checkin();
            world.release();
        }
        world.barrier();

        if pe == 1 {
            world.acquire();
            let cs = world.checkout(p, BS, Mode::Read);
            for (i, x) in cs.iter().enumerate() {
                assert_eq!(*x, pattern_byte(i), "first read, byte {}", i);
            }
        }
        world.barrier();

        // second round: the same block changes, rank 1 must not serve the
        // stale cached copy
        if pe == 0 {
            let mut cs = world.checkout(p, BS, Mode::Write);
            for (i, x) in cs.iter_mut().enumerate() {
                *x = pattern_byte(i).wrapping_add(1);
            }
            cs.checkin();
            world.release();
        }
        world.barrier();

        if pe == 1 {
            world.acquire();
            let cs = world.checkout(p, BS, Mode::Read);
            for (i, x) in cs.iter().enumerate() {
                assert_eq!(*x, pattern_byte(i).wrapping_add(1), "second read, byte {}", i);
            }
        }
        world.barrier();
        world.free_coll(p);
        p.addr()
    });

    // the collective allocation produced the identical global pointer
    assert_eq!(results[0], results[1]);
}

#[test]
#[serial]
fn lazy_release_handoff_crosses_ranks() {
    // rank 0 writes a block homed on rank 1, hands the lazy-release handle to
    // rank 2 (a migrating task), which acquires it and reads the data with at
    // most one transport wait
    let (tx, rx) = mpsc::channel();
    let fabric = LocalFabric::new(3);

    let mk = |fabric: &LocalFabric, pe: usize| {
        builder(fabric, pe)
            .with_shared_memory(false)
            .build()
            .unwrap()
    };

    let f0 = fabric.clone();
    let t0 = std::thread::spawn(move || {
        let world = mk(&f0, 0);
        let p = world.malloc_coll::<u8>(12 * BS);
        // with 3 ranks and 12 blocks, block 5 is homed on rank 1
        let target = p.add(5 * BS);

        let mut cs = world.checkout(target, BS, Mode::Write);
        for (i, x) in cs.iter_mut().enumerate() {
            *x = pattern_byte(i);
        }
        cs.checkin();

        let waits_before = world.comm_stats().waits;
        let handle = world.release_lazy();
        assert_eq!(
            world.comm_stats().waits,
            waits_before,
            "lazy release must not wait"
        );
        tx.send(handle).unwrap();

        world.barrier();
        world.free_coll(p);
    });

    let f1 = fabric.clone();
    let t1 = std::thread::spawn(move || {
        let world = mk(&f1, 1);
        let p = world.malloc_coll::<u8>(12 * BS);
        world.barrier();
        world.free_coll(p);
    });

    let f2 = fabric.clone();
    let t2 = std::thread::spawn(move || {
        let world = mk(&f2, 2);
        let p = world.malloc_coll::<u8>(12 * BS);
        let target = p.add(5 * BS);

        let handle = rx.recv().unwrap();
        let waits_before = world.comm_stats().waits;
        world.acquire_handle(&handle);
        let cs = world.checkout(target, BS, Mode::Read);
        for (i, x) in cs.iter().enumerate() {
            assert_eq!(*x, pattern_byte(i));
        }
        drop(cs);
        assert!(
            world.comm_stats().waits - waits_before <= 1,
            "handoff must cost at most one wait"
        );

        world.barrier();
        world.free_coll(p);
    });

    t0.join().unwrap();
    t1.join().unwrap();
    t2.join().unwrap();
}

#[test]
#[serial]
fn cache_evicts_lru_and_refetches() {
    // scenario: capacity 4, ten distinct remote blocks touched one at a time
    spawn_ranks(2, |fabric, pe| {
        let world = builder(&fabric, pe)
            .with_shared_memory(false)
            .with_cache_blocks(4)
            .build()
            .unwrap();
        // 20 blocks: rank 0 owns the first 10
        let p = world.malloc_coll::<u8>(20 * BS);

        if pe == 0 {
            let mut cs = world.checkout(p, 10 * BS, Mode::Write);
            for (i, x) in cs.iter_mut().enumerate() {
                *x = pattern_byte(i / BS);
            }
            cs.checkin();
            world.release();
        }
        world.barrier();

        if pe == 1 {
            world.acquire();
            for blk in 0..10 {
                let cs = world.checkout(p.add(blk * BS), BS, Mode::Read);
                assert!(cs.iter().all(|&x| x == pattern_byte(blk)));
            }

            let stats = world.cache_stats();
            assert_eq!(stats.resident, 4, "capacity bounds residency");
            assert_eq!(stats.misses, 10);
            assert_eq!(stats.evictions, 6);

            // the survivors are the last four touched
            let mut resident: Vec<usize> = world
                .resident_blocks()
                .into_iter()
                .map(|(_, off)| off / BS)
                .collect();
            resident.sort_unstable();
            assert_eq!(resident, vec![6, 7, 8, 9]);

            // the first block was evicted: touching it again is a miss
            let cs = world.checkout(p, BS, Mode::Read);
            assert!(cs.iter().all(|&x| x == pattern_byte(0)));
            drop(cs);
            assert_eq!(world.cache_stats().misses, 11);
        }
        world.barrier();
        world.free_coll(p);
    });
}

#[test]
#[serial]
fn release_without_writes_moves_nothing() {
    spawn_ranks(2, |fabric, pe| {
        let world = builder(&fabric, pe)
            .with_shared_memory(false)
            .build()
            .unwrap();
        let p = world.malloc_coll::<u64>(4 * BS / 8);
        world.barrier();

        if pe == 1 {
            // a read warms the cache but dirties nothing
            let cs = world.checkout(p, 16, Mode::Read);
            let _ = cs[0];
            drop(cs);

            let before = world.comm_stats();
            world.release();
            let after = world.comm_stats();
            assert_eq!(before.puts, after.puts, "no-op release issued puts");
            assert_eq!(before.waits, after.waits, "no-op release waited");
        }
        world.barrier();
        world.free_coll(p);
    });
}

#[test]
#[serial]
fn colocated_ranks_read_home_directly() {
    spawn_ranks(2, |fabric, pe| {
        let world = builder(&fabric, pe)
            .with_shared_memory(true)
            .build()
            .unwrap();
        let p = world.malloc_coll::<u64>(4 * BS / 8);
        let n = 4 * BS / 8;

        // rank 0 writes the whole range, including rank 1's share, straight
        // through the home mappings
        if pe == 0 {
            let mut cs = world.checkout(p, n, Mode::Write);
            for (i, x) in cs.iter_mut().enumerate() {
                *x = (i * i) as u64;
            }
            cs.checkin();
            world.release();
        }
        world.barrier();

        if pe == 1 {
            world.acquire();
            let cs = world.checkout(p, n, Mode::Read);
            for (i, x) in cs.iter().enumerate() {
                assert_eq!(*x, (i * i) as u64);
            }
        }
        world.barrier();

        // nothing ever moved through the cache
        assert_eq!(world.cache_stats().misses, 0);
        assert_eq!(world.comm_stats().gets, 0);

        world.free_coll(p);
    });
}

#[test]
#[serial]
fn cyclic_stripes_roundtrip_through_cache() {
    spawn_ranks(2, |fabric, pe| {
        let world = builder(&fabric, pe)
            .with_shared_memory(false)
            .with_mapper(MapperKind::Cyclic)
            .build()
            .unwrap();
        let count = 6 * BS / 8;
        let p = world.malloc_coll::<u64>(count);
        let span = GlobalSpan::new(p, count);

        if pe == 0 {
            fill(&world, span, 0xabcd_0123u64);
            world.release();
        }
        world.barrier();

        if pe == 1 {
            world.acquire();
            let mut seen = 0usize;
            serial_for_each(&world, span, BS / 8, |x| {
                assert_eq!(*x, 0xabcd_0123u64);
                seen += 1;
            });
            assert_eq!(seen, count);
            // odd stripes are homed here, even stripes were fetched
            assert!(world.cache_stats().misses > 0);
        }
        world.barrier();
        world.free_coll(p);
    });
}

#[test]
#[serial]
fn reverse_block_homes_low_offsets_high() {
    spawn_ranks(2, |fabric, pe| {
        let world = builder(&fabric, pe)
            .with_shared_memory(false)
            .with_mapper(MapperKind::ReverseBlock)
            .build()
            .unwrap();
        let p = world.malloc_coll::<u8>(4 * BS);

        // block 0 is homed on rank 1 under the reflected partition, so rank
        // 0's write goes through its cache...
        if pe == 0 {
            let mut cs = world.checkout(p, BS, Mode::Write);
            cs.iter_mut().for_each(|x| *x = 0x5a);
            cs.checkin();
            world.release();
            assert!(world.cache_stats().misses > 0);
        }
        world.barrier();

        // ...and rank 1 reads its own home copy without fetching anything
        if pe == 1 {
            world.acquire();
            let gets_before = world.comm_stats().gets;
            let cs = world.checkout(p, BS, Mode::Read);
            assert!(cs.iter().all(|&x| x == 0x5a));
            drop(cs);
            assert_eq!(world.comm_stats().gets, gets_before);
        }
        world.barrier();
        world.free_coll(p);
    });
}

#[test]
#[serial]
fn collective_allocations_agree_across_ranks() {
    let results = spawn_ranks(3, |fabric, pe| {
        let world = builder(&fabric, pe).build().unwrap();
        let a = world.malloc_coll::<u64>(1000);
        let b = world.malloc_coll::<u8>(10 * BS);
        world.free_coll(a);
        let c = world.malloc_coll::<u32>(17);
        world.barrier();
        world.free_coll(b);
        world.free_coll(c);
        (a.addr(), b.addr(), c.addr())
    });
    assert_eq!(results[0], results[1]);
    assert_eq!(results[1], results[2]);
    let (a, b, c) = results[0];
    assert_ne!(a, b);
    // the freed range is reused
    assert_eq!(a, c);
}

#[test]
#[serial]
fn reduce_and_fill_drive_the_checkout_api() {
    spawn_ranks(1, |fabric, pe| {
        let world = builder(&fabric, pe).build().unwrap();
        let count = 100_000usize;
        let p = world.malloc_coll::<u64>(count);
        let span = GlobalSpan::new(p, count);

        fill(&world, span, 1u64);
        serial_for_each_mut(&world, span.subspan(0, 10), 4, |x| *x += 1);

        let sum = parallel_reduce(
            &world,
            &ParallelPolicy { cutoff: 1 << 12 },
            span,
            0u64,
            |acc, x| *acc += *x,
            |a, b| a + b,
        );
        assert_eq!(sum, count as u64 + 10);

        world.free_coll(p);
    });
}

#[test]
#[serial]
fn leaked_checkout_is_fatal_at_teardown() {
    let fabric = LocalFabric::new(1);
    let handle = std::thread::spawn(move || {
        let world = builder(&fabric, 0).build().unwrap();
        let p = world.malloc_coll::<u8>(BS);
        let cs = world.checkout(p, 16, Mode::Read);
        std::mem::forget(cs);
        drop(world); // panics: a checkout never checked in
    });
    assert!(handle.join().is_err());
}
