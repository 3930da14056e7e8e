use bonsai::common::{RecordId, RecordRef};
use bonsai::errors::BonsaiResult;
use bonsai::ridbag::RidBag;
use bonsai::store::{AtomicOperation, SerializationContext};
use bonsai_int_test::test_util::{
    cleanup, create_test_context, create_test_context_with, run_test, test_config_builder,
};
use std::sync::{Arc, Barrier};
use std::thread;

#[ctor::ctor]
fn init() {
    colog::init();
}

#[test]
fn test_concurrent_borrows_of_one_tree() {
    run_test(
        create_test_context,
        |ctx| {
            let cache = ctx.bags();
            let (tree, pointer) = cache.create_sb_tree(1)?;
            tree.release()?;

            let num_threads = 6;
            let puts_per_thread = 50;
            let barrier = Arc::new(Barrier::new(num_threads));
            let mut handles = vec![];

            for thread_id in 0..num_threads {
                let cache = cache.clone();
                let barrier = Arc::clone(&barrier);
                handles.push(thread::spawn(move || -> BonsaiResult<()> {
                    barrier.wait();
                    for i in 0..puts_per_thread {
                        let tree = cache.load_sb_tree(&pointer)?;
                        let key = RecordId::new(1, (thread_id * puts_per_thread + i) as i64);
                        tree.put(&key, &(thread_id as i32))?;
                        tree.release()?;
                    }
                    Ok(())
                }));
            }

            for handle in handles {
                handle.join().expect("worker panicked")?;
            }

            assert_eq!(cache.usages(&pointer), Some(0));
            let tree = cache.load_sb_tree(&pointer)?;
            assert_eq!(tree.size()?, (num_threads * puts_per_thread) as u64);
            tree.release()?;
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_concurrent_bags_under_eviction() {
    run_test(
        || create_test_context_with(test_config_builder().cache_max_size(4).eviction_threshold(2)),
        |ctx| {
            let num_threads = 4;
            let bags_per_thread: i32 = 5;
            let barrier = Arc::new(Barrier::new(num_threads));
            let mut handles = vec![];

            for thread_id in 0..num_threads {
                let ctx = ctx.clone();
                let barrier = Arc::clone(&barrier);
                handles.push(thread::spawn(move || -> BonsaiResult<Vec<(Vec<u8>, i64, i32)>> {
                    barrier.wait();
                    let mut saved = vec![];
                    for b in 0..bags_per_thread {
                        let mut bag = ctx.new_bag();
                        let links = 10 + b;
                        for position in 0..links {
                            let id = RecordId::new(20 + thread_id as i32, position as i64);
                            bag.add(&RecordRef::new(id))?;
                        }
                        let operation = AtomicOperation::new();
                        let header = bag.serialize(&SerializationContext::new(operation.clone()))?;
                        operation.commit(&ctx.bags())?;
                        let file_id = bag.collection_pointer().map(|p| p.file_id()).unwrap_or_default();
                        saved.push((header, file_id, links));
                    }
                    Ok(saved)
                }));
            }

            let mut saved = vec![];
            for handle in handles {
                saved.extend(handle.join().expect("worker panicked")?);
            }

            assert_eq!(saved.len(), num_threads * bags_per_thread as usize);
            for (header, file_id, links) in saved {
                let mut bag = RidBag::deserialize(&header, file_id, ctx.bags(), ctx.resolver())?;
                assert_eq!(bag.size()?, links);
            }
            Ok(())
        },
        cleanup,
    )
}
