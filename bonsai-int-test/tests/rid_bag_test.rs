use bonsai::common::{RecordId, RecordRef, RIDBAG_HEADER_SIZE};
use bonsai::errors::{BonsaiResult, ErrorKind};
use bonsai::ridbag::RidBag;
use bonsai::store::{AtomicOperation, SerializationContext};
use bonsai_int_test::test_util::{cleanup, create_test_context, run_test, TestContext, TEST_CLUSTER};
use rand::Rng;
use std::collections::HashMap;

#[ctor::ctor]
fn init() {
    colog::init();
}

fn link(position: i64) -> RecordRef {
    RecordRef::new(RecordId::new(3, position))
}

fn counts(bag: &mut RidBag) -> BonsaiResult<HashMap<RecordId, i32>> {
    let mut counts = HashMap::new();
    for record in bag.raw_iter() {
        *counts.entry(record?.identity()).or_insert(0) += 1;
    }
    Ok(counts)
}

fn commit(ctx: &TestContext, bag: &mut RidBag) -> BonsaiResult<Vec<u8>> {
    let operation = AtomicOperation::new();
    let header = bag.serialize(&SerializationContext::new(operation.clone()))?;
    operation.commit(&ctx.bags())?;
    Ok(header)
}

#[test]
fn test_save_and_load_bag() {
    run_test(
        create_test_context,
        |ctx| {
            let mut bag = ctx.new_bag();
            for position in 0..200 {
                bag.add(&link(position))?;
            }
            bag.add(&link(17))?;
            let unsaved = RecordRef::unsaved();
            bag.add(&unsaved)?;
            assert_eq!(bag.size()?, 202);

            let header = commit(&ctx, &mut bag)?;
            assert_eq!(header.len(), RIDBAG_HEADER_SIZE);
            assert!(unsaved.identity().is_persistent());
            assert_eq!(unsaved.identity().cluster_id(), TEST_CLUSTER);

            let pointer = bag.collection_pointer().expect("bag has a tree after commit");
            let mut loaded = RidBag::deserialize(&header, pointer.file_id(), ctx.bags(), ctx.resolver())?;
            assert_eq!(loaded.collection_pointer(), Some(pointer));
            assert_eq!(loaded.size()?, 202);

            let loaded_counts = counts(&mut loaded)?;
            assert_eq!(loaded_counts[&RecordId::new(3, 17)], 2);
            assert_eq!(loaded_counts[&unsaved.identity()], 1);
            assert_eq!(loaded_counts, counts(&mut bag)?);
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_bag_matches_multiset_model() {
    run_test(
        create_test_context,
        |ctx| {
            let mut rng = rand::rng();
            let mut model: HashMap<RecordId, i32> = HashMap::new();
            let mut bag = ctx.new_bag();
            let mut header = None;

            for round in 0..6 {
                for _ in 0..150 {
                    let position = rng.random_range(0..60);
                    let record = link(position);
                    let present = model.get(&record.identity()).copied().unwrap_or(0);
                    if present > 0 && rng.random_bool(0.4) {
                        assert!(bag.remove(&record)?);
                        model.insert(record.identity(), present - 1);
                    } else {
                        bag.add(&record)?;
                        model.insert(record.identity(), present + 1);
                    }
                }
                model.retain(|_, count| *count > 0);

                let expected_size = model.values().sum::<i32>();
                assert_eq!(bag.size()?, expected_size, "size before commit of round {}", round);
                assert_eq!(counts(&mut bag)?, model, "content before commit of round {}", round);

                header = Some(commit(&ctx, &mut bag)?);
                assert!(bag.pending_changes().is_empty());
                assert_eq!(counts(&mut bag)?, model, "content after commit of round {}", round);
            }

            let header = header.expect("at least one round ran");
            let file_id = bag.collection_pointer().map(|p| p.file_id()).unwrap_or_default();
            let mut loaded = RidBag::deserialize(&header, file_id, ctx.bags(), ctx.resolver())?;
            assert_eq!(loaded.size()?, model.values().sum::<i32>());
            assert_eq!(counts(&mut loaded)?, model);
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_iterator_remove_drains_bag() {
    run_test(
        create_test_context,
        |ctx| {
            let mut bag = ctx.new_bag();
            for position in 0..40 {
                bag.add(&link(position))?;
                bag.add(&link(position))?;
            }
            commit(&ctx, &mut bag)?;

            {
                let mut iter = bag.raw_iter();
                assert_eq!(iter.remove().unwrap_err().kind(), &ErrorKind::InvalidOperation);
                while let Some(record) = iter.next() {
                    let record = record?;
                    if record.identity().cluster_position() % 2 == 0 {
                        iter.remove()?;
                    }
                }
            }
            // both occurrences of every even link are gone
            assert_eq!(bag.size()?, 40);
            commit(&ctx, &mut bag)?;

            let remaining = counts(&mut bag)?;
            assert_eq!(remaining.len(), 20);
            for position in (1..40).step_by(2) {
                assert_eq!(remaining[&RecordId::new(3, position)], 2);
            }
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_delete_bag_frees_tree() {
    run_test(
        create_test_context,
        |ctx| {
            let mut bag = ctx.new_bag();
            for position in 0..50 {
                bag.add(&link(position))?;
            }
            commit(&ctx, &mut bag)?;
            let pointer = bag.collection_pointer().expect("bag has a tree after commit");

            let err = bag.delete(&SerializationContext::detached()).unwrap_err();
            assert_eq!(err.kind(), &ErrorKind::InvalidOperation);
            assert_eq!(bag.size()?, 50);

            let operation = AtomicOperation::new();
            bag.delete(&SerializationContext::new(operation.clone()))?;
            assert!(bag.collection_pointer().is_none());
            assert!(bag.is_empty()?);
            operation.commit(&ctx.bags())?;
            assert!(!ctx.bags().contains(&pointer));

            // a new tree reuses the freed buckets of the same file
            let mut other = ctx.new_bag();
            other.add(&link(1))?;
            commit(&ctx, &mut other)?;
            let reused = other.collection_pointer().expect("bag has a tree after commit");
            assert_eq!(reused.file_id(), pointer.file_id());
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_unresolvable_record_fails_serialization() {
    run_test(
        create_test_context,
        |ctx| {
            let mut bag = ctx.new_bag();
            bag.add(&link(1))?;
            bag.add(&RecordRef::unsaved())?;

            ctx.resolver().set_refuse(true);
            assert!(!bag.convert_records_to_links());
            let err = commit(&ctx, &mut bag).unwrap_err();
            assert_eq!(err.kind(), &ErrorKind::UnresolvableRecord);
            assert!(err.kind().is_fatal());

            ctx.resolver().set_refuse(false);
            assert!(bag.convert_records_to_links());
            commit(&ctx, &mut bag)?;
            assert_eq!(bag.size()?, 2);
            Ok(())
        },
        cleanup,
    )
}
