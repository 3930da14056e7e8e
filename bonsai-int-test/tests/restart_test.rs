use bonsai::common::{RecordId, RecordRef};
use bonsai::index::{posting_codec, EmbeddedOrTreeSet};
use bonsai::ridbag::RidBag;
use bonsai::store::{AtomicOperation, SerializationContext};
use bonsai_int_test::test_util::{cleanup, create_test_context, run_test};

#[ctor::ctor]
fn init() {
    colog::init();
}

#[test]
fn test_bag_survives_restart() {
    run_test(
        create_test_context,
        |ctx| {
            let mut bag = ctx.new_bag();
            for position in 0..300 {
                bag.add(&RecordRef::new(RecordId::new(4, position)))?;
            }
            let operation = AtomicOperation::new();
            let header = bag.serialize(&SerializationContext::new(operation.clone()))?;
            operation.commit(&ctx.bags())?;
            let file_id = bag.collection_pointer().map(|p| p.file_id()).unwrap_or_default();

            let reopened = ctx.reopen()?;
            let mut loaded = RidBag::deserialize(&header, file_id, reopened.bags(), reopened.resolver())?;
            assert_eq!(loaded.size()?, 300);
            assert!(loaded.contains(&RecordRef::new(RecordId::new(4, 299)))?);
            assert!(!loaded.contains(&RecordRef::new(RecordId::new(4, 300)))?);

            let ids = loaded
                .raw_iter()
                .map(|record| record.map(|r| r.identity().cluster_position()))
                .collect::<Result<Vec<_>, _>>()?;
            assert_eq!(ids, (0..300).collect::<Vec<_>>());

            cleanup(reopened)
        },
        cleanup,
    )
}

#[test]
fn test_posting_set_survives_restart() {
    run_test(
        create_test_context,
        |ctx| {
            let mut small = EmbeddedOrTreeSet::new(ctx.postings(), "city");
            small.add(RecordId::new(2, 1))?;
            let mut large = EmbeddedOrTreeSet::new(ctx.postings(), "city");
            large.add_all((0..100).map(|position| RecordId::new(2, position)))?;
            assert!(!large.is_embedded());

            let small_bytes = posting_codec::encode(&small)?;
            let large_bytes = posting_codec::encode(&large)?;

            let reopened = ctx.reopen()?;
            let small = posting_codec::decode(&small_bytes, reopened.postings(), "city")?;
            assert!(small.is_embedded());
            assert_eq!(small.iter()?.collect::<Vec<_>>(), vec![RecordId::new(2, 1)]);

            let large = posting_codec::decode(&large_bytes, reopened.postings(), "city")?;
            assert_eq!(large.len()?, 100);
            assert!(large.contains(&RecordId::new(2, 42))?);

            cleanup(reopened)
        },
        cleanup,
    )
}
