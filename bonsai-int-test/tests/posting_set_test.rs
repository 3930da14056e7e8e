use bonsai::common::RecordId;
use bonsai::index::{posting_codec, EmbeddedOrTreeSet};
use bonsai_int_test::test_util::{cleanup, create_test_context, run_test};
use rand::seq::SliceRandom;
use std::collections::BTreeSet;

#[ctor::ctor]
fn init() {
    colog::init();
}

fn ids(range: std::ops::Range<i64>) -> Vec<RecordId> {
    range.map(|position| RecordId::new(9, position)).collect()
}

#[test]
fn test_set_follows_thresholds() {
    run_test(
        create_test_context,
        |ctx| {
            let config = ctx.config();
            let top = config.top_threshold() as i64;
            let bottom = config.bottom_threshold() as i64;
            let mut set = EmbeddedOrTreeSet::new(ctx.postings(), "person_name");

            set.add_all(ids(0..top))?;
            assert!(set.is_embedded());
            assert!(set.add(RecordId::new(9, top))?);
            assert!(!set.is_embedded());
            assert_eq!(set.len()?, top as usize + 1);

            // shrinking to the bottom threshold keeps the tree
            for id in ids(bottom..top + 1) {
                assert!(set.remove(&id)?);
            }
            assert_eq!(set.len()?, bottom as usize);
            assert!(!set.is_embedded());

            assert!(set.remove(&RecordId::new(9, 0))?);
            assert!(set.is_embedded());
            assert_eq!(set.iter()?.collect::<Vec<_>>(), ids(1..bottom));
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_set_matches_model() {
    run_test(
        create_test_context,
        |ctx| {
            let mut rng = rand::rng();
            let mut all = ids(0..200);
            all.shuffle(&mut rng);

            let mut model = BTreeSet::new();
            let mut set = EmbeddedOrTreeSet::new(ctx.postings(), "person_age");
            for id in &all {
                assert_eq!(set.add(*id)?, model.insert(*id));
                assert!(!set.add(*id)?);
            }
            assert_eq!(set.iter()?.collect::<BTreeSet<_>>(), model);

            all.shuffle(&mut rng);
            for id in all.iter().take(197) {
                assert_eq!(set.remove(id)?, model.remove(id));
                assert_eq!(set.len()?, model.len());
            }
            assert!(set.is_embedded());
            for id in &model {
                assert!(set.contains(id)?);
            }
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_encoded_set_survives_decode() {
    run_test(
        create_test_context,
        |ctx| {
            let mut set = EmbeddedOrTreeSet::new(ctx.postings(), "person_city");
            set.add_all(ids(0..3))?;
            let embedded = posting_codec::encode(&set)?;
            let decoded = posting_codec::decode(&embedded, ctx.postings(), "person_city")?;
            assert_eq!(decoded.iter()?.collect::<Vec<_>>(), ids(0..3));

            set.check_not_embedded()?;
            let pointer = set.collection_pointer();
            assert!(pointer.is_some());
            let tree_backed = posting_codec::encode(&set)?;
            let decoded = posting_codec::decode(&tree_backed, ctx.postings(), "person_city")?;
            assert_eq!(decoded.collection_pointer(), pointer);
            assert_eq!(decoded.iter()?.collect::<Vec<_>>(), ids(0..3));

            set.clear()?;
            assert!(set.is_embedded());
            assert!(set.is_empty()?);
            Ok(())
        },
        cleanup,
    )
}
