use bonsai::common::RecordId;
use bonsai_int_test::test_util::{cleanup, create_test_context, run_test};
use rand::Rng;
use std::collections::BTreeMap;
use std::ops::Bound;

#[ctor::ctor]
fn init() {
    colog::init();
}

fn key(position: i64) -> RecordId {
    RecordId::new((position % 3) as i32 + 1, position)
}

#[test]
fn test_random_updates_match_btree_map() {
    run_test(
        create_test_context,
        |ctx| {
            let mut rng = rand::rng();
            let mut model = BTreeMap::new();
            let (tree, pointer) = ctx.bags().create_sb_tree(5)?;

            for _ in 0..3000 {
                let k = key(rng.random_range(0..1500));
                if rng.random_bool(0.3) {
                    assert_eq!(tree.remove(&k)?, model.remove(&k));
                } else {
                    let value = rng.random_range(1..100);
                    assert!(tree.put(&k, &value)?);
                    model.insert(k, value);
                }
            }

            assert_eq!(tree.size()?, model.len() as u64);
            assert_eq!(tree.first_key()?, model.keys().next().copied());
            assert_eq!(tree.last_key()?, model.keys().next_back().copied());
            for (k, v) in &model {
                assert_eq!(tree.get(k)?, Some(*v));
            }
            tree.release()?;

            let tree = ctx.bags().load_sb_tree(&pointer)?;
            assert_eq!(tree.size()?, model.len() as u64);
            tree.release()?;
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_range_queries() {
    run_test(
        create_test_context,
        |ctx| {
            let (tree, _) = ctx.bags().create_sb_tree(6)?;
            let mut model = BTreeMap::new();
            for position in (0..900).step_by(3) {
                let k = RecordId::new(1, position);
                tree.put(&k, &(position as i32))?;
                model.insert(k, position as i32);
            }

            let from = RecordId::new(1, 300);
            let to = RecordId::new(1, 600);

            let major = tree.values_major(&from, true, -1)?;
            let expected = model.range(from..).map(|(_, v)| *v).collect::<Vec<_>>();
            assert_eq!(major, expected);

            let minor = tree.values_minor(&to, false, -1)?;
            let expected = model.range(..to).rev().map(|(_, v)| *v).collect::<Vec<_>>();
            assert_eq!(minor, expected);

            let between = tree.values_between(&from, false, &to, true, -1)?;
            let expected = model
                .range((Bound::Excluded(from), Bound::Included(to)))
                .map(|(_, v)| *v)
                .collect::<Vec<_>>();
            assert_eq!(between, expected);

            let limited = tree.values_major(&from, true, 5)?;
            assert_eq!(limited, vec![300, 303, 306, 309, 312]);

            // a key between stored keys is a valid bound
            let odd = RecordId::new(1, 301);
            let mut seen = Vec::new();
            tree.load_entries_minor(&odd, true, false, |k, _| {
                seen.push(k);
                seen.len() < 3
            })?;
            assert_eq!(
                seen,
                vec![RecordId::new(1, 300), RecordId::new(1, 297), RecordId::new(1, 294)]
            );

            let mut count = 0;
            tree.load_entries_between(&from, true, &to, false, |_, _| {
                count += 1;
                true
            })?;
            assert_eq!(count, 100);

            tree.clear()?;
            assert!(tree.is_empty()?);
            assert_eq!(tree.first_key()?, None);
            tree.release()?;
            Ok(())
        },
        cleanup,
    )
}
