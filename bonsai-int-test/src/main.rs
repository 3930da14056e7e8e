use bonsai::common::{RecordId, RecordRef};
use bonsai::errors::BonsaiResult;
use bonsai::ridbag::RidBag;
use bonsai::store::{AtomicOperation, SerializationContext};
use bonsai_int_test::test_util::{cleanup, create_test_context};

fn main() -> BonsaiResult<()> {
    println!("Starting stress test...");
    let ctx = create_test_context()?;

    let count = 1_000_000;
    let mut bag = ctx.new_bag();

    let start = std::time::Instant::now();
    for position in 0..count {
        bag.add(&RecordRef::new(RecordId::new(1, position)))?;
    }
    let operation = AtomicOperation::new();
    let header = bag.serialize(&SerializationContext::new(operation.clone()))?;
    operation.commit(&ctx.bags())?;
    println!("Committed {} links in {:?}", count, start.elapsed());

    let file_id = bag.collection_pointer().map(|p| p.file_id()).unwrap_or_default();
    let mut loaded = RidBag::deserialize(&header, file_id, ctx.bags(), ctx.resolver())?;

    let start = std::time::Instant::now();
    let mut iterated = 0;
    for record in loaded.raw_iter() {
        record?;
        iterated += 1;
    }
    println!("Iterated {} links in {:?}", iterated, start.elapsed());

    let start = std::time::Instant::now();
    for position in (0..count).step_by(2) {
        loaded.remove(&RecordRef::new(RecordId::new(1, position)))?;
    }
    let operation = AtomicOperation::new();
    loaded.serialize(&SerializationContext::new(operation.clone()))?;
    operation.commit(&ctx.bags())?;
    println!("Removed half of the links in {:?}, {} left", start.elapsed(), loaded.size()?);

    cleanup(ctx)
}
