#![no_main]

use acid_pool::ChunkConfig;
use acid_pool_hater::BuddySubject;
use alloc_hater::{AllocatorOp, Evaluator};
use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

/// Device capacity is kept small so that refills regularly fail and the retry
/// path is exercised.
const MAX_CAPACITY: usize = 1 << 22;

#[derive(Clone, Debug, Arbitrary)]
struct Args {
    capacity: usize,
    retry_floor: Option<u8>,
    ops: Vec<AllocatorOp>,
}

fuzz_target!(|args: Args| {
    let capacity = args.capacity % MAX_CAPACITY;
    let mut config = ChunkConfig::device(capacity);

    if let Some(bits) = args.retry_floor {
        let floor = 1_usize << (bits % usize::BITS as u8);
        config = match config.with_retry_floor(floor) {
            Ok(c) => c,
            Err(_) => return,
        };
    }

    let mut eval = Evaluator::new(BuddySubject::device(capacity, config));

    if let Err(failed) = eval.evaluate(args.ops) {
        panic!("evaluation failed: {failed:?}");
    }
});
