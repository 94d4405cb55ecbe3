#![no_main]

use acid_pool::ChunkConfig;
use acid_pool_hater::BuddySubject;
use alloc_hater::{AllocatorOp, Evaluator};
use arbitrary::{Arbitrary, Unstructured};
use libfuzzer_sys::fuzz_target;

const MAX_MIN_CHUNK_BITS: u8 = 12;
const MAX_MAX_CHUNK_BITS: u8 = 22;

/// A valid chunk configuration with power-of-two bounds.
#[derive(Clone, Debug)]
struct ArbConfig(ChunkConfig);

impl Arbitrary<'_> for ArbConfig {
    fn arbitrary(un: &mut Unstructured) -> arbitrary::Result<ArbConfig> {
        let min_bits = u8::arbitrary(un)? % (MAX_MIN_CHUNK_BITS + 1);
        let max_bits = min_bits + u8::arbitrary(un)? % (MAX_MAX_CHUNK_BITS - min_bits + 1);

        let config = ChunkConfig::new(1 << min_bits, 1 << max_bits)
            .expect("illegal chunk sizes from ArbConfig");

        Ok(ArbConfig(config))
    }
}

#[derive(Clone, Debug, Arbitrary)]
struct Args {
    config: ArbConfig,
    ops: Vec<AllocatorOp>,
}

fuzz_target!(|args: Args| {
    let mut eval = Evaluator::new(BuddySubject::host(args.config.0));

    if let Err(failed) = eval.evaluate(args.ops) {
        panic!("evaluation failed: {failed:?}");
    }
});
