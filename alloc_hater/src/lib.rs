//! A small library for ~~hating on~~ evaluating the correctness of pool
//! allocators.
//!
//! An [`Evaluator`] drives a [`Subject`] through a stream of [`AllocatorOp`]s.
//! Every block it receives is painted with the id of the operation that
//! produced it and verified before it is freed, and the subject's reported
//! usage is checked against the blocks that are live.
#![deny(unsafe_op_in_unsafe_fn)]

use core::{fmt, mem::MaybeUninit, ptr::NonNull, slice};

use arbitrary::{Arbitrary, Unstructured};

/// Limit on generated allocation sizes, expressed in bits.
pub const SIZE_LIMIT_BITS: u8 = 24;

/// A request size which implements `Arbitrary`.
///
/// Sizes are spread evenly across powers of two up to `2^SIZE_LIMIT_BITS`, so
/// small and large requests are both common.
#[derive(Copy, Clone, Debug)]
pub struct ArbSize(pub usize);

impl Arbitrary<'_> for ArbSize {
    fn arbitrary(u: &mut Unstructured<'_>) -> arbitrary::Result<Self> {
        let exp = u8::arbitrary(u)? % (SIZE_LIMIT_BITS + 1);
        let size = usize::arbitrary(u)? % (1_usize << exp);

        Ok(ArbSize(size))
    }
}

#[derive(Arbitrary)]
enum AllocatorOpTag {
    Alloc,
    Dealloc,
    CheckUsed,
}

#[derive(Clone, Debug)]
pub enum AllocatorOp {
    /// Allocate a block of the given size.
    Alloc(usize),
    /// Free an outstanding block.
    ///
    /// Given `n` outstanding blocks, the block to free is at index `i % n`.
    Dealloc(usize),
    /// Compare the subject's reported usage with the live blocks.
    CheckUsed,
}

impl Arbitrary<'_> for AllocatorOp {
    fn arbitrary(u: &mut Unstructured<'_>) -> arbitrary::Result<Self> {
        let tag = AllocatorOpTag::arbitrary(u)?;

        let op = match tag {
            AllocatorOpTag::Alloc => AllocatorOp::Alloc(ArbSize::arbitrary(u)?.0),
            AllocatorOpTag::Dealloc => AllocatorOp::Dealloc(usize::arbitrary(u)?),
            AllocatorOpTag::CheckUsed => AllocatorOp::CheckUsed,
        };

        Ok(op)
    }
}

/// An allocator under evaluation.
pub trait Subject {
    type AllocError: fmt::Debug;

    /// Allocates a block of at least `size` bytes.
    ///
    /// The returned slice covers the usable block, which may be longer than
    /// `size`.
    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, Self::AllocError>;

    /// Deallocates the block that starts at `ptr`.
    ///
    /// `ptr` is always the start of a block returned by `allocate` that has
    /// not been freed since.
    fn deallocate(&mut self, ptr: NonNull<u8>);

    /// Returns the number of bytes the subject considers in use.
    fn used(&self) -> usize;
}

/// A list of allocated blocks.
#[derive(Default)]
pub struct Blocks {
    blocks: Vec<Block>,
}

impl Blocks {
    pub fn new() -> Blocks {
        Blocks { blocks: Vec::new() }
    }

    pub fn push(&mut self, block: Block) {
        self.blocks.push(block);
    }

    pub fn remove_modulo(&mut self, idx: usize) -> Option<Block> {
        let len = self.blocks.len();
        (len != 0).then(|| self.blocks.swap_remove(idx % len))
    }

    /// Returns the total number of bytes requested by the live blocks.
    pub fn requested(&self) -> usize {
        self.blocks.iter().map(|b| b.requested).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter()
    }
}

impl IntoIterator for Blocks {
    type Item = Block;

    type IntoIter = std::vec::IntoIter<Block>;

    fn into_iter(self) -> Self::IntoIter {
        self.blocks.into_iter()
    }
}

/// An allocated block of memory.
pub struct Block {
    // A pointer to the allocated block.
    ptr: NonNull<[u8]>,
    // The size originally requested.
    requested: usize,
    // The unique ID of the last operation that wrote to this block.
    id: u64,
}

unsafe fn slice_ptr_to_uninit_slice_mut<'a>(ptr: NonNull<[u8]>) -> &'a mut [MaybeUninit<u8>] {
    unsafe { slice::from_raw_parts_mut(ptr.cast().as_ptr(), ptr.len()) }
}

fn paint(slice: &mut [MaybeUninit<u8>], id: u64) {
    let id_bytes = id.to_le_bytes().into_iter().cycle();

    for (byte, value) in slice.iter_mut().zip(id_bytes) {
        byte.write(value);
    }
}

impl Block {
    /// Creates a block from `ptr` and paints it according to `id`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `ptr` must be valid for reads and writes for `ptr.len()` bytes.
    /// - No references to the memory at `ptr` may exist when this function is called.
    /// - No accesses to the memory at `ptr` may be made except by way of the
    ///   returned `Block` until said `Block` is dropped.
    pub unsafe fn init(ptr: NonNull<[u8]>, requested: usize, id: u64) -> Block {
        let mut b = Block { ptr, requested, id };
        b.paint(id);
        b
    }

    /// Returns the `Block`'s memory as a mutable slice of uninitialized bytes.
    pub fn as_uninit_slice_mut(&mut self) -> &mut [MaybeUninit<u8>] {
        // SAFETY: self is mutably borrowed, so no other references to the
        // slice can exist
        unsafe { slice_ptr_to_uninit_slice_mut(self.ptr) }
    }

    /// Returns the start of the block.
    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr.cast()
    }

    /// Returns the usable length of the block.
    pub fn len(&self) -> usize {
        self.ptr.len()
    }

    /// Returns whether the block holds at least the requested number of bytes.
    pub fn is_large_enough(&self) -> bool {
        self.ptr.len() >= self.requested
    }

    /// "Paints" the memory contained by `self` with the value of `id`.
    pub fn paint(&mut self, id: u64) {
        self.id = id;
        paint(self.as_uninit_slice_mut(), id);
    }

    /// Verifies that the memory contained by `self` has not been overwritten.
    pub fn verify(&self) -> bool {
        let slice: &[u8] = unsafe { self.ptr.as_ref() };
        let id_bytes = self.id.to_le_bytes().into_iter().cycle();

        slice.iter().zip(id_bytes).all(|(byte, value)| *byte == value)
    }
}

pub struct Evaluator<S: Subject> {
    subject: S,
}

/// Why an evaluation failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Failure {
    /// A block was shorter than the size requested for it.
    TooSmall { requested: usize, len: usize },
    /// A live block's contents changed while it was allocated.
    Overwritten,
    /// The subject reported less usage than the live blocks require.
    UsedTooLow { requested: usize, used: usize },
    /// The subject reported nonzero usage after every block was freed.
    Leaked { used: usize },
}

#[derive(Clone, Debug)]
pub struct Failed {
    pub completed: Vec<AllocatorOp>,
    pub failed_op: Option<AllocatorOp>,
    pub failure: Failure,
}

impl<S: Subject> Evaluator<S> {
    pub fn new(subject: S) -> Evaluator<S> {
        Evaluator { subject }
    }

    pub fn subject(&self) -> &S {
        &self.subject
    }

    pub fn into_subject(self) -> S {
        self.subject
    }

    pub fn evaluate<I>(&mut self, ops: I) -> Result<(), Failed>
    where
        I: IntoIterator<Item = AllocatorOp>,
    {
        let mut completed = Vec::new();
        let mut blocks = Blocks::new();

        for (op_id, op) in ops.into_iter().enumerate() {
            let op_id: u64 = op_id.try_into().unwrap();
            let failure = match op {
                AllocatorOp::Alloc(size) => match self.subject.allocate(size) {
                    Ok(ptr) => {
                        let block = unsafe { Block::init(ptr, size, op_id) };
                        let too_small = (!block.is_large_enough()).then(|| Failure::TooSmall {
                            requested: size,
                            len: block.len(),
                        });
                        blocks.push(block);
                        too_small
                    }
                    Err(_) => None,
                },

                AllocatorOp::Dealloc(raw_idx) => match blocks.remove_modulo(raw_idx) {
                    Some(mut block) if block.verify() => {
                        block.paint(op_id);
                        self.subject.deallocate(block.ptr());
                        None
                    }
                    Some(_) => Some(Failure::Overwritten),
                    None => None,
                },

                AllocatorOp::CheckUsed => {
                    let requested = blocks.requested();
                    let used = self.subject.used();
                    (used < requested).then(|| Failure::UsedTooLow { requested, used })
                }
            };

            if let Some(failure) = failure {
                return Err(Failed {
                    completed,
                    failed_op: Some(op),
                    failure,
                });
            }

            completed.push(op);
        }

        if blocks.iter().any(|b| !b.verify()) {
            return Err(Failed {
                completed,
                failed_op: None,
                failure: Failure::Overwritten,
            });
        }

        for block in blocks {
            self.subject.deallocate(block.ptr());
        }

        match self.subject.used() {
            0 => Ok(()),
            used => Err(Failed {
                completed,
                failed_op: None,
                failure: Failure::Leaked { used },
            }),
        }
    }
}
