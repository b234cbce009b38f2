//! Reassembly of multi-datagram ("split") responses.
//!
//! Two strategies share the [SplitAssembler] interface:
//! - [EagerAssembler] writes each fragment straight into a buffer sized for
//!   the worst case, so the payload is ready without a final copy.
//! - [LazyAssembler] keeps fragments as they arrive and concatenates them
//!   (decompressing if needed) only when [buffer](SplitAssembler::buffer) is
//!   called.

use std::borrow::Cow;
use std::io::Read;

use bzip2::read::BzDecoder;

use crate::error::{AssemblerError, PacketDecodeError};

/// Declared size and CRC32 of a compressed group's decompressed payload.
/// Only the first fragment of a compressed group carries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checksum {
    pub decompressed_size: u32,
    pub crc32: u32,
}

/// One datagram of a split response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    id: i32,
    total: u8,
    number: u8,
    max_size: usize,
    compressed: bool,
    checksum: Option<Checksum>,
    payload: Vec<u8>,
}

impl Fragment {
    pub fn new(id: i32, total: u8, number: u8, max_size: usize, payload: Vec<u8>) -> Self {
        Fragment {
            id,
            total,
            number,
            max_size,
            compressed: false,
            checksum: None,
            payload,
        }
    }

    /// Marks the fragment as part of a compressed group.
    pub fn with_compression(mut self, checksum: Option<Checksum>) -> Self {
        self.compressed = true;
        self.checksum = checksum;
        self
    }

    /// Shared by every fragment of one logical response.
    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn total(&self) -> u8 {
        self.total
    }

    pub fn number(&self) -> u8 {
        self.number
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    pub fn checksum(&self) -> Option<Checksum> {
        self.checksum
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Accumulates the fragments of one group at a time.
///
/// Errors are fatal to the open group; call [reset](SplitAssembler::reset)
/// before reusing the assembler.
pub trait SplitAssembler: Send {
    /// Returns `true` iff this fragment completed the group.
    fn add(&mut self, fragment: Fragment) -> Result<bool, AssemblerError>;

    fn is_complete(&self) -> bool;

    /// Returns the number of fragments received so far.
    fn received(&self) -> usize;

    /// Expected number of fragments, 0 before the first one arrives.
    fn count(&self) -> usize;

    /// The assembled payload.
    fn buffer(&mut self) -> Result<Cow<'_, [u8]>, AssemblerError>;

    /// Drops all held data and readies the assembler for a new group.
    fn reset(&mut self);

    /// Copies of the fragments currently held, indexed by fragment number.
    fn dump(&self) -> Vec<Option<Vec<u8>>>;

    fn is_processing(&self) -> bool {
        self.received() > 0 && !self.is_complete()
    }
}

/// Which assembler a protocol binding uses.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum AssemblerKind {
    Eager,
    #[default]
    Lazy,
}

impl AssemblerKind {
    pub fn build(self) -> Box<dyn SplitAssembler> {
        match self {
            AssemblerKind::Eager => Box::new(EagerAssembler::new()),
            AssemblerKind::Lazy => Box::new(LazyAssembler::new()),
        }
    }
}

fn check_range(fragment: &Fragment, count: u8) -> Result<(), AssemblerError> {
    if fragment.number >= count {
        return Err(AssemblerError::FragmentOutOfRange {
            number: fragment.number,
            count,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct Group {
    id: i32,
    count: u8,
}

impl Group {
    fn open(current: Option<Group>, fragment: &Fragment) -> Result<Group, AssemblerError> {
        let group = match current {
            Some(group) if group.id != fragment.id => {
                return Err(AssemblerError::GroupMismatch {
                    expected: group.id,
                    actual: fragment.id,
                })
            }
            Some(group) => group,
            None => Group {
                id: fragment.id,
                count: fragment.total,
            },
        };
        check_range(fragment, group.count)?;
        Ok(group)
    }
}

/// Writes fragments into one pre-sized buffer at `number * max_size`.
///
/// Does not support compressed groups.
#[derive(Debug, Default)]
pub struct EagerAssembler {
    group: Option<Group>,
    max_size: usize,
    buffer: Vec<u8>,
    lengths: Vec<Option<usize>>,
    received: usize,
    end: usize,
}

impl EagerAssembler {
    pub fn new() -> Self {
        EagerAssembler::default()
    }
}

impl SplitAssembler for EagerAssembler {
    fn add(&mut self, fragment: Fragment) -> Result<bool, AssemblerError> {
        if self.is_complete() {
            return Err(AssemblerError::AlreadyComplete);
        }
        if fragment.compressed {
            return Err(AssemblerError::CompressionUnsupported);
        }
        let group = Group::open(self.group, &fragment)?;
        let max_size = if self.group.is_some() {
            self.max_size
        } else {
            fragment.max_size
        };
        let number = fragment.number as usize;
        if self.group.is_some() && self.lengths[number].is_some() {
            return Err(AssemblerError::DuplicateFragment(fragment.number));
        }
        let len = fragment.payload.len();
        if len > max_size {
            return Err(AssemblerError::OversizedFragment {
                number: fragment.number,
                len,
                max: max_size,
            });
        }

        if self.group.is_none() {
            self.group = Some(group);
            self.max_size = max_size;
            self.buffer = vec![0; max_size * group.count as usize];
            self.lengths = vec![None; group.count as usize];
        }

        let offset = number * max_size;
        self.buffer[offset..offset + len].copy_from_slice(&fragment.payload);
        self.lengths[number] = Some(len);
        self.received += 1;
        self.end = self.end.max(offset + len);
        Ok(self.is_complete())
    }

    fn is_complete(&self) -> bool {
        self.group
            .is_some_and(|group| self.received == group.count as usize)
    }

    fn received(&self) -> usize {
        self.received
    }

    fn count(&self) -> usize {
        self.group.map_or(0, |group| group.count as usize)
    }

    /// The live buffer, up to the furthest byte written. Only meaningful once
    /// the group is complete.
    fn buffer(&mut self) -> Result<Cow<'_, [u8]>, AssemblerError> {
        if self.group.is_none() {
            return Err(AssemblerError::NotStarted);
        }
        Ok(Cow::Borrowed(&self.buffer[..self.end]))
    }

    fn reset(&mut self) {
        *self = EagerAssembler::default();
    }

    fn dump(&self) -> Vec<Option<Vec<u8>>> {
        self.lengths
            .iter()
            .enumerate()
            .map(|(number, len)| {
                len.map(|len| {
                    let offset = number * self.max_size;
                    self.buffer[offset..offset + len].to_vec()
                })
            })
            .collect()
    }
}

/// Holds fragments individually and joins them on demand.
///
/// [buffer](SplitAssembler::buffer) may be called once per group; it releases
/// each fragment as it is appended and decompresses compressed groups.
#[derive(Debug, Default)]
pub struct LazyAssembler {
    group: Option<Group>,
    fragments: Vec<Option<Fragment>>,
    received: usize,
    consumed: bool,
}

impl LazyAssembler {
    pub fn new() -> Self {
        LazyAssembler::default()
    }

    fn missing(&self) -> Vec<u8> {
        (0..self.count() as u8)
            .filter(|&n| self.fragments.get(n as usize).map_or(true, Option::is_none))
            .collect()
    }
}

impl SplitAssembler for LazyAssembler {
    fn add(&mut self, fragment: Fragment) -> Result<bool, AssemblerError> {
        if self.consumed || self.is_complete() {
            return Err(AssemblerError::AlreadyComplete);
        }
        let group = Group::open(self.group, &fragment)?;
        let number = fragment.number as usize;
        if self.group.is_some() && self.fragments[number].is_some() {
            return Err(AssemblerError::DuplicateFragment(fragment.number));
        }

        if self.group.is_none() {
            self.group = Some(group);
            self.fragments = vec![None; group.count as usize];
        }
        self.fragments[number] = Some(fragment);
        self.received += 1;
        Ok(self.is_complete())
    }

    fn is_complete(&self) -> bool {
        self.group
            .is_some_and(|group| self.received == group.count as usize)
    }

    fn received(&self) -> usize {
        self.received
    }

    fn count(&self) -> usize {
        self.group.map_or(0, |group| group.count as usize)
    }

    fn buffer(&mut self) -> Result<Cow<'_, [u8]>, AssemblerError> {
        if self.group.is_none() {
            return Err(AssemblerError::NotStarted);
        }
        if self.consumed {
            return Err(AssemblerError::Consumed);
        }
        if !self.is_complete() {
            return Err(AssemblerError::Incomplete {
                missing: self.missing(),
            });
        }

        let (compressed, checksum) = match self.fragments.first() {
            Some(Some(first)) => (first.compressed, first.checksum),
            _ => (false, None),
        };
        let size = self.fragments.iter().flatten().map(|f| f.payload.len()).sum();
        let mut joined = Vec::with_capacity(size);
        for slot in self.fragments.iter_mut() {
            if let Some(fragment) = slot.take() {
                joined.extend_from_slice(&fragment.payload);
            }
        }
        self.consumed = true;

        if compressed {
            let checksum = checksum.ok_or(PacketDecodeError::MissingChecksum)?;
            joined = decompress(&joined, checksum)?;
        }
        Ok(Cow::Owned(joined))
    }

    fn reset(&mut self) {
        *self = LazyAssembler::default();
    }

    fn dump(&self) -> Vec<Option<Vec<u8>>> {
        self.fragments
            .iter()
            .map(|slot| slot.as_ref().map(|f| f.payload.clone()))
            .collect()
    }
}

fn decompress(data: &[u8], checksum: Checksum) -> Result<Vec<u8>, PacketDecodeError> {
    // one byte past the declared size is enough to prove a mismatch
    let limit = u64::from(checksum.decompressed_size) + 1;
    let mut out = Vec::new();
    BzDecoder::new(data)
        .take(limit)
        .read_to_end(&mut out)
        .map_err(PacketDecodeError::Decompress)?;

    if out.len() != checksum.decompressed_size as usize {
        return Err(PacketDecodeError::SizeMismatch {
            expected: checksum.decompressed_size,
            actual: out.len(),
        });
    }
    let actual = crc32fast::hash(&out);
    if actual != checksum.crc32 {
        return Err(PacketDecodeError::ChecksumMismatch {
            expected: checksum.crc32,
            actual,
        });
    }
    Ok(out)
}
