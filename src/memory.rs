use std::collections::BTreeMap;

use ihex::{Reader, Record};

use crate::chips::MemoryKind;
use crate::error::{HvppError, HvppResult, ValidationError};

const HEX_BYTES_PER_RECORD: usize = 16;
const ERASED: u8 = 0xFF;

/// Sparse memory contents keyed by byte address
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryImage {
    bytes: BTreeMap<u32, u8>,
}

/// Contiguous run of bytes inside one page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSegment {
    pub page: u16,
    pub offset: usize,
    pub data: Vec<u8>,
}

impl MemoryImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes that would land past the end of the 32-bit address space are dropped
    pub fn from_bytes(start: u32, data: &[u8]) -> Self {
        let mut image = Self::new();
        for (address, value) in (start..=u32::MAX).zip(data) {
            image.insert(address, *value);
        }
        image
    }

    /// Parse Intel HEX text. Data, extended segment and extended linear
    /// address records are honoured; start address records are ignored.
    pub fn from_intel_hex(hex_content: &str) -> HvppResult<Self> {
        let mut image = Self::new();
        let mut base: u32 = 0;

        for record in Reader::new(hex_content) {
            let record = record.map_err(|e| {
                HvppError::FirmwareError(format!("Failed parsing record in hex file {:?}", e))
            })?;
            match record {
                Record::Data { offset, value } => {
                    let start = base + offset as u32;
                    let last = value.len().saturating_sub(1) as u32;
                    if start.checked_add(last).is_none() {
                        return Err(HvppError::FirmwareError(format!(
                            "Hex record at {:#010x} runs past the end of the address space",
                            start
                        )));
                    }
                    for (address, byte) in (start..=u32::MAX).zip(value) {
                        image.insert(address, byte);
                    }
                }
                Record::ExtendedSegmentAddress(segment) => base = (segment as u32) << 4,
                Record::ExtendedLinearAddress(upper) => base = (upper as u32) << 16,
                Record::EndOfFile => break,
                _ => {}
            }
        }

        Ok(image)
    }

    pub fn insert(&mut self, address: u32, value: u8) {
        self.bytes.insert(address, value);
    }

    pub fn get(&self, address: u32) -> Option<u8> {
        self.bytes.get(&address).copied()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Reject images that reach past the end of the target memory
    pub fn check_fits(&self, memory: MemoryKind, size: u32) -> Result<(), ValidationError> {
        match self.bytes.range(size..).next() {
            Some((address, _)) => Err(ValidationError::ImageOutOfRange {
                memory: memory.name(),
                address: *address,
                size,
            }),
            None => Ok(()),
        }
    }

    /// Split the image into per-page runs. Runs are widened to multiples of
    /// `align` bytes, padding with erased bytes.
    pub fn page_segments(&self, page_bytes: usize, align: usize) -> Vec<PageSegment> {
        let mut aligned: BTreeMap<u32, u8> = BTreeMap::new();
        for (address, value) in &self.bytes {
            let word = address - address % align as u32;
            for filler in word..word + align as u32 {
                aligned.entry(filler).or_insert(ERASED);
            }
            aligned.insert(*address, *value);
        }

        let mut segments: Vec<PageSegment> = Vec::new();
        let mut previous: Option<u32> = None;
        for (address, value) in aligned {
            let page = (address as usize / page_bytes) as u16;
            let offset = address as usize % page_bytes;

            let continues = previous.is_some_and(|prev| prev + 1 == address);
            match segments.last_mut() {
                Some(segment) if continues && segment.page == page => segment.data.push(value),
                _ => segments.push(PageSegment {
                    page,
                    offset,
                    data: vec![value],
                }),
            }
            previous = Some(address);
        }

        segments
    }
}

/// Render a contiguous dump starting at address 0 as Intel HEX
pub fn to_intel_hex(data: &[u8]) -> HvppResult<String> {
    let mut records = Vec::new();
    let mut upper: u32 = 0;

    for (index, chunk) in data.chunks(HEX_BYTES_PER_RECORD).enumerate() {
        let address = (index * HEX_BYTES_PER_RECORD) as u32;
        if address >> 16 != upper {
            upper = address >> 16;
            records.push(Record::ExtendedLinearAddress(upper as u16));
        }
        records.push(Record::Data {
            offset: (address & 0xFFFF) as u16,
            value: chunk.to_vec(),
        });
    }
    records.push(Record::EndOfFile);

    ihex::create_object_file_representation(&records)
        .map_err(|e| HvppError::FirmwareError(format!("Failed to write hex file: {:?}", e)))
}
