use bytemuck::{Pod, Zeroable};

use crate::{EmbeddingRow, Key, RowLayout};

pub(crate) const MAGIC: [u8; 8] = *b"EMBSTORE";
pub(crate) const VERSION: u32 = 1;
pub(crate) const HEADER_SIZE: u64 = 64;

/// Files are written in native byte order, this marker rejects files from a foreign host.
const BYTE_ORDER: u32 = 0x0102_0304;

const RECORD_HEADER_SIZE: usize = size_of::<RecordHeader>();
const CRC_SIZE: usize = size_of::<u32>();

/// The fixed part at the start of a store file.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub(crate) struct FileHeader {
    magic: [u8; 8],
    version: u32,
    byte_order: u32,
    dim: u64,
    state_width: u64,
}

impl FileHeader {
    pub fn new(layout: RowLayout) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            byte_order: BYTE_ORDER,
            dim: layout.dim() as u64,
            state_width: layout.state_width() as u64,
        }
    }

    /// Encodes the header padded to `HEADER_SIZE` bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = bytemuck::bytes_of(self).to_vec();
        buf.resize(HEADER_SIZE as usize, 0);
        buf
    }

    /// Decodes and validates a header against the expected layout.
    ///
    /// # Arguments
    /// * `buf` - At least `HEADER_SIZE` bytes read from the start of the file.
    /// * `layout` - The layout the caller expects.
    ///
    /// # Returns
    /// A description of the mismatch if the header isn't valid for `layout`.
    pub fn validate(buf: &[u8], layout: RowLayout) -> Result<(), String> {
        if buf.len() < size_of::<Self>() {
            return Err(format!("header too short: {} bytes", buf.len()));
        }

        let header: Self = bytemuck::pod_read_unaligned(&buf[..size_of::<Self>()]);

        if header.magic != MAGIC {
            return Err("bad magic, not a sparse model store".into());
        }
        if header.byte_order != BYTE_ORDER {
            return Err("store was written with a different byte order".into());
        }
        if header.version != VERSION {
            return Err(format!("unsupported store version {}", header.version));
        }
        if header.dim != layout.dim() as u64 || header.state_width != layout.state_width() as u64 {
            return Err(format!(
                "row layout mismatch: stored dim={} state={}, expected dim={} state={}",
                header.dim,
                header.state_width,
                layout.dim(),
                layout.state_width()
            ));
        }

        Ok(())
    }
}

/// The fixed part at the start of every record copy.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct RecordHeader {
    seq: u64,
    key: u64,
}

/// The outcome of decoding one copy of a slot.
#[derive(Debug, PartialEq)]
pub(crate) enum Decoded {
    /// The copy was never written.
    Empty,
    /// The copy didn't pass validation, either a torn write or a damaged medium.
    Invalid,
    Valid {
        seq: u64,
        key: Key,
        row: EmbeddingRow,
    },
}

/// The size in bytes of one record copy for `layout`.
pub(crate) fn record_size(layout: RowLayout) -> usize {
    RECORD_HEADER_SIZE + layout.width() * size_of::<f32>() + CRC_SIZE
}

/// The size in bytes of one slot, which always holds two record copies.
pub(crate) fn slot_size(layout: RowLayout) -> u64 {
    2 * record_size(layout) as u64
}

/// Serializes one record copy into `buf`.
///
/// # Arguments
/// * `seq` - The store-wide write sequence, must be greater than zero.
/// * `key` - The key of the row.
/// * `row` - The row to encode, it must match the store layout.
/// * `buf` - The output buffer, it's cleared first.
pub(crate) fn encode(seq: u64, key: Key, row: &EmbeddingRow, buf: &mut Vec<u8>) {
    buf.clear();
    buf.extend_from_slice(bytemuck::bytes_of(&RecordHeader { seq, key }));
    buf.extend_from_slice(bytemuck::cast_slice(row.weights()));
    buf.extend_from_slice(bytemuck::cast_slice(row.state()));

    let crc = crc32(buf);
    buf.extend_from_slice(&crc.to_ne_bytes());
}

/// Deserializes one record copy.
///
/// # Arguments
/// * `buf` - Exactly `record_size(layout)` bytes.
/// * `layout` - The store layout.
pub(crate) fn decode(buf: &[u8], layout: RowLayout) -> Decoded {
    let body_len = buf.len() - CRC_SIZE;
    let (body, crc_buf) = buf.split_at(body_len);
    let header: RecordHeader = bytemuck::pod_read_unaligned(&body[..RECORD_HEADER_SIZE]);
    let stored_crc: u32 = bytemuck::pod_read_unaligned(crc_buf);

    if header.seq == 0 {
        if buf.iter().all(|b| *b == 0) {
            return Decoded::Empty;
        }

        return Decoded::Invalid;
    }

    if crc32(body) != stored_crc {
        return Decoded::Invalid;
    }

    let values: Vec<f32> = bytemuck::pod_collect_to_vec(&body[RECORD_HEADER_SIZE..]);
    match EmbeddingRow::from_flat(layout, &values) {
        Some(row) => Decoded::Valid {
            seq: header.seq,
            key: header.key,
            row,
        },
        None => Decoded::Invalid,
    }
}

const CRC_TABLE: [u32; 256] = crc_table();

const fn crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;

    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;

        while bit < 8 {
            crc = match crc & 1 {
                0 => crc >> 1,
                _ => (crc >> 1) ^ 0xEDB8_8320,
            };
            bit += 1;
        }

        table[i] = crc;
        i += 1;
    }

    table
}

/// CRC32 with the reflected IEEE polynomial, the same one zlib uses.
pub(crate) fn crc32(data: &[u8]) -> u32 {
    let crc = data.iter().fold(0xFFFF_FFFF_u32, |crc, byte| {
        CRC_TABLE[((crc ^ *byte as u32) & 0xFF) as usize] ^ (crc >> 8)
    });

    !crc
}
