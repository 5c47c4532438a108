//! Attribute record traversal.
//!
//! [`walk`] yields every record of an inode's attribute fork in storage
//! order: the records of the primary attribute block, or of each block
//! listed by the indirect table when the inode is flagged indirect. Records
//! are validated as they are visited; any malformed record withdraws the
//! volume and ends the walk with the error.

use crate::layout::EaHeader;
use herd_block::metatype_check;
use herd_error::{HerdError, Result};
use herd_rgrp::{Inode, InodeFlags, Volume};
use herd_types::{BlockNumber, META_HEADER_SIZE, METATYPE_EA, METATYPE_IN, read_le_u64};
use std::collections::VecDeque;
use std::sync::Arc;

/// Where a record lives: its block, byte offset, and the offset of the
/// record before it in the same block (None for the first record).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EaLocation {
    pub block: BlockNumber,
    pub offset: usize,
    pub prev: Option<usize>,
}

/// One visited record.
#[derive(Debug, Clone)]
pub struct EaVisit {
    pub block: BlockNumber,
    pub bytes: Arc<Vec<u8>>,
    pub offset: usize,
    pub prev: Option<usize>,
    pub header: EaHeader,
}

impl EaVisit {
    #[must_use]
    pub fn name(&self) -> &[u8] {
        let start = self.offset + self.header.name_offset();
        &self.bytes[start..start + self.header.name_len as usize]
    }

    #[must_use]
    pub fn stuffed_data(&self) -> &[u8] {
        let start = self.offset + self.header.data_offset();
        &self.bytes[start..start + self.header.data_len as usize]
    }

    /// Nonzero entries of the pointer array, in slot order.
    #[must_use]
    pub fn pointers(&self) -> Vec<BlockNumber> {
        crate::layout::read_pointers(&self.bytes, self.offset, &self.header)
            .into_iter()
            .filter(|ptr| ptr.0 != 0)
            .collect()
    }

    #[must_use]
    pub fn location(&self) -> EaLocation {
        EaLocation {
            block: self.block,
            offset: self.offset,
            prev: self.prev,
        }
    }
}

struct Cursor {
    block: BlockNumber,
    bytes: Arc<Vec<u8>>,
    offset: usize,
    prev: Option<usize>,
}

/// Lazy, restartable-from-start traversal over an attribute fork.
pub struct EaWalk {
    vol: Arc<Volume>,
    queue: VecDeque<BlockNumber>,
    cur: Option<Cursor>,
    failed: bool,
}

/// The attribute blocks of `ip`, in storage order: the primary block, or the
/// blocks listed in the indirect table.
pub fn attribute_blocks(vol: &Volume, ip: &Inode) -> Result<Vec<BlockNumber>> {
    let Some(root) = ip.eattr else {
        return Ok(Vec::new());
    };

    if !ip.flags.contains(InodeFlags::EA_INDIRECT) {
        return Ok(vec![root]);
    }

    let buf = vol.device().read_block(root)?;
    metatype_check(buf.as_slice(), root, METATYPE_IN)
        .map_err(|err| fail(vol, err))?;

    let capacity = vol.geometry().indirect_capacity();
    let mut blocks = Vec::new();
    for slot in 0..capacity {
        let ptr = read_le_u64(buf.as_slice(), META_HEADER_SIZE + slot * 8)
            .map_err(|e| HerdError::Parse(e.to_string()))?;
        if ptr == 0 {
            break;
        }
        blocks.push(BlockNumber(ptr));
    }
    Ok(blocks)
}

/// Begin a traversal of `ip`'s attribute records. An inode with no attribute
/// fork yields an empty walk, not an error.
pub fn walk(vol: &Arc<Volume>, ip: &Inode) -> Result<EaWalk> {
    let queue = attribute_blocks(vol, ip)?.into();
    Ok(EaWalk {
        vol: Arc::clone(vol),
        queue,
        cur: None,
        failed: false,
    })
}

fn fail(vol: &Volume, err: HerdError) -> HerdError {
    if err.is_fatal() {
        vol.withdraw().consistency_error("eattr");
    }
    err
}

impl EaWalk {
    fn corrupt(&self, block: BlockNumber, detail: String) -> HerdError {
        fail(
            &self.vol,
            HerdError::Corrupt {
                block: block.0,
                detail,
            },
        )
    }

    fn load_next_block(&mut self) -> Result<bool> {
        let Some(block) = self.queue.pop_front() else {
            return Ok(false);
        };
        let buf = self.vol.device().read_block(block)?;
        metatype_check(buf.as_slice(), block, METATYPE_EA).map_err(|err| fail(&self.vol, err))?;
        self.cur = Some(Cursor {
            block,
            bytes: Arc::new(buf.into_inner()),
            offset: META_HEADER_SIZE,
            prev: None,
        });
        Ok(true)
    }

    fn step(&mut self) -> Result<Option<EaVisit>> {
        loop {
            if self.cur.is_none() && !self.load_next_block()? {
                return Ok(None);
            }
            let Some(cur) = self.cur.as_mut() else {
                continue;
            };
            let block_size = cur.bytes.len();
            let block = cur.block;
            let offset = cur.offset;

            let header = match EaHeader::parse(&cur.bytes, offset) {
                Ok(header) => header,
                Err(err) => {
                    let detail = format!("unreadable record header at offset {offset}: {err}");
                    return Err(self.corrupt(block, detail));
                }
            };
            let rec_len = header.rec_len as usize;
            if rec_len == 0 {
                return Err(self.corrupt(block, format!("zero-length record at offset {offset}")));
            }
            if offset + rec_len > block_size {
                return Err(self.corrupt(
                    block,
                    format!("record at offset {offset} runs past the block end"),
                ));
            }
            if crate::layout::EaType::from_raw(header.ea_type).is_none() {
                return Err(self.corrupt(
                    block,
                    format!("unrecognized record type {} at offset {offset}", header.ea_type),
                ));
            }
            if header.size() > rec_len {
                return Err(self.corrupt(
                    block,
                    format!(
                        "record at offset {offset} declares {} bytes inside {rec_len}",
                        header.size()
                    ),
                ));
            }

            let visit = EaVisit {
                block,
                bytes: Arc::clone(&cur.bytes),
                offset,
                prev: cur.prev,
                header,
            };

            if header.is_last() {
                if offset + rec_len != block_size {
                    return Err(self.corrupt(
                        block,
                        format!("last record at offset {offset} does not reach the block end"),
                    ));
                }
                self.cur = None;
            } else {
                cur.prev = Some(offset);
                cur.offset = offset + rec_len;
            }

            return Ok(Some(visit));
        }
    }
}

impl Iterator for EaWalk {
    type Item = Result<EaVisit>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.step() {
            Ok(Some(visit)) => Some(Ok(visit)),
            Ok(None) => None,
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

/// Re-anchor a location's `prev` after in-block mutation may have split the
/// preceding record. The record chain must still lead exactly to the
/// located record; anything else means the block changed under us.
pub(crate) fn fixup_prev(bytes: &[u8], loc: &mut EaLocation) -> Result<()> {
    let Some(prev) = loc.prev else {
        return Ok(());
    };
    let header = EaHeader::parse(bytes, prev)?;
    let next = prev + header.rec_len as usize;
    if next == loc.offset {
        return Ok(());
    }
    let stepped = EaHeader::parse(bytes, next)?;
    if next + stepped.rec_len as usize != loc.offset {
        return Err(HerdError::Corrupt {
            block: loc.block.0,
            detail: format!(
                "record chain from offset {prev} does not reach offset {}",
                loc.offset
            ),
        });
    }
    loc.prev = Some(next);
    Ok(())
}
