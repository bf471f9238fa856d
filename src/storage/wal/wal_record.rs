//! WAL record types and their byte-exact serialization.
//!
//! Records are hand-packed little-endian; they are never stored in memory
//! long-term, only streamed into and out of WAL header pages.

use crate::common::types::PageIdx;
use crate::error::{DbError, Result};

/// Which persistent structure a database file belongs to. Serialized as one
/// tag byte followed by the structure's identifier fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StructureId {
    /// A node/rel property column of a table.
    Column { table_id: u64, property_id: u32 },
    /// A list (adjacency/property lists) file of a table.
    Lists { table_id: u64, property_id: u32 },
    /// The hash index of a table.
    Index { table_id: u64 },
}

const STRUCTURE_COLUMN: u8 = 0;
const STRUCTURE_LISTS: u8 = 1;
const STRUCTURE_INDEX: u8 = 2;

/// Identifies one database file in WAL records: the owning structure plus a
/// flag for that structure's overflow file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DbFileId {
    pub structure: StructureId,
    pub is_overflow: bool,
}

impl DbFileId {
    pub fn column(table_id: u64, property_id: u32) -> Self {
        Self {
            structure: StructureId::Column {
                table_id,
                property_id,
            },
            is_overflow: false,
        }
    }

    pub fn lists(table_id: u64, property_id: u32) -> Self {
        Self {
            structure: StructureId::Lists {
                table_id,
                property_id,
            },
            is_overflow: false,
        }
    }

    pub fn index(table_id: u64) -> Self {
        Self {
            structure: StructureId::Index { table_id },
            is_overflow: false,
        }
    }

    /// The overflow-file variant of this file id.
    pub fn overflow(mut self) -> Self {
        self.is_overflow = true;
        self
    }

    pub fn num_bytes(&self) -> usize {
        2 + match self.structure {
            StructureId::Column { .. } | StructureId::Lists { .. } => 12,
            StructureId::Index { .. } => 8,
        }
    }

    pub fn write_to(&self, buf: &mut [u8], offset: &mut usize) {
        let (tag, table_id, property_id) = match self.structure {
            StructureId::Column {
                table_id,
                property_id,
            } => (STRUCTURE_COLUMN, table_id, Some(property_id)),
            StructureId::Lists {
                table_id,
                property_id,
            } => (STRUCTURE_LISTS, table_id, Some(property_id)),
            StructureId::Index { table_id } => (STRUCTURE_INDEX, table_id, None),
        };
        buf[*offset] = tag;
        buf[*offset + 1] = self.is_overflow as u8;
        *offset += 2;
        buf[*offset..*offset + 8].copy_from_slice(&table_id.to_le_bytes());
        *offset += 8;
        if let Some(property_id) = property_id {
            buf[*offset..*offset + 4].copy_from_slice(&property_id.to_le_bytes());
            *offset += 4;
        }
    }

    pub fn read_from(buf: &[u8], offset: &mut usize) -> Result<Self> {
        if buf.len() < *offset + 10 {
            return Err(DbError::CorruptWal("truncated file id".to_string()));
        }
        let tag = buf[*offset];
        let is_overflow = match buf[*offset + 1] {
            0 => false,
            1 => true,
            other => {
                return Err(DbError::CorruptWal(format!(
                    "invalid overflow flag {other} in file id"
                )))
            }
        };
        *offset += 2;
        let table_id = u64::from_le_bytes(buf[*offset..*offset + 8].try_into().unwrap());
        *offset += 8;
        let structure = match tag {
            STRUCTURE_COLUMN | STRUCTURE_LISTS => {
                if buf.len() < *offset + 4 {
                    return Err(DbError::CorruptWal("truncated file id".to_string()));
                }
                let property_id = u32::from_le_bytes(buf[*offset..*offset + 4].try_into().unwrap());
                *offset += 4;
                if tag == STRUCTURE_COLUMN {
                    StructureId::Column {
                        table_id,
                        property_id,
                    }
                } else {
                    StructureId::Lists {
                        table_id,
                        property_id,
                    }
                }
            }
            STRUCTURE_INDEX => StructureId::Index { table_id },
            other => {
                return Err(DbError::CorruptWal(format!(
                    "unrecognized structure tag {other} in file id"
                )))
            }
        };
        Ok(Self {
            structure,
            is_overflow,
        })
    }
}

const RECORD_PAGE_SHADOW: u8 = 0;
const RECORD_PAGE_INSERT: u8 = 1;
const RECORD_OVERFLOW_NEXT_BYTE_POS: u8 = 2;
const RECORD_COMMIT: u8 = 3;

/// One WAL record. `PageShadow` and `PageInsert` bind a base-file page to
/// the WAL page holding its new contents; `OverflowNextBytePos` checkpoints
/// an overflow file's append cursor at the start of a transaction; `Commit`
/// marks the transaction durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalRecord {
    PageShadow {
        db_file_id: DbFileId,
        original_page_idx: PageIdx,
        page_idx_in_wal: PageIdx,
    },
    PageInsert {
        db_file_id: DbFileId,
        original_page_idx: PageIdx,
        page_idx_in_wal: PageIdx,
    },
    OverflowNextBytePos {
        db_file_id: DbFileId,
        pos: u64,
    },
    Commit {
        transaction_id: u64,
    },
}

impl WalRecord {
    pub fn num_bytes(&self) -> usize {
        1 + match self {
            WalRecord::PageShadow { db_file_id, .. } | WalRecord::PageInsert { db_file_id, .. } => {
                db_file_id.num_bytes() + 8
            }
            WalRecord::OverflowNextBytePos { db_file_id, .. } => db_file_id.num_bytes() + 8,
            WalRecord::Commit { .. } => 8,
        }
    }

    pub fn write_to(&self, buf: &mut [u8], offset: &mut usize) {
        match self {
            WalRecord::PageShadow {
                db_file_id,
                original_page_idx,
                page_idx_in_wal,
            }
            | WalRecord::PageInsert {
                db_file_id,
                original_page_idx,
                page_idx_in_wal,
            } => {
                buf[*offset] = if matches!(self, WalRecord::PageShadow { .. }) {
                    RECORD_PAGE_SHADOW
                } else {
                    RECORD_PAGE_INSERT
                };
                *offset += 1;
                db_file_id.write_to(buf, offset);
                buf[*offset..*offset + 4].copy_from_slice(&original_page_idx.to_le_bytes());
                buf[*offset + 4..*offset + 8].copy_from_slice(&page_idx_in_wal.to_le_bytes());
                *offset += 8;
            }
            WalRecord::OverflowNextBytePos { db_file_id, pos } => {
                buf[*offset] = RECORD_OVERFLOW_NEXT_BYTE_POS;
                *offset += 1;
                db_file_id.write_to(buf, offset);
                buf[*offset..*offset + 8].copy_from_slice(&pos.to_le_bytes());
                *offset += 8;
            }
            WalRecord::Commit { transaction_id } => {
                buf[*offset] = RECORD_COMMIT;
                *offset += 1;
                buf[*offset..*offset + 8].copy_from_slice(&transaction_id.to_le_bytes());
                *offset += 8;
            }
        }
    }

    pub fn read_from(buf: &[u8], offset: &mut usize) -> Result<Self> {
        if *offset >= buf.len() {
            return Err(DbError::CorruptWal("truncated record".to_string()));
        }
        let tag = buf[*offset];
        *offset += 1;
        let read_u64 = |buf: &[u8], offset: &mut usize| -> Result<u64> {
            if buf.len() < *offset + 8 {
                return Err(DbError::CorruptWal("truncated record".to_string()));
            }
            let v = u64::from_le_bytes(buf[*offset..*offset + 8].try_into().unwrap());
            *offset += 8;
            Ok(v)
        };
        match tag {
            RECORD_PAGE_SHADOW | RECORD_PAGE_INSERT => {
                let db_file_id = DbFileId::read_from(buf, offset)?;
                let pages = read_u64(buf, offset)?;
                let original_page_idx = (pages & 0xffff_ffff) as PageIdx;
                let page_idx_in_wal = (pages >> 32) as PageIdx;
                Ok(if tag == RECORD_PAGE_SHADOW {
                    WalRecord::PageShadow {
                        db_file_id,
                        original_page_idx,
                        page_idx_in_wal,
                    }
                } else {
                    WalRecord::PageInsert {
                        db_file_id,
                        original_page_idx,
                        page_idx_in_wal,
                    }
                })
            }
            RECORD_OVERFLOW_NEXT_BYTE_POS => {
                let db_file_id = DbFileId::read_from(buf, offset)?;
                let pos = read_u64(buf, offset)?;
                Ok(WalRecord::OverflowNextBytePos { db_file_id, pos })
            }
            RECORD_COMMIT => Ok(WalRecord::Commit {
                transaction_id: read_u64(buf, offset)?,
            }),
            other => Err(DbError::CorruptWal(format!(
                "unrecognized record tag {other}"
            ))),
        }
    }
}
