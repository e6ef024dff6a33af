//! Core identifier types shared by every basalt layer.
//!
//! The engine addresses two kinds of things with one 64-bit handle type:
//! whole pages (the handle is the page number) and data items (the handle
//! packs a page number and an intra-page offset). Transaction ids are a
//! separate 64-bit space with id 0 reserved for the super transaction.

pub mod codec;

use std::fmt;

/// Fixed page size in bytes. Every page of the database file is exactly
/// this long and pages are addressed by 1-based number.
pub const PAGE_SIZE: usize = 8192;

// ---------------------------------------------------------------------------
// Page numbers
// ---------------------------------------------------------------------------

/// A 1-based page number in the database file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageNo(u32);

impl PageNo {
    /// Encoded width on disk.
    pub const LEN: usize = 4;

    /// The validity-check page reserved by the pager.
    pub const ONE: Self = Self(1);

    #[must_use]
    pub const fn new(no: u32) -> Self {
        Self(no)
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Byte offset of this page within the database file.
    #[must_use]
    pub const fn file_offset(self) -> u64 {
        (self.0 as u64 - 1) * PAGE_SIZE as u64
    }
}

impl fmt::Display for PageNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An intra-page byte offset. Page payloads are well under 64 KiB so a
/// `u16` always suffices.
pub type Offset = u16;

// ---------------------------------------------------------------------------
// Record handles
// ---------------------------------------------------------------------------

/// A 64-bit record handle.
///
/// For data items the high 32 bits are the page number and the low 16 bits
/// are the offset of the item within that page; the middle 16 bits are
/// always zero. For pages the handle is the page number itself. The two
/// extremes of the value space are reserved as sentinels: [`Uuid::NIL`]
/// and [`Uuid::INF`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uuid(u64);

impl Uuid {
    /// Encoded width on disk.
    pub const LEN: usize = 8;

    /// The null handle.
    pub const NIL: Self = Self(0);

    /// Positive infinity; used as the terminal key of internal B+tree
    /// nodes.
    pub const INF: Self = Self(u64::MAX);

    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Compose a data-item handle from its page number and offset.
    #[must_use]
    pub const fn from_parts(page_no: PageNo, offset: Offset) -> Self {
        Self(((page_no.get() as u64) << 32) | offset as u64)
    }

    /// Handle addressing a whole page.
    #[must_use]
    pub const fn from_page(page_no: PageNo) -> Self {
        Self(page_no.get() as u64)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_nil(self) -> bool {
        self.0 == Self::NIL.0
    }

    /// Page number of a data-item handle.
    #[must_use]
    pub const fn page_no(self) -> PageNo {
        PageNo::new((self.0 >> 32) as u32)
    }

    /// Intra-page offset of a data-item handle.
    #[must_use]
    pub const fn offset(self) -> Offset {
        (self.0 & 0xFFFF) as Offset
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Transaction ids
// ---------------------------------------------------------------------------

/// A 64-bit transaction id.
///
/// Id 0 is the **super transaction**: it is implicitly committed, never
/// active, belongs to no snapshot, and is used for structural writes
/// (B+tree nodes, boot pointers) that must bypass MVCC visibility.
/// User transactions are minted by the xid store starting at 1. Code that
/// special-cases the reserved id should go through [`TxnId::is_super`]
/// rather than comparing against a literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxnId(u64);

impl TxnId {
    /// Encoded width on disk.
    pub const LEN: usize = 8;

    /// The reserved always-committed super transaction.
    pub const SUPER: Self = Self(0);

    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_super(self) -> bool {
        self.0 == Self::SUPER.0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
