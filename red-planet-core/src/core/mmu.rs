use std::collections::HashMap;

use super::Core;
use crate::system_bus::{AccessType, SystemBus};
use crate::{Alignment, Allocator, Endianness, PrivilegeLevel, Xlen};
use bitvec::field::BitField;
use bitvec::order::Lsb0;
use bitvec::view::BitView;
use log::{debug, trace};
use thiserror::Error;

macro_rules! access_fns {
    ( $( $read_fn:ident, $read_debug_fn:ident, $write_fn:ident => $u:ident ),* $(,)? ) => {
        $(
            /// Invoke a read for the specified address.
            pub fn $read_fn(&self, allocator: &mut A, address: u32) -> Result<$u, MemoryError> {
                trace!("Reading {} from memory at vaddr {address:#010x}", stringify!($u));
                let privilege_level = self.core.effective_privilege_mode(allocator);
                let mut buf = [0u8; std::mem::size_of::<$u>()];
                self.read(&mut buf, allocator, address, privilege_level, false)?;
                Ok(match self.core.endianness(allocator, privilege_level) {
                    Endianness::LE => $u::from_le_bytes(buf),
                    Endianness::BE => $u::from_be_bytes(buf),
                })
            }

            /// Perform a debug read for the specified address.
            ///
            /// See [`Bus::read_debug`](crate::bus::Bus::read_debug) for the difference between this
            /// method and its non-debug counterpart.
            pub fn $read_debug_fn(&self, allocator: &A, address: u32) -> Result<$u, MemoryError> {
                trace!("Debug reading {} from memory at vaddr {address:#010x}", stringify!($u));
                let privilege_level = self.core.effective_privilege_mode(allocator);
                let mut buf = [0u8; std::mem::size_of::<$u>()];
                self.read_debug(&mut buf, allocator, address, privilege_level, false)?;
                Ok(match self.core.endianness(allocator, privilege_level) {
                    Endianness::LE => $u::from_le_bytes(buf),
                    Endianness::BE => $u::from_be_bytes(buf),
                })
            }

            /// Invoke a write for the specified address.
            pub fn $write_fn(
                &self,
                allocator: &mut A,
                address: u32,
                value: $u,
            ) -> Result<(), MemoryError> {
                trace!(value; "Writing {} to memory at vaddr {address:#010x}", stringify!($u));
                let privilege_level = self.core.effective_privilege_mode(allocator);
                let buf = match self.core.endianness(allocator, privilege_level) {
                    Endianness::LE => value.to_le_bytes(),
                    Endianness::BE => value.to_be_bytes(),
                };
                self.write(allocator, address, &buf, privilege_level)
            }
        )*
    };
}

// log2(Size of a single page (in bytes)). Identical across Sv32/Sv39/Sv48.
const PAGE_SIZE_SHF: u32 = 12;

/// `satp.MODE` encoding.
///
/// The real privileged spec gives `MODE` a 1-bit encoding on RV32 (`satp[31]`) and a 4-bit
/// encoding on RV64 (`satp[63:60]`), with `satp` itself being MXLEN bits wide. The CSR read/write
/// path in this core is fixed at 32 bits end to end (see [`Core::read_csr`](super::Core::read_csr)),
/// so rather than widen every CSR accessor to carry a 64-bit value for this one register, `satp`
/// is packed here into a model-internal 32-bit layout: `MODE` at bits `[31:30]`, `ASID` at
/// `[29:20]`, `PPN` at `[19:0]`. `PPN` is 20 bits because physical addresses in this model are
/// always 32 bits, so that is all a root page table address can ever need.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SatpMode {
    Bare,
    Sv32,
    Sv39,
    Sv48,
}

impl SatpMode {
    fn from_bits(bits: u32) -> Self {
        match bits {
            0 => Self::Bare,
            1 => Self::Sv32,
            2 => Self::Sv39,
            _ => Self::Sv48,
        }
    }

    fn to_bits(self) -> u32 {
        match self {
            Self::Bare => 0,
            Self::Sv32 => 1,
            Self::Sv39 => 2,
            Self::Sv48 => 3,
        }
    }

    /// Whether this mode can be selected given the hart's configured base ISA width. Sv32 is
    /// only defined for RV32, Sv39/Sv48 only for RV64 (`Bare` is always legal).
    fn supported_for(self, xlen: Xlen) -> bool {
        match (self, xlen) {
            (Self::Bare, _) => true,
            (Self::Sv32, Xlen::Rv32) => true,
            (Self::Sv39 | Self::Sv48, Xlen::Rv64) => true,
            _ => false,
        }
    }

    fn layout(self) -> Option<PagingLayout> {
        match self {
            Self::Bare => None,
            Self::Sv32 => Some(PagingLayout {
                levels: 2,
                vpn_bits: 10,
                pte_size_shf: 2,
            }),
            Self::Sv39 => Some(PagingLayout {
                levels: 3,
                vpn_bits: 9,
                pte_size_shf: 3,
            }),
            Self::Sv48 => Some(PagingLayout {
                levels: 4,
                vpn_bits: 9,
                pte_size_shf: 3,
            }),
        }
    }
}

/// Per-mode shape of the page table: number of levels, bits of VPN consumed per level, and the
/// size of a single PTE. Sv32 uses 4-byte PTEs and 2 levels of 10 VPN bits each (covering a
/// 32-bit virtual address space); Sv39/Sv48 use 8-byte PTEs and 3/4 levels of 9 VPN bits each.
#[derive(Debug, Clone, Copy)]
struct PagingLayout {
    levels: u32,
    vpn_bits: u32,
    pte_size_shf: u32,
}

/// `satp`: holds the currently active address-translation mode, address space ID, and root page
/// table physical page number. See [`SatpMode`] for the bit layout used by this model.
#[derive(Debug, Clone)]
pub struct Satp {
    mode: SatpMode,
    asid: u32,
    ppn: u32,
}

impl Default for Satp {
    fn default() -> Self {
        Self::new()
    }
}

impl Satp {
    const ASID_BITS: u32 = 10;
    const PPN_BITS: u32 = 20;

    pub fn new() -> Self {
        Self {
            mode: SatpMode::Bare,
            asid: 0,
            ppn: 0,
        }
    }

    pub fn mode(&self) -> SatpMode {
        self.mode
    }

    pub fn asid(&self) -> u32 {
        self.asid
    }

    pub fn ppn(&self) -> u32 {
        self.ppn
    }

    pub fn read(&self) -> u32 {
        (self.mode.to_bits() << 30) | (self.asid << 20) | self.ppn
    }

    /// Writes the masked bits of `value`, subject to the WARL rule that a `MODE` unsupported for
    /// `xlen` causes the *entire* write to be dropped, leaving `satp` unchanged.
    ///
    /// > Attempting to write an unsupported MODE value to satp is not guaranteed to have any
    /// > effect ... the resulting setting of MODE is UNSPECIFIED, and the remainder of the satp
    /// > write is also UNSPECIFIED.
    ///
    /// This implementation treats an unsupported MODE as leaving the whole register unchanged.
    pub fn write(&mut self, value: u32, mask: u32, xlen: Xlen) {
        let merged = (self.read() & !mask) | (value & mask);
        let mode = SatpMode::from_bits(merged >> 30);
        if !mode.supported_for(xlen) {
            return;
        }
        self.mode = mode;
        self.asid = (merged >> 20) & ((1 << Self::ASID_BITS) - 1);
        self.ppn = merged & ((1 << Self::PPN_BITS) - 1);
    }
}

/// A single cached virtual-to-physical translation, keyed on `(asid, vpn)` by [`Tlb`].
///
/// `writable_clean` distinguishes an entry whose backing PTE already has its dirty bit set from
/// one installed only for a read/execute: a later store through an entry that isn't known to be
/// dirty must still miss so the page-table walk can set the dirty bit, per the RISC-V rules for
/// when `A`/`D` get set.
#[derive(Debug, Clone, Copy)]
struct TlbEntry {
    ppn: u32,
    r: bool,
    w: bool,
    x: bool,
    u: bool,
    writable_clean: bool,
}

/// Cache of address translations, keyed by address space ID and virtual page number, avoiding a
/// full page-table walk for repeated accesses to the same page.
///
/// Entries are tagged by ASID so switching address spaces via `satp` does not by itself require a
/// flush, though [`Core`]'s `satp`-write path still flushes the whole TLB unconditionally: an
/// implementation is always permitted to do so, and it avoids tracking which ASIDs are still
/// resident in the cache.
#[derive(Debug, Clone, Default)]
pub struct Tlb {
    entries: HashMap<(u32, u32), TlbEntry>,
}

impl Tlb {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, asid: u32, vpn: u32) -> Option<TlbEntry> {
        self.entries.get(&(asid, vpn)).copied()
    }

    fn insert(&mut self, asid: u32, vpn: u32, entry: TlbEntry) {
        self.entries.insert((asid, vpn), entry);
    }

    /// Implements `SFENCE.VMA`'s invalidation semantics: `None` for either argument means "every
    /// value", matching `rs1`/`rs2` both being `x0` to mean "all addresses"/"all address spaces".
    pub fn invalidate(&mut self, vaddr: Option<u32>, asid: Option<u32>) {
        match (vaddr, asid) {
            (None, None) => self.entries.clear(),
            (None, Some(asid)) => self.entries.retain(|&(a, _), _| a != asid),
            (Some(vaddr), None) => {
                let vpn = vaddr >> PAGE_SIZE_SHF;
                self.entries.retain(|&(_, v), _| v != vpn);
            }
            (Some(vaddr), Some(asid)) => {
                let vpn = vaddr >> PAGE_SIZE_SHF;
                self.entries.remove(&(asid, vpn));
            }
        }
    }

    pub fn invalidate_all(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Access wrapper around a raw bus to address it as memory from this core's point of view.
///
/// This is a continuous, circular, byte-addressable address space of `pow(2, 32)` bytes.
/// It is designed as a mapping of address ranges to (hardware) resources.
///
/// This takes into account the core's current privilege level, its memory mapping (i.e. which
/// regions can be accessed), its configuration (e.g. whether misaligned memory accesses are
/// supported), etc.
#[derive(Debug, Clone)]
pub struct Mmu<'c, A: Allocator, B: SystemBus<A>> {
    pub(super) core: &'c Core<A, B>,
}

impl<'c, A: Allocator, B: SystemBus<A>> Mmu<'c, A, B> {
    pub fn read_byte(&self, allocator: &mut A, address: u32) -> Result<u8, MemoryError> {
        trace!("Reading byte from memory at vaddr {address:#010x}");
        let privilege_level = self.core.effective_privilege_mode(allocator);
        let mut buf = [0];
        self.read(&mut buf, allocator, address, privilege_level, false)
            .map(|()| buf[0])
    }

    pub fn read_byte_debug(&self, allocator: &A, address: u32) -> Result<u8, MemoryError> {
        trace!("Debug reading byte from memory at vaddr {address:#010x}");
        let privilege_level = self.core.effective_privilege_mode(allocator);
        let mut buf = [0];
        self.read_debug(&mut buf, allocator, address, privilege_level, false)
            .map(|()| buf[0])
    }

    pub fn write_byte(
        &self,
        allocator: &mut A,
        address: u32,
        value: u8,
    ) -> Result<(), MemoryError> {
        trace!(value; "Writing byte to memory at vaddr {address:#010x}");
        let privilege_level = self.core.effective_privilege_mode(allocator);
        self.write(allocator, address, &[value], privilege_level)
    }

    access_fns! {
        read_halfword, read_halfword_debug, write_halfword => u16,
        read_word, read_word_debug, write_word => u32,
        read_doubleword, read_doubleword_debug, write_doubleword => u64,
        read_quadword, read_quadword_debug, write_quadword => u128,
    }

    /// Reads a naturally-aligned 32-bit little-endian word from memory.
    ///
    /// > The base RISC-V ISA has fixed-length 32-bit instructions that must be naturally aligned on
    /// > 32-bit boundaries.
    ///
    /// > Instructions are stored in memory as a sequence of 16-bit little-endian parcels,
    /// > regardless of memory system endianness. Parcels forming one instruction are stored at
    /// > increasing halfword addresses, with the lowest-addressed parcel holding the
    /// > lowest-numbered bits in the instruction specification.
    pub fn fetch_instruction(&self, allocator: &mut A, address: u32) -> Result<u32, MemoryError> {
        trace!("Fetching instruction from memory at vaddr {address:#010x}");
        if !Alignment::HALFWORD.is_aligned(address) {
            debug!("Failed to fetch instruction: address misaligned: {address:#010x}");
            return Err(MemoryError::MisalignedAccess);
        }
        // Use the core's current privilege level, not its *effective* privilege level, since that
        // shouldn't be used for instruction fetches.
        let privilege_level = self.core.privilege_mode(allocator);
        let mut buf = [0u8; 4];
        self.read(&mut buf, allocator, address, privilege_level, true)
            .map(|()| u32::from_le_bytes(buf))
    }

    pub fn read_range(
        &self,
        buf: &mut [u8],
        allocator: &mut A,
        address: u32,
    ) -> Result<(), MemoryError> {
        let privilege_level = self.core.privilege_mode(allocator);
        self.read(buf, allocator, address, privilege_level, false)
    }

    pub fn read_range_debug(
        &self,
        buf: &mut [u8],
        allocator: &A,
        address: u32,
    ) -> Result<(), MemoryError> {
        let privilege_level = self.core.privilege_mode(allocator);
        self.read_debug(buf, allocator, address, privilege_level, false)
    }

    pub fn write_range(
        &self,
        allocator: &mut A,
        address: u32,
        buf: &[u8],
    ) -> Result<(), MemoryError> {
        let privilege_level = self.core.privilege_mode(allocator);
        self.write(allocator, address, buf, privilege_level)
    }

    fn read(
        &self,
        buf: &mut [u8],
        allocator: &mut A,
        address: u32,
        privilege_level: PrivilegeLevel,
        execute: bool,
    ) -> Result<(), MemoryError> {
        let access_type = match execute {
            true => AccessType::Execute,
            false => AccessType::Read,
        };
        let physical_address =
            self.access_virtual(allocator, address, buf.len(), access_type, privilege_level)?;
        self.core.system_bus.read(buf, allocator, physical_address);
        Ok(())
    }

    fn read_debug(
        &self,
        buf: &mut [u8],
        allocator: &A,
        address: u32,
        privilege_level: PrivilegeLevel,
        execute: bool,
    ) -> Result<(), MemoryError> {
        let access_type = match execute {
            true => AccessType::Execute,
            false => AccessType::Read,
        };
        let physical_address =
            self.access_virtual_debug(allocator, address, buf.len(), access_type, privilege_level)?;
        self.core
            .system_bus
            .read_debug(buf, allocator, physical_address);
        Ok(())
    }

    fn write(
        &self,
        allocator: &mut A,
        address: u32,
        buf: &[u8],
        privilege_level: PrivilegeLevel,
    ) -> Result<(), MemoryError> {
        let physical_address = self.access_virtual(
            allocator,
            address,
            buf.len(),
            AccessType::Write,
            privilege_level,
        )?;
        self.core.system_bus.write(allocator, physical_address, buf);
        self.invalidate_overlapping_dbb_entries(allocator, address, buf.len());
        Ok(())
    }

    /// Drops any decoded-block cache entry whose instruction word overlaps the `size`-byte store
    /// at (virtual) `address`, so a subsequent fetch at that `pc` re-decodes rather than serving a
    /// stale cached instruction for self-modifying code.
    fn invalidate_overlapping_dbb_entries(&self, allocator: &mut A, address: u32, size: usize) {
        let Ok(size) = u32::try_from(size) else {
            return;
        };
        let first_word = address & !0b11;
        let last_word = address.wrapping_add(size.saturating_sub(1)) & !0b11;
        let mut word = first_word;
        loop {
            self.core.dbb_cache.get_mut(allocator).invalidate(word);
            if word == last_word {
                break;
            }
            word = word.wrapping_add(4);
        }
    }

    /// Performs the necessary checks for access virtual `address` of `size` bytes.
    /// Translates the address from virtual to physical.
    fn access_virtual(
        &self,
        allocator: &mut A,
        address: u32,
        size: usize,
        access_type: AccessType,
        privilege_level: PrivilegeLevel,
    ) -> Result<u32, MemoryError> {
        self.access_virtual_pre_translate_checks(address, size, access_type)?;
        let physical_address =
            self.translate_address(allocator, address, access_type, privilege_level)?;
        self.access_physical(physical_address, size, access_type)?;
        Ok(physical_address)
    }

    /// Performs the necessary checks for access virtual `address` of `size` bytes.
    /// Translates the address from virtual to physical.
    fn access_virtual_debug(
        &self,
        allocator: &A,
        address: u32,
        size: usize,
        access_type: AccessType,
        privilege_level: PrivilegeLevel,
    ) -> Result<u32, MemoryError> {
        self.access_virtual_pre_translate_checks(address, size, access_type)?;
        let physical_address =
            self.translate_address_debug(allocator, address, access_type, privilege_level)?;
        self.access_physical(physical_address, size, access_type)?;
        Ok(physical_address)
    }

    fn access_virtual_pre_translate_checks(
        &self,
        address: u32,
        size: usize,
        access_type: AccessType,
    ) -> Result<(), MemoryError> {
        let size = u32::try_from(size).map_err(|_| MemoryError::AccessFault)?;

        if !self.core.config.support_misaligned_memory_access
            && !Alignment::natural_for_size(size)
                .map(|alignment| alignment.is_aligned(address))
                // If `size` is not a power of two, then the access is always considered unaligned
                .unwrap_or(false)
        {
            debug!(
                address, size, access_type:%,
                core_supports_misaligned_accesses=self.core.config.support_misaligned_memory_access;
                "Memory access misaligned"
            );
            return Err(MemoryError::MisalignedAccess);
        }

        Ok(())
    }

    // Perform PMA & PMP checks for physical (`address`, `size`) accesses of type `access_type`.
    fn access_physical(
        &self,
        address: u32,
        size: usize,
        access_type: AccessType,
    ) -> Result<(), MemoryError> {
        // TODO: PMP checks
        if self.core.system_bus.accepts(address, size, access_type) {
            Ok(())
        } else {
            debug!(
                address, size, access_type:%;
                "Memory access not accepted by system bus"
            );
            Err(MemoryError::AccessFault)
        }
    }

    /// Map a virtual byte address to the corresponding physical byte address.
    ///
    /// Consults (and populates) this hart's [`Tlb`] before falling back to a full page-table
    /// walk.
    fn translate_address(
        &self,
        allocator: &mut A,
        address: u32,
        access_type: AccessType,
        privilege_level: PrivilegeLevel,
    ) -> Result<u32, MemoryError> {
        let user_mode = match privilege_level {
            PrivilegeLevel::Machine => return Ok(address),
            PrivilegeLevel::User => true,
            PrivilegeLevel::Supervisor => false,
        };
        let satp = self.core.satp.get(allocator);
        let Some(layout) = satp.mode().layout() else {
            return Ok(address);
        };
        let asid = satp.asid();
        let root_ppn = satp.ppn();
        let vpn = address >> PAGE_SIZE_SHF;
        let page_offset = address & ((1 << PAGE_SIZE_SHF) - 1);

        if let Some(entry) = self.core.tlb.get(allocator).lookup(asid, vpn) {
            let dirtying = access_type == AccessType::Write;
            if !dirtying || entry.writable_clean {
                if self.permits(entry.r, entry.w, entry.x, entry.u, access_type, user_mode, allocator) {
                    return Ok((entry.ppn << PAGE_SIZE_SHF) + page_offset);
                }
                return Err(MemoryError::PageFault);
            }
        }

        let (ppn, r, w, x, u, dirty) =
            self.walk(allocator, layout, root_ppn, address, access_type, user_mode)?;
        self.core.tlb.get_mut(allocator).insert(
            asid,
            vpn,
            TlbEntry {
                ppn,
                r,
                w,
                x,
                u,
                writable_clean: dirty,
            },
        );
        Ok((ppn << PAGE_SIZE_SHF) + page_offset)
    }

    /// Map a virtual byte address to the corresponding physical byte address, without consulting
    /// or updating the TLB (debug accesses do not have mutable allocator access, so they cannot
    /// perform the accessed/dirty-bit writeback a real walk may need to do).
    fn translate_address_debug(
        &self,
        allocator: &A,
        address: u32,
        access_type: AccessType,
        privilege_level: PrivilegeLevel,
    ) -> Result<u32, MemoryError> {
        let user_mode = match privilege_level {
            PrivilegeLevel::Machine => return Ok(address),
            PrivilegeLevel::User => true,
            PrivilegeLevel::Supervisor => false,
        };
        let satp = self.core.satp.get(allocator);
        let Some(layout) = satp.mode().layout() else {
            return Ok(address);
        };
        let page_offset = address & ((1 << PAGE_SIZE_SHF) - 1);
        let (ppn, r, w, x, u, _dirty) =
            self.walk_debug(allocator, layout, satp.ppn(), address)?;
        if !self.permits(r, w, x, u, access_type, user_mode, allocator) {
            return Err(MemoryError::PageFault);
        }
        Ok((ppn << PAGE_SIZE_SHF) + page_offset)
    }

    fn permits(
        &self,
        r: bool,
        w: bool,
        x: bool,
        u: bool,
        access_type: AccessType,
        user_mode: bool,
        allocator: &A,
    ) -> bool {
        let status = self.core.status.get(allocator);
        let readable = match access_type {
            AccessType::Read => r || (x && status.mxr()),
            AccessType::Write => w,
            AccessType::Execute => x,
        };
        readable
            && ((user_mode == u) || (!user_mode && access_type != AccessType::Execute && status.sum()))
    }

    /// Walks the page table rooted at `root_ppn` for `address`, generalized over the page table
    /// depth and PTE size so the same algorithm serves Sv32 (2 levels, 4-byte PTEs), Sv39
    /// (3 levels, 8-byte PTEs) and Sv48 (4 levels, 8-byte PTEs); see [`SatpMode::layout`].
    ///
    /// Returns `(ppn, r, w, x, u, dirtied)` for the leaf PTE found, after setting its accessed bit
    /// (and dirty bit, for a write access) if not already set.
    fn walk(
        &self,
        allocator: &mut A,
        layout: PagingLayout,
        root_ppn: u32,
        address: u32,
        access_type: AccessType,
        user_mode: bool,
    ) -> Result<(u32, bool, bool, bool, bool, bool), MemoryError> {
        let pte_size_shf = layout.pte_size_shf;
        let vpn_bits = layout.vpn_bits;
        let vpn_mask: u32 = (1 << vpn_bits) - 1;
        // STEP 1
        let mut page_table = root_ppn << PAGE_SIZE_SHF;
        for level in (0..layout.levels).rev() {
            // STEP 2
            let vpn_i = (address >> (PAGE_SIZE_SHF + level * vpn_bits)) & vpn_mask;
            let entry_address = page_table + (vpn_i << pte_size_shf);
            let mut raw_entry = self.read_pte(allocator, entry_address, pte_size_shf)?;
            {
                let entry = raw_entry.view_bits::<Lsb0>();
                // STEP 3
                if !entry[pte::V] || (!entry[pte::R] && entry[pte::W]) {
                    return Err(MemoryError::PageFault);
                }
                // STEP 4
                if !entry[pte::R] && !entry[pte::X] {
                    if level == 0 {
                        return Err(MemoryError::PageFault);
                    }
                    page_table = u32::try_from(pte::ppn(entry) << PAGE_SIZE_SHF)
                        .map_err(|_| MemoryError::AccessFault)?;
                    continue;
                }
            }
            let entry = raw_entry.view_bits::<Lsb0>();
            // STEP 5
            let r = entry[pte::R];
            let w = entry[pte::W];
            let x = entry[pte::X];
            let u = entry[pte::U];
            if !self.permits(r, w, x, u, access_type, user_mode, allocator) {
                return Err(MemoryError::PageFault);
            }
            // STEP 6 & 8
            let mut ppn = pte::ppn(entry);
            if level != 0 {
                let mask = (1u64 << (level * vpn_bits)) - 1;
                if ppn & mask != 0 {
                    return Err(MemoryError::PageFault);
                }
                ppn |= (vpn_i as u64) & mask;
            }
            // STEP 7
            let dirtying = access_type == AccessType::Write;
            let already_current = entry[pte::A] && (!dirtying || entry[pte::D]);
            if !already_current {
                let entry = raw_entry.view_bits_mut::<Lsb0>();
                entry.set(pte::A, true);
                entry.set(pte::D, entry[pte::D] || dirtying);
                self.write_pte(allocator, entry_address, raw_entry, pte_size_shf)?;
            }
            let dirty = dirtying || raw_entry.view_bits::<Lsb0>()[pte::D];
            let ppn = u32::try_from(ppn).map_err(|_| MemoryError::AccessFault)?;
            return Ok((ppn, r, w, x, u, dirty));
        }
        unreachable!("layout.levels is always > 0")
    }

    /// Debug-only counterpart of [`Self::walk`]: performs the same traversal but never writes
    /// back accessed/dirty bits, since it only has an immutable allocator. Permission checks are
    /// left to the caller since debug accesses have no access type of their own to thread through
    /// cleanly.
    fn walk_debug(
        &self,
        allocator: &A,
        layout: PagingLayout,
        root_ppn: u32,
        address: u32,
    ) -> Result<(u32, bool, bool, bool, bool, bool), MemoryError> {
        let pte_size_shf = layout.pte_size_shf;
        let vpn_bits = layout.vpn_bits;
        let vpn_mask: u32 = (1 << vpn_bits) - 1;
        let mut page_table = root_ppn << PAGE_SIZE_SHF;
        for level in (0..layout.levels).rev() {
            let vpn_i = (address >> (PAGE_SIZE_SHF + level * vpn_bits)) & vpn_mask;
            let entry_address = page_table + (vpn_i << pte_size_shf);
            let raw_entry = self.read_pte_debug(allocator, entry_address, pte_size_shf)?;
            let entry = raw_entry.view_bits::<Lsb0>();
            if !entry[pte::V] || (!entry[pte::R] && entry[pte::W]) {
                return Err(MemoryError::PageFault);
            }
            if !entry[pte::R] && !entry[pte::X] {
                if level == 0 {
                    return Err(MemoryError::PageFault);
                }
                page_table = u32::try_from(pte::ppn(entry) << PAGE_SIZE_SHF)
                    .map_err(|_| MemoryError::AccessFault)?;
                continue;
            }
            let mut ppn = pte::ppn(entry);
            if level != 0 {
                let mask = (1u64 << (level * vpn_bits)) - 1;
                if ppn & mask != 0 {
                    return Err(MemoryError::PageFault);
                }
                ppn |= (vpn_i as u64) & mask;
            }
            let ppn = u32::try_from(ppn).map_err(|_| MemoryError::AccessFault)?;
            return Ok((
                ppn,
                entry[pte::R],
                entry[pte::W],
                entry[pte::X],
                entry[pte::U],
                entry[pte::D],
            ));
        }
        unreachable!("layout.levels is always > 0")
    }

    fn read_pte(
        &self,
        allocator: &mut A,
        address: u32,
        pte_size_shf: u32,
    ) -> Result<u64, MemoryError> {
        if pte_size_shf == 2 {
            self.access_physical(address, 4, AccessType::Read)?;
            let mut buf = [0u8; 4];
            self.core.system_bus.read(&mut buf, allocator, address);
            Ok(u32::from_le_bytes(buf) as u64)
        } else {
            self.access_physical(address, 8, AccessType::Read)?;
            let mut buf = [0u8; 8];
            self.core.system_bus.read(&mut buf, allocator, address);
            Ok(u64::from_le_bytes(buf))
        }
    }

    fn read_pte_debug(
        &self,
        allocator: &A,
        address: u32,
        pte_size_shf: u32,
    ) -> Result<u64, MemoryError> {
        if pte_size_shf == 2 {
            self.access_physical(address, 4, AccessType::Read)?;
            let mut buf = [0u8; 4];
            self.core.system_bus.read_debug(&mut buf, allocator, address);
            Ok(u32::from_le_bytes(buf) as u64)
        } else {
            self.access_physical(address, 8, AccessType::Read)?;
            let mut buf = [0u8; 8];
            self.core.system_bus.read_debug(&mut buf, allocator, address);
            Ok(u64::from_le_bytes(buf))
        }
    }

    fn write_pte(
        &self,
        allocator: &mut A,
        address: u32,
        value: u64,
        pte_size_shf: u32,
    ) -> Result<(), MemoryError> {
        if pte_size_shf == 2 {
            self.access_physical(address, 4, AccessType::Write)?;
            let buf = (value as u32).to_le_bytes();
            self.core.system_bus.write(allocator, address, &buf);
        } else {
            self.access_physical(address, 8, AccessType::Write)?;
            let buf = value.to_le_bytes();
            self.core.system_bus.write(allocator, address, &buf);
        }
        Ok(())
    }
}

mod pte {
    use bitvec::{field::BitField, order::Lsb0, slice::BitSlice};

    pub const V: usize = 0;
    pub const R: usize = 1;
    pub const W: usize = 2;
    pub const X: usize = 3;
    pub const U: usize = 4;
    pub const A: usize = 6;
    pub const D: usize = 7;

    pub fn ppn(entry: &BitSlice<u64, Lsb0>) -> u64 {
        entry[10..54].load_le()
    }
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum MemoryError {
    #[error("misaligned access")]
    MisalignedAccess,
    #[error("access fault")]
    AccessFault,
    #[error("page fault")]
    PageFault,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn satp_write_rejects_unsupported_mode_entirely() {
        let mut satp = Satp::new();
        satp.write(1 << 20, u32::MAX, Xlen::Rv32);
        assert_eq!(satp.ppn(), 1);
        let before = satp.read();
        // Sv39 is not legal on Rv32; the whole write (including the ppn change) must be dropped.
        satp.write((2 << 30) | (5 << 20), u32::MAX, Xlen::Rv32);
        assert_eq!(satp.read(), before);
    }

    #[test]
    fn satp_write_accepts_sv32_on_rv32() {
        let mut satp = Satp::new();
        satp.write((1 << 30) | 0x1234, u32::MAX, Xlen::Rv32);
        assert_eq!(satp.mode(), SatpMode::Sv32);
        assert_eq!(satp.ppn(), 0x1234);
    }

    #[test]
    fn satp_write_accepts_sv39_on_rv64_but_not_rv32() {
        let mut satp = Satp::new();
        satp.write(2 << 30, u32::MAX, Xlen::Rv64);
        assert_eq!(satp.mode(), SatpMode::Sv39);

        let mut satp = Satp::new();
        satp.write(2 << 30, u32::MAX, Xlen::Rv32);
        assert_eq!(satp.mode(), SatpMode::Bare);
    }

    #[test]
    fn tlb_invalidate_all_clears_every_entry() {
        let mut tlb = Tlb::new();
        tlb.insert(
            0,
            1,
            TlbEntry {
                ppn: 1,
                r: true,
                w: false,
                x: false,
                u: false,
                writable_clean: false,
            },
        );
        tlb.invalidate(None, None);
        assert!(tlb.is_empty());
    }

    #[test]
    fn tlb_invalidate_by_vaddr_only_drops_matching_vpn() {
        let mut tlb = Tlb::new();
        let entry = TlbEntry {
            ppn: 1,
            r: true,
            w: false,
            x: false,
            u: false,
            writable_clean: false,
        };
        tlb.insert(0, 1, entry);
        tlb.insert(0, 2, entry);
        tlb.invalidate(Some(1 << PAGE_SIZE_SHF), None);
        assert!(tlb.lookup(0, 1).is_none());
        assert!(tlb.lookup(0, 2).is_some());
    }
}
