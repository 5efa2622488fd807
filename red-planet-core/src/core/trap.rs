#![allow(unused)]

use bitvec::{field::BitField, order::Lsb0, view::BitView};

use super::{Exception, Interrupt};

/// All per-hart state related to trap setup, trap delegation, and trap handling.
///
/// This merges what used to be split across a handful of half-finished modules (a flat
/// register-only `Trap`, and `mtvec`/`medeleg` living on `Control`) into the single home
/// `Core::trap()` actually needs: exception delegation state, the trap vector registers, and
/// the scratch/epc/cause/tval register banks for both M-mode and S-mode. Interrupt delegation
/// (`mideleg`) lives on [`super::interrupts::Interrupts`] instead, next to `mip`/`mie`, since
/// that's the one place in the teacher that already had a working delegation mask.
#[derive(Debug, Clone)]
pub struct Trap {
    pub mtvec: Tvec,
    pub medeleg: Medeleg,
    pub stvec: Tvec,

    mscratch: u32,
    mepc: u32,
    pub mcause: Cause,
    mtval: u32,
    mtinst: u32,
    mtval2: u32,

    sscratch: u32,
    sepc: u32,
    pub scause: Cause,
    stval: u32,
}

impl Default for Trap {
    fn default() -> Self {
        Self::new()
    }
}

impl Trap {
    pub fn new() -> Self {
        Self {
            mtvec: Tvec::new(),
            medeleg: Medeleg::new(),
            stvec: Tvec::new(),

            mscratch: 0,
            mepc: 0,
            mcause: Cause::new(),
            mtval: 0,
            mtinst: 0,
            mtval2: 0,

            sscratch: 0,
            sepc: 0,
            scause: Cause::new(),
            stval: 0,
        }
    }

    pub fn read_mscratch(&self) -> u32 {
        self.mscratch
    }

    pub fn write_mscratch(&mut self, value: u32, mask: u32) {
        self.mscratch = self.mscratch & !mask | value & mask;
    }

    pub fn read_mepc(&self) -> u32 {
        self.mepc
    }

    pub fn write_mepc(&mut self, value: u32, mask: u32) {
        self.mepc = self.mepc & !mask | value & mask;
        self.mepc &= !0b1;
    }

    pub fn read_mtval(&self) -> u32 {
        self.mtval
    }

    pub fn write_mtval(&mut self, value: u32, mask: u32) {
        self.mtval = self.mtval & !mask | value & mask;
    }

    pub fn read_mtinst(&self) -> u32 {
        self.mtinst
    }

    pub fn write_mtinst(&mut self, value: u32, mask: u32) {
        self.mtinst = self.mtinst & !mask | value & mask;
    }

    pub fn read_mtval2(&self) -> u32 {
        self.mtval2
    }

    pub fn write_mtval2(&mut self, value: u32, mask: u32) {
        self.mtval2 = self.mtval2 & !mask | value & mask;
    }

    pub fn read_sscratch(&self) -> u32 {
        self.sscratch
    }

    pub fn write_sscratch(&mut self, value: u32, mask: u32) {
        self.sscratch = self.sscratch & !mask | value & mask;
    }

    pub fn read_sepc(&self) -> u32 {
        self.sepc
    }

    pub fn write_sepc(&mut self, value: u32, mask: u32) {
        self.sepc = self.sepc & !mask | value & mask;
        self.sepc &= !0b1;
    }

    pub fn read_stval(&self) -> u32 {
        self.stval
    }

    pub fn write_stval(&mut self, value: u32, mask: u32) {
        self.stval = self.stval & !mask | value & mask;
    }
}

/// What caused entry into the trap handler: a synchronous exception, or an asynchronous
/// interrupt. Used to pick the delegation register (`medeleg`/`mideleg`) and to compute the
/// `xcause` value.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TrapCause {
    Exception(Exception),
    Interrupt(Interrupt),
}

impl From<Exception> for TrapCause {
    fn from(value: Exception) -> Self {
        Self::Exception(value)
    }
}

impl From<Interrupt> for TrapCause {
    fn from(value: Interrupt) -> Self {
        Self::Interrupt(value)
    }
}

/// An `xcause` register (`mcause`/`scause`).
///
/// Bit `XLEN-1` is the Interrupt bit; the remaining bits hold the Exception Code.
#[derive(Debug, Clone)]
pub struct Cause(u32);

impl Default for Cause {
    fn default() -> Self {
        Self::new()
    }
}

impl Cause {
    const INTERRUPT_BIT: usize = 31;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn read(&self) -> u32 {
        self.0
    }

    pub fn write(&mut self, value: u32, mask: u32) {
        self.0 = self.0 & !mask | value & mask;
    }

    pub fn set(&mut self, cause: &TrapCause) {
        let (interrupt, code) = match *cause {
            TrapCause::Exception(exception) => (false, exception.code()),
            TrapCause::Interrupt(interrupt) => (true, interrupt.code()),
        };
        self.0 = code;
        self.0.view_bits_mut::<Lsb0>().set(Self::INTERRUPT_BIT, interrupt);
    }

    pub fn set_exception(&mut self, exception: Option<Exception>) {
        match exception {
            Some(exception) => self.set(&TrapCause::Exception(exception)),
            None => self.0 = 0,
        }
    }

    pub fn set_interrupt(&mut self, interrupt: Option<Interrupt>) {
        match interrupt {
            Some(interrupt) => self.set(&TrapCause::Interrupt(interrupt)),
            None => self.0 = 0,
        }
    }

    pub fn is_interrupt(&self) -> bool {
        self.0.view_bits::<Lsb0>()[Self::INTERRUPT_BIT]
    }

    pub fn exception_code(&self) -> u32 {
        self.0.view_bits::<Lsb0>()[..Self::INTERRUPT_BIT].load_le::<u32>()
    }
}

/// Trap Vector Base Address Register (mtvec and stvec).
///
/// > The mtvec register is an MXLEN-bit WARL read/write register that holds trap vector
/// > configuration, consisting of a vector base address (BASE) and a vector mode (MODE).
///
/// > When MODE=Direct, all traps into machine mode cause the pc to be set to the address in the
/// > BASE field. When MODE=Vectored, all synchronous exceptions into machine mode cause the pc to
/// > be set to the address in the BASE field, whereas interrupts cause the pc to be set to the
/// > address in the BASE field plus four times the interrupt cause number.
#[derive(Debug, Clone)]
pub struct Tvec(u32);

impl Default for Tvec {
    fn default() -> Self {
        Self::new()
    }
}

impl Tvec {
    pub fn new() -> Self {
        Self(0x0000_0000)
    }

    pub fn read(&self) -> u32 {
        self.0
    }

    pub fn write(&mut self, value: u32, mask: u32) {
        let new_value = self.0 & !mask | value & mask;
        if new_value & 0b11 >= 2 {
            // Reserved MODE. Since this is a WARL register, we can set it to any legal value;
            // preserve the old value, matching the behavior of QEMU's implementation.
        } else {
            self.0 = new_value;
        }
    }

    /// Returns the vector base address (stored in BASE field).
    pub fn base(&self) -> u32 {
        self.0.view_bits::<Lsb0>()[2..].load_le::<u32>() << 2
    }

    /// Returns the vector mode (stored in MODE field).
    pub fn mode(&self) -> VectorMode {
        match self.0.view_bits::<Lsb0>()[0] {
            false => VectorMode::Direct,
            true => VectorMode::Vectored,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorMode {
    Direct,
    Vectored,
}

/// The medeleg register is **WARL**.
#[derive(Debug, Clone)]
pub struct Medeleg(u32);

impl Default for Medeleg {
    fn default() -> Self {
        Self::new()
    }
}

impl Medeleg {
    // Delegatable exceptions according to QEMU's implementation.
    #[allow(clippy::identity_op)]
    const DELEGATABLE_EXCEPTIONS_MASK: u32 = 0
        | (1 << Exception::INSTRUCTION_ADDRESS_MISALIGNED)
        | (1 << Exception::INSTRUCTION_ACCESS_FAULT)
        | (1 << Exception::ILLEGAL_INSTRUCTION)
        | (1 << Exception::BREAKPOINT)
        | (1 << Exception::LOAD_ADDRESS_MISALIGNED)
        | (1 << Exception::LOAD_ACCESS_FAULT)
        | (1 << Exception::STORE_OR_AMO_ADDRESS_MISALIGNED)
        | (1 << Exception::STORE_OR_AMO_ACCESS_FAULT)
        | (1 << Exception::ENVIRONMENT_CALL_FROM_U_MODE)
        | (1 << Exception::ENVIRONMENT_CALL_FROM_S_MODE)
        | (1 << Exception::ENVIRONMENT_CALL_FROM_M_MODE)
        | (1 << Exception::INSTRUCTION_PAGE_FAULT)
        | (1 << Exception::LOAD_PAGE_FAULT)
        | (1 << Exception::STORE_OR_AMO_PAGE_FAULT);

    pub fn new() -> Self {
        Self(0x0000_0000)
    }

    pub fn read(&self) -> u32 {
        self.0
    }

    pub fn write(&mut self, value: u32, mask: u32) {
        self.0 = self.0 & !mask | value & mask & Self::DELEGATABLE_EXCEPTIONS_MASK;
    }

    pub fn should_delegate(&self, exception: Exception) -> bool {
        self.0 & (1 << exception.code()) != 0
    }
}
