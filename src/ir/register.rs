//! Registers as opaque identity tokens.
//!
//! A register is either one of the sixteen x86-64 hardware registers or a
//! virtual register minted by [`Register::fresh`]. Identity is the value:
//! two fresh registers never compare equal, and hardware registers are
//! singletons. Virtual registers only become printable once allocation has
//! mapped them to hardware.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

const PHYSICAL_COUNT: u32 = 16;

static NEXT_VIRTUAL: AtomicU32 = AtomicU32::new(PHYSICAL_COUNT);

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Register(u32);

impl Register {
    pub const RAX: Register = Register(0);
    pub const RBX: Register = Register(1);
    pub const RCX: Register = Register(2);
    pub const RDX: Register = Register(3);
    pub const RSI: Register = Register(4);
    pub const RDI: Register = Register(5);
    pub const RBP: Register = Register(6);
    pub const RSP: Register = Register(7);
    pub const R8: Register = Register(8);
    pub const R9: Register = Register(9);
    pub const R10: Register = Register(10);
    pub const R11: Register = Register(11);
    pub const R12: Register = Register(12);
    pub const R13: Register = Register(13);
    pub const R14: Register = Register(14);
    pub const R15: Register = Register(15);

    /// Mint a virtual register distinct from every other register.
    pub fn fresh() -> Register {
        Register(NEXT_VIRTUAL.fetch_add(1, Ordering::Relaxed))
    }

    pub fn is_physical(self) -> bool {
        self.0 < PHYSICAL_COUNT
    }

    /// NASM name of a hardware register.
    ///
    /// Panics on virtual registers — only allocation output may be printed.
    pub fn to_asm(self) -> &'static str {
        match self {
            Register::RAX => "rax",
            Register::RBX => "rbx",
            Register::RCX => "rcx",
            Register::RDX => "rdx",
            Register::RSI => "rsi",
            Register::RDI => "rdi",
            Register::RBP => "rbp",
            Register::RSP => "rsp",
            Register::R8 => "r8",
            Register::R9 => "r9",
            Register::R10 => "r10",
            Register::R11 => "r11",
            Register::R12 => "r12",
            Register::R13 => "r13",
            Register::R14 => "r14",
            Register::R15 => "r15",
            _ => panic!("virtual register {:?} is not printable", self),
        }
    }

    /// NASM name of the low 8-bit part, as used by `set<cc>`.
    pub fn to_8bit_lower(self) -> &'static str {
        match self {
            Register::RAX => "al",
            Register::RBX => "bl",
            Register::RCX => "cl",
            Register::RDX => "dl",
            Register::RSI => "sil",
            Register::RDI => "dil",
            Register::RBP => "bpl",
            Register::RSP => "spl",
            Register::R8 => "r8b",
            Register::R9 => "r9b",
            Register::R10 => "r10b",
            Register::R11 => "r11b",
            Register::R12 => "r12b",
            Register::R13 => "r13b",
            Register::R14 => "r14b",
            Register::R15 => "r15b",
            _ => panic!("virtual register {:?} is not printable", self),
        }
    }
}

impl fmt::Debug for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_physical() {
            write!(f, "{}", self.to_asm())
        } else {
            write!(f, "v{}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_registers_are_distinct() {
        let a = Register::fresh();
        let b = Register::fresh();
        assert_ne!(a, b);
        assert!(!a.is_physical());
        assert!(Register::RAX.is_physical());
    }

    #[test]
    fn test_hardware_names() {
        assert_eq!(Register::RAX.to_asm(), "rax");
        assert_eq!(Register::R12.to_asm(), "r12");
        assert_eq!(Register::RAX.to_8bit_lower(), "al");
        assert_eq!(Register::R8.to_8bit_lower(), "r8b");
    }
}
