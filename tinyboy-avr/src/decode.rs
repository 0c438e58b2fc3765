//! Decoding of AVR instructions, classified by how they affect control flow.
//!
//! Only the information needed to enumerate reachable code is kept: the instruction width and, for
//! control transfers, the target operand. Every other valid encoding is reported as
//! [`Opcode::Sequential`]. Reserved encodings are rejected, since there is no safe way to guess
//! their width.

use crate::firmware::FlashImage;

/// A status register flag tested by a conditional branch.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Flag(pub u8);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SkipKind {
    /// Compare, skip if equal.
    Cpse,
    /// Skip if bit in register cleared.
    Sbrc,
    /// Skip if bit in register set.
    Sbrs,
    /// Skip if bit in I/O register cleared.
    Sbic,
    /// Skip if bit in I/O register set.
    Sbis,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Any instruction that always continues with the next instruction.
    Sequential,
    /// Relative jump, `k` is in words relative to the next instruction.
    Rjmp { k: i16 },
    /// Absolute jump to a word address.
    Jmp { target: u32 },
    Rcall { k: i16 },
    Call { target: u32 },
    /// BRBS (`set == true`) or BRBC, `k` is in words relative to the next instruction.
    Branch { flag: Flag, set: bool, k: i8 },
    Skip(SkipKind),
    Ret,
    Reti,
    Ijmp,
    Eijmp,
    Icall,
    Eicall,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Instruction {
    pub opcode: Opcode,
    /// The first word of the encoding.
    pub raw: u16,
    /// Width in bytes, either 2 or 4.
    pub width: u32,
}

impl Instruction {
    pub fn is_conditional(&self) -> bool {
        matches!(self.opcode, Opcode::Branch { .. } | Opcode::Skip(_))
    }

    pub fn is_indirect(&self) -> bool {
        matches!(self.opcode, Opcode::Ijmp | Opcode::Eijmp | Opcode::Icall | Opcode::Eicall)
    }

    pub fn mnemonic(&self) -> &'static str {
        match self.opcode {
            Opcode::Sequential => match self.raw {
                0x0000 => "nop",
                _ => "op",
            },
            Opcode::Rjmp { .. } => "rjmp",
            Opcode::Jmp { .. } => "jmp",
            Opcode::Rcall { .. } => "rcall",
            Opcode::Call { .. } => "call",
            Opcode::Branch { flag, set, .. } => branch_mnemonic(flag, set),
            Opcode::Skip(SkipKind::Cpse) => "cpse",
            Opcode::Skip(SkipKind::Sbrc) => "sbrc",
            Opcode::Skip(SkipKind::Sbrs) => "sbrs",
            Opcode::Skip(SkipKind::Sbic) => "sbic",
            Opcode::Skip(SkipKind::Sbis) => "sbis",
            Opcode::Ret => "ret",
            Opcode::Reti => "reti",
            Opcode::Ijmp => "ijmp",
            Opcode::Eijmp => "eijmp",
            Opcode::Icall => "icall",
            Opcode::Eicall => "eicall",
        }
    }
}

fn branch_mnemonic(flag: Flag, set: bool) -> &'static str {
    const SET: [&str; 8] = ["brcs", "breq", "brmi", "brvs", "brlt", "brhs", "brts", "brie"];
    const CLEAR: [&str; 8] = ["brcc", "brne", "brpl", "brvc", "brge", "brhc", "brtc", "brid"];
    match set {
        true => SET[flag.0 as usize & 7],
        false => CLEAR[flag.0 as usize & 7],
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = self.mnemonic();
        match self.opcode {
            Opcode::Rjmp { k } | Opcode::Rcall { k } => write!(f, "{name} .{:+}", 2 * k as i32),
            Opcode::Branch { k, .. } => write!(f, "{name} .{:+}", 2 * k as i32),
            Opcode::Jmp { target } | Opcode::Call { target } => write!(f, "{name} {:#x}", target * 2),
            Opcode::Sequential if self.raw != 0 => write!(f, "{name} {:#06x}", self.raw),
            _ => f.write_str(name),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DecodeError {
    /// The word at `addr` is a reserved encoding.
    UnknownOpcode { addr: u32, word: u16 },
    /// The instruction at `addr` extends past the end of flash.
    OutOfRange { addr: u32 },
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownOpcode { addr, word } => {
                write!(f, "unknown opcode {word:#06x} at {addr:#06x}")
            }
            Self::OutOfRange { addr } => write!(f, "instruction at {addr:#06x} is outside of flash"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Decode the instruction at byte address `addr` of `flash`.
pub fn decode(flash: &FlashImage, addr: u32) -> Result<Instruction, DecodeError> {
    let first = flash.word(addr).ok_or(DecodeError::OutOfRange { addr })?;
    decode_words(addr, first, || flash.word(addr + 2))
}

/// Decode an instruction from its first word, fetching the second word only for 32-bit encodings.
pub fn decode_words(
    addr: u32,
    first: u16,
    second: impl FnOnce() -> Option<u16>,
) -> Result<Instruction, DecodeError> {
    let opcode = classify(first).ok_or(DecodeError::UnknownOpcode { addr, word: first })?;
    if !is_two_word(first) {
        return Ok(Instruction { opcode, raw: first, width: 2 });
    }

    let second = second().ok_or(DecodeError::OutOfRange { addr })?;
    let opcode = match opcode {
        Opcode::Jmp { .. } => Opcode::Jmp { target: long_address(first, second) },
        Opcode::Call { .. } => Opcode::Call { target: long_address(first, second) },
        other => other,
    };
    Ok(Instruction { opcode, raw: first, width: 4 })
}

/// Returns whether `word` is the first word of a 32-bit instruction (JMP, CALL, LDS, STS).
pub fn is_two_word(word: u16) -> bool {
    (word & 0xfe0e) == 0x940c || (word & 0xfe0e) == 0x940e || (word & 0xfc0f) == 0x9000
}

fn long_address(first: u16, second: u16) -> u32 {
    let high = (((first >> 4) & 0x1f) as u32) << 1 | (first & 1) as u32;
    (high << 16) | second as u32
}

fn sign_extend(value: u16, bits: u32) -> i16 {
    let shift = 16 - bits;
    ((value << shift) as i16) >> shift
}

fn classify(w: u16) -> Option<Opcode> {
    let op = match w >> 12 {
        // Only NOP is defined in 0x00xx.
        0x0 if (w & 0xff00) == 0 && w != 0 => return None,
        0x1 if (w & 0xfc00) == 0x1000 => Opcode::Skip(SkipKind::Cpse),
        0xc => Opcode::Rjmp { k: sign_extend(w & 0x0fff, 12) },
        0xd => Opcode::Rcall { k: sign_extend(w & 0x0fff, 12) },
        0xf => match (w >> 10) & 0x3 {
            0b00 | 0b01 => Opcode::Branch {
                flag: Flag((w & 0x7) as u8),
                set: (w & 0x0400) == 0,
                k: sign_extend((w >> 3) & 0x7f, 7) as i8,
            },
            // BLD, BST, SBRC and SBRS all require bit 3 to be clear.
            _ if (w & 0x0008) != 0 => return None,
            0b10 => Opcode::Sequential,
            _ => match (w & 0x0200) != 0 {
                false => Opcode::Skip(SkipKind::Sbrc),
                true => Opcode::Skip(SkipKind::Sbrs),
            },
        },
        0x9 => return classify_9xxx(w),
        // Arithmetic, immediates, LDD/STD, IN/OUT and friends.
        _ => Opcode::Sequential,
    };
    Some(op)
}

fn classify_9xxx(w: u16) -> Option<Opcode> {
    let op = match (w >> 9) & 0x7 {
        // LD/LDS/LPM/ELPM/POP and ST/STS/XCH/LAS/LAC/LAT/PUSH
        0b000 | 0b001 => match w & 0xf {
            0x3 | 0x8 | 0xb => return None,
            _ => Opcode::Sequential,
        },
        0b010 => match w & 0xf {
            0x4 => return None,
            0x8 if (w & 0x0100) == 0 => Opcode::Sequential,
            0x8 => match w {
                0x9508 => Opcode::Ret,
                0x9518 => Opcode::Reti,
                0x9588 | 0x9598 | 0x95a8 | 0x95c8 | 0x95d8 | 0x95e8 | 0x95f8 => {
                    Opcode::Sequential
                }
                _ => return None,
            },
            0x9 => match w {
                0x9409 => Opcode::Ijmp,
                0x9419 => Opcode::Eijmp,
                0x9509 => Opcode::Icall,
                0x9519 => Opcode::Eicall,
                _ => return None,
            },
            0xb if (w & 0x0100) != 0 => return None,
            0xc | 0xd => Opcode::Jmp { target: 0 },
            0xe | 0xf => Opcode::Call { target: 0 },
            _ => Opcode::Sequential,
        },
        // ADIW/SBIW
        0b011 => Opcode::Sequential,
        0b100 | 0b101 => match (w >> 8) & 0x3 {
            0b01 => Opcode::Skip(SkipKind::Sbic),
            0b11 => Opcode::Skip(SkipKind::Sbis),
            // CBI/SBI
            _ => Opcode::Sequential,
        },
        // MUL
        _ => Opcode::Sequential,
    };
    Some(op)
}
