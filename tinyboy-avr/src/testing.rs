//! A tiny reference MCU for tests.
//!
//! It interprets only the control flow of AVR code: every conditional branch or skip reads the
//! button input and takes its branch when the button is pressed, calls push a return address and a
//! return with an empty stack halts. Instruction fetches go through instrumented code memory
//! exactly like a real emulator. The only data path modelled is `ldi r30`/`ldi r31` followed by
//! `lpm`, which reads program memory through the same instrumented memory.

use crate::{
    decode::{decode_words, is_two_word, Opcode},
    memory::{ByteMemory, InstrumentedMemory, Memory},
    pins::{PinBank, PinIo, WireId},
    FlashImage, Halted, Mcu,
};

/// Helpers for encoding instructions.
pub mod op {
    pub const NOP: u16 = 0x0000;
    pub const RET: u16 = 0x9508;
    pub const RETI: u16 = 0x9518;
    pub const IJMP: u16 = 0x9409;
    pub const ICALL: u16 = 0x9509;
    /// First word of `jmp`, followed by the target word address.
    pub const JMP: u16 = 0x940c;
    /// First word of `call`, followed by the target word address.
    pub const CALL: u16 = 0x940e;
    /// First word of `lds r16, k`.
    pub const LDS: u16 = 0x9100;
    /// `sbrs r0, 0`
    pub const SBRS: u16 = 0xfe00;
    /// `sbrc r0, 0`
    pub const SBRC: u16 = 0xfc00;
    /// `cpse r0, r0`
    pub const CPSE: u16 = 0x1000;
    /// `lpm r0, Z`
    pub const LPM: u16 = 0x95c8;

    pub fn rjmp(k: i16) -> u16 {
        0xc000 | (k as u16 & 0x0fff)
    }

    pub fn rcall(k: i16) -> u16 {
        0xd000 | (k as u16 & 0x0fff)
    }

    /// `ldi rd, k` for `16 <= d < 32`.
    pub fn ldi(d: u8, k: u8) -> u16 {
        0xe000 | ((k as u16 & 0xf0) << 4) | (((d - 16) as u16) << 4) | (k as u16 & 0x0f)
    }

    pub fn breq(k: i8) -> u16 {
        0xf001 | ((k as u16 & 0x7f) << 3)
    }

    pub fn brne(k: i8) -> u16 {
        0xf401 | ((k as u16 & 0x7f) << 3)
    }
}

/// Build a flash image from instruction words.
pub fn assemble(words: &[u16]) -> FlashImage {
    FlashImage::from_bytes(words.iter().flat_map(|w| w.to_le_bytes()).collect())
}

pub struct ScriptedMcu {
    code: InstrumentedMemory<ByteMemory>,
    data: ByteMemory,
    pc: u32,
    /// The Z pointer (r31:r30).
    z: u16,
    stack: Vec<u32>,
    button: WireId,
}

impl ScriptedMcu {
    pub const FLASH_SIZE: usize = 0x2000;
    pub const DATA_SIZE: usize = 0x200;

    pub fn new(pins: &mut PinBank) -> Self {
        Self {
            code: InstrumentedMemory::new(ByteMemory::new(Self::FLASH_SIZE)),
            data: ByteMemory::new(Self::DATA_SIZE),
            pc: 0,
            z: 0,
            stack: vec![],
            button: pins.connect(&["PB1"]),
        }
    }

    fn fetch(&mut self, addr: u32) -> Option<u16> {
        if addr as usize + 1 >= Self::FLASH_SIZE {
            return None;
        }
        Some(u16::from_le_bytes([self.code.read(addr), self.code.read(addr + 1)]))
    }

    fn execute(&mut self, word: u16) {
        match word {
            // ldi r30 / ldi r31
            w if w & 0xf0e0 == 0xe0e0 => {
                let k = ((w >> 4) & 0xf0) | (w & 0x0f);
                self.z = match w & 0x0010 != 0 {
                    true => (self.z & 0x00ff) | (k << 8),
                    false => (self.z & 0xff00) | k,
                };
            }
            0x95c8 => {
                self.code.read(self.z as u32);
            }
            _ => {}
        }
    }

    fn relative(next: u32, k: i64) -> u32 {
        (next as i64 + 2 * k).rem_euclid(Self::FLASH_SIZE as i64) as u32
    }
}

impl Mcu for ScriptedMcu {
    type Code = ByteMemory;
    type Data = ByteMemory;

    fn reset(&mut self) {
        self.pc = 0;
        self.z = 0;
        self.stack.clear();
        self.data.clear();
    }

    fn upload(&mut self, image: &FlashImage) {
        self.code.inner_mut().load(image.as_bytes());
    }

    fn clock(&mut self, pins: &mut PinIo) -> Result<(), Halted> {
        let pc = self.pc;
        let first = self.fetch(pc).ok_or(Halted)?;
        let insn = decode_words(pc, first, || self.fetch(pc + 2)).map_err(|_| Halted)?;
        let next = pc + insn.width;

        // Count executed instructions so tests can observe the final memory state.
        self.data.write(0, self.data.peek(0).wrapping_add(1));

        self.pc = match insn.opcode {
            Opcode::Sequential => {
                self.execute(first);
                next
            }
            Opcode::Rjmp { k } => Self::relative(next, k as i64),
            Opcode::Jmp { target } => target * 2,
            Opcode::Rcall { k } => {
                self.stack.push(next);
                Self::relative(next, k as i64)
            }
            Opcode::Call { target } => {
                self.stack.push(next);
                target * 2
            }
            Opcode::Branch { k, .. } => match pins.read(self.button) {
                true => Self::relative(next, k as i64),
                false => next,
            },
            Opcode::Skip(_) => match pins.read(self.button) {
                true => {
                    let skipped = u16::from_le_bytes([self.code.peek(next), self.code.peek(next + 1)]);
                    next + if is_two_word(skipped) { 4 } else { 2 }
                }
                false => next,
            },
            Opcode::Ret | Opcode::Reti => self.stack.pop().ok_or(Halted)?,
            Opcode::Ijmp | Opcode::Eijmp | Opcode::Icall | Opcode::Eicall => return Err(Halted),
        };
        Ok(())
    }

    fn code(&mut self) -> &mut InstrumentedMemory<ByteMemory> {
        &mut self.code
    }

    fn data(&self) -> &ByteMemory {
        &self.data
    }
}
