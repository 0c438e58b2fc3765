//! Wiring of emulated I/O pins to the fuzzing input.
//!
//! Every pin label listed in the [`WiringTable`] is connected to a pulled input line: each read of
//! such a pin consumes the next bit of the input bound for the current run. Pins that are not
//! listed are connected to ideal wires that simply latch the last value written.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// The buttons of the TinyBoy console. The declaration order defines the input line of each button.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Button {
    Up,
    Down,
    Left,
    Right,
}

impl Button {
    pub const ALL: [Button; 4] = [Button::Up, Button::Down, Button::Left, Button::Right];

    pub fn line(self) -> u8 {
        self as u8
    }

    pub fn from_line(line: u8) -> Option<Self> {
        Self::ALL.get(line as usize).copied()
    }

    pub fn symbol(self) -> char {
        match self {
            Button::Up => 'U',
            Button::Down => 'D',
            Button::Left => 'L',
            Button::Right => 'R',
        }
    }

    pub fn from_symbol(symbol: char) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.symbol() == symbol.to_ascii_uppercase())
    }
}

/// Maps pin labels to the button line they are connected to.
pub type WiringTable = IndexMap<String, Button>;

/// The wiring used by the TinyBoy board.
pub fn tinyboy_wiring() -> WiringTable {
    [("PB1", Button::Up), ("PB3", Button::Down), ("PB4", Button::Left), ("PB5", Button::Right)]
        .into_iter()
        .map(|(label, button)| (label.to_owned(), button))
        .collect()
}

/// An indexable, finite stream of input bits.
pub trait BitList {
    /// The total number of bits in the stream.
    fn size(&self) -> usize;

    fn get(&self, index: usize) -> bool;
}

impl BitList for [bool] {
    fn size(&self) -> usize {
        self.len()
    }

    fn get(&self, index: usize) -> bool {
        self[index]
    }
}

impl BitList for Vec<bool> {
    fn size(&self) -> usize {
        self.len()
    }

    fn get(&self, index: usize) -> bool {
        self[index]
    }
}

/// A single-use cursor over a [`BitList`]. Cursors cannot rewind, so a fresh cursor is needed for
/// every run.
pub struct BitCursor<'a> {
    bits: &'a dyn BitList,
    next: usize,
}

impl<'a> BitCursor<'a> {
    pub fn new(bits: &'a dyn BitList) -> Self {
        Self { bits, next: 0 }
    }

    pub fn has_next(&self) -> bool {
        self.next < self.bits.size()
    }

    /// The number of bits consumed so far.
    pub fn position(&self) -> usize {
        self.next
    }

    pub fn len(&self) -> usize {
        self.bits.size()
    }

    pub fn next_bit(&mut self) -> Option<bool> {
        if !self.has_next() {
            return None;
        }
        let bit = self.bits.get(self.next);
        self.next += 1;
        Some(bit)
    }
}

/// A handle to a wire returned by [`PinBank::connect`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WireId {
    /// A pulled wire driven by the bound input.
    Input(Button),
    /// An index into the bank's ideal wires.
    Ideal(usize),
}

#[derive(Clone, Debug)]
struct IdealWire {
    labels: Vec<String>,
    value: bool,
}

/// The wires of a single emulator session.
#[derive(Clone, Debug)]
pub struct PinBank {
    wiring: WiringTable,
    ideal: Vec<IdealWire>,
}

impl PinBank {
    pub fn new(wiring: WiringTable) -> Self {
        Self { wiring, ideal: vec![] }
    }

    /// Resolve the wire for a pin identified by any of `labels`. Called once per pin when an
    /// emulator is constructed.
    pub fn connect(&mut self, labels: &[&str]) -> WireId {
        if let Some(button) = labels.iter().find_map(|label| self.wiring.get(*label)) {
            tracing::debug!("connecting {labels:?} to {button:?}");
            return WireId::Input(*button);
        }
        if let Some(id) =
            self.ideal.iter().position(|w| labels.iter().any(|l| w.labels.iter().any(|x| x == l)))
        {
            return WireId::Ideal(id);
        }
        self.ideal.push(IdealWire {
            labels: labels.iter().map(|l| l.to_string()).collect(),
            value: false,
        });
        WireId::Ideal(self.ideal.len() - 1)
    }

    /// Labels of the wire behind `id`.
    pub fn labels(&self, id: WireId) -> Vec<&str> {
        match id {
            WireId::Input(button) => self
                .wiring
                .iter()
                .filter(|(_, b)| **b == button)
                .map(|(label, _)| label.as_str())
                .collect(),
            WireId::Ideal(i) => self.ideal.get(i).map_or(vec![], |w| {
                w.labels.iter().map(|l| l.as_str()).collect()
            }),
        }
    }

    /// Returns every ideal wire to its power-on state.
    pub fn reset(&mut self) {
        self.ideal.iter_mut().for_each(|w| w.value = false);
    }
}

/// The view of the pins that an emulator gets for a single clock cycle.
pub struct PinIo<'a, 'b> {
    bank: &'a mut PinBank,
    input: &'a mut BitCursor<'b>,
}

impl<'a, 'b> PinIo<'a, 'b> {
    pub fn new(bank: &'a mut PinBank, input: &'a mut BitCursor<'b>) -> Self {
        Self { bank, input }
    }

    /// Read the level of a wire. Input wires consume one bit of input, and read low once the input
    /// is exhausted.
    pub fn read(&mut self, wire: WireId) -> bool {
        match wire {
            WireId::Input(_) => self.input.next_bit().unwrap_or(false),
            WireId::Ideal(i) => self.bank.ideal.get(i).map_or(false, |w| w.value),
        }
    }

    /// Drive a wire. Writes to input wires are ignored.
    pub fn write(&mut self, wire: WireId, value: bool) {
        if let WireId::Ideal(i) = wire {
            if let Some(w) = self.bank.ideal.get_mut(i) {
                w.value = value;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wiring_lookup() {
        let mut bank = PinBank::new(tinyboy_wiring());
        assert_eq!(bank.connect(&["PORTB1", "PB1"]), WireId::Input(Button::Up));
        assert_eq!(bank.connect(&["PB5"]), WireId::Input(Button::Right));

        let led = bank.connect(&["PB0", "LED"]);
        assert_eq!(led, WireId::Ideal(0));
        assert_eq!(bank.connect(&["LED"]), led);
        assert_eq!(bank.connect(&["PB2"]), WireId::Ideal(1));
        assert_eq!(bank.labels(led), vec!["PB0", "LED"]);
        assert_eq!(bank.labels(WireId::Input(Button::Down)), vec!["PB3"]);
    }

    #[test]
    fn input_wires_share_one_stream() {
        let mut bank = PinBank::new(tinyboy_wiring());
        let up = bank.connect(&["PB1"]);
        let left = bank.connect(&["PB4"]);
        let led = bank.connect(&["PB0"]);

        let bits = vec![true, false, true];
        let mut cursor = BitCursor::new(&bits);
        let mut io = PinIo::new(&mut bank, &mut cursor);
        assert!(io.read(up));
        assert!(!io.read(left));
        io.write(led, true);
        io.write(up, false);
        assert!(io.read(led));
        assert!(io.read(up));
        assert!(!io.read(up));
        assert!(!cursor.has_next());
        assert_eq!(cursor.position(), 3);

        bank.reset();
        let mut io = PinIo::new(&mut bank, &mut cursor);
        assert!(!io.read(led));
    }

    #[test]
    fn button_symbols() {
        for button in Button::ALL {
            assert_eq!(Button::from_symbol(button.symbol()), Some(button));
            assert_eq!(Button::from_line(button.line()), Some(button));
        }
        assert_eq!(Button::from_line(4), None);
        assert_eq!(Button::from_symbol('x'), None);
    }
}
