use tinyboy_avr::pins::{BitList, Button};

/// A single pulse: the input line held for the duration of the pulse, if any.
pub type Pulse = Option<u8>;

/// A sequence of button pulses, encoded as a bit stream for the input lines.
///
/// Every pulse occupies `width * lines` bits: for each of the `width` cycles of the pulse, one bit
/// for every line in line order. Within a pulse, only the bits of the pressed line are set.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PulseSequence {
    pulses: Vec<Pulse>,
    width: usize,
    lines: usize,
}

impl PulseSequence {
    pub fn new(width: usize, lines: usize) -> Self {
        Self::from_pulses(vec![], width, lines)
    }

    pub fn from_pulses(pulses: Vec<Pulse>, width: usize, lines: usize) -> Self {
        assert!(width > 0 && lines > 0, "pulse sequences need a non-zero width and line count");
        Self { pulses, width, lines }
    }

    pub fn from_buttons(
        buttons: impl IntoIterator<Item = Option<Button>>,
        width: usize,
        lines: usize,
    ) -> Self {
        let pulses = buttons.into_iter().map(|b| b.map(Button::line)).collect();
        Self::from_pulses(pulses, width, lines)
    }

    /// Parses the format produced by the `Display` implementation, e.g. `UU_L`.
    pub fn parse(text: &str, width: usize, lines: usize) -> anyhow::Result<Self> {
        let pulses = text
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| match c {
                '_' => Ok(None),
                c => Button::from_symbol(c)
                    .map(|b| Some(b.line()))
                    .ok_or_else(|| anyhow::format_err!("invalid pulse: {c:?}")),
            })
            .collect::<anyhow::Result<_>>()?;
        Ok(Self::from_pulses(pulses, width, lines))
    }

    /// Returns a new sequence with `pulse` added to the end.
    #[must_use]
    pub fn append(&self, pulse: Pulse) -> Self {
        self.append_all(std::iter::once(pulse))
    }

    /// Returns a new sequence with `pulses` added to the end.
    #[must_use]
    pub fn append_all(&self, pulses: impl IntoIterator<Item = Pulse>) -> Self {
        let mut new = self.clone();
        new.pulses.extend(pulses);
        new
    }

    /// The number of pulses in the sequence.
    pub fn len(&self) -> usize {
        self.pulses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pulses.is_empty()
    }

    pub fn pulses(&self) -> &[Pulse] {
        &self.pulses
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn lines(&self) -> usize {
        self.lines
    }

    /// Renders every bit of the sequence as `0` or `1`.
    pub fn to_bit_string(&self) -> String {
        (0..self.size()).map(|i| if self.get(i) { '1' } else { '0' }).collect()
    }
}

impl BitList for PulseSequence {
    fn size(&self) -> usize {
        self.pulses.len() * self.width * self.lines
    }

    fn get(&self, index: usize) -> bool {
        let pulse = index / (self.width * self.lines);
        let line = index % self.lines;
        matches!(self.pulses.get(pulse), Some(Some(x)) if *x as usize == line)
    }
}

impl std::fmt::Display for PulseSequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for pulse in &self.pulses {
            let symbol = match pulse {
                None => '_',
                Some(line) => match Button::from_line(*line) {
                    Some(button) => button.symbol(),
                    None => char::from_digit(*line as u32, 36).unwrap_or('?'),
                },
            };
            write!(f, "{symbol}")?;
        }
        Ok(())
    }
}
