//! Channel-keyed output accumulation.
//!
//! Every piece of program output lands in a named channel; the host sees
//! a complete map of non-empty channels at each flush. Channel names are
//! four ASCII characters packed into a big-endian word.

use indexmap::IndexMap;

/// A four-character channel identifier, stored as the packed word the
/// program uses to select it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u32);

impl ChannelId {
    pub const MAIN: ChannelId = ChannelId::from_name(b"MAIN");

    pub const fn from_name(name: &[u8; 4]) -> ChannelId {
        ChannelId(u32::from_be_bytes(*name))
    }

    /// The four-character name, with non-printing bytes shown as '?'.
    pub fn name(&self) -> String {
        self.0
            .to_be_bytes()
            .iter()
            .map(|&b| {
                if (0x20..0x7F).contains(&b) {
                    b as char
                } else {
                    '?'
                }
            })
            .collect()
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// The flush result delivered to the host: channel -> accumulated text,
/// in the order the channels first received output.
pub type ChannelOutput = IndexMap<ChannelId, String>;

/// Multi-channel text accumulator.
pub struct OutputBuffer {
    channels: IndexMap<ChannelId, String>,
    current: ChannelId,
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputBuffer {
    pub fn new() -> OutputBuffer {
        OutputBuffer {
            channels: IndexMap::new(),
            current: ChannelId::MAIN,
        }
    }

    pub fn current(&self) -> ChannelId {
        self.current
    }

    /// Select the channel subsequent writes go to. Selecting a non-MAIN
    /// channel discards whatever that channel had accumulated; MAIN
    /// accumulates across turns until flushed.
    pub fn select(&mut self, id: ChannelId) {
        if id != ChannelId::MAIN {
            self.channels.insert(id, String::new());
        }
        self.current = id;
    }

    pub fn write_char(&mut self, ch: char) {
        self.channels.entry(self.current).or_default().push(ch);
    }

    pub fn write_str(&mut self, s: &str) {
        self.channels.entry(self.current).or_default().push_str(s);
    }

    /// Write to a specific channel without changing the selection.
    pub fn write_char_to(&mut self, id: ChannelId, ch: char) {
        self.channels.entry(id).or_default().push(ch);
    }

    pub fn write_str_to(&mut self, id: ChannelId, s: &str) {
        self.channels.entry(id).or_default().push_str(s);
    }

    /// Take every non-empty channel's text, leaving all channels empty.
    pub fn flush(&mut self) -> ChannelOutput {
        let mut out = IndexMap::new();
        for (id, text) in self.channels.iter_mut() {
            if !text.is_empty() {
                out.insert(*id, std::mem::take(text));
            }
        }
        out
    }
}
