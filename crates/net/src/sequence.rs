/// Per-command 1-byte sequence tracking for the unreliable channel.
///
/// Each command id has its own pair of counters: the last byte accepted
/// from the peer and the next byte to stamp on an outgoing timed packet.
/// The value 0 means "untimed" and always passes validation; live
/// counters wrap from 255 back to 1.
#[derive(Debug)]
pub struct SequenceWindow {
    last_seen: [u8; 256],
    next_send: [u8; 256],
}

impl Default for SequenceWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceWindow {
    pub fn new() -> Self {
        Self {
            last_seen: [0; 256],
            next_send: [1; 256],
        }
    }

    /// Accepts `incoming` when it is ahead of the last recorded value
    /// within a half-circle of the mod-256 sequence space. Replays and
    /// reorders older than ~127 sends are rejected.
    pub fn is_valid(&self, command: u8, incoming: u8) -> bool {
        let last = self.last_seen[command as usize];
        incoming == 0
            || last == 0
            || (last < incoming && incoming - last < 128)
            || (incoming < last && last - incoming > 128)
    }

    pub fn record(&mut self, command: u8, incoming: u8) {
        if incoming != 0 {
            self.last_seen[command as usize] = incoming;
        }
    }

    /// Next outgoing sequence byte for `command`; never returns 0.
    pub fn next(&mut self, command: u8) -> u8 {
        let current = self.next_send[command as usize];
        let mut following = current.wrapping_add(1);
        if following == 0 {
            following = 1;
        }
        self.next_send[command as usize] = following;
        current
    }
}
