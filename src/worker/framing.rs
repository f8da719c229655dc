//! Transaction-state tracking over the backend byte stream.
//!
//! The relay forwards backend bytes verbatim, one read at a time, so message
//! boundaries land anywhere: a read may hold many messages, a fraction of
//! one, or end inside a header. The tracker reconstructs the framing across
//! reads without buffering message bodies and keeps two facts current:
//! whether the last ReadyForQuery reported a live transaction, and how many
//! bytes of a split message are still owed by the next read.

/// Bytes needed to act on a header: tag, length, and for ReadyForQuery the
/// transaction-state byte right after it.
const HEADER_LEN: usize = 5;
const READY_FOR_QUERY_PREFIX: usize = 6;

#[derive(Debug, Default)]
pub struct FramingTracker {
    /// Transaction state reported by the last ReadyForQuery seen.
    in_tx: bool,

    /// Bytes remaining of a message whose header was already consumed.
    /// The next read's first `next_message` bytes are body continuation and
    /// must not be parsed as a header.
    next_message: usize,

    /// Stash for a header that was itself split across reads.
    header: [u8; READY_FOR_QUERY_PREFIX],
    header_len: usize,
}

impl FramingTracker {
    pub fn new() -> FramingTracker {
        FramingTracker::default()
    }

    #[inline(always)]
    pub fn in_tx(&self) -> bool {
        self.in_tx
    }

    /// True when the next byte to arrive starts a fresh message. Callers use
    /// this before `scan` to decide whether a buffer's first byte is a tag.
    #[inline(always)]
    pub fn at_message_boundary(&self) -> bool {
        self.next_message == 0 && self.header_len == 0
    }

    /// How many header bytes must be stashed before the current message can
    /// be acted on. ReadyForQuery needs one byte beyond the plain header.
    fn header_want(&self) -> usize {
        if self.header[0] == b'Z' {
            READY_FOR_QUERY_PREFIX
        } else {
            HEADER_LEN
        }
    }

    /// Advance over one backend read. Returns true when at least one
    /// ReadyForQuery transaction-state byte was consumed during this read;
    /// the relay uses that as the signal that a reply cycle finished.
    pub fn scan(&mut self, buf: &[u8]) -> bool {
        let len = buf.len();
        let mut offset = 0usize;
        let mut saw_ready = false;

        while offset < len {
            // Tail of a message that started in an earlier read.
            if self.next_message > 0 {
                let consumed = self.next_message.min(len - offset);
                self.next_message -= consumed;
                offset += consumed;
                continue;
            }

            // Finish a header whose first bytes arrived in an earlier read.
            if self.header_len > 0 {
                let take = (self.header_want() - self.header_len).min(len - offset);
                self.header[self.header_len..self.header_len + take]
                    .copy_from_slice(&buf[offset..offset + take]);
                self.header_len += take;
                offset += take;
                if self.header_len < self.header_want() {
                    return saw_ready;
                }

                let message_len = i32::from_be_bytes([
                    self.header[1],
                    self.header[2],
                    self.header[3],
                    self.header[4],
                ]) as usize;
                if self.header[0] == b'Z' {
                    self.in_tx = self.header[5] != b'I';
                    saw_ready = true;
                }
                let seen = self.header_len;
                self.header_len = 0;
                self.next_message = (1 + message_len).saturating_sub(seen);
                continue;
            }

            // A header that does not fit this read goes to the stash.
            let avail = len - offset;
            if avail < HEADER_LEN || (buf[offset] == b'Z' && avail < READY_FOR_QUERY_PREFIX) {
                self.header[..avail].copy_from_slice(&buf[offset..len]);
                self.header_len = avail;
                return saw_ready;
            }

            let tag = buf[offset];
            let message_len = i32::from_be_bytes([
                buf[offset + 1],
                buf[offset + 2],
                buf[offset + 3],
                buf[offset + 4],
            ]) as usize;

            // The Z message tells us the transaction state.
            if tag == b'Z' {
                self.in_tx = buf[offset + 5] != b'I';
                saw_ready = true;
            }

            // The length field counts itself but not the tag byte.
            let total = 1 + message_len;
            if offset + total <= len {
                offset += total;
            } else {
                self.next_message = total - (len - offset);
                offset = len;
            }
        }

        saw_ready
    }
}
