//! Side-channel framing: plain bytes terminated by the literal `<EOF>`.

/// Frame terminator on the side channel.
pub const FRAME_DELIMITER: &[u8] = b"<EOF>";

/// Size of a single socket read.
pub const READ_CHUNK_SIZE: usize = 1024;

/// Default cap on buffered bytes for a frame that has not terminated yet.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Debug, PartialEq, Eq)]
pub enum FrameError {
    /// The pending frame grew past the cap; the buffer was discarded.
    FrameTooLarge { len: usize, max: usize },
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FrameTooLarge { len, max } => {
                write!(f, "frame too large: {len} bytes buffered (max {max})")
            },
        }
    }
}

impl std::error::Error for FrameError {}

/// Accumulates reads until a delimiter arrives.
///
/// Each completed frame includes its `<EOF>`. Bytes after a delimiter stay
/// buffered as the start of the next frame.
#[derive(Debug)]
pub struct FrameAccumulator {
    buf: Vec<u8>,
    max_len: usize,
    /// Where the next delimiter search resumes.
    scan_from: usize,
}

impl Default for FrameAccumulator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl FrameAccumulator {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: Vec::with_capacity(READ_CHUNK_SIZE),
            max_len: max_len.max(FRAME_DELIMITER.len()),
            scan_from: 0,
        }
    }

    /// Append `chunk` and drain every frame it completes, in stream order.
    ///
    /// The cap covers whole frames, delimiter included. A completed frame over
    /// it comes back as `FrameTooLarge` in its slot, and so does an
    /// unterminated tail that outgrows it (the tail is discarded).
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<Vec<u8>, FrameError>> {
        self.buf.extend_from_slice(chunk);

        let mut out = Vec::new();
        while let Some(pos) = find_delimiter(&self.buf, self.scan_from) {
            let end = pos + FRAME_DELIMITER.len();
            self.scan_from = 0;
            if end > self.max_len {
                self.buf.drain(..end);
                out.push(Err(FrameError::FrameTooLarge {
                    len: end,
                    max: self.max_len,
                }));
            } else {
                out.push(Ok(self.buf.drain(..end).collect()));
            }
        }
        // The delimiter may straddle the next read.
        self.scan_from = self.buf.len().saturating_sub(FRAME_DELIMITER.len() - 1);

        if self.buf.len() > self.max_len {
            let len = self.buf.len();
            self.clear();
            out.push(Err(FrameError::FrameTooLarge {
                len,
                max: self.max_len,
            }));
        }
        out
    }

    /// Bytes of the frame still waiting for its delimiter.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.scan_from = 0;
    }
}

fn find_delimiter(haystack: &[u8], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(FRAME_DELIMITER.len())
        .position(|w| w == FRAME_DELIMITER)
        .map(|p| p + from)
}
