//! Receive-side decoder for dot-stuffed DATA payloads.

/// Incremental decoder: removes the stuffing dot from lines that
/// start with `.` and stops at the terminating dot-on-a-line-by-
/// itself. Input bytes after the terminator are left unconsumed so
/// pipelined commands survive.
#[derive(Debug)]
pub struct DotDecoder {
    state: State,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    LineStart,
    SeenDot,
    SeenDotCr,
    MidLine,
}

impl DotDecoder {
    pub fn new() -> Self {
        Self {
            state: State::LineStart,
        }
    }

    /// Decode as much of `input` as possible, appending body bytes to
    /// `out`. Returns how many input bytes were consumed and whether
    /// the terminator was seen. Both CRLF and bare-LF line endings
    /// are accepted.
    pub fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) -> (usize, bool) {
        let mut i = 0;
        while i < input.len() {
            let b = input[i];
            match self.state {
                State::LineStart => match b {
                    b'.' => {
                        self.state = State::SeenDot;
                        i += 1;
                    }
                    b'\n' => {
                        out.push(b);
                        i += 1;
                    }
                    _ => {
                        self.state = State::MidLine;
                    }
                },
                State::SeenDot => match b {
                    b'\r' => {
                        self.state = State::SeenDotCr;
                        i += 1;
                    }
                    b'\n' => {
                        return (i + 1, true);
                    }
                    _ => {
                        // the dot was stuffing; drop it
                        self.state = State::MidLine;
                    }
                },
                State::SeenDotCr => match b {
                    b'\n' => {
                        return (i + 1, true);
                    }
                    _ => {
                        // not a terminator after all: the dot was
                        // stuffing and the CR is content
                        out.push(b'\r');
                        self.state = State::MidLine;
                    }
                },
                State::MidLine => match memchr::memchr(b'\n', &input[i..]) {
                    Some(pos) => {
                        out.extend_from_slice(&input[i..i + pos + 1]);
                        i += pos + 1;
                        self.state = State::LineStart;
                    }
                    None => {
                        out.extend_from_slice(&input[i..]);
                        i = input.len();
                    }
                },
            }
        }
        (i, false)
    }
}

impl Default for DotDecoder {
    fn default() -> Self {
        Self::new()
    }
}
