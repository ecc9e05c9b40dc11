//! The control protocol: request assembly and the framed response writer.
//!
//! Requests arrive as a sequence of non-empty lines terminated by a blank
//! line; a trailing backslash continues a line onto the next. Responses are
//! `begin <id>` / payload / `end <id> <status>` envelopes, out-of-band
//! `%output`/`%autopoll`/`%terminate` events, or a fatal `abort <reason>`.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// Base64 is wrapped at this many characters per output line.
const BASE64_WRAP_COLS: usize = 128;

/// Accumulates the argument lines of one request, honoring `\`-continuation.
///
/// A request is terminated by a blank line; [`feed`](Self::feed) returns the
/// completed argument list at that point and resets for the next request.
#[derive(Default)]
pub struct RequestAccumulator {
    args: Vec<String>,
}

impl RequestAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one line (already stripped of its trailing `\n`). Returns the
    /// completed argument list once a blank line is seen.
    pub fn feed(&mut self, line: &str) -> Option<Vec<String>> {
        if line.is_empty() {
            return Some(std::mem::take(&mut self.args));
        }
        match self.args.last_mut() {
            Some(prev) if prev.ends_with('\\') => {
                prev.pop();
                prev.push_str(line);
            }
            _ => self.args.push(line.to_string()),
        }
        None
    }
}

/// The agent's single outbound writer.
///
/// Every emitted line goes through [`send_lines`](Self::send_lines), which
/// enforces two invariants: a single call's lines are written atomically
/// under one `Mutex` acquisition — load-bearing for [`output`](Self::output)
/// and [`autopoll`](Self::autopoll), whose multi-line envelopes are produced
/// from the read pump's OS thread and the autopoll tick concurrently with
/// the mainloop's own `begin`/`end` writes — and once quitting is latched no
/// further line is written, including events racing in from background
/// tasks.
pub struct Writer {
    out: Mutex<Box<dyn Write + Send>>,
    quitting: AtomicBool,
}

impl Writer {
    pub fn new(out: Box<dyn Write + Send>) -> Arc<Self> {
        Arc::new(Self {
            out: Mutex::new(out),
            quitting: AtomicBool::new(false),
        })
    }

    pub fn is_quitting(&self) -> bool {
        self.quitting.load(Ordering::Acquire)
    }

    /// Latches the squelch. Irreversible for the lifetime of the agent.
    pub fn set_quitting(&self) {
        self.quitting.store(true, Ordering::Release);
    }

    fn send_line(&self, line: &str) {
        self.send_lines(std::iter::once(line));
    }

    /// Writes every line in `lines` while holding the output lock for the
    /// whole call, so a multi-line envelope (`%output`/`%autopoll`) can
    /// never be interleaved with a line from a concurrent writer — the read
    /// pump's OS thread and the mainloop both reach this through the same
    /// `Writer`, and only one `send_lines` call owns the lock at a time.
    fn send_lines<'a>(&self, lines: impl Iterator<Item = &'a str>) {
        if self.is_quitting() {
            log::debug!("[squelched envelope]");
            return;
        }
        let mut out = match self.out.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for line in lines {
            log::debug!("> {line}");
            if let Err(e) = writeln!(out, "{line}") {
                log::warn!("write to client failed: {e}");
                return;
            }
        }
        if let Err(e) = out.flush() {
            log::warn!("flush to client failed: {e}");
        }
    }

    pub fn begin(&self, id: u64) {
        self.send_line(&format!("begin {id}"));
    }

    pub fn end(&self, id: u64, status: i32) {
        self.send_line(&format!("end {id} {status}"));
    }

    /// Emits `abort <reason>`. The caller is responsible for exiting the
    /// process with a non-zero status immediately afterward.
    pub fn abort(&self, reason: &str) {
        self.send_line(&format!("abort {reason}"));
    }

    /// A single payload line between `begin`/`end` (e.g. a spawned pid, or
    /// one line of a `poll` diff).
    pub fn payload(&self, line: impl AsRef<str>) {
        self.send_line(line.as_ref());
    }

    pub fn terminate(&self, pid: i32, return_code: i32) {
        self.send_line(&format!("%terminate {pid} {return_code}"));
    }

    /// Emits one `%output <id> <pid> <channel>` / base64 lines / `%end <id>`
    /// envelope for a single chunk of child output, as a single atomic
    /// write under one lock acquisition so no other writer's line can land
    /// inside it.
    pub fn output(&self, id: u64, pid: i32, channel: i32, data: &[u8]) {
        let header = format!("%output {id} {pid} {channel}");
        let encoded = BASE64.encode(data);
        let footer = format!("%end {id}");
        let body: Vec<&str> = wrap_ascii(&encoded, BASE64_WRAP_COLS).collect();
        self.send_lines(
            std::iter::once(header.as_str())
                .chain(body)
                .chain(std::iter::once(footer.as_str())),
        );
    }

    /// Emits one `%autopoll <id>` / diff lines / `%end <id>` envelope, as a
    /// single atomic write under one lock acquisition.
    pub fn autopoll(&self, id: u64, diff: &[String]) {
        let header = format!("%autopoll {id}");
        let footer = format!("%end {id}");
        self.send_lines(
            std::iter::once(header.as_str())
                .chain(diff.iter().map(String::as_str))
                .chain(std::iter::once(footer.as_str())),
        );
    }
}

/// Splits an ASCII string into `width`-character chunks without allocating
/// per chunk.
fn wrap_ascii(s: &str, width: usize) -> impl Iterator<Item = &str> {
    let bytes = s.as_bytes();
    (0..bytes.len()).step_by(width).map(move |i| {
        let end = (i + width).min(bytes.len());
        std::str::from_utf8(&bytes[i..end]).expect("base64 alphabet is ASCII")
    })
}
