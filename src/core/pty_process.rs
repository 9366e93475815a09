use std::io::{Read, Write};
use std::sync::Mutex;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};

use super::error::PtyError;

/// Stateful UTF-8 decoder that handles split multi-byte sequences.
///
/// Reading from a PTY in fixed-size chunks can split a multi-byte UTF-8
/// character (emoji, CJK, box-drawing glyphs) across a chunk boundary.
/// Naively decoding each chunk independently replaces the incomplete
/// trailing bytes with U+FFFD, garbling output. This decoder buffers any
/// incomplete trailing sequence and prepends it to the next chunk.
pub(crate) struct Utf8Decoder {
    incomplete: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self {
            incomplete: Vec::with_capacity(4),
        }
    }

    /// Decodes bytes, buffering any incomplete trailing sequence for the
    /// next call. Invalid (non-incomplete) byte sequences are replaced
    /// lossily rather than aborting decoding.
    pub fn decode(&mut self, input: &[u8]) -> String {
        let mut data = std::mem::take(&mut self.incomplete);
        data.extend_from_slice(input);

        let valid_up_to = Self::find_valid_boundary(&data);
        if valid_up_to < data.len() {
            self.incomplete = data[valid_up_to..].to_vec();
        }

        String::from_utf8(data[..valid_up_to].to_vec())
            .unwrap_or_else(|_| String::from_utf8_lossy(&data[..valid_up_to]).into_owned())
    }

    fn find_valid_boundary(data: &[u8]) -> usize {
        match std::str::from_utf8(data) {
            Ok(_) => data.len(),
            Err(e) => {
                let valid = e.valid_up_to();
                if e.error_len().is_none() {
                    valid // incomplete sequence at the end — buffer it
                } else {
                    valid + e.error_len().unwrap_or(1)
                }
            }
        }
    }
}

/// One child shell attached to one PTY master.
///
/// `writer`, `master`, and `reader` are `std::sync::Mutex`-guarded rather
/// than `tokio::sync::Mutex`-guarded because every critical section here is
/// a short, synchronous syscall — exactly the teacher's convention in
/// `process_manager.rs`. `reader` is locked exactly once, by the dedicated
/// output-pump thread that owns it for the session's lifetime.
pub struct PtyProcess {
    writer: Mutex<Box<dyn Write + Send>>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    reader: Mutex<Box<dyn Read + Send>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    pid: i32,
}

impl PtyProcess {
    /// Allocates a PTY pair and execs the user's shell (`$SHELL`, default
    /// `/bin/bash`) as its child, with the working directory set from
    /// `$HOME` when present. Returns the parent-side handle; the slave is
    /// dropped once the child has it open, keeping the PTY alive on the
    /// master alone.
    pub fn spawn() -> Result<Self, PtyError> {
        let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string());
        let mut cmd = CommandBuilder::new(&shell);
        if let Ok(home) = std::env::var("HOME") {
            cmd.cwd(home);
        }
        Self::spawn_command(cmd)
    }

    /// Allocates a PTY pair and execs an arbitrary command as its child —
    /// the shared path behind `spawn()`, also used by tests that need a
    /// specific child program (e.g. a no-echo `cat`) instead of `$SHELL`.
    pub(crate) fn spawn_command(cmd: CommandBuilder) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::SpawnFailed(format!("failed to open pty: {e}")))?;

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::SpawnFailed(format!("failed to spawn shell: {e}")))?;

        let pid = child
            .process_id()
            .map(|pid| pid as i32)
            .ok_or_else(|| PtyError::SpawnFailed("could not obtain child pid".to_string()))?;

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::SpawnFailed(format!("failed to take pty writer: {e}")))?;

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::SpawnFailed(format!("failed to clone pty reader: {e}")))?;

        drop(pair.slave);

        Ok(Self {
            writer: Mutex::new(writer),
            master: Mutex::new(pair.master),
            reader: Mutex::new(reader),
            child: Mutex::new(child),
            pid,
        })
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Blocks until data is available on the master and returns it, or
    /// returns [`PtyError::PtyClosed`] once the slave is closed and
    /// drained (a zero-length read). Intended to be called only from the
    /// dedicated output-pump thread.
    pub fn read_chunk(&self, max_bytes: usize) -> Result<Vec<u8>, PtyError> {
        let mut buf = vec![0u8; max_bytes];
        let mut reader = self
            .reader
            .lock()
            .map_err(|e| PtyError::WriteFailed(format!("reader lock poisoned: {e}")))?;
        loop {
            match reader.read(&mut buf) {
                Ok(0) => return Err(PtyError::PtyClosed),
                Ok(n) => return Ok(buf[..n].to_vec()),
                Err(e) => {
                    #[cfg(unix)]
                    {
                        let raw = e.raw_os_error().unwrap_or(0);
                        if raw == libc::EAGAIN || raw == libc::EINTR {
                            continue;
                        }
                    }
                    return Err(PtyError::PtyClosed);
                }
            }
        }
    }

    /// Writes bytes to the master, retrying on partial writes.
    pub fn write(&self, bytes: &[u8]) -> Result<(), PtyError> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|e| PtyError::WriteFailed(format!("writer lock poisoned: {e}")))?;
        writer
            .write_all(bytes)
            .map_err(|e| PtyError::WriteFailed(format!("write failed: {e}")))?;
        writer
            .flush()
            .map_err(|e| PtyError::WriteFailed(format!("flush failed: {e}")))
    }

    /// Issues a window-size update (`TIOCSWINSZ` equivalent). Non-positive
    /// dimensions are rejected rather than forwarded to the PTY.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        if rows == 0 || cols == 0 {
            return Err(PtyError::BadArgument(format!(
                "rows and cols must be positive, got rows={rows} cols={cols}"
            )));
        }

        let master = self
            .master
            .lock()
            .map_err(|e| PtyError::ResizeFailed(format!("master lock poisoned: {e}")))?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::ResizeFailed(format!("resize failed: {e}")))
    }

    /// Sends a UNIX signal directly to the child PID.
    ///
    /// The teacher's `kill_session` signals the child's *process group*
    /// (negative PGID) so an entire job-control tree dies together; this
    /// daemon instead signals the child PID directly, per the spec's
    /// `signal(sig)` contract (§4.1) — a deliberate narrowing, not an
    /// oversight.
    pub fn signal(&self, sig: i32) -> Result<(), PtyError> {
        let result = unsafe { libc::kill(self.pid, sig) };
        if result != 0 {
            return Err(PtyError::SignalFailed(std::io::Error::last_os_error().to_string()));
        }
        Ok(())
    }

    /// Blocks until the child is reaped. Intended to be called once, from
    /// the dedicated reaper thread, off the async runtime via
    /// `spawn_blocking`.
    pub fn wait(&self) -> Result<(), PtyError> {
        let mut child = self
            .child
            .lock()
            .map_err(|e| PtyError::WriteFailed(format!("child lock poisoned: {e}")))?;
        child
            .wait()
            .map_err(|e| PtyError::WriteFailed(format!("waitpid failed: {e}")))?;
        Ok(())
    }

    /// Reads back the master's current window size (`TIOCGWINSZ`
    /// equivalent). Test-only — production code has no need to read back
    /// what it just set.
    #[cfg(test)]
    fn size(&self) -> Result<PtySize, PtyError> {
        let master = self
            .master
            .lock()
            .map_err(|e| PtyError::ResizeFailed(format!("master lock poisoned: {e}")))?;
        master
            .get_size()
            .map_err(|e| PtyError::ResizeFailed(format!("get_size failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_whole_chunk() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode("hello".as_bytes()), "hello");
    }

    #[test]
    fn buffers_split_multibyte_sequence_across_reads() {
        let mut decoder = Utf8Decoder::new();
        let bytes = "â".as_bytes(); // 0xC3 0xA2 — a 2-byte UTF-8 sequence
        assert_eq!(bytes.len(), 2);

        assert_eq!(decoder.decode(&bytes[..1]), "");
        assert_eq!(decoder.decode(&bytes[1..]), "â");
    }

    #[test]
    fn invalid_byte_is_replaced_not_buffered_forever() {
        let mut decoder = Utf8Decoder::new();
        let text = decoder.decode(&[0xff, b'h', b'i']);
        assert!(text.ends_with("hi"));
    }

    /// §8: "r{rows:R,cols:C} followed by reading the winsize of the PTY
    /// yields (R,C)".
    #[test]
    fn resize_then_readback_yields_same_dimensions() {
        let mut cmd = CommandBuilder::new("/bin/sh");
        cmd.arg("-c");
        cmd.arg("exec cat");
        let pty = PtyProcess::spawn_command(cmd).expect("spawn cat");

        pty.resize(40, 120).expect("resize");
        let size = pty.size().expect("read back size");
        assert_eq!((size.rows, size.cols), (40, 120));
    }

    #[test]
    fn resize_rejects_non_positive_dimensions() {
        let mut cmd = CommandBuilder::new("/bin/sh");
        cmd.arg("-c");
        cmd.arg("exec cat");
        let pty = PtyProcess::spawn_command(cmd).expect("spawn cat");

        assert!(matches!(pty.resize(0, 80), Err(PtyError::BadArgument(_))));
        assert!(matches!(pty.resize(24, 0), Err(PtyError::BadArgument(_))));
    }

    /// §8: "Sending k<bytes> to the PTY produces equal bytes on the PTY
    /// master-read side for a no-echo shell variant used in tests (use
    /// `stty -echo`)." `stty -echo; exec cat` disables the line
    /// discipline's echo and then reflects stdin to stdout verbatim, so
    /// whatever is written to the master is read back unchanged.
    #[test]
    fn write_then_read_round_trips_on_noecho_cat() {
        let mut cmd = CommandBuilder::new("/bin/sh");
        cmd.arg("-c");
        cmd.arg("stty -echo; exec cat");
        let pty = PtyProcess::spawn_command(cmd).expect("spawn no-echo cat");

        // Give `stty -echo` time to take effect before writing the payload.
        std::thread::sleep(std::time::Duration::from_millis(200));

        let payload = b"round-trip-check\n";
        pty.write(payload).expect("write");

        let mut collected = Vec::new();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while collected.len() < payload.len() && std::time::Instant::now() < deadline {
            let chunk = pty.read_chunk(1024).expect("read_chunk");
            collected.extend_from_slice(&chunk);
        }

        assert_eq!(collected, payload);
    }
}
