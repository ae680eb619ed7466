//! Output capture and sink fan-out.

use std::io::Write;
use std::sync::{Arc, Mutex};

use crate::SharedSink;

/// Thread-safe accumulator for a command's combined output. Cloning shares
/// the underlying buffer, so a capture can be handed to stream copiers as a
/// sink and read back afterwards.
#[derive(Clone, Default)]
pub struct CaptureBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl CaptureBuffer {
    pub fn new() -> CaptureBuffer {
        CaptureBuffer::default()
    }

    /// View of this buffer usable wherever a live sink is expected.
    pub fn sink(&self) -> SharedSink {
        let sink: SharedSink = self.inner.clone();
        sink
    }

    pub fn contents(&self) -> Vec<u8> {
        self.inner.lock().map(|b| b.clone()).unwrap_or_default()
    }

    pub fn into_string(self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }
}

/// Writer that fans every byte out to a set of sinks, de-duplicated by
/// pointer identity. The stage executor hands the console writer in as
/// both the stdout and the stderr sink; without de-duplication every byte
/// would hit the terminal twice.
pub struct Fanout {
    sinks: Vec<SharedSink>,
}

impl Fanout {
    pub fn new(candidates: Vec<Option<SharedSink>>) -> Fanout {
        let mut sinks: Vec<SharedSink> = Vec::with_capacity(candidates.len());
        for candidate in candidates.into_iter().flatten() {
            if !sinks.iter().any(|s| Arc::ptr_eq(s, &candidate)) {
                sinks.push(candidate);
            }
        }
        Fanout { sinks }
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl Write for Fanout {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        for sink in &self.sinks {
            if let Ok(mut writer) = sink.lock() {
                let _ = writer.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        for sink in &self.sinks {
            if let Ok(mut writer) = sink.lock() {
                let _ = writer.flush();
            }
        }
        Ok(())
    }
}
