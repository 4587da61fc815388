//! Output sinks shared by printers and test contexts

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

/// Where human-readable session output goes
#[derive(Debug, Clone)]
pub enum Output {
    /// Process stdout
    Stdout,
    /// Process stderr
    Stderr,
    /// In-memory capture
    Buffer(Arc<Mutex<Vec<u8>>>),
}

impl Output {
    /// Fresh in-memory capture
    pub fn buffer() -> Self {
        Output::Buffer(Arc::default())
    }

    /// Captured text so far (empty for stdout/stderr)
    pub fn captured(&self) -> String {
        match self {
            Output::Buffer(buf) => {
                let bytes = buf.lock().unwrap_or_else(|e| e.into_inner());
                String::from_utf8_lossy(&bytes).into_owned()
            }
            _ => String::new(),
        }
    }
}

impl Write for Output {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match self {
            Output::Stdout => io::stdout().lock().write(data),
            Output::Stderr => io::stderr().lock().write(data),
            Output::Buffer(buf) => {
                let mut bytes = buf.lock().unwrap_or_else(|e| e.into_inner());
                bytes.extend_from_slice(data);
                Ok(data.len())
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Output::Stdout => io::stdout().flush(),
            Output::Stderr => io::stderr().flush(),
            Output::Buffer(_) => Ok(()),
        }
    }
}
