//! Buffer of newline-delimited profiling records, optionally flushed to a
//! file. No simulation recovery information is persisted.

use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

/// Accumulates profiling records and writes them out on request or drop.
#[derive(Debug, Default)]
pub struct ProfilerBuffer {
    buffer: Vec<String>,
    output: Option<PathBuf>,
    append: bool,
}

impl ProfilerBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the output file. With `append` false the file is truncated on the
    /// first write.
    pub fn set_output_file(&mut self, path: impl AsRef<Path>, append: bool) {
        self.output = Some(path.as_ref().to_owned());
        self.append = append;
    }

    pub fn add_entry(&mut self, entry: impl Into<String>) {
        self.buffer.push(entry.into());
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Write buffered records to the output file, one per line, and clear
    /// the buffer.
    pub fn write_file(&mut self) -> std::io::Result<()> {
        let Some(path) = &self.output else {
            return Ok(());
        };
        if self.buffer.is_empty() {
            return Ok(());
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(self.append)
            .truncate(!self.append)
            .open(path)?;
        for entry in &self.buffer {
            writeln!(file, "{entry}")?;
        }
        // Subsequent writes extend the same file.
        self.append = true;
        self.buffer.clear();
        Ok(())
    }
}

impl Drop for ProfilerBuffer {
    fn drop(&mut self) {
        if let Err(err) = self.write_file() {
            tracing::warn!("failed to flush profiler buffer: {err}");
        }
    }
}
