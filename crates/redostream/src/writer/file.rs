//! File sink.
//!
//! Text frames (JSON) are written line-delimited; binary frames
//! (protobuf) get an 8-byte little-endian length prefix. An empty output
//! path writes to stdout. With a positive `max-file-size` the output
//! rotates through numbered files (`<output>.0`, `<output>.1`, ...).

use crate::common::{Error, Result};
use crate::ring::Frame;
use crate::writer::Sink;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tracing::info;

enum Output {
    Stdout,
    File { writer: BufWriter<File>, written: u64 },
    Closed,
}

pub struct FileSink {
    path: Option<PathBuf>,
    max_file_size: u64,
    /// Length-prefixed binary framing instead of line-delimited text.
    binary: bool,
    file_num: u64,
    output: Output,
}

impl FileSink {
    pub fn new(path: Option<PathBuf>, max_file_size: u64, binary: bool) -> FileSink {
        FileSink { path, max_file_size, binary, file_num: 0, output: Output::Closed }
    }

    fn current_path(&self) -> Option<PathBuf> {
        let base = self.path.as_ref()?;
        if self.max_file_size > 0 {
            let mut name = base.as_os_str().to_os_string();
            name.push(format!(".{}", self.file_num));
            Some(PathBuf::from(name))
        } else {
            Some(base.clone())
        }
    }

    fn open(&mut self) -> Result<()> {
        let Some(path) = self.current_path() else {
            self.output = Output::Stdout;
            return Ok(());
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::io(10001, format!("file: {}", path.display()), e))?;
        let written = file
            .metadata()
            .map_err(|e| Error::io(10003, format!("file: {}", path.display()), e))?
            .len();
        info!(file = %path.display(), "output file opened");
        self.output = Output::File { writer: BufWriter::new(file), written };
        Ok(())
    }

    fn rotate_if_needed(&mut self, next_len: u64) -> Result<()> {
        if self.max_file_size == 0 {
            return Ok(());
        }
        let rotate = match &self.output {
            Output::File { written, .. } => *written + next_len > self.max_file_size,
            _ => false,
        };
        if rotate {
            self.flush_current()?;
            self.file_num += 1;
            self.open()?;
        }
        Ok(())
    }

    fn flush_current(&mut self) -> Result<()> {
        if let Output::File { writer, .. } = &mut self.output {
            writer.flush().map_err(|e| Error::io(10008, "output file", e))?;
        }
        Ok(())
    }
}

impl Sink for FileSink {
    fn kind(&self) -> &'static str {
        "file"
    }

    fn initialize(&mut self) -> Result<()> {
        self.open()
    }

    fn publish(&mut self, frame: &Frame) -> Result<()> {
        let prefix_len = if self.binary { 8 } else { 0 };
        let suffix_len = u64::from(!self.binary);
        self.rotate_if_needed(prefix_len + frame.payload.len() as u64 + suffix_len)?;

        match &mut self.output {
            Output::Stdout => {
                let stdout = std::io::stdout();
                let mut lock = stdout.lock();
                write_framed(&mut lock, frame, self.binary)?;
                lock.flush().map_err(|e| Error::io(10008, "stdout", e))?;
            }
            Output::File { writer, written } => {
                write_framed(writer, frame, self.binary)?;
                *written += prefix_len + frame.payload.len() as u64 + suffix_len;
            }
            Output::Closed => {
                return Err(Error::runtime(10004, "output file is not open"));
            }
        }
        Ok(())
    }

    fn confirm(&mut self, _frame: &Frame) -> Result<()> {
        self.flush_current()
    }
}

fn write_framed(out: &mut impl Write, frame: &Frame, binary: bool) -> Result<()> {
    let io_err = |e| Error::io(10006, "output write", e);
    if binary {
        out.write_all(&(frame.payload.len() as u64).to_le_bytes()).map_err(io_err)?;
        out.write_all(&frame.payload).map_err(io_err)?;
    } else {
        out.write_all(&frame.payload).map_err(io_err)?;
        out.write_all(b"\n").map_err(io_err)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Ctx, Scn};
    use crate::memory::ArenaConfig;
    use crate::ring::ring;
    use std::sync::Arc;
    use std::time::Duration;

    fn frame_with(ctx: &Arc<Ctx>, payload: &[u8]) -> Frame {
        let (mut producer, mut consumer) = ring(ctx, 0).unwrap();
        producer.begin(Scn(1), Scn(1), 0, 1, 0, 0).unwrap();
        producer.append(payload).unwrap();
        producer.commit().unwrap();
        consumer.poll(Duration::from_millis(50)).unwrap().unwrap()
    }

    fn test_ctx(dir: &std::path::Path) -> Arc<Ctx> {
        Ctx::new(
            ArenaConfig {
                chunks_min: 1,
                chunks_max: 8,
                chunks_swap: 0,
                read_buffer_min: 0,
                read_buffer_max: 8,
                write_buffer_min: 0,
                write_buffer_max: 8,
                unswap_buffer_min: 0,
            },
            dir.to_path_buf(),
            0,
            0,
            0,
        )
        .unwrap()
    }

    #[test]
    fn test_line_delimited_output() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        let path = dir.path().join("out.json");

        let mut sink = FileSink::new(Some(path.clone()), 0, false);
        sink.initialize().unwrap();
        let frame = frame_with(&ctx, b"{\"op\":\"c\"}");
        sink.publish(&frame).unwrap();
        sink.confirm(&frame).unwrap();

        let body = std::fs::read_to_string(&path).unwrap();
        assert_eq!(body, "{\"op\":\"c\"}\n");
    }

    #[test]
    fn test_binary_output_is_length_prefixed() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        let path = dir.path().join("out.bin");

        let mut sink = FileSink::new(Some(path.clone()), 0, true);
        sink.initialize().unwrap();
        let frame = frame_with(&ctx, b"abc");
        sink.publish(&frame).unwrap();
        sink.confirm(&frame).unwrap();

        let body = std::fs::read(&path).unwrap();
        assert_eq!(&body[..8], &3u64.to_le_bytes());
        assert_eq!(&body[8..], b"abc");
    }

    #[test]
    fn test_rotation_by_size() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        let base = dir.path().join("out.json");

        let mut sink = FileSink::new(Some(base.clone()), 16, false);
        sink.initialize().unwrap();
        for _ in 0..3 {
            let frame = frame_with(&ctx, b"0123456789");
            sink.publish(&frame).unwrap();
            sink.confirm(&frame).unwrap();
        }

        assert!(dir.path().join("out.json.0").exists());
        assert!(dir.path().join("out.json.1").exists());
        assert!(dir.path().join("out.json.2").exists());
    }
}
