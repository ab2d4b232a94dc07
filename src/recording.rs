//! Ray frame recordings: a plain sequence of bincode-encoded `RayFrame`s.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::intake::RayFrame;

pub struct FrameRecorder<W: Write> {
    writer: W,
    frames: u64,
}

impl FrameRecorder<BufWriter<File>> {
    /// Creates `<dir>/rays_<timestamp>.rec`.
    pub fn create_in<P: AsRef<Path>>(dir: P) -> Result<(Self, PathBuf)> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let ts = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let path = dir.join(format!("rays_{}.rec", ts));
        let file = File::create(&path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        Ok((Self::new(BufWriter::new(file)), path))
    }
}

impl<W: Write> FrameRecorder<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, frames: 0 }
    }

    pub fn record(&mut self, frame: &RayFrame) -> Result<()> {
        bincode::serialize_into(&mut self.writer, frame)?;
        self.writer.flush()?;
        self.frames += 1;
        Ok(())
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Reads every frame until a clean end of input.
pub fn read_frames<R: Read>(reader: R) -> Result<Vec<RayFrame>> {
    let mut reader = BufReader::new(reader);
    let mut frames = Vec::new();
    while !reader.fill_buf()?.is_empty() {
        let frame: RayFrame = bincode::deserialize_from(&mut reader)
            .with_context(|| format!("corrupt recording at frame {}", frames.len()))?;
        frames.push(frame);
    }
    Ok(frames)
}

pub fn load_recording<P: AsRef<Path>>(path: P) -> Result<Vec<RayFrame>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    read_frames(file)
}
