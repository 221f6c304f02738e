//! Rotating zstd-compressed JSON-line part streams.
//!
//! Each dataset appends to `part-NNN.jsonl.zst`, rolling to the next part
//! when the uncompressed footprint crosses the rotation threshold. A part
//! file is a concatenation of zstd frames: `flush_sync` finishes the open
//! frame and fsyncs, and a resumed writer truncates to the last durable
//! offset and appends fresh frames; decoders handle the concatenation
//! transparently.

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use zstd::stream::write::Encoder;

use crate::records::PartPointer;

/// Uncompressed bytes per part before rotation.
pub const ROTATE_AT_BYTES: u64 = 150 * 1024 * 1024;

const ZSTD_LEVEL: i32 = 3;

pub fn part_file_name(index: u32) -> String {
    format!("part-{index:03}.jsonl.zst")
}

/// One dataset's append-only stream.
pub struct PartLane {
    dir: PathBuf,
    part_index: u32,
    encoder: Option<Encoder<'static, File>>,
    /// Current part with all frames finished, awaiting further writes.
    idle_file: Option<File>,
    uncompressed_in_part: u64,
    records_total: u64,
    durable_offset: u64,
    parts: Vec<String>,
}

impl PartLane {
    /// Open a fresh lane in `dir` (created if absent).
    pub fn create(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create dataset dir {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            part_index: 1,
            encoder: None,
            idle_file: None,
            uncompressed_in_part: 0,
            records_total: 0,
            durable_offset: 0,
            parts: Vec::new(),
        })
    }

    /// Reopen a lane at a recorded pointer, discarding any bytes past the
    /// durable offset (a torn frame from a crash).
    pub fn resume(dir: &Path, pointer: PartPointer) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create dataset dir {}", dir.display()))?;

        let mut parts = Vec::new();
        for index in 1..=pointer.part_index {
            let name = part_file_name(index);
            if dir.join(&name).exists() {
                parts.push(name);
            }
        }

        let current = dir.join(part_file_name(pointer.part_index.max(1)));
        if current.exists() {
            let file = OpenOptions::new()
                .write(true)
                .open(&current)
                .with_context(|| format!("failed to reopen part {}", current.display()))?;
            file.set_len(pointer.byte_offset)
                .context("failed to truncate torn frame")?;
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            part_index: pointer.part_index.max(1),
            encoder: None,
            idle_file: None,
            // The uncompressed footprint of prior frames is unknown after a
            // resume; rotation restarts its count, which only delays the
            // next roll, never corrupts.
            uncompressed_in_part: 0,
            records_total: pointer.record_count,
            durable_offset: pointer.byte_offset,
            parts,
        })
    }

    /// Append one already-serialized JSON record.
    pub fn write_line(&mut self, line: &[u8]) -> Result<()> {
        let encoder = self.ensure_encoder()?;
        encoder.write_all(line).context("part write failed")?;
        encoder.write_all(b"\n").context("part write failed")?;
        self.records_total += 1;
        self.uncompressed_in_part += line.len() as u64 + 1;

        if self.uncompressed_in_part >= ROTATE_AT_BYTES {
            self.rotate()?;
        }
        Ok(())
    }

    /// Finish the open frame and fsync, making everything written so far
    /// durable and the pointer accurate.
    pub fn flush_sync(&mut self) -> Result<()> {
        if let Some(encoder) = self.encoder.take() {
            let mut file = encoder.finish().context("failed to finish zstd frame")?;
            file.sync_all().context("fsync failed")?;
            self.durable_offset = file
                .seek(SeekFrom::End(0))
                .context("failed to read part offset")?;
            self.idle_file = Some(file);
        }
        Ok(())
    }

    #[must_use]
    pub fn pointer(&self) -> PartPointer {
        PartPointer {
            part_index: self.part_index,
            byte_offset: self.durable_offset,
            record_count: self.records_total,
        }
    }

    /// Filenames of every part this lane has touched, in order.
    #[must_use]
    pub fn part_names(&self) -> Vec<String> {
        self.parts.clone()
    }

    #[must_use]
    pub fn record_count(&self) -> u64 {
        self.records_total
    }

    fn ensure_encoder(&mut self) -> Result<&mut Encoder<'static, File>> {
        if self.encoder.is_none() {
            let file = match self.idle_file.take() {
                Some(file) => file,
                None => {
                    let name = part_file_name(self.part_index);
                    let path = self.dir.join(&name);
                    if !self.parts.contains(&name) {
                        self.parts.push(name);
                    }
                    OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&path)
                        .with_context(|| format!("failed to open part {}", path.display()))?
                }
            };
            self.encoder = Some(
                Encoder::new(file, ZSTD_LEVEL).context("failed to start zstd encoder")?,
            );
        }
        Ok(self.encoder.as_mut().expect("encoder just ensured"))
    }

    fn rotate(&mut self) -> Result<()> {
        if let Some(encoder) = self.encoder.take() {
            let file = encoder.finish().context("failed to finish zstd frame")?;
            file.sync_all().context("fsync failed")?;
        }
        self.idle_file = None;
        self.part_index += 1;
        self.uncompressed_in_part = 0;
        self.durable_offset = 0;
        Ok(())
    }
}
