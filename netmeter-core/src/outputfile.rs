// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Append-only text log sink with a line counter, plain or bzip2-compressed,
//! per spec.md §2 row 4 and §6.2. Compression is out of this crate's core
//! per spec.md §1 ("compressed file I/O ... is assumed"); the concrete
//! implementation here shells out to the system `bzip2` binary the way the
//! original tool's `OutputFile` wrapped an external compressor, which keeps
//! the core free of a heavyweight native bzip2 binding.

use crate::error::Result;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

/// Minimal contract every output sink satisfies: append raw bytes, track
/// how many lines were written, and finalize (flush + close).
pub trait OutputFile: Send {
    fn write(&mut self, bytes: &[u8]) -> Result<()>;
    fn finish(&mut self) -> Result<()>;
    fn line_count(&self) -> u64;
    fn path(&self) -> &Path;
}

/// Writes a `\n`-delimited line, counting it.
pub fn write_line(sink: &mut dyn OutputFile, line: &str) -> Result<()> {
    sink.write(line.as_bytes())?;
    sink.write(b"\n")
}

/// Plain, uncompressed text file.
pub struct PlainFile {
    path: PathBuf,
    file: Option<File>,
    lines: u64,
}

impl PlainFile {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::create(&path)?;
        Ok(Self {
            path,
            file: Some(file),
            lines: 0,
        })
    }
}

impl OutputFile for PlainFile {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.write_all(bytes)?;
            self.lines += bytes.iter().filter(|&&b| b == b'\n').count() as u64;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        Ok(())
    }

    fn line_count(&self) -> u64 {
        self.lines
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

/// `.bz2`-suffixed file, piped through an external `bzip2` process the way
/// the original tool's compressed sink worked.
pub struct CompressedFile {
    path: PathBuf,
    child: Option<Child>,
    lines: u64,
}

impl CompressedFile {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let out = File::create(&path)?;
        let child = Command::new("bzip2")
            .arg("-c")
            .stdin(Stdio::piped())
            .stdout(out)
            .spawn()?;
        Ok(Self {
            path,
            child: Some(child),
            lines: 0,
        })
    }
}

impl OutputFile for CompressedFile {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if let Some(child) = self.child.as_mut() {
            if let Some(stdin) = child.stdin.as_mut() {
                stdin.write_all(bytes)?;
                self.lines += bytes.iter().filter(|&&b| b == b'\n').count() as u64;
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(mut child) = self.child.take() {
            drop(child.stdin.take());
            let _ = child.wait();
        }
        Ok(())
    }

    fn line_count(&self) -> u64 {
        self.lines
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

/// Opens the right sink for `path`, dispatching on the `.bz2` suffix
/// convention of spec.md §6.1/§6.2. An empty path means "no output" and
/// returns `None`.
pub fn open(path: &str) -> Result<Option<Box<dyn OutputFile>>> {
    if path.is_empty() {
        return Ok(None);
    }
    if path.ends_with(".bz2") {
        Ok(Some(Box::new(CompressedFile::create(path)?)))
    } else {
        Ok(Some(Box::new(PlainFile::create(path)?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn plain_file_counts_lines() {
        let dir = std::env::temp_dir().join(format!("netmeter-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("out.vec");
        let mut f = PlainFile::create(&path).unwrap();
        write_line(&mut f, "one").unwrap();
        write_line(&mut f, "two").unwrap();
        assert_eq!(f.line_count(), 2);
        f.finish().unwrap();

        let mut contents = String::new();
        File::open(&path).unwrap().read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "one\ntwo\n");
    }
}
