/*
    Copyright (C) 2020-2022  Rafal Michalski

    This file is part of BEERUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use super::TapeHeader;

/// A destination of the data decoded by the [TapeDecoder][super::TapeDecoder].
pub trait TapeStore {
    /// Stores the payload of a stream block.
    fn store_stream_block(&mut self, data: &[u8]) -> io::Result<()>;
    /// Stores a whole saved file.
    fn store_file(&mut self, header: &TapeHeader, data: &[u8]) -> io::Result<()>;
}

impl<S: TapeStore + ?Sized> TapeStore for &mut S {
    fn store_stream_block(&mut self, data: &[u8]) -> io::Result<()> {
        (**self).store_stream_block(data)
    }
    fn store_file(&mut self, header: &TapeHeader, data: &[u8]) -> io::Result<()> {
        (**self).store_file(header, data)
    }
}

impl<S: TapeStore + ?Sized> TapeStore for Box<S> {
    fn store_stream_block(&mut self, data: &[u8]) -> io::Result<()> {
        (**self).store_stream_block(data)
    }
    fn store_file(&mut self, header: &TapeHeader, data: &[u8]) -> io::Result<()> {
        (**self).store_file(header, data)
    }
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullTapeStore;

impl TapeStore for NullTapeStore {
    fn store_stream_block(&mut self, _data: &[u8]) -> io::Result<()> {
        Ok(())
    }
    fn store_file(&mut self, _header: &TapeHeader, _data: &[u8]) -> io::Result<()> {
        Ok(())
    }
}

/// Keeps everything in memory.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryTapeStore {
    /// The concatenated payloads of all stream blocks.
    pub stream: Vec<u8>,
    /// The number of stream blocks.
    pub blocks: usize,
    /// The saved files.
    pub files: Vec<(TapeHeader, Vec<u8>)>,
}

impl TapeStore for MemoryTapeStore {
    fn store_stream_block(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.extend_from_slice(data);
        self.blocks += 1;
        Ok(())
    }
    fn store_file(&mut self, header: &TapeHeader, data: &[u8]) -> io::Result<()> {
        self.files.push((*header, data.to_vec()));
        Ok(())
    }
}

/// Writes the decoded data to the file system.
///
/// Stream blocks are appended to the pipe file, if one is open. Saved files are written to the
/// output directory as `<name>.<ext>` along with a `<name>.mtd` file containing the header metadata
/// unless autosave is disabled. The names carry no leading dot, so the files aren't hidden on
/// the host.
#[derive(Debug)]
pub struct FsTapeStore {
    dir: PathBuf,
    autosave: bool,
    pipe: Option<File>,
}

impl FsTapeStore {
    /// Creates a store writing saved files to the `dir` directory.
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        FsTapeStore { dir: dir.into(), autosave: true, pipe: None }
    }
    /// Opens a file at `path` for appending the stream blocks, builder style.
    pub fn with_pipe<P: AsRef<Path>>(mut self, path: P) -> io::Result<Self> {
        self.open_pipe(path)?;
        Ok(self)
    }
    /// Opens a file at `path` for appending the stream blocks.
    pub fn open_pipe<P: AsRef<Path>>(&mut self, path: P) -> io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(path.as_ref())?;
        debug!("tape pipe: {}", path.as_ref().display());
        self.pipe = Some(file);
        Ok(())
    }
    /// Closes the pipe file.
    pub fn close_pipe(&mut self) {
        self.pipe = None;
    }

    pub fn set_autosave(&mut self, autosave: bool) {
        self.autosave = autosave;
    }

    pub fn autosave(&self) -> bool {
        self.autosave
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
    /// Returns the path of the data file of a saved file with the given `header`.
    pub fn file_path(&self, header: &TapeHeader) -> PathBuf {
        self.dir.join(format!("{}.{}", sanitize_name(&header.name), file_extension(header.file_type)))
    }
    /// Returns the path of the metadata file of a saved file with the given `header`.
    pub fn metadata_path(&self, header: &TapeHeader) -> PathBuf {
        self.dir.join(format!("{}.mtd", sanitize_name(&header.name)))
    }
}

impl TapeStore for FsTapeStore {
    fn store_stream_block(&mut self, data: &[u8]) -> io::Result<()> {
        match self.pipe.as_mut() {
            Some(file) => file.write_all(data),
            None => {
                warn!("tape: no pipe file open, dropping {} bytes", data.len());
                Ok(())
            }
        }
    }

    fn store_file(&mut self, header: &TapeHeader, data: &[u8]) -> io::Result<()> {
        if !self.autosave {
            debug!("tape: autosave off, dropping \"{}\"", header.name_str());
            return Ok(())
        }
        fs::create_dir_all(&self.dir)?;
        let path = self.file_path(header);
        fs::write(&path, data)?;
        fs::write(self.metadata_path(header), header.to_string())?;
        info!("tape: written {}", path.display());
        Ok(())
    }
}

/// Converts a file name from a tape header into a name safe for the host file system.
///
/// Trailing spaces and NULs are removed, any byte not being a printable ASCII character or being
/// reserved on common file systems is replaced with `_`.
pub fn sanitize_name(name: &[u8]) -> String {
    let len = name.iter().rposition(|&c| c != b' ' && c != 0).map_or(0, |p| p + 1);
    if len == 0 {
        return "noname".into()
    }
    name[..len].iter().map(|&c| match c {
        b'/'|b'\\'|b':'|b'*'|b'?'|b'"'|b'<'|b'>'|b'|' => '_',
        0x21..=0x7E => c as char,
        _ => '_'
    }).collect()
}

/// Returns the file name extension for the given tape file type.
pub fn file_extension(file_type: u8) -> String {
    match file_type {
        b'M' => "mac".into(),
        b'B' => "bas".into(),
        b'W' => "wbe".into(),
        b'E' => "edt".into(),
        c if c.is_ascii_alphanumeric() => (c.to_ascii_lowercase() as char).to_string(),
        c => format!("t{:02x}", c)
    }
}
