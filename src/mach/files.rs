use crate::error;
use crate::lang::Error;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

type Result<T> = std::result::Result<T, Error>;

/// ## File access
///
/// OPEN, CLOSE and the file-positioned builtins talk to an injected
/// `Opener` that produces `FileAccessor`s for sequential, random, and
/// binary access. Concrete disk and modem backends are external; a
/// memory-backed opener ships for tests and headless hosts.

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FileMode {
    Input,
    Output,
    Append,
    Random,
    Binary,
}

pub trait Opener {
    fn open(&mut self, path: &str, mode: FileMode) -> Result<Box<dyn FileAccessor>>;
}

pub trait FileAccessor {
    fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>>;
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()>;
    /// Reposition to a zero-based byte offset.
    fn seek(&mut self, position: u64) -> Result<()>;
    fn position(&self) -> u64;
    fn len(&self) -> u64;
    fn eof(&self) -> bool;
}

/// One open file number: its accessor plus the record length used by
/// random access.
pub struct OpenFile {
    pub accessor: Box<dyn FileAccessor>,
    pub mode: FileMode,
    pub record_len: usize,
}

impl OpenFile {
    /// Sequential line read for INPUT #. Consumes the trailing line
    /// terminator, tolerating both CRLF and bare LF.
    pub fn read_line(&mut self) -> Result<Option<String>> {
        if self.accessor.eof() {
            return Ok(None);
        }
        let mut line = Vec::new();
        while !self.accessor.eof() {
            let byte = self.accessor.read_bytes(1)?;
            match byte.first() {
                Some(b'\n') | None => break,
                Some(b'\r') => {}
                Some(b) => line.push(*b),
            }
        }
        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }

    pub fn write_line(&mut self, text: &str) -> Result<()> {
        self.accessor.write_bytes(text.as_bytes())?;
        self.accessor.write_bytes(b"\n")
    }

    /// Read one fixed-width record at the current position, padded
    /// with zeros past end of file.
    pub fn read_record(&mut self) -> Result<Vec<u8>> {
        let mut record = self.accessor.read_bytes(self.record_len)?;
        record.resize(self.record_len, 0);
        Ok(record)
    }

    pub fn write_record(&mut self, bytes: &[u8]) -> Result<()> {
        let mut record = bytes.to_vec();
        record.resize(self.record_len, 0);
        self.accessor.write_bytes(&record)
    }
}

/// The table of open file numbers.
#[derive(Default)]
pub struct Files {
    open: HashMap<u16, OpenFile>,
}

const MAX_OPEN_FILES: usize = 255;

impl Files {
    pub fn new() -> Files {
        Files::default()
    }

    pub fn open(
        &mut self,
        opener: &mut dyn Opener,
        number: u16,
        path: &str,
        mode: FileMode,
        record_len: usize,
    ) -> Result<()> {
        if number == 0 {
            return Err(error!(BadFileNameOrNumber));
        }
        if self.open.contains_key(&number) {
            return Err(error!(FileAlreadyOpen));
        }
        if self.open.len() >= MAX_OPEN_FILES {
            return Err(error!(TooManyFiles));
        }
        let accessor = opener.open(path, mode)?;
        self.open.insert(
            number,
            OpenFile {
                accessor,
                mode,
                record_len,
            },
        );
        Ok(())
    }

    pub fn close(&mut self, number: u16) -> Result<()> {
        match self.open.remove(&number) {
            Some(_) => Ok(()),
            None => Err(error!(BadFileNameOrNumber)),
        }
    }

    pub fn close_all(&mut self) {
        self.open.clear();
    }

    pub fn get(&mut self, number: u16) -> Result<&mut OpenFile> {
        self.open
            .get_mut(&number)
            .ok_or_else(|| error!(BadFileNameOrNumber))
    }
}

/// In-memory filesystem for tests. Cloned handles share contents so a
/// test can write a file, run a program that reads it, and inspect
/// the result.
#[derive(Clone, Default)]
pub struct MemoryOpener {
    contents: Rc<RefCell<HashMap<String, Vec<u8>>>>,
}

impl MemoryOpener {
    pub fn new() -> MemoryOpener {
        MemoryOpener::default()
    }

    pub fn write(&self, path: &str, bytes: &[u8]) {
        self.contents
            .borrow_mut()
            .insert(path.to_string(), bytes.to_vec());
    }

    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        self.contents.borrow().get(path).cloned()
    }
}

impl Opener for MemoryOpener {
    fn open(&mut self, path: &str, mode: FileMode) -> Result<Box<dyn FileAccessor>> {
        let mut exists = true;
        let bytes = self.read(path).unwrap_or_else(|| {
            exists = false;
            Vec::new()
        });
        match mode {
            FileMode::Input if !exists => return Err(error!(FileNotFound)),
            FileMode::Output => self.write(path, b""),
            _ => {}
        }
        let position = match mode {
            FileMode::Append => bytes.len() as u64,
            _ => 0,
        };
        Ok(Box::new(MemoryFile {
            path: path.to_string(),
            bytes: if mode == FileMode::Output {
                Vec::new()
            } else {
                bytes
            },
            position,
            store: self.clone(),
        }))
    }
}

struct MemoryFile {
    path: String,
    bytes: Vec<u8>,
    position: u64,
    store: MemoryOpener,
}

impl FileAccessor for MemoryFile {
    fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>> {
        let start = self.position as usize;
        let end = (start + count).min(self.bytes.len());
        let slice = self.bytes[start.min(self.bytes.len())..end].to_vec();
        self.position = end as u64;
        Ok(slice)
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let start = self.position as usize;
        let end = start + bytes.len();
        if end > self.bytes.len() {
            self.bytes.resize(end, 0);
        }
        self.bytes[start..end].copy_from_slice(bytes);
        self.position = end as u64;
        self.store.write(&self.path, &self.bytes);
        Ok(())
    }

    fn seek(&mut self, position: u64) -> Result<()> {
        self.position = position;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn eof(&self) -> bool {
        self.position >= self.bytes.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_write_read_round_trip() {
        let mut opener = MemoryOpener::new();
        let mut files = Files::new();
        files
            .open(&mut opener, 1, "scores.txt", FileMode::Output, 0)
            .unwrap();
        files.get(1).unwrap().write_line("hello").unwrap();
        files.close(1).unwrap();

        files
            .open(&mut opener, 1, "scores.txt", FileMode::Input, 0)
            .unwrap();
        let line = files.get(1).unwrap().read_line().unwrap();
        assert_eq!(line.as_deref(), Some("hello"));
        assert!(files.get(1).unwrap().accessor.eof());
    }

    #[test]
    fn test_missing_input_file() {
        let mut opener = MemoryOpener::new();
        let mut files = Files::new();
        assert!(files
            .open(&mut opener, 1, "absent.txt", FileMode::Input, 0)
            .is_err());
    }

    #[test]
    fn test_random_records() {
        let mut opener = MemoryOpener::new();
        let mut files = Files::new();
        files
            .open(&mut opener, 1, "db.dat", FileMode::Random, 4)
            .unwrap();
        let file = files.get(1).unwrap();
        file.write_record(b"ab").unwrap();
        file.write_record(b"cdef").unwrap();
        file.accessor.seek(0).unwrap();
        assert_eq!(file.read_record().unwrap(), b"ab\0\0");
        assert_eq!(file.read_record().unwrap(), b"cdef");
    }

    #[test]
    fn test_duplicate_file_number() {
        let mut opener = MemoryOpener::new();
        let mut files = Files::new();
        files
            .open(&mut opener, 1, "a.txt", FileMode::Output, 0)
            .unwrap();
        assert!(files
            .open(&mut opener, 1, "b.txt", FileMode::Output, 0)
            .is_err());
    }
}
