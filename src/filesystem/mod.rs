//! BASIC file channels
//!
//! `OPENIN`, `OPENOUT` and `OPENUP` return a handle from 1 to [`MAX_FILES`];
//! 0 means the file could not be opened. `PRINT#` and `INPUT#` use a tagged
//! binary encoding:
//!
//! ```text
//! 0x40 b3 b2 b1 b0            32-bit integer, big-endian
//! 0x48 b7 .. b0               64-bit integer, big-endian
//! 0x88 f0 .. f7               double, little-endian in the file
//! 0x00 len cN .. c1           string shorter than 256 bytes, reversed
//! 0x01 l0 l1 l2 l3 c1 .. cN   longer string, little-endian length
//! 0xFF m0 m1 m2 m3 exp        Acorn 5-byte float, read only
//! ```

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{BasicError, ErrorKind, Result};
use crate::variables::Value;

pub const MAX_FILES: usize = 64;

const TAG_STRING: u8 = 0x00;
const TAG_LONG_STRING: u8 = 0x01;
const TAG_INT: u8 = 0x40;
const TAG_INT64: u8 = 0x48;
const TAG_FLOAT: u8 = 0x88;
const TAG_ACORN: [u8; 4] = [0x80, 0x81, 0x82, 0xFF];

/// Byte order of doubles in host memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatOrder {
    Little,
    Big,
    /// Old ARM FPA layout: big-endian words, little-endian word order
    LittleWords,
    BigWords,
}

impl FloatOrder {
    /// Recognise the layout from the bytes of 1.0
    pub fn from_pattern(bytes: [u8; 8]) -> Option<FloatOrder> {
        match bytes {
            [0, 0, 0, 0, 0, 0, 0xF0, 0x3F] => Some(FloatOrder::Little),
            [0x3F, 0xF0, 0, 0, 0, 0, 0, 0] => Some(FloatOrder::Big),
            [0, 0, 0xF0, 0x3F, 0, 0, 0, 0] => Some(FloatOrder::LittleWords),
            [0, 0, 0, 0, 0x3F, 0xF0, 0, 0] => Some(FloatOrder::BigWords),
            _ => None,
        }
    }

    /// Layout of this host, falling back to little-endian with a warning
    pub fn detect() -> FloatOrder {
        let pattern = 1.0f64.to_ne_bytes();
        FloatOrder::from_pattern(pattern).unwrap_or_else(|| {
            warn!(?pattern, "{}", ErrorKind::WarnEndianness.template());
            FloatOrder::Little
        })
    }

    /// Reorder host bytes into little-endian
    fn to_little(self, b: [u8; 8]) -> [u8; 8] {
        match self {
            FloatOrder::Little => b,
            FloatOrder::Big => [b[7], b[6], b[5], b[4], b[3], b[2], b[1], b[0]],
            FloatOrder::LittleWords => [b[4], b[5], b[6], b[7], b[0], b[1], b[2], b[3]],
            FloatOrder::BigWords => [b[3], b[2], b[1], b[0], b[7], b[6], b[5], b[4]],
        }
    }

    /// The inverse of `to_little`; every reordering is its own inverse
    fn from_little(self, b: [u8; 8]) -> [u8; 8] {
        self.to_little(b)
    }
}

/// Encode a value the way `PRINT#` writes it
pub fn encode_value(value: &Value, order: FloatOrder) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    match value {
        Value::Int(i) => {
            out.push(TAG_INT);
            out.extend_from_slice(&i.to_be_bytes());
        }
        Value::Int64(i) => {
            out.push(TAG_INT64);
            out.extend_from_slice(&i.to_be_bytes());
        }
        Value::Float(f) => {
            out.push(TAG_FLOAT);
            out.extend_from_slice(&order.to_little(f.to_ne_bytes()));
        }
        Value::Str(s) if s.len() < 256 => {
            out.push(TAG_STRING);
            out.push(s.len() as u8);
            out.extend(s.iter().rev());
        }
        Value::Str(s) => {
            out.push(TAG_LONG_STRING);
            out.extend_from_slice(&(s.len() as u32).to_le_bytes());
            out.extend_from_slice(s);
        }
        Value::Array(_) => return Err(ErrorKind::VarArray.into()),
    }
    Ok(out)
}

fn read_exact<R: Read>(input: &mut R, buf: &mut [u8]) -> Result<()> {
    input.read_exact(buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => BasicError::new(ErrorKind::HitEof),
        _ => BasicError::new(ErrorKind::ReadFail),
    })
}

/// Convert an Acorn 5-byte float: 4 mantissa bytes, least significant
/// first, then the exponent biased by 128
pub fn acorn_float(bytes: [u8; 5]) -> f64 {
    let exponent = bytes[4];
    if exponent == 0 {
        return 0.0;
    }
    let mantissa = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    // The sign bit stands in for the implied leading 1
    let negative = mantissa & 0x8000_0000 != 0;
    let value = (mantissa | 0x8000_0000) as f64 / 4294967296.0 * 2f64.powi(exponent as i32 - 128);
    if negative { -value } else { value }
}

/// Decode one value written by `PRINT#`
pub fn decode_value<R: Read>(input: &mut R, order: FloatOrder) -> Result<Value> {
    let mut tag = [0u8; 1];
    read_exact(input, &mut tag)?;
    match tag[0] {
        TAG_INT => {
            let mut b = [0u8; 4];
            read_exact(input, &mut b)?;
            Ok(Value::Int(i32::from_be_bytes(b)))
        }
        TAG_INT64 => {
            let mut b = [0u8; 8];
            read_exact(input, &mut b)?;
            Ok(Value::Int64(i64::from_be_bytes(b)))
        }
        TAG_FLOAT => {
            let mut b = [0u8; 8];
            read_exact(input, &mut b)?;
            Ok(Value::Float(f64::from_ne_bytes(order.from_little(b))))
        }
        TAG_STRING => {
            let mut len = [0u8; 1];
            read_exact(input, &mut len)?;
            let mut s = vec![0u8; len[0] as usize];
            read_exact(input, &mut s)?;
            s.reverse();
            Ok(Value::Str(s))
        }
        TAG_LONG_STRING => {
            let mut len = [0u8; 4];
            read_exact(input, &mut len)?;
            let len = u32::from_le_bytes(len) as usize;
            if len > crate::variables::MAXSTRING {
                return Err(ErrorKind::BadFormat.into());
            }
            let mut s = vec![0u8; len];
            read_exact(input, &mut s)?;
            Ok(Value::Str(s))
        }
        t if TAG_ACORN.contains(&t) => {
            let mut b = [0u8; 5];
            read_exact(input, &mut b)?;
            Ok(Value::Float(acorn_float(b)))
        }
        _ => Err(ErrorKind::BadFormat.into()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
    Update,
}

#[derive(Debug)]
struct Channel {
    file: File,
    path: PathBuf,
    access: Access,
}

/// Open files and the program search path
#[derive(Debug)]
pub struct FileSystem {
    channels: Vec<Option<Channel>>,
    search: Vec<PathBuf>,
    order: FloatOrder,
}

impl FileSystem {
    pub fn new(search: Vec<PathBuf>) -> Self {
        Self {
            channels: (0..MAX_FILES).map(|_| None).collect(),
            search,
            order: FloatOrder::detect(),
        }
    }

    pub fn set_search_path(&mut self, search: Vec<PathBuf>) {
        self.search = search;
    }

    /// Find a file as given, then in each search directory, trying a
    /// `.bbc` extension as well
    pub fn find(&self, name: &str) -> Option<PathBuf> {
        let direct = Path::new(name);
        let candidates = |dir: Option<&Path>| {
            let base = match dir {
                Some(d) => d.join(name),
                None => direct.to_path_buf(),
            };
            let mut with_ext = base.clone().into_os_string();
            with_ext.push(".bbc");
            [base, PathBuf::from(with_ext)]
        };
        let local = candidates(None);
        let searched = if direct.is_absolute() {
            Vec::new()
        } else {
            self.search.iter().flat_map(|d| candidates(Some(d))).collect()
        };
        local.into_iter().chain(searched).find(|p| p.is_file())
    }

    /// Read a whole file found through the search path
    pub fn read_file(&self, name: &str) -> Result<(PathBuf, Vec<u8>)> {
        let path = self
            .find(name)
            .ok_or_else(|| BasicError::new(ErrorKind::NotFound).with_str(name))?;
        let data = std::fs::read(&path)
            .map_err(|_| BasicError::new(ErrorKind::CantRead).with_str(name))?;
        Ok((path, data))
    }

    pub fn write_file(&self, name: &str, data: &[u8]) -> Result<()> {
        std::fs::write(name, data).map_err(|_| BasicError::new(ErrorKind::OpenWrite).with_str(name))
    }

    fn install(&mut self, channel: Channel) -> Result<i32> {
        let slot = self
            .channels
            .iter()
            .position(Option::is_none)
            .ok_or_else(|| BasicError::new(ErrorKind::MaxHandle))?;
        debug!(handle = slot + 1, path = %channel.path.display(), access = ?channel.access, "file opened");
        self.channels[slot] = Some(channel);
        Ok(slot as i32 + 1)
    }

    /// `OPENIN`: 0 if the file does not exist
    pub fn open_in(&mut self, name: &str) -> Result<i32> {
        let Some(path) = self.find(name) else { return Ok(0) };
        match File::open(&path) {
            Ok(file) => self.install(Channel { file, path, access: Access::Read }),
            Err(_) => Ok(0),
        }
    }

    /// `OPENOUT`: creates or truncates the file
    pub fn open_out(&mut self, name: &str) -> Result<i32> {
        let file = File::create(name).map_err(|_| BasicError::new(ErrorKind::OpenWrite).with_str(name))?;
        self.install(Channel { file, path: PathBuf::from(name), access: Access::Write })
    }

    /// `OPENUP`: 0 if the file does not exist
    pub fn open_up(&mut self, name: &str) -> Result<i32> {
        let Some(path) = self.find(name) else { return Ok(0) };
        match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => self.install(Channel { file, path, access: Access::Update }),
            Err(_) => Ok(0),
        }
    }

    fn channel(&mut self, handle: i32) -> Result<&mut Channel> {
        let index = usize::try_from(handle - 1).map_err(|_| BasicError::new(ErrorKind::BadHandle))?;
        self.channels
            .get_mut(index)
            .and_then(Option::as_mut)
            .ok_or_else(|| BasicError::new(ErrorKind::BadHandle))
    }

    fn reader(&mut self, handle: i32) -> Result<&mut File> {
        let channel = self.channel(handle)?;
        if channel.access == Access::Write {
            return Err(ErrorKind::NotOpenRead.into());
        }
        Ok(&mut channel.file)
    }

    fn writer(&mut self, handle: i32) -> Result<&mut File> {
        let channel = self.channel(handle)?;
        if channel.access == Access::Read {
            return Err(ErrorKind::NotOpenWrite.into());
        }
        Ok(&mut channel.file)
    }

    /// `CLOSE#`; handle 0 closes every channel
    pub fn close(&mut self, handle: i32) -> Result<()> {
        if handle == 0 {
            self.close_all();
            return Ok(());
        }
        self.channel(handle)?;
        self.channels[handle as usize - 1] = None;
        Ok(())
    }

    pub fn close_all(&mut self) {
        for channel in self.channels.iter_mut() {
            if let Some(mut c) = channel.take() {
                let _ = c.file.flush();
            }
        }
    }

    pub fn bget(&mut self, handle: i32) -> Result<u8> {
        let mut b = [0u8; 1];
        read_exact(self.reader(handle)?, &mut b)?;
        Ok(b[0])
    }

    pub fn bput(&mut self, handle: i32, bytes: &[u8]) -> Result<()> {
        self.writer(handle)?
            .write_all(bytes)
            .map_err(|_| BasicError::new(ErrorKind::CantWrite))
    }

    /// Read bytes up to a carriage return or line feed (`GET$#`)
    pub fn read_line(&mut self, handle: i32) -> Result<Vec<u8>> {
        let mut line = Vec::new();
        loop {
            if self.eof(handle)? {
                if line.is_empty() {
                    return Err(ErrorKind::HitEof.into());
                }
                return Ok(line);
            }
            match self.bget(handle)? {
                b'\r' | b'\n' => return Ok(line),
                b => line.push(b),
            }
        }
    }

    pub fn ptr(&mut self, handle: i32) -> Result<u64> {
        self.channel(handle)?
            .file
            .stream_position()
            .map_err(|_| BasicError::new(ErrorKind::SetPtrFail))
    }

    pub fn set_ptr(&mut self, handle: i32, position: u64) -> Result<()> {
        self.channel(handle)?
            .file
            .seek(SeekFrom::Start(position))
            .map(|_| ())
            .map_err(|_| BasicError::new(ErrorKind::SetPtrFail))
    }

    pub fn ext(&mut self, handle: i32) -> Result<u64> {
        let channel = self.channel(handle)?;
        channel
            .file
            .metadata()
            .map(|m| m.len())
            .map_err(|_| BasicError::new(ErrorKind::ReadFail))
    }

    /// Change the length of a file opened for output (`EXT#h=n`)
    pub fn set_ext(&mut self, handle: i32, len: u64) -> Result<()> {
        self.writer(handle)?
            .set_len(len)
            .map_err(|_| BasicError::new(ErrorKind::CantWrite))
    }

    pub fn eof(&mut self, handle: i32) -> Result<bool> {
        Ok(self.ptr(handle)? >= self.ext(handle)?)
    }

    /// `PRINT#`
    pub fn write_value(&mut self, handle: i32, value: &Value) -> Result<()> {
        let bytes = encode_value(value, self.order)?;
        self.bput(handle, &bytes)
    }

    /// `INPUT#`
    pub fn read_value(&mut self, handle: i32) -> Result<Value> {
        let order = self.order;
        decode_value(self.reader(handle)?, order)
    }

    /// Handles currently open
    pub fn open_handles(&self) -> Vec<i32> {
        (0..MAX_FILES)
            .filter(|&i| self.channels[i].is_some())
            .map(|i| i as i32 + 1)
            .collect()
    }
}

impl Drop for FileSystem {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::io::Cursor;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("brandy-fs-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    #[test]
    fn test_float_order_patterns() {
        assert_eq!(FloatOrder::from_pattern(1.0f64.to_le_bytes()), Some(FloatOrder::Little));
        assert_eq!(FloatOrder::from_pattern(1.0f64.to_be_bytes()), Some(FloatOrder::Big));
        assert_eq!(FloatOrder::from_pattern([0, 0, 0xF0, 0x3F, 0, 0, 0, 0]), Some(FloatOrder::LittleWords));
        assert_eq!(FloatOrder::from_pattern([1; 8]), None);
        let b = 2.5f64.to_be_bytes();
        assert_eq!(FloatOrder::Big.to_little(b), 2.5f64.to_le_bytes());
    }

    #[test]
    fn test_encoding_layout() {
        let order = FloatOrder::detect();
        assert_eq!(encode_value(&Value::Int(0x01020304), order).unwrap(), vec![0x40, 1, 2, 3, 4]);
        assert_eq!(encode_value(&Value::Str(b"AB".to_vec()), order).unwrap(), vec![0, 2, b'B', b'A']);
        let long = encode_value(&Value::Str(vec![b'x'; 300]), order).unwrap();
        assert_eq!(&long[..5], &[1, 0x2C, 1, 0, 0]);
        let float = encode_value(&Value::Float(1.0), order).unwrap();
        assert_eq!(float, vec![0x88, 0, 0, 0, 0, 0, 0, 0xF0, 0x3F]);
    }

    #[test]
    fn test_acorn_float() {
        // 1.0: exponent &81, mantissa &00000000 (sign bit clear)
        assert_eq!(acorn_float([0, 0, 0, 0, 0x81]), 1.0);
        assert_eq!(acorn_float([0, 0, 0, 0x80, 0x81]), -1.0);
        assert_eq!(acorn_float([0, 0, 0, 0x40, 0x82]), 3.0);
        assert_eq!(acorn_float([9, 9, 9, 9, 0]), 0.0);
        let mut input = Cursor::new(vec![0xFF, 0, 0, 0, 0, 0x81]);
        assert_eq!(decode_value(&mut input, FloatOrder::Little).unwrap(), Value::Float(1.0));
    }

    #[test]
    fn test_bad_tag_and_eof() {
        let mut input = Cursor::new(vec![0x42]);
        assert_eq!(decode_value(&mut input, FloatOrder::Little).unwrap_err().kind, ErrorKind::BadFormat);
        let mut input = Cursor::new(vec![0x40, 1]);
        assert_eq!(decode_value(&mut input, FloatOrder::Little).unwrap_err().kind, ErrorKind::HitEof);
    }

    #[test]
    fn test_channels() {
        let path = scratch("channels.dat");
        let name = path.to_str().unwrap();
        let mut fs = FileSystem::new(Vec::new());
        let out = fs.open_out(name).unwrap();
        assert_eq!(out, 1);
        fs.write_value(out, &Value::Int(-7)).unwrap();
        fs.write_value(out, &Value::Str(b"hello".to_vec())).unwrap();
        fs.bput(out, b"Z").unwrap();
        assert_eq!(fs.ext(out).unwrap(), 5 + 7 + 1);
        assert_eq!(fs.read_value(out).unwrap_err().kind, ErrorKind::NotOpenRead);
        fs.close(out).unwrap();
        assert_eq!(fs.close(out).unwrap_err().kind, ErrorKind::BadHandle);

        let input = fs.open_in(name).unwrap();
        assert_eq!(fs.read_value(input).unwrap(), Value::Int(-7));
        assert_eq!(fs.read_value(input).unwrap(), Value::Str(b"hello".to_vec()));
        assert!(!fs.eof(input).unwrap());
        assert_eq!(fs.bget(input).unwrap(), b'Z');
        assert!(fs.eof(input).unwrap());
        assert_eq!(fs.bget(input).unwrap_err().kind, ErrorKind::HitEof);
        fs.set_ptr(input, 0).unwrap();
        assert_eq!(fs.bget(input).unwrap(), 0x40);
        assert_eq!(fs.open_handles(), vec![input]);
        fs.close(0).unwrap();
        assert!(fs.open_handles().is_empty());
        assert_eq!(fs.open_in("no-such-file-here").unwrap(), 0);
    }

    #[test]
    fn test_search_path() {
        let path = scratch("searched.bbc");
        std::fs::write(&path, b"10 END\n").unwrap();
        let fs = FileSystem::new(vec![path.parent().unwrap().to_path_buf()]);
        let (found, data) = fs.read_file("searched").unwrap();
        assert_eq!(found, path);
        assert_eq!(data, b"10 END\n");
        assert_eq!(fs.read_file("missing-prog").unwrap_err().kind, ErrorKind::NotFound);
    }

    #[quickcheck]
    fn prop_codec_preserves_values(i: i32, j: i64, f: f64, s: Vec<u8>) -> bool {
        let order = FloatOrder::detect();
        let values = [Value::Int(i), Value::Int64(j), Value::Float(f), Value::Str(s)];
        values.iter().all(|v| {
            let bytes = encode_value(v, order).unwrap();
            let back = decode_value(&mut Cursor::new(bytes), order).unwrap();
            match (v, &back) {
                (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
                _ => *v == back,
            }
        })
    }
}
