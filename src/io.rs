//! little-endian binary primitives for the file-index format (§6.2:
//! "little-endian fixed header"). adapted from the teacher's `io.rs`
//! extension-trait style, trimmed to what a simple fixed-record format
//! needs (no varint/pack-delta encodings, which belonged to the object
//! store's pack format and are out of scope here).

use crate::hash::ObjectId;
use crate::time::Timestamp;
use std::io::{self, prelude::*};

pub trait ReadExt: Read {
    #[inline]
    fn read_u8(&mut self) -> io::Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    #[inline]
    fn read_u16(&mut self) -> io::Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    #[inline]
    fn read_u32(&mut self) -> io::Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    #[inline]
    fn read_oid(&mut self) -> io::Result<ObjectId> {
        let mut buf = [0u8; 20];
        self.read_exact(&mut buf)?;
        Ok(ObjectId::new(buf))
    }

    #[inline]
    fn read_timestamp(&mut self) -> io::Result<Timestamp> {
        let sec = self.read_u32()?;
        let nsec = self.read_u32()?;
        Ok(Timestamp::new(sec, nsec))
    }

    #[inline]
    fn read_path_bytes(&mut self, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }
}

impl<R: Read + ?Sized> ReadExt for R {
}

pub trait WriteExt: Write {
    #[inline]
    fn write_u8(&mut self, n: u8) -> io::Result<()> {
        self.write_all(&[n])
    }

    #[inline]
    fn write_u16(&mut self, n: u16) -> io::Result<()> {
        self.write_all(&n.to_le_bytes())
    }

    #[inline]
    fn write_u32(&mut self, n: u32) -> io::Result<()> {
        self.write_all(&n.to_le_bytes())
    }

    #[inline]
    fn write_oid(&mut self, oid: ObjectId) -> io::Result<()> {
        self.write_all(oid.as_bytes())
    }

    #[inline]
    fn write_timestamp(&mut self, t: Timestamp) -> io::Result<()> {
        self.write_u32(t.sec)?;
        self.write_u32(t.nsec)
    }
}

impl<W: Write + ?Sized> WriteExt for W {
}
