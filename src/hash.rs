use sha1::{Digest, Sha1};
use std::fmt::{self, Debug, Display, Formatter};
use std::io::{self, Read, Write};
use std::str::FromStr;

pub const OID_SIZE: usize = 20;

/// a 20-byte SHA-1 digest identifying an object in the store.
#[derive(PartialEq, Eq, Hash, Clone, Ord, PartialOrd, Copy)]
#[repr(transparent)]
pub struct ObjectId([u8; OID_SIZE]);

impl ObjectId {
    /// hash of an empty file, for comparing a synthesized tree entry against "no blob"
    pub const EMPTY_BLOB: Self = Self([
        0xe6, 0x9d, 0xe2, 0x9b, 0xb2, 0xd1, 0xd6, 0x43, 0x4b, 0x8b, 0x29, 0xae, 0x77, 0x5a, 0xd8,
        0xc2, 0xe4, 0x8c, 0x53, 0x91,
    ]);
    pub const EMPTY_TREE: Self = Self([
        0x4b, 0x82, 0x5d, 0xc6, 0x42, 0xcb, 0x6e, 0xb9, 0xa0, 0x60, 0xe5, 0x4b, 0xf8, 0xd6, 0x92,
        0x88, 0xfb, 0xee, 0x49, 0x04,
    ]);
    pub const UNKNOWN: Self = Self([0; OID_SIZE]);

    #[inline]
    pub const fn new(bytes: [u8; OID_SIZE]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; OID_SIZE] {
        &self.0
    }

    #[inline]
    pub fn is_unknown(self) -> bool {
        self == Self::UNKNOWN
    }

    #[inline]
    pub fn is_known(self) -> bool {
        self != Self::UNKNOWN
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn short(&self) -> String {
        self.to_hex()[..7].to_owned()
    }

    pub fn hash_bytes(bytes: impl AsRef<[u8]>) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseOidError {
    #[error("object id must be 40 hex characters, found {0}")]
    BadLength(usize),
    #[error("object id is not valid hex")]
    BadHex,
}

impl FromStr for ObjectId {
    type Err = ParseOidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim_end();
        if s.len() != 40 {
            return Err(ParseOidError::BadLength(s.len()));
        }
        let mut bytes = [0u8; OID_SIZE];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| ParseOidError::BadHex)?;
        Ok(Self(bytes))
    }
}

impl AsRef<[u8]> for ObjectId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Debug for ObjectId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if f.alternate() { write!(f, "{}", self.short()) } else { write!(f, "{}", self.to_hex()) }
    }
}

#[cfg(test)]
impl quickcheck::Arbitrary for ObjectId {
    fn arbitrary(g: &mut quickcheck::Gen) -> Self {
        let mut bytes = [0u8; OID_SIZE];
        for b in &mut bytes {
            *b = u8::arbitrary(g);
        }
        Self(bytes)
    }
}

pub fn hash_bytes(bytes: impl AsRef<[u8]>) -> ObjectId {
    ObjectId::hash_bytes(bytes)
}

/// running sha1 digest over bytes as they are read, used to validate the
/// trailing checksum of the file index stream
pub struct HashReader<'a, R> {
    reader: R,
    hasher: &'a mut Sha1,
}

impl<'a, R: Read> HashReader<'a, R> {
    pub fn new(reader: R, hasher: &'a mut Sha1) -> Self {
        Self { reader, hasher }
    }

    pub fn finalize_sha1_hash(self) -> ObjectId {
        ObjectId::new(self.hasher.clone().finalize().into())
    }
}

impl<'a, R: Read> Read for HashReader<'a, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.reader.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

/// running sha1 digest over bytes as they are written, used to append the
/// trailing checksum of the file index stream
pub struct HashWriter<'a, W> {
    writer: W,
    hasher: &'a mut Sha1,
}

impl<'a, W: Write> HashWriter<'a, W> {
    pub fn new(writer: W, hasher: &'a mut Sha1) -> Self {
        Self { writer, hasher }
    }

    pub fn write_hash(mut self) -> io::Result<()> {
        let hash = self.hasher.clone().finalize();
        self.writer.write_all(&hash)
    }
}

impl<'a, W: Write> Write for HashWriter<'a, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.writer.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let oid = hash_bytes(b"hello world");
        let hex = oid.to_hex();
        assert_eq!(hex.len(), 40);
        assert_eq!(hex.parse::<ObjectId>().unwrap(), oid);
    }

    #[test]
    fn bad_length_rejected() {
        assert!(matches!("abcd".parse::<ObjectId>(), Err(ParseOidError::BadLength(4))));
    }
}
