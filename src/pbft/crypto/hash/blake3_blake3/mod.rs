use crate::pbft::error::ErrorKind;

pub const LENGTH: usize = blake3::OUT_LEN;

pub const ERR: ErrorKind = ErrorKind::CryptoHashBlake3Blake3;

pub struct Context {
    inner: blake3::Hasher,
}

impl Context {
    pub fn new() -> Self {
        Self {
            inner: blake3::Hasher::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finish(self) -> [u8; LENGTH] {
        *self.inner.finalize().as_bytes()
    }
}
