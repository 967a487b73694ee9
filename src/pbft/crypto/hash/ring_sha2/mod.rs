use ring::digest::{self, SHA256, SHA256_OUTPUT_LEN};

use crate::pbft::error::ErrorKind;

pub const LENGTH: usize = SHA256_OUTPUT_LEN;

pub const ERR: ErrorKind = ErrorKind::CryptoHashRingSha2;

pub struct Context {
    inner: digest::Context,
}

impl Context {
    pub fn new() -> Self {
        Self {
            inner: digest::Context::new(&SHA256),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finish(self) -> [u8; LENGTH] {
        let digest = self.inner.finish();
        let mut inner = [0; LENGTH];
        inner.copy_from_slice(digest.as_ref());
        inner
    }
}
