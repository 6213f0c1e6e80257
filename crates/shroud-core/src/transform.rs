//! Pluggable payload transforms
//!
//! A [`Transformer`] runs on a whole message: after concatenation on the
//! receiving side, before chunking on the sending side. This is the hook
//! for compression or encryption; the default passes bytes through.

use crate::{Error, Result};
use bytes::Bytes;

/// Payload transform hook
pub trait Transformer: Send + Sync {
    fn transform(&self, data: Bytes, media_hash: i32) -> Result<Bytes>;
}

/// Pass-through transform
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTransformer;

impl Transformer for IdentityTransformer {
    fn transform(&self, data: Bytes, _media_hash: i32) -> Result<Bytes> {
        Ok(data)
    }
}

impl<F> Transformer for F
where
    F: Fn(Bytes, i32) -> Result<Bytes> + Send + Sync,
{
    fn transform(&self, data: Bytes, media_hash: i32) -> Result<Bytes> {
        self(data, media_hash)
    }
}

/// XOR every byte with a repeating key
///
/// Symmetric, so the same instance serves both directions. Obfuscation
/// only; it provides no confidentiality.
#[derive(Debug, Clone)]
pub struct XorTransformer {
    key: Vec<u8>,
}

impl XorTransformer {
    pub fn new(key: impl Into<Vec<u8>>) -> Result<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(Error::Transform("xor key must not be empty".to_string()));
        }
        Ok(Self { key })
    }
}

impl Transformer for XorTransformer {
    fn transform(&self, data: Bytes, _media_hash: i32) -> Result<Bytes> {
        Ok(data
            .iter()
            .zip(self.key.iter().cycle())
            .map(|(b, k)| b ^ k)
            .collect::<Vec<u8>>()
            .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity() {
        let data = Bytes::from_static(b"payload");
        assert_eq!(IdentityTransformer.transform(data.clone(), 1).unwrap(), data);
    }

    #[test]
    fn test_closure_transform() {
        let upper = |data: Bytes, _hash: i32| -> Result<Bytes> {
            Ok(data.to_ascii_uppercase().into())
        };
        assert_eq!(
            upper.transform(Bytes::from_static(b"abc"), 0).unwrap().as_ref(),
            b"ABC"
        );
    }

    #[test]
    fn test_xor_is_symmetric() {
        let xor = XorTransformer::new(vec![0x5a, 0x13]).unwrap();
        let original = Bytes::from_static(b"hello shroud");
        let scrambled = xor.transform(original.clone(), 0).unwrap();
        assert_ne!(scrambled, original);
        assert_eq!(xor.transform(scrambled, 0).unwrap(), original);
        assert!(XorTransformer::new(Vec::new()).is_err());
    }
}
