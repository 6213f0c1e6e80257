//! Media hash derivation
//!
//! A media hash identifies one logical stream between two peers. Any i32
//! works as long as it is unique among the streams active on a channel
//! pair; these helpers derive one from common stream identities.

use uuid::Uuid;

const FNV_OFFSET: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

fn fnv1a(bytes: &[u8]) -> i32 {
    bytes
        .iter()
        .fold(FNV_OFFSET, |hash, b| (hash ^ *b as u32).wrapping_mul(FNV_PRIME)) as i32
}

/// Hash of an audio format (sample rate, channel count, sample width)
pub fn from_audio_format(sample_rate: u32, channels: u16, bits_per_sample: u16) -> i32 {
    let mut bytes = Vec::with_capacity(8);
    bytes.extend_from_slice(&sample_rate.to_be_bytes());
    bytes.extend_from_slice(&channels.to_be_bytes());
    bytes.extend_from_slice(&bits_per_sample.to_be_bytes());
    fnv1a(&bytes)
}

/// Hash of a capture device identity
pub fn from_device(device_id: &str) -> i32 {
    fnv1a(device_id.as_bytes())
}

/// Arbitrary hash for ad hoc streams
pub fn random() -> i32 {
    Uuid::new_v4().as_u128() as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_derivations() {
        assert_eq!(from_audio_format(48_000, 2, 16), from_audio_format(48_000, 2, 16));
        assert_ne!(from_audio_format(48_000, 2, 16), from_audio_format(44_100, 2, 16));
        assert_eq!(from_device("hw:0,0"), from_device("hw:0,0"));
        assert_ne!(from_device("hw:0,0"), from_device("hw:1,0"));
    }
}
