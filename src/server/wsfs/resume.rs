//! Resume-id codec.
//!
//! Session ids are never sent raw: they are run through a reversible
//! perfect-hash codec (sqids) with a minimum length and an alphabet
//! shuffled once per process, so ids from one server run do not decode
//! on another.

use rand::seq::SliceRandom;
use sqids::Sqids;

const MIN_LENGTH: u8 = 13;
const ALPHABET: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Error building the codec; only possible on a broken alphabet, so it
/// surfaces as a startup failure.
#[derive(Debug)]
pub struct CodecError(String);

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "resume codec setup failed: {}", self.0)
    }
}

impl std::error::Error for CodecError {}

pub struct ResumeCodec {
    ider: Sqids,
}

impl ResumeCodec {
    pub fn new() -> Result<Self, CodecError> {
        let mut alphabet: Vec<char> = ALPHABET.chars().collect();
        alphabet.shuffle(&mut rand::thread_rng());
        let ider = Sqids::builder()
            .alphabet(alphabet)
            .min_length(MIN_LENGTH)
            .build()
            .map_err(|err| CodecError(err.to_string()))?;
        Ok(Self { ider })
    }

    pub fn encode(&self, id: u64) -> Option<String> {
        self.ider.encode(&[id]).ok()
    }

    /// Decodes a resume id; `None` when the string does not decode to
    /// exactly one number.
    pub fn decode(&self, resume_id: &str) -> Option<u64> {
        let numbers = self.ider.decode(resume_id);
        match numbers.as_slice() {
            [id] => Some(*id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let codec = ResumeCodec::new().unwrap();
        for id in [0u64, 1, 77, u64::from(u32::MAX), u64::MAX / 2] {
            let encoded = codec.encode(id).unwrap();
            assert!(encoded.len() >= MIN_LENGTH as usize);
            assert_eq!(codec.decode(&encoded), Some(id));
        }
    }

    #[test]
    fn garbage_does_not_decode() {
        let codec = ResumeCodec::new().unwrap();
        assert_eq!(codec.decode(""), None);
        assert_eq!(codec.decode("!!not-an-id!!"), None);
    }

    #[test]
    fn alphabets_differ_between_codecs() {
        // Ids minted by one process must not resume sessions on another.
        let id = 123_456u64;
        let first = ResumeCodec::new().unwrap().encode(id).unwrap();
        let mismatch = (0..16).any(|_| {
            let other = ResumeCodec::new().unwrap();
            other.decode(&first) != Some(id)
        });
        assert!(mismatch);
    }
}
