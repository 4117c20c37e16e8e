pub trait Hasher: Send {
    fn update(&mut self, data: &[u8]);
    fn finalize(self) -> Vec<u8>;
}

#[cfg(feature = "sha256")]
pub struct Sha256Hasher(sha2::Sha256);

#[cfg(feature = "sha256")]
impl Hasher for Sha256Hasher {
    fn update(&mut self, data: &[u8]) { sha2::Digest::update(&mut self.0, data); }
    fn finalize(self) -> Vec<u8> { sha2::Digest::finalize(self.0).to_vec() }
}

#[cfg(feature = "sha256")]
impl Default for Sha256Hasher {
    fn default() -> Self { Self::new() }
}

#[cfg(feature = "sha256")]
impl Sha256Hasher {
    pub fn new() -> Self { Self(<sha2::Sha256 as sha2::Digest>::new()) }

    pub fn digest(data: &[u8]) -> Vec<u8> { <sha2::Sha256 as sha2::Digest>::digest(data).to_vec() }
}

/// Render a digest the way content hashes travel on the wire.
pub fn to_hex_upper(digest: &[u8]) -> String { hex::encode_upper(digest) }
