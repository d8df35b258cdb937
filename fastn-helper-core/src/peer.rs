/// Identity of a peer: its 32-byte Ed25519 public key.
///
/// Rendered as ID52, the 52-character lowercase BASE32_DNSSEC form fastn
/// uses everywhere a peer id is shown or typed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId([u8; 32]);

#[derive(Debug, thiserror::Error)]
#[error("invalid peer id `{input}`: {reason}")]
pub struct InvalidPeerId {
    input: String,
    reason: &'static str,
}

impl PeerId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn id52(&self) -> String {
        data_encoding::BASE32_DNSSEC.encode(&self.0)
    }

    /// A random id, for transports that do not carry real keys.
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl std::str::FromStr for PeerId {
    type Err = InvalidPeerId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| InvalidPeerId {
            input: s.to_string(),
            reason,
        };
        let bytes = data_encoding::BASE32_DNSSEC
            .decode(s.as_bytes())
            .map_err(|_| invalid("not BASE32_DNSSEC"))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| invalid("expected 32 bytes"))?;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for PeerId {
    type Error = InvalidPeerId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PeerId> for String {
    fn from(value: PeerId) -> Self {
        value.id52()
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id52())
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", self.id52())
    }
}

/// A peer together with the addresses it is known under.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PeerInfo {
    pub peer: PeerId,
    pub addrs: Vec<String>,
}
