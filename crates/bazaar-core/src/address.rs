//! Address encoding for the Bazaar ledger.
//!
//! Addresses use Bech32m encoding ([BIP-350]) with human-readable prefixes:
//! - Mainnet: `bzr1...`
//! - Testnet: `tbzr1...`
//!
//! The first data character is a version byte naming the lock kind:
//! [`PUBKEY_HASH_VERSION`] for wallet addresses and [`SCRIPT_HASH_VERSION`]
//! for pay-to-script-hash commit envelopes. It is followed by the 32-byte
//! BLAKE3 hash committed to by the lock.
//!
//! [BIP-350]: https://github.com/bitcoin/bips/blob/master/bip-0350.mediawiki

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::crypto::PublicKey;
use crate::error::AddressError;
use crate::types::{Hash256, LockScript};

/// Bech32m checksum constant (BIP-350).
const BECH32M_CONST: u32 = 0x2bc830a3;

/// Bech32 character set for encoding 5-bit values.
const CHARSET: &[u8; 32] = b"qpzry9x8gf2tvdw0s3jn54khce6mua7l";

/// Version byte for pay-to-pubkey-hash addresses.
pub const PUBKEY_HASH_VERSION: u8 = 0;

/// Version byte for pay-to-script-hash addresses.
pub const SCRIPT_HASH_VERSION: u8 = 1;

/// Network identifier determining the address prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Production network (HRP: "bzr").
    #[default]
    Mainnet,
    /// Public test network (HRP: "tbzr").
    Testnet,
}

impl Network {
    /// Human-readable prefix for this network.
    pub fn hrp(&self) -> &'static str {
        match self {
            Network::Mainnet => "bzr",
            Network::Testnet => "tbzr",
        }
    }

    /// Look up network from a human-readable prefix.
    pub fn from_hrp(hrp: &str) -> Result<Self, AddressError> {
        match hrp {
            "bzr" => Ok(Network::Mainnet),
            "tbzr" => Ok(Network::Testnet),
            _ => Err(AddressError::UnknownNetwork(hrp.to_string())),
        }
    }

    /// Default WebSocket JSON-RPC port of a ledger node on this network.
    pub fn default_rpc_port(&self) -> u16 {
        match self {
            Network::Mainnet => 17110,
            Network::Testnet => 17210,
        }
    }

    /// Subdirectory name appended to the base data directory path.
    pub fn data_dir_suffix(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
        }
    }
}

/// A Bazaar ledger address: a network plus the lock it pays to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Address {
    network: Network,
    lock: LockScript,
}

impl Address {
    /// Create a pay-to-pubkey-hash address.
    pub fn from_pubkey_hash(pubkey_hash: Hash256, network: Network) -> Self {
        Self {
            network,
            lock: LockScript::PubkeyHash(pubkey_hash),
        }
    }

    /// Create a pay-to-script-hash address.
    pub fn from_script_hash(script_hash: Hash256, network: Network) -> Self {
        Self {
            network,
            lock: LockScript::ScriptHash(script_hash),
        }
    }

    /// Create an address from a public key and network.
    pub fn from_public_key(public_key: &PublicKey, network: Network) -> Self {
        Self::from_pubkey_hash(public_key.pubkey_hash(), network)
    }

    /// Create the address that owns outputs locked by `lock`.
    pub fn from_lock(lock: LockScript, network: Network) -> Self {
        Self { network, lock }
    }

    /// The lock script outputs to this address carry.
    pub fn lock_script(&self) -> LockScript {
        self.lock
    }

    /// The hash encoded in this address.
    pub fn payload_hash(&self) -> Hash256 {
        self.lock.hash()
    }

    /// Whether this is a pay-to-script-hash address.
    pub fn is_script_hash(&self) -> bool {
        self.lock.is_script_hash()
    }

    /// The network this address belongs to.
    pub fn network(&self) -> Network {
        self.network
    }

    /// The address version byte.
    pub fn version(&self) -> u8 {
        match self.lock {
            LockScript::PubkeyHash(_) => PUBKEY_HASH_VERSION,
            LockScript::ScriptHash(_) => SCRIPT_HASH_VERSION,
        }
    }

    /// Encode this address as a Bech32m string.
    pub fn encode(&self) -> String {
        let hrp = self.network.hrp();
        // A 32-byte input always converts when padding is allowed.
        let data_5bit = convert_bits(self.payload_hash().as_bytes(), 8, 5, true).unwrap_or_default();

        let mut payload = Vec::with_capacity(1 + data_5bit.len());
        payload.push(self.version());
        payload.extend_from_slice(&data_5bit);

        let checksum = bech32m_create_checksum(hrp, &payload);

        let mut result = String::with_capacity(hrp.len() + 1 + payload.len() + 6);
        result.push_str(hrp);
        result.push('1');
        for &d in payload.iter().chain(checksum.iter()) {
            result.push(CHARSET[d as usize] as char);
        }
        result
    }

    /// Decode a Bech32m address string.
    pub fn decode(s: &str) -> Result<Self, AddressError> {
        let has_lower = s.chars().any(|c| c.is_ascii_lowercase());
        let has_upper = s.chars().any(|c| c.is_ascii_uppercase());
        if has_lower && has_upper {
            return Err(AddressError::MixedCase);
        }

        let s_lower = s.to_ascii_lowercase();
        let sep_pos = s_lower.rfind('1').ok_or(AddressError::MissingSeparator)?;

        if sep_pos == 0 {
            return Err(AddressError::InvalidHrp);
        }
        // At least 6 checksum chars + 1 version char after the separator.
        if sep_pos + 8 > s_lower.len() {
            return Err(AddressError::InvalidLength);
        }

        let hrp = &s_lower[..sep_pos];
        let data_part = &s_lower[sep_pos + 1..];

        let mut data = Vec::with_capacity(data_part.len());
        for c in data_part.chars() {
            let pos = CHARSET
                .iter()
                .position(|&ch| ch as char == c)
                .ok_or(AddressError::InvalidCharacter(c))?;
            data.push(pos as u8);
        }

        if !bech32m_verify_checksum(hrp, &data) {
            return Err(AddressError::InvalidChecksum);
        }

        let payload = &data[..data.len() - 6];
        let Some((&version, hash_5bit)) = payload.split_first() else {
            return Err(AddressError::InvalidLength);
        };

        let hash_bytes = convert_bits(hash_5bit, 5, 8, false).ok_or(AddressError::InvalidPadding)?;
        let hash: [u8; 32] = hash_bytes
            .try_into()
            .map_err(|_| AddressError::InvalidLength)?;

        let lock = match version {
            PUBKEY_HASH_VERSION => LockScript::PubkeyHash(Hash256(hash)),
            SCRIPT_HASH_VERSION => LockScript::ScriptHash(Hash256(hash)),
            other => return Err(AddressError::InvalidVersion(other)),
        };

        Ok(Self {
            network: Network::from_hrp(hrp)?,
            lock,
        })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::decode(&s).map_err(serde::de::Error::custom)
    }
}

// --- Bech32m internals ---

fn bech32m_polymod(values: &[u8]) -> u32 {
    const GEN: [u32; 5] = [0x3b6a57b2, 0x26508e6d, 0x1ea119fa, 0x3d4233dd, 0x2a1462b3];
    let mut chk: u32 = 1;
    for &v in values {
        let b = chk >> 25;
        chk = ((chk & 0x1ffffff) << 5) ^ (v as u32);
        for (i, &g) in GEN.iter().enumerate() {
            if (b >> i) & 1 != 0 {
                chk ^= g;
            }
        }
    }
    chk
}

fn bech32m_hrp_expand(hrp: &str) -> Vec<u8> {
    let mut ret: Vec<u8> = hrp.bytes().map(|c| c >> 5).collect();
    ret.push(0);
    ret.extend(hrp.bytes().map(|c| c & 31));
    ret
}

fn bech32m_create_checksum(hrp: &str, data: &[u8]) -> Vec<u8> {
    let mut values = bech32m_hrp_expand(hrp);
    values.extend_from_slice(data);
    values.extend_from_slice(&[0; 6]);
    let polymod = bech32m_polymod(&values) ^ BECH32M_CONST;
    (0..6)
        .map(|i| ((polymod >> (5 * (5 - i))) & 31) as u8)
        .collect()
}

fn bech32m_verify_checksum(hrp: &str, data: &[u8]) -> bool {
    let mut values = bech32m_hrp_expand(hrp);
    values.extend_from_slice(data);
    bech32m_polymod(&values) == BECH32M_CONST
}

/// Convert between bit widths (e.g. 8-bit bytes to 5-bit Bech32 groups).
fn convert_bits(data: &[u8], from_bits: u32, to_bits: u32, pad: bool) -> Option<Vec<u8>> {
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;
    let mut ret = Vec::new();
    let maxv = (1u32 << to_bits) - 1;
    for &value in data {
        let v = value as u32;
        if v >> from_bits != 0 {
            return None;
        }
        acc = (acc << from_bits) | v;
        bits += from_bits;
        while bits >= to_bits {
            bits -= to_bits;
            ret.push(((acc >> bits) & maxv) as u8);
        }
    }
    if pad {
        if bits > 0 {
            ret.push(((acc << (to_bits - bits)) & maxv) as u8);
        }
    } else if bits >= from_bits || ((acc << (to_bits - bits)) & maxv) != 0 {
        return None;
    }
    Some(ret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    fn sample_hash() -> Hash256 {
        Hash256([0xAA; 32])
    }

    #[test]
    fn network_hrps() {
        assert_eq!(Network::Mainnet.hrp(), "bzr");
        assert_eq!(Network::Testnet.hrp(), "tbzr");
        assert_eq!(Network::from_hrp("tbzr").unwrap(), Network::Testnet);
    }

    #[test]
    fn network_from_hrp_unknown() {
        assert_eq!(
            Network::from_hrp("bitcoin").unwrap_err(),
            AddressError::UnknownNetwork("bitcoin".into())
        );
    }

    #[test]
    fn encode_prefixes() {
        let main = Address::from_pubkey_hash(sample_hash(), Network::Mainnet);
        let test = Address::from_pubkey_hash(sample_hash(), Network::Testnet);
        assert!(main.encode().starts_with("bzr1"));
        assert!(test.encode().starts_with("tbzr1"));
    }

    #[test]
    fn encode_is_lowercase() {
        let encoded = Address::from_pubkey_hash(sample_hash(), Network::Mainnet).encode();
        assert_eq!(encoded, encoded.to_ascii_lowercase());
    }

    #[test]
    fn script_hash_and_pubkey_hash_encode_differently() {
        let p2pkh = Address::from_pubkey_hash(sample_hash(), Network::Mainnet);
        let p2sh = Address::from_script_hash(sample_hash(), Network::Mainnet);
        assert_ne!(p2pkh.encode(), p2sh.encode());
        assert_eq!(p2sh.version(), SCRIPT_HASH_VERSION);
        assert!(p2sh.is_script_hash());
    }

    #[test]
    fn decode_roundtrip_both_kinds() {
        for addr in [
            Address::from_pubkey_hash(sample_hash(), Network::Mainnet),
            Address::from_script_hash(Hash256([0x42; 32]), Network::Testnet),
        ] {
            assert_eq!(Address::decode(&addr.encode()).unwrap(), addr);
        }
    }

    #[test]
    fn decode_uppercase_valid() {
        let addr = Address::from_pubkey_hash(sample_hash(), Network::Mainnet);
        let decoded = Address::decode(&addr.encode().to_ascii_uppercase()).unwrap();
        assert_eq!(addr, decoded);
    }

    #[test]
    fn decode_mixed_case_fails() {
        let encoded = Address::from_pubkey_hash(sample_hash(), Network::Mainnet).encode();
        let (head, tail) = encoded.split_at(encoded.len() - 1);
        let mixed = format!("{head}{}", tail.to_ascii_uppercase());
        assert_eq!(Address::decode(&mixed).unwrap_err(), AddressError::MixedCase);
    }

    #[test]
    fn decode_invalid_checksum() {
        let mut encoded = Address::from_pubkey_hash(sample_hash(), Network::Mainnet).encode();
        let last = encoded.pop().unwrap();
        encoded.push(if last == 'q' { 'p' } else { 'q' });
        assert_eq!(Address::decode(&encoded).unwrap_err(), AddressError::InvalidChecksum);
    }

    #[test]
    fn decode_invalid_character() {
        let encoded = Address::from_pubkey_hash(sample_hash(), Network::Mainnet).encode();
        let bad = format!("{}b{}", &encoded[..5], &encoded[6..]);
        assert!(matches!(
            Address::decode(&bad).unwrap_err(),
            AddressError::InvalidCharacter('b')
        ));
    }

    #[test]
    fn decode_missing_separator() {
        assert_eq!(
            Address::decode("bzrnoseparator").unwrap_err(),
            AddressError::MissingSeparator
        );
    }

    #[test]
    fn decode_too_short() {
        assert_eq!(Address::decode("bzr1qqqq").unwrap_err(), AddressError::InvalidLength);
    }

    #[test]
    fn decode_unknown_version() {
        let mut payload = vec![3u8];
        payload.extend(convert_bits(&[0u8; 32], 8, 5, true).unwrap());
        let checksum = bech32m_create_checksum("bzr", &payload);
        let body: String = payload
            .iter()
            .chain(checksum.iter())
            .map(|&d| CHARSET[d as usize] as char)
            .collect();
        assert_eq!(
            Address::decode(&format!("bzr1{body}")).unwrap_err(),
            AddressError::InvalidVersion(3)
        );
    }

    #[test]
    fn roundtrip_from_public_key() {
        let pk = KeyPair::generate().public_key();
        let addr = Address::from_public_key(&pk, Network::Mainnet);
        let decoded = Address::decode(&addr.encode()).unwrap();
        assert_eq!(decoded.lock_script(), LockScript::PubkeyHash(pk.pubkey_hash()));
        assert_eq!(decoded.network(), Network::Mainnet);
    }

    #[test]
    fn from_lock_matches_lock_script() {
        let lock = LockScript::ScriptHash(sample_hash());
        assert_eq!(Address::from_lock(lock, Network::Testnet).lock_script(), lock);
    }

    #[test]
    fn serde_json_roundtrip() {
        let addr = Address::from_pubkey_hash(sample_hash(), Network::Testnet);
        let json = serde_json::to_string(&addr).unwrap();
        assert!(json.starts_with("\"tbzr1"));
        let decoded: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(addr, decoded);
    }

    #[test]
    fn convert_bits_8_to_5_roundtrip() {
        let original = [0xDE, 0xAD, 0xBE, 0xEF];
        let five_bit = convert_bits(&original, 8, 5, true).unwrap();
        let back = convert_bits(&five_bit, 5, 8, false).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn checksum_fails_with_wrong_hrp() {
        let data: Vec<u8> = vec![0; 53];
        let checksum = bech32m_create_checksum("bzr", &data);
        let mut full = data;
        full.extend_from_slice(&checksum);
        assert!(bech32m_verify_checksum("bzr", &full));
        assert!(!bech32m_verify_checksum("tbzr", &full));
    }
}
