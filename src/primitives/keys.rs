use {
  ed25519_dalek::{PublicKey, SecretKey, Signature as DalekSignature},
  multihash::{Hasher, Sha3_256},
  serde::{
    de::{self, Visitor},
    Deserialize,
    Deserializer,
    Serialize,
  },
  std::{
    fmt::{Debug, Display, Formatter},
    marker::PhantomData,
    ops::Deref,
    str::FromStr,
  },
  thiserror::Error,
};

/// The address of a validator or peer: an Ed25519 public key.
///
/// Equality and ordering are over the raw 32 bytes, so a [`Pubkey`]
/// can be used directly as a `ValidatorSet`/`RefuseList` map key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pubkey([u8; 32]);

impl Pubkey {
  pub const fn from_bytes(bytes: [u8; 32]) -> Self {
    Self(bytes)
  }

  pub fn as_bytes(&self) -> &[u8; 32] {
    &self.0
  }

  /// 20-byte address derived from this pubkey, matching the
  /// `Validator.address` field of the data model.
  pub fn address(&self) -> [u8; 20] {
    let mut hasher = Sha3_256::default();
    hasher.update(&self.0);
    let digest = hasher.finalize();
    let mut addr = [0u8; 20];
    addr.copy_from_slice(&digest[..20]);
    addr
  }
}

impl Deref for Pubkey {
  type Target = [u8];

  fn deref(&self) -> &Self::Target {
    &self.0
  }
}

impl Display for Pubkey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", bs58::encode(self.0).into_string())
  }
}

impl Debug for Pubkey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "Pubkey({})", bs58::encode(self.0).into_string())
  }
}

impl From<Pubkey> for String {
  fn from(pk: Pubkey) -> Self {
    bs58::encode(pk.0).into_string()
  }
}

impl FromStr for Pubkey {
  type Err = bs58::decode::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let mut bytes = [0u8; 32];
    bs58::decode(s).into(&mut bytes)?;
    Ok(Self(bytes))
  }
}

impl From<PublicKey> for Pubkey {
  fn from(p: PublicKey) -> Self {
    Self(*p.as_bytes())
  }
}

impl TryFrom<&Pubkey> for PublicKey {
  type Error = ed25519_dalek::ed25519::Error;

  fn try_from(pk: &Pubkey) -> Result<Self, Self::Error> {
    PublicKey::from_bytes(&pk.0)
  }
}

/// A validator's long-term Ed25519 identity keypair.
///
/// This is the `priv_validator.json` key used to sign votes and
/// proposals. A double-sign guard lives alongside it (see
/// [`crate::storage::PrivValidatorState`]), not on this type itself —
/// `Keypair` is pure cryptographic material.
pub struct Keypair(ed25519_dalek::Keypair);

impl Keypair {
  /// Builds a fresh keypair from raw random bytes rather than calling
  /// `ed25519_dalek::Keypair::generate`, which pins an older
  /// `rand_core` than the `rand` version this workspace uses
  /// elsewhere (mirrors the bin/keygen generation path).
  pub fn generate<R: rand::RngCore>(rng: &mut R) -> Self {
    let mut bytes = [0u8; 32];
    rng.fill_bytes(&mut bytes);
    let secret = SecretKey::from_bytes(&bytes).expect("32 bytes is a valid secret key");
    let public: PublicKey = (&secret).into();
    Self(ed25519_dalek::Keypair { secret, public })
  }

  pub fn public(&self) -> Pubkey {
    self.0.public.into()
  }

  pub fn secret(&self) -> &SecretKey {
    &self.0.secret
  }

  pub fn sign(&self, message: &[u8]) -> Signature {
    use ed25519_dalek::Signer;
    Signature(self.0.sign(message))
  }
}

impl Clone for Keypair {
  fn clone(&self) -> Self {
    Self(ed25519_dalek::Keypair::from_bytes(&self.0.to_bytes()).unwrap())
  }
}

impl Deref for Keypair {
  type Target = ed25519_dalek::Keypair;

  fn deref(&self) -> &Self::Target {
    &self.0
  }
}

impl std::fmt::Debug for Keypair {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("Keypair").field(&self.0.public).finish()
  }
}

impl Display for Keypair {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(
      f,
      "Keypair({})",
      bs58::encode(self.0.public.as_bytes()).into_string()
    )
  }
}

impl From<ed25519_dalek::Keypair> for Keypair {
  fn from(k: ed25519_dalek::Keypair) -> Self {
    Self(k)
  }
}

impl From<Keypair> for ed25519_dalek::Keypair {
  fn from(kp: Keypair) -> Self {
    ed25519_dalek::Keypair::from_bytes(&kp.0.to_bytes()).unwrap()
  }
}

/// Serialized as the base58 encoding of the 32-byte secret key alone,
/// matching [`Keypair::from_str`]'s own encoding — the public half is
/// always re-derived, never trusted from the wire.
impl Serialize for Keypair {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: serde::Serializer,
  {
    serializer.serialize_str(&bs58::encode(self.0.secret.to_bytes()).into_string())
  }
}

impl<'de> Deserialize<'de> for Keypair {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: Deserializer<'de>,
  {
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(|e: KeypairError| de::Error::custom(e.to_string()))
  }
}

#[derive(Debug, Error)]
pub enum KeypairError {
  #[error("Failed parsing base58 string: {0:?}")]
  Base58ParseError(bs58::decode::Error),

  #[error("{0}")]
  Ed25519Error(#[from] ed25519_dalek::ed25519::Error),
}

impl TryFrom<&[u8]> for Keypair {
  type Error = KeypairError;

  fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
    let secret = SecretKey::from_bytes(value)?;
    let public: PublicKey = (&secret).into();
    Ok(Self(ed25519_dalek::Keypair { secret, public }))
  }
}

impl FromStr for Keypair {
  type Err = KeypairError;

  fn from_str(value: &str) -> Result<Self, Self::Err> {
    let mut secret = [0u8; 32];
    bs58::decode(value)
      .into(&mut secret)
      .map_err(KeypairError::Base58ParseError)?;
    let secret = SecretKey::from_bytes(&secret)?;
    let public = (&secret).into();
    Ok(Keypair(ed25519_dalek::Keypair { secret, public }))
  }
}

/// An Ed25519 signature over a canonical sign-bytes payload.
#[derive(Clone, Copy)]
pub struct Signature(DalekSignature);

impl Signature {
  pub fn to_bytes(self) -> [u8; 64] {
    self.0.to_bytes()
  }

  pub fn verify(&self, pubkey: &Pubkey, message: &[u8]) -> bool {
    match PublicKey::try_from(pubkey) {
      Ok(pk) => {
        use ed25519_dalek::Verifier;
        pk.verify(message, &self.0).is_ok()
      }
      Err(_) => false,
    }
  }
}

impl PartialEq for Signature {
  fn eq(&self, other: &Self) -> bool {
    self.0.to_bytes() == other.0.to_bytes()
  }
}
impl Eq for Signature {}

impl Debug for Signature {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "Signature({})", bs58::encode(self.0.to_bytes()).into_string())
  }
}

impl Serialize for Signature {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: serde::Serializer,
  {
    serializer.serialize_bytes(&self.0.to_bytes())
  }
}

impl<'de> Deserialize<'de> for Signature {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: Deserializer<'de>,
  {
    let bytes = <Vec<u8>>::deserialize(deserializer)?;
    let sig = DalekSignature::from_bytes(&bytes)
      .map_err(|e| de::Error::custom(format!("{e}")))?;
    Ok(Signature(sig))
  }
}

/// Deserialize a pubkey for either a user-friendly base58
/// representation or a machine-friendly byte array.
impl<'de> Deserialize<'de> for Pubkey {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: Deserializer<'de>,
  {
    struct StringOrArray<T>(PhantomData<fn() -> T>);

    impl<'de, T> Visitor<'de> for StringOrArray<T>
    where
      T: Deserialize<'de> + FromStr<Err = bs58::decode::Error>,
    {
      type Value = T;

      fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("base58 string or byte array")
      }

      fn visit_str<E>(self, value: &str) -> Result<T, E>
      where
        E: de::Error,
      {
        FromStr::from_str(value)
          .map_err(|e| de::Error::custom(format!("{e:?}")))
      }

      fn visit_seq<A>(self, seq: A) -> Result<Self::Value, A::Error>
      where
        A: de::SeqAccess<'de>,
      {
        Deserialize::deserialize(de::value::SeqAccessDeserializer::new(seq))
      }
    }

    deserializer.deserialize_str(StringOrArray(PhantomData))
  }
}

impl Serialize for Pubkey {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: serde::Serializer,
  {
    serializer.serialize_str(&bs58::encode(self.0).into_string())
  }
}

#[cfg(test)]
mod test {
  use super::Pubkey;

  #[test]
  fn pubkey_roundtrips_through_base58() {
    let pk: Pubkey = "GBQEQGo5zQYCFdewiWuZ5FT9pi6D4muTAvyYzqR4ty4U"
      .parse()
      .unwrap();
    let s: String = pk.clone().into();
    let pk2: Pubkey = s.parse().unwrap();
    assert_eq!(pk, pk2);
  }

  #[test]
  fn pubkey_address_is_stable() {
    let pk: Pubkey = "GBQEQGo5zQYCFdewiWuZ5FT9pi6D4muTAvyYzqR4ty4U"
      .parse()
      .unwrap();
    let a1 = pk.address();
    let a2 = pk.address();
    assert_eq!(a1, a2);
    assert_eq!(a1.len(), 20);
  }
}
