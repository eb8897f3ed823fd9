use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use generic_array::GenericArray;

#[cfg(feature = "defmt")]
use defmt::Format;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct InvalidKeyLength;

/// AES-128 encryption of a single block, `e()` in the mesh security toolbox.
pub fn e(key: &[u8], mut plaintext: [u8; 16]) -> Result<[u8; 16], InvalidKeyLength> {
    let cipher = Aes128::new_from_slice(key).map_err(|_| InvalidKeyLength)?;
    cipher.encrypt_block(GenericArray::from_mut_slice(&mut plaintext));
    Ok(plaintext)
}

fn hash(identity_key: &[u8; 16], input: [u8; 16]) -> Result<[u8; 8], InvalidKeyLength> {
    let out = e(identity_key, input)?;
    let mut hash = [0; 8];
    hash.copy_from_slice(&out[8..]);
    Ok(hash)
}

/// Hash advertised in a (private) Node Identity proxy beacon.
pub fn node_identity_hash(
    identity_key: &[u8; 16],
    random: &[u8; 8],
    addr: u16,
    private: bool,
) -> Result<[u8; 8], InvalidKeyLength> {
    let mut input = [0; 16];
    if private {
        input[5] = 0x03;
    }
    input[6..14].copy_from_slice(random);
    input[14..].copy_from_slice(&addr.to_be_bytes());
    hash(identity_key, input)
}

/// Hash advertised in a Private Network Identity proxy beacon.
pub fn private_network_hash(
    identity_key: &[u8; 16],
    network_id: &[u8; 8],
    random: &[u8; 8],
) -> Result<[u8; 8], InvalidKeyLength> {
    let mut input = [0; 16];
    input[..8].copy_from_slice(network_id);
    input[8..].copy_from_slice(random);
    hash(identity_key, input)
}
