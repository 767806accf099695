//! Diffie-Hellman and keyed-MAC primitives for the device handshake.
//!
//! SECURITY WARNING: everything in this module is deliberately toy-sized.
//! The 32-bit DH group and the XOR-keyed polynomial MAC match the firmware
//! shipped on the mower fleet and MUST stay bit-identical to it. Do not
//! widen the parameters or substitute a real KEM here; devices in the field
//! would stop authenticating.

/// DH group generator
pub const DH_GENERATOR: u64 = 5;
/// DH group modulus, the largest 32-bit prime
pub const DH_MODULUS: u64 = 0xFFFF_FFFB;
/// Pre-shared key for handshake authenticators
pub const PSK: u32 = 0xFEED_5EED;

/// Modular exponentiation by square-and-multiply. Intermediates are held in
/// u128 so a 64-bit modulus cannot overflow the multiply.
pub fn modexp(base: u64, exponent: u64, modulus: u64) -> u64 {
    if modulus == 1 {
        return 0;
    }
    let mut result: u128 = 1;
    let mut base = (base as u128) % (modulus as u128);
    let mut exponent = exponent;
    while exponent > 0 {
        if exponent & 1 == 1 {
            result = (result * base) % modulus as u128;
        }
        base = (base * base) % modulus as u128;
        exponent >>= 1;
    }
    result as u64
}

/// Public key for a 16-bit private secret: `g^secret mod p`, fits in 32 bits.
pub fn dh_public(secret: u16) -> u32 {
    modexp(DH_GENERATOR, secret as u64, DH_MODULUS) as u32
}

/// Shared secret: `peer_public^our_secret mod p`.
pub fn dh_shared(peer_public: u32, our_secret: u16) -> u32 {
    modexp(peer_public as u64, our_secret as u64, DH_MODULUS) as u32
}

/// Polynomial rolling hash: `acc = 31*acc + byte (mod 2^32)`.
pub fn hash(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0u32, |acc, &b| acc.wrapping_mul(31).wrapping_add(b as u32))
}

/// Keyed MAC: hash XOR key.
pub fn mac(key: u32, bytes: &[u8]) -> u32 {
    hash(bytes) ^ key
}

/// Handshake authenticator over both public keys and the nonce, keyed with
/// the PSK. The first argument is always the public key of the side that
/// emits this MAC.
pub fn auth_tag(pub_first: u32, pub_second: u32, nonce: u64) -> u32 {
    let mut block = [0u8; 16];
    block[0..4].copy_from_slice(&pub_first.to_be_bytes());
    block[4..8].copy_from_slice(&pub_second.to_be_bytes());
    block[8..16].copy_from_slice(&nonce.to_be_bytes());
    mac(PSK, &block)
}
