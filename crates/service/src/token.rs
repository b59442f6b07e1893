use rand::Rng;

/// Random lowercase hex string of the given length.
pub fn hex(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| char::from_digit(rng.random_range(0..16u32), 16).unwrap())
        .collect()
}

/// Call identifier: 32 hex characters scoped to the advertised
/// address.
///
/// # Test
///
/// ```
/// use sip_gateway_service::token;
///
/// let id = token::call_id("192.168.1.5");
///
/// assert_eq!(id.len(), 32 + 1 + "192.168.1.5".len());
/// assert!(id.ends_with("@192.168.1.5"));
/// ```
pub fn call_id(advertised: &str) -> String {
    format!("{}@{}", hex(32), advertised)
}

/// Via branch token with the RFC 3261 magic cookie prefix.
pub fn branch() -> String {
    format!("z9hG4bK{}", hex(32))
}

/// From/To tag.
pub fn tag() -> String {
    hex(16)
}
