// Licensed under the Apache-2.0 license

/// Verify checksum
pub fn verify_checksum(checksum: u32, cmd: u32, data: &[u8]) -> bool {
    calc_checksum(cmd, data) == checksum
}

/// Calculate the checksum
/// 0 - (SUM(command code bytes) + SUM(request/response bytes))
pub fn calc_checksum(cmd: u32, data: &[u8]) -> u32 {
    let sum = cmd
        .to_le_bytes()
        .iter()
        .chain(data)
        .fold(0u32, |acc, b| acc.wrapping_add(*b as u32));
    0u32.wrapping_sub(sum)
}

/// Checks a raw response: the leading word is the checksum over the rest.
/// Responses always use a command code of zero.
pub fn verify_resp_checksum(resp: &[u8]) -> Option<(u32, u32)> {
    let (chksum_bytes, payload) = resp.split_first_chunk::<4>()?;
    let expected = u32::from_le_bytes(*chksum_bytes);
    let actual = calc_checksum(0, payload);
    Some((expected, actual))
}
