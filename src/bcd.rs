/*!
 # Binary-coded decimal helpers

 RTC and alarm registers hold one decimal digit per nibble. Only values
 0-99 are meaningful; anything else yields garbage rather than an error.
*/

/// Decode a BCD register byte (0x59 -> 59)
pub fn bcd_to_bin(value: u8) -> u8 {
    value.wrapping_sub(6u8.wrapping_mul(value >> 4))
}

/// Encode 0-99 as a BCD register byte (59 -> 0x59)
pub fn bin_to_bcd(value: u8) -> u8 {
    value.wrapping_add(6u8.wrapping_mul(value / 10))
}
