//! Setup PIN handling: manual pairing codes and PIN validity rules.

use anyhow::{Context, Result};

pub const MAX_DISCRIMINATOR: u16 = 0xfff;
pub const MAX_SETUP_PIN: u32 = 99_999_998;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnboardingInfo {
    /// Only the upper four bits survive in a manual code.
    pub discriminator: u16,
    pub passcode: u32,
}

/// PINs a device must never accept, they are trivially guessable.
pub fn is_valid_setup_pin(pin: u32) -> bool {
    const INVALID: [u32; 12] = [
        0, 11111111, 22222222, 33333333, 44444444, 55555555, 66666666, 77777777, 88888888,
        99999999, 12345678, 87654321,
    ];
    pin != 0 && pin <= MAX_SETUP_PIN && !INVALID.contains(&pin)
}

const VERHOEFF_D: [[u8; 10]; 10] = [
    [0, 1, 2, 3, 4, 5, 6, 7, 8, 9],
    [1, 2, 3, 4, 0, 6, 7, 8, 9, 5],
    [2, 3, 4, 0, 1, 7, 8, 9, 5, 6],
    [3, 4, 0, 1, 2, 8, 9, 5, 6, 7],
    [4, 0, 1, 2, 3, 9, 5, 6, 7, 8],
    [5, 9, 8, 7, 6, 0, 4, 3, 2, 1],
    [6, 5, 9, 8, 7, 1, 0, 4, 3, 2],
    [7, 6, 5, 9, 8, 2, 1, 0, 4, 3],
    [8, 7, 6, 5, 9, 3, 2, 1, 0, 4],
    [9, 8, 7, 6, 5, 4, 3, 2, 1, 0],
];

const VERHOEFF_P: [[u8; 10]; 8] = [
    [0, 1, 2, 3, 4, 5, 6, 7, 8, 9],
    [1, 5, 7, 6, 2, 8, 3, 0, 9, 4],
    [5, 8, 0, 3, 7, 9, 6, 1, 4, 2],
    [8, 9, 1, 6, 0, 4, 3, 5, 2, 7],
    [9, 4, 5, 3, 1, 2, 7, 6, 8, 0],
    [4, 2, 8, 6, 5, 7, 3, 9, 0, 1],
    [2, 7, 9, 3, 8, 0, 6, 4, 1, 5],
    [7, 0, 4, 6, 9, 1, 3, 2, 5, 8],
];

const VERHOEFF_INV: [u8; 10] = [0, 4, 3, 2, 1, 5, 6, 7, 8, 9];

fn verhoeff(digits: &[u8], offset: usize) -> u8 {
    digits
        .iter()
        .rev()
        .enumerate()
        .fold(0u8, |c, (i, d)| {
            VERHOEFF_D[c as usize][VERHOEFF_P[(i + offset) % 8][*d as usize] as usize]
        })
}

fn check_digit(digits: &[u8]) -> u8 {
    VERHOEFF_INV[verhoeff(digits, 1) as usize]
}

fn parse_digits(s: &str) -> Result<u32> {
    s.parse::<u32>().context(format!("invalid digits '{}'", s))
}

pub fn decode_manual_pairing_code(code: &str) -> Result<OnboardingInfo> {
    let norm = code.replace('-', "");
    let digits = norm
        .chars()
        .map(|c| c.to_digit(10).map(|d| d as u8))
        .collect::<Option<Vec<u8>>>()
        .context("manual pairing code must contain only digits")?;
    let long = digits.first().map(|d| d & 4 != 0).unwrap_or(false);
    let expected_len = if long { 21 } else { 11 };
    if digits.len() != expected_len {
        anyhow::bail!(
            "manual pairing code must have {} digits, got {}",
            expected_len,
            digits.len()
        );
    }
    if verhoeff(&digits, 0) != 0 {
        anyhow::bail!("manual pairing code check digit mismatch");
    }

    let first = parse_digits(&norm[0..1])?;
    let second = parse_digits(&norm[1..6])?;
    let third = parse_digits(&norm[6..10])?;
    let passcode = second & 0x3fff | (third << 14);
    let discriminator = (((first & 3) << 10) | (second >> 6) & 0x300) as u16;
    Ok(OnboardingInfo {
        discriminator,
        passcode,
    })
}

/// Short form (11 digits) manual pairing code, without dashes.
pub fn encode_manual_pairing_code(info: &OnboardingInfo) -> Result<String> {
    if info.discriminator > MAX_DISCRIMINATOR {
        anyhow::bail!("discriminator {} out of range", info.discriminator);
    }
    if !is_valid_setup_pin(info.passcode) {
        anyhow::bail!("invalid setup pin");
    }
    let first = (info.discriminator as u32 >> 10) & 3;
    let second = ((info.discriminator as u32 & 0x300) << 6) | (info.passcode & 0x3fff);
    let third = info.passcode >> 14;
    let body = format!("{}{:05}{:04}", first, second, third);
    let digits: Vec<u8> = body.bytes().map(|b| b - b'0').collect();
    Ok(format!("{}{}", body, check_digit(&digits)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn decode_short_code_with_dashes() {
        let res = decode_manual_pairing_code("2585-103-3238").unwrap();
        assert_eq!(res.discriminator, 2816);
        assert_eq!(res.passcode, 54453390);
    }

    #[test]
    pub fn decode_short_code() {
        let res = decode_manual_pairing_code("34970112332").unwrap();
        assert_eq!(res.discriminator, 3840);
        assert_eq!(res.passcode, 20202021);
    }

    #[test]
    fn bad_check_digit_and_length_rejected() {
        assert!(decode_manual_pairing_code("34970112333").is_err());
        assert!(decode_manual_pairing_code("3497011233").is_err());
        assert!(decode_manual_pairing_code("3497O112332").is_err());
    }

    #[test]
    fn encode_matches_known_codes() {
        let code = encode_manual_pairing_code(&OnboardingInfo {
            discriminator: 2816,
            passcode: 54453390,
        })
        .unwrap();
        assert_eq!(code, "25851033238");
        let code = encode_manual_pairing_code(&OnboardingInfo {
            discriminator: 3840,
            passcode: 20202021,
        })
        .unwrap();
        assert_eq!(code, "34970112332");
    }

    #[test]
    fn trivial_pins_invalid() {
        for pin in [0, 11111111, 12345678, 87654321, 99999999, 100_000_000] {
            assert!(!is_valid_setup_pin(pin), "{}", pin);
        }
        assert!(is_valid_setup_pin(20202021));
        assert!(is_valid_setup_pin(1));
    }
}
