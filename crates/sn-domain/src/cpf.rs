use serde::{Deserialize, Deserializer, Serialize};

use crate::error::DomainError;

/// Eleven-digit national taxpayer identifier, stored canonical (digits only).
///
/// Construction goes through [`Cpf::parse`], which strips formatting and
/// validates both shape and the two check digits. Display output is always
/// masked; the full value only leaves this type through [`Cpf::as_str`].
#[derive(Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Cpf(String);

// Debug output is masked too; the canonical value must never reach a log.
impl std::fmt::Debug for Cpf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Cpf").field(&self.masked()).finish()
    }
}

impl Cpf {
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();

        if digits.len() != 11 {
            return Err(DomainError::InvalidValue(format!(
                "CPF must have 11 digits, got {}",
                digits.len()
            )));
        }

        let first = digits.as_bytes()[0];
        if digits.bytes().all(|b| b == first) {
            return Err(DomainError::InvalidValue(
                "CPF cannot be a single repeated digit".into(),
            ));
        }

        if !check_digits_valid(&digits) {
            return Err(DomainError::InvalidValue("CPF check digits do not match".into()));
        }

        Ok(Self(digits))
    }

    /// Canonical 11-digit form. Never log this; use [`Cpf::masked`].
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `XXX.XXX.***-NN` form for user-facing output and logs.
    pub fn masked(&self) -> String {
        format!("{}.{}.***-{}", &self.0[..3], &self.0[3..6], &self.0[9..])
    }
}

impl std::fmt::Display for Cpf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.masked())
    }
}

impl<'de> Deserialize<'de> for Cpf {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Cpf::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Masks an arbitrary string that may hold a CPF in any formatting state.
///
/// Idempotent: feeding an already-masked value back returns it unchanged.
/// Anything that is neither a full CPF nor a masked one collapses to the
/// fully-hidden form.
pub fn mask_cpf(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() == 11 {
        return format!("{}.{}.***-{}", &digits[..3], &digits[3..6], &digits[9..]);
    }
    if is_masked_form(raw) {
        return raw.to_string();
    }
    "***.***.***-**".to_string()
}

fn is_masked_form(s: &str) -> bool {
    let b = s.as_bytes();
    if b.len() != 14 {
        return false;
    }
    // ddd.ddd.***-dd
    b[..3].iter().all(u8::is_ascii_digit)
        && b[3] == b'.'
        && b[4..7].iter().all(u8::is_ascii_digit)
        && b[7] == b'.'
        && &b[8..11] == b"***"
        && b[11] == b'-'
        && b[12..14].iter().all(u8::is_ascii_digit)
}

fn check_digits_valid(digits: &str) -> bool {
    let d: Vec<u32> = digits.chars().filter_map(|c| c.to_digit(10)).collect();

    let dv = |take: usize| -> u32 {
        let weight_start = (take + 1) as u32;
        let sum: u32 = d[..take]
            .iter()
            .enumerate()
            .map(|(i, &x)| x * (weight_start - i as u32))
            .sum();
        let rest = (sum * 10) % 11;
        if rest == 10 { 0 } else { rest }
    };

    dv(9) == d[9] && dv(10) == d[10]
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parse_accepts_valid_cpf() {
        let cpf = Cpf::parse("111.444.777-35").unwrap();
        assert_eq!(cpf.as_str(), "11144477735");
    }

    #[test]
    fn parse_rejects_bad_check_digits() {
        assert!(Cpf::parse("11144477734").is_err());
    }

    #[test]
    fn parse_rejects_repeated_digits() {
        assert!(Cpf::parse("00000000000").is_err());
        assert!(Cpf::parse("111.111.111-11").is_err());
    }

    #[test]
    fn parse_rejects_wrong_length() {
        assert!(Cpf::parse("123").is_err());
        assert!(Cpf::parse("").is_err());
    }

    #[test]
    fn masked_keeps_only_last_two_digits() {
        let cpf = Cpf::parse("11144477735").unwrap();
        assert_eq!(cpf.masked(), "111.444.***-35");
    }

    #[test]
    fn display_is_masked() {
        let cpf = Cpf::parse("11144477735").unwrap();
        assert_eq!(format!("{cpf}"), "111.444.***-35");
    }

    #[test]
    fn mask_of_garbage_hides_everything() {
        assert_eq!(mask_cpf("not a cpf"), "***.***.***-**");
        assert_eq!(mask_cpf(""), "***.***.***-**");
    }

    proptest! {
        #[test]
        fn mask_is_idempotent(raw in "\\PC{0,20}") {
            let once = mask_cpf(&raw);
            prop_assert_eq!(mask_cpf(&once), once);
        }

        #[test]
        fn mask_preserves_only_last_two(d in proptest::collection::vec(0u32..10, 11)) {
            let raw: String = d.iter().map(|x| char::from_digit(*x, 10).unwrap()).collect();
            let masked = mask_cpf(&raw);
            prop_assert_eq!(&masked[8..11], "***");
            prop_assert_eq!(&masked[12..], &raw[9..]);
        }
    }
}
