//! Phone number canonicalization.
//!
//! Two numbers are the same contact iff their last ten digits agree.
//! Anything with fewer than ten digits normalizes to the empty string,
//! which never matches.

/// Number of trailing digits that identify a contact.
pub const SUFFIX_DIGITS: usize = 10;

/// Strip formatting and keep the last ten digits, or `""` if there are fewer.
pub fn normalize_phone(raw: &str) -> String {
    let digits: Vec<char> = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < SUFFIX_DIGITS {
        return String::new();
    }
    digits[digits.len() - SUFFIX_DIGITS..].iter().collect()
}

/// True iff both numbers normalize to the same non-empty suffix.
pub fn same_contact(a: &str, b: &str) -> bool {
    let a = normalize_phone(a);
    !a.is_empty() && a == normalize_phone(b)
}
