//! Index key construction.
//!
//! Every index record's key is `<prefix-byte><value-bytes>\0`. The prefix
//! byte selects the kind: `=` equality, `+` presence, `~` approximate,
//! `*` substring, `:` matching rule; `#` marks IDL continuation blocks and
//! never appears at this layer. Values are case-folded before keying;
//! encrypted attributes additionally pass the value bytes through the
//! provider before the prefix is applied (presence keys carry no value
//! material and are never encrypted).

use crate::entry::value_normalize;

/// Equality key prefix.
pub const EQ_PREFIX: u8 = b'=';
/// Presence key prefix.
pub const PRES_PREFIX: u8 = b'+';
/// Approximate key prefix.
pub const APPROX_PREFIX: u8 = b'~';
/// Substring key prefix.
pub const SUB_PREFIX: u8 = b'*';
/// Matching-rule key prefix.
pub const RULES_PREFIX: u8 = b':';

/// Substring n-gram length.
pub const SUB_LEN: usize = 3;
/// Begin-of-value sentinel in substring grams.
pub const SUB_BEGIN: u8 = b'^';
/// End-of-value sentinel in substring grams.
pub const SUB_END: u8 = b'$';

fn keyed(prefix: u8, value: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(value.len() + 2);
    key.push(prefix);
    key.extend_from_slice(value);
    key.push(0);
    key
}

/// The equality key for a (normalized or encrypted) value.
#[must_use]
pub fn eq_key(value: &[u8]) -> Vec<u8> {
    keyed(EQ_PREFIX, value)
}

/// The presence key. One per attribute file; no value material.
#[must_use]
pub fn presence_key() -> Vec<u8> {
    keyed(PRES_PREFIX, &[])
}

/// The approximate key for a value: its phonetic code.
#[must_use]
pub fn approx_key(value: &[u8]) -> Vec<u8> {
    keyed(APPROX_PREFIX, &soundex(value))
}

/// The key for one already-derived substring gram.
#[must_use]
pub fn sub_key(gram: &[u8]) -> Vec<u8> {
    keyed(SUB_PREFIX, gram)
}

/// A matching-rule key: `:<oid>:<derived-key>`.
#[must_use]
pub fn rules_key(oid: &str, derived: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(oid.len() + derived.len() + 1);
    body.extend_from_slice(oid.as_bytes());
    body.push(b':');
    body.extend_from_slice(derived);
    keyed(RULES_PREFIX, &body)
}

/// The substring keys for a value: every [`SUB_LEN`]-gram of the value
/// padded with the begin/end sentinels. Short values produce the single
/// gram that covers them.
#[must_use]
pub fn substring_keys(value: &[u8]) -> Vec<Vec<u8>> {
    let norm = value_normalize(value);
    if norm.is_empty() {
        return Vec::new();
    }
    let mut padded = Vec::with_capacity(norm.len() + 2);
    padded.push(SUB_BEGIN);
    padded.extend_from_slice(&norm);
    padded.push(SUB_END);
    if padded.len() <= SUB_LEN {
        return vec![keyed(SUB_PREFIX, &padded)];
    }
    padded
        .windows(SUB_LEN)
        .map(|gram| keyed(SUB_PREFIX, gram))
        .collect()
}

/// The substring keys a filter pattern constrains: grams from the leading
/// anchor (with [`SUB_BEGIN`]), any middle runs, and the trailing anchor
/// (with [`SUB_END`]). Runs shorter than a gram contribute nothing.
#[must_use]
pub fn substring_pattern_keys(
    initial: Option<&[u8]>,
    middles: &[Vec<u8>],
    final_: Option<&[u8]>,
) -> Vec<Vec<u8>> {
    let mut keys = Vec::new();
    if let Some(initial) = initial {
        let mut padded = vec![SUB_BEGIN];
        padded.extend_from_slice(&value_normalize(initial));
        grams_into(&padded, &mut keys);
    }
    for middle in middles {
        grams_into(&value_normalize(middle), &mut keys);
    }
    if let Some(final_) = final_ {
        let mut padded = value_normalize(final_);
        padded.push(SUB_END);
        grams_into(&padded, &mut keys);
    }
    keys
}

fn grams_into(bytes: &[u8], keys: &mut Vec<Vec<u8>>) {
    if bytes.len() >= SUB_LEN {
        keys.extend(bytes.windows(SUB_LEN).map(|gram| keyed(SUB_PREFIX, gram)));
    }
}

/// Classic four-character soundex, the approximate-index phonetic code.
/// Non-alphabetic leading bytes fall back to the raw normalized value.
#[must_use]
pub fn soundex(value: &[u8]) -> Vec<u8> {
    let norm = value_normalize(value);
    let mut letters = norm.iter().copied().filter(u8::is_ascii_lowercase);
    let Some(first) = letters.next() else {
        return norm;
    };

    let code_of = |c: u8| -> u8 {
        match c {
            b'b' | b'f' | b'p' | b'v' => b'1',
            b'c' | b'g' | b'j' | b'k' | b'q' | b's' | b'x' | b'z' => b'2',
            b'd' | b't' => b'3',
            b'l' => b'4',
            b'm' | b'n' => b'5',
            b'r' => b'6',
            _ => b'0', // vowels and h/w/y separate duplicate codes
        }
    };

    let mut out = vec![first.to_ascii_uppercase()];
    let mut last = code_of(first);
    for c in letters {
        let code = code_of(c);
        if code != b'0' && code != last {
            out.push(code);
            if out.len() == 4 {
                break;
            }
        }
        if c != b'h' && c != b'w' {
            last = code;
        }
    }
    while out.len() < 4 {
        out.push(b'0');
    }
    out
}

/// Renders a key for logs, hex-escaping non-printable bytes.
#[must_use]
pub fn render_key(key: &[u8]) -> String {
    let mut out = String::with_capacity(key.len());
    for &b in key {
        if b.is_ascii_graphic() || b == b' ' {
            out.push(b as char);
        } else {
            out.push_str(&format!("\\x{b:02x}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_carry_prefix_and_terminator() {
        assert_eq!(eq_key(b"alice"), b"=alice\0");
        assert_eq!(presence_key(), b"+\0");
        assert_eq!(rules_key("2.5.13.2", b"abc"), b":2.5.13.2:abc\0");
    }

    #[test]
    fn substring_grams_cover_the_value() {
        let keys = substring_keys(b"Ann");
        // "^ann$" -> ^an, ann, nn$
        assert_eq!(
            keys,
            vec![b"*^an\0".to_vec(), b"*ann\0".to_vec(), b"*nn$\0".to_vec()]
        );
    }

    #[test]
    fn short_values_yield_one_gram() {
        assert_eq!(substring_keys(b"a"), vec![b"*^a$\0".to_vec()]);
        assert_eq!(substring_keys(b""), Vec::<Vec<u8>>::new());
    }

    #[test]
    fn pattern_keys_respect_anchors() {
        // (description=ab*def*yz)
        let keys = substring_pattern_keys(
            Some(b"ab"),
            &[b"def".to_vec()],
            Some(b"yz"),
        );
        assert_eq!(
            keys,
            vec![b"*^ab\0".to_vec(), b"*def\0".to_vec(), b"*yz$\0".to_vec()]
        );
        // Middle runs shorter than a gram constrain nothing.
        assert!(substring_pattern_keys(None, &[b"de".to_vec()], None).is_empty());
    }

    #[test]
    fn soundex_groups_similar_names() {
        assert_eq!(soundex(b"Robert"), soundex(b"Rupert"));
        assert_eq!(soundex(b"Robert"), b"R163".to_vec());
        assert_ne!(soundex(b"Robert"), soundex(b"Smith"));
        // Non-alphabetic values fall back to their normalized bytes.
        assert_eq!(soundex(b"123"), b"123".to_vec());
    }

    #[test]
    fn render_key_escapes_non_printable() {
        assert_eq!(render_key(b"=ab\0"), "=ab\\x00");
    }
}
