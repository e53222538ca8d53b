//! Name collation used for every alphabetical tie-break.
//!
//! Strategies never compare display names with `str::cmp`; they go through an
//! injected [`Collator`] so the ordering is the same on every platform. The
//! default deployment locale is Swedish, where `å`, `ä` and `ö` are letters of
//! their own that sort after `z`.

use std::cmp::Ordering;

use unicode_normalization::UnicodeNormalization;

pub trait Collator: Send + Sync {
    fn compare(&self, lhs: &str, rhs: &str) -> Ordering;
}

/// Plain code point order. Useful for deployments without a linguistic locale.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrdinalCollator;

impl Collator for OrdinalCollator {
    fn compare(&self, lhs: &str, rhs: &str) -> Ordering {
        lhs.cmp(rhs)
    }
}

/// Swedish alphabetical order.
///
/// Primary level: `a`..`z`, then `å`, `ä`, `ö`. `æ` is a variant of `ä`,
/// `ø` of `ö` and `ü` of `y`; `w` is a letter of its own. Whitespace sorts
/// before punctuation, punctuation before digits, digits before letters.
/// Secondary level: diacritics (`e` < `é`). Tertiary level: case, lowercase
/// first. Strings equal at all three levels fall back to code point order.
#[derive(Debug, Clone, Copy, Default)]
pub struct SwedishCollator;

impl SwedishCollator {
    #[must_use]
    pub fn sort_key(value: &str) -> SortKey {
        let mut key = SortKey {
            primary: Vec::new(),
            secondary: Vec::new(),
            tertiary: Vec::new(),
            raw: value.to_string(),
        };

        for ch in value.nfc() {
            let case = u8::from(ch.is_uppercase());
            for lower in ch.to_lowercase() {
                let (primary, secondary) = weigh(lower);
                key.primary.push(primary);
                key.secondary.push(secondary);
                key.tertiary.push(case);
            }
        }

        key
    }
}

impl Collator for SwedishCollator {
    fn compare(&self, lhs: &str, rhs: &str) -> Ordering {
        Self::sort_key(lhs).cmp(&Self::sort_key(rhs))
    }
}

/// Multi-level collation key; field order is comparison order.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct SortKey {
    primary: Vec<(CharClass, u32)>,
    secondary: Vec<u32>,
    tertiary: Vec<u8>,
    raw: String,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
enum CharClass {
    Whitespace,
    Punctuation,
    Digit,
    Letter,
}

const LATIN_LETTERS: u32 = 26;
const ARING: u32 = LATIN_LETTERS + 1;
const ADIAERESIS: u32 = LATIN_LETTERS + 2;
const ODIAERESIS: u32 = LATIN_LETTERS + 3;
// Letters outside the Swedish alphabet keep code point order after `ö`.
const FOREIGN_LETTER_BASE: u32 = 0x1_0000;

fn weigh(lower: char) -> ((CharClass, u32), u32) {
    match lower {
        'å' => ((CharClass::Letter, ARING), 0),
        'ä' => ((CharClass::Letter, ADIAERESIS), 0),
        'æ' => ((CharClass::Letter, ADIAERESIS), 1),
        'ö' => ((CharClass::Letter, ODIAERESIS), 0),
        'ø' => ((CharClass::Letter, ODIAERESIS), 1),
        'ü' => ((CharClass::Letter, latin_weight('y')), 1),
        _ => {
            let mut decomposed = std::iter::once(lower).nfd();
            let base = decomposed.next().unwrap_or(lower);
            let secondary = decomposed.map(u32::from).sum::<u32>();
            (primary_weight(base), secondary)
        }
    }
}

fn primary_weight(base: char) -> (CharClass, u32) {
    if base.is_ascii_lowercase() {
        return (CharClass::Letter, latin_weight(base));
    }
    if let Some(digit) = base.to_digit(10) {
        return (CharClass::Digit, digit);
    }
    if base.is_alphabetic() {
        return (CharClass::Letter, FOREIGN_LETTER_BASE + u32::from(base));
    }
    if base.is_whitespace() {
        return (CharClass::Whitespace, u32::from(base));
    }
    (CharClass::Punctuation, u32::from(base))
}

fn latin_weight(letter: char) -> u32 {
    u32::from(letter) - u32::from('a') + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted(collator: &dyn Collator, names: &[&str]) -> Vec<String> {
        let mut names = names.iter().map(ToString::to_string).collect::<Vec<_>>();
        names.sort_by(|lhs, rhs| collator.compare(lhs, rhs));
        names
    }

    #[test]
    fn swedish_letters_sort_after_z_in_alphabet_order() {
        assert_eq!(
            sorted(&SwedishCollator, &["Östen", "Åsa", "Zelda", "Ärla", "Anna"]),
            vec!["Anna", "Zelda", "Åsa", "Ärla", "Östen"]
        );
    }

    #[test]
    fn ordinal_order_differs_from_swedish_order() {
        assert_eq!(sorted(&OrdinalCollator, &["Ärla", "Åsa"]), vec!["Ärla", "Åsa"]);
        assert_eq!(sorted(&SwedishCollator, &["Ärla", "Åsa"]), vec!["Åsa", "Ärla"]);
        assert_eq!(sorted(&OrdinalCollator, &["bo", "Cecilia"]), vec!["Cecilia", "bo"]);
        assert_eq!(sorted(&SwedishCollator, &["bo", "Cecilia"]), vec!["bo", "Cecilia"]);
    }

    #[test]
    fn variants_share_a_primary_letter() {
        let ae = sorted(&SwedishCollator, &["Æsa", "Ärla", "Åke"]);
        assert_eq!(ae, vec!["Åke", "Ärla", "Æsa"]);

        let oe = sorted(&SwedishCollator, &["Øyvind", "Östen", "Zorn"]);
        assert_eq!(oe, vec!["Zorn", "Östen", "Øyvind"]);

        let ue = sorted(&SwedishCollator, &["Mz", "Myra", "Müller"]);
        assert_eq!(ue, vec!["Müller", "Myra", "Mz"]);
    }

    #[test]
    fn diacritics_are_secondary_and_case_is_tertiary() {
        assert_eq!(sorted(&SwedishCollator, &["Eva", "Éva", "Ewa"]), vec!["Eva", "Éva", "Ewa"]);
        let cased = sorted(&SwedishCollator, &["Erik", "erik", "Erika"]);
        assert_eq!(cased, vec!["erik", "Erik", "Erika"]);
        assert_eq!(SwedishCollator.compare("Lisa", "Lisa"), Ordering::Equal);
    }

    #[test]
    fn decomposed_input_collates_like_composed_input() {
        let decomposed = "A\u{30a}sa";
        assert_eq!(SwedishCollator.compare(decomposed, "Zelda"), Ordering::Greater);
        assert_eq!(SwedishCollator.compare(decomposed, "Ärla"), Ordering::Less);
    }

    #[test]
    fn whitespace_punctuation_digits_precede_letters() {
        assert_eq!(
            sorted(&SwedishCollator, &["Anna B", "Anna-B", "Anna2", "AnnaB"]),
            vec!["Anna B", "Anna-B", "Anna2", "AnnaB"]
        );
    }
}
