// Lookup keys: case, accent and whitespace insensitive spellings

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Key for brand and model spellings: accents stripped, uppercased, runs of
/// whitespace (and the alias separator) collapsed to one space.
pub fn field_key(raw: &str) -> String {
    let folded: String = raw
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .map(|c| if c == '|' { ' ' } else { c })
        .collect::<String>()
        .to_uppercase();
    collapse_whitespace(&folded)
}

/// Key for country spellings. Dots and apostrophes vanish ("U.S.A." == "USA"),
/// any other punctuation separates words.
pub fn country_key(raw: &str) -> String {
    let folded: String = field_key(raw)
        .chars()
        .filter(|c| !matches!(c, '.' | '\'' | '’'))
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    collapse_whitespace(&folded)
}

/// Remove a leading brand name from a model key ("APPLE IPHONE 11" -> "IPHONE 11")
pub fn strip_brand_prefix<'a>(model_key: &'a str, brand_key: &str) -> Option<&'a str> {
    if brand_key.is_empty() {
        return None;
    }
    model_key
        .strip_prefix(brand_key)
        .and_then(|rest| rest.strip_prefix(' '))
        .filter(|rest| !rest.is_empty())
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
