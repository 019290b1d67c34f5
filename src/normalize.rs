//! Address string clean-up and the degradation ladder.
//!
//! Every transform is total: empty input yields empty output and nothing here
//! can fail. Patterns are tuned for Japanese postal addresses, which usually
//! geocode at block or district granularity even when the building, floor, or
//! room suffix makes the full string unmatchable.

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

/// Prefix used for the country-qualified ladder candidate.
pub const COUNTRY_PREFIX: &str = "日本";

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\s\u{3000}]+").unwrap());

// Always-dash code points: hyphen family, minus sign, swung/wave dashes, tildes.
static DASHES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[\u{2010}-\u{2015}\u{2212}\u{FE58}\u{FE63}\u{FF0D}\u{301C}\u{FF5E}~]").unwrap()
});

// The prolonged sound mark is only a dash when it separates numbers.
static PROLONGED_AFTER_DIGIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d)ー").unwrap());

static PARENTHESES: Lazy<Regex> = Lazy::new(|| Regex::new(r"[（(].*?[）)]").unwrap());

static BUILDING_DETAILS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)地下\d+階",
        r"(?i)地上\d+階",
        r"(?i)\b\d+F\b",
        r"(?i)\bF\d+\b",
        r"\d+階",
        r"\d+号室",
        r"(?i)\bRoom\s*\d+\b",
        r"#\s*\d+\b",
        r"別館",
        r"本館",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).unwrap())
    .collect()
});

static TRAILING_PUNCTUATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\s\-\u{2010}-\u{2015}、。,.]+$").unwrap());

static BLOCK_NUMBERS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+(?:-\d+)*号?").unwrap());
static CHOME: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+丁目").unwrap());
static BANCHI: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+番地?").unwrap());

static POSTAL_CODE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d{3})[-\u{2010}-\u{2015}\u{2212}ー]?\s?(\d{4})").unwrap()
});

/// Collapses whitespace runs, including the ideographic space, to one ASCII space and trims.
pub fn normalize_space(input: &str) -> String {
    WHITESPACE.replace_all(input.trim(), " ").trim().to_string()
}

/// NFKC compatibility normalization: full-width digits, letters and punctuation become half-width.
pub fn to_half_width(input: &str) -> String {
    input.nfkc().collect()
}

pub fn unify_dashes(input: &str) -> String {
    let unified = DASHES.replace_all(input, "-");
    PROLONGED_AFTER_DIGIT
        .replace_all(&unified, "${1}-")
        .into_owned()
}

/// Removes every `(...)` / `（...）` span with its contents.
pub fn strip_parentheses(input: &str) -> String {
    normalize_space(&PARENTHESES.replace_all(input, ""))
}

/// Drops floor, room and wing tokens, then any trailing separators.
pub fn strip_building_details(input: &str) -> String {
    let mut out = input.to_string();
    for pattern in BUILDING_DETAILS.iter() {
        out = pattern.replace_all(&out, "").into_owned();
    }
    let out = TRAILING_PUNCTUATION.replace(&out, "");
    normalize_space(&out)
}

/// Removes block, lot and house numbers, leaving a district-level query.
pub fn simplify_block_level(input: &str) -> String {
    // Suffixed forms go first so their digits are not consumed by the bare-number pass.
    let out = CHOME.replace_all(input, "");
    let out = BANCHI.replace_all(&out, "");
    let out = BLOCK_NUMBERS.replace_all(&out, "");
    normalize_space(&out)
}

/// Full clean-up applied to every raw address before anything else.
pub fn canonicalize(input: &str) -> String {
    unify_dashes(&normalize_space(&to_half_width(input)))
}

/// Finds a `NNN-NNNN` postal code anywhere in `input`.
pub fn detect_postal_code(input: &str) -> Option<String> {
    let text = to_half_width(input);
    POSTAL_CODE
        .captures(&text)
        .map(|caps| format!("{}-{}", &caps[1], &caps[2]))
}

/// Builds the ordered candidate list for one address, most specific first.
///
/// 0. canonical form, with the postal code appended when present
/// 1. parentheses stripped
/// 2. building details stripped
/// 3. country-prefixed step 1
/// 4. step 2 reduced to block level
/// 5. first two tokens of step 4
///
/// Duplicates and empty strings are dropped, keeping first occurrences.
pub fn build_ladder(raw: &str, postal_code: Option<&str>) -> Vec<String> {
    let base = canonicalize(raw);
    if base.is_empty() {
        return Vec::new();
    }

    let postal = postal_code
        .map(normalize_space)
        .filter(|code| !code.is_empty());
    let first = match postal {
        Some(code) => format!("{base} {code}"),
        None => base.clone(),
    };
    let without_parens = strip_parentheses(&base);
    let without_building = strip_building_details(&without_parens);
    let country_prefixed = if without_parens.is_empty() {
        String::new()
    } else {
        format!("{COUNTRY_PREFIX} {without_parens}")
    };
    let block_level = simplify_block_level(&without_building);
    let leading_tokens = block_level
        .split_whitespace()
        .take(2)
        .collect::<Vec<_>>()
        .join(" ");

    let mut ladder: Vec<String> = Vec::with_capacity(6);
    for candidate in [
        first,
        without_parens,
        without_building,
        country_prefixed,
        block_level,
        leading_tokens,
    ] {
        if !candidate.is_empty() && !ladder.contains(&candidate) {
            ladder.push(candidate);
        }
    }
    ladder
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_mixed_whitespace() {
        assert_eq!(normalize_space("  東京都\u{3000}\u{3000}千代田区 \t丸の内 "), "東京都 千代田区 丸の内");
        assert_eq!(normalize_space(""), "");
    }

    #[test]
    fn half_width_conversion_is_idempotent() {
        for sample in ["１２３－４５６７", "ＡＢＣ（受付）", "丸の内１丁目", "", "already ascii 1-2"] {
            let once = to_half_width(sample);
            assert_eq!(to_half_width(&once), once);
        }
        assert_eq!(to_half_width("ＡＢＣ１２３"), "ABC123");
    }

    #[test]
    fn unifies_dashes_without_touching_katakana() {
        assert_eq!(unify_dashes("1−2―3〜4"), "1-2-3-4");
        assert_eq!(unify_dashes("1ー2ー3"), "1-2-3");
        assert_eq!(unify_dashes("センター"), "センター");
    }

    #[test]
    fn strips_parenthetical_spans() {
        assert_eq!(strip_parentheses("第一ビル (受付) 3F（北側）"), "第一ビル 3F");
        assert_eq!(strip_parentheses("no parens"), "no parens");
    }

    #[test]
    fn strips_floor_and_room_tokens() {
        assert_eq!(strip_building_details("丸の内1-1-1 第一ビル 3F"), "丸の内1-1-1 第一ビル");
        assert_eq!(strip_building_details("梅田2-4-9 ブリーゼタワー 12階"), "梅田2-4-9 ブリーゼタワー");
        assert_eq!(strip_building_details("中央区1-2 101号室、"), "中央区1-2");
        assert_eq!(strip_building_details("本町3 別館 B1"), "本町3 B1");
    }

    #[test]
    fn simplifies_to_district_level() {
        assert_eq!(simplify_block_level("千代田区丸の内1-1-1 第一ビル"), "千代田区丸の内 第一ビル");
        assert_eq!(simplify_block_level("中央区銀座4丁目5番地"), "中央区銀座");
        assert_eq!(simplify_block_level("大阪市北区梅田3番1号"), "大阪市北区梅田");
    }

    #[test]
    fn detects_postal_codes() {
        assert_eq!(detect_postal_code("〒１００－０００５"), Some("100-0005".into()));
        assert_eq!(detect_postal_code("1000005"), Some("100-0005".into()));
        assert_eq!(detect_postal_code("no code"), None);
    }

    #[test]
    fn builds_the_documented_ladder() {
        let ladder = build_ladder("東京都千代田区丸の内1-1-1 第一ビル 3F（受付）", None);
        assert_eq!(
            ladder,
            vec![
                "東京都千代田区丸の内1-1-1 第一ビル 3F(受付)".to_string(),
                "東京都千代田区丸の内1-1-1 第一ビル 3F".to_string(),
                "東京都千代田区丸の内1-1-1 第一ビル".to_string(),
                "日本 東京都千代田区丸の内1-1-1 第一ビル 3F".to_string(),
                "東京都千代田区丸の内 第一ビル".to_string(),
            ]
        );
    }

    #[test]
    fn appends_postal_code_to_first_candidate_only() {
        let ladder = build_ladder("千代田区丸の内1-1", Some("100-0005"));
        assert_eq!(ladder[0], "千代田区丸の内1-1 100-0005");
        assert_eq!(ladder[1], "千代田区丸の内1-1");
        assert!(ladder.iter().skip(1).all(|c| !c.contains("100-0005")));
        assert!(ladder.len() <= 6);
    }

    #[test]
    fn deduplicates_and_handles_empty_input() {
        assert!(build_ladder("", None).is_empty());
        assert!(build_ladder(" \u{3000} ", Some("100-0005")).is_empty());
        let ladder = build_ladder("千代田区丸の内", None);
        assert_eq!(ladder, vec!["千代田区丸の内".to_string(), "日本 千代田区丸の内".to_string()]);
    }
}
