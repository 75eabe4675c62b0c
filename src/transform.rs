use std::collections::HashSet;

use serde::Serialize;

use crate::error::{PipelineError, Result};
use crate::extract::translate::top_level;

/// One row of the `japan_news` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenRecord {
    pub kanji: String,
    pub pos: String,
    pub pos_translated: String,
}

/// Zip the three parallel columns into rows. Unequal lengths are an error,
/// never a silent truncation.
pub fn build_records(
    kanji: Vec<String>,
    pos: Vec<String>,
    pos_translated: Vec<String>,
) -> Result<Vec<TokenRecord>> {
    if kanji.len() != pos.len() || kanji.len() != pos_translated.len() {
        return Err(PipelineError::Alignment {
            kanji: kanji.len(),
            pos: pos.len(),
            pos_translated: pos_translated.len(),
        });
    }
    Ok(kanji
        .into_iter()
        .zip(pos)
        .zip(pos_translated)
        .map(|((kanji, pos), pos_translated)| TokenRecord {
            kanji,
            pos,
            pos_translated,
        })
        .collect())
}

/// Hiragana, katakana (full and half width), CJK ideographs and the
/// ideographic iteration/closing marks. Punctuation such as 、 and 。 is not.
pub fn is_japanese_char(c: char) -> bool {
    matches!(c,
        '\u{3041}'..='\u{309F}'
        | '\u{30A0}'..='\u{30FF}'
        | '\u{31F0}'..='\u{31FF}'
        | '\u{3005}'..='\u{3007}'
        | '\u{3400}'..='\u{4DBF}'
        | '\u{4E00}'..='\u{9FFF}'
        | '\u{F900}'..='\u{FAFF}'
        | '\u{FF66}'..='\u{FF9F}'
        | '\u{20000}'..='\u{2FA1F}'
    )
}

pub fn filter_non_japanese(records: Vec<TokenRecord>) -> Vec<TokenRecord> {
    records
        .into_iter()
        .filter(|r| r.kanji.chars().any(is_japanese_char))
        .collect()
}

/// Drop rows whose label, or its top-level category, is excluded.
pub fn filter_excluded_pos(
    records: Vec<TokenRecord>,
    excluded: &HashSet<String>,
) -> Vec<TokenRecord> {
    records
        .into_iter()
        .filter(|r| !excluded.contains(&r.pos) && !excluded.contains(top_level(&r.pos)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(xs: &[&str]) -> Vec<String> {
        xs.iter().map(|s| s.to_string()).collect()
    }

    fn row(kanji: &str, pos: &str) -> TokenRecord {
        TokenRecord {
            kanji: kanji.into(),
            pos: pos.into(),
            pos_translated: "x".into(),
        }
    }

    #[test]
    fn zips_in_order() {
        let rows = build_records(
            strings(&["東京", "政府"]),
            strings(&["名詞", "名詞"]),
            strings(&["Noun", "Noun"]),
        )
        .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].kanji, "政府");
        assert_eq!(rows[0].pos_translated, "Noun");
    }

    #[test]
    fn mismatch_is_alignment_error() {
        let err = build_records(
            strings(&["東京", "政府"]),
            strings(&["名詞"]),
            strings(&["Noun", "Noun"]),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Alignment { kanji: 2, pos: 1, pos_translated: 2 }));
    }

    #[test]
    fn punctuation_dropped() {
        let rows = vec![row("、", "記号"), row("東京", "名詞"), row("abc", "名詞")];
        let kept = filter_non_japanese(rows);
        assert_eq!(kept, vec![row("東京", "名詞")]);
    }

    #[test]
    fn kana_and_marks_count_as_japanese() {
        for s in ["ひらがな", "カタカナ", "ｶﾀｶﾅ", "人々", "〆切", "ー東"] {
            assert!(s.chars().any(is_japanese_char), "{s}");
        }
        for s in ["、", "。", "「」", "123", "ＡＢＣ"] {
            assert!(!s.chars().any(is_japanese_char), "{s}");
        }
    }

    #[test]
    fn excluded_pos_dropped_in_order() {
        let excluded: HashSet<String> = strings(&["記号", "補助記号"]).into_iter().collect();
        let rows = vec![
            row("東京", "名詞"),
            row("※", "記号"),
            row("走る", "動詞"),
            row("・", "補助記号"),
        ];
        let kept = filter_excluded_pos(rows, &excluded);
        assert_eq!(kept, vec![row("東京", "名詞"), row("走る", "動詞")]);
    }

    #[test]
    fn excluded_pos_matches_subcategories() {
        let excluded: HashSet<String> = strings(&["補助記号"]).into_iter().collect();
        let rows = vec![
            row("東京", "名詞-固有名詞-地名"),
            row("。", "補助記号-句点"),
            row("「", "補助記号,括弧開"),
        ];
        let kept = filter_excluded_pos(rows, &excluded);
        assert_eq!(kept, vec![row("東京", "名詞-固有名詞-地名")]);
    }

    #[test]
    fn filters_commute() {
        let excluded: HashSet<String> = strings(&["記号"]).into_iter().collect();
        let rows = vec![
            row("、", "記号"),
            row("東京", "記号"),
            row("abc", "名詞"),
            row("大阪", "名詞"),
        ];
        let a = filter_excluded_pos(filter_non_japanese(rows.clone()), &excluded);
        let b = filter_non_japanese(filter_excluded_pos(rows, &excluded));
        assert_eq!(a, b);
    }
}
