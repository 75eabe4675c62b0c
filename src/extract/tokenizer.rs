use std::sync::LazyLock;

use regex::Regex;

/// Splits article text into kanji compounds.
pub trait Tokenizer: Send + Sync {
    fn tokenize(&self, text: &str) -> Vec<String>;
}

// 々〆〇 are in the Han script; ヵヶ appear inside compounds such as 霞ヶ関.
static KANJI_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\p{Han}ヵヶ]+").unwrap());

/// Maximal runs of Han characters, in order of appearance.
#[derive(Debug, Default, Clone, Copy)]
pub struct KanjiTokenizer;

impl Tokenizer for KanjiTokenizer {
    fn tokenize(&self, text: &str) -> Vec<String> {
        KANJI_RUN
            .find_iter(text)
            .map(|m| m.as_str())
            .filter(|run| !run.chars().all(|c| matches!(c, 'ヵ' | 'ヶ')))
            .map(str::to_string)
            .collect()
    }
}
