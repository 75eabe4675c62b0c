use std::collections::HashMap;

/// English gloss for a part-of-speech label. `None` means the label is
/// unknown, which the extraction stage treats as fatal.
pub trait PosTranslator: Send + Sync {
    fn translate(&self, label: &str) -> Option<String>;
}

/// Top-level IPADIC and UniDic categories.
const BUILTIN: &[(&str, &str)] = &[
    ("名詞", "Noun"),
    ("代名詞", "Pronoun"),
    ("動詞", "Verb"),
    ("形容詞", "Adjective"),
    ("形状詞", "Adjectival noun"),
    ("副詞", "Adverb"),
    ("連体詞", "Adnominal"),
    ("接続詞", "Conjunction"),
    ("感動詞", "Interjection"),
    ("助詞", "Particle"),
    ("助動詞", "Auxiliary verb"),
    ("接頭詞", "Prefix"),
    ("接頭辞", "Prefix"),
    ("接尾辞", "Suffix"),
    ("記号", "Symbol"),
    ("補助記号", "Supplementary symbol"),
    ("空白", "Whitespace"),
    ("フィラー", "Filler"),
    ("その他", "Other"),
];

#[derive(Debug, Clone)]
pub struct PosTable {
    glosses: HashMap<String, String>,
}

impl PosTable {
    pub fn builtin() -> Self {
        Self {
            glosses: BUILTIN
                .iter()
                .map(|(ja, en)| (ja.to_string(), en.to_string()))
                .collect(),
        }
    }

    /// Builtin table plus extra entries; extras win on conflict.
    pub fn with_extra(extra: HashMap<String, String>) -> Self {
        let mut table = Self::builtin();
        table.glosses.extend(extra);
        table
    }
}

impl Default for PosTable {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Top-level category of a label. UniDic style labels carry subcategories
/// (名詞-普通名詞-一般), IPADIC ones are comma separated (動詞,自立).
pub fn top_level(label: &str) -> &str {
    label.split(['-', ',']).next().unwrap_or(label)
}

impl PosTranslator for PosTable {
    fn translate(&self, label: &str) -> Option<String> {
        self.glosses
            .get(label)
            .or_else(|| self.glosses.get(top_level(label)))
            .cloned()
    }
}
