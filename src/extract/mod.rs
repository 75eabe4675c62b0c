pub mod tagger;
pub mod tokenizer;
pub mod translate;

use rayon::prelude::*;
use tracing::debug;

use crate::error::{PipelineError, Result};
use tagger::PosTagger;
use tokenizer::Tokenizer;
use translate::PosTranslator;

/// Parallel extraction outputs. Only built once all three agree in length.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TokenColumns {
    pub kanji: Vec<String>,
    pub pos: Vec<String>,
    pub pos_translated: Vec<String>,
}

impl TokenColumns {
    pub fn len(&self) -> usize {
        self.kanji.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kanji.is_empty()
    }
}

/// Kanji compounds of every text, concatenated in text order.
pub fn extract_tokens(tokenizer: &dyn Tokenizer, texts: &[String]) -> Vec<String> {
    let per_text: Vec<Vec<String>> = texts.par_iter().map(|t| tokenizer.tokenize(t)).collect();
    per_text.into_iter().flatten().collect()
}

pub fn tag_pos(tagger: &dyn PosTagger, tokens: &[String]) -> Vec<String> {
    tagger.tag_all(tokens)
}

pub fn translate_pos(translator: &dyn PosTranslator, tags: &[String]) -> Result<Vec<String>> {
    tags.iter()
        .map(|tag| {
            translator
                .translate(tag)
                .ok_or_else(|| PipelineError::UntranslatedPos(tag.clone()))
        })
        .collect()
}

pub fn validate_alignment(kanji: &[String], pos: &[String], pos_translated: &[String]) -> bool {
    kanji.len() == pos.len() && pos.len() == pos_translated.len()
}

pub fn ensure_aligned(kanji: &[String], pos: &[String], pos_translated: &[String]) -> Result<()> {
    if validate_alignment(kanji, pos, pos_translated) {
        Ok(())
    } else {
        Err(PipelineError::Alignment {
            kanji: kanji.len(),
            pos: pos.len(),
            pos_translated: pos_translated.len(),
        })
    }
}

/// texts → kanji → pos → gloss, then the alignment check.
pub fn extract_columns(
    tokenizer: &dyn Tokenizer,
    tagger: &dyn PosTagger,
    translator: &dyn PosTranslator,
    texts: &[String],
) -> Result<TokenColumns> {
    let kanji = extract_tokens(tokenizer, texts);
    let pos = tag_pos(tagger, &kanji);
    let pos_translated = translate_pos(translator, &pos)?;
    ensure_aligned(&kanji, &pos, &pos_translated)?;
    debug!(tokens = kanji.len(), texts = texts.len(), "extracted token columns");
    Ok(TokenColumns {
        kanji,
        pos,
        pos_translated,
    })
}
