//! Small text helpers shared by ingestion, the hashing embedder and the
//! lexical reranker.

/// Words that flip the polarity of a statement, in Portuguese and English.
const NEGATIONS: &[&str] = &[
    "não", "nao", "nem", "nunca", "jamais", "sem", "nenhum", "nenhuma", "not",
    "never", "without", "none",
];

/// High-frequency function words that carry no retrieval signal.
const STOPWORDS: &[&str] = &[
    "a", "o", "as", "os", "de", "da", "do", "das", "dos", "e", "é", "em", "no",
    "na", "nos", "nas", "um", "uma", "para", "por", "com", "que", "qual",
    "quais", "se", "ao", "aos", "à", "às", "the", "of", "and", "to", "in", "is",
    "for", "on", "what", "which", "how",
];

/// Collapse runs of whitespace into single spaces and trim both ends.
pub fn collapse_whitespace(line: &str) -> String {
    line.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// A short, all-digit line is a page number left over from extraction.
pub fn is_page_number(line: &str) -> bool {
    let trimmed = line.trim();
    !trimmed.is_empty()
        && trimmed.chars().count() < 5
        && trimmed.chars().all(|c| c.is_ascii_digit())
}

/// Replace every digit with `#` so running headers that carry a page
/// number ("Relatório de Inflação | 12") compare equal across pages.
pub fn mask_digits(line: &str) -> String {
    line.chars()
        .map(|c| if c.is_ascii_digit() { '#' } else { c })
        .collect()
}

/// Split text into lowercase word tokens.
///
/// Decimal separators between digits are kept, so `4,5%` yields `4,5`
/// rather than two unrelated numbers.
pub fn tokenize(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut current = String::new();

    for (i, &c) in chars.iter().enumerate() {
        if c.is_alphanumeric() {
            current.extend(c.to_lowercase());
            continue;
        }

        let joins_digits = (c == ',' || c == '.')
            && current.chars().last().is_some_and(|p| p.is_ascii_digit())
            && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit());
        if joins_digits {
            current.push(c);
            continue;
        }

        if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }

    if !current.is_empty() {
        tokens.push(current);
    }

    tokens
}

/// Tokens worth matching on: stopwords removed.
pub fn content_tokens(text: &str) -> Vec<String> {
    tokenize(text)
        .into_iter()
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect()
}

pub fn is_numeric_token(token: &str) -> bool {
    token.chars().next().is_some_and(|c| c.is_ascii_digit())
        && token
            .chars()
            .all(|c| c.is_ascii_digit() || c == ',' || c == '.')
}

pub fn is_negation(token: &str) -> bool {
    NEGATIONS.contains(&token)
}

/// Cut `text` to at most `max_chars` characters, backing off to the last
/// whitespace when one exists in the second half of the window.
pub fn truncate_at_word(text: &str, max_chars: usize) -> &str {
    let Some((cut, _)) = text.char_indices().nth(max_chars) else {
        return text;
    };

    let head = &text[..cut];
    match head.rfind(char::is_whitespace) {
        Some(ws) if head[..ws].chars().count() >= max_chars / 2 => {
            head[..ws].trim_end()
        }
        _ => head,
    }
}
