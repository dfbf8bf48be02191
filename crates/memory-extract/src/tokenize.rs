//! Tokenizer and keyword extraction.
//!
//! Mixed-script friendly: ASCII alphanumeric runs become lowercased words,
//! CJK spans become overlapping character bigrams. No dictionary required,
//! which keeps the embedded footprint small.

use std::collections::HashMap;

/// Tokens dropped before keyword ranking.
const STOPWORDS: &[&str] = &[
    "的", "了", "是", "我", "你", "吗", "啊", "呢", "吧", "嘛", "哦", "呀", "什么", "怎么",
    "the", "a", "an", "and", "is", "are", "to", "of", "in", "it", "you",
];

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}' | '\u{3400}'..='\u{4DBF}' | '\u{F900}'..='\u{FAFF}')
}

/// Splits text into ASCII words and CJK bigrams.
pub fn tokenize(text: &str) -> Vec<String> {
    fn flush_ascii(buf: &mut String, tokens: &mut Vec<String>) {
        if !buf.is_empty() {
            tokens.push(buf.to_lowercase());
            buf.clear();
        }
    }
    fn flush_cjk(buf: &mut Vec<char>, tokens: &mut Vec<String>) {
        match buf.len() {
            0 => {}
            1 => tokens.push(buf[0].to_string()),
            _ => {
                for pair in buf.windows(2) {
                    tokens.push(pair.iter().collect());
                }
            }
        }
        buf.clear();
    }

    let mut tokens = Vec::new();
    let mut ascii_buf = String::new();
    let mut cjk_buf: Vec<char> = Vec::new();

    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            flush_cjk(&mut cjk_buf, &mut tokens);
            ascii_buf.push(c);
        } else if is_cjk(c) {
            flush_ascii(&mut ascii_buf, &mut tokens);
            cjk_buf.push(c);
        } else {
            flush_ascii(&mut ascii_buf, &mut tokens);
            flush_cjk(&mut cjk_buf, &mut tokens);
        }
    }
    flush_ascii(&mut ascii_buf, &mut tokens);
    flush_cjk(&mut cjk_buf, &mut tokens);

    tokens
}

/// Top `n` tokens by frequency, stopwords and single-character tokens dropped.
/// Ties break by first occurrence so the result is deterministic.
pub fn keywords(text: &str, n: usize) -> Vec<String> {
    let tokens = tokenize(text);
    let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();

    for (index, token) in tokens.iter().enumerate() {
        if token.chars().count() < 2 || STOPWORDS.contains(&token.as_str()) {
            continue;
        }
        let entry = counts.entry(token.as_str()).or_insert((0, index));
        entry.0 += 1;
    }

    let mut ranked: Vec<(&str, usize, usize)> =
        counts.into_iter().map(|(t, (c, i))| (t, c, i)).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));

    ranked.into_iter().take(n).map(|(t, _, _)| t.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_cjk_into_bigrams() {
        let tokens = tokenize("我喜欢恐龙");
        assert!(tokens.contains(&"喜欢".to_string()));
        assert!(tokens.contains(&"恐龙".to_string()));
    }

    #[test]
    fn tokenizes_mixed_script() {
        let tokens = tokenize("我喜欢 Minecraft 游戏");
        assert!(tokens.contains(&"minecraft".to_string()));
        assert!(tokens.contains(&"游戏".to_string()));
    }

    #[test]
    fn keywords_rank_by_frequency() {
        let kws = keywords("恐龙很大，恐龙很强，今天下雨", 3);
        assert_eq!(kws.first().map(String::as_str), Some("恐龙"));
    }

    #[test]
    fn keywords_drop_stopwords_and_single_chars() {
        let kws = keywords("the is of 我 你 a", 5);
        assert!(kws.is_empty());
    }
}
