use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

use super::sentiment::tokenize;
use super::Profile;

/// Stopwords excluded from topic extraction, trimmed to the Portuguese set
/// `_extract_topics` filters on. Not exhaustive, matching the original.
static STOPWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "de", "da", "do", "das", "dos", "a", "o", "e", "que", "um", "uma", "para", "com", "em", "por", "me", "meu",
        "minha", "tem", "ter", "vou", "quero", "gostaria", "pode", "poderia", "qual", "quais", "como", "quando",
        "onde", "sim", "nao", "não",
    ]
    .into_iter()
    .collect()
});

static PRODUCT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(produto|modelo|plano|pacote)\s+([\wáàâãéèêíóôõúç\-]+)").unwrap());

/// Tokenizes `text`, drops stopwords and short tokens, and returns the
/// remaining candidate topic words in order of first appearance.
/// Mirrors `_extract_topics` in `app/services/context_engine.py`.
fn extract_topics(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut topics = Vec::new();
    for token in tokenize(text) {
        if token.len() < 4 || STOPWORDS.contains(token.as_str()) {
            continue;
        }
        if seen.insert(token.clone()) {
            topics.push(token);
        }
    }
    topics
}

/// Captures `"produto X"`/`"modelo X"`/`"plano X"`/`"pacote X"` mentions.
/// Mirrors `_extract_products`.
fn extract_products(text: &str) -> Vec<String> {
    PRODUCT_PATTERN.captures_iter(text).map(|c| c[2].to_lowercase()).collect()
}

/// Folds a new user turn's topics/products into the profile and records
/// `preferences.ultimo_assunto` to `extract_topics`'s first hit, keeping
/// `frequent_topics`/`product_mentions` bounded at the same cap the
/// original uses (20 entries) to avoid unbounded row growth.
///
/// This is the hook the out-of-scope external training collaborator
/// (`spec.md` §1) calls through the persistence contract — no HTTP
/// surface in this crate invokes it end-to-end, but its presence belongs
/// to the core's public API per `context_engine.py::retrain_profile`.
pub fn retrain_profile(mut profile: Profile, user_text: &str) -> Profile {
    const MAX_ENTRIES: usize = 20;

    for topic in extract_topics(user_text) {
        if !profile.frequent_topics.iter().any(|t| t == &topic) {
            profile.frequent_topics.push(topic);
        }
    }
    if profile.frequent_topics.len() > MAX_ENTRIES {
        let overflow = profile.frequent_topics.len() - MAX_ENTRIES;
        profile.frequent_topics.drain(0..overflow);
    }

    for product in extract_products(user_text) {
        if !profile.product_mentions.iter().any(|p| p == &product) {
            profile.product_mentions.push(product);
        }
    }
    if profile.product_mentions.len() > MAX_ENTRIES {
        let overflow = profile.product_mentions.len() - MAX_ENTRIES;
        profile.product_mentions.drain(0..overflow);
    }

    if let Some(first_product) = profile.product_mentions.first().cloned() {
        if let Some(obj) = profile.preferences.as_object_mut() {
            obj.insert("ultimo_produto".to_string(), serde_json::Value::String(first_product));
        }
    }

    profile
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_topics_excluding_stopwords_and_short_tokens() {
        let topics = extract_topics("quero saber sobre o horário de entrega do pedido");
        assert!(topics.contains(&"horário".to_string()));
        assert!(topics.contains(&"entrega".to_string()));
        assert!(!topics.iter().any(|t| STOPWORDS.contains(t.as_str())));
    }

    #[test]
    fn extracts_product_mentions_from_pattern() {
        let products = extract_products("quero saber o preço do produto xpto-500");
        assert_eq!(products, vec!["xpto-500".to_string()]);
    }

    #[test]
    fn retrain_profile_accumulates_topics_and_products_without_duplicates() {
        let profile = Profile::default();
        let profile = retrain_profile(profile, "quero saber sobre o produto xpto-500");
        assert!(profile.product_mentions.contains(&"xpto-500".to_string()));
        let profile = retrain_profile(profile, "ainda sobre o produto xpto-500, qual o prazo?");
        assert_eq!(profile.product_mentions.iter().filter(|p| *p == "xpto-500").count(), 1);
    }

    #[test]
    fn retrain_profile_caps_frequent_topics_at_twenty() {
        let mut profile = Profile::default();
        for i in 0..25 {
            profile = retrain_profile(profile, &format!("assuntodistinto{i:02} quero falar sobre isso"));
        }
        assert!(profile.frequent_topics.len() <= 20);
    }
}
