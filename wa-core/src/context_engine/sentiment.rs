use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

static TOKEN_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\wáàâãéèêíóôõúç]+").unwrap());

pub static POSITIVE_MARKERS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "obrigado", "obrigada", "perfeito", "ótimo", "otimo", "excelente", "maravilha", "show", "🙏", "😄", "😊",
        "😀", "👍",
    ]
    .into_iter()
    .collect()
});

pub static NEGATIVE_MARKERS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "triste", "chateado", "chateada", "péssimo", "pessimo", "horrível", "horrivel", "raiva", "problema", "erro",
        "reclamação", "reclamacao", "😡", "😢", "😭", "👎", "urgente",
    ]
    .into_iter()
    .collect()
});

pub fn tokenize(text: &str) -> Vec<String> {
    TOKEN_PATTERN.find_iter(&text.to_lowercase()).map(|m| m.as_str().to_string()).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Negative,
    Neutral,
}

impl std::fmt::Display for Sentiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Sentiment::Positive => "positive",
            Sentiment::Negative => "negative",
            Sentiment::Neutral => "neutral",
        };
        write!(f, "{s}")
    }
}

/// Token-level marker scoring with a substring bonus, matching
/// `_analyze_sentiment`: score > 0.5 ⇒ positive, < -0.5 ⇒ negative, else neutral.
pub fn analyze_sentiment(text: &str) -> (Sentiment, f64) {
    let tokens = tokenize(text);
    let mut score = 0.0;
    for token in &tokens {
        if POSITIVE_MARKERS.contains(token.as_str()) {
            score += 1.0;
        }
        if NEGATIVE_MARKERS.contains(token.as_str()) {
            score -= 1.0;
        }
    }
    if POSITIVE_MARKERS.iter().any(|m| text.contains(m)) {
        score += 0.5;
    }
    if NEGATIVE_MARKERS.iter().any(|m| text.contains(m)) {
        score -= 0.5;
    }
    if score > 0.5 {
        (Sentiment::Positive, score.min(5.0))
    } else if score < -0.5 {
        (Sentiment::Negative, score.max(-5.0))
    } else {
        (Sentiment::Neutral, score)
    }
}

/// Presence of positive/negative emoji or keywords, matching `_detect_feedback`.
pub fn detect_feedback(text: &str) -> Option<&'static str> {
    let lowered = text.to_lowercase();
    if text.contains('👍') || text.contains(":)") || lowered.contains("obrigado") || lowered.contains("obrigada") {
        return Some("positive");
    }
    if text.contains('👎') || text.contains(":(") || lowered.contains("nao gostei") || lowered.contains("não gostei") {
        return Some("negative");
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_markers_yield_positive_sentiment() {
        let (sentiment, score) = analyze_sentiment("muito obrigado, perfeito!");
        assert_eq!(sentiment, Sentiment::Positive);
        assert!(score > 0.5);
    }

    #[test]
    fn negative_markers_yield_negative_sentiment() {
        let (sentiment, _) = analyze_sentiment("que problema horrível, estou com raiva");
        assert_eq!(sentiment, Sentiment::Negative);
    }

    #[test]
    fn neutral_when_no_markers_present() {
        let (sentiment, score) = analyze_sentiment("qual o horário de funcionamento?");
        assert_eq!(sentiment, Sentiment::Neutral);
        assert_eq!(score, 0.0);
    }

    #[test]
    fn detects_positive_and_negative_feedback() {
        assert_eq!(detect_feedback("valeu, obrigado 👍"), Some("positive"));
        assert_eq!(detect_feedback("não gostei do atendimento"), Some("negative"));
        assert_eq!(detect_feedback("qual o preço?"), None);
    }
}
