use once_cell::sync::Lazy;
use std::collections::HashSet;

use super::sentiment::tokenize;
use super::HistoryTurn;

static GREETING_WORDS: Lazy<HashSet<&'static str>> =
    Lazy::new(|| ["oi", "ola", "olá", "bom", "dia", "tarde", "noite", "eae", "opa"].into_iter().collect());

static CLOSING_WORDS: Lazy<HashSet<&'static str>> =
    Lazy::new(|| ["tchau", "ate", "até", "valeu", "obrigado", "obrigada", "falou", "flw"].into_iter().collect());

static URGENCY_WORDS: Lazy<HashSet<&'static str>> =
    Lazy::new(|| ["urgente", "agora", "rapido", "rápido", "imediato", "socorro"].into_iter().collect());

/// Question tokens whose presence (or a literal `?`) signals `doubt`,
/// matching `context_engine.py:244` exactly.
static QUESTION_TOKENS: Lazy<HashSet<&'static str>> =
    Lazy::new(|| ["como", "quando", "onde", "qual", "quais", "pode"].into_iter().collect());

/// Short-acknowledgement openers, matching `context_engine.py:246`.
static ACK_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| ["sim", "ok", "claro", "beleza", "manda"].into_iter().collect());

/// Exact (whole-message) confirmation replies, matching
/// `context_engine.py:253` — `sanitized in {"sim", "isso", "certo"}`.
static CONFIRMATION_REPLIES: Lazy<HashSet<&'static str>> = Lazy::new(|| ["sim", "isso", "certo"].into_iter().collect());

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intention {
    Greeting,
    Closing,
    Urgency,
    Doubt,
    Acknowledgement,
    Confirmation,
    FollowUp,
}

impl std::fmt::Display for Intention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Intention::Greeting => "greeting",
            Intention::Closing => "closing",
            Intention::Urgency => "urgency",
            Intention::Doubt => "doubt",
            Intention::Acknowledgement => "acknowledgement",
            Intention::Confirmation => "confirmation",
            Intention::FollowUp => "follow_up",
        };
        write!(f, "{s}")
    }
}

/// Cascade over the tokenized message, matching `_detect_intention`:
/// greeting → closing → urgency → doubt (question mark + question token) →
/// acknowledgement (short ack opener) → confirmation (history-aware, exact
/// reply match) → follow_up as the catch-all default.
pub fn detect_intention(text: &str, history: &[HistoryTurn]) -> Intention {
    let sanitized = text.to_lowercase().trim().to_string();
    if sanitized.is_empty() {
        return Intention::FollowUp;
    }

    let tokens = tokenize(&sanitized);

    if GREETING_WORDS.iter().any(|w| sanitized.contains(w)) {
        return Intention::Greeting;
    }
    if CLOSING_WORDS.iter().any(|w| sanitized.contains(w)) {
        return Intention::Closing;
    }
    if URGENCY_WORDS.iter().any(|w| sanitized.contains(w)) {
        return Intention::Urgency;
    }
    if sanitized.contains('?') || tokens.iter().any(|t| QUESTION_TOKENS.contains(t.as_str())) {
        return Intention::Doubt;
    }
    if !tokens.is_empty() && tokens.len() <= 2 && ACK_WORDS.contains(tokens[0].as_str()) {
        return Intention::Acknowledgement;
    }

    let last_user = history.iter().rev().find(|t| t.role == "user");
    if let Some(last_user) = last_user {
        if !last_user.body.trim().is_empty() && CONFIRMATION_REPLIES.contains(sanitized.as_str()) {
            return Intention::Confirmation;
        }
    }

    Intention::FollowUp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_greeting() {
        assert_eq!(detect_intention("oi, bom dia!", &[]), Intention::Greeting);
    }

    #[test]
    fn detects_closing() {
        assert_eq!(detect_intention("valeu, tchau!", &[]), Intention::Closing);
    }

    #[test]
    fn detects_urgency_over_doubt() {
        assert_eq!(detect_intention("preciso de ajuda urgente agora", &[]), Intention::Urgency);
    }

    #[test]
    fn detects_doubt_from_question_mark() {
        assert_eq!(detect_intention("qual o horário de vocês?", &[]), Intention::Doubt);
    }

    #[test]
    fn detects_doubt_from_question_token_without_question_mark() {
        assert_eq!(detect_intention("quais produtos voces tem", &[]), Intention::Doubt);
        assert_eq!(detect_intention("pode me ajudar com isso", &[]), Intention::Doubt);
    }

    #[test]
    fn por_favor_is_not_treated_as_a_question() {
        assert_eq!(detect_intention("por favor me avise quando chegar", &[]), Intention::Doubt);
    }

    #[test]
    fn detects_short_acknowledgement() {
        assert_eq!(detect_intention("ok entendi", &[]), Intention::Acknowledgement);
    }

    #[test]
    fn detects_confirmation_only_with_prior_user_turn() {
        let history = vec![HistoryTurn::user("posso confirmar seu pedido?"), HistoryTurn::assistant("claro, pode confirmar")];
        assert_eq!(detect_intention("sim", &history), Intention::Confirmation);
        assert_eq!(detect_intention("certo", &history), Intention::Confirmation);
        assert_eq!(detect_intention("sim", &[]), Intention::FollowUp);
    }

    #[test]
    fn confirmation_requires_exact_reply_not_a_token_match() {
        let history = vec![HistoryTurn::user("pedido anterior")];
        assert_eq!(detect_intention("confirmado, pode seguir", &history), Intention::FollowUp);
    }

    #[test]
    fn falls_back_to_follow_up() {
        assert_eq!(detect_intention("eu queria saber mais sobre o produto X", &[]), Intention::FollowUp);
    }
}
