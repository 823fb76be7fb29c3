use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Media,
    Interactive,
    Template,
}

#[derive(Debug, Clone)]
pub struct NormalizedMessage {
    pub number: String,
    pub text: String,
    pub kind: MessageKind,
}

static SWEEP_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{11,})@(s\.whatsapp\.net|lid|g\.us|broadcast)").unwrap());

const DISALLOWED_SUFFIXES: [&str; 2] = ["@g.us", "@broadcast"];

fn digits_only(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

fn normalize_country_code(digits: String) -> Option<String> {
    if digits.len() < 11 {
        return None;
    }
    if digits.starts_with("55") {
        Some(digits)
    } else {
        Some(format!("55{digits}"))
    }
}

/// Accepts a jid only when suffixed exactly `@s.whatsapp.net`; `@g.us` and
/// `@broadcast` (and anything else) are rejected, matching
/// `extract_number`'s `_KNOWN_SUFFIXES`/`_DISALLOWED_SUFFIXES` handling.
fn extract_from_jid(jid: &str) -> Option<String> {
    if DISALLOWED_SUFFIXES.iter().any(|s| jid.ends_with(s)) {
        return None;
    }
    let local = jid.strip_suffix("@s.whatsapp.net")?;
    normalize_country_code(digits_only(local))
}

fn extract_number_from_key(key: &Value) -> Option<String> {
    for field in ["remoteJid", "remoteJidAlt", "participant"] {
        if let Some(jid) = key.get(field).and_then(Value::as_str) {
            if let Some(number) = extract_from_jid(jid) {
                return Some(number);
            }
        }
    }
    None
}

fn extract_flat_number(payload: &Value) -> Option<String> {
    let candidates = [
        payload.get("number").and_then(Value::as_str),
        payload.get("from").and_then(Value::as_str),
        payload.pointer("/contact/number").and_then(Value::as_str),
        payload.pointer("/contact/phone").and_then(Value::as_str),
        payload.pointer("/ticket/contact/number").and_then(Value::as_str),
        payload.pointer("/ticket/contact/phone").and_then(Value::as_str),
    ];
    for raw in candidates.into_iter().flatten() {
        let digits = digits_only(raw);
        if digits.len() >= 11 {
            return normalize_country_code(digits);
        }
    }
    None
}

fn extract_number_by_sweep(payload: &Value) -> Option<String> {
    let serialized = serde_json::to_string(payload).ok()?;
    let captures = SWEEP_PATTERN.captures(&serialized)?;
    let digits = captures.get(1)?.as_str();
    let suffix = captures.get(2)?.as_str();
    if DISALLOWED_SUFFIXES.iter().any(|s| s.trim_start_matches('@') == suffix) {
        return None;
    }
    normalize_country_code(digits.to_string())
}

/// Number extraction: nested envelope → flat fields → regex sweep, first
/// match wins. Mirrors `extract_number` in `app/services/payload.py`.
pub fn extract_number(payload: &Value) -> Option<String> {
    if let Some(key) = payload.get("key") {
        if let Some(number) = extract_number_from_key(key) {
            return Some(number);
        }
    }
    if let Some(number) = extract_flat_number(payload) {
        return Some(number);
    }
    extract_number_by_sweep(payload)
}

struct ExtractedText {
    text: String,
    kind: MessageKind,
}

fn text_of(value: &Value, fields: &[&str]) -> Option<String> {
    fields.iter().find_map(|f| value.get(*f).and_then(Value::as_str)).map(str::to_string)
}

/// Unwraps one layer of `ephemeralMessage.message`, then dispatches on the
/// known WhatsApp message-type keys, matching `_extract_from_message`.
fn extract_from_message(message: &Value) -> Option<ExtractedText> {
    let message = message.get("ephemeralMessage").and_then(|e| e.get("message")).unwrap_or(message);

    for media_key in ["imageMessage", "videoMessage", "documentMessage"] {
        if let Some(media) = message.get(media_key) {
            if let Some(text) = text_of(media, &["caption", "fileName"]) {
                return Some(ExtractedText { text, kind: MessageKind::Media });
            }
            return Some(ExtractedText { text: String::new(), kind: MessageKind::Media });
        }
    }

    if let Some(text) = message.get("conversation").and_then(Value::as_str) {
        return Some(ExtractedText { text: text.to_string(), kind: MessageKind::Text });
    }

    if let Some(ext) = message.get("extendedTextMessage") {
        if let Some(text) = text_of(ext, &["text", "caption"]) {
            return Some(ExtractedText { text, kind: MessageKind::Text });
        }
    }

    if let Some(buttons) = message.get("buttonsResponseMessage") {
        if let Some(text) = text_of(buttons, &["selectedDisplayText", "selectedButtonId"]) {
            return Some(ExtractedText { text, kind: MessageKind::Interactive });
        }
    }

    if let Some(list) = message.get("listResponseMessage") {
        if let Some(text) = text_of(list, &["title", "description"]) {
            return Some(ExtractedText { text, kind: MessageKind::Interactive });
        }
        if let Some(reply) = list.get("singleSelectReply") {
            if let Some(text) = text_of(reply, &["selectedRowId", "selectedText"]) {
                return Some(ExtractedText { text, kind: MessageKind::Interactive });
            }
        }
    }

    if let Some(interactive) = message.get("interactiveResponseMessage") {
        if let Some(result) = interactive.get("result") {
            if let Some(text) = result.as_str() {
                return Some(ExtractedText { text: text.to_string(), kind: MessageKind::Interactive });
            }
            if let Some(params) = result.get("paramsJson") {
                if let Some(text) = params.as_str() {
                    return Some(ExtractedText { text: text.to_string(), kind: MessageKind::Interactive });
                }
                if let Some(text) = text_of(params, &["id", "title", "description"]) {
                    return Some(ExtractedText { text, kind: MessageKind::Interactive });
                }
            }
        }
        if let Some(id) = interactive.pointer("/nativeFlowResponseMessage/messageParamsJson/id").and_then(Value::as_str) {
            return Some(ExtractedText { text: id.to_string(), kind: MessageKind::Interactive });
        }
    }

    if let Some(template) = message.get("templateMessage") {
        if let Some(hydrated) = template.get("hydratedTemplate") {
            if let Some(text) = text_of(hydrated, &["hydratedContentText", "contentText", "bodyText"]) {
                return Some(ExtractedText { text, kind: MessageKind::Template });
            }
            if let Some(buttons) = hydrated.get("hydratedButtons").and_then(Value::as_array) {
                if let Some(first) = buttons.first() {
                    if let Some(text) = text_of(first, &["buttonId", "displayText"]) {
                        return Some(ExtractedText { text, kind: MessageKind::Template });
                    }
                }
            }
        }
    }

    if let Some(nested) = message.get("message") {
        if let Some(found) = extract_from_message(nested) {
            return Some(found);
        }
    }

    None
}

/// Entry point for text extraction: tries `message`, an array at
/// `messages[].message`, then falls back to top-level text-ish fields.
/// Mirrors `extract_text_and_kind`.
pub fn extract_text_and_kind(payload: &Value) -> Option<(String, MessageKind)> {
    if let Some(message) = payload.get("message") {
        if let Some(found) = extract_from_message(message) {
            return Some((found.text, found.kind));
        }
    }
    if let Some(messages) = payload.get("messages").and_then(Value::as_array) {
        for entry in messages {
            if let Some(message) = entry.get("message") {
                if let Some(found) = extract_from_message(message) {
                    return Some((found.text, found.kind));
                }
            }
        }
    }
    if let Some(text) = text_of(payload, &["text", "body", "caption", "content"]) {
        return Some((text, MessageKind::Text));
    }
    None
}

/// Normalizes an arbitrary inbound envelope into `(number, text, kind)`.
pub fn normalize(payload: &Value) -> Option<NormalizedMessage> {
    let number = extract_number(payload)?;
    let (text, kind) = extract_text_and_kind(payload)?;
    Some(NormalizedMessage { number, text, kind })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_number_from_key_remote_jid() {
        let payload = json!({"key": {"remoteJid": "5516998888888@s.whatsapp.net"}, "message": {"conversation": "oi"}});
        assert_eq!(extract_number(&payload).as_deref(), Some("5516998888888"));
    }

    #[test]
    fn rejects_group_jid_and_falls_back_to_participant() {
        // S2: group-jid rejected, falls back to participant digits.
        let payload = json!({
            "key": {"remoteJid": "5511000-123@g.us", "participant": "5516998888888@s.whatsapp.net"},
            "message": {"conversation": "oi"}
        });
        assert_eq!(extract_number(&payload).as_deref(), Some("5516998888888"));
    }

    #[test]
    fn prepends_country_code_when_missing() {
        let payload = json!({"number": "11999999999"});
        assert_eq!(extract_number(&payload).as_deref(), Some("5511999999999"));
    }

    #[test]
    fn falls_back_to_flat_contact_fields() {
        let payload = json!({"contact": {"phone": "11999999999"}});
        assert_eq!(extract_number(&payload).as_deref(), Some("5511999999999"));
    }

    #[test]
    fn sweep_fallback_matches_embedded_jid() {
        let payload = json!({"weird": {"nested": "anything 5511999999999@s.whatsapp.net more text"}});
        assert_eq!(extract_number(&payload).as_deref(), Some("5511999999999"));
    }

    #[test]
    fn extracts_plain_conversation_text() {
        let payload = json!({"message": {"conversation": "olá"}});
        let (text, kind) = extract_text_and_kind(&payload).unwrap();
        assert_eq!(text, "olá");
        assert_eq!(kind, MessageKind::Text);
    }

    #[test]
    fn unwraps_ephemeral_message() {
        let payload = json!({"message": {"ephemeralMessage": {"message": {"conversation": "oi"}}}});
        let (text, kind) = extract_text_and_kind(&payload).unwrap();
        assert_eq!(text, "oi");
        assert_eq!(kind, MessageKind::Text);
    }

    #[test]
    fn extracts_media_caption() {
        let payload = json!({"message": {"imageMessage": {"caption": "olha isso"}}});
        let (text, kind) = extract_text_and_kind(&payload).unwrap();
        assert_eq!(text, "olha isso");
        assert_eq!(kind, MessageKind::Media);
    }

    #[test]
    fn extracts_buttons_response() {
        let payload = json!({"message": {"buttonsResponseMessage": {"selectedDisplayText": "Sim"}}});
        let (text, kind) = extract_text_and_kind(&payload).unwrap();
        assert_eq!(text, "Sim");
        assert_eq!(kind, MessageKind::Interactive);
    }

    #[test]
    fn extracts_list_single_select_reply() {
        let payload = json!({"message": {"listResponseMessage": {"singleSelectReply": {"selectedRowId": "row-1"}}}});
        let (text, kind) = extract_text_and_kind(&payload).unwrap();
        assert_eq!(text, "row-1");
        assert_eq!(kind, MessageKind::Interactive);
    }

    #[test]
    fn extracts_template_hydrated_text() {
        let payload = json!({"message": {"templateMessage": {"hydratedTemplate": {"hydratedContentText": "Olá!"}}}});
        let (text, kind) = extract_text_and_kind(&payload).unwrap();
        assert_eq!(text, "Olá!");
        assert_eq!(kind, MessageKind::Template);
    }

    #[test]
    fn falls_back_to_top_level_text_field() {
        let payload = json!({"text": "fallback text"});
        let (text, kind) = extract_text_and_kind(&payload).unwrap();
        assert_eq!(text, "fallback text");
        assert_eq!(kind, MessageKind::Text);
    }

    #[test]
    fn full_happy_path_normalizes_both_fields() {
        let payload = json!({"message": {"conversation": "olá"}, "number": "11999999999"});
        let normalized = normalize(&payload).unwrap();
        assert_eq!(normalized.number, "5511999999999");
        assert_eq!(normalized.text, "olá");
        assert_eq!(normalized.kind, MessageKind::Text);
    }

    #[test]
    fn returns_none_when_no_number_found() {
        let payload = json!({"message": {"conversation": "olá"}});
        assert!(normalize(&payload).is_none());
    }
}
