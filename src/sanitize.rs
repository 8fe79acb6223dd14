//! Scrubbing of secrets and personal data from messages before they are logged
//! or propagated to callers.
//!
//! Provider error bodies regularly echo the request back (including tokens),
//! so every message that may contain provider text goes through
//! [`sanitize_message`] first.

use once_cell::sync::Lazy;
use regex::Regex;

const REDACTED: &str = "[REDACTED]";

/// Maximum length of a sanitized message. Longer bodies are truncated.
const MAX_MESSAGE_LEN: usize = 512;

static BEARER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)bearer\s+[A-Za-z0-9\-._~+/]+=*").expect("valid regex"));

static SECRET_PARAM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)("?(?:access_token|refresh_token|id_token|client_secret|app_secret|fb_exchange_token|password|secret)"?\s*[:=]\s*"?)[^"&\s,}]+"#,
    )
    .expect("valid regex")
});

static AUTH_CODE_PARAM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\b(code=)[^&\s"]+"#).expect("valid regex"));

// Meta user/page tokens, Google access tokens and Google refresh tokens.
static PROVIDER_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:EAA[A-Za-z0-9]{20,}|ya29\.[A-Za-z0-9\-_.]+|1//[A-Za-z0-9\-_]+)")
        .expect("valid regex")
});

// Any long opaque run that looks like key material.
static OPAQUE_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Za-z0-9\-_]{40,}\b").expect("valid regex"));

static EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}").expect("valid regex")
});

static CARD_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:\d[ \-]?){12,18}\d\b").expect("valid regex"));

/// Removes tokens, secrets, emails and card-like numbers from `message`.
pub fn sanitize_message(message: &str) -> String {
    let scrubbed = BEARER.replace_all(message, format!("Bearer {}", REDACTED).as_str());
    let scrubbed = SECRET_PARAM.replace_all(&scrubbed, format!("${{1}}{}", REDACTED).as_str());
    let scrubbed = AUTH_CODE_PARAM.replace_all(&scrubbed, format!("${{1}}{}", REDACTED).as_str());
    let scrubbed = PROVIDER_TOKEN.replace_all(&scrubbed, REDACTED);
    let scrubbed = OPAQUE_TOKEN.replace_all(&scrubbed, REDACTED);
    let scrubbed = EMAIL.replace_all(&scrubbed, REDACTED);
    let scrubbed = CARD_NUMBER.replace_all(&scrubbed, REDACTED);

    truncate(scrubbed.trim())
}

fn truncate(message: &str) -> String {
    if message.len() <= MAX_MESSAGE_LEN {
        return message.to_string();
    }
    let mut end = MAX_MESSAGE_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &message[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_bearer_token() {
        let out = sanitize_message("request failed: Authorization: Bearer abc.def-123");
        assert!(!out.contains("abc.def-123"));
        assert!(out.contains("Bearer [REDACTED]"));
    }

    #[test]
    fn test_strips_token_parameters() {
        let out = sanitize_message("GET /me?access_token=EAAB12345&fields=id");
        assert!(!out.contains("EAAB12345"));
        assert!(out.contains("fields=id"));

        let out = sanitize_message(r#"{"refresh_token": "1//0gabc", "error": "invalid_grant"}"#);
        assert!(!out.contains("1//0gabc"));
        assert!(out.contains("invalid_grant"));

        let out = sanitize_message("callback?code=4/0AX4XfWh&state=abc");
        assert!(!out.contains("4/0AX4XfWh"));
        assert!(out.contains("state=abc"));
    }

    #[test]
    fn test_strips_provider_token_shapes() {
        let out = sanitize_message("token ya29.a0AfH6SMBx-secret was rejected");
        assert!(!out.contains("ya29"));

        let meta = format!("EAA{}", "x".repeat(30));
        let out = sanitize_message(&format!("invalid token {}", meta));
        assert!(!out.contains(&meta));
    }

    #[test]
    fn test_strips_email_and_card_numbers() {
        let out = sanitize_message("user jane.doe@example.org paid with 4111 1111 1111 1111");
        assert!(!out.contains("jane.doe@example.org"));
        assert!(!out.contains("4111 1111 1111 1111"));
    }

    #[test]
    fn test_keeps_ordinary_text() {
        let out = sanitize_message("Service temporarily unavailable (code 2)");
        assert_eq!(out, "Service temporarily unavailable (code 2)");
    }

    #[test]
    fn test_truncates_long_messages() {
        let long = "word ".repeat(500);
        let out = sanitize_message(&long);
        assert!(out.len() <= MAX_MESSAGE_LEN + 3);
        assert!(out.ends_with("..."));
    }
}
