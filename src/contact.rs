use std::sync::OnceLock;

use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactInfo {
    pub email: Option<String>,
    pub phone: Option<String>,
}

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)[A-Z0-9._%+-]+@[A-Z0-9.-]+\.[A-Z]{2,}").expect("email regex")
    })
}

fn phone_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Allow +, spaces, dashes, parentheses; digit count is checked separately.
    RE.get_or_init(|| Regex::new(r"[+()\d][\d\s().\-]{6,}").expect("phone regex"))
}

fn digits(value: &str) -> usize {
    value.chars().filter(char::is_ascii_digit).count()
}

/// Extracts a plausible email and/or phone number from free text.
///
/// The email keeps the exact case it was written in. A phone candidate is
/// accepted only when it carries at least 8 digits once separators are
/// stripped; the first qualifying candidate wins.
pub fn extract_contact(text: &str) -> Option<ContactInfo> {
    if text.trim().is_empty() {
        return None;
    }
    let email = email_re().find(text).map(|m| m.as_str().to_string());
    let phone = phone_re()
        .find_iter(text)
        .map(|m| {
            m.as_str()
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '+')
                .collect::<String>()
        })
        .find(|candidate| digits(candidate) >= 8);
    if email.is_none() && phone.is_none() {
        return None;
    }
    Some(ContactInfo { email, phone })
}

/// True when the message is nothing but the contact itself (plus separators),
/// so the notification does not need to repeat it as a quoted message.
pub fn is_bare_contact(text: &str) -> bool {
    let without_email = email_re().replace_all(text, "");
    let without_phone = phone_re().replace_all(&without_email, "");
    !without_phone.chars().any(char::is_alphanumeric)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_email_preserving_case() {
        let info = extract_contact("My email is Jane.Doe@Example.COM, please call me").unwrap();
        assert_eq!(info.email.as_deref(), Some("Jane.Doe@Example.COM"));
        assert_eq!(info.phone, None);
    }

    #[test]
    fn extracts_phone_with_separators_and_plus() {
        let info = extract_contact("tel: +48 (512) 686-628").unwrap();
        assert_eq!(info.phone.as_deref(), Some("+48512686628"));
        assert_eq!(info.email, None);
    }

    #[test]
    fn rejects_short_digit_runs() {
        assert_eq!(extract_contact("call 123-4567 maybe"), None);
        assert_eq!(extract_contact("Скільки коштує лендінг?"), None);
        assert_eq!(extract_contact(""), None);
    }

    #[test]
    fn extracts_both_when_present() {
        let info = extract_contact("jane@example.com or +380501234567").unwrap();
        assert_eq!(info.email.as_deref(), Some("jane@example.com"));
        assert_eq!(info.phone.as_deref(), Some("+380501234567"));
    }

    #[test]
    fn bare_contact_detection() {
        assert!(is_bare_contact("jane@example.com"));
        assert!(is_bare_contact(" +48 512 686 628 "));
        assert!(is_bare_contact("jane@example.com, +48512686628"));
        assert!(!is_bare_contact("My email is jane@example.com, please call me"));
    }
}
