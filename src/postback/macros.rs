//! Placeholder substitution for postback URL and parameter templates.

use crate::db::{ConversionEvent, PostbackProfile};

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::OnceLock;
use url::form_urlencoded::byte_serialize;

/// Macro name -> substituted value.
pub type Macros = HashMap<String, String>;

fn macro_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}|\{\s*([A-Za-z0-9_]+)\s*\}")
            .expect("macro pattern is a valid regex")
    })
}

/// Substitute every `{{name}}` and `{name}` in `template`.
///
/// Unknown names render as the empty string.
pub fn render(template: &str, macros: &Macros) -> String {
    substitute(template, macros, |value| value.to_string())
}

/// Like [`render`], but every substituted value is percent-encoded so it
/// cannot add query parameters or path segments to the URL.
pub fn render_url(template: &str, macros: &Macros) -> String {
    substitute(template, macros, |value| byte_serialize(value.as_bytes()).collect())
}

fn substitute(template: &str, macros: &Macros, encode: impl Fn(&str) -> String) -> String {
    macro_pattern()
        .replace_all(template, |caps: &Captures<'_>| {
            caps.get(1)
                .or_else(|| caps.get(2))
                .and_then(|name| macros.get(name.as_str()))
                .map(|value| encode(value))
                .unwrap_or_default()
        })
        .into_owned()
}

/// Macros available to a profile's templates for one conversion.
pub fn event_macros(event: &ConversionEvent, profile: &PostbackProfile, mapped_status: &str) -> Macros {
    let mut m = Macros::new();
    m.insert("clickid".into(), event.clickid.clone());
    m.insert("txid".into(), event.txid.clone());
    m.insert("status".into(), mapped_status.to_string());
    m.insert("internal_status".into(), event.status.to_string());
    m.insert("type".into(), event.conversion_type.to_string());
    m.insert("offer_id".into(), event.offer_id.to_string());
    m.insert("campaign_id".into(), event.campaign_id.to_string());
    m.insert("partner_id".into(), event.partner_id.to_string());
    m.insert("advertiser_id".into(), event.advertiser_id.to_string());
    m.insert("conversion_id".into(), event.id.to_string());
    m.insert("profile_id".into(), profile.id.to_string());
    if let Some(value) = event.value {
        m.insert("value".into(), value.to_string());
    }
    if let Some(currency) = &event.currency {
        m.insert("currency".into(), currency.clone());
    }
    m
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ConversionStatus, ConversionType};

    fn macros(pairs: &[(&str, &str)]) -> Macros {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_both_brace_styles() {
        let m = macros(&[("clickid", "abc123"), ("status", "lead")]);
        assert_eq!(
            render("https://t.test/pb?subid={{clickid}}&s={status}&x={{ clickid }}", &m),
            "https://t.test/pb?subid=abc123&s=lead&x=abc123"
        );
    }

    #[test]
    fn test_unresolved_render_empty() {
        let empty = Macros::new();
        assert_eq!(render("https://t.test/pb?a={{missing}}&b={other}", &empty), "https://t.test/pb?a=&b=");
        assert_eq!(render("", &empty), "");
        assert_eq!(render("no placeholders {", &empty), "no placeholders {");
        assert_eq!(render("{{unclosed", &empty), "{{unclosed");
    }

    #[test]
    fn test_url_render_encodes_values() {
        let m = macros(&[("clickid", "x&status=sale"), ("offer_id", "7/../admin"), ("status", "reject")]);
        assert_eq!(
            render_url("https://t.test/{offer_id}/pb?subid={{clickid}}&status={{status}}", &m),
            "https://t.test/7%2F..%2Fadmin/pb?subid=x%26status%3Dsale&status=reject"
        );
        assert_eq!(render_url("https://t.test/pb?a={missing}", &m), "https://t.test/pb?a=");
    }

    #[test]
    fn test_event_macros() {
        let event = ConversionEvent {
            id: 5,
            clickid: "c1".to_string(),
            conversion_type: ConversionType::Purchase,
            status: ConversionStatus::Approved,
            value: Some(12.5),
            currency: Some("USD".to_string()),
            offer_id: 3,
            ..Default::default()
        };
        let profile = PostbackProfile { id: 9, ..Default::default() };
        let m = event_macros(&event, &profile, "sale");

        assert_eq!(
            render("{clickid}|{status}|{internal_status}|{type}|{value}|{currency}|{offer_id}|{profile_id}", &m),
            "c1|sale|approved|purchase|12.5|USD|3|9"
        );
    }

    #[test]
    fn test_missing_value_renders_empty() {
        let m = event_macros(&ConversionEvent::default(), &PostbackProfile::default(), "lead");
        assert_eq!(render("payout={value}", &m), "payout=");
    }
}
