//! Tracker adapters.
//!
//! Every tracker is the same [`TrackerAdapter`] driven by a [`TrackerSpec`]:
//! parameter names, status vocabulary, where the credential goes, and what a
//! successful response looks like.

use super::macros::{event_macros, render, render_url};
use super::status::{map_status, StatusVocabulary};
use crate::db::{ConversionEvent, HttpMethod, PostbackProfile, SkipReason, TrackerKind};

use reqwest::Url;
use std::collections::HashMap;
use thiserror::Error;

const REDACTED: &str = "***";

/// Where a tracker expects its credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthPlacement {
    None,
    Query(String),
    Header(String),
}

/// What a 2xx response must contain to count as accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuccessRule {
    AnyBody,
    /// Trimmed body equals one of these, ignoring ASCII case.
    BodyIn(&'static [&'static str]),
}

/// Per-tracker conventions.
#[derive(Debug, Clone, Copy)]
pub struct TrackerSpec {
    pub kind: TrackerKind,
    pub click_param: Option<&'static str>,
    pub status_param: Option<&'static str>,
    pub payout_param: Option<&'static str>,
    pub currency_param: Option<&'static str>,
    pub txid_param: Option<&'static str>,
    pub vocabulary: StatusVocabulary,
    pub auth_query_key: Option<&'static str>,
    pub auth_header_name: Option<&'static str>,
    pub credential_required: bool,
    pub success: SuccessRule,
}

const TEXT_ACK: &[&str] = &["ok", "1", "success"];

pub const KEITARO: TrackerSpec = TrackerSpec {
    kind: TrackerKind::Keitaro,
    click_param: Some("subid"),
    status_param: Some("status"),
    payout_param: Some("payout"),
    currency_param: Some("currency"),
    txid_param: Some("tid"),
    vocabulary: StatusVocabulary::standard(),
    auth_query_key: None,
    auth_header_name: None,
    credential_required: false,
    success: SuccessRule::AnyBody,
};

pub const BINOM: TrackerSpec = TrackerSpec {
    kind: TrackerKind::Binom,
    click_param: Some("cnv_id"),
    status_param: Some("cnv_status"),
    payout_param: Some("payout"),
    currency_param: None,
    txid_param: Some("event_id"),
    vocabulary: StatusVocabulary {
        reject: "rejected",
        ..StatusVocabulary::standard()
    },
    auth_query_key: Some("auth_token"),
    auth_header_name: None,
    credential_required: true,
    success: SuccessRule::BodyIn(TEXT_ACK),
};

pub const VOLUUM: TrackerSpec = TrackerSpec {
    kind: TrackerKind::Voluum,
    click_param: Some("cid"),
    status_param: Some("et"),
    payout_param: Some("payout"),
    currency_param: Some("currency"),
    txid_param: Some("txid"),
    vocabulary: StatusVocabulary {
        reject: "declined",
        refund: "refunded",
        ..StatusVocabulary::standard()
    },
    auth_query_key: None,
    auth_header_name: Some("Authorization"),
    credential_required: true,
    success: SuccessRule::AnyBody,
};

pub const REDTRACK: TrackerSpec = TrackerSpec {
    kind: TrackerKind::Redtrack,
    click_param: Some("clickid"),
    status_param: Some("type"),
    payout_param: Some("sum"),
    currency_param: Some("currency"),
    txid_param: Some("transaction_id"),
    vocabulary: StatusVocabulary::standard(),
    auth_query_key: None,
    auth_header_name: None,
    credential_required: false,
    success: SuccessRule::BodyIn(TEXT_ACK),
};

/// Everything comes from the profile's own templates.
pub const CUSTOM: TrackerSpec = TrackerSpec {
    kind: TrackerKind::Custom,
    click_param: None,
    status_param: None,
    payout_param: None,
    currency_param: None,
    txid_param: None,
    vocabulary: StatusVocabulary::standard(),
    auth_query_key: None,
    auth_header_name: None,
    credential_required: false,
    success: SuccessRule::AnyBody,
};

pub fn spec_for(kind: TrackerKind) -> &'static TrackerSpec {
    match kind {
        TrackerKind::Keitaro => &KEITARO,
        TrackerKind::Binom => &BINOM,
        TrackerKind::Voluum => &VOLUUM,
        TrackerKind::Redtrack => &REDTRACK,
        TrackerKind::Custom => &CUSTOM,
    }
}

/// Tracker secrets, injected rather than read from the environment.
#[derive(Debug, Clone, Default)]
pub struct TrackerCredentials {
    secrets: HashMap<TrackerKind, String>,
}

impl TrackerCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a secret. Blank values are treated as absent.
    pub fn with(mut self, kind: TrackerKind, secret: impl Into<String>) -> Self {
        let secret = secret.into();
        if !secret.trim().is_empty() {
            self.secrets.insert(kind, secret);
        }
        self
    }

    pub fn get(&self, kind: TrackerKind) -> Option<&str> {
        self.secrets.get(&kind).map(String::as_str)
    }

    pub fn configured(&self) -> Vec<TrackerKind> {
        let mut kinds: Vec<_> = self.secrets.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

/// Why a request could not be built. Both are skips, never retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BuildError {
    #[error("{0} credential is not configured")]
    MissingCredential(TrackerKind),
    #[error("endpoint template rendered an invalid URL {url:?}: {reason}")]
    InvalidTemplate { url: String, reason: String },
}

impl BuildError {
    pub fn skip_reason(&self) -> SkipReason {
        match self {
            Self::MissingCredential(_) => SkipReason::MissingCredential,
            Self::InvalidTemplate { .. } => SkipReason::InvalidTemplate,
        }
    }
}

/// A fully rendered outbound postback.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltRequest {
    pub url: String,
    /// `url` with the credential masked, for the delivery log.
    pub redacted_url: String,
    pub method: HttpMethod,
    pub headers: Vec<(String, String)>,
    /// Form fields sent as the body of a POST.
    pub form: Vec<(String, String)>,
}

/// How a tracker response is classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseVerdict {
    Success,
    Retryable(String),
    Permanent(String),
}

/// A tracker adapter bound to its (optional) credential.
#[derive(Debug, Clone)]
pub struct TrackerAdapter {
    spec: &'static TrackerSpec,
    credential: Option<String>,
}

impl TrackerAdapter {
    pub fn new(spec: &'static TrackerSpec, credential: Option<String>) -> Self {
        Self { spec, credential }
    }

    /// The tracker's word for this conversion's status.
    pub fn map_status(&self, profile: &PostbackProfile, event: &ConversionEvent) -> String {
        map_status(
            &profile.status_map,
            &self.spec.vocabulary,
            event.conversion_type,
            event.status,
        )
    }

    /// Render the postback for one profile.
    pub fn build_request(
        &self,
        profile: &PostbackProfile,
        event: &ConversionEvent,
        mapped_status: &str,
    ) -> Result<BuiltRequest, BuildError> {
        let auth = self.auth_placement(profile);
        let credential = match (&auth, self.credential.as_deref()) {
            (AuthPlacement::None, _) => None,
            (_, Some(secret)) => Some(secret),
            (_, None) => return Err(BuildError::MissingCredential(self.spec.kind)),
        };
        if self.spec.credential_required && credential.is_none() {
            return Err(BuildError::MissingCredential(self.spec.kind));
        }

        let macros = event_macros(event, profile, mapped_status);
        let rendered = render_url(&profile.endpoint_url, &macros);
        let base = Url::parse(&rendered).map_err(|e| BuildError::InvalidTemplate {
            url: rendered.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(base.scheme(), "http" | "https") || base.host_str().is_none() {
            return Err(BuildError::InvalidTemplate {
                url: rendered,
                reason: "expected an http(s) URL with a host".to_string(),
            });
        }

        let params: Vec<(String, String)> = self
            .param_templates(profile)
            .into_iter()
            .map(|(name, template)| (name, render(&template, &macros)))
            .filter(|(_, value)| !value.is_empty())
            .collect();

        let (mut query, form) = match profile.http_method {
            HttpMethod::Get => (params, Vec::new()),
            HttpMethod::Post => (Vec::new(), params),
        };
        let mut redacted_query = query.clone();
        let mut headers = Vec::new();

        match (&auth, credential) {
            (AuthPlacement::Query(key), Some(secret)) => {
                query.push((key.clone(), secret.to_string()));
                redacted_query.push((key.clone(), REDACTED.to_string()));
            }
            (AuthPlacement::Header(name), Some(secret)) => {
                headers.push((name.clone(), secret.to_string()));
            }
            _ => {}
        }

        Ok(BuiltRequest {
            url: with_query(&base, &query).to_string(),
            redacted_url: with_query(&base, &redacted_query).to_string(),
            method: profile.http_method,
            headers,
            form,
        })
    }

    /// Classify a tracker's HTTP response.
    pub fn validate_response(&self, status_code: u16, body: &str) -> ResponseVerdict {
        match status_code {
            200..=299 => match self.spec.success {
                SuccessRule::AnyBody => ResponseVerdict::Success,
                SuccessRule::BodyIn(accepted) => {
                    let trimmed = body.trim();
                    if accepted.iter().any(|a| trimmed.eq_ignore_ascii_case(a)) {
                        ResponseVerdict::Success
                    } else {
                        ResponseVerdict::Permanent(format!(
                            "unexpected response body: {}",
                            trimmed.chars().take(120).collect::<String>()
                        ))
                    }
                }
            },
            400 => ResponseVerdict::Permanent("HTTP 400: malformed parameters".to_string()),
            404 => ResponseVerdict::Permanent("HTTP 404: click not found".to_string()),
            408 | 429 | 500..=599 => ResponseVerdict::Retryable(format!("HTTP {}", status_code)),
            other => ResponseVerdict::Permanent(format!("HTTP {}", other)),
        }
    }

    /// Profile overrides win over the tracker's default placement.
    fn auth_placement(&self, profile: &PostbackProfile) -> AuthPlacement {
        if let Some(key) = non_blank(&profile.auth_query_key) {
            AuthPlacement::Query(key.to_string())
        } else if let Some(name) = non_blank(&profile.auth_header_name) {
            AuthPlacement::Header(name.to_string())
        } else if let Some(key) = self.spec.auth_query_key {
            AuthPlacement::Query(key.to_string())
        } else if let Some(name) = self.spec.auth_header_name {
            AuthPlacement::Header(name.to_string())
        } else {
            AuthPlacement::None
        }
    }

    /// Tracker defaults first, then profile entries (replacing same-named defaults).
    fn param_templates(&self, profile: &PostbackProfile) -> Vec<(String, String)> {
        let defaults = [
            (self.spec.click_param, "{{clickid}}"),
            (self.spec.status_param, "{{status}}"),
            (self.spec.payout_param, "{{value}}"),
            (self.spec.currency_param, "{{currency}}"),
            (self.spec.txid_param, "{{txid}}"),
        ];

        let mut params: Vec<(String, String)> = defaults
            .iter()
            .filter_map(|(name, tmpl)| name.map(|n| (n.to_string(), tmpl.to_string())))
            .collect();

        for (name, template) in &profile.params_template {
            match params.iter_mut().find(|(n, _)| n == name) {
                Some(existing) => existing.1 = template.clone(),
                None => params.push((name.clone(), template.clone())),
            }
        }
        params
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn with_query(base: &Url, pairs: &[(String, String)]) -> Url {
    let mut url = base.clone();
    if !pairs.is_empty() {
        url.query_pairs_mut().extend_pairs(pairs);
    }
    url
}

/// Builds adapters with the credential each tracker was configured with.
#[derive(Debug, Clone, Default)]
pub struct TrackerRegistry {
    credentials: TrackerCredentials,
}

impl TrackerRegistry {
    pub fn new(credentials: TrackerCredentials) -> Self {
        Self { credentials }
    }

    pub fn adapter(&self, kind: TrackerKind) -> TrackerAdapter {
        TrackerAdapter::new(spec_for(kind), self.credentials.get(kind).map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ConversionStatus, ConversionType};
    use std::collections::BTreeMap;

    fn reg_event() -> ConversionEvent {
        ConversionEvent {
            id: 1,
            clickid: "abc123".to_string(),
            conversion_type: ConversionType::Reg,
            status: ConversionStatus::Approved,
            ..Default::default()
        }
    }

    fn profile(tracker: TrackerKind, url: &str) -> PostbackProfile {
        PostbackProfile {
            id: 1,
            tracker,
            endpoint_url: url.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_keitaro_reg_approved_is_lead() {
        let registry = TrackerRegistry::default();
        let adapter = registry.adapter(TrackerKind::Keitaro);
        let p = profile(TrackerKind::Keitaro, "https://keitaro.test/postback");
        let event = reg_event();

        let status = adapter.map_status(&p, &event);
        assert_eq!(status, "lead");

        let req = adapter.build_request(&p, &event, &status).unwrap();
        assert!(req.url.contains("subid=abc123&status=lead"), "{}", req.url);
        assert_eq!(req.url, req.redacted_url);
        assert_eq!(req.method, HttpMethod::Get);
        assert!(req.headers.is_empty());
    }

    #[test]
    fn test_binom_query_credential_is_redacted() {
        let registry = TrackerRegistry::new(TrackerCredentials::new().with(TrackerKind::Binom, "s3cret"));
        let adapter = registry.adapter(TrackerKind::Binom);
        let p = profile(TrackerKind::Binom, "https://binom.test/click.php");
        let event = ConversionEvent {
            value: Some(4.0),
            txid: "tx-9".to_string(),
            ..reg_event()
        };

        let req = adapter.build_request(&p, &event, "lead").unwrap();
        assert_eq!(
            req.url,
            "https://binom.test/click.php?cnv_id=abc123&cnv_status=lead&payout=4&event_id=tx-9&auth_token=s3cret"
        );
        assert!(req.redacted_url.ends_with("auth_token=***") || req.redacted_url.ends_with("auth_token=%2A%2A%2A"));
        assert!(!req.redacted_url.contains("s3cret"));
    }

    #[test]
    fn test_missing_required_credential() {
        let registry = TrackerRegistry::default();
        for kind in [TrackerKind::Binom, TrackerKind::Voluum] {
            let adapter = registry.adapter(kind);
            let p = profile(kind, "https://tracker.test/pb");
            let err = adapter.build_request(&p, &reg_event(), "lead").unwrap_err();
            assert_eq!(err, BuildError::MissingCredential(kind));
            assert_eq!(err.skip_reason(), SkipReason::MissingCredential);
        }
    }

    #[test]
    fn test_voluum_header_auth() {
        let registry = TrackerRegistry::new(TrackerCredentials::new().with(TrackerKind::Voluum, "token-1"));
        let adapter = registry.adapter(TrackerKind::Voluum);
        let req = adapter
            .build_request(&profile(TrackerKind::Voluum, "https://voluum.test/postback"), &reg_event(), "lead")
            .unwrap();
        assert_eq!(req.headers, vec![("Authorization".to_string(), "token-1".to_string())]);
        assert_eq!(req.url, "https://voluum.test/postback?cid=abc123&et=lead");
    }

    #[test]
    fn test_custom_profile_templates_and_post_form() {
        let registry = TrackerRegistry::default();
        let adapter = registry.adapter(TrackerKind::Custom);
        let p = PostbackProfile {
            http_method: HttpMethod::Post,
            params_template: BTreeMap::from([
                ("click".to_string(), "{{clickid}}".to_string()),
                ("goal".to_string(), "{type}-{status}".to_string()),
                ("sum".to_string(), "{value}".to_string()),
            ]),
            ..profile(TrackerKind::Custom, "https://custom.test/{{offer_id}}/pb")
        };
        let event = ConversionEvent { offer_id: 77, ..reg_event() };

        let req = adapter.build_request(&p, &event, "lead").unwrap();
        assert_eq!(req.url, "https://custom.test/77/pb");
        assert_eq!(
            req.form,
            vec![
                ("click".to_string(), "abc123".to_string()),
                ("goal".to_string(), "reg-lead".to_string()),
            ]
        );
    }

    #[test]
    fn test_custom_auth_key_requires_credential() {
        let p = PostbackProfile {
            auth_query_key: Some("key".to_string()),
            ..profile(TrackerKind::Custom, "https://custom.test/pb")
        };
        let without = TrackerRegistry::default().adapter(TrackerKind::Custom);
        assert!(matches!(
            without.build_request(&p, &reg_event(), "lead"),
            Err(BuildError::MissingCredential(TrackerKind::Custom))
        ));

        let with = TrackerRegistry::new(TrackerCredentials::new().with(TrackerKind::Custom, "k"))
            .adapter(TrackerKind::Custom);
        let req = with.build_request(&p, &reg_event(), "lead").unwrap();
        assert_eq!(req.url, "https://custom.test/pb?key=k");
    }

    #[test]
    fn test_profile_param_overrides_default() {
        let adapter = TrackerRegistry::default().adapter(TrackerKind::Keitaro);
        let p = PostbackProfile {
            params_template: BTreeMap::from([("status".to_string(), "custom_{status}".to_string())]),
            ..profile(TrackerKind::Keitaro, "https://keitaro.test/postback")
        };
        let req = adapter.build_request(&p, &reg_event(), "lead").unwrap();
        assert_eq!(req.url, "https://keitaro.test/postback?subid=abc123&status=custom_lead");
    }

    #[test]
    fn test_click_id_cannot_inject_endpoint_params() {
        let adapter = TrackerRegistry::default().adapter(TrackerKind::Custom);
        let p = profile(TrackerKind::Custom, "https://t.test/pb?subid={{clickid}}&status={{status}}");
        let event = ConversionEvent {
            clickid: "x&status=sale".to_string(),
            conversion_type: ConversionType::Purchase,
            status: ConversionStatus::Declined,
            ..reg_event()
        };

        let status = adapter.map_status(&p, &event);
        assert_eq!(status, "reject");
        let req = adapter.build_request(&p, &event, &status).unwrap();

        let pairs: Vec<(String, String)> = Url::parse(&req.url)
            .unwrap()
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("subid".to_string(), "x&status=sale".to_string()),
                ("status".to_string(), "reject".to_string()),
            ]
        );
    }

    #[test]
    fn test_unresolvable_template_is_invalid() {
        let adapter = TrackerRegistry::default().adapter(TrackerKind::Keitaro);
        for url in ["{{tracker_host}}/postback", "ftp://files.test/pb", ""] {
            let err = adapter
                .build_request(&profile(TrackerKind::Keitaro, url), &reg_event(), "lead")
                .unwrap_err();
            assert_eq!(err.skip_reason(), SkipReason::InvalidTemplate, "{}", url);
        }
    }

    #[test]
    fn test_validate_response() {
        let keitaro = TrackerRegistry::default().adapter(TrackerKind::Keitaro);
        let redtrack = TrackerRegistry::default().adapter(TrackerKind::Redtrack);

        assert_eq!(keitaro.validate_response(200, "anything"), ResponseVerdict::Success);
        for body in ["OK", "1", "success", " ok\n"] {
            assert_eq!(redtrack.validate_response(200, body), ResponseVerdict::Success);
        }
        assert!(matches!(redtrack.validate_response(200, "error"), ResponseVerdict::Permanent(_)));
        assert_eq!(
            keitaro.validate_response(404, ""),
            ResponseVerdict::Permanent("HTTP 404: click not found".to_string())
        );
        assert!(matches!(keitaro.validate_response(400, ""), ResponseVerdict::Permanent(_)));
        assert!(matches!(keitaro.validate_response(403, ""), ResponseVerdict::Permanent(_)));
        for code in [408, 429, 500, 502, 503] {
            assert!(matches!(keitaro.validate_response(code, ""), ResponseVerdict::Retryable(_)));
        }
    }
}
