use std::net::IpAddr;

/// The authenticated identity attached to a fingerprint, if any.
///
/// `client_id` carries the OAuth 2.0 client for bearer-credential requests
/// delegated by the OpenID Connect provider surface; portal sessions leave it
/// empty.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Subject {
    pub username: Option<String>,
    pub groups: Vec<String>,
    pub client_id: Option<String>,
}

impl Subject {
    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.username.is_none() && self.client_id.is_none()
    }
}

/// The tuple of request attributes the policy evaluator consumes.
///
/// Built once per verification request from the forwarded headers; the
/// evaluator sees nothing else.
#[derive(Clone, Debug)]
pub struct RequestFingerprint {
    pub method: String,
    pub scheme: String,
    pub host: String,
    pub path: String,
    pub query: Option<String>,
    pub remote_ip: Option<IpAddr>,
    pub subject: Subject,
}

impl RequestFingerprint {
    /// Path plus query, the way resource patterns are matched.
    #[must_use]
    pub fn resource(&self) -> String {
        match &self.query {
            Some(query) if !query.is_empty() => format!("{}?{}", self.path, query),
            _ => self.path.clone(),
        }
    }

    /// The original URL, used for the post-login redirect.
    #[must_use]
    pub fn original_url(&self) -> String {
        format!("{}://{}{}", self.scheme, self.host, self.resource())
    }

    /// Query string decoded into key/value pairs.
    #[must_use]
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let Some(query) = self.query.as_deref() else {
            return Vec::new();
        };
        url::form_urlencoded::parse(query.as_bytes())
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fingerprint(query: Option<&str>) -> RequestFingerprint {
        RequestFingerprint {
            method: "GET".to_string(),
            scheme: "https".to_string(),
            host: "app.example.com".to_string(),
            path: "/dashboard".to_string(),
            query: query.map(str::to_string),
            remote_ip: None,
            subject: Subject::default(),
        }
    }

    #[test]
    fn resource_includes_query_when_present() {
        assert_eq!(fingerprint(None).resource(), "/dashboard");
        assert_eq!(fingerprint(Some("a=1")).resource(), "/dashboard?a=1");
    }

    #[test]
    fn original_url_round_trips_components() {
        assert_eq!(
            fingerprint(Some("rd=x")).original_url(),
            "https://app.example.com/dashboard?rd=x"
        );
    }

    #[test]
    fn query_pairs_decode_percent_encoding() {
        let pairs = fingerprint(Some("name=hello%20world&flag")).query_pairs();
        assert_eq!(pairs[0], ("name".to_string(), "hello world".to_string()));
        assert_eq!(pairs[1], ("flag".to_string(), String::new()));
    }

    #[test]
    fn anonymous_subject() {
        assert!(Subject::default().is_anonymous());
        let subject = Subject {
            username: Some("alice".to_string()),
            ..Subject::default()
        };
        assert!(!subject.is_anonymous());
    }
}
