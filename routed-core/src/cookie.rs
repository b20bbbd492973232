//! Request cookie parsing and `Set-Cookie` serialization.

use std::collections::HashMap;
use std::time::Duration;

/// `SameSite` attribute of a response cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

impl SameSite {
    fn as_str(&self) -> &'static str {
        match self {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
            SameSite::None => "None",
        }
    }
}

/// A cookie queued on the response.
#[derive(Debug, Clone)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub path: Option<String>,
    pub domain: Option<String>,
    pub max_age: Option<Duration>,
    pub secure: bool,
    pub http_only: bool,
    pub partitioned: bool,
    pub same_site: Option<SameSite>,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            path: Some("/".to_string()),
            domain: None,
            max_age: None,
            secure: false,
            http_only: false,
            partitioned: false,
            same_site: None,
        }
    }

    /// A cookie that instructs the client to drop its stored value.
    pub fn expired(name: impl Into<String>) -> Self {
        let mut cookie = Self::new(name, "");
        cookie.max_age = Some(Duration::ZERO);
        cookie
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn secure(mut self) -> Self {
        self.secure = true;
        self
    }

    pub fn http_only(mut self) -> Self {
        self.http_only = true;
        self
    }

    pub fn partitioned(mut self) -> Self {
        self.partitioned = true;
        self
    }

    pub fn with_same_site(mut self, same_site: SameSite) -> Self {
        self.same_site = Some(same_site);
        self
    }

    /// Serialize into a `Set-Cookie` header value.
    pub fn to_header_value(&self) -> String {
        let mut out = format!("{}={}", self.name, self.value);
        if let Some(path) = &self.path {
            out.push_str("; Path=");
            out.push_str(path);
        }
        if let Some(domain) = &self.domain {
            out.push_str("; Domain=");
            out.push_str(domain);
        }
        if let Some(max_age) = self.max_age {
            out.push_str("; Max-Age=");
            out.push_str(&max_age.as_secs().to_string());
        }
        if let Some(same_site) = self.same_site {
            out.push_str("; SameSite=");
            out.push_str(same_site.as_str());
        }
        if self.secure {
            out.push_str("; Secure");
        }
        if self.http_only {
            out.push_str("; HttpOnly");
        }
        if self.partitioned {
            out.push_str("; Partitioned");
        }
        out
    }
}

/// Parse a request `Cookie` header into name/value pairs.
pub fn parse_cookie_header(header: &str) -> HashMap<String, String> {
    header
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_attributes() {
        let cookie = Cookie::new("sid", "abc")
            .with_max_age(Duration::from_secs(3600))
            .with_same_site(SameSite::Lax)
            .secure()
            .http_only();
        let value = cookie.to_header_value();
        assert!(value.starts_with("sid=abc"));
        assert!(value.contains("Path=/"));
        assert!(value.contains("Max-Age=3600"));
        assert!(value.contains("SameSite=Lax"));
        assert!(value.contains("Secure"));
        assert!(value.contains("HttpOnly"));
    }

    #[test]
    fn expired_cookie_has_zero_max_age() {
        let value = Cookie::expired("sid").to_header_value();
        assert!(value.contains("Max-Age=0"));
    }

    #[test]
    fn parses_request_header() {
        let cookies = parse_cookie_header("sid=abc; theme=dark");
        assert_eq!(cookies["sid"], "abc");
        assert_eq!(cookies["theme"], "dark");
    }

    #[test]
    fn skips_malformed_pairs() {
        let cookies = parse_cookie_header("garbage; a=1");
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies["a"], "1");
    }
}
