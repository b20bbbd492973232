use regex::Regex;

use routed_core::http::Method;

use crate::PolicyError;

/// Selects the requests a policy applies to: an HTTP method (or `*`) plus a
/// path glob where `**` crosses `/` and `*` does not.
#[derive(Debug, Clone)]
pub struct RouteMatcher {
    method: Option<Method>,
    glob: String,
    regex: Regex,
}

impl RouteMatcher {
    pub fn new(method: &str, glob: &str) -> Result<Self, PolicyError> {
        let method = if method == "*" {
            None
        } else {
            Some(
                method
                    .parse::<Method>()
                    .map_err(|_| PolicyError::Matcher(format!("invalid method '{method}'")))?,
            )
        };
        let regex = compile_glob(glob)
            .map_err(|e| PolicyError::Matcher(format!("invalid glob '{glob}': {e}")))?;
        Ok(Self {
            method,
            glob: glob.to_string(),
            regex,
        })
    }

    pub fn matches(&self, method: &Method, path: &str) -> bool {
        if let Some(m) = &self.method {
            if m != method {
                return false;
            }
        }
        self.regex.is_match(path)
    }

    pub fn glob(&self) -> &str {
        &self.glob
    }
}

fn compile_glob(glob: &str) -> Result<Regex, regex::Error> {
    let mut pattern = String::from("^");
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    pattern.push_str(".*");
                } else {
                    pattern.push_str("[^/]*");
                }
            }
            other => pattern.push_str(&regex::escape(&other.to_string())),
        }
    }
    pattern.push('$');
    Regex::new(&pattern)
}
