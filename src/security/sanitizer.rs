//! Log-safe renderings of credentials and endpoints
//!
//! Every tracing call that mentions a token or a request URL goes through
//! here first.

/// Redaction helpers for tokens and URLs
pub struct Sanitizer;

impl Sanitizer {
    /// Keeps only the last 4 characters of a token
    ///
    /// # Examples
    ///
    /// ```
    /// use session_gate::security::Sanitizer;
    ///
    /// assert_eq!(Sanitizer::sanitize_token("access-token-abcd"), "***abcd");
    /// assert_eq!(Sanitizer::sanitize_token("abc"), "****");
    /// ```
    pub fn sanitize_token(token: &str) -> String {
        let count = token.chars().count();
        if count > 4 {
            let tail: String = token.chars().skip(count - 4).collect();
            format!("***{}", tail)
        } else {
            "****".to_string()
        }
    }

    /// Drops query string and fragment from a URL
    ///
    /// # Examples
    ///
    /// ```
    /// use session_gate::security::Sanitizer;
    ///
    /// assert_eq!(
    ///     Sanitizer::sanitize_url("https://api.example.com/auth/refresh?token=secret#x"),
    ///     "https://api.example.com/auth/refresh"
    /// );
    /// ```
    pub fn sanitize_url(url: &str) -> String {
        url.split(['?', '#']).next().unwrap_or(url).to_string()
    }

    /// Shows the first and last `visible` characters of a value
    ///
    /// Used for user identifiers, which are useful in logs but should not
    /// appear whole.
    ///
    /// # Examples
    ///
    /// ```
    /// use session_gate::security::Sanitizer;
    ///
    /// assert_eq!(Sanitizer::mask_string("user-12345", 2), "us...45");
    /// assert_eq!(Sanitizer::mask_string("tiny", 2), "****");
    /// ```
    pub fn mask_string(value: &str, visible: usize) -> String {
        let chars: Vec<char> = value.chars().collect();
        if chars.len() <= visible * 2 {
            return "****".to_string();
        }
        let head: String = chars[..visible].iter().collect();
        let tail: String = chars[chars.len() - visible..].iter().collect();
        format!("{}...{}", head, tail)
    }
}
