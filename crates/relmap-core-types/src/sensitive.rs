//! Sensitive data marker for automatic redaction
//!
//! Column values mapped as sensitive (passwords, tokens, personal data) are
//! wrapped in `Sensitive<T>` before they reach a log line.

use std::fmt;

/// Wrapper for sensitive data that redacts itself in Debug and Display
///
/// # Example
///
/// ```
/// use relmap_core_types::Sensitive;
///
/// let password = Sensitive::new("secret123");
/// assert_eq!(format!("{:?}", password), "***REDACTED***");
/// assert_eq!(password.expose(), &"secret123");
/// ```
pub struct Sensitive<T>(T);

impl<T> Sensitive<T> {
    /// Wrap a sensitive value
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Expose the underlying sensitive value
    pub fn expose(&self) -> &T {
        &self.0
    }

    /// Consume the wrapper and return the inner value
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for Sensitive<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "***REDACTED***")
    }
}

impl<T> fmt::Display for Sensitive<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "***REDACTED***")
    }
}

impl<T: Clone> Clone for Sensitive<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensitive_debug_redaction() {
        let secret = Sensitive::new("my-secret-password");
        let debug_str = format!("{:?}", secret);
        assert_eq!(debug_str, "***REDACTED***");
        assert!(!debug_str.contains("my-secret-password"));
    }

    #[test]
    fn test_sensitive_in_param_list() {
        let params: Vec<Box<dyn fmt::Debug>> = vec![
            Box::new("alice"),
            Box::new(Sensitive::new("hunter2")),
        ];
        let rendered = format!("{:?}", params);
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_sensitive_into_inner() {
        let secret = Sensitive::new(String::from("test"));
        assert_eq!(secret.clone().into_inner(), "test");
        assert_eq!(secret.expose(), "test");
    }
}
