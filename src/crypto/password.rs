//! Passwords and the credential collaborator.

use zeroize::Zeroizing;

/// A password for encrypted content.
///
/// The bytes are wiped from memory when the value is dropped.
#[derive(Clone)]
pub struct Password {
    inner: Zeroizing<String>,
}

impl Password {
    /// Creates a new password from a string.
    pub fn new<S: Into<String>>(password: S) -> Self {
        Self {
            inner: Zeroizing::new(password.into()),
        }
    }

    /// Returns the UTF-8 bytes fed to RAR5 key derivation.
    pub fn as_bytes(&self) -> &[u8] {
        self.inner.as_bytes()
    }

    /// Returns the password as a string slice.
    pub fn as_str(&self) -> &str {
        &self.inner
    }

    /// Returns true if the password is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns the length of the password in characters.
    pub fn len(&self) -> usize {
        self.inner.chars().count()
    }
}

impl std::fmt::Debug for Password {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Password")
            .field("len", &self.inner.len())
            .finish()
    }
}

impl From<&str> for Password {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Password {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Supplies the password for encrypted items on demand.
///
/// Returning `None` makes encrypted items report
/// [`ItemOutcome::PasswordRequired`](crate::ItemOutcome::PasswordRequired).
pub trait PasswordProvider: Send {
    /// Returns the password to try, if any.
    fn password(&mut self) -> Option<Password>;
}

impl PasswordProvider for Password {
    fn password(&mut self) -> Option<Password> {
        Some(self.clone())
    }
}

/// A provider that never has a password.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPassword;

impl PasswordProvider for NoPassword {
    fn password(&mut self) -> Option<Password> {
        None
    }
}

/// A provider backed by a closure, for prompting on first use.
pub struct PasswordFn<F>(pub F);

impl<F> std::fmt::Debug for PasswordFn<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordFn").finish_non_exhaustive()
    }
}

impl<F: FnMut() -> Option<Password> + Send> PasswordProvider for PasswordFn<F> {
    fn password(&mut self) -> Option<Password> {
        (self.0)()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_debug() {
        let password = Password::new("secret");
        let debug = format!("{:?}", password);
        assert!(!debug.contains("secret"));
        assert!(debug.contains("len"));
    }

    #[test]
    fn test_password_bytes_are_utf8() {
        let password = Password::new("пароль");
        assert_eq!(password.as_bytes().len(), 12);
        assert_eq!(password.len(), 6);
    }

    #[test]
    fn test_providers() {
        let mut fixed: Password = "test".into();
        assert_eq!(fixed.password().unwrap().as_str(), "test");
        assert!(NoPassword.password().is_none());

        let mut calls = 0;
        let mut prompt = PasswordFn(move || {
            calls += 1;
            (calls == 1).then(|| Password::new("once"))
        });
        assert!(prompt.password().is_some());
        assert!(prompt.password().is_none());
    }
}
