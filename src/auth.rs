/// Authentication headers merged into every request.
///
/// The token lifecycle belongs to the caller; the connection manager only
/// copies these pairs after the pseudo-headers, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthHeaders {
    headers: Vec<(String, String)>,
}

impl AuthHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// `authorization: Bearer <token>`
    pub fn bearer(token: &str) -> Self {
        Self::new().with("authorization", &format!("Bearer {}", token))
    }

    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for AuthHeaders {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            headers: iter
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        }
    }
}
