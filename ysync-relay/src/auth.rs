//! Connection admission.
//!
//! Clients present `token,documentId` in the `Sec-WebSocket-Protocol`
//! handshake header. A connection is admitted only when the server has a
//! token configured and the presented token equals it.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("no auth token configured")]
    NotConfigured,
    #[error("missing Sec-WebSocket-Protocol header")]
    MissingHeader,
    #[error("missing token")]
    MissingToken,
    #[error("missing document id")]
    MissingDocument,
    #[error("token mismatch")]
    TokenMismatch,
}

/// An admitted connection, bound to one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub document_id: String,
}

/// Shared-secret gate.
#[derive(Debug, Clone, Default)]
pub struct TokenGate {
    token: Option<String>,
}

impl TokenGate {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.filter(|t| !t.is_empty()),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.token.is_some()
    }

    /// Check the raw `Sec-WebSocket-Protocol` header value.
    pub fn admit(&self, header: Option<&str>) -> Result<Admission, AuthError> {
        let expected = self.token.as_deref().ok_or(AuthError::NotConfigured)?;
        let (token, document_id) = parse_protocol_header(header.ok_or(AuthError::MissingHeader)?)?;
        if token != expected {
            return Err(AuthError::TokenMismatch);
        }
        Ok(Admission {
            document_id: document_id.to_string(),
        })
    }
}

/// Split `token,documentId`, trimming whitespace around both parts.
pub fn parse_protocol_header(value: &str) -> Result<(&str, &str), AuthError> {
    let mut parts = value.splitn(2, ',');
    let token = parts.next().map(str::trim).unwrap_or_default();
    let document_id = parts.next().map(str::trim).unwrap_or_default();

    if token.is_empty() {
        return Err(AuthError::MissingToken);
    }
    if document_id.is_empty() {
        return Err(AuthError::MissingDocument);
    }
    Ok((token, document_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header() {
        assert_eq!(parse_protocol_header("secret,doc-1"), Ok(("secret", "doc-1")));
        assert_eq!(parse_protocol_header(" secret , doc-1 "), Ok(("secret", "doc-1")));
        assert_eq!(parse_protocol_header("secret"), Err(AuthError::MissingDocument));
        assert_eq!(parse_protocol_header(",doc"), Err(AuthError::MissingToken));
    }

    #[test]
    fn test_admit() {
        let gate = TokenGate::new(Some("secret".into()));
        assert_eq!(
            gate.admit(Some("secret, notes")),
            Ok(Admission {
                document_id: "notes".into()
            })
        );
        assert_eq!(gate.admit(Some("wrong,notes")), Err(AuthError::TokenMismatch));
        assert_eq!(gate.admit(None), Err(AuthError::MissingHeader));
    }

    #[test]
    fn test_unconfigured_gate_rejects_everything() {
        let gate = TokenGate::new(None);
        assert_eq!(gate.admit(Some("anything,doc")), Err(AuthError::NotConfigured));
        assert!(!TokenGate::new(Some(String::new())).is_configured());
    }
}
