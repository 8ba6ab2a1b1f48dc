use std::error::Error as StdError;
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Internal,
    Usage,
    StoreUnavailable,
    TransientRead,
    Timeout,
    Protocol,
    Serialization,
    Deserialization,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    hint: Option<String>,
    key: Option<String>,
    type_name: Option<&'static str>,
    payload_len: Option<usize>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            hint: None,
            key: None,
            type_name: None,
            payload_len: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn type_name(&self) -> Option<&'static str> {
        self.type_name
    }

    pub fn payload_len(&self) -> Option<usize> {
        self.payload_len
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Attach the store key, channel, or stream name the failure relates to.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_type_name(mut self, type_name: &'static str) -> Self {
        self.type_name = Some(type_name);
        self
    }

    /// Record the size of the offending payload. The payload itself is never attached.
    pub fn with_payload_len(mut self, len: usize) -> Self {
        self.payload_len = Some(len);
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::TransientRead | ErrorKind::Timeout | ErrorKind::StoreUnavailable
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(key) = &self.key {
            write!(f, " (key: {key})")?;
        }
        if let Some(type_name) = self.type_name {
            write!(f, " (type: {type_name})")?;
        }
        if let Some(len) = self.payload_len {
            write!(f, " (payload: {len} bytes)")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

pub fn to_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Internal => 1,
        ErrorKind::Usage => 2,
        ErrorKind::StoreUnavailable => 3,
        ErrorKind::TransientRead => 4,
        ErrorKind::Timeout => 5,
        ErrorKind::Protocol => 6,
        ErrorKind::Serialization => 7,
        ErrorKind::Deserialization => 8,
    }
}
