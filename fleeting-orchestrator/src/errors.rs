use fleeting_providers::ProviderError;
use std::fmt;

/// Coarse classification of a [`GroupError`], for callers that branch on the
/// failure class rather than the message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidIid,
    CapacityExhausted,
    Provider,
    WaitFailed,
    NotInitialized,
    Config,
    PreCheck,
    Orphaned,
}

#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    /// Malformed instance identifier. Never reaches the provider.
    #[error("invalid instance id: {0}")]
    InvalidIid(String),

    /// Every candidate server type answered out of stock.
    #[error("no capacity left for server types: {}", .types.join(", "))]
    CapacityExhausted { types: Vec<String> },

    #[error("could not {action}: {source}")]
    Provider {
        action: String,
        #[source]
        source: ProviderError,
    },

    /// A pending completion registered by a stage failed.
    #[error("instance {instance}: {source}")]
    WaitFailed {
        instance: String,
        #[source]
        source: ProviderError,
    },

    #[error("instance group is not initialized")]
    NotInitialized,

    #[error("invalid instance group config: {0}")]
    Config(String),

    #[error("pre-check of {handler} failed: {message}")]
    PreCheck {
        handler: &'static str,
        message: String,
    },

    /// A resource tagged for an instance whose server no longer exists.
    #[error("orphaned {resource} {id} of instance {instance}")]
    Orphaned {
        resource: &'static str,
        id: String,
        instance: String,
    },
}

impl GroupError {
    pub fn provider(action: impl Into<String>, source: ProviderError) -> Self {
        GroupError::Provider {
            action: action.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            GroupError::InvalidIid(_) => ErrorKind::InvalidIid,
            GroupError::CapacityExhausted { .. } => ErrorKind::CapacityExhausted,
            GroupError::Provider { .. } => ErrorKind::Provider,
            GroupError::WaitFailed { .. } => ErrorKind::WaitFailed,
            GroupError::NotInitialized => ErrorKind::NotInitialized,
            GroupError::Config(_) => ErrorKind::Config,
            GroupError::PreCheck { .. } => ErrorKind::PreCheck,
            GroupError::Orphaned { .. } => ErrorKind::Orphaned,
        }
    }

    /// The underlying provider error, if any.
    pub fn provider_error(&self) -> Option<&ProviderError> {
        match self {
            GroupError::Provider { source, .. } | GroupError::WaitFailed { source, .. } => {
                Some(source)
            }
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.provider_error().is_some_and(ProviderError::is_not_found)
    }
}

/// Every failure observed during one batch operation, in observation order.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<GroupError>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: GroupError) {
        self.errors.push(err);
    }

    pub fn extend(&mut self, other: MultiError) {
        self.errors.extend(other.errors);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn contains(&self, kind: ErrorKind) -> bool {
        self.errors.iter().any(|e| e.kind() == kind)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, GroupError> {
        self.errors.iter()
    }

    pub fn into_inner(self) -> Vec<GroupError> {
        self.errors
    }

    /// `Ok(())` when nothing was recorded.
    pub fn into_result(self) -> Result<(), MultiError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

impl From<GroupError> for MultiError {
    fn from(err: GroupError) -> Self {
        Self { errors: vec![err] }
    }
}

impl IntoIterator for MultiError {
    type Item = GroupError;
    type IntoIter = std::vec::IntoIter<GroupError>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.into_iter()
    }
}

impl<'a> IntoIterator for &'a MultiError {
    type Item = &'a GroupError;
    type IntoIter = std::slice::Iter<'a, GroupError>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.iter()
    }
}
