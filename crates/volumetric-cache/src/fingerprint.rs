use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::source::SourceElement;

/// The content fingerprint of an ordered list of source elements.
///
/// Two fingerprints are equal iff they were computed from lists with the same length, whose
/// elements have identical identity tokens in the same order.
#[derive(Debug, Clone, Eq)]
pub struct Fingerprint {
    metadata: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.hash {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl PartialEq for Fingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for Fingerprint {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl Fingerprint {
    /// Computes the [`Fingerprint`] of the given source elements.
    ///
    /// The group identifiers of the first element are hashed first, followed by the identity
    /// tokens of every element in order. An empty list has a fixed fingerprint of its own.
    pub fn compute<S: SourceElement>(elements: &[S]) -> Self {
        let mut builder = FingerprintBuilder::default();

        if let Some(first) = elements.first() {
            builder.write_group(&first.group_identifiers());
            for element in elements {
                element.write_identity(&mut builder);
            }
        }

        builder.build()
    }

    /// Returns the human-readable metadata that forms the basis of the [`Fingerprint`].
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// Returns the raw sha-256 hash.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.hash
    }

    #[cfg(test)]
    pub(crate) fn for_testing(key: impl Into<String>) -> Self {
        let mut builder = FingerprintBuilder::default();
        builder.metadata = key.into();
        builder.build()
    }
}

/// A builder for [`Fingerprint`]s.
///
/// This builder implements the [`Write`](std::fmt::Write) trait, and accepts human readable, but
/// most importantly **stable** input. That input is hashed to form the [`Fingerprint`], and is kept
/// around to help debugging.
///
/// All tokens are written in their escaped, quoted form, so no token can ever be confused with a
/// separator.
#[derive(Debug, Default)]
pub struct FingerprintBuilder {
    metadata: String,
}

impl FingerprintBuilder {
    /// Writes the identifiers of the group all elements belong to.
    pub fn write_group<T: AsRef<str>>(&mut self, identifiers: &[T]) {
        self.write_line("group", identifiers);
    }

    /// Writes the identity tokens of one element.
    pub fn write_element<T: AsRef<str>>(&mut self, tokens: &[T]) {
        self.write_line("element", tokens);
    }

    fn write_line<T: AsRef<str>>(&mut self, tag: &str, tokens: &[T]) {
        self.metadata.push_str(tag);
        self.metadata.push(':');
        for token in tokens {
            // writing into a `String` never fails
            let _ = write!(self.metadata, " {:?}", token.as_ref());
        }
        self.metadata.push('\n');
    }

    /// Finalize the [`Fingerprint`].
    pub fn build(self) -> Fingerprint {
        let digest = Sha256::digest(&self.metadata);
        let mut hash = [0; 32];
        hash.copy_from_slice(&digest);

        Fingerprint {
            metadata: self.metadata.into(),
            hash,
        }
    }
}

impl fmt::Write for FingerprintBuilder {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.metadata.write_str(s)
    }
}
