use std::fmt::{self, Write};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{CacheEntry, CacheError};

/// How the loaded texture is going to be used by the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextureUsage {
    #[default]
    ShaderRead,
    ShaderWrite,
    RenderTarget,
}

impl TextureUsage {
    pub fn as_str(self) -> &'static str {
        match self {
            TextureUsage::ShaderRead => "shader_read",
            TextureUsage::ShaderWrite => "shader_write",
            TextureUsage::RenderTarget => "render_target",
        }
    }
}

/// Options that influence how a resource is produced, and thus are part of its identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadOptions {
    pub usage: TextureUsage,
    pub generate_mipmaps: bool,
    pub srgb: bool,
    pub flip_vertically: bool,
    /// Clamp the longest side of the decoded image to this many pixels.
    pub max_dimension: Option<u32>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            usage: TextureUsage::ShaderRead,
            generate_mipmaps: false,
            srgb: true,
            flip_vertically: false,
            max_dimension: None,
        }
    }
}

impl LoadOptions {
    /// Returns the stable serialization of these options.
    ///
    /// Fields are written in a fixed order. A `max_dimension` of `0` means "unclamped", same as
    /// `None`, so both produce the same digest.
    pub fn digest(&self) -> String {
        let max = match self.max_dimension {
            None | Some(0) => "none".to_owned(),
            Some(max) => max.to_string(),
        };
        format!(
            "usage={};mipmaps={};srgb={};flip={};max={}",
            self.usage.as_str(),
            self.generate_mipmaps,
            self.srgb,
            self.flip_vertically,
            max,
        )
    }
}

/// The identity of a cached resource.
///
/// A key is derived from a logical identifier, the [`LoadOptions`] digest and an optional
/// modification time. These are written into a human-readable metadata text which is SHA-256
/// hashed; equality and hashing only look at that hash.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    identifier: Arc<str>,
    options_digest: Arc<str>,
    modified_at: Option<DateTime<Utc>>,
    metadata: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (", self.identifier)?;
        for b in &self.hash[..6] {
            write!(f, "{b:02x}")?;
        }
        write!(f, ")")
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl CacheKey {
    /// Creates a [`CacheKey`] for `identifier` loaded with `options`.
    pub fn new(identifier: &str, options: &LoadOptions) -> CacheEntry<Self> {
        Ok(Self::builder(identifier, options)?.build())
    }

    /// Creates a [`CacheKeyBuilder`] which can be extended with a modification time or additional
    /// metadata before building the key.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::CacheKeyInvalid`] if the identifier is blank or contains control
    /// characters.
    pub fn builder(identifier: &str, options: &LoadOptions) -> CacheEntry<CacheKeyBuilder> {
        validate_identifier(identifier)?;

        let options_digest = options.digest();
        let metadata = format!("identifier: {identifier}\noptions: {options_digest}\n");

        Ok(CacheKeyBuilder {
            identifier: identifier.into(),
            options_digest: options_digest.into(),
            modified_at: None,
            metadata,
        })
    }

    /// The logical identifier this key was derived from.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// The serialized load options.
    pub fn options_digest(&self) -> &str {
        &self.options_digest
    }

    pub fn modified_at(&self) -> Option<DateTime<Utc>> {
        self.modified_at
    }

    /// Returns the human-readable metadata that forms the basis of the [`CacheKey`].
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// Returns the hex-encoded SHA-256 digest identifying this key.
    pub fn digest(&self) -> String {
        let mut digest = String::with_capacity(64);
        for b in &self.hash {
            // writing into a `String` never fails
            let _ = write!(digest, "{b:02x}");
        }
        digest
    }

    #[cfg(test)]
    pub fn for_testing(identifier: &str) -> Self {
        Self::new(identifier, &LoadOptions::default()).unwrap()
    }
}

fn validate_identifier(identifier: &str) -> CacheEntry {
    if identifier.trim().is_empty() {
        return Err(CacheError::CacheKeyInvalid("empty identifier".into()));
    }
    if identifier.chars().any(char::is_control) {
        return Err(CacheError::CacheKeyInvalid(format!(
            "identifier contains control characters: {identifier:?}"
        )));
    }
    Ok(())
}

/// A builder for [`CacheKey`]s.
///
/// This builder implements the [`Write`](std::fmt::Write) trait, and the intention of it is to
/// accept human readable, but most importantly **stable**, input.
/// This input is then hashed to form the [`CacheKey`].
pub struct CacheKeyBuilder {
    identifier: Arc<str>,
    options_digest: Arc<str>,
    modified_at: Option<DateTime<Utc>>,
    metadata: String,
}

impl CacheKeyBuilder {
    /// Ties the key to a modification time of the source, so that a changed source yields a
    /// different key.
    pub fn modified_at(mut self, modified_at: DateTime<Utc>) -> Self {
        let timestamp = modified_at.to_rfc3339_opts(SecondsFormat::AutoSi, true);
        self.metadata.push_str("modified: ");
        self.metadata.push_str(&timestamp);
        self.metadata.push('\n');
        self.modified_at = Some(modified_at);
        self
    }

    /// Finalize the [`CacheKey`].
    pub fn build(self) -> CacheKey {
        let digest = Sha256::digest(self.metadata.as_bytes());
        let mut hash = [0; 32];
        hash.copy_from_slice(&digest);

        CacheKey {
            identifier: self.identifier,
            options_digest: self.options_digest,
            modified_at: self.modified_at,
            metadata: self.metadata.into(),
            hash,
        }
    }
}

impl fmt::Write for CacheKeyBuilder {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.metadata.write_str(s)
    }
}
